use mountainsort_phy::recording::RecordingSource;
use mountainsort_phy::{convert_folder, load_config, Config, FolderOutcome};
use std::env;
use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    // Sorting folder, and optionally a JSON config
    let mut args = env::args().skip(1);
    let folder = args.next().unwrap_or_else(|| "data/sorting".to_string());
    let config = match args.next() {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };

    // Print what the folder holds before converting
    let source = RecordingSource::new(&folder);
    let params = source.read_params()?;
    println!("Folder: {}", source.folder().display());
    println!("Sample rate: {} Hz", params.samplerate);
    println!(
        "Signal: {}",
        source.signal_path(config.conversion.filtered)?.display()
    );
    println!("Already processed: {}", source.is_processed());

    match convert_folder(&folder, &config)? {
        FolderOutcome::Exported(summary) => {
            println!("\nExported to {}", summary.phy_dir.display());
            println!("Units: {}", summary.num_units);
            println!("Spikes: {}", summary.num_spikes);
            if summary.geometry_rows_trimmed > 0 {
                println!(
                    "Trimmed {} rows from geom.csv",
                    summary.geometry_rows_trimmed
                );
            }
            println!("\nOpen with: phy template-gui {}/params.py", summary.phy_dir.display());
        }
        FolderOutcome::Failed(reason) => {
            println!("\nFolder skipped: {}", reason);
        }
    }

    Ok(())
}
