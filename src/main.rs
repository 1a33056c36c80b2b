//! Command-line entry point.
//!
//! ```bash
//! mountainsort-phy to-phy <ROOT> [--raw] [--strict-missing] [--reprocess] [--config FILE]
//! mountainsort-phy to-mountainsort [FOLDER]
//! ```

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;

use mountainsort_phy::reverse::{phy_to_mountainsort, resolve_folder};
use mountainsort_phy::{load_config, BatchDriver, Config, Result};

/// Converts MountainSort sortings into Phy curation folders
#[derive(Parser, Debug)]
#[command(name = "mountainsort-phy")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert every sorting folder under ROOT
    ToPhy {
        /// Folder whose subfolders each hold one sorting
        root: PathBuf,

        /// Read raw.mda.prv instead of filt.mda
        #[arg(long)]
        raw: bool,

        /// Stop the batch when a signal file is missing
        #[arg(long)]
        strict_missing: bool,

        /// Convert folders that already have phy/params.py
        #[arg(long)]
        reprocess: bool,

        /// JSON config file
        #[arg(long, value_name = "FILE", env = "MOUNTAINSORT_PHY_CONFIG")]
        config: Option<PathBuf>,

        /// Waveform extraction threads
        #[arg(long)]
        jobs: Option<usize>,

        /// Extraction memory budget, e.g. 50M
        #[arg(long, value_name = "SIZE")]
        total_memory: Option<String>,
    },
    /// Write Phy curation back to MountainSort files
    ToMountainsort {
        /// Phy folder; empty or "pwd" means the current directory
        folder: Option<String>,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::ToPhy {
            root,
            raw,
            strict_missing,
            reprocess,
            config,
            jobs,
            total_memory,
        } => {
            let mut config = match config {
                Some(path) => {
                    info!("Loading config from {}", path.display());
                    load_config(path)?
                }
                None => Config::default(),
            };

            // Flags override the file
            if raw {
                config.conversion.filtered = false;
            }
            if strict_missing {
                config.conversion.tolerate_missing = false;
            }
            if reprocess {
                config.conversion.skip_processed = false;
            }
            if let Some(jobs) = jobs {
                config.extraction.n_jobs = jobs;
            }
            if let Some(total_memory) = total_memory {
                config.extraction.total_memory = total_memory;
            }
            // Fail on a bad size before touching any folder
            config.extraction.memory_bytes()?;

            let report = BatchDriver::from_config(&config).run(&root)?;
            info!(
                "Done: {} converted, {} skipped, {} failed",
                report.converted.len(),
                report.skipped.len(),
                report.failures.len()
            );
            Ok(())
        }
        Command::ToMountainsort { folder } => {
            let folder = resolve_folder(folder.as_deref())?;
            phy_to_mountainsort(&folder)
        }
    }
}
