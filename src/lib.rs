pub mod batch;
pub mod config;
pub mod converter;
pub mod geometry;
pub mod mda;
pub mod metrics;
pub mod npy;
pub mod phy;
pub mod plugins;
pub mod recording;
pub mod reverse;
pub mod types;
pub mod waveforms;

use std::path::Path;

// Re-export types
pub use batch::{BatchDriver, BatchReport};
pub use config::{load_config, Config, ConversionConfig, ExtractionParams};
pub use converter::{ConvertFolder, FolderConverter, FolderOutcome};
pub use metrics::{ClusterMetricTable, MetricValue};
pub use types::*;

/// Converts a single MountainSort folder into a Phy folder
///
/// # Examples
///
/// ```no_run
/// use mountainsort_phy::{convert_folder, Config, FolderOutcome};
///
/// match convert_folder("path/to/sorting", &Config::default()) {
///     Ok(FolderOutcome::Exported(summary)) => println!("{} units", summary.num_units),
///     Ok(FolderOutcome::Failed(reason)) => println!("Skipped: {}", reason),
///     Err(e) => println!("Error converting folder: {}", e),
/// }
/// ```
pub fn convert_folder<P: AsRef<Path>>(folder: P, config: &Config) -> Result<FolderOutcome> {
    FolderConverter::new(config.conversion, config.extraction.clone()).convert(folder.as_ref())
}

/// Converts every folder under `root`, one at a time
///
/// # Examples
///
/// ```no_run
/// use mountainsort_phy::{convert_root, Config};
///
/// let report = convert_root("path/to/sortings", &Config::default()).unwrap();
/// println!("{} converted, {} failed", report.converted.len(), report.failures.len());
/// ```
pub fn convert_root<P: AsRef<Path>>(root: P, config: &Config) -> Result<BatchReport> {
    BatchDriver::from_config(config).run(root.as_ref())
}
