use log::{info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{Config, ConversionConfig};
use crate::converter::{ConvertFolder, FolderConverter, FolderOutcome};
use crate::recording::RecordingSource;
use crate::types::*;

/// Outcome of one batch run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    /// Folders exported in this run, in processing order
    pub converted: Vec<(PathBuf, ExportSummary)>,
    /// Folders skipped because a completed export already existed
    pub skipped: Vec<PathBuf>,
    /// Folders abandoned with a recorded error, in processing order
    pub failures: Vec<(PathBuf, ConversionError)>,
}

impl BatchReport {
    /// Failed folders grouped by error kind.
    pub fn errors_by_kind(&self) -> BTreeMap<ConversionErrorKind, Vec<&Path>> {
        let mut grouped: BTreeMap<ConversionErrorKind, Vec<&Path>> = BTreeMap::new();
        for (folder, error) in &self.failures {
            grouped.entry(error.kind()).or_default().push(folder.as_path());
        }
        grouped
    }

    /// Number of folders handed to the converter.
    pub fn attempted(&self) -> usize {
        self.converted.len() + self.failures.len()
    }
}

/// Runs a folder converter over every folder under a root directory.
///
/// Folders are processed one at a time in file-name order. Recorded failures
/// never stop the run; an `Err` from the converter does.
#[derive(Debug, Clone)]
pub struct BatchDriver<C> {
    config: ConversionConfig,
    converter: C,
}

impl BatchDriver<FolderConverter> {
    /// Driver with the real converter.
    pub fn from_config(config: &Config) -> Self {
        BatchDriver::new(
            config.conversion,
            FolderConverter::new(config.conversion, config.extraction.clone()),
        )
    }
}

impl<C: ConvertFolder> BatchDriver<C> {
    pub fn new(config: ConversionConfig, converter: C) -> Self {
        BatchDriver { config, converter }
    }

    /// Directories directly under `root`, sorted by name.
    pub fn candidate_folders(root: &Path) -> Result<Vec<PathBuf>> {
        let mut folders = Vec::new();
        for entry in fs::read_dir(root)? {
            let path = entry?.path();
            if path.is_dir() {
                folders.push(path);
            }
        }
        folders.sort();
        Ok(folders)
    }

    pub fn run(&self, root: &Path) -> Result<BatchReport> {
        let folders = Self::candidate_folders(root)?;
        let total = folders.len();
        info!("Found {} candidate folders in {}", total, root.display());

        let mut report = BatchReport::default();
        for (i, folder) in folders.into_iter().enumerate() {
            if self.config.skip_processed && RecordingSource::new(&folder).is_processed() {
                info!("[{}/{}] {} already processed", i + 1, total, folder.display());
                report.skipped.push(folder);
                continue;
            }

            info!("[{}/{}] {}", i + 1, total, folder.display());
            match self.converter.convert(&folder)? {
                FolderOutcome::Exported(summary) => report.converted.push((folder, summary)),
                FolderOutcome::Failed(error) => {
                    warn!("{}: {}", folder.display(), error);
                    report.failures.push((folder, error));
                }
            }
        }

        log_summary(&report);
        Ok(report)
    }
}

/// Helper function to log the final counts and the failures by kind
fn log_summary(report: &BatchReport) {
    info!(
        "Converted {} folders, skipped {}, failed {}",
        report.converted.len(),
        report.skipped.len(),
        report.failures.len()
    );
    for (kind, folders) in report.errors_by_kind() {
        warn!("{:?}: {} folders", kind, folders.len());
        for folder in folders {
            warn!("  {}", folder.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn summary(folder: &Path) -> ExportSummary {
        ExportSummary {
            phy_dir: folder.join("phy"),
            num_units: 1,
            num_spikes: 1,
            geometry_rows_trimmed: 0,
        }
    }

    fn root_with(folders: &[&str]) -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        for name in folders {
            fs::create_dir(root.path().join(name)).unwrap();
        }
        root
    }

    fn mark_processed(folder: &Path) {
        fs::create_dir_all(folder.join("phy")).unwrap();
        fs::write(folder.join("phy").join("params.py"), "").unwrap();
    }

    #[test]
    fn processed_folders_and_files_are_skipped() {
        let root = root_with(&["A", "B", "C"]);
        mark_processed(&root.path().join("B"));
        fs::write(root.path().join("notes.txt"), "not a folder").unwrap();

        let seen = RefCell::new(Vec::new());
        let converter = |folder: &Path| -> Result<FolderOutcome> {
            seen.borrow_mut().push(folder.file_name().unwrap().to_string_lossy().into_owned());
            Ok(FolderOutcome::Exported(summary(folder)))
        };
        let driver = BatchDriver::new(ConversionConfig::default(), converter);
        let report = driver.run(root.path()).unwrap();

        assert_eq!(*seen.borrow(), vec!["A", "C"]);
        assert_eq!(report.skipped, vec![root.path().join("B")]);
        assert_eq!(report.attempted(), 2);
    }

    #[test]
    fn processed_folders_are_redone_when_skipping_is_off() {
        let root = root_with(&["A", "B"]);
        mark_processed(&root.path().join("B"));

        let config = ConversionConfig {
            skip_processed: false,
            ..ConversionConfig::default()
        };
        let driver = BatchDriver::new(config, |folder: &Path| -> Result<FolderOutcome> {
            Ok(FolderOutcome::Exported(summary(folder)))
        });
        let report = driver.run(root.path()).unwrap();

        assert_eq!(report.converted.len(), 2);
        assert!(report.skipped.is_empty());
    }

    #[test]
    fn recorded_failures_do_not_stop_the_batch() {
        let root = root_with(&["A", "B", "C"]);
        let converter = |folder: &Path| -> Result<FolderOutcome> {
            let name = folder.file_name().unwrap().to_string_lossy().into_owned();
            Ok(match name.as_str() {
                "A" => FolderOutcome::Failed(ConversionError::MissingInput {
                    path: folder.join("filt.mda"),
                }),
                "B" => FolderOutcome::Failed(ConversionError::IncompleteWaveformExtraction {
                    reason: "short".into(),
                }),
                _ => FolderOutcome::Exported(summary(folder)),
            })
        };
        let driver = BatchDriver::new(ConversionConfig::default(), converter);
        let report = driver.run(root.path()).unwrap();

        assert_eq!(report.converted.len(), 1);
        assert_eq!(report.converted[0].0, root.path().join("C"));

        let grouped = report.errors_by_kind();
        assert_eq!(
            grouped[&ConversionErrorKind::MissingInput],
            vec![root.path().join("A").as_path()]
        );
        assert_eq!(grouped[&ConversionErrorKind::IncompleteWaveformExtraction].len(), 1);
        assert!(!grouped.contains_key(&ConversionErrorKind::UnresolvableGeometry));
    }

    #[test]
    fn fatal_errors_stop_the_batch() {
        let root = root_with(&["A", "B"]);
        let calls = RefCell::new(0);
        let converter = |_: &Path| -> Result<FolderOutcome> {
            *calls.borrow_mut() += 1;
            Err(Error::UnresolvableConfiguration("no params.json".into()))
        };
        let driver = BatchDriver::new(ConversionConfig::default(), converter);

        assert!(matches!(
            driver.run(root.path()),
            Err(Error::UnresolvableConfiguration(_))
        ));
        assert_eq!(*calls.borrow(), 1);
    }
}
