use log::{info, warn};
use std::fs;
use std::path::Path;

use crate::config::{ConversionConfig, ExtractionParams};
use crate::geometry::reconcile_geometry_file;
use crate::phy::export_to_phy;
use crate::recording::{load_spikes, open_recording, RecordingSource};
use crate::types::*;
use crate::waveforms::{extract_waveforms, malformed_input};

/// What happened to one folder.
#[derive(Debug, Clone, PartialEq)]
pub enum FolderOutcome {
    /// The Phy folder was written
    Exported(ExportSummary),
    /// The folder was abandoned for a recorded reason
    Failed(ConversionError),
}

/// Converts one sorting folder.
///
/// `Ok(FolderOutcome::Failed(..))` is a recorded, non-fatal outcome; `Err`
/// is fatal and stops a batch.
pub trait ConvertFolder {
    fn convert(&self, folder: &Path) -> Result<FolderOutcome>;
}

impl<F> ConvertFolder for F
where
    F: Fn(&Path) -> Result<FolderOutcome>,
{
    fn convert(&self, folder: &Path) -> Result<FolderOutcome> {
        self(folder)
    }
}

/// Turns a MountainSort folder into a Phy folder.
#[derive(Debug, Clone, Default)]
pub struct FolderConverter {
    config: ConversionConfig,
    params: ExtractionParams,
}

impl FolderConverter {
    pub fn new(config: ConversionConfig, params: ExtractionParams) -> Self {
        FolderConverter { config, params }
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    /// Missing signal: recorded when tolerated, fatal otherwise.
    fn missing(&self, path: &Path) -> Result<FolderOutcome> {
        if self.config.tolerate_missing {
            warn!("{} is missing, skipping folder", path.display());
            Ok(FolderOutcome::Failed(ConversionError::MissingInput {
                path: path.to_path_buf(),
            }))
        } else {
            Err(Error::MissingInput(path.to_path_buf()))
        }
    }
}

impl ConvertFolder for FolderConverter {
    fn convert(&self, folder: &Path) -> Result<FolderOutcome> {
        let source = RecordingSource::new(folder);
        info!("Processing {}", folder.display());

        let sample_rate = source.read_params()?.samplerate;

        let signal = match source.signal_path(self.config.filtered) {
            Ok(signal) => signal,
            Err(Error::MissingInput(path)) => return self.missing(&path),
            Err(e) => return Err(e),
        };
        if !signal.is_file() {
            return self.missing(&signal);
        }

        let geometry = source.geometry_file();
        if !geometry.is_file() {
            return Err(Error::UnresolvableConfiguration(format!(
                "missing geometry file {}",
                geometry.display()
            )));
        }

        info!("Reading recording {}", signal.display());
        let built = reconcile_geometry_file(&geometry, || {
            open_recording(&source, &signal, sample_rate, self.config.filtered)
                .map_err(malformed_input)
        });
        let (recording, trimmed) = match built {
            Ok(built) => built,
            Err(Error::UnresolvableGeometry(geometry)) => {
                return Ok(FolderOutcome::Failed(
                    ConversionError::UnresolvableGeometry { geometry },
                ))
            }
            Err(Error::IncompleteWaveformExtraction(reason)) => {
                return Ok(incomplete(folder, reason))
            }
            Err(e) => return Err(e),
        };
        if trimmed > 0 {
            warn!(
                "Trimmed {} rows from {} to match {} channels",
                trimmed,
                geometry.display(),
                recording.num_channels()
            );
        }

        info!("Loading spikes");
        let loaded = load_spikes(&source.firings_file(), sample_rate).map_err(malformed_input);
        let spikes = match loaded {
            Ok(spikes) => spikes,
            Err(Error::IncompleteWaveformExtraction(reason)) => {
                return Ok(incomplete(folder, reason))
            }
            Err(e) => return Err(e),
        };

        // Extraction output is not additive; start from an empty folder
        let waveform_dir = source.waveform_dir();
        remove_dir_if_exists(&waveform_dir)?;

        info!("Extracting waveforms");
        let extracted = extract_waveforms(&recording, &spikes, &self.params, &waveform_dir);
        let waveforms = match extracted {
            Ok(waveforms) => waveforms,
            Err(Error::IncompleteWaveformExtraction(reason)) => {
                return Ok(incomplete(folder, reason))
            }
            Err(e) => return Err(e),
        };

        info!("Exporting to Phy");
        let phy_dir = source.phy_dir();
        remove_dir_if_exists(&phy_dir)?;
        let export = export_to_phy(&recording, &spikes, &waveforms, &phy_dir, &self.params)?;

        Ok(FolderOutcome::Exported(ExportSummary {
            phy_dir,
            num_units: export.num_units,
            num_spikes: export.num_spikes,
            geometry_rows_trimmed: trimmed,
        }))
    }
}

/// Helper function to record an unreadable or incomplete input
fn incomplete(folder: &Path, reason: String) -> FolderOutcome {
    warn!("{}: {}", folder.display(), reason);
    FolderOutcome::Failed(ConversionError::IncompleteWaveformExtraction { reason })
}

/// Deletes a directory tree if it exists.
fn remove_dir_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_dir_all(path)?;
    }
    Ok(())
}
