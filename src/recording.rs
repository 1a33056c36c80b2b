use log::debug;
use ndarray::{Axis, Ix2};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::geometry::read_geometry;
use crate::mda::{read_header, read_mda};
use crate::types::*;

// Fixed file names inside a sorting folder
pub const RAW_SIGNAL_FILE: &str = "raw.mda";
pub const FILTERED_SIGNAL_FILE: &str = "filt.mda";
pub const PRV_FILE: &str = "raw.mda.prv";
pub const GEOMETRY_FILE: &str = "geom.csv";
pub const PARAMS_FILE: &str = "params.json";
pub const FIRINGS_FILE: &str = "firings_raw.mda";
pub const WAVEFORM_DIR: &str = "waveform";
pub const PHY_DIR: &str = "phy";
pub const PHY_MARKER_FILE: &str = "params.py";

/// Parameters written by the sorting pipeline next to the signal.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SortingParams {
    /// Sampling rate (Hz)
    pub samplerate: f64,
}

/// Indirection file pointing at the raw signal.
#[derive(Debug, Clone, Deserialize)]
struct PrvFile {
    original_path: PathBuf,
}

/// A sorting output folder and the fixed file names inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSource {
    folder: PathBuf,
}

impl RecordingSource {
    pub fn new<P: AsRef<Path>>(folder: P) -> Self {
        RecordingSource {
            folder: folder.as_ref().to_path_buf(),
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn raw_signal(&self) -> PathBuf {
        self.folder.join(RAW_SIGNAL_FILE)
    }

    pub fn filtered_signal(&self) -> PathBuf {
        self.folder.join(FILTERED_SIGNAL_FILE)
    }

    pub fn prv_file(&self) -> PathBuf {
        self.folder.join(PRV_FILE)
    }

    pub fn geometry_file(&self) -> PathBuf {
        self.folder.join(GEOMETRY_FILE)
    }

    pub fn params_file(&self) -> PathBuf {
        self.folder.join(PARAMS_FILE)
    }

    pub fn firings_file(&self) -> PathBuf {
        self.folder.join(FIRINGS_FILE)
    }

    pub fn waveform_dir(&self) -> PathBuf {
        self.folder.join(WAVEFORM_DIR)
    }

    pub fn phy_dir(&self) -> PathBuf {
        self.folder.join(PHY_DIR)
    }

    /// `params.py` inside the Phy folder; written last by the exporter.
    pub fn phy_marker(&self) -> PathBuf {
        self.phy_dir().join(PHY_MARKER_FILE)
    }

    /// Whether a previous run completed the Phy export for this folder.
    pub fn is_processed(&self) -> bool {
        self.phy_marker().is_file()
    }

    /// Reads `params.json`.
    pub fn read_params(&self) -> Result<SortingParams> {
        let path = self.params_file();
        let text = fs::read_to_string(&path).map_err(|e| {
            Error::UnresolvableConfiguration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let params: SortingParams = serde_json::from_str(&text).map_err(|e| {
            Error::UnresolvableConfiguration(format!("bad {}: {}", path.display(), e))
        })?;
        if params.samplerate.is_nan() || params.samplerate <= 0.0 {
            return Err(Error::UnresolvableConfiguration(format!(
                "{} has non-positive samplerate {}",
                path.display(),
                params.samplerate
            )));
        }
        Ok(params)
    }

    /// Follows `raw.mda.prv` to the path of the true raw signal.
    ///
    /// Relative paths are taken relative to the folder.
    pub fn resolve_raw_signal(&self) -> Result<PathBuf> {
        let prv = self.prv_file();
        if !prv.is_file() {
            return Err(Error::MissingInput(prv));
        }
        let text = fs::read_to_string(&prv)?;
        let prv_file: PrvFile = serde_json::from_str(&text)?;
        debug!("{} points at {}", prv.display(), prv_file.original_path.display());

        if prv_file.original_path.is_absolute() {
            Ok(prv_file.original_path)
        } else {
            Ok(self.folder.join(prv_file.original_path))
        }
    }

    /// Signal file for the requested mode.
    pub fn signal_path(&self, filtered: bool) -> Result<PathBuf> {
        if filtered {
            Ok(self.filtered_signal())
        } else {
            self.resolve_raw_signal()
        }
    }
}

/// Builds a recording from a signal file and the folder's `geom.csv`.
///
/// Fails with [`Error::GeometryMismatch`] when the geometry row count differs
/// from the signal's channel count.
pub fn open_recording(
    source: &RecordingSource,
    signal_path: &Path,
    sample_rate: f64,
    is_filtered: bool,
) -> Result<Recording> {
    let mut file = fs::File::open(signal_path)?;
    let header = read_header(&mut file)?;
    if header.dims.len() < 2 {
        return Err(Error::InvalidHeader(format!(
            "{} is not a [channels, frames] array",
            signal_path.display()
        )));
    }

    let geometry = read_geometry(&source.geometry_file())?;
    if geometry.len() != header.num_channels() {
        return Err(Error::GeometryMismatch {
            rows: geometry.len(),
            channels: header.num_channels(),
        });
    }

    Ok(Recording {
        signal_path: signal_path.to_path_buf(),
        header,
        geometry,
        sample_rate,
        is_filtered,
    })
}

/// Loads spike times and labels from a firings file.
///
/// The firings array is `[3+, spikes]`: primary channel, time (samples),
/// label. Extra rows are ignored.
pub fn load_spikes(firings_path: &Path, sample_rate: f64) -> Result<SpikeSet> {
    if !firings_path.is_file() {
        return Err(Error::UnresolvableConfiguration(format!(
            "missing firings file {}",
            firings_path.display()
        )));
    }

    let firings = read_mda(firings_path)?
        .into_dimensionality::<Ix2>()
        .map_err(|_| {
            Error::InvalidHeader(format!("{} is not two-dimensional", firings_path.display()))
        })?;
    if firings.nrows() < 3 {
        return Err(Error::InvalidHeader(format!(
            "{} has {} rows, expected at least 3",
            firings_path.display(),
            firings.nrows()
        )));
    }

    let times = firings
        .index_axis(Axis(0), 1)
        .iter()
        .map(|&t| t.round() as i64)
        .collect();
    let labels = firings
        .index_axis(Axis(0), 2)
        .iter()
        .map(|&l| l.round() as i64)
        .collect();

    Ok(SpikeSet {
        times,
        labels,
        sample_rate,
    })
}
