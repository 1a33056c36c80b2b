use ndarray::{Array2, Array3, Axis, Ix3};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Element type codes used in MDA headers.
///
/// MountainSort writes the code as a negative `i32` in the first header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MdaDataType {
    /// Code -2
    U8,
    /// Code -3
    F32,
    /// Code -4
    I16,
    /// Code -5
    I32,
    /// Code -6
    U16,
    /// Code -7
    F64,
    /// Code -8
    U32,
}

impl MdaDataType {
    /// Maps a header code to a data type.
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            -2 => Ok(MdaDataType::U8),
            -3 => Ok(MdaDataType::F32),
            -4 => Ok(MdaDataType::I16),
            -5 => Ok(MdaDataType::I32),
            -6 => Ok(MdaDataType::U16),
            -7 => Ok(MdaDataType::F64),
            -8 => Ok(MdaDataType::U32),
            other => Err(Error::UnrecognizedDataType(other)),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            MdaDataType::U8 => -2,
            MdaDataType::F32 => -3,
            MdaDataType::I16 => -4,
            MdaDataType::I32 => -5,
            MdaDataType::U16 => -6,
            MdaDataType::F64 => -7,
            MdaDataType::U32 => -8,
        }
    }

    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            MdaDataType::U8 => 1,
            MdaDataType::I16 | MdaDataType::U16 => 2,
            MdaDataType::F32 | MdaDataType::I32 | MdaDataType::U32 => 4,
            MdaDataType::F64 => 8,
        }
    }
}

/// Parsed header of an MDA file.
#[derive(Debug, Clone, PartialEq)]
pub struct MdaHeader {
    /// Element type of the data section
    pub data_type: MdaDataType,
    /// Bytes per element as written in the header
    pub bytes_per_entry: usize,
    /// Array dimensions, first dimension varying fastest
    pub dims: Vec<usize>,
    /// Length of the header in bytes (offset of the first element)
    pub header_len: u64,
}

impl MdaHeader {
    /// Number of channels of a `[channels, frames]` signal array.
    pub fn num_channels(&self) -> usize {
        self.dims.first().copied().unwrap_or(0)
    }

    /// Number of frames of a `[channels, frames]` signal array.
    ///
    /// Trailing singleton dimensions are folded in.
    pub fn num_frames(&self) -> usize {
        self.dims
            .iter()
            .skip(1)
            .fold(1usize, |acc, &dim| acc.saturating_mul(dim))
    }

    /// Total number of elements declared by the header, `None` on overflow.
    pub fn num_elements(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
    }

    /// File length implied by the header, `None` on overflow.
    pub fn expected_file_len(&self) -> Option<u64> {
        let data_bytes = self.num_elements()?.checked_mul(self.bytes_per_entry)?;
        self.header_len.checked_add(u64::try_from(data_bytes).ok()?)
    }
}

/// A multi-channel recording ready for waveform extraction.
///
/// Constructed only once the geometry row count matches the channel count.
#[derive(Debug, Clone)]
pub struct Recording {
    /// Signal file the samples are read from
    pub signal_path: PathBuf,
    /// Header of the signal file
    pub header: MdaHeader,
    /// One coordinate row per channel
    pub geometry: Vec<Vec<f64>>,
    /// Sampling rate (Hz)
    pub sample_rate: f64,
    /// Whether the signal was already high-pass filtered upstream
    pub is_filtered: bool,
}

impl Recording {
    pub fn num_channels(&self) -> usize {
        self.header.num_channels()
    }

    pub fn num_frames(&self) -> usize {
        self.header.num_frames()
    }

    /// Duration of the recording in seconds.
    pub fn duration(&self) -> f64 {
        self.num_frames() as f64 / self.sample_rate
    }
}

/// Spike times and cluster labels from a firings file.
#[derive(Debug, Clone, PartialEq)]
pub struct SpikeSet {
    /// Spike times in samples
    pub times: Vec<i64>,
    /// Cluster label of each spike
    pub labels: Vec<i64>,
    /// Sampling rate the times refer to (Hz)
    pub sample_rate: f64,
}

impl SpikeSet {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Unique cluster labels in ascending order.
    pub fn unit_ids(&self) -> Vec<i64> {
        let mut ids = self.labels.clone();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Indices of the spikes assigned to `unit_id`, in file order.
    pub fn spike_indices(&self, unit_id: i64) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter(|&(_, &label)| label == unit_id)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Waveforms of one unit. The windows stay on disk; only the template is held.
#[derive(Debug, Clone)]
pub struct UnitWaveforms {
    /// Cluster label of the unit
    pub unit_id: i64,
    /// Indices into the spike set of the extracted spikes
    pub spike_indices: Vec<usize>,
    /// Mean waveform, shape [samples, channels]
    pub template: Array2<f32>,
    /// `.npy` file holding the unscaled windows, shape [spikes, samples, channels]
    pub path: PathBuf,
}

impl UnitWaveforms {
    pub fn num_spikes(&self) -> usize {
        self.spike_indices.len()
    }

    /// Loads every window of the unit into memory.
    pub fn load(&self) -> Result<Array3<f32>> {
        crate::npy::read_npy_f32(&self.path)?
            .into_dimensionality::<Ix3>()
            .map_err(|e| Error::InvalidNpy(format!("{}: {}", self.path.display(), e)))
    }
}

/// Extracted waveforms of every unit of a folder.
#[derive(Debug, Clone)]
pub struct WaveformSet {
    /// Samples taken before each spike
    pub nbefore: usize,
    /// Samples taken from the spike onwards
    pub nafter: usize,
    /// Sampling rate (Hz)
    pub sample_rate: f64,
    /// Channels per window
    pub num_channels: usize,
    /// Units in ascending label order
    pub units: Vec<UnitWaveforms>,
}

impl WaveformSet {
    /// Samples per window.
    pub fn num_samples(&self) -> usize {
        self.nbefore + self.nafter
    }

    pub fn unit_ids(&self) -> Vec<i64> {
        self.units.iter().map(|unit| unit.unit_id).collect()
    }

    /// Mean waveform of every unit, shape [units, samples, channels].
    pub fn templates(&self) -> Array3<f32> {
        let mut templates =
            Array3::zeros((self.units.len(), self.num_samples(), self.num_channels));
        for (i, unit) in self.units.iter().enumerate() {
            templates.index_axis_mut(Axis(0), i).assign(&unit.template);
        }
        templates
    }
}

/// Summary of a successful folder conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportSummary {
    /// Phy folder that was written
    pub phy_dir: PathBuf,
    pub num_units: usize,
    pub num_spikes: usize,
    /// Rows trimmed from `geom.csv` before the recording could be built
    pub geometry_rows_trimmed: usize,
}

/// Recorded, non-fatal reasons a folder was not converted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConversionError {
    #[error("missing input {}", .path.display())]
    MissingInput { path: PathBuf },
    #[error("geometry file {} never matched the channel count", .geometry.display())]
    UnresolvableGeometry { geometry: PathBuf },
    #[error("incomplete waveform extraction: {reason}")]
    IncompleteWaveformExtraction { reason: String },
}

/// Grouping key for [`ConversionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConversionErrorKind {
    MissingInput,
    UnresolvableGeometry,
    IncompleteWaveformExtraction,
}

impl ConversionError {
    pub fn kind(&self) -> ConversionErrorKind {
        match self {
            ConversionError::MissingInput { .. } => ConversionErrorKind::MissingInput,
            ConversionError::UnresolvableGeometry { .. } => {
                ConversionErrorKind::UnresolvableGeometry
            }
            ConversionError::IncompleteWaveformExtraction { .. } => {
                ConversionErrorKind::IncompleteWaveformExtraction
            }
        }
    }
}

/// Error types for the converter.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// A JSON input could not be parsed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// A CSV/TSV file could not be read or written
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    /// The MDA header carries an unknown element type
    #[error("unrecognized MDA data type code {0}")]
    UnrecognizedDataType(i32),
    /// The MDA header is malformed
    #[error("invalid MDA header: {0}")]
    InvalidHeader(String),
    /// A `.npy` file could not be parsed
    #[error("invalid NPY file: {0}")]
    InvalidNpy(String),
    /// A frame range outside the recording was requested
    #[error("frames {start}..{end} outside recording of {frames} frames")]
    FrameRange {
        start: usize,
        end: usize,
        frames: usize,
    },
    /// The data section ends before the header says it should
    #[error("MDA data ends before frame {frame} of {declared}")]
    TruncatedData { frame: usize, declared: usize },
    /// Geometry row count differs from the recording channel count
    #[error("geometry has {rows} rows but recording has {channels} channels")]
    GeometryMismatch { rows: usize, channels: usize },
    /// A required input file does not exist
    #[error("missing input {}", .0.display())]
    MissingInput(PathBuf),
    /// Trimming the geometry file emptied it
    #[error("geometry file {} emptied before matching the channel count", .0.display())]
    UnresolvableGeometry(PathBuf),
    /// A folder lacks the parameter or firings files it needs
    #[error("unresolvable configuration: {0}")]
    UnresolvableConfiguration(String),
    /// Spike or recording data is malformed for extraction
    #[error("incomplete waveform extraction: {0}")]
    IncompleteWaveformExtraction(String),
    /// The worker pool could not be created
    #[error("thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    /// The operation is declared but not implemented
    #[error("{0}")]
    Unsupported(String),
}
