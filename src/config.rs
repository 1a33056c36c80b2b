use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::types::{Error, Result};

/// Folder-level conversion policy.
///
/// Passed to the batch driver and folder converter at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    /// Read `filt.mda` (already filtered) instead of resolving `raw.mda.prv`
    pub filtered: bool,
    /// Record a missing signal file and move on instead of failing
    pub tolerate_missing: bool,
    /// Skip folders whose `phy/params.py` already exists
    pub skip_processed: bool,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        ConversionConfig {
            filtered: true,
            tolerate_missing: true,
            skip_processed: true,
        }
    }
}

/// Waveform extraction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionParams {
    /// Window length before each spike (ms)
    pub ms_before: f64,
    /// Window length from each spike onwards (ms)
    pub ms_after: f64,
    /// Worker threads used for waveform extraction
    pub n_jobs: usize,
    /// Working-memory budget shared by all workers, e.g. "50M"
    pub total_memory: String,
}

impl Default for ExtractionParams {
    fn default() -> Self {
        ExtractionParams {
            ms_before: 3.0,
            ms_after: 4.0,
            n_jobs: 10,
            total_memory: "50M".to_string(),
        }
    }
}

impl ExtractionParams {
    /// Samples before the spike at `sample_rate`.
    pub fn nbefore(&self, sample_rate: f64) -> usize {
        (self.ms_before * sample_rate / 1000.0) as usize
    }

    /// Samples from the spike onwards at `sample_rate`.
    pub fn nafter(&self, sample_rate: f64) -> usize {
        (self.ms_after * sample_rate / 1000.0) as usize
    }

    pub fn memory_bytes(&self) -> Result<usize> {
        parse_memory_size(&self.total_memory)
    }

    /// Frames per chunk so that all workers together stay within the budget.
    pub fn chunk_frames(&self, num_channels: usize, bytes_per_sample: usize) -> Result<usize> {
        let per_frame = num_channels.max(1) * bytes_per_sample.max(1) * self.n_jobs.max(1);
        Ok((self.memory_bytes()? / per_frame).max(1))
    }
}

/// Everything a run needs, as read from an optional JSON config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub conversion: ConversionConfig,
    pub extraction: ExtractionParams,
}

/// Loads a JSON config file; absent keys keep their defaults.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let text = fs::read_to_string(path.as_ref())?;
    Ok(serde_json::from_str(&text)?)
}

/// Parses sizes such as `"50M"`, `"1.5G"`, `"500k"` or `"4096"` into bytes.
///
/// Suffixes are decimal (k = 1e3, M = 1e6, G = 1e9).
pub fn parse_memory_size(text: &str) -> Result<usize> {
    let text = text.trim();
    let (number, scale) = match text.chars().last() {
        Some('k') | Some('K') => (&text[..text.len() - 1], 1e3),
        Some('M') | Some('m') => (&text[..text.len() - 1], 1e6),
        Some('G') | Some('g') => (&text[..text.len() - 1], 1e9),
        _ => (text, 1.0),
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| Error::UnresolvableConfiguration(format!("bad memory size '{}'", text)))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(Error::UnresolvableConfiguration(format!(
            "memory size must be positive: '{}'",
            text
        )));
    }

    Ok((value * scale) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_batch_script() {
        let config = ConversionConfig::default();
        assert!(config.filtered && config.tolerate_missing && config.skip_processed);

        let params = ExtractionParams::default();
        assert_eq!((params.ms_before, params.ms_after), (3.0, 4.0));
        assert_eq!(params.n_jobs, 10);
        assert_eq!(params.memory_bytes().unwrap(), 50_000_000);
    }

    #[test]
    fn window_sizes_truncate() {
        let params = ExtractionParams::default();
        assert_eq!(params.nbefore(30000.0), 90);
        assert_eq!(params.nafter(30000.0), 120);
        assert_eq!(params.nbefore(32555.0), 97);
    }

    #[test]
    fn memory_sizes() {
        assert_eq!(parse_memory_size("50M").unwrap(), 50_000_000);
        assert_eq!(parse_memory_size("500k").unwrap(), 500_000);
        assert_eq!(parse_memory_size("1.5G").unwrap(), 1_500_000_000);
        assert_eq!(parse_memory_size("4096").unwrap(), 4096);
        assert!(parse_memory_size("lots").is_err());
        assert!(parse_memory_size("0M").is_err());
    }

    #[test]
    fn chunk_frames_split_budget_between_workers() {
        let params = ExtractionParams {
            total_memory: "1M".to_string(),
            n_jobs: 4,
            ..ExtractionParams::default()
        };
        assert_eq!(params.chunk_frames(25, 4).unwrap(), 2500);
    }

    #[test]
    fn partial_config_file_keeps_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"conversion": {"filtered": false}}"#).unwrap();
        assert!(!config.conversion.filtered);
        assert!(config.conversion.skip_processed);
        assert_eq!(config.extraction, ExtractionParams::default());
    }
}
