//! Writes a Phy template-gui folder from a recording, spikes, and waveforms.
//!
//! Phy cluster ids are the positions of the MountainSort labels in ascending
//! order, so label `L` becomes cluster `i` where `L` is the `i`-th smallest
//! label. `cluster_ms_label.tsv` keeps the original labels visible in Phy.

use byteorder::{LittleEndian, WriteBytesExt};
use log::{debug, info};
use ndarray::{Array1, Array2, Axis};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::config::ExtractionParams;
use crate::mda::MdaReader;
use crate::npy::{write_npy, NpyReader};
use crate::types::*;

const DAT_FILE: &str = "recording.dat";
const DAT_SAMPLE_BYTES: usize = 4;
const CLUSTER_GROUP_DEFAULT: &str = "unsorted";

/// Files written by [`export_to_phy`].
#[derive(Debug, Clone, PartialEq)]
pub struct PhyExport {
    pub num_units: usize,
    pub num_spikes: usize,
    pub num_channels: usize,
}

/// Writes the Phy folder; `params.py` is written last and marks completion.
///
/// `folder` must not contain stale files from an earlier export; callers
/// remove it first.
pub fn export_to_phy(
    recording: &Recording,
    spikes: &SpikeSet,
    waveforms: &WaveformSet,
    folder: &Path,
    params: &ExtractionParams,
) -> Result<PhyExport> {
    fs::create_dir_all(folder)?;
    let num_channels = recording.num_channels();

    info!("Writing {} to {}", DAT_FILE, folder.display());
    copy_signal(recording, &folder.join(DAT_FILE), params)?;

    // Spikes in time order, each tagged with its unit's position
    let unit_ids = waveforms.unit_ids();
    let mut order: Vec<usize> = (0..spikes.len()).collect();
    order.sort_by_key(|&i| (spikes.times[i], i));

    let unit_position = |label: i64| unit_ids.binary_search(&label).unwrap_or(0) as i32;
    let spike_times: Array1<i64> = order.iter().map(|&i| spikes.times[i]).collect();
    let spike_templates: Array1<i32> =
        order.iter().map(|&i| unit_position(spikes.labels[i])).collect();

    let amplitudes = spike_amplitudes(spikes, waveforms)?;
    let amplitudes: Array1<f32> = order.iter().map(|&i| amplitudes[i]).collect();

    let templates = waveforms.templates();
    write_npy(folder.join("spike_times.npy"), &spike_times)?;
    write_npy(folder.join("spike_templates.npy"), &spike_templates)?;
    write_npy(folder.join("spike_clusters.npy"), &spike_templates)?;
    write_npy(folder.join("amplitudes.npy"), &amplitudes)?;
    write_npy(folder.join("templates.npy"), &templates)?;
    write_npy(
        folder.join("similar_templates.npy"),
        &template_similarity(&templates),
    )?;

    let channel_map: Array1<i32> = (0..num_channels as i32).collect();
    write_npy(folder.join("channel_map.npy"), &channel_map)?;
    write_npy(
        folder.join("channel_positions.npy"),
        &channel_positions(&recording.geometry),
    )?;
    write_npy(
        folder.join("channel_groups.npy"),
        &Array1::<i32>::zeros(num_channels),
    )?;
    write_npy(
        folder.join("whitening_mat_inv.npy"),
        &Array2::<f32>::eye(num_channels),
    )?;

    write_cluster_tsvs(folder, &unit_ids)?;
    write_params_py(folder, recording)?;

    debug!(
        "Phy export complete: {} units, {} spikes",
        unit_ids.len(),
        spikes.len()
    );

    Ok(PhyExport {
        num_units: unit_ids.len(),
        num_spikes: spikes.len(),
        num_channels,
    })
}

/// Helper function to stream the signal into `recording.dat` as frame-major f32
fn copy_signal(recording: &Recording, path: &Path, params: &ExtractionParams) -> Result<()> {
    let mut reader = MdaReader::open(&recording.signal_path)?;
    let mut writer = BufWriter::new(File::create(path)?);

    // Single writer, so the whole budget goes to one chunk
    let single = ExtractionParams {
        n_jobs: 1,
        ..params.clone()
    };
    let chunk_frames = single.chunk_frames(recording.num_channels(), DAT_SAMPLE_BYTES)?;
    let num_frames = recording.num_frames();

    let mut start = 0;
    while start < num_frames {
        let count = chunk_frames.min(num_frames - start);
        let frames = reader.read_frames(start, count)?;
        for &value in frames.iter() {
            writer.write_f32::<LittleEndian>(value)?;
        }
        start += count;
    }

    writer.flush()?;
    Ok(())
}

/// Index of the channel with the largest absolute template value at the spike sample.
fn peak_channel(template: &Array2<f32>, nbefore: usize) -> usize {
    let (num_samples, _) = template.dim();
    if num_samples == 0 {
        return 0;
    }
    let row = template.index_axis(Axis(0), nbefore.min(num_samples - 1));
    row.iter()
        .enumerate()
        .fold((0, f32::MIN), |best, (channel, &value)| {
            if value.abs() > best.1 {
                (channel, value.abs())
            } else {
                best
            }
        })
        .0
}

/// Absolute value of each spike at its unit's peak channel, indexed like the spike set.
///
/// Windows are streamed from the unit files one row at a time.
fn spike_amplitudes(spikes: &SpikeSet, waveforms: &WaveformSet) -> Result<Vec<f32>> {
    let mut amplitudes = vec![0.0f32; spikes.len()];
    let num_samples = waveforms.num_samples();
    if num_samples == 0 {
        return Ok(amplitudes);
    }
    let sample = waveforms.nbefore.min(num_samples - 1);

    for unit in &waveforms.units {
        let channel = peak_channel(&unit.template, waveforms.nbefore);
        let index = sample * waveforms.num_channels + channel;

        let mut reader = NpyReader::open(&unit.path)?;
        let mut row = vec![0f32; reader.row_len()];
        if index >= row.len() {
            return Err(Error::InvalidNpy(format!(
                "{} has rows of {} values",
                unit.path.display(),
                row.len()
            )));
        }
        for &spike_index in &unit.spike_indices {
            if !reader.read_row(&mut row)? {
                return Err(Error::InvalidNpy(format!(
                    "{} holds fewer than {} windows",
                    unit.path.display(),
                    unit.num_spikes()
                )));
            }
            amplitudes[spike_index] = row[index].abs();
        }
    }
    Ok(amplitudes)
}

/// Cosine similarity between flattened templates.
fn template_similarity(templates: &ndarray::Array3<f32>) -> Array2<f32> {
    let num_units = templates.len_of(Axis(0));
    let flat: Vec<Vec<f32>> = templates
        .outer_iter()
        .map(|template| template.iter().copied().collect())
        .collect();
    let norms: Vec<f32> = flat
        .iter()
        .map(|t| t.iter().map(|v| v * v).sum::<f32>().sqrt())
        .collect();

    Array2::from_shape_fn((num_units, num_units), |(a, b)| {
        let denom = norms[a] * norms[b];
        if denom == 0.0 {
            return 0.0;
        }
        let dot: f32 = flat[a].iter().zip(&flat[b]).map(|(x, y)| x * y).sum();
        dot / denom
    })
}

/// Two-column channel positions; missing columns are zero.
fn channel_positions(geometry: &[Vec<f64>]) -> Array2<f32> {
    Array2::from_shape_fn((geometry.len(), 2), |(channel, axis)| {
        geometry[channel].get(axis).copied().unwrap_or(0.0) as f32
    })
}

/// Helper function to write the per-cluster TSV columns Phy shows in its cluster view
fn write_cluster_tsvs(folder: &Path, unit_ids: &[i64]) -> Result<()> {
    let write_column = |name: &str, header: &str, values: Vec<String>| -> Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(folder.join(name))?;
        writer.write_record(["cluster_id", header])?;
        for (cluster, value) in values.iter().enumerate() {
            writer.write_record([cluster.to_string().as_str(), value.as_str()])?;
        }
        writer.flush()?;
        Ok(())
    };

    write_column(
        "cluster_group.tsv",
        "group",
        vec![CLUSTER_GROUP_DEFAULT.to_string(); unit_ids.len()],
    )?;
    write_column(
        "cluster_channel_group.tsv",
        "channel_group",
        vec!["0".to_string(); unit_ids.len()],
    )?;
    write_column(
        "cluster_ms_label.tsv",
        "ms_label",
        unit_ids.iter().map(|id| id.to_string()).collect(),
    )?;
    Ok(())
}

/// Helper function to write `params.py`
fn write_params_py(folder: &Path, recording: &Recording) -> Result<()> {
    let text = format!(
        "dat_path = r'{}'\n\
         n_channels_dat = {}\n\
         dtype = 'float32'\n\
         offset = 0\n\
         sample_rate = {:?}\n\
         hp_filtered = {}\n",
        DAT_FILE,
        recording.num_channels(),
        recording.sample_rate,
        if recording.is_filtered { "True" } else { "False" },
    );
    fs::write(folder.join(crate::recording::PHY_MARKER_FILE), text)?;
    Ok(())
}
