use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};
use ndarray::{s, Array1, Array2, Zip};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::config::ExtractionParams;
use crate::mda::MdaReader;
use crate::npy::{self, write_npy, NpyElement};
use crate::types::*;

const PRINT_PROGRESS_STEP: usize = 10;
const SAMPLE_BYTES: usize = std::mem::size_of::<f32>();
const WAVEFORMS_SUBDIR: &str = "waveforms";

/// Extracts a fixed window around every spike of every unit into `folder`.
///
/// Windows span `nbefore` samples before the spike and `nafter` samples from
/// the spike onwards, across all channels. Samples are copied unscaled.
/// Parts of a window that fall outside the recording are zero.
///
/// The recording is read in chunks sized from the memory budget, and chunks
/// are processed in parallel on a pool of `n_jobs` threads. Each window is
/// written to its unit's `.npy` file as soon as it is cut, so only the chunks
/// in flight and the running template sums are held in memory.
///
/// Layout: `params.json`, then per unit `waveforms/waveforms_<id>.npy`
/// (spikes × samples × channels) and `waveforms/sampled_index_<id>.npy`
/// (indices into the spike set).
///
/// # Errors
///
/// [`Error::IncompleteWaveformExtraction`] when a spike lies outside the
/// recording or the signal file is shorter than its header declares.
pub fn extract_waveforms(
    recording: &Recording,
    spikes: &SpikeSet,
    params: &ExtractionParams,
    folder: &Path,
) -> Result<WaveformSet> {
    let nbefore = params.nbefore(recording.sample_rate);
    let nafter = params.nafter(recording.sample_rate);
    let num_samples = nbefore + nafter;
    let num_frames = recording.num_frames();
    let num_channels = recording.num_channels();

    check_spikes_in_range(spikes, num_frames)?;

    let reader = MdaReader::open(&recording.signal_path).map_err(malformed_input)?;
    if !reader.is_complete() {
        return Err(Error::IncompleteWaveformExtraction(format!(
            "{} is shorter than its header declares",
            recording.signal_path.display()
        )));
    }
    drop(reader);

    // Each spike goes to one row of one unit file
    let unit_ids = spikes.unit_ids();
    let mut placement = vec![(0usize, 0usize); spikes.len()];
    let mut unit_spikes = Vec::with_capacity(unit_ids.len());
    for (unit, &unit_id) in unit_ids.iter().enumerate() {
        let spike_indices = spikes.spike_indices(unit_id);
        for (row, &spike_index) in spike_indices.iter().enumerate() {
            placement[spike_index] = (unit, row);
        }
        unit_spikes.push(spike_indices);
    }

    let unit_dir = folder.join(WAVEFORMS_SUBDIR);
    fs::create_dir_all(&unit_dir)?;
    let sinks = unit_ids
        .iter()
        .zip(&unit_spikes)
        .map(|(unit_id, spike_indices)| {
            UnitSink::create(
                unit_dir.join(format!("waveforms_{}.npy", unit_id)),
                [spike_indices.len(), num_samples, num_channels],
            )
        })
        .collect::<Result<Vec<_>>>()?;

    // Spike indices ordered by time, for per-chunk lookup
    let mut by_time: Vec<(usize, usize)> = spikes
        .times
        .iter()
        .enumerate()
        .map(|(i, &t)| (t as usize, i))
        .collect();
    by_time.sort_unstable();

    let chunk_frames = params.chunk_frames(num_channels, SAMPLE_BYTES)?;
    let chunks: Vec<(usize, usize)> = (0..num_frames)
        .step_by(chunk_frames)
        .map(|start| (start, (start + chunk_frames).min(num_frames)))
        .collect();

    info!(
        "Extracting {} spikes ({} units) in {} chunks of {} frames with {} workers",
        spikes.len(),
        unit_ids.len(),
        chunks.len(),
        chunk_frames,
        params.n_jobs.max(1)
    );

    let pool = ThreadPoolBuilder::new()
        .num_threads(params.n_jobs.max(1))
        .build()?;
    let completed = AtomicUsize::new(0);
    let window = WindowShape {
        nbefore,
        nafter,
        num_frames,
        num_channels,
    };
    let sums: Vec<Mutex<Array2<f64>>> = unit_ids
        .iter()
        .map(|_| Mutex::new(Array2::zeros((num_samples, num_channels))))
        .collect();
    let targets = ChunkTargets {
        by_time: &by_time,
        placement: &placement,
        sinks: &sinks,
        sums: &sums,
    };

    pool.install(|| {
        chunks.par_iter().try_for_each(|&(start, end)| {
            extract_chunk(recording, &targets, start, end, &window)?;
            report_progress(&completed, chunks.len());
            Ok::<(), Error>(())
        })
    })?;

    let mut units = Vec::with_capacity(unit_ids.len());
    for ((unit_id, spike_indices), (sink, sum)) in unit_ids
        .iter()
        .zip(unit_spikes)
        .zip(sinks.into_iter().zip(sums))
    {
        let count = spike_indices.len().max(1) as f64;
        let sum = sum.into_inner().unwrap_or_else(PoisonError::into_inner);
        let sampled: Array1<i64> = spike_indices.iter().map(|&i| i as i64).collect();
        write_npy(
            unit_dir.join(format!("sampled_index_{}.npy", unit_id)),
            &sampled,
        )?;
        units.push(UnitWaveforms {
            unit_id: *unit_id,
            spike_indices,
            template: sum.mapv(|total| (total / count) as f32),
            path: sink.finish()?,
        });
    }

    let set = WaveformSet {
        nbefore,
        nafter,
        sample_rate: recording.sample_rate,
        num_channels,
        units,
    };
    write_folder_params(folder, &set, params)?;

    debug!("Wrote {} units to {}", set.units.len(), folder.display());
    Ok(set)
}

/// Maps unreadable signal or firings files to a recorded extraction failure.
///
/// Header and truncation errors mean the folder's data is malformed, which
/// is a per-folder condition rather than a reason to stop a batch.
pub fn malformed_input(error: Error) -> Error {
    match error {
        Error::InvalidHeader(_) | Error::UnrecognizedDataType(_) => {
            Error::IncompleteWaveformExtraction(error.to_string())
        }
        Error::TruncatedData { frame, declared } => Error::IncompleteWaveformExtraction(format!(
            "data ends before frame {} of {}",
            frame, declared
        )),
        other => other,
    }
}

struct WindowShape {
    nbefore: usize,
    nafter: usize,
    num_frames: usize,
    num_channels: usize,
}

/// Where the windows of a chunk go.
struct ChunkTargets<'a> {
    by_time: &'a [(usize, usize)],
    /// (unit position, row) per spike index
    placement: &'a [(usize, usize)],
    sinks: &'a [UnitSink],
    sums: &'a [Mutex<Array2<f64>>],
}

/// A unit's `.npy` file, sized up front and filled row by row.
struct UnitSink {
    path: PathBuf,
    file: Mutex<File>,
    data_offset: u64,
    row_bytes: usize,
}

impl UnitSink {
    fn create(path: PathBuf, shape: [usize; 3]) -> Result<Self> {
        let mut file = File::create(&path)?;
        let data_offset = npy::write_header(&mut file, <f32 as NpyElement>::DESCR, &shape)?;
        let row_bytes = shape[1] * shape[2] * SAMPLE_BYTES;
        file.set_len(data_offset + (shape[0] * row_bytes) as u64)?;

        Ok(UnitSink {
            path,
            file: Mutex::new(file),
            data_offset,
            row_bytes,
        })
    }

    fn write_row(&self, row: usize, bytes: &[u8]) -> Result<()> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(self.data_offset + (row * self.row_bytes) as u64))?;
        file.write_all(bytes)?;
        Ok(())
    }

    fn finish(self) -> Result<PathBuf> {
        let mut file = self.file.into_inner().unwrap_or_else(PoisonError::into_inner);
        file.flush()?;
        Ok(self.path)
    }
}

/// Helper function to reject spikes that the recording cannot contain
fn check_spikes_in_range(spikes: &SpikeSet, num_frames: usize) -> Result<()> {
    if let Some((i, &t)) = spikes
        .times
        .iter()
        .enumerate()
        .find(|&(_, &t)| t < 0 || t as usize >= num_frames)
    {
        return Err(Error::IncompleteWaveformExtraction(format!(
            "spike {} at sample {} lies outside the recording ({} frames)",
            i, t, num_frames
        )));
    }
    Ok(())
}

/// Helper function to cut and store the windows of spikes falling in `[start, end)`
fn extract_chunk(
    recording: &Recording,
    targets: &ChunkTargets,
    start: usize,
    end: usize,
    shape: &WindowShape,
) -> Result<()> {
    let by_time = targets.by_time;
    let first = by_time.partition_point(|&(t, _)| t < start);
    let last = by_time.partition_point(|&(t, _)| t < end);
    if first == last {
        return Ok(());
    }

    let read_start = start.saturating_sub(shape.nbefore);
    let read_end = (end + shape.nafter).min(shape.num_frames);

    let mut reader = MdaReader::open(&recording.signal_path).map_err(malformed_input)?;
    let frames = reader
        .read_frames(read_start, read_end - read_start)
        .map_err(malformed_input)?;

    let num_samples = shape.nbefore + shape.nafter;
    let mut window = Array2::<f32>::zeros((num_samples, shape.num_channels));
    let mut bytes = vec![0u8; num_samples * shape.num_channels * SAMPLE_BYTES];
    let mut chunk_sums: HashMap<usize, Array2<f64>> = HashMap::new();

    for &(time, spike_index) in &by_time[first..last] {
        window.fill(0.0);

        // Clip the window to the recording; the rest stays zero
        let lo = time.saturating_sub(shape.nbefore);
        let hi = (time + shape.nafter).min(shape.num_frames);
        let offset = lo + shape.nbefore - time;
        if hi > lo {
            window
                .slice_mut(s![offset..offset + (hi - lo), ..])
                .assign(&frames.slice(s![lo - read_start..hi - read_start, ..]));
        }

        let (unit, row) = targets.placement[spike_index];
        for (dst, &value) in bytes.chunks_exact_mut(SAMPLE_BYTES).zip(window.iter()) {
            LittleEndian::write_f32(dst, value);
        }
        targets.sinks[unit].write_row(row, &bytes)?;

        let sum = chunk_sums
            .entry(unit)
            .or_insert_with(|| Array2::zeros((num_samples, shape.num_channels)));
        Zip::from(sum).and(&window).for_each(|total, &value| *total += value as f64);
    }

    for (unit, chunk_sum) in chunk_sums {
        let mut sum = targets.sums[unit]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *sum += &chunk_sum;
    }

    Ok(())
}

/// Helper function to report progress every 10% of chunks
fn report_progress(completed: &AtomicUsize, total: usize) {
    let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
    let step = done * 100 / total / PRINT_PROGRESS_STEP;
    let previous = (done - 1) * 100 / total / PRINT_PROGRESS_STEP;
    if step != previous {
        debug!("{}% done...", step * PRINT_PROGRESS_STEP);
    }
}

/// Extraction settings saved next to the waveforms.
#[derive(Debug, Serialize)]
struct WaveformFolderParams<'a> {
    ms_before: f64,
    ms_after: f64,
    nbefore: usize,
    nafter: usize,
    sampling_frequency: f64,
    num_channels: usize,
    dtype: &'static str,
    return_scaled: bool,
    n_jobs: usize,
    total_memory: &'a str,
    unit_ids: Vec<i64>,
}

/// Helper function to write `params.json` for a finished waveform folder
fn write_folder_params(
    folder: &Path,
    waveforms: &WaveformSet,
    params: &ExtractionParams,
) -> Result<()> {
    let folder_params = WaveformFolderParams {
        ms_before: params.ms_before,
        ms_after: params.ms_after,
        nbefore: waveforms.nbefore,
        nafter: waveforms.nafter,
        sampling_frequency: waveforms.sample_rate,
        num_channels: waveforms.num_channels,
        dtype: "float32",
        return_scaled: false,
        n_jobs: params.n_jobs,
        total_memory: &params.total_memory,
        unit_ids: waveforms.unit_ids(),
    };
    fs::write(
        folder.join("params.json"),
        serde_json::to_string_pretty(&folder_params)?,
    )?;
    Ok(())
}
