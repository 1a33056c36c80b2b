//! Channel geometry (`geom.csv`) parsing and reconciliation.
//!
//! Sorting folders sometimes carry a `geom.csv` with more coordinate rows than
//! the signal file has channels. The recording cannot be built until the two
//! agree, so rows are dropped from the end of the file, one per attempt,
//! until construction succeeds or the file is empty.

use log::{debug, warn};
use std::convert::Infallible;
use std::fs;
use std::path::Path;

use crate::types::*;

/// Result of trimming rows until they are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Rows were accepted after `iterations` trims
    Converged { iterations: usize },
    /// Every row was trimmed without acceptance
    Unresolvable { iterations: usize },
}

impl Reconciliation {
    pub fn iterations(&self) -> usize {
        match *self {
            Reconciliation::Converged { iterations } => iterations,
            Reconciliation::Unresolvable { iterations } => iterations,
        }
    }

    pub fn converged(&self) -> bool {
        matches!(self, Reconciliation::Converged { .. })
    }
}

/// Drops trailing rows until `accepts` returns true or no rows remain.
///
/// `accepts` is never called with an empty slice; running out of rows is
/// the only way to report [`Reconciliation::Unresolvable`].
pub fn try_reconcile_rows<T, E, F>(
    mut rows: Vec<T>,
    mut accepts: F,
) -> std::result::Result<(Vec<T>, Reconciliation), E>
where
    F: FnMut(&[T]) -> std::result::Result<bool, E>,
{
    let mut iterations = 0;
    while !rows.is_empty() {
        if accepts(&rows)? {
            return Ok((rows, Reconciliation::Converged { iterations }));
        }
        rows.pop();
        iterations += 1;
    }
    Ok((rows, Reconciliation::Unresolvable { iterations }))
}

/// Infallible form of [`try_reconcile_rows`].
pub fn reconcile_rows<T, F>(rows: Vec<T>, mut accepts: F) -> (Vec<T>, Reconciliation)
where
    F: FnMut(&[T]) -> bool,
{
    match try_reconcile_rows(rows, |candidate| Ok::<_, Infallible>(accepts(candidate))) {
        Ok(result) => result,
        Err(never) => match never {},
    }
}

/// Trims rows until exactly `channels` remain.
pub fn reconcile_to_channel_count<T>(rows: Vec<T>, channels: usize) -> (Vec<T>, Reconciliation) {
    reconcile_rows(rows, |candidate| candidate.len() == channels)
}

/// Reads the non-blank lines of a geometry file.
pub fn read_geometry_rows(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)?;
    Ok(text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect())
}

/// Overwrites a geometry file with `rows`.
pub fn write_geometry_rows(path: &Path, rows: &[String]) -> Result<()> {
    let mut text = rows.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    fs::write(path, text)?;
    Ok(())
}

/// Parses a geometry file into one coordinate row per channel.
pub fn read_geometry(path: &Path) -> Result<Vec<Vec<f64>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        if record.iter().all(|field| field.is_empty()) {
            continue;
        }
        let row = record
            .iter()
            .map(|field| {
                field.parse::<f64>().map_err(|e| {
                    Error::UnresolvableConfiguration(format!(
                        "bad coordinate '{}' in {}: {}",
                        field,
                        path.display(),
                        e
                    ))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        rows.push(row);
    }

    Ok(rows)
}

/// Repeatedly builds a recording, trimming `geom.csv` after each mismatch.
///
/// `construct` is expected to read the geometry file itself and report
/// [`Error::GeometryMismatch`] when the counts disagree; any other error is
/// returned as is. The file is rewritten in place on every trim, and an
/// emptied file is left on disk when reconciliation fails.
pub fn reconcile_geometry_file<T, F>(path: &Path, mut construct: F) -> Result<(T, usize)>
where
    F: FnMut() -> Result<T>,
{
    let rows = read_geometry_rows(path)?;
    let original_len = rows.len();
    let mut built = None;

    let (rows, outcome) = try_reconcile_rows(rows, |candidate: &[String]| -> Result<bool> {
        if candidate.len() != original_len {
            write_geometry_rows(path, candidate)?;
        }
        match construct() {
            Ok(value) => {
                built = Some(value);
                Ok(true)
            }
            Err(Error::GeometryMismatch { rows, channels }) => {
                debug!(
                    "{} has {} rows for {} channels, dropping last row",
                    path.display(),
                    rows,
                    channels
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    })?;

    match (outcome, built) {
        (Reconciliation::Converged { iterations }, Some(value)) => {
            if iterations > 0 {
                debug!(
                    "{} reconciled after {} trims ({} rows left)",
                    path.display(),
                    iterations,
                    rows.len()
                );
            }
            Ok((value, iterations))
        }
        _ => {
            write_geometry_rows(path, &rows)?;
            warn!("{} is empty, geometry never matched", path.display());
            Err(Error::UnresolvableGeometry(path.to_path_buf()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("0,{}", i * 25)).collect()
    }

    #[test]
    fn converges_in_n_minus_k_iterations() {
        let (kept, outcome) = reconcile_to_channel_count(rows(7), 4);
        assert_eq!(outcome, Reconciliation::Converged { iterations: 3 });
        assert_eq!(kept, rows(4));
    }

    #[test]
    fn matching_rows_take_no_iterations() {
        let (kept, outcome) = reconcile_to_channel_count(rows(4), 4);
        assert_eq!(outcome.iterations(), 0);
        assert!(outcome.converged());
        assert_eq!(kept, rows(4));
    }

    #[test]
    fn too_few_rows_drain_to_empty() {
        let (kept, outcome) = reconcile_to_channel_count(rows(3), 5);
        assert_eq!(outcome, Reconciliation::Unresolvable { iterations: 3 });
        assert!(kept.is_empty());
    }

    #[test]
    fn empty_input_is_unresolvable_without_iterations() {
        let (kept, outcome) = reconcile_to_channel_count(Vec::<String>::new(), 2);
        assert_eq!(outcome, Reconciliation::Unresolvable { iterations: 0 });
        assert!(kept.is_empty());
    }

    #[test]
    fn predicate_errors_stop_the_loop() {
        let result: std::result::Result<_, &str> =
            try_reconcile_rows(rows(5), |candidate| {
                if candidate.len() == 3 {
                    Err("boom")
                } else {
                    Ok(false)
                }
            });
        assert_eq!(result.unwrap_err(), "boom");
    }

    fn construct_from(path: &Path, channels: usize) -> Result<usize> {
        let geometry = read_geometry(path)?;
        if geometry.len() != channels {
            return Err(Error::GeometryMismatch {
                rows: geometry.len(),
                channels,
            });
        }
        Ok(geometry.len())
    }

    #[test]
    fn file_is_trimmed_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geom.csv");
        write_geometry_rows(&path, &rows(6)).unwrap();

        let (built, iterations) =
            reconcile_geometry_file(&path, || construct_from(&path, 4)).unwrap();

        assert_eq!((built, iterations), (4, 2));
        assert_eq!(read_geometry_rows(&path).unwrap(), rows(4));
    }

    #[test]
    fn correct_file_is_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geom.csv");
        std::fs::write(&path, "0,0\n0,25\n").unwrap();

        let (_, iterations) =
            reconcile_geometry_file(&path, || construct_from(&path, 2)).unwrap();

        assert_eq!(iterations, 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0,0\n0,25\n");
    }

    #[test]
    fn unresolvable_file_is_left_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geom.csv");
        write_geometry_rows(&path, &rows(2)).unwrap();

        let err = reconcile_geometry_file(&path, || construct_from(&path, 4)).unwrap_err();

        assert!(matches!(err, Error::UnresolvableGeometry(_)));
        assert!(read_geometry_rows(&path).unwrap().is_empty());
    }

    #[test]
    fn other_construction_errors_propagate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geom.csv");
        write_geometry_rows(&path, &rows(3)).unwrap();

        let err = reconcile_geometry_file(&path, || -> Result<()> {
            Err(Error::UnresolvableConfiguration("no params".into()))
        })
        .unwrap_err();

        assert!(matches!(err, Error::UnresolvableConfiguration(_)));
        assert_eq!(read_geometry_rows(&path).unwrap(), rows(3));
    }

    #[test]
    fn coordinates_parse_with_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geom.csv");
        std::fs::write(&path, "0, 0\n 20,0\n\n").unwrap();

        let geometry = read_geometry(&path).unwrap();
        assert_eq!(geometry, vec![vec![0.0, 0.0], vec![20.0, 0.0]]);
    }
}
