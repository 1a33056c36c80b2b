use log::warn;
use std::env;
use std::path::{Path, PathBuf};

use crate::types::{Error, Result};

/// Folder argument meaning "the current directory".
const CURRENT_DIR_ALIAS: &str = "pwd";

/// Resolves the optional Phy folder argument; empty or `pwd` is the current directory.
pub fn resolve_folder(folder: Option<&str>) -> Result<PathBuf> {
    match folder {
        None | Some("") | Some(CURRENT_DIR_ALIAS) => Ok(env::current_dir()?),
        Some(path) => Ok(PathBuf::from(path)),
    }
}

/// Writes Phy curation back into MountainSort files next to `folder`.
///
/// Not implemented yet: rebuilding `firings.mda` from `spike_clusters.npy`
/// and `metrics_tagged.json` from `cluster_group.tsv`.
pub fn phy_to_mountainsort(folder: &Path) -> Result<()> {
    warn!("Phy to MountainSort conversion requested for {}", folder.display());
    Err(Error::Unsupported(
        "converting Phy folders back to MountainSort".to_string(),
    ))
}
