//! Cluster metric table loaded from MountainSort's `metrics_tagged.json`.
//!
//! The table is built once per curation session and never recomputed. After
//! clusters are merged or split in the curation tool, lookups for the new
//! labels return [`MetricValue::NotAvailable`].

use log::{debug, warn};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::types::{Error, Result};

/// File name searched for next to the curation folder.
pub const METRICS_FILE: &str = "metrics_tagged.json";

/// Original label meaning "no such cluster" in cross-reference columns.
pub const NO_RELATION_LABEL: i64 = 0;

/// Label written in place of [`NO_RELATION_LABEL`] after relabeling.
pub const NO_RELATION: i64 = -1;

/// Columns holding labels of other clusters.
pub const CROSS_REFERENCE_COLUMNS: [&str; 2] = ["overlap_cluster", "bursting_parent"];

/// Derived or redundant columns hidden when redundant labels are removed.
pub const REDUNDANT_METRICS: [&str; 6] = [
    "num_events",
    "peak_amp",
    "firing_rate",
    "t1_sec",
    "t2_sec",
    "dur_sec",
];

/// Metrics shown first, in this order.
///
/// `overlap_cluster` is the column name MountainSort writes. Listing it here
/// ranks it fourth; older curation setups misspelled it, which left the column
/// among the unlisted metrics after `tags`.
pub const METRIC_PRIORITY: [&str; 6] = [
    "isolation",
    "peak_snr",
    "noise_overlap",
    "overlap_cluster",
    "bursting_parent",
    "tags",
];

const TAGS_COLUMN: &str = "tags";

/// One cell of the table.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Number(f64),
    Text(String),
    NotAvailable,
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn is_available(&self) -> bool {
        !matches!(self, MetricValue::NotAvailable)
    }

    fn from_json(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Number(n) => n.as_f64().map_or(MetricValue::NotAvailable, MetricValue::Number),
            Value::Bool(b) => MetricValue::Number(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => MetricValue::Text(s.clone()),
            Value::Null => MetricValue::NotAvailable,
            other => MetricValue::Text(other.to_string()),
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Number(value) => write!(f, "{}", value),
            MetricValue::Text(text) => f.write_str(text),
            MetricValue::NotAvailable => f.write_str("nan"),
        }
    }
}

/// Per-cluster lookup handed to the curation host.
pub type MetricFn = Box<dyn Fn(i64) -> MetricValue + Send + Sync>;

/// One entry of the `clusters` list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TaggedCluster {
    pub label: i64,
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TaggedMetricsFile {
    clusters: Vec<TaggedCluster>,
}

/// Metric values indexed by cluster label.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterMetricTable {
    columns: Vec<String>,
    rows: BTreeMap<i64, BTreeMap<String, MetricValue>>,
}

impl ClusterMetricTable {
    /// Builds the table, optionally renumbering labels densely from 0.
    ///
    /// With `relabel`, clusters are sorted by original label and numbered in
    /// that order, and cross-reference columns are rewritten through the same
    /// mapping. A reference to [`NO_RELATION_LABEL`] becomes [`NO_RELATION`].
    pub fn from_clusters(clusters: Vec<TaggedCluster>, relabel: bool) -> Self {
        let mut columns: Vec<String> = Vec::new();
        let mut rows: BTreeMap<i64, BTreeMap<String, MetricValue>> = BTreeMap::new();

        for cluster in clusters {
            let mut row: BTreeMap<String, MetricValue> = cluster
                .metrics
                .iter()
                .map(|(name, value)| (name.clone(), MetricValue::from_json(value)))
                .collect();
            row.insert(TAGS_COLUMN.to_string(), MetricValue::Text(tags_text(&cluster.tags)));

            for name in row.keys() {
                if name != TAGS_COLUMN && !columns.contains(name) {
                    columns.push(name.clone());
                }
            }
            if rows.insert(cluster.label, row).is_some() {
                warn!("Duplicate cluster label {}, keeping the last entry", cluster.label);
            }
        }
        columns.sort();
        columns.push(TAGS_COLUMN.to_string());

        let mut table = ClusterMetricTable { columns, rows };
        if relabel {
            table.relabel();
        }
        table
    }

    pub fn from_reader<R: Read>(reader: R, relabel: bool) -> Result<Self> {
        let file: TaggedMetricsFile = serde_json::from_reader(reader)?;
        Ok(Self::from_clusters(file.clusters, relabel))
    }

    pub fn from_json_str(text: &str, relabel: bool) -> Result<Self> {
        let file: TaggedMetricsFile = serde_json::from_str(text)?;
        Ok(Self::from_clusters(file.clusters, relabel))
    }

    /// Loads `metrics_tagged.json` for a curation folder.
    pub fn load_for_curation_dir<P: AsRef<Path>>(curation_dir: P, relabel: bool) -> Result<Self> {
        let path = metrics_path_for(curation_dir.as_ref())?;
        debug!("Loading cluster metrics from {}", path.display());
        let reader = BufReader::new(File::open(&path)?);
        Self::from_reader(reader, relabel)
    }

    fn relabel(&mut self) {
        let mut lookup: BTreeMap<i64, i64> = self
            .rows
            .keys()
            .enumerate()
            .map(|(dense, &original)| (original, dense as i64))
            .collect();
        lookup.insert(NO_RELATION_LABEL, NO_RELATION);

        let old_rows = std::mem::take(&mut self.rows);
        for (dense, (original, mut row)) in old_rows.into_iter().enumerate() {
            for column in CROSS_REFERENCE_COLUMNS {
                if let Some(value) = row.get_mut(column) {
                    *value = remap_reference(original, column, value, &lookup);
                }
            }
            self.rows.insert(dense as i64, row);
        }
    }

    /// Cluster labels present in the table, ascending.
    pub fn labels(&self) -> Vec<i64> {
        self.rows.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// All column names; `tags` is always last.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Value of `metric` for `label`, or `NotAvailable` if either is unknown.
    pub fn value(&self, label: i64, metric: &str) -> MetricValue {
        self.rows
            .get(&label)
            .and_then(|row| row.get(metric))
            .cloned()
            .unwrap_or(MetricValue::NotAvailable)
    }

    /// Owned lookup for a single metric column.
    pub fn metric_fn(&self, metric: &str) -> MetricFn {
        let column: BTreeMap<i64, MetricValue> = self
            .rows
            .iter()
            .filter_map(|(&label, row)| row.get(metric).map(|value| (label, value.clone())))
            .collect();
        Box::new(move |label| {
            column
                .get(&label)
                .cloned()
                .unwrap_or(MetricValue::NotAvailable)
        })
    }

    pub fn list_metric_names(&self, remove_redundant: bool) -> Vec<String> {
        self.columns
            .iter()
            .filter(|name| !remove_redundant || !REDUNDANT_METRICS.contains(&name.as_str()))
            .cloned()
            .collect()
    }
}

/// Sorts metric names by [`METRIC_PRIORITY`]; others keep their relative order after.
pub fn order_metric_names(mut names: Vec<String>) -> Vec<String> {
    names.sort_by_key(|name| {
        METRIC_PRIORITY
            .iter()
            .position(|p| *p == name.as_str())
            .unwrap_or(METRIC_PRIORITY.len())
    });
    names
}

/// Column title shown in the curation tool.
pub fn display_name(metric: &str) -> String {
    format!("ms\n{}", metric).replace('_', "\n")
}

/// `metrics_tagged.json` in the parent of the curation folder.
pub fn metrics_path_for(curation_dir: &Path) -> Result<PathBuf> {
    let parent = curation_dir.parent().unwrap_or(curation_dir);
    let path = parent.join(METRICS_FILE);
    if path.is_file() {
        Ok(path)
    } else {
        Err(Error::MissingInput(path))
    }
}

/// Tags as one text cell: `"accepted, mua"`, or empty when there are none.
///
/// This is plain text, not a list literal such as `['accepted', 'mua']`, so
/// filters that matched on brackets or quotes need updating.
fn tags_text(tags: &[String]) -> String {
    tags.join(", ")
}

fn remap_reference(
    cluster: i64,
    column: &str,
    value: &MetricValue,
    lookup: &BTreeMap<i64, i64>,
) -> MetricValue {
    let Some(reference) = value.as_f64() else {
        return value.clone();
    };
    match lookup.get(&(reference as i64)) {
        Some(&mapped) => MetricValue::Number(mapped as f64),
        None => {
            warn!(
                "Cluster {} references unknown cluster {} in {}",
                cluster, reference, column
            );
            MetricValue::NotAvailable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cluster(label: i64, metrics: serde_json::Value, tags: &[&str]) -> TaggedCluster {
        TaggedCluster {
            label,
            metrics: serde_json::from_value(metrics).unwrap(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn sample_table() -> ClusterMetricTable {
        ClusterMetricTable::from_clusters(
            vec![
                cluster(5, json!({"isolation": 0.9, "bursting_parent": 3, "overlap_cluster": 0}), &[]),
                cluster(0, json!({"isolation": 0.5, "bursting_parent": 0, "overlap_cluster": 5}), &["mua"]),
                cluster(3, json!({"isolation": 0.7, "bursting_parent": 0, "overlap_cluster": 0}), &["accepted", "rejected"]),
            ],
            true,
        )
    }

    #[test]
    fn labels_are_renumbered_in_sorted_order() {
        let table = sample_table();
        assert_eq!(table.labels(), vec![0, 1, 2]);
        assert_eq!(table.value(0, "isolation"), MetricValue::Number(0.5));
        assert_eq!(table.value(1, "isolation"), MetricValue::Number(0.7));
        assert_eq!(table.value(2, "isolation"), MetricValue::Number(0.9));
    }

    #[test]
    fn cross_references_follow_the_relabeling() {
        let table = sample_table();
        // Original label 0 means no relation, not dense cluster 0
        assert_eq!(table.value(1, "bursting_parent"), MetricValue::Number(-1.0));
        // Original 3 became 1, original 5 became 2
        assert_eq!(table.value(2, "bursting_parent"), MetricValue::Number(1.0));
        assert_eq!(table.value(0, "overlap_cluster"), MetricValue::Number(2.0));
    }

    #[test]
    fn unknown_reference_is_not_available() {
        let table = ClusterMetricTable::from_clusters(
            vec![cluster(2, json!({"bursting_parent": 7}), &[])],
            true,
        );
        assert_eq!(table.value(0, "bursting_parent"), MetricValue::NotAvailable);
    }

    #[test]
    fn unknown_label_is_never_an_error() {
        let table = sample_table();
        for metric in table.columns() {
            assert_eq!(table.value(99, metric), MetricValue::NotAvailable);
        }
        let lookup = table.metric_fn("isolation");
        assert_eq!(lookup(99), MetricValue::NotAvailable);
        assert_eq!(lookup(2), MetricValue::Number(0.9));
    }

    #[test]
    fn tags_are_joined() {
        let table = sample_table();
        assert_eq!(table.value(0, "tags"), MetricValue::Text("mua".into()));
        assert_eq!(
            table.value(1, "tags"),
            MetricValue::Text("accepted, rejected".into())
        );
        assert_eq!(table.value(2, "tags"), MetricValue::Text(String::new()));
        assert_eq!(tags_text(&["accepted".into(), "mua".into()]), "accepted, mua");
    }

    #[test]
    fn overlap_cluster_ranks_ahead_of_unlisted_metrics() {
        let names = ["zeta", "overlap_cluster", "tags", "isolation", "amplitude"]
            .iter()
            .map(|name| name.to_string())
            .collect();
        assert_eq!(
            order_metric_names(names),
            vec!["isolation", "overlap_cluster", "tags", "zeta", "amplitude"]
        );
    }

    #[test]
    fn original_labels_are_kept_without_relabeling() {
        let table = ClusterMetricTable::from_json_str(
            r#"{"clusters": [{"label": 4, "metrics": {"bursting_parent": 0}, "tags": []}]}"#,
            false,
        )
        .unwrap();
        assert_eq!(table.labels(), vec![4]);
        assert_eq!(table.value(4, "bursting_parent"), MetricValue::Number(0.0));
    }

    #[test]
    fn redundant_metrics_are_removed_and_priority_applied() {
        let table = ClusterMetricTable::from_clusters(
            vec![cluster(
                1,
                json!({
                    "dur_sec": 10, "firing_rate": 2.0, "isolation": 1.0,
                    "noise_overlap": 0.1, "num_events": 20, "peak_amp": 50,
                    "peak_noise": 3.0, "peak_snr": 9.0, "t1_sec": 0, "t2_sec": 10,
                    "bursting_parent": 0, "overlap_cluster": 0
                }),
                &[],
            )],
            true,
        );

        let all = table.list_metric_names(false);
        assert!(all.contains(&"num_events".to_string()));
        assert_eq!(all.last().map(String::as_str), Some("tags"));

        let ordered = order_metric_names(table.list_metric_names(true));
        assert_eq!(
            ordered,
            vec![
                "isolation",
                "peak_snr",
                "noise_overlap",
                "overlap_cluster",
                "bursting_parent",
                "tags",
                "peak_noise",
            ]
        );
    }

    #[test]
    fn display_names_split_on_underscores() {
        assert_eq!(display_name("peak_snr"), "ms\npeak\nsnr");
        assert_eq!(display_name("isolation"), "ms\nisolation");
    }

    #[test]
    fn metrics_file_is_found_next_to_curation_dir() {
        let root = tempfile::tempdir().unwrap();
        let curation = root.path().join("phy");
        std::fs::create_dir(&curation).unwrap();
        assert!(matches!(
            metrics_path_for(&curation),
            Err(Error::MissingInput(_))
        ));

        std::fs::write(
            root.path().join(METRICS_FILE),
            r#"{"clusters": [{"label": 1, "metrics": {"isolation": 0.8}, "tags": ["noise"]}]}"#,
        )
        .unwrap();
        let table = ClusterMetricTable::load_for_curation_dir(&curation, true).unwrap();
        assert_eq!(table.value(0, "tags"), MetricValue::Text("noise".into()));
    }
}
