//! Curation-tool extensions: metric columns and a waveform projection view.
//!
//! The curation tool itself is not part of this crate. It is reached through
//! [`CurationHost`], and spike data and the dimension reduction come from
//! host-supplied [`SpikeSource`] and [`DimensionReducer`] implementations.

use log::{debug, info};
use ndarray::{Array2, Array3};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use crate::metrics::{display_name, order_metric_names, ClusterMetricTable, MetricFn};
use crate::types::Result;

/// Builds a projection view on demand.
pub type ViewFactory = Box<dyn Fn() -> ProjectionView + Send + Sync>;

/// What a plugin can register with the curation tool.
pub trait CurationHost {
    /// Folder holding the Phy files being curated.
    fn curation_dir(&self) -> &Path;
    fn register_cluster_metric(&mut self, name: String, metric: MetricFn);
    fn register_view(&mut self, name: String, factory: ViewFactory);
}

/// A plugin attached once at curation-tool startup.
pub trait CurationPlugin {
    fn attach(&self, host: &mut dyn CurationHost) -> Result<()>;
}

/// Adds the MountainSort metric table as cluster columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurationTagsPlugin {
    pub remove_redundant_labels: bool,
    pub preferred_order: bool,
}

impl Default for CurationTagsPlugin {
    fn default() -> Self {
        CurationTagsPlugin {
            remove_redundant_labels: true,
            preferred_order: true,
        }
    }
}

impl CurationPlugin for CurationTagsPlugin {
    fn attach(&self, host: &mut dyn CurationHost) -> Result<()> {
        let table = ClusterMetricTable::load_for_curation_dir(host.curation_dir(), true)?;
        let mut names = table.list_metric_names(self.remove_redundant_labels);
        if self.preferred_order {
            names = order_metric_names(names);
        }

        info!("Registering {} MountainSort metrics for {} clusters", names.len(), table.len());
        for name in names {
            host.register_cluster_metric(display_name(&name), table.metric_fn(&name));
        }
        Ok(())
    }
}

/// Spike access provided by the curation tool.
pub trait SpikeSource: Send + Sync {
    /// Spike ids from `cluster_ids`, at most `max_spikes` if given, drawn in batches.
    fn select_spikes(&self, max_spikes: Option<usize>, cluster_ids: &[i64], batch_size: usize)
        -> Vec<usize>;
    /// Current cluster of each spike.
    fn spike_clusters(&self, spike_ids: &[usize]) -> Vec<i64>;
    /// Waveforms on all channels, shaped (spikes, samples, channels).
    fn waveforms(&self, spike_ids: &[usize]) -> Result<Array3<f32>>;
}

/// Non-linear embedding of feature rows into 2D.
pub trait DimensionReducer: Send + Sync {
    fn reduce(&self, data: &Array2<f32>, n_neighbors: usize) -> Result<Array2<f32>>;
}

/// Coordinates for a scatter view.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub pos: Array2<f32>,
    pub spike_ids: Vec<usize>,
    pub spike_clusters: Vec<i64>,
}

/// Spike selection and embedding settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectionSettings {
    /// `None` projects every spike of the selection
    pub max_spikes: Option<usize>,
    pub batch_size: usize,
    pub n_neighbors: usize,
}

impl ProjectionSettings {
    /// Fast view over a subsample.
    pub fn subsample() -> Self {
        ProjectionSettings {
            max_spikes: Some(200),
            batch_size: 50,
            n_neighbors: 20,
        }
    }

    /// Slow view over every spike; lasso splits then cover the whole cluster.
    pub fn complete() -> Self {
        ProjectionSettings {
            max_spikes: None,
            batch_size: 50,
            n_neighbors: 15,
        }
    }
}

type ProjectionCache = Mutex<HashMap<Vec<i64>, Arc<Projection>>>;

/// Session state shared by every view a plugin creates.
struct ProjectionEngine {
    settings: ProjectionSettings,
    source: Arc<dyn SpikeSource>,
    reducer: Arc<dyn DimensionReducer>,
    cache: ProjectionCache,
}

impl ProjectionEngine {
    fn coords(&self, cluster_ids: &[i64]) -> Result<Arc<Projection>> {
        let mut key = cluster_ids.to_vec();
        key.sort_unstable();
        key.dedup();

        if let Some(hit) = self.lock_cache().get(&key) {
            return Ok(Arc::clone(hit));
        }

        let spike_ids =
            self.source
                .select_spikes(self.settings.max_spikes, &key, self.settings.batch_size);
        let spike_clusters = self.source.spike_clusters(&spike_ids);
        let data = flatten_channel_major(&self.source.waveforms(&spike_ids)?);
        debug!(
            "Projecting {} spikes from clusters {:?}",
            spike_ids.len(),
            key
        );
        let pos = self.reducer.reduce(&data, self.settings.n_neighbors)?;

        let projection = Arc::new(Projection {
            pos,
            spike_ids,
            spike_clusters,
        });
        self.lock_cache().insert(key, Arc::clone(&projection));
        Ok(projection)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<Vec<i64>, Arc<Projection>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scatter view of the embedded waveforms of the selected clusters.
#[derive(Clone)]
pub struct ProjectionView {
    name: String,
    engine: Arc<ProjectionEngine>,
}

impl ProjectionView {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Coordinates for `cluster_ids`; repeated selections reuse the cached result.
    pub fn coords(&self, cluster_ids: &[i64]) -> Result<Arc<Projection>> {
        self.engine.coords(cluster_ids)
    }
}

/// Registers a waveform projection view with the curation tool.
pub struct WaveformProjectionPlugin {
    view_name: String,
    settings: ProjectionSettings,
    source: Arc<dyn SpikeSource>,
    reducer: Arc<dyn DimensionReducer>,
}

impl WaveformProjectionPlugin {
    pub fn new(
        view_name: impl Into<String>,
        settings: ProjectionSettings,
        source: Arc<dyn SpikeSource>,
        reducer: Arc<dyn DimensionReducer>,
    ) -> Self {
        WaveformProjectionPlugin {
            view_name: view_name.into(),
            settings,
            source,
            reducer,
        }
    }

    pub fn subsample(source: Arc<dyn SpikeSource>, reducer: Arc<dyn DimensionReducer>) -> Self {
        Self::new("WaveformProjectionView", ProjectionSettings::subsample(), source, reducer)
    }

    pub fn complete(source: Arc<dyn SpikeSource>, reducer: Arc<dyn DimensionReducer>) -> Self {
        Self::new(
            "WaveformProjectionCompleteView",
            ProjectionSettings::complete(),
            source,
            reducer,
        )
    }
}

impl CurationPlugin for WaveformProjectionPlugin {
    fn attach(&self, host: &mut dyn CurationHost) -> Result<()> {
        let engine = Arc::new(ProjectionEngine {
            settings: self.settings,
            source: Arc::clone(&self.source),
            reducer: Arc::clone(&self.reducer),
            cache: Mutex::new(HashMap::new()),
        });
        let name = self.view_name.clone();
        let factory: ViewFactory = Box::new(move || ProjectionView {
            name: name.clone(),
            engine: Arc::clone(&engine),
        });
        host.register_view(self.view_name.clone(), factory);
        Ok(())
    }
}

/// Reshapes (spikes, samples, channels) into rows of all samples of channel 0,
/// then channel 1, and so on.
pub fn flatten_channel_major(data: &Array3<f32>) -> Array2<f32> {
    let (num_spikes, num_samples, num_channels) = data.dim();
    Array2::from_shape_fn((num_spikes, num_samples * num_channels), |(spike, column)| {
        data[[spike, column % num_samples, column / num_samples]]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricValue;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeHost {
        dir: PathBuf,
        metrics: Vec<(String, MetricFn)>,
        views: Vec<(String, ViewFactory)>,
    }

    impl CurationHost for FakeHost {
        fn curation_dir(&self) -> &Path {
            &self.dir
        }

        fn register_cluster_metric(&mut self, name: String, metric: MetricFn) {
            self.metrics.push((name, metric));
        }

        fn register_view(&mut self, name: String, factory: ViewFactory) {
            self.views.push((name, factory));
        }
    }

    /// Two clusters of three spikes each; spike i has value i everywhere.
    struct FakeSpikes;

    impl SpikeSource for FakeSpikes {
        fn select_spikes(&self, max_spikes: Option<usize>, cluster_ids: &[i64], _: usize) -> Vec<usize> {
            let ids = cluster_ids
                .iter()
                .flat_map(|&c| (0..3).map(move |i| c as usize * 3 + i));
            match max_spikes {
                Some(max) => ids.take(max).collect(),
                None => ids.collect(),
            }
        }

        fn spike_clusters(&self, spike_ids: &[usize]) -> Vec<i64> {
            spike_ids.iter().map(|&id| (id / 3) as i64).collect()
        }

        fn waveforms(&self, spike_ids: &[usize]) -> Result<Array3<f32>> {
            Ok(Array3::from_shape_fn((spike_ids.len(), 4, 2), |(s, _, _)| {
                spike_ids[s] as f32
            }))
        }
    }

    /// Keeps the first two columns and counts calls.
    #[derive(Default)]
    struct CountingReducer {
        calls: AtomicUsize,
        neighbors: AtomicUsize,
    }

    impl DimensionReducer for CountingReducer {
        fn reduce(&self, data: &Array2<f32>, n_neighbors: usize) -> Result<Array2<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.neighbors.store(n_neighbors, Ordering::SeqCst);
            Ok(data.slice(ndarray::s![.., ..2]).to_owned())
        }
    }

    #[test]
    fn flattening_is_channel_major() {
        let data = Array3::from_shape_fn((1, 3, 2), |(_, sample, channel)| {
            (channel * 10 + sample) as f32
        });
        let flat = flatten_channel_major(&data);
        assert_eq!(flat.row(0).to_vec(), vec![0.0, 1.0, 2.0, 10.0, 11.0, 12.0]);
    }

    #[test]
    fn tags_plugin_registers_ordered_display_names() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("phy");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(
            root.path().join(crate::metrics::METRICS_FILE),
            r#"{"clusters": [
                {"label": 2, "metrics": {"num_events": 10, "peak_snr": 4.0, "isolation": 0.9}, "tags": []},
                {"label": 7, "metrics": {"num_events": 12, "peak_snr": 6.0, "isolation": 0.4}, "tags": ["mua"]}
            ]}"#,
        )
        .unwrap();

        let mut host = FakeHost {
            dir,
            ..FakeHost::default()
        };
        CurationTagsPlugin::default().attach(&mut host).unwrap();

        let names: Vec<&str> = host.metrics.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["ms\nisolation", "ms\npeak\nsnr", "ms\ntags"]);

        let snr = &host.metrics[1].1;
        assert_eq!(snr(1), MetricValue::Number(6.0));
        assert_eq!(snr(5), MetricValue::NotAvailable);
    }

    #[test]
    fn tags_plugin_fails_without_metrics_file() {
        let root = tempfile::tempdir().unwrap();
        let mut host = FakeHost {
            dir: root.path().join("phy"),
            ..FakeHost::default()
        };
        assert!(CurationTagsPlugin::default().attach(&mut host).is_err());
        assert!(host.metrics.is_empty());
    }

    #[test]
    fn projection_view_is_cached_per_selection() {
        let reducer = Arc::new(CountingReducer::default());
        let plugin = WaveformProjectionPlugin::subsample(Arc::new(FakeSpikes), reducer.clone());
        let mut host = FakeHost::default();
        plugin.attach(&mut host).unwrap();

        assert_eq!(host.views.len(), 1);
        assert_eq!(host.views[0].0, "WaveformProjectionView");
        let view = (host.views[0].1)();

        let first = view.coords(&[1, 0]).unwrap();
        assert_eq!(first.spike_ids, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(first.spike_clusters, vec![0, 0, 0, 1, 1, 1]);
        assert_eq!(first.pos.dim(), (6, 2));
        assert_eq!(reducer.neighbors.load(Ordering::SeqCst), 20);

        // Same selection from a second view of the same session
        let again = (host.views[0].1)().coords(&[0, 1]).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(reducer.calls.load(Ordering::SeqCst), 1);

        view.coords(&[1]).unwrap();
        assert_eq!(reducer.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn complete_view_uses_every_spike() {
        let reducer = Arc::new(CountingReducer::default());
        let plugin = WaveformProjectionPlugin::complete(Arc::new(FakeSpikes), reducer.clone());
        let mut host = FakeHost::default();
        plugin.attach(&mut host).unwrap();

        let projection = (host.views[0].1)().coords(&[0]).unwrap();
        assert_eq!(projection.spike_ids.len(), 3);
        assert_eq!(reducer.neighbors.load(Ordering::SeqCst), 15);
        assert_eq!(host.views[0].0, "WaveformProjectionCompleteView");
    }
}
