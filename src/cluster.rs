//! One target cluster: its declared configuration, its document store and
//! the per-file metadata that makes runs resumable.

use crate::{
    config::ClusterConfig,
    error::Error,
    segfile::SegmentFile,
    store::{DocumentStore, Namespace},
    strategy::Strategy,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Interval between cumulative suspended-time log lines while rate limited.
const SUSPEND_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Builds the store behind one cluster.
pub type StoreFactory =
    dyn Fn(&str, &ClusterConfig) -> Result<Arc<dyn DocumentStore>, Error> + Send + Sync;

/// A single cluster; exactly one instance per name within a process, held
/// by the [`ClusterRegistry`].
pub struct Cluster {
    name: String,
    declared: ClusterConfig,
    store: Arc<dyn DocumentStore>,
    segments_collection: String,
    uploading_delay_ms: AtomicU64,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster").field("name", &self.name).finish()
    }
}

impl Cluster {
    fn new(
        name: String,
        declared: ClusterConfig,
        store: Arc<dyn DocumentStore>,
        segments_collection: String,
    ) -> Self {
        let delay_ms = declared
            .uploading_delay
            .map_or(0, |secs| (secs * 1000.0) as u64);
        Self {
            name,
            declared,
            store,
            segments_collection,
            uploading_delay_ms: AtomicU64::new(delay_ms),
        }
    }

    /// Unique cluster name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configuration this cluster was declared with.
    pub fn declared_config(&self) -> &ClusterConfig {
        &self.declared
    }

    /// Current rate-limiter delay between batches.
    pub fn uploading_delay(&self) -> Duration {
        Duration::from_millis(self.uploading_delay_ms.load(Ordering::Relaxed))
    }

    /// Rate-limiter hook: sets the delay slept between batches.
    pub fn set_uploading_delay(&self, seconds: f64) {
        self.uploading_delay_ms
            .store((seconds.max(0.0) * 1000.0) as u64, Ordering::Relaxed);
    }

    /// The metadata collection within the strategy's database.
    fn metadata_namespace(&self, strategy: &Strategy) -> Namespace {
        Namespace {
            database: strategy.namespace.database.clone(),
            collection: self.segments_collection.clone(),
        }
    }

    /// Loads the persisted record of `segfile`, if any. Returns whether a
    /// record existed. A record bound to a different provider is an error.
    pub fn read_segfile_info(&self, segfile: &mut SegmentFile) -> Result<bool, Error> {
        let ns = self.metadata_namespace(segfile.strategy());
        match self.store.find_one(&ns, &segfile.name)? {
            Some(record) => {
                segfile.load_metadata(&record)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Upserts the metadata record of `segfile`, keyed by its name.
    pub fn save_segfile_info(&self, segfile: &SegmentFile) -> Result<(), Error> {
        let ns = self.metadata_namespace(segfile.strategy());
        self.store.upsert_one(&ns, &segfile.name, segfile.dump_metadata())
    }

    /// Streams the file's batches into the target collection with unordered
    /// bulk writes, honoring the rate-limiter delay between batches.
    pub fn upload_segfile(&self, segfile: &mut SegmentFile) -> Result<(), Error> {
        info!(
            "{} {} of type {:?}",
            self.name, segfile.name, segfile.kind
        );
        let ns = segfile.strategy().namespace.clone();
        let write_concern = segfile.strategy().write_concern.clone();
        let name = segfile.name.clone();

        let mut suspended = Duration::ZERO;
        let mut suspend_logged = Instant::now();
        let mut batches = segfile.batches()?;
        while let Some(batch) = batches.next() {
            let batch = batch?;
            if batch.is_empty() {
                continue;
            }
            let delay = self.uploading_delay();
            if !delay.is_zero() {
                std::thread::sleep(delay);
                suspended += delay;
                if suspend_logged.elapsed() >= SUSPEND_LOG_INTERVAL {
                    info!(
                        "{}: uploading of {name} suspended for {:.0}s in total",
                        self.name,
                        suspended.as_secs_f64(),
                    );
                    suspend_logged = Instant::now();
                }
            }
            let result = self.store.bulk_write(&ns, &batch, &write_concern)?;
            batches.count_bulk_write_result(&result);
        }
        Ok(())
    }
}

/// Synchronized name-keyed registry with get-or-create semantics; the only
/// shared registry in the process.
#[derive(Debug, Default)]
pub struct ClusterRegistry {
    inner: Mutex<HashMap<String, Arc<Cluster>>>,
    segments_collection: String,
}

impl ClusterRegistry {
    /// A registry whose clusters persist metadata in `segments_collection`.
    pub fn new(segments_collection: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            segments_collection: segments_collection.into(),
        }
    }

    /// Returns the cluster named `name`, creating it on first use. An
    /// existing instance is returned as-is, its original configuration kept.
    pub fn get_or_create(
        &self,
        name: &str,
        config: &ClusterConfig,
        factory: &StoreFactory,
    ) -> Result<Arc<Cluster>, Error> {
        let mut inner = self.inner.lock().expect("cluster registry poisoned");
        if let Some(existing) = inner.get(name) {
            return Ok(Arc::clone(existing));
        }
        let store = factory(name, config)?;
        let cluster = Arc::new(Cluster::new(
            name.to_owned(),
            config.clone(),
            store,
            self.segments_collection.clone(),
        ));
        inner.insert(name.to_owned(), Arc::clone(&cluster));
        Ok(cluster)
    }

    /// Looks up an existing cluster.
    pub fn get(&self, name: &str) -> Option<Arc<Cluster>> {
        self.inner
            .lock()
            .expect("cluster registry poisoned")
            .get(name)
            .map(Arc::clone)
    }
}

/// Creates one cluster per name. Names without configuration are logged and
/// counted as errors; the rest proceed.
pub fn create_clusters(
    registry: &ClusterRegistry,
    names: impl IntoIterator<Item = String>,
    configs: &std::collections::BTreeMap<String, ClusterConfig>,
    factory: &StoreFactory,
) -> (Vec<Arc<Cluster>>, usize) {
    let mut clusters = Vec::new();
    let mut errors = 0;
    for name in names {
        let Some(config) = configs.get(&name) else {
            error!("cannot find config for cluster '{name}'");
            errors += 1;
            continue;
        };
        match registry.get_or_create(&name, config, factory) {
            Ok(cluster) => clusters.push(cluster),
            Err(err) => {
                error!("cannot initialize cluster '{name}': {err}");
                errors += 1;
            }
        }
    }
    (clusters, errors)
}
