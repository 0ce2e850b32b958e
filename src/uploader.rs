//! The coordinator: wires emitters, clusters, the worker pool and the
//! shared progress/metric state, and drives files through the pipeline.
//!
//! Dispatch invariant: at most one in-flight job per (provider, cluster)
//! pair, FIFO within a pair. Cross-pair parallelism is bounded only by the
//! pool size.

use crate::{
    cluster::{create_clusters, Cluster, ClusterRegistry, StoreFactory},
    config::Settings,
    counter::{Counter, Timer},
    emitter::FileEmitter,
    error::Error,
    pool::{Job, WorkerPool},
    segfile::{MimeMap, SegmentFile},
    shared::{MetricsTable, ProgressRing},
    strategy::Strategy,
    template::Registry,
};
use crossbeam_channel::RecvTimeoutError;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Tick between coordinator housekeeping rounds while jobs are in flight.
const RESULT_TICK: Duration = Duration::from_millis(500);

/// Poll step while waiting for emitters to finish a pass.
const EMITTER_POLL: Duration = Duration::from_millis(500);

/// Blocks until emitters signal readiness: all of them, or any one of them
/// when `atleast_one` is set. Expiry of `timeout` is fatal.
pub fn wait_for_items(
    emitters: &[FileEmitter],
    timeout: Duration,
    atleast_one: bool,
) -> Result<(), Error> {
    let start = Instant::now();
    loop {
        let mut any = false;
        let mut all = true;
        for emitter in emitters {
            if emitter.items_ready().is_set() {
                any = true;
            } else {
                all = false;
            }
        }
        if (atleast_one && any) || all {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(Error::Timeout);
        }
        std::thread::sleep(EMITTER_POLL);
    }
}

struct PairState {
    cluster: Arc<Cluster>,
    busy: bool,
    queue: VecDeque<SegmentFile>,
}

/// Mutable state of one run.
struct RunState<'a> {
    settings: &'a Settings,
    buffer: BTreeMap<(String, String), PairState>,
    pool: WorkerPool,
    counter: Counter,
    timer: Timer,
    metrics: MetricsTable,
    ring: Arc<ProgressRing>,
    in_flight: usize,
}

impl RunState<'_> {
    /// Enqueues one discovered file for every target cluster of its
    /// provider, allocating its progress slot.
    fn stage(&mut self, mut file: SegmentFile) {
        file.set_slot(Arc::new(self.ring.allocate()));
        for ((provider, cluster_name), pair) in &mut self.buffer {
            if *provider == file.provider {
                let cell = self.metrics.cell(provider, cluster_name);
                pair.queue.push_back(file.for_pair(cell));
            }
        }
    }

    /// Pulls every ready file out of the emitters. Returns how many files
    /// were staged.
    fn ingest(&mut self, emitters: &[FileEmitter]) -> Result<usize, Error> {
        let mut staged = 0;
        for emitter in emitters {
            for file in emitter.drain()? {
                self.stage(file);
                staged += 1;
            }
        }
        Ok(staged)
    }

    /// Starts the next job of every idle pair.
    fn dispatch(&mut self) {
        for pair in self.buffer.values_mut() {
            if pair.busy {
                continue;
            }
            if let Some(segfile) = pair.queue.pop_front() {
                pair.busy = true;
                self.in_flight += 1;
                self.pool.submit(Job {
                    cluster: Arc::clone(&pair.cluster),
                    segfile,
                });
            }
        }
    }

    /// Appends metric lines when the flush interval elapsed (or when
    /// `force`d at the end of the run).
    fn flush_metrics(&mut self, force: bool) {
        let Some(path) = &self.settings.metrics_file else {
            return;
        };
        let metrics = &self.metrics;
        let prefix = &self.settings.metrics_prefix;
        let flush = || {
            if let Err(err) = metrics.flush(prefix, path) {
                warn!("cannot flush metrics: {err}");
            }
        };
        if force {
            flush();
        } else {
            self.timer
                .execute("flush_metrics", self.settings.flush_interval, flush);
        }
    }

    fn queued(&self) -> usize {
        self.buffer.values().map(|pair| pair.queue.len()).sum()
    }

    /// The coordinator loop: ingest, dispatch, collect completions; exits
    /// once the emitters have nothing more to deliver and every pair is
    /// idle.
    fn drive(&mut self, emitters: &[FileEmitter]) -> Result<(), Error> {
        loop {
            self.ingest(emitters)?;
            self.dispatch();
            self.flush_metrics(false);

            if self.in_flight > 0 {
                match self.pool.results().recv_timeout(RESULT_TICK) {
                    Ok(result) => {
                        self.counter.count_result(&result);
                        let key = (result.provider.clone(), result.cluster.clone());
                        if let Some(pair) = self.buffer.get_mut(&key) {
                            pair.busy = false;
                        }
                        self.in_flight -= 1;
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                continue;
            }

            if self.queued() > 0 {
                continue;
            }
            if emitters.is_empty() {
                break;
            }
            // Idle: let every observer finish a pass, then look again.
            wait_for_items(emitters, self.settings.wait_timeout, false)?;
            if self.ingest(emitters)? == 0 {
                break;
            }
        }
        Ok(())
    }
}

/// Wires configuration, clusters, emitters and the pool into one run.
pub struct Uploader {
    settings: Settings,
    templates: Registry,
    store_factory: Box<StoreFactory>,
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("settings", &self.settings)
            .finish()
    }
}

impl Uploader {
    /// An uploader over merged settings. The store factory builds the
    /// database client of each cluster.
    pub fn new(settings: Settings, templates: Registry, store_factory: Box<StoreFactory>) -> Self {
        Self {
            settings,
            templates,
            store_factory,
        }
    }

    fn mime_map(&self) -> MimeMap {
        let mut mime_map = MimeMap::with_defaults();
        mime_map.extend(
            self.settings
                .mime_types_map
                .iter()
                .map(|(ext, mime)| (ext.as_str(), mime.as_str())),
        );
        mime_map
    }

    /// Runs to completion and computes the exit code: cluster-construction
    /// failures plus invalid files plus emitter errors.
    pub fn run(&mut self) -> Result<i32, Error> {
        let started = Instant::now();
        if self.settings.upload.is_empty() {
            error!("uploading isn't configured, fill in section 'upload' and check --providers");
            return Ok(1);
        }
        if self.settings.clusters.is_empty() {
            error!("no clusters configured, provide cluster_config");
            return Ok(1);
        }

        let registry = ClusterRegistry::new(self.settings.segments_collection.clone());
        let (clusters, mut errors) = create_clusters(
            &registry,
            self.settings.clusters.keys().cloned().collect::<Vec<_>>(),
            &self.settings.clusters,
            &*self.store_factory,
        );
        if clusters.is_empty() {
            error!("no clusters could be initialized");
            return Ok(errors.max(1) as i32);
        }

        let mime_map = self.mime_map();
        let cluster_names: Vec<&str> = clusters.iter().map(|c| c.name()).collect();
        let metrics = MetricsTable::new(
            self.settings.upload.keys().map(String::as_str),
            &cluster_names,
        );
        let workers = if self.settings.workers > 0 {
            self.settings.workers
        } else {
            clusters.len()
        };

        let mut buffer = BTreeMap::new();
        for provider in self.settings.upload.keys() {
            for cluster in &clusters {
                buffer.insert(
                    (provider.clone(), cluster.name().to_owned()),
                    PairState {
                        cluster: Arc::clone(cluster),
                        busy: false,
                        queue: VecDeque::new(),
                    },
                );
            }
        }

        let mut timer = Timer::new();
        timer.touch("flush_metrics");
        let mut state = RunState {
            settings: &self.settings,
            buffer,
            pool: WorkerPool::new(workers)?,
            counter: Counter::new(),
            timer,
            metrics,
            ring: ProgressRing::new(),
            in_flight: 0,
        };

        if self.settings.reprocess_files.is_empty() {
            let mut emitters = Vec::new();
            for (provider, config) in &self.settings.upload {
                emitters.push(FileEmitter::new(
                    provider.clone(),
                    config,
                    &self.templates,
                    mime_map.clone(),
                )?);
            }
            wait_for_items(&emitters, self.settings.wait_timeout, true)?;
            state.drive(&emitters)?;
            for emitter in &mut emitters {
                emitter.stop();
                if emitter.has_errors() {
                    errors += 1;
                }
            }
        } else {
            errors += self.stage_reprocess_files(&mut state, &mime_map)?;
            state.drive(&[])?;
        }

        errors += state.counter.invalid();
        state.flush_metrics(true);
        state.pool.shutdown();
        info!("{}", state.counter);
        info!("total working time is {:.2}s", started.elapsed().as_secs_f64());
        Ok(errors as i32)
    }

    /// Reprocess mode: explicit paths, no discovery. Requires exactly one
    /// active provider. Missing files are counted as errors; the rest
    /// proceed.
    fn stage_reprocess_files(
        &self,
        state: &mut RunState<'_>,
        mime_map: &MimeMap,
    ) -> Result<usize, Error> {
        let mut providers = self.settings.upload.iter();
        let (provider, config) = match (providers.next(), providers.next()) {
            (Some(section), None) => section,
            _ => {
                return Err(Error::Usage(
                    "reprocessing explicit files requires exactly one provider".to_owned(),
                ))
            }
        };
        let strategy = Arc::new(Strategy::new(config, &self.templates)?);
        let mut errors = 0;
        for path in &self.settings.reprocess_files {
            match SegmentFile::new(path, provider.clone(), Arc::clone(&strategy), mime_map) {
                Ok(segfile) => {
                    info!("reprocessing {}", path.display());
                    state.stage(segfile);
                }
                Err(err) => {
                    error!("{err}");
                    errors += 1;
                }
            }
        }
        Ok(errors)
    }
}
