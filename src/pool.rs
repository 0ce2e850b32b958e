//! The worker pool: a fixed set of threads executing (cluster × file)
//! upload jobs, reporting completions over a channel.

use crate::{
    cluster::Cluster,
    counter::JobResult,
    error::Error,
    segfile::SegmentFile,
};
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info};

/// One unit of work: upload one file to one cluster.
#[derive(Debug)]
pub struct Job {
    /// Target cluster.
    pub cluster: Arc<Cluster>,
    /// The file, already bound to its (provider, cluster) pair.
    pub segfile: SegmentFile,
}

/// Fixed-size pool of worker threads fed over a channel. Completions arrive
/// on [`WorkerPool::results`]; the coordinator blocks there instead of
/// polling.
pub struct WorkerPool {
    job_tx: Option<Sender<Job>>,
    result_rx: Receiver<JobResult>,
    handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.handles.len())
            .finish()
    }
}

impl WorkerPool {
    /// Spawns `workers` threads (at least one).
    pub fn new(workers: usize) -> Result<Self, Error> {
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<Job>();
        let (result_tx, result_rx) = crossbeam_channel::unbounded::<JobResult>();
        let mut handles = Vec::new();
        for index in 0..workers.max(1) {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("upload-worker-{index}"))
                .spawn(move || {
                    for job in job_rx {
                        let result = process_file(&job.cluster, job.segfile);
                        if result_tx.send(result).is_err() {
                            return;
                        }
                    }
                })
                .map_err(|source| Error::io("spawn worker thread", "worker pool", source))?;
            handles.push(handle);
        }
        Ok(Self {
            job_tx: Some(job_tx),
            result_rx,
            handles,
        })
    }

    /// Enqueues one job.
    pub fn submit(&self, job: Job) {
        if let Some(tx) = &self.job_tx {
            // Receivers outlive the sender unless the pool is shut down.
            let _ = tx.send(job);
        }
    }

    /// The completion channel.
    pub fn results(&self) -> &Receiver<JobResult> {
        &self.result_rx
    }

    /// Closes the job channel and joins every worker.
    pub fn shutdown(&mut self) {
        self.job_tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The per-job state machine: load metadata, decide skip/process, upload,
/// persist the outcome.
pub fn process_file(cluster: &Cluster, mut segfile: SegmentFile) -> JobResult {
    let name = segfile.name.clone();
    let provider = segfile.provider.clone();
    let cluster_name = cluster.name().to_owned();
    let result = |error_code, counter| JobResult {
        name: name.clone(),
        error_code,
        counter,
        provider: provider.clone(),
        cluster: cluster_name.clone(),
    };

    if let Err(err) = cluster.read_segfile_info(&mut segfile) {
        error!("{cluster_name}: {err}");
        return result(1, None);
    }

    let strategy = Arc::clone(segfile.strategy());
    if segfile.processed && !segfile.invalid && !strategy.force_reprocess {
        info!("{name} is already processed on {cluster_name}, skipping");
        return result(0, None);
    }
    if segfile.invalid && !(strategy.reprocess_invalid || strategy.force_reprocess) {
        info!("{name} was marked invalid on {cluster_name}, skipping");
        return result(0, None);
    }

    segfile.invalid = false;
    segfile.processed = false;
    segfile.counter.reset_run();
    segfile.timer.start();

    match cluster.upload_segfile(&mut segfile) {
        Ok(()) => {
            let error_code = u8::from(segfile.invalid);
            if let Err(err) = cluster.save_segfile_info(&segfile) {
                error!("{cluster_name}: cannot save metadata of {name}: {err}");
                return result(1, Some(segfile.counter.clone()));
            }
            info!(
                "{cluster_name}: {name}. {} {}",
                segfile.counter, segfile.timer
            );
            result(error_code, Some(segfile.counter.clone()))
        }
        Err(err @ Error::InvalidSegmentFile { .. }) => {
            segfile.timer.stop();
            error!("{cluster_name}: {err}");
            if let Err(save_err) = cluster.save_segfile_info(&segfile) {
                error!("{cluster_name}: cannot save metadata of {name}: {save_err}");
            }
            result(1, Some(segfile.counter.clone()))
        }
        Err(err) => {
            // Database or read errors: the file restarts from line one on
            // the next run, nothing is persisted.
            segfile.timer.stop();
            error!("{cluster_name}: uploading {name} failed: {err}");
            result(1, Some(segfile.counter.clone()))
        }
    }
}
