//! Polling observer for local directories.
//!
//! An observer enumerates files under a directory on a fixed interval and
//! reports each file exactly once, after two consecutive size readings
//! agree. Files whose size is still changing are re-checked on the next
//! pass.

use crate::{config::LocalDeliveryConfig, error::Error};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A set/clear event consumers can block on.
#[derive(Debug, Default)]
pub struct ReadySignal {
    state: Mutex<bool>,
    condvar: Condvar,
}

impl ReadySignal {
    /// A cleared signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the signal and wakes all waiters.
    pub fn set(&self) {
        *self.state.lock().expect("ready signal poisoned") = true;
        self.condvar.notify_all();
    }

    /// Clears the signal.
    pub fn clear(&self) {
        *self.state.lock().expect("ready signal poisoned") = false;
    }

    /// Whether the signal is currently set.
    pub fn is_set(&self) -> bool {
        *self.state.lock().expect("ready signal poisoned")
    }

    /// Blocks until the signal is set or `timeout` elapses; returns the
    /// final state.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("ready signal poisoned");
        while !*state {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => return false,
            };
            let (next, _) = self
                .condvar
                .wait_timeout(state, remaining)
                .expect("ready signal poisoned");
            state = next;
        }
        true
    }
}

/// Receiver of observer events.
pub trait EventHandler: Send + Sync {
    /// The event consumers block on to learn that a polling pass finished.
    fn items_ready(&self) -> &ReadySignal;

    /// A file's size was stable across two readings.
    fn on_file_discovered(&self, path: &Path);

    /// A file's size is still changing; it will be re-checked.
    fn on_modify(&self, path: &Path) {
        warn!(
            "size of {} is changing, probably the file is being uploaded now, waiting for it",
            path.display()
        );
        self.items_ready().clear();
    }
}

/// Enumerates plain files under `path` matching the glob `filename`.
/// Without `recursive`, `**` components degrade to single-level `*`.
pub fn list_files(path: &Path, filename: &str, recursive: bool) -> Vec<PathBuf> {
    let effective = if recursive {
        filename.to_owned()
    } else {
        filename.replace("**", "*")
    };
    let pattern = path.join(effective);
    match glob::glob(&pattern.to_string_lossy()) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .filter(|p| p.is_file())
            .collect(),
        Err(err) => {
            warn!("bad glob pattern {}: {err}", pattern.display());
            Vec::new()
        }
    }
}

/// Watches one local directory from a background thread.
#[derive(Debug)]
pub struct LocalFilesObserver {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LocalFilesObserver {
    /// Starts watching. The configured path must exist.
    pub fn start(
        handler: Arc<dyn EventHandler>,
        config: LocalDeliveryConfig,
    ) -> Result<Self, Error> {
        std::fs::metadata(&config.path)
            .map_err(|source| Error::io("watch directory", &config.path, source))?;
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name(format!("observer-{}", config.path.display()))
            .spawn(move || run(handler, config, thread_stop))
            .map_err(|source| Error::io("spawn observer thread", "observer", source))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stops the polling thread and waits for it to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LocalFilesObserver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sleep_interruptible(stop: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    while !stop.load(Ordering::Relaxed) {
        match deadline.checked_duration_since(Instant::now()) {
            Some(remaining) => std::thread::sleep(remaining.min(Duration::from_millis(100))),
            None => return,
        }
    }
}

fn run(handler: Arc<dyn EventHandler>, config: LocalDeliveryConfig, stop: Arc<AtomicBool>) {
    let interval = Duration::from_secs_f64(config.polling_interval.max(0.1));
    let mut seen: HashSet<PathBuf> = HashSet::new();
    // Files whose size was still changing, with the last observed size.
    let mut pending: HashMap<PathBuf, u64> = HashMap::new();

    while !stop.load(Ordering::Relaxed) {
        handler.items_ready().clear();

        let mut candidates: HashMap<PathBuf, u64> = std::mem::take(&mut pending);
        for path in list_files(&config.path, &config.filename, config.recursive) {
            if seen.contains(&path) || candidates.contains_key(&path) {
                continue;
            }
            match std::fs::metadata(&path) {
                Ok(meta) => {
                    candidates.insert(path, meta.len());
                }
                Err(err) => debug!("cannot stat {}: {err}", path.display()),
            }
        }

        if candidates.is_empty() {
            debug!("no new files in {}", config.path.display());
        } else {
            sleep_interruptible(&stop, interval / 2);
            if stop.load(Ordering::Relaxed) {
                return;
            }
            for (path, recorded) in candidates {
                let current = match std::fs::metadata(&path) {
                    Ok(meta) => meta.len(),
                    // Vanished between passes; forget it.
                    Err(err) => {
                        debug!("cannot stat {}: {err}", path.display());
                        continue;
                    }
                };
                if current == recorded {
                    seen.insert(path.clone());
                    handler.on_file_discovered(&path);
                } else {
                    handler.on_modify(&path);
                    pending.insert(path, current);
                }
            }
        }

        handler.items_ready().set();
        sleep_interruptible(&stop, interval);
    }
}
