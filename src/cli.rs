//! Command-line entry point of the uploader.

use crate::{
    config::{read_yaml, ClusterConfig, FileConfig, Settings},
    error::Error,
    store::{DocumentStore, MemoryStore},
    template::Registry,
    uploader::Uploader,
};
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Uploads segment files to sharded document-database clusters.
#[derive(Parser, Debug)]
#[command(name = "segload", version, about)]
pub struct Args {
    /// Path to the YAML file containing settings.
    #[arg(long = "config_file", default_value = "/etc/segload/config.yaml")]
    pub config_file: PathBuf,

    /// Path to the YAML file describing clusters; overrides the config file.
    #[arg(long = "cluster_config")]
    pub cluster_config: Option<PathBuf>,

    /// Cluster names to process (default: every configured cluster).
    #[arg(long, num_args = 1..)]
    pub clusters: Option<Vec<String>>,

    /// Providers of segments to process (default: every 'upload' section).
    #[arg(long, num_args = 1..)]
    pub providers: Option<Vec<String>>,

    /// Amount of workers (default: number of clusters).
    #[arg(long)]
    pub workers: Option<usize>,

    /// Reprocess files which were previously marked invalid.
    #[arg(long = "reprocess_invalid", overrides_with = "no_reprocess_invalid")]
    pub reprocess_invalid: bool,
    /// Negation of --reprocess_invalid.
    #[arg(long = "no-reprocess_invalid", hide = true)]
    pub no_reprocess_invalid: bool,

    /// Upload exactly these files, skipping discovery.
    #[arg(long = "reprocess_file", num_args = 1..)]
    pub reprocess_file: Vec<PathBuf>,

    /// Re-upload files even when they are already processed.
    #[arg(long, overrides_with = "no_force")]
    pub force: bool,
    /// Negation of --force.
    #[arg(long = "no-force", hide = true)]
    pub no_force: bool,

    /// Name of the per-cluster metadata collection.
    #[arg(long = "segments_collection")]
    pub segments_collection: Option<String>,

    /// File to append graphite-style metric lines to.
    #[arg(long = "metrics_file")]
    pub metrics_file: Option<PathBuf>,

    /// Prefix of emitted metric names.
    #[arg(long = "metrics_prefix")]
    pub metrics_prefix: Option<String>,

    /// Level of the root logger, e.g. 'info' or 'debug'.
    #[arg(long = "log_level", default_value = "info")]
    pub log_level: String,
}

/// Resolves a `--flag` / `--no-flag` pair: `None` leaves the config value.
fn cli_bool(set: bool, unset: bool) -> Option<bool> {
    match (set, unset) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

/// The default store factory: an embedded in-memory store per cluster. Real
/// deployments plug a driver-backed [`DocumentStore`] in instead.
pub fn memory_store_factory() -> Box<crate::cluster::StoreFactory> {
    Box::new(|name, _config| {
        info!("using embedded in-memory store for cluster '{name}'");
        Ok(Arc::new(MemoryStore::new()) as Arc<dyn DocumentStore>)
    })
}

/// Loads configuration, applies CLI overrides and runs the uploader.
/// Returns the process exit code.
pub fn run(args: Args) -> Result<i32, Error> {
    let mut config: FileConfig = if args.config_file.is_file() {
        info!("reading config file {}", args.config_file.display());
        read_yaml(&args.config_file)?
    } else {
        warn!("cannot find config file {}", args.config_file.display());
        FileConfig::default()
    };

    let cluster_config_path = args.cluster_config.or_else(|| config.cluster_config.take());
    let clusters: BTreeMap<String, ClusterConfig> = match &cluster_config_path {
        Some(path) => {
            info!("reading cluster config {}", path.display());
            read_yaml(path)?
        }
        None => BTreeMap::new(),
    };

    if let Some(value) = cli_bool(args.reprocess_invalid, args.no_reprocess_invalid) {
        config.reprocess_invalid = Some(value);
    }
    if let Some(value) = cli_bool(args.force, args.no_force) {
        config.force = Some(value);
    }
    if args.workers.is_some() {
        config.workers = args.workers;
    }
    if args.segments_collection.is_some() {
        config.segments_collection = args.segments_collection;
    }
    if args.metrics_file.is_some() {
        config.metrics_file = args.metrics_file;
    }
    if let Some(prefix) = args.metrics_prefix {
        config.metrics_prefix = prefix;
    }

    let settings = Settings::merge(
        config,
        clusters,
        args.clusters,
        args.providers,
        args.reprocess_file,
    )?;

    let mut uploader = Uploader::new(settings, Registry::with_builtins(), memory_store_factory());
    uploader.run()
}
