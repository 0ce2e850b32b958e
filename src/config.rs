//! Configuration model: the main YAML document (with the `upload` section)
//! and the cluster-description YAML document, plus the merged runtime
//! settings handed to the uploader.

use crate::error::Error;
use crate::store::Document;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Reads and deserializes one YAML file.
pub fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, Error> {
    let file = File::open(path).map_err(|source| Error::io("open config file", path, source))?;
    serde_yaml::from_reader(file).map_err(|source| Error::ParseConfig {
        path: path.to_owned(),
        source,
    })
}

/// Converts a YAML subtree into the JSON value the rendering pipeline uses.
pub fn yaml_to_json(value: &serde_yaml::Value) -> Result<Document, Error> {
    serde_json::to_value(value)
        .map_err(|e| Error::InvalidStrategy(format!("unrepresentable YAML value: {e}")))
}

/// Sort direction of one ordering rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// File-ordering configuration of one provider.
#[derive(Clone, Debug, Deserialize)]
pub struct SortingConfig {
    /// Regex whose capture groups become sortable path keys.
    pub file_path_regexp: String,
    /// Ordered rules, each a one-entry map like `{"path.1": asc}` or
    /// `{"stat.st_size": desc}`.
    pub order: Vec<BTreeMap<String, SortDirection>>,
}

/// Config of the `local` polling delivery.
#[derive(Clone, Debug, Deserialize)]
pub struct LocalDeliveryConfig {
    /// Directory to watch.
    pub path: PathBuf,
    /// Glob pattern relative to `path`.
    #[serde(default = "default_glob")]
    pub filename: String,
    /// Whether `**` descends into subdirectories.
    #[serde(default)]
    pub recursive: bool,
    /// Seconds between polling passes.
    #[serde(default = "default_polling_interval")]
    pub polling_interval: f64,
}

fn default_glob() -> String {
    "**".to_owned()
}

fn default_polling_interval() -> f64 {
    5.0
}

/// One provider's section under `upload`.
#[derive(Clone, Debug, Deserialize)]
pub struct ProviderConfig {
    /// Target `database.collection`.
    pub collection: String,
    /// Per MIME type, the ordered column titles and validating regexes.
    /// Either a mapping `title: pattern` or a sequence of one-entry maps.
    pub input: BTreeMap<String, serde_yaml::Value>,
    /// The nested output document with `{{placeholder}}` leaves.
    pub update: serde_yaml::Value,
    /// Per-template configuration objects.
    #[serde(default)]
    pub templates: BTreeMap<String, serde_yaml::Value>,
    /// Delivery transports keyed by name (`local` is known).
    #[serde(default)]
    pub delivery: BTreeMap<String, serde_yaml::Value>,
    /// Optional file ordering rule.
    #[serde(default)]
    pub sorting: Option<SortingConfig>,
    /// Update commands per bulk write.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Percentage of invalid lines within one batch that invalidates the file.
    #[serde(default = "default_threshold")]
    pub threshold_percent_invalid_lines_in_batch: u32,
    /// Whether bulk updates insert missing documents.
    #[serde(default)]
    pub upsert: bool,
    /// Re-upload files previously marked invalid; inherits the top level
    /// when unset.
    #[serde(default)]
    pub reprocess_invalid: Option<bool>,
    /// Re-upload files already processed; inherits the top-level `force`
    /// when unset.
    #[serde(default)]
    pub force_reprocess: Option<bool>,
    /// Keep reading an invalidated file to the end (counting lines) instead
    /// of aborting it.
    #[serde(default = "default_true")]
    pub process_invalid_file_to_end: bool,
    /// Log each invalid line.
    #[serde(default = "default_true")]
    pub log_invalid_lines: bool,
    /// Forced MIME type, overriding extension detection.
    #[serde(default)]
    pub file_type_override: Option<String>,
    /// One-entry map `pattern: replacement` rewriting the full path into the
    /// file name.
    #[serde(default)]
    pub override_filename_from_path: Option<BTreeMap<String, String>>,
    /// Opaque write concern passed to the driver.
    #[serde(default)]
    pub write_concern: Option<serde_yaml::Value>,
}

fn default_batch_size() -> usize {
    1000
}

fn default_threshold() -> u32 {
    80
}

fn default_true() -> bool {
    true
}

/// One database of a cluster.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DatabaseConfig {
    /// Whether sharding is enabled for the database.
    #[serde(default)]
    pub partitioned: bool,
}

/// One sharded collection of a cluster.
#[derive(Clone, Debug, Deserialize)]
pub struct CollectionConfig {
    /// Shard key document.
    pub key: serde_yaml::Value,
    /// Whether the shard key index is unique.
    #[serde(default)]
    pub unique: bool,
}

/// Declared configuration of one cluster.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ClusterConfig {
    /// Router addresses, `host:port`.
    #[serde(default)]
    pub mongos: Vec<String>,
    /// Shard addresses, `host:port`.
    #[serde(default)]
    pub shards: Vec<String>,
    /// Databases by name.
    #[serde(default)]
    pub databases: BTreeMap<String, DatabaseConfig>,
    /// Sharded collections by namespace.
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionConfig>,
    /// Driver settings; inherits the top level when unset.
    #[serde(default)]
    pub mongo_client_settings: Option<serde_yaml::Value>,
    /// Seconds to sleep between batches (rate limiter), 0 disables.
    #[serde(default)]
    pub uploading_delay: Option<f64>,
}

/// The main configuration document.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    /// Provider sections.
    #[serde(default)]
    pub upload: BTreeMap<String, ProviderConfig>,
    /// Extra `extension: mime-type` entries augmenting the built-in map.
    #[serde(default)]
    pub mime_types_map: BTreeMap<String, String>,
    /// Path to the cluster-description YAML.
    #[serde(default)]
    pub cluster_config: Option<PathBuf>,
    /// Default for providers without their own `reprocess_invalid`.
    #[serde(default)]
    pub reprocess_invalid: Option<bool>,
    /// Default for providers without their own `force_reprocess`.
    #[serde(default)]
    pub force: Option<bool>,
    /// Name of the per-cluster metadata collection.
    #[serde(default)]
    pub segments_collection: Option<String>,
    /// Worker pool size; defaults to the number of clusters.
    #[serde(default)]
    pub workers: Option<usize>,
    /// Active providers; defaults to every `upload` key.
    #[serde(default)]
    pub providers: Option<Vec<String>>,
    /// Target clusters; defaults to every configured cluster.
    #[serde(default)]
    pub clusters: Option<Vec<String>>,
    /// Metrics file path; metrics are skipped when unset.
    #[serde(default)]
    pub metrics_file: Option<PathBuf>,
    /// Metric name prefix.
    #[serde(default = "default_metrics_prefix")]
    pub metrics_prefix: String,
    /// Seconds between metric flushes.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: f64,
    /// Seconds to wait for the first files before giving up.
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout: f64,
    /// Driver settings inherited by clusters without their own.
    #[serde(default)]
    pub mongo_client_settings: Option<serde_yaml::Value>,
    /// Default root log level.
    #[serde(default)]
    pub log_level: Option<String>,
}

fn default_metrics_prefix() -> String {
    "segload".to_owned()
}

fn default_flush_interval() -> f64 {
    60.0
}

fn default_wait_timeout() -> f64 {
    10800.0
}

/// Fully merged runtime settings (defaults < config file < CLI).
#[derive(Debug)]
pub struct Settings {
    /// Active provider sections, inheritance already applied.
    pub upload: BTreeMap<String, ProviderConfig>,
    /// Selected clusters, inheritance already applied.
    pub clusters: BTreeMap<String, ClusterConfig>,
    /// Worker pool size; 0 means "number of clusters".
    pub workers: usize,
    /// Name of the per-cluster metadata collection.
    pub segments_collection: String,
    /// Extra mime map entries.
    pub mime_types_map: BTreeMap<String, String>,
    /// Explicit files to reprocess instead of discovery.
    pub reprocess_files: Vec<PathBuf>,
    /// Metrics sink.
    pub metrics_file: Option<PathBuf>,
    /// Metric name prefix.
    pub metrics_prefix: String,
    /// Interval between metric flushes.
    pub flush_interval: Duration,
    /// Timeout waiting for emitters to produce files.
    pub wait_timeout: Duration,
}

impl Settings {
    /// Merges the file config with CLI selections into runtime settings.
    ///
    /// `providers` restricts the active `upload` sections; naming a provider
    /// without a section is an error. Per-provider `reprocess_invalid` and
    /// `force_reprocess` inherit the top level, per-cluster
    /// `mongo_client_settings` likewise.
    pub fn merge(
        mut config: FileConfig,
        mut clusters: BTreeMap<String, ClusterConfig>,
        selected_clusters: Option<Vec<String>>,
        selected_providers: Option<Vec<String>>,
        reprocess_files: Vec<PathBuf>,
    ) -> Result<Self, Error> {
        let selected_providers = selected_providers
            .or_else(|| config.providers.clone())
            .unwrap_or_else(|| config.upload.keys().cloned().collect());
        let mut upload = BTreeMap::new();
        for provider in selected_providers {
            let mut section = config
                .upload
                .remove(&provider)
                .ok_or_else(|| Error::UnknownProvider(provider.clone()))?;
            if section.reprocess_invalid.is_none() {
                section.reprocess_invalid = config.reprocess_invalid;
            }
            if section.force_reprocess.is_none() {
                section.force_reprocess = config.force;
            }
            upload.insert(provider, section);
        }

        if let Some(selected) = selected_clusters.or_else(|| config.clusters.clone()) {
            clusters.retain(|name, _| selected.contains(name));
            for name in selected {
                if !clusters.contains_key(&name) {
                    return Err(Error::UnknownCluster(name));
                }
            }
        }
        for cluster in clusters.values_mut() {
            if cluster.mongo_client_settings.is_none() {
                cluster.mongo_client_settings = config.mongo_client_settings.clone();
            }
        }

        Ok(Self {
            upload,
            clusters,
            workers: config.workers.unwrap_or(0),
            segments_collection: config
                .segments_collection
                .unwrap_or_else(|| "segment_files".to_owned()),
            mime_types_map: config.mime_types_map,
            reprocess_files,
            metrics_file: config.metrics_file,
            metrics_prefix: config.metrics_prefix,
            flush_interval: Duration::from_secs_f64(config.flush_interval),
            wait_timeout: Duration::from_secs_f64(config.wait_timeout),
        })
    }
}
