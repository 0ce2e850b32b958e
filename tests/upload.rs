//! End-to-end runs of the uploader against temp directories and in-memory
//! stores: discovery, upload, resume skipping, invalid files and metrics.

use flate2::{write::GzEncoder, Compression};
use segload::cluster::StoreFactory;
use segload::config::{ClusterConfig, FileConfig, Settings};
use segload::store::{DocumentStore, MemoryStore, Namespace};
use segload::template::Registry;
use segload::uploader::Uploader;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const CLUSTERS: [&str; 2] = ["aws-va", "gce-eu"];

fn cluster_stores() -> HashMap<String, Arc<MemoryStore>> {
    CLUSTERS
        .iter()
        .map(|name| ((*name).to_owned(), Arc::new(MemoryStore::new())))
        .collect()
}

fn factory_for(stores: &HashMap<String, Arc<MemoryStore>>) -> Box<StoreFactory> {
    let captured = stores.clone();
    Box::new(move |name, _| Ok(Arc::clone(&captured[name]) as Arc<dyn DocumentStore>))
}

/// The provider config used throughout; `extra` entries land next to the
/// other strategy knobs.
fn config_yaml(watch_dir: &Path, metrics_file: Option<&Path>, extra: &[&str]) -> String {
    let metrics = metrics_file.map_or_else(String::new, |path| {
        format!(
            "metrics_file: {}\nmetrics_prefix: oneiros.segload\n",
            path.display()
        )
    });
    let extra: String = extra
        .iter()
        .map(|line| format!("    {line}\n"))
        .collect();
    format!(
        "{metrics}upload:\n\
         \x20 liveramp:\n\
         \x20   collection: project.uuidh\n\
         \x20   input:\n\
         \x20     text/tab-separated-values:\n\
         \x20       - user_id: '^[a-f0-9]{{8}}-?[a-f0-9]{{4}}-?4[a-f0-9]{{3}}-?[89ab][a-f0-9]{{3}}-?[a-f0-9]{{12}}$'\n\
         \x20       - segments: '^[0-9a-z_]+(?:,[0-9a-z_]+)*$'\n\
         \x20   update:\n\
         \x20     _id: '{{{{user_id}}}}'\n\
         \x20     $set:\n\
         \x20       lvmp: '{{{{segments}}}}'\n\
         \x20   upsert: true\n\
         {extra}\
         \x20   delivery:\n\
         \x20     local:\n\
         \x20       path: {}\n\
         \x20       polling_interval: 0.2\n",
        watch_dir.display()
    )
}

fn settings_from(yaml: &str, reprocess: Vec<PathBuf>) -> Settings {
    let mut config: FileConfig = serde_yaml::from_str(yaml).unwrap();
    config.wait_timeout = 60.0;
    let clusters: BTreeMap<String, ClusterConfig> = CLUSTERS
        .iter()
        .map(|name| ((*name).to_owned(), ClusterConfig::default()))
        .collect();
    Settings::merge(config, clusters, None, None, reprocess).unwrap()
}

fn run_uploader(yaml: &str, stores: &HashMap<String, Arc<MemoryStore>>) -> i32 {
    let mut uploader = Uploader::new(
        settings_from(yaml, Vec::new()),
        Registry::with_builtins(),
        factory_for(stores),
    );
    uploader.run().unwrap()
}

fn ns(raw: &str) -> Namespace {
    raw.parse().unwrap()
}

#[test]
fn discovers_uploads_and_resumes() {
    let watch = TempDir::new().unwrap();
    let metrics_dir = TempDir::new().unwrap();
    let metrics_path = metrics_dir.path().join("metrics.out");

    // One plain file and one gzip-framed file.
    std::fs::write(
        watch.path().join("audience_a.tsv"),
        "f35ac18d-de62-42d1-97b5-ac6136187451\t1995228346\n\
         0100e0ba-5c29-4d2c-8a23-0c2e76bc38df\t1000812376",
    )
    .unwrap();
    let mut encoder = GzEncoder::new(
        std::fs::File::create(watch.path().join("audience_b.tsv.gz")).unwrap(),
        Compression::default(),
    );
    encoder
        .write_all(b"9c0ffee0-aaaa-4bbb-8ccc-000000000001\t42,43")
        .unwrap();
    encoder.finish().unwrap();

    let yaml = config_yaml(watch.path(), Some(&metrics_path), &[]);
    let stores = cluster_stores();
    assert_eq!(run_uploader(&yaml, &stores), 0);

    for cluster in CLUSTERS {
        let store = &stores[cluster];
        let data = store.collection(&ns("project.uuidh"));
        assert_eq!(data.len(), 3, "cluster {cluster}");
        assert_eq!(
            data["f35ac18d-de62-42d1-97b5-ac6136187451"],
            json!({"_id": "f35ac18d-de62-42d1-97b5-ac6136187451", "lvmp": "1995228346"})
        );
        assert_eq!(
            data["9c0ffee0-aaaa-4bbb-8ccc-000000000001"],
            json!({"_id": "9c0ffee0-aaaa-4bbb-8ccc-000000000001", "lvmp": "42,43"})
        );

        let meta = store.collection(&ns("project.segment_files"));
        assert_eq!(meta.len(), 2);
        let record = &meta["audience_a"];
        assert_eq!(record["provider"], "liveramp");
        assert_eq!(record["processed"], true);
        assert_eq!(record["invalid"], false);
        assert_eq!(record["counter"]["line_total"], 2);
        assert_eq!(record["counter"]["upserted"], 2);
        assert_eq!(record["type"], json!(["text/tab-separated-values", null]));
        assert_eq!(
            meta["audience_b"]["type"],
            json!(["text/tab-separated-values", "gzip"])
        );
    }

    let metrics = std::fs::read_to_string(&metrics_path).unwrap();
    assert!(metrics
        .lines()
        .any(|l| l.starts_with("oneiros.segload.liveramp.aws-va.lines_processed 3 ")));
    assert!(metrics
        .lines()
        .any(|l| l.starts_with("oneiros.segload.liveramp.gce-eu.uploaded 3 ")));

    // A second run over the same directory skips everything.
    assert_eq!(run_uploader(&yaml, &stores), 0);
    for cluster in CLUSTERS {
        // No re-upload happened: upserted counters in metadata unchanged.
        let meta = stores[cluster].collection(&ns("project.segment_files"));
        assert_eq!(meta["audience_a"]["counter"]["upserted"], 2);
    }
}

#[test]
fn invalid_file_raises_the_exit_code() {
    let watch = TempDir::new().unwrap();
    // 4 of 5 lines in the first window are invalid: over the threshold.
    std::fs::write(
        watch.path().join("broken.tsv"),
        "f35ac18d-de62-42d1-97b5-ac6136187451\t1995228346\nx\nx\nx\nx\n",
    )
    .unwrap();

    let yaml = config_yaml(watch.path(), None, &["batch_size: 5"]);
    let stores = cluster_stores();
    // One invalid file = exit code 1, regardless of the number of clusters.
    assert_eq!(run_uploader(&yaml, &stores), 1);

    for cluster in CLUSTERS {
        let meta = stores[cluster].collection(&ns("project.segment_files"));
        assert_eq!(meta["broken"]["invalid"], true);
        assert_eq!(meta["broken"]["processed"], true);
        assert_eq!(meta["broken"]["counter"]["line_invalid"], 4);
        assert_eq!(meta["broken"]["counter"]["line_total"], 5);
    }

    // Without reprocess_invalid the file is skipped on the next run.
    assert_eq!(run_uploader(&yaml, &stores), 0);

    // With reprocess_invalid it is picked up again (and stays invalid).
    let yaml = config_yaml(
        watch.path(),
        None,
        &["batch_size: 5", "reprocess_invalid: true"],
    );
    assert_eq!(run_uploader(&yaml, &stores), 1);
}

#[test]
fn wrong_file_type_counts_as_emitter_error() {
    let watch = TempDir::new().unwrap();
    std::fs::write(watch.path().join("strange.csv"), "a,b\n").unwrap();

    let yaml = config_yaml(watch.path(), None, &[]);
    let stores = cluster_stores();
    assert_eq!(run_uploader(&yaml, &stores), 1);
    for cluster in CLUSTERS {
        assert_eq!(stores[cluster].len(&ns("project.uuidh")), 0);
    }
}

#[test]
fn force_reprocess_uploads_processed_files_again() {
    let watch = TempDir::new().unwrap();
    std::fs::write(
        watch.path().join("audience.tsv"),
        "f35ac18d-de62-42d1-97b5-ac6136187451\t1995228346",
    )
    .unwrap();

    let yaml = config_yaml(watch.path(), None, &[]);
    let stores = cluster_stores();
    assert_eq!(run_uploader(&yaml, &stores), 0);

    let forced = config_yaml(watch.path(), None, &["force_reprocess: true"]);
    assert_eq!(run_uploader(&forced, &stores), 0);

    for cluster in CLUSTERS {
        let meta = stores[cluster].collection(&ns("project.segment_files"));
        // The second run matched the documents already written by the first.
        assert_eq!(meta["audience"]["counter"]["matched"], 1);
        assert_eq!(meta["audience"]["counter"]["upserted"], 0);
    }
}

#[test]
fn reprocess_file_mode_uploads_exactly_the_given_paths() {
    let data_dir = TempDir::new().unwrap();
    let watch = TempDir::new().unwrap();
    let path = data_dir.path().join("handpicked.tsv");
    std::fs::write(&path, "f35ac18d-de62-42d1-97b5-ac6136187451\t1995228346").unwrap();

    let yaml = config_yaml(watch.path(), None, &[]);
    let stores = cluster_stores();
    let mut uploader = Uploader::new(
        settings_from(&yaml, vec![path]),
        Registry::with_builtins(),
        factory_for(&stores),
    );
    assert_eq!(uploader.run().unwrap(), 0);

    for cluster in CLUSTERS {
        assert_eq!(stores[cluster].len(&ns("project.uuidh")), 1);
        let meta = stores[cluster].collection(&ns("project.segment_files"));
        assert_eq!(meta["handpicked"]["processed"], true);
    }
}
