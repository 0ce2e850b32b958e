//! The document-store seam.
//!
//! The actual database driver is an external collaborator; workers talk to a
//! cluster through the [`DocumentStore`] capability. The crate bundles an
//! in-memory implementation which backs the test suite and dry runs; a real
//! driver binding implements the same trait.

use crate::error::Error;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

/// A BSON-ish document. Rendered update documents, metadata records and
/// write concerns all travel as JSON values.
pub type Document = Value;

/// A fully qualified collection name, `database.collection`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Namespace {
    /// Database name.
    pub database: String,
    /// Collection name.
    pub collection: String,
}

impl Namespace {
    /// A namespace in the same database with a different collection.
    pub fn with_collection(&self, collection: impl Into<String>) -> Self {
        Self {
            database: self.database.clone(),
            collection: collection.into(),
        }
    }
}

impl FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let mut parts = s.splitn(2, '.');
        match (parts.next(), parts.next()) {
            (Some(database), Some(collection))
                if !database.is_empty() && !collection.is_empty() && !collection.contains('.') =>
            {
                Ok(Self {
                    database: database.to_owned(),
                    collection: collection.to_owned(),
                })
            }
            _ => Err(Error::InvalidNamespace(s.to_owned())),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// One rendered update command for a single row.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateOne {
    /// Selector, `{_id: ...}` for rendered rows.
    pub filter: Document,
    /// The update document (operator-style or replacement).
    pub update: Document,
    /// Insert when no document matches the filter.
    pub upsert: bool,
}

/// Counts reported by an acknowledged bulk write.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BulkWriteResult {
    /// Documents matched by the filters.
    pub matched: u64,
    /// Documents actually changed.
    pub modified: u64,
    /// Documents inserted through upserts.
    pub upserted: u64,
}

/// Capability set of a cluster's database client, as consumed by workers.
pub trait DocumentStore: Send + Sync {
    /// Fetches one document by `_id`.
    fn find_one(&self, ns: &Namespace, id: &str) -> Result<Option<Document>, Error>;

    /// Upserts one document keyed by `_id`.
    fn upsert_one(&self, ns: &Namespace, id: &str, document: Document) -> Result<(), Error>;

    /// Performs an unordered bulk write. `write_concern` is opaque to the
    /// engine and passed through to the driver.
    fn bulk_write(
        &self,
        ns: &Namespace,
        operations: &[UpdateOne],
        write_concern: &Document,
    ) -> Result<BulkWriteResult, Error>;
}

/// In-memory [`DocumentStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, BTreeMap<String, Document>>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one collection, keyed by `_id`, for assertions in tests.
    pub fn collection(&self, ns: &Namespace) -> BTreeMap<String, Document> {
        self.collections
            .lock()
            .expect("memory store poisoned")
            .get(&ns.to_string())
            .cloned()
            .unwrap_or_default()
    }

    /// Number of documents in one collection.
    pub fn len(&self, ns: &Namespace) -> usize {
        self.collection(ns).len()
    }
}

fn id_key(value: &Value) -> Result<String, Error> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(Error::Store(format!("unsupported _id value: {other}"))),
    }
}

/// Applies an update document to an existing document, Mongo-style: operator
/// documents mutate fields, anything else replaces the document wholesale.
fn apply_update(existing: &mut Document, update: &Document, id: &str) -> Result<bool, Error> {
    let update_map = match update.as_object() {
        Some(map) => map,
        None => return Err(Error::Store("update must be a document".to_owned())),
    };
    let is_operator_update = update_map.keys().any(|k| k.starts_with('$'));

    if !is_operator_update {
        let mut replacement = update.clone();
        if let Some(obj) = replacement.as_object_mut() {
            obj.insert("_id".to_owned(), Value::from(id));
        }
        let changed = *existing != replacement;
        *existing = replacement;
        return Ok(changed);
    }

    let mut changed = false;
    for (operator, fields) in update_map {
        let fields = fields
            .as_object()
            .ok_or_else(|| Error::Store(format!("operator {operator} expects a document")))?;
        let target = existing
            .as_object_mut()
            .ok_or_else(|| Error::Store("stored document is not an object".to_owned()))?;
        match operator.as_str() {
            "$set" => {
                for (key, value) in fields {
                    if target.get(key) != Some(value) {
                        target.insert(key.clone(), value.clone());
                        changed = true;
                    }
                }
            }
            "$unset" => {
                for key in fields.keys() {
                    if target.remove(key).is_some() {
                        changed = true;
                    }
                }
            }
            other => return Err(Error::Store(format!("unsupported update operator {other}"))),
        }
    }
    Ok(changed)
}

impl DocumentStore for MemoryStore {
    fn find_one(&self, ns: &Namespace, id: &str) -> Result<Option<Document>, Error> {
        Ok(self
            .collections
            .lock()
            .expect("memory store poisoned")
            .get(&ns.to_string())
            .and_then(|collection| collection.get(id))
            .cloned())
    }

    fn upsert_one(&self, ns: &Namespace, id: &str, document: Document) -> Result<(), Error> {
        self.collections
            .lock()
            .expect("memory store poisoned")
            .entry(ns.to_string())
            .or_default()
            .insert(id.to_owned(), document);
        Ok(())
    }

    fn bulk_write(
        &self,
        ns: &Namespace,
        operations: &[UpdateOne],
        _write_concern: &Document,
    ) -> Result<BulkWriteResult, Error> {
        let mut collections = self.collections.lock().expect("memory store poisoned");
        let collection = collections.entry(ns.to_string()).or_default();
        let mut result = BulkWriteResult::default();

        for op in operations {
            let id_value = op
                .filter
                .get("_id")
                .ok_or_else(|| Error::Store("filter without _id".to_owned()))?;
            let id = id_key(id_value)?;
            if let Some(existing) = collection.get_mut(&id) {
                result.matched += 1;
                if apply_update(existing, &op.update, &id)? {
                    result.modified += 1;
                }
            } else if op.upsert {
                let mut fresh = Document::Object(Map::new());
                if let Some(obj) = fresh.as_object_mut() {
                    obj.insert("_id".to_owned(), Value::from(id.clone()));
                }
                apply_update(&mut fresh, &op.update, &id)?;
                collection.insert(id, fresh);
                result.upserted += 1;
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn namespace_parse() {
        let ns: Namespace = "project.cookies".parse().unwrap();
        assert_eq!(ns.database, "project");
        assert_eq!(ns.collection, "cookies");
        assert_eq!(ns.to_string(), "project.cookies");

        assert!("nodot".parse::<Namespace>().is_err());
        assert!("a.b.c".parse::<Namespace>().is_err());
        assert!(".b".parse::<Namespace>().is_err());
        assert!("a.".parse::<Namespace>().is_err());
    }

    #[test]
    fn bulk_write_counts_upserts_and_matches() {
        let store = MemoryStore::new();
        let ns: Namespace = "db.col".parse().unwrap();
        let wc = json!({});

        let op = |id: &str, segments: &str, upsert: bool| UpdateOne {
            filter: json!({"_id": id}),
            update: json!({"$set": {"lvmp": segments}}),
            upsert,
        };

        let result = store
            .bulk_write(&ns, &[op("a", "1", true), op("b", "2", true)], &wc)
            .unwrap();
        assert_eq!(
            result,
            BulkWriteResult {
                matched: 0,
                modified: 0,
                upserted: 2
            }
        );

        // Same writes again: matched but unchanged.
        let result = store
            .bulk_write(&ns, &[op("a", "1", true), op("b", "2", true)], &wc)
            .unwrap();
        assert_eq!(
            result,
            BulkWriteResult {
                matched: 2,
                modified: 0,
                upserted: 0
            }
        );

        // Changed value: modified.
        let result = store.bulk_write(&ns, &[op("a", "9", true)], &wc).unwrap();
        assert_eq!(
            result,
            BulkWriteResult {
                matched: 1,
                modified: 1,
                upserted: 0
            }
        );

        // No upsert flag: missing document is silently not written.
        let result = store.bulk_write(&ns, &[op("nope", "1", false)], &wc).unwrap();
        assert_eq!(result, BulkWriteResult::default());
        assert_eq!(store.len(&ns), 2);
    }

    #[test]
    fn upsert_one_round_trips_metadata() {
        let store = MemoryStore::new();
        let ns: Namespace = "project.segment_files".parse().unwrap();
        let record = json!({"_id": "file1", "provider": "liveramp", "processed": true});
        store.upsert_one(&ns, "file1", record.clone()).unwrap();
        assert_eq!(store.find_one(&ns, "file1").unwrap(), Some(record));
        assert_eq!(store.find_one(&ns, "other").unwrap(), None);
    }
}
