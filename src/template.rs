//! Named transforms applied to a parsed row while rendering the output
//! document.
//!
//! A template receives the column map of one line and produces a JSON value.
//! The registry maps template names to constructors; strategies instantiate
//! only the templates their output actually references.

use crate::{duration::human_to_seconds, error::Error};
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::Debug;

/// The parsed columns of one input line, keyed by column title.
pub type Row = BTreeMap<String, String>;

/// A named field transform.
pub trait Template: Send + Sync + Debug {
    /// Produces the value for this template's placeholder from the parsed row.
    fn apply(&self, row: &Row) -> Result<Value, Error>;
}

/// Constructor for a template, taking its (possibly empty) config object.
pub type Constructor = fn(&Value) -> Result<Box<dyn Template>, Error>;

/// Process-wide mapping from template name to constructor.
///
/// Extension happens at compile time through [`Registry::register`]; there is
/// no loading of external template modules at run time.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    map: BTreeMap<String, Constructor>,
}

impl Registry {
    /// A registry holding the built-in templates.
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        registry.register("hash_of_segments", HashOfSegments::construct);
        registry.register("timestamp", Timestamp::construct);
        registry.register("segments_str", SegmentsWithTimestamp::construct);
        registry
    }

    /// Registers (or replaces) a template constructor under `name`.
    pub fn register(&mut self, name: impl Into<String>, constructor: Constructor) {
        self.map.insert(name.into(), constructor);
    }

    /// Whether a template named `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    /// Instantiates the template `name` with `config`.
    pub fn build(&self, name: &str, config: &Value) -> Result<Box<dyn Template>, Error> {
        let constructor = self
            .map
            .get(name)
            .ok_or_else(|| Error::UnknownTemplate(name.to_owned()))?;
        constructor(config)
    }
}

fn config_str<'a>(config: &'a Value, key: &str, default: &'a str) -> &'a str {
    config.get(key).and_then(Value::as_str).unwrap_or(default)
}

fn row_field<'a>(row: &'a Row, field: &str) -> Result<&'a str, Error> {
    row.get(field)
        .map(String::as_str)
        .ok_or_else(|| Error::BadLine(format!("missing field '{field}'")))
}

fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

/// Splits the segments field into tokens and maps each to an expiration
/// timestamp `now + retention`.
///
/// Duplicate tokens collapse to one entry; the last occurrence wins. All
/// occurrences carry the same expiration.
#[derive(Debug)]
pub struct HashOfSegments {
    segment_field_name: String,
    segment_separator: String,
    retention: u64,
    path: Option<String>,
}

impl HashOfSegments {
    fn construct(config: &Value) -> Result<Box<dyn Template>, Error> {
        Ok(Box::new(Self {
            segment_field_name: config_str(config, "segment_field_name", "segments").to_owned(),
            segment_separator: config_str(config, "segment_separator", ",").to_owned(),
            retention: human_to_seconds(config_str(config, "retention", "30D"))?,
            path: config
                .get("path")
                .and_then(Value::as_str)
                .map(str::to_owned),
        }))
    }
}

impl Template for HashOfSegments {
    fn apply(&self, row: &Row) -> Result<Value, Error> {
        let expiration = now_epoch() + self.retention as i64;
        let mut output = Map::new();
        for segment in row_field(row, &self.segment_field_name)?.split(&self.segment_separator) {
            let key = match &self.path {
                Some(path) => format!("{path}.{segment}"),
                None => segment.to_owned(),
            };
            output.insert(key, Value::from(expiration));
        }
        Ok(Value::Object(output))
    }
}

/// The current epoch seconds.
#[derive(Debug)]
pub struct Timestamp;

impl Timestamp {
    fn construct(_config: &Value) -> Result<Box<dyn Template>, Error> {
        Ok(Box::new(Self))
    }
}

impl Template for Timestamp {
    fn apply(&self, _row: &Row) -> Result<Value, Error> {
        Ok(Value::from(now_epoch()))
    }
}

/// Formats the segments field and the current epoch into one string.
///
/// The pattern may reference `{{segments_string}}`, `{{timestamp_separator}}`
/// and `{{timestamp}}`.
#[derive(Debug)]
pub struct SegmentsWithTimestamp {
    segment_field_name: String,
    segment_separator: String,
    replacement_segment_separator: Option<String>,
    timestamp_separator: String,
    string_pattern: String,
}

impl SegmentsWithTimestamp {
    fn construct(config: &Value) -> Result<Box<dyn Template>, Error> {
        Ok(Box::new(Self {
            segment_field_name: config_str(config, "segment_field_name", "segments").to_owned(),
            segment_separator: config_str(config, "segment_separator", ",").to_owned(),
            replacement_segment_separator: config
                .get("replacement_segment_separator")
                .and_then(Value::as_str)
                .map(str::to_owned),
            timestamp_separator: config_str(config, "timestamp_separator", ":").to_owned(),
            string_pattern: config_str(
                config,
                "string_pattern",
                "{{segments_string}}{{timestamp_separator}}{{timestamp}}",
            )
            .to_owned(),
        }))
    }
}

impl Template for SegmentsWithTimestamp {
    fn apply(&self, row: &Row) -> Result<Value, Error> {
        let raw = row_field(row, &self.segment_field_name)?;
        let segments_string = match &self.replacement_segment_separator {
            Some(replacement) => raw
                .split(&self.segment_separator)
                .collect::<Vec<_>>()
                .join(replacement),
            None => raw.to_owned(),
        };
        Ok(Value::from(
            self.string_pattern
                .replace("{{segments_string}}", &segments_string)
                .replace("{{timestamp_separator}}", &self.timestamp_separator)
                .replace("{{timestamp}}", &now_epoch().to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn assert_hash(output: &Value, tokens: &[&str], retention: i64) {
        let map = output.as_object().unwrap();
        assert_eq!(map.len(), tokens.len());
        let expected = now_epoch() + retention;
        for token in tokens {
            let expiration = map[*token].as_i64().unwrap();
            assert!((expiration - expected).abs() <= 1, "{token}: {expiration}");
        }
    }

    #[test]
    fn hash_of_segments_defaults() {
        let registry = Registry::with_builtins();
        let template = registry.build("hash_of_segments", &Value::Null).unwrap();
        let output = template
            .apply(&row(&[("segments", "678269,678272,765488,408098")]))
            .unwrap();
        assert_hash(&output, &["678269", "678272", "765488", "408098"], 2_592_000);
    }

    #[test]
    fn hash_of_segments_configured() {
        let registry = Registry::with_builtins();
        let config = json!({
            "retention": "5D2m4s",
            "segment_separator": ":",
            "segment_field_name": "sg",
            "path": "ab",
        });
        let template = registry.build("hash_of_segments", &config).unwrap();
        let output = template.apply(&row(&[("sg", "2341:2452_4234")])).unwrap();
        assert_hash(&output, &["ab.2341", "ab.2452_4234"], 432_124);
    }

    #[test]
    fn hash_of_segments_missing_field_is_bad_line() {
        let registry = Registry::with_builtins();
        let template = registry.build("hash_of_segments", &Value::Null).unwrap();
        assert!(matches!(
            template.apply(&row(&[("user_id", "u")])),
            Err(Error::BadLine(_))
        ));
    }

    #[test]
    fn timestamp_is_epoch_now() {
        let registry = Registry::with_builtins();
        let template = registry.build("timestamp", &Value::Null).unwrap();
        let before = now_epoch();
        let value = template.apply(&Row::new()).unwrap();
        let after = now_epoch();
        let ts = value.as_i64().unwrap();
        assert!((before..=after).contains(&ts));
    }

    #[test]
    fn segments_str_default_pattern() {
        let registry = Registry::with_builtins();
        let template = registry.build("segments_str", &Value::Null).unwrap();
        let ts = now_epoch();
        let output = template
            .apply(&row(&[("segments", "678269,678272,765488,408098")]))
            .unwrap();
        let expected: Vec<String> = (ts..=ts + 1)
            .map(|t| format!("678269,678272,765488,408098:{t}"))
            .collect();
        assert!(expected.contains(&output.as_str().unwrap().to_owned()));
    }

    #[test]
    fn segments_str_custom_pattern() {
        let registry = Registry::with_builtins();
        let config = json!({
            "replacement_segment_separator": "|",
            "segment_separator": ":",
            "segment_field_name": "sg",
            "string_pattern": "!{{timestamp}}{{timestamp_separator}}{{segments_string}}",
            "timestamp_separator": "#",
        });
        let template = registry.build("segments_str", &config).unwrap();
        let ts = now_epoch();
        let output = template.apply(&row(&[("sg", "2341:2452_4234:234234")])).unwrap();
        let expected: Vec<String> = (ts..=ts + 1)
            .map(|t| format!("!{t}#2341|2452_4234|234234"))
            .collect();
        assert!(expected.contains(&output.as_str().unwrap().to_owned()));
    }

    #[test]
    fn unknown_template_name_errors() {
        let registry = Registry::with_builtins();
        assert!(matches!(
            registry.build("something_odd", &Value::Null),
            Err(Error::UnknownTemplate(name)) if name == "something_odd"
        ));
    }
}
