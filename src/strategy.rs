//! The declarative mapping from one input row to one bulk-write command.
//!
//! A strategy validates the fields of a line against per-column regexes,
//! renders the configured output tree by substituting `{{placeholder}}`
//! leaves from the row (or from a named template) and splits the rendered
//! document into the filter/update halves of an upsert command.

use crate::{
    config::{yaml_to_json, ProviderConfig},
    error::Error,
    store::{Document, Namespace, UpdateOne},
    template::{Registry, Row, Template},
};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

/// Field separators by supported MIME type.
pub const SEPARATORS: [(&str, char); 2] = [
    ("text/tab-separated-values", '\t'),
    ("text/csv", ','),
];

/// The field separator of a supported MIME type.
pub fn separator_for(mime: &str) -> Option<char> {
    SEPARATORS
        .iter()
        .find(|(known, _)| *known == mime)
        .map(|(_, sep)| *sep)
}

/// Ordered column titles and validators for one MIME type.
pub struct InputSpec {
    /// Column titles, in input order.
    pub titles: Vec<String>,
    patterns: Vec<Regex>,
}

impl fmt::Debug for InputSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputSpec")
            .field("titles", &self.titles)
            .finish()
    }
}

/// Declarative per-provider schema; immutable after construction and shared
/// across workers behind an `Arc`.
pub struct Strategy {
    /// Input MIME types this strategy accepts, in separator-table order.
    pub allowed_types: Vec<String>,
    input: BTreeMap<String, InputSpec>,
    output: Document,
    /// Target collection.
    pub namespace: Namespace,
    templates: BTreeMap<String, Box<dyn Template>>,
    placeholder: Regex,
    /// Update commands per bulk write.
    pub batch_size: usize,
    /// Percentage of invalid lines within one batch that invalidates a file.
    pub threshold_percent_invalid_lines_in_batch: u32,
    /// Whether rendered updates insert missing documents.
    pub upsert: bool,
    /// Re-upload files previously marked invalid.
    pub reprocess_invalid: bool,
    /// Re-upload files already processed.
    pub force_reprocess: bool,
    /// Keep reading an invalidated file to the end.
    pub process_invalid_file_to_end: bool,
    /// Log each invalid line.
    pub log_invalid_lines: bool,
    /// Opaque write concern handed to the driver.
    pub write_concern: Document,
    /// Forced MIME type, overriding extension detection.
    pub file_type_override: Option<String>,
    filename_override: Option<(Regex, String)>,
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strategy")
            .field("allowed_types", &self.allowed_types)
            .field("namespace", &self.namespace)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

/// Collects the placeholder names referenced anywhere in an output tree.
fn used_placeholders(value: &Document, placeholder: &Regex, out: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            for child in map.values() {
                used_placeholders(child, placeholder, out);
            }
        }
        Value::Array(items) => {
            for child in items {
                used_placeholders(child, placeholder, out);
            }
        }
        Value::String(s) => {
            if let Some(captures) = placeholder.captures(s) {
                out.insert(captures[1].to_owned());
            }
        }
        _ => {}
    }
}

fn parse_columns(mime: &str, spec: &serde_yaml::Value) -> Result<InputSpec, Error> {
    let mut titles = Vec::new();
    let mut patterns = Vec::new();
    let mut push = |title: &serde_yaml::Value, pattern: &serde_yaml::Value| -> Result<(), Error> {
        let title = title.as_str().ok_or_else(|| {
            Error::InvalidStrategy(format!("column title under '{mime}' must be a string"))
        })?;
        let pattern = pattern.as_str().ok_or_else(|| {
            Error::InvalidStrategy(format!("pattern of column '{title}' must be a string"))
        })?;
        titles.push(title.to_owned());
        // Anchor at the start, matching the original validator semantics.
        patterns.push(Regex::new(&format!("^(?:{pattern})"))?);
        Ok(())
    };

    match spec {
        // - title: pattern
        serde_yaml::Value::Sequence(entries) => {
            for entry in entries {
                let mapping = entry.as_mapping().filter(|m| m.len() == 1).ok_or_else(|| {
                    Error::InvalidStrategy(format!(
                        "each column under '{mime}' must be a one-entry mapping"
                    ))
                })?;
                for (title, pattern) in mapping {
                    push(title, pattern)?;
                }
            }
        }
        // title: pattern (document order preserved by the YAML mapping)
        serde_yaml::Value::Mapping(mapping) => {
            for (title, pattern) in mapping {
                push(title, pattern)?;
            }
        }
        serde_yaml::Value::Null => {}
        _ => {
            return Err(Error::InvalidStrategy(format!(
                "input section '{mime}' must be a mapping or a sequence"
            )))
        }
    }
    Ok(InputSpec { titles, patterns })
}

impl Strategy {
    /// Builds a strategy from one provider's `upload` section.
    pub fn new(config: &ProviderConfig, registry: &Registry) -> Result<Self, Error> {
        let mut input = BTreeMap::new();
        let mut allowed_types = Vec::new();
        for (mime, _) in SEPARATORS {
            if let Some(spec) = config.input.get(mime) {
                input.insert(mime.to_owned(), parse_columns(mime, spec)?);
                allowed_types.push(mime.to_owned());
            }
        }
        if input.is_empty() {
            let known = SEPARATORS.map(|(mime, _)| mime).join(", ");
            return Err(Error::InvalidStrategy(format!(
                "input must have at least one of type: {known}"
            )));
        }

        let output = yaml_to_json(&config.update)?;
        let output_map = output.as_object().ok_or_else(|| {
            Error::InvalidStrategy("section 'update' must be a mapping".to_owned())
        })?;
        if !output_map.contains_key("_id") {
            return Err(Error::InvalidStrategy(
                "section 'update' must contain '_id'".to_owned(),
            ));
        }

        let placeholder = Regex::new(r"^\{\{(.+)\}\}$")?;
        let mut used = BTreeSet::new();
        used_placeholders(&output, &placeholder, &mut used);

        let mut templates = BTreeMap::new();
        for name in &used {
            if input.values().any(|spec| spec.titles.iter().any(|t| t == name)) {
                continue;
            }
            if !registry.contains(name) {
                return Err(Error::UnknownTemplate(name.clone()));
            }
            let template_config = match config.templates.get(name) {
                Some(yaml) => yaml_to_json(yaml)?,
                None => Value::Null,
            };
            templates.insert(name.clone(), registry.build(name, &template_config)?);
        }

        let filename_override = match &config.override_filename_from_path {
            Some(map) => {
                let (pattern, replacement) = map.iter().next().ok_or_else(|| {
                    Error::InvalidStrategy(
                        "override_filename_from_path must be a one-entry mapping".to_owned(),
                    )
                })?;
                Some((Regex::new(pattern)?, replacement.clone()))
            }
            None => None,
        };

        Ok(Self {
            allowed_types,
            input,
            output,
            namespace: config.collection.parse()?,
            templates,
            placeholder,
            batch_size: config.batch_size.max(1),
            threshold_percent_invalid_lines_in_batch: config
                .threshold_percent_invalid_lines_in_batch,
            upsert: config.upsert,
            reprocess_invalid: config.reprocess_invalid.unwrap_or(false),
            force_reprocess: config.force_reprocess.unwrap_or(false),
            process_invalid_file_to_end: config.process_invalid_file_to_end,
            log_invalid_lines: config.log_invalid_lines,
            write_concern: match &config.write_concern {
                Some(yaml) => yaml_to_json(yaml)?,
                None => Value::Object(Map::new()),
            },
            file_type_override: config.file_type_override.clone(),
            filename_override,
        })
    }

    /// The column spec of one allowed MIME type.
    pub fn input_spec(&self, mime: &str) -> Option<&InputSpec> {
        self.input.get(mime)
    }

    /// Applies the configured filename rewrite to a full path.
    pub fn rewrite_filename(&self, path: &Path) -> Option<String> {
        let (regex, replacement) = self.filename_override.as_ref()?;
        Some(
            regex
                .replace_all(&path.to_string_lossy(), replacement.as_str())
                .into_owned(),
        )
    }

    /// Validates one split line and renders its update command.
    pub fn get_setter(&self, fields: &[&str], mime: &str) -> Result<UpdateOne, Error> {
        let spec = self
            .input_spec(mime)
            .ok_or_else(|| Error::BadLine(format!("no input spec for '{mime}'")))?;
        if fields.len() != spec.titles.len() {
            return Err(Error::BadLine(format!(
                "expected {} fields, got {}",
                spec.titles.len(),
                fields.len()
            )));
        }
        let mut row = Row::new();
        for (index, field) in fields.iter().enumerate() {
            if !spec.patterns[index].is_match(field) {
                return Err(Error::BadLine(format!(
                    "field '{}' does not match column '{}'",
                    field, spec.titles[index]
                )));
            }
            row.insert(spec.titles[index].clone(), (*field).to_owned());
        }

        let rendered = self.render(&self.output, &row)?;
        let mut rendered = match rendered {
            Value::Object(map) => map,
            _ => return Err(Error::InvalidStrategy("rendered update is not a mapping".to_owned())),
        };
        let id = rendered
            .remove("_id")
            .ok_or_else(|| Error::InvalidStrategy("rendered update lost '_id'".to_owned()))?;
        let mut filter = Map::new();
        filter.insert("_id".to_owned(), id);
        Ok(UpdateOne {
            filter: Value::Object(filter),
            update: Value::Object(rendered),
            upsert: self.upsert,
        })
    }

    /// Renders one subtree: mappings and arrays are walked, placeholder
    /// strings resolve against the row first, then against a template.
    fn render(&self, item: &Document, row: &Row) -> Result<Document, Error> {
        match item {
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, child) in map {
                    out.insert(key.clone(), self.render(child, row)?);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => items
                .iter()
                .map(|child| self.render(child, row))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::String(s) => match self.placeholder.captures(s) {
                Some(captures) => {
                    let name = &captures[1];
                    if let Some(value) = row.get(name) {
                        return Ok(Value::from(value.as_str()));
                    }
                    match self.templates.get(name) {
                        Some(template) => template.apply(row),
                        None => Err(Error::UnknownTemplate(name.to_owned())),
                    }
                }
                None => Ok(item.clone()),
            },
            other => Ok(other.clone()),
        }
    }
}
