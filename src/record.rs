use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

const TIMESTAMP_SUFFIX: &str = "!!timestamp";

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("cleartext is not UTF-8")]
    NotUtf8,

    #[error("cleartext is empty")]
    Empty,

    #[error("cleartext is neither JSON nor YAML: {0}")]
    Unparseable(String),

    #[error("document is not a mapping")]
    NotAMapping,

    #[error("record is not sane: {0}")]
    NotSane(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Platform {
    Windows,
    Android,
    Ios,
    Other(String),
}

impl Platform {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "windows" => Platform::Windows,
            "android" => Platform::Android,
            "ios" => Platform::Ios,
            _ => Platform::Other(value.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Platform::Windows => "windows",
            Platform::Android => "android",
            Platform::Ios => "ios",
            Platform::Other(name) => name,
        }
    }

    /// `Windows`, `Android`, ... as used in reply subjects.
    pub fn display_name(&self) -> String {
        let name = self.as_str();
        let mut chars = name.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `(platform, version)` pair that selects transforms and templates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaKey {
    pub platform: Platform,
    pub version: i64,
}

impl SchemaKey {
    pub fn new(platform: Platform, version: i64) -> Self {
        SchemaKey { platform, version }
    }
}

impl fmt::Display for SchemaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.platform, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub platform: Platform,
    pub version: i64,
    pub id: String,
}

impl Metadata {
    pub fn schema(&self) -> SchemaKey {
        SchemaKey::new(self.platform.clone(), self.version)
    }

    /// Extracts and type-checks the required `Metadata` fields.
    pub fn from_tree(tree: &Value) -> Result<Self, RecordError> {
        let metadata = tree
            .get("Metadata")
            .and_then(Value::as_object)
            .ok_or_else(|| RecordError::NotSane("missing Metadata".to_string()))?;

        let platform = match metadata.get("platform") {
            Some(Value::String(p)) if !p.trim().is_empty() => Platform::parse(p.trim()),
            _ => return Err(RecordError::NotSane("Metadata.platform".to_string())),
        };
        let version = metadata
            .get("version")
            .and_then(Value::as_i64)
            .ok_or_else(|| RecordError::NotSane("Metadata.version".to_string()))?;
        let id = match metadata.get("id") {
            Some(Value::String(id)) if !id.trim().is_empty() => id.clone(),
            _ => return Err(RecordError::NotSane("Metadata.id".to_string())),
        };

        Ok(Metadata {
            platform,
            version,
            id,
        })
    }
}

/// Typed view of the fields the pipeline reads from a feedback payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(rename = "Message", default)]
    pub message: Option<FeedbackMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackMessage {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub text_lang_code: Option<String>,
}

/// Known schemas get a typed variant; everything else is kept as-is.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Windows {
        version: i64,
        feedback: Option<Feedback>,
    },
    Android {
        version: i64,
        feedback: Option<Feedback>,
    },
    Ios {
        version: i64,
        feedback: Option<Feedback>,
    },
    Other(Value),
}

/// A decrypted diagnostic payload. The full tree is always retained so
/// unknown fields and unknown schemas round-trip through storage.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticRecord {
    pub metadata: Metadata,
    pub tree: Value,
}

impl DiagnosticRecord {
    /// Parses cleartext as JSON, falling back to YAML, then normalises it.
    pub fn from_cleartext(cleartext: &[u8]) -> Result<Self, RecordError> {
        let text = std::str::from_utf8(cleartext).map_err(|_| RecordError::NotUtf8)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(RecordError::Empty);
        }

        let tree = match serde_json::from_str::<Value>(text) {
            Ok(tree) => tree,
            Err(_) => {
                let yaml: serde_yaml::Value = serde_yaml::from_str(text)
                    .map_err(|e| RecordError::Unparseable(e.to_string()))?;
                yaml_to_json(yaml)
            }
        };

        Self::from_tree(tree)
    }

    pub fn from_tree(mut tree: Value) -> Result<Self, RecordError> {
        if !tree.is_object() {
            return Err(RecordError::NotAMapping);
        }
        if tree.as_object().is_some_and(Map::is_empty) {
            return Err(RecordError::Empty);
        }

        normalize_timestamps(&mut tree);
        coerce_to_string(&mut tree, &["Metadata", "id"]);
        coerce_to_string(&mut tree, &["Feedback", "email"]);
        coerce_to_string(&mut tree, &["Feedback", "Message", "text"]);

        let metadata = Metadata::from_tree(&tree)?;
        Ok(DiagnosticRecord { metadata, tree })
    }

    pub fn schema(&self) -> SchemaKey {
        self.metadata.schema()
    }

    pub fn feedback(&self) -> Option<Feedback> {
        self.tree
            .get("Feedback")
            .and_then(|f| serde_json::from_value(f.clone()).ok())
    }

    pub fn payload(&self) -> Payload {
        let version = self.metadata.version;
        match self.metadata.platform {
            Platform::Windows => Payload::Windows {
                version,
                feedback: self.feedback(),
            },
            Platform::Android => Payload::Android {
                version,
                feedback: self.feedback(),
            },
            Platform::Ios => Payload::Ios {
                version,
                feedback: self.feedback(),
            },
            Platform::Other(_) => Payload::Other(self.tree.clone()),
        }
    }

    /// Feedback that has both a message and a reply address.
    pub fn wants_reply(&self) -> bool {
        self.feedback().is_some_and(|f| {
            f.email.is_some_and(|e| !e.trim().is_empty())
                && f.message
                    .and_then(|m| m.text)
                    .is_some_and(|t| !t.trim().is_empty())
        })
    }

    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(&self.tree).unwrap_or_else(|_| self.tree.to_string())
    }

    /// Re-checks `Metadata` after transformations have run.
    pub fn check_sanity(&self) -> Result<(), RecordError> {
        let metadata = Metadata::from_tree(&self.tree)?;
        if metadata != self.metadata {
            return Err(RecordError::NotSane("Metadata changed during processing".to_string()));
        }
        Ok(())
    }
}

/// Value at `path`, if every step is an object key.
pub fn get_path<'a>(tree: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(tree, |node, key| node.get(*key))
}

pub fn get_path_mut<'a>(tree: &'a mut Value, path: &[&str]) -> Option<&'a mut Value> {
    path.iter().try_fold(tree, |node, key| node.get_mut(*key))
}

fn coerce_to_string(tree: &mut Value, path: &[&str]) {
    if let Some(value) = get_path_mut(tree, path) {
        match value {
            Value::Number(n) => *value = Value::String(n.to_string()),
            Value::Bool(b) => *value = Value::String(b.to_string()),
            _ => {}
        }
    }
}

fn normalize_timestamps(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let keys: Vec<String> = map
                .keys()
                .filter(|k| k.ends_with(TIMESTAMP_SUFFIX))
                .cloned()
                .collect();
            for key in keys {
                let parsed = map
                    .get(&key)
                    .and_then(Value::as_str)
                    .and_then(parse_client_timestamp);
                if let Some(timestamp) = parsed {
                    map.remove(&key);
                    let new_key = key.trim_end_matches(TIMESTAMP_SUFFIX).to_string();
                    map.insert(new_key, Value::String(timestamp.to_rfc3339()));
                }
            }
            for child in map.values_mut() {
                normalize_timestamps(child);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(normalize_timestamps),
        _ => {}
    }
}

fn parse_client_timestamp(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.fZ")
        .ok()
        .map(|naive| naive.and_utc())
}

fn yaml_to_json(value: serde_yaml::Value) -> Value {
    match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                n.as_f64()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
        }
        serde_yaml::Value::String(s) => Value::String(s),
        serde_yaml::Value::Sequence(items) => {
            Value::Array(items.into_iter().map(yaml_to_json).collect())
        }
        serde_yaml::Value::Mapping(mapping) => {
            let mut map = Map::new();
            for (k, v) in mapping {
                let key = match k {
                    serde_yaml::Value::String(s) => s,
                    other => serde_yaml::to_string(&other)
                        .map(|s| s.trim().to_string())
                        .unwrap_or_default(),
                };
                map.insert(key, yaml_to_json(v));
            }
            Value::Object(map)
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(tagged.value),
    }
}
