//! Record model for a room's document.
//!
//! A room's document is a flat map of record id to [`Record`]. Ids carry a
//! type prefix (`shape:`, `page:`, `document:`, ...) and every record names
//! its kind in `typeName`. Everything else is kept as an open JSON object so
//! that fields written by newer editors survive a round trip through the
//! server untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Canonical mapping of record id to record.
pub type RecordMap = BTreeMap<String, Record>;

/// Schema version written into freshly created snapshots.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

const DEFAULT_SEQUENCES: &[(&str, u32)] = &[
    ("store", 4),
    ("asset", 1),
    ("camera", 1),
    ("document", 2),
    ("instance", 25),
    ("instance_page_state", 5),
    ("page", 1),
    ("pointer", 1),
    ("shape", 4),
    ("binding", 1),
];

/// Record discriminator (`typeName` on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TypeName {
    Document,
    Page,
    Camera,
    Instance,
    InstancePageState,
    InstancePresence,
    Shape,
    Binding,
    Asset,
    Pointer,
    /// Any discriminator this server does not know about.
    Other(String),
}

impl TypeName {
    pub fn as_str(&self) -> &str {
        match self {
            TypeName::Document => "document",
            TypeName::Page => "page",
            TypeName::Camera => "camera",
            TypeName::Instance => "instance",
            TypeName::InstancePageState => "instance_page_state",
            TypeName::InstancePresence => "instance_presence",
            TypeName::Shape => "shape",
            TypeName::Binding => "binding",
            TypeName::Asset => "asset",
            TypeName::Pointer => "pointer",
            TypeName::Other(other) => other,
        }
    }
}

impl From<String> for TypeName {
    fn from(value: String) -> Self {
        match value.as_str() {
            "document" => TypeName::Document,
            "page" => TypeName::Page,
            "camera" => TypeName::Camera,
            "instance" => TypeName::Instance,
            "instance_page_state" => TypeName::InstancePageState,
            "instance_presence" => TypeName::InstancePresence,
            "shape" => TypeName::Shape,
            "binding" => TypeName::Binding,
            "asset" => TypeName::Asset,
            "pointer" => TypeName::Pointer,
            _ => TypeName::Other(value),
        }
    }
}

impl From<TypeName> for String {
    fn from(value: TypeName) -> Self {
        match value {
            TypeName::Other(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for TypeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One addressable entity in a room (shape, page, camera, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(rename = "typeName")]
    pub type_name: TypeName,
    /// Type-specific payload. For shapes this holds position, rotation,
    /// opacity, the lock flag, `meta` and the nested `props` map.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>, type_name: TypeName) -> Self {
        Self {
            id: id.into(),
            type_name,
            fields: Map::new(),
        }
    }

    /// Builder-style field setter, mostly for tests and fixtures.
    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn is_shape(&self) -> bool {
        self.type_name == TypeName::Shape
    }

    /// Shape kind (`geo`, `draw`, `arrow`, ...) for shape records.
    pub fn shape_kind(&self) -> Option<&str> {
        if !self.is_shape() {
            return None;
        }
        self.fields.get("type").and_then(Value::as_str)
    }

    /// The type prefix encoded in the id (`shape` for `shape:abc`).
    pub fn id_prefix(&self) -> Option<&str> {
        self.id.split_once(':').map(|(prefix, _)| prefix)
    }

    pub fn props(&self) -> Option<&Map<String, Value>> {
        self.fields.get("props").and_then(Value::as_object)
    }

    pub fn meta(&self) -> Option<&Map<String, Value>> {
        self.fields.get("meta").and_then(Value::as_object)
    }
}

/// Structured schema descriptor stored next to the records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaVersion {
    pub schema_version: u32,
    #[serde(default)]
    pub sequences: BTreeMap<String, u32>,
}

impl Default for SchemaVersion {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            sequences: DEFAULT_SEQUENCES
                .iter()
                .map(|(name, version)| (name.to_string(), *version))
                .collect(),
        }
    }
}

/// The authoritative document of a room.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub records: RecordMap,
    #[serde(default)]
    pub schema: SchemaVersion,
}

impl Snapshot {
    /// A fresh document with no records and the current schema.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_records(records: RecordMap) -> Self {
        Self {
            records,
            schema: SchemaVersion::default(),
        }
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn shapes(&self) -> impl Iterator<Item = &Record> {
        self.records.values().filter(|record| record.is_shape())
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
