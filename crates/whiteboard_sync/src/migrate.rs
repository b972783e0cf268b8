//! Format migration and normalization.
//!
//! Rooms written by older servers are stored in one of several shapes:
//!
//! - an array of wrapped records: `[{ "state": {..record..}, "lastChangedClock": 3 }, ...]`
//! - a legacy object carrying a `documents` list of wrapped records
//! - a bare object of records keyed by id, often missing fields newer
//!   editors expect
//! - the canonical `{ "records": {..}, "schema": {..} }` form
//!
//! [`migrate`] inspects the structure once at the boundary, converts it into a
//! [`Snapshot`], then backfills required per-record fields. It never fails:
//! a keyed record missing its `typeName` takes it from its id prefix
//! (`page:1` is a `page`), other malformed elements are counted and dropped,
//! and anything unrecognizable becomes a fresh empty document.

use serde_json::{Map, Value};

use crate::error::RoomError;
use crate::record::{Record, RecordMap, SchemaVersion, Snapshot, TypeName};

/// Shape kinds whose size lives in `props.w` / `props.h`.
const GEOMETRY_SHAPE_KINDS: &[&str] = &["geo", "frame", "image", "video", "embed", "bookmark"];

/// The structural shape a raw payload was recognized as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// `{ "records": { id: record }, "schema": .. }`
    Canonical,
    /// `{ id: record, .. }` without the `records` wrapper.
    RecordMap,
    /// `[{ "state": record }, ..]`
    WrappedArray,
    /// `{ "documents": [{ "state": record }, ..], "schema": .. }`
    LegacyDocuments,
    Unrecognized,
}

/// Counters describing what a migration had to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationStats {
    /// Elements or records considered.
    pub total: usize,
    /// Records that needed at least one corrective action.
    pub migrated: usize,
    /// Elements dropped for missing an id, a state, or a type.
    pub skipped: usize,
    /// Elements dropped because they were not decodable at all.
    pub errored: usize,
}

impl MigrationStats {
    pub fn is_clean(&self) -> bool {
        self.migrated == 0 && self.skipped == 0 && self.errored == 0
    }
}

/// Result of migrating one raw payload.
#[derive(Debug, Clone)]
pub struct Migration {
    pub snapshot: Snapshot,
    pub format: SourceFormat,
    pub stats: MigrationStats,
}

impl Migration {
    /// Whether the stored form differs from what would be written back, so
    /// the document should be persisted right away.
    pub fn needs_rewrite(&self) -> bool {
        self.format != SourceFormat::Canonical || !self.stats.is_clean()
    }
}

/// Raw payload discriminated by structure.
enum RawDocument {
    Canonical {
        records: Map<String, Value>,
        schema: Option<Value>,
    },
    RecordMap(Map<String, Value>),
    WrappedArray(Vec<Value>),
    LegacyDocuments {
        documents: Vec<Value>,
        schema: Option<Value>,
    },
    Unrecognized,
}

impl RawDocument {
    fn classify(raw: Value) -> Self {
        match raw {
            Value::Array(items) => RawDocument::WrappedArray(items),
            Value::Object(mut map) => {
                if matches!(map.get("records"), Some(Value::Object(_))) {
                    let schema = map.remove("schema");
                    match map.remove("records") {
                        Some(Value::Object(records)) => RawDocument::Canonical { records, schema },
                        _ => RawDocument::Unrecognized,
                    }
                } else if matches!(map.get("documents"), Some(Value::Array(_))) {
                    let schema = map.remove("schema");
                    match map.remove("documents") {
                        Some(Value::Array(documents)) => {
                            RawDocument::LegacyDocuments { documents, schema }
                        }
                        _ => RawDocument::Unrecognized,
                    }
                } else if !map.is_empty()
                    && map.iter().all(|(key, value)| looks_like_record(key, value))
                {
                    RawDocument::RecordMap(map)
                } else {
                    RawDocument::Unrecognized
                }
            }
            _ => RawDocument::Unrecognized,
        }
    }

    fn format(&self) -> SourceFormat {
        match self {
            RawDocument::Canonical { .. } => SourceFormat::Canonical,
            RawDocument::RecordMap(_) => SourceFormat::RecordMap,
            RawDocument::WrappedArray(_) => SourceFormat::WrappedArray,
            RawDocument::LegacyDocuments { .. } => SourceFormat::LegacyDocuments,
            RawDocument::Unrecognized => SourceFormat::Unrecognized,
        }
    }
}

fn looks_like_record(key: &str, value: &Value) -> bool {
    value.as_object().is_some_and(|object| {
        object.get("typeName").is_some_and(Value::is_string) || type_from_id(key).is_some()
    })
}

/// The type encoded in a record id's prefix.
fn type_from_id(id: &str) -> Option<TypeName> {
    match id.split_once(':') {
        Some((prefix, _)) if !prefix.is_empty() => Some(TypeName::from(prefix.to_string())),
        _ => None,
    }
}

/// Why a single element was dropped.
enum Rejected {
    Skipped,
    Errored,
}

/// Convert any JSON payload into a canonical snapshot.
pub fn migrate(raw: Value) -> Migration {
    let raw = RawDocument::classify(raw);
    let format = raw.format();
    let mut stats = MigrationStats::default();

    let (records, schema) = match raw {
        RawDocument::Canonical { records, schema } => {
            (records_from_map(records, &mut stats), schema)
        }
        RawDocument::RecordMap(records) => (records_from_map(records, &mut stats), None),
        RawDocument::WrappedArray(items) => (records_from_wrapped(items, &mut stats), None),
        RawDocument::LegacyDocuments { documents, schema } => {
            (records_from_wrapped(documents, &mut stats), schema)
        }
        RawDocument::Unrecognized => (RecordMap::new(), None),
    };

    let snapshot = Snapshot {
        records,
        schema: schema
            .and_then(|value| serde_json::from_value::<SchemaVersion>(value).ok())
            .unwrap_or_default(),
    };

    Migration {
        snapshot,
        format,
        stats,
    }
}

/// Decode and migrate stored bytes. Fails only when the bytes are not JSON.
pub fn migrate_bytes(bytes: &[u8]) -> Result<Migration, serde_json::Error> {
    let raw: Value = serde_json::from_slice(bytes)?;
    Ok(migrate(raw))
}

/// Extract the records carried by a client payload (a sync frame's `data` or
/// an HTTP merge body). Accepts every stored format; an unrecognizable
/// non-empty payload is rejected instead of being treated as empty.
pub fn extract_partial(raw: Value) -> Result<(RecordMap, MigrationStats), RoomError> {
    let is_empty_object = raw.as_object().is_some_and(Map::is_empty);
    let migration = migrate(raw);
    if migration.format == SourceFormat::Unrecognized && !is_empty_object {
        return Err(RoomError::InvalidPayload(
            "expected a record map, a snapshot, or a list of wrapped records".to_string(),
        ));
    }
    Ok((migration.snapshot.records, migration.stats))
}

fn records_from_map(records: Map<String, Value>, stats: &mut MigrationStats) -> RecordMap {
    let mut out = RecordMap::new();
    for (key, value) in records {
        stats.total += 1;
        admit(&mut out, stats, record_from_value(Some(&key), value));
    }
    out
}

fn records_from_wrapped(items: Vec<Value>, stats: &mut MigrationStats) -> RecordMap {
    let mut out = RecordMap::new();
    for item in items {
        stats.total += 1;
        let state = match item {
            Value::Object(mut wrapper) => match wrapper.remove("state") {
                Some(state @ Value::Object(_)) => state,
                Some(Value::Null) | None => {
                    stats.skipped += 1;
                    continue;
                }
                Some(_) => {
                    stats.errored += 1;
                    continue;
                }
            },
            _ => {
                stats.errored += 1;
                continue;
            }
        };

        admit(&mut out, stats, record_from_value(None, state));
    }
    out
}

/// Backfill and insert a decoded record, counting it once however many
/// corrections it needed.
fn admit(
    out: &mut RecordMap,
    stats: &mut MigrationStats,
    decoded: Result<(Record, bool), Rejected>,
) {
    match decoded {
        Ok((mut record, corrected)) => {
            if backfill(&mut record) || corrected {
                stats.migrated += 1;
            }
            out.insert(record.id.clone(), record);
        }
        Err(Rejected::Skipped) => stats.skipped += 1,
        Err(Rejected::Errored) => stats.errored += 1,
    }
}

/// Build a record from a JSON object. With a `key`, the record id is forced
/// to match it and a missing type is taken from the key's prefix; the
/// returned flag reports whether either needed a correction.
fn record_from_value(key: Option<&str>, value: Value) -> Result<(Record, bool), Rejected> {
    let Value::Object(mut object) = value else {
        return Err(Rejected::Errored);
    };

    let (type_name, inferred) = match object.remove("typeName") {
        Some(Value::String(type_name)) if !type_name.is_empty() => (TypeName::from(type_name), false),
        declared => match key.and_then(type_from_id) {
            Some(type_name) => (type_name, true),
            None if matches!(declared, None | Some(Value::Null | Value::String(_))) => {
                return Err(Rejected::Skipped);
            }
            None => return Err(Rejected::Errored),
        },
    };

    let stored_id = match object.remove("id") {
        Some(Value::String(id)) if !id.is_empty() => Some(id),
        Some(Value::Null) | None => None,
        Some(Value::String(_)) => None,
        Some(_) => return Err(Rejected::Errored),
    };

    let (id, corrected) = match (key, stored_id) {
        (Some(key), Some(id)) if id == key => (id, false),
        (Some(key), _) => (key.to_string(), true),
        (None, Some(id)) => (id, false),
        (None, None) => return Err(Rejected::Skipped),
    };

    Ok((
        Record {
            id,
            type_name,
            fields: object,
        },
        corrected || inferred,
    ))
}

/// Ensure a record carries the fields the editor requires. Returns whether
/// anything was added or moved.
fn backfill(record: &mut Record) -> bool {
    let mut corrected = ensure_object(&mut record.fields, "meta");
    if record.is_shape() {
        corrected |= backfill_shape(record);
    }
    corrected
}

fn backfill_shape(record: &mut Record) -> bool {
    let geometric = record
        .shape_kind()
        .is_some_and(|kind| GEOMETRY_SHAPE_KINDS.contains(&kind));
    let fields = &mut record.fields;

    let mut corrected = false;
    corrected |= ensure_with(fields, "isLocked", Value::is_boolean, Value::Bool(false));
    corrected |= ensure_with(fields, "x", Value::is_number, Value::from(0));
    corrected |= ensure_with(fields, "y", Value::is_number, Value::from(0));
    corrected |= ensure_with(fields, "rotation", Value::is_number, Value::from(0));
    corrected |= ensure_with(fields, "opacity", Value::is_number, Value::from(1));
    corrected |= ensure_object(fields, "props");

    if geometric {
        corrected |= relocate_dimension(fields, &["w", "width"], "w");
        corrected |= relocate_dimension(fields, &["h", "height"], "h");
    }

    corrected
}

fn ensure_with(
    fields: &mut Map<String, Value>,
    key: &str,
    valid: fn(&Value) -> bool,
    default: Value,
) -> bool {
    if fields.get(key).is_some_and(valid) {
        return false;
    }
    fields.insert(key.to_string(), default);
    true
}

fn ensure_object(fields: &mut Map<String, Value>, key: &str) -> bool {
    ensure_with(fields, key, Value::is_object, Value::Object(Map::new()))
}

/// Move a top-level dimension into `props`, keeping an existing props value.
fn relocate_dimension(fields: &mut Map<String, Value>, top_level: &[&str], prop: &str) -> bool {
    let mut moved = None;
    for key in top_level {
        if let Some(value) = fields.remove(*key) {
            moved.get_or_insert(value);
        }
    }
    let Some(value) = moved else {
        return false;
    };

    if let Some(Value::Object(props)) = fields.get_mut("props") {
        props.entry(prop.to_string()).or_insert(value);
    }
    true
}
