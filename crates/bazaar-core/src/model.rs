use crate::{Result, StateError};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

pub type Document = Map<String, JsonValue>;

pub const ID_FIELD: &str = "_id";
pub const NAME_FIELD: &str = "name";
pub const SLUG_FIELD: &str = "slug";
pub const STATUS_FIELD: &str = "status";
pub const READ_ONLY_FIELD: &str = "readOnly";
pub const CREATED_AT_FIELD: &str = "createdAt";
pub const UPDATED_AT_FIELD: &str = "updatedAt";

const OID_KEY: &str = "$oid";

static PROCESS_UNIQUE: Lazy<[u8; 5]> = Lazy::new(rand::random);
static OID_COUNTER: Lazy<AtomicU32> =
    Lazy::new(|| AtomicU32::new(rand::random::<u32>() & 0x00ff_ffff));

/// Globally unique, creation-ordered document identifier.
///
/// Layout: 4 bytes of big-endian unix seconds, 5 bytes fixed per process and a
/// 3 byte wrapping counter. Byte order therefore sorts by creation second first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    pub fn new() -> Self {
        Self::with_timestamp(Utc::now().timestamp())
    }

    fn with_timestamp(secs: i64) -> Self {
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&(secs as u32).to_be_bytes());
        bytes[4..9].copy_from_slice(&*PROCESS_UNIQUE);
        let count = OID_COUNTER.fetch_add(1, Ordering::Relaxed) & 0x00ff_ffff;
        bytes[9..].copy_from_slice(&count.to_be_bytes()[1..]);
        Self(bytes)
    }

    pub fn parse_str(s: &str) -> Result<Self> {
        if s.len() != 24 {
            return Err(StateError::Invalid(format!("malformed object id '{s}'")));
        }
        let mut bytes = [0u8; 12];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|_| StateError::Invalid(format!("malformed object id '{s}'")))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        let secs = u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]);
        Utc.timestamp_opt(i64::from(secs), 0)
            .single()
            .unwrap_or_default()
    }

    /// Extended-JSON form used when the id is stored inside a document.
    pub fn to_value(&self) -> JsonValue {
        let mut m = Map::new();
        m.insert(OID_KEY.to_string(), JsonValue::String(self.to_hex()));
        JsonValue::Object(m)
    }

    pub fn from_value(v: &JsonValue) -> Option<Self> {
        match v {
            JsonValue::Object(m) if m.len() == 1 => m
                .get(OID_KEY)
                .and_then(|h| h.as_str())
                .and_then(|h| Self::parse_str(h).ok()),
            _ => None,
        }
    }

    /// Coerces a caller-supplied string into the stored id form. Anything
    /// that is not a 24 hex character string is returned unchanged.
    pub fn coerce(v: &JsonValue) -> JsonValue {
        match v {
            JsonValue::String(s) => match Self::parse_str(s) {
                Ok(oid) => oid.to_value(),
                Err(_) => v.clone(),
            },
            JsonValue::Array(items) => JsonValue::Array(items.iter().map(Self::coerce).collect()),
            _ => v.clone(),
        }
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_str(s)
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        // accept both "hex" and {"$oid": "hex"}
        let v = JsonValue::deserialize(deserializer)?;
        match &v {
            JsonValue::String(s) => Self::parse_str(s).map_err(serde::de::Error::custom),
            other => Self::from_value(other)
                .ok_or_else(|| serde::de::Error::custom("expected an object id")),
        }
    }
}

pub fn now_timestamp() -> JsonValue {
    JsonValue::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
}

pub fn document_id(doc: &Document) -> Option<ObjectId> {
    doc.get(ID_FIELD).and_then(ObjectId::from_value)
}

pub fn is_read_only(doc: &Document) -> bool {
    matches!(doc.get(READ_ONLY_FIELD), Some(JsonValue::Bool(true)))
}

/// Resolves a dotted path. Arrays met on the way fan out over their object
/// elements, so `tags._id` yields every tag id.
pub fn lookup<'a>(doc: &'a Document, path: &str) -> Vec<&'a JsonValue> {
    let mut segments = path.split('.');
    let mut current: Vec<&JsonValue> = match segments.next() {
        Some(first) => doc.get(first).into_iter().collect(),
        None => return Vec::new(),
    };
    for seg in segments {
        let mut next = Vec::new();
        for v in current {
            match v {
                JsonValue::Object(m) => next.extend(m.get(seg)),
                JsonValue::Array(items) => {
                    for item in items {
                        if let JsonValue::Object(m) = item {
                            next.extend(m.get(seg));
                        }
                    }
                }
                _ => {}
            }
        }
        current = next;
    }
    current
}

/// Writes `value` at a dotted path, creating intermediate sub-documents.
pub fn set_path(doc: &mut Document, path: &str, value: JsonValue) -> Result<()> {
    let (parents, leaf) = match path.rsplit_once('.') {
        Some((parents, leaf)) => (Some(parents), leaf),
        None => (None, path),
    };
    let mut target = doc;
    if let Some(parents) = parents {
        for seg in parents.split('.') {
            let slot = target
                .entry(seg.to_string())
                .or_insert_with(|| JsonValue::Object(Map::new()));
            if slot.is_null() {
                *slot = JsonValue::Object(Map::new());
            }
            target = match slot {
                JsonValue::Object(m) => m,
                _ => {
                    return Err(StateError::Invalid(format!(
                        "cannot create field '{leaf}' inside non-object '{seg}'"
                    )))
                }
            };
        }
    }
    target.insert(leaf.to_string(), value);
    Ok(())
}

pub fn remove_path(doc: &mut Document, path: &str) -> Option<JsonValue> {
    match path.split_once('.') {
        None => doc.remove(path),
        Some((head, rest)) => match doc.get_mut(head) {
            Some(JsonValue::Object(m)) => remove_path(m, rest),
            _ => None,
        },
    }
}

/// Copies `_id` plus the listed fields of a parent entity, the shape
/// embedded into dependent documents.
pub fn snapshot_of(parent: &Document, fields: &[String]) -> Document {
    let mut snap = Document::new();
    if let Some(id) = parent.get(ID_FIELD) {
        snap.insert(ID_FIELD.to_string(), id.clone());
    }
    for f in fields {
        if f == ID_FIELD {
            continue;
        }
        if let Some(v) = lookup(parent, f).first() {
            snap.insert(f.clone(), (*v).clone());
        }
    }
    snap
}
