use crate::model::{lookup, remove_path, Document, ObjectId, ID_FIELD};
use crate::{Result, StateError};
use regex::{Regex, RegexBuilder};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value as JsonValue};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// A single field criterion. The set is closed: anything else a caller sends
/// is rejected while parsing instead of reaching the storage layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "JsonValue", into = "JsonValue")]
pub enum Predicate {
    Eq(JsonValue),
    Ne(JsonValue),
    In(Vec<JsonValue>),
    Range(Range),
    Regex(Pattern),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Range {
    pub gt: Option<JsonValue>,
    pub gte: Option<JsonValue>,
    pub lt: Option<JsonValue>,
    pub lte: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub pattern: String,
    pub case_insensitive: bool,
}

impl Pattern {
    /// Unanchored, case-insensitive substring match on a literal term.
    pub fn contains(term: &str) -> Self {
        Self {
            pattern: regex::escape(term),
            case_insensitive: true,
        }
    }

    fn compile(&self) -> Result<Regex> {
        RegexBuilder::new(&self.pattern)
            .case_insensitive(self.case_insensitive)
            .build()
            .map_err(|e| StateError::Invalid(format!("bad pattern '{}': {e}", self.pattern)))
    }
}

impl TryFrom<JsonValue> for Predicate {
    type Error = StateError;

    fn try_from(v: JsonValue) -> Result<Self> {
        let m = match v {
            JsonValue::Object(m) => m,
            other => return Ok(Predicate::Eq(other)),
        };
        if m.len() == 1 && m.contains_key("$oid") {
            return Ok(Predicate::Eq(JsonValue::Object(m)));
        }
        let operators = m.keys().filter(|k| k.starts_with('$')).count();
        if operators == 0 {
            return Ok(Predicate::Eq(JsonValue::Object(m)));
        }
        if operators != m.len() {
            return Err(StateError::Invalid(
                "operators cannot be mixed with plain fields".into(),
            ));
        }
        if m.contains_key("$regex") {
            return parse_regex(m);
        }
        if m.keys().all(|k| matches!(k.as_str(), "$gt" | "$gte" | "$lt" | "$lte")) {
            let mut range = Range::default();
            for (k, val) in m {
                match k.as_str() {
                    "$gt" => range.gt = Some(val),
                    "$gte" => range.gte = Some(val),
                    "$lt" => range.lt = Some(val),
                    _ => range.lte = Some(val),
                }
            }
            return Ok(Predicate::Range(range));
        }
        let mut it = m.into_iter();
        match (it.next(), it.next()) {
            (Some((op, val)), None) => match (op.as_str(), val) {
                ("$eq", val) => Ok(Predicate::Eq(val)),
                ("$ne", val) => Ok(Predicate::Ne(val)),
                ("$in", JsonValue::Array(items)) => Ok(Predicate::In(items)),
                ("$in", _) => Err(StateError::Invalid("$in expects an array".into())),
                (op, _) => Err(StateError::Invalid(format!("unsupported operator {op}"))),
            },
            _ => Err(StateError::Invalid("unsupported operator combination".into())),
        }
    }
}

fn parse_regex(mut m: Map<String, JsonValue>) -> Result<Predicate> {
    let pattern = match m.remove("$regex") {
        Some(JsonValue::String(s)) => s,
        _ => return Err(StateError::Invalid("$regex expects a string".into())),
    };
    let options = match m.remove("$options") {
        None => String::new(),
        Some(JsonValue::String(s)) => s,
        Some(_) => return Err(StateError::Invalid("$options expects a string".into())),
    };
    if let Some(extra) = m.keys().next() {
        return Err(StateError::Invalid(format!("{extra} cannot be combined with $regex")));
    }
    if options.chars().any(|c| c != 'i') {
        return Err(StateError::Invalid(format!("unsupported regex options '{options}'")));
    }
    let p = Pattern {
        pattern,
        case_insensitive: options.contains('i'),
    };
    p.compile()?;
    Ok(Predicate::Regex(p))
}

impl From<Predicate> for JsonValue {
    fn from(p: Predicate) -> Self {
        let mut m = Map::new();
        match p {
            Predicate::Eq(v) => return v,
            Predicate::Ne(v) => {
                m.insert("$ne".into(), v);
            }
            Predicate::In(items) => {
                m.insert("$in".into(), JsonValue::Array(items));
            }
            Predicate::Range(r) => {
                for (k, v) in [("$gt", r.gt), ("$gte", r.gte), ("$lt", r.lt), ("$lte", r.lte)] {
                    if let Some(v) = v {
                        m.insert(k.into(), v);
                    }
                }
            }
            Predicate::Regex(p) => {
                m.insert("$regex".into(), JsonValue::String(p.pattern));
                if p.case_insensitive {
                    m.insert("$options".into(), JsonValue::String("i".into()));
                }
            }
        }
        JsonValue::Object(m)
    }
}

impl Predicate {
    /// Rewrites id-looking strings into stored id form.
    pub fn coerce_ids(self) -> Self {
        match self {
            Predicate::Eq(v) => Predicate::Eq(ObjectId::coerce(&v)),
            Predicate::Ne(v) => Predicate::Ne(ObjectId::coerce(&v)),
            Predicate::In(items) => Predicate::In(items.iter().map(ObjectId::coerce).collect()),
            other => other,
        }
    }
}

/// Field path -> predicate. Keys are unique and their order is irrelevant.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter(pub BTreeMap<String, Predicate>);

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(path: impl Into<String>, v: JsonValue) -> Self {
        Self::new().with(path, Predicate::Eq(v))
    }

    pub fn by_id(id: &ObjectId) -> Self {
        Self::eq(ID_FIELD, id.to_value())
    }

    pub fn ids_in(path: impl Into<String>, ids: &[ObjectId]) -> Self {
        Self::new().with(path, Predicate::In(ids.iter().map(ObjectId::to_value).collect()))
    }

    pub fn with(mut self, path: impl Into<String>, p: Predicate) -> Self {
        self.0.insert(path.into(), p);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn compile(&self) -> Result<CompiledFilter> {
        let mut clauses = Vec::with_capacity(self.0.len());
        for (path, p) in &self.0 {
            let m = match p {
                Predicate::Eq(v) => Matcher::Eq(v.clone()),
                Predicate::Ne(v) => Matcher::Ne(v.clone()),
                Predicate::In(items) => Matcher::In(items.clone()),
                Predicate::Range(r) => Matcher::Range(r.clone()),
                Predicate::Regex(pat) => Matcher::Regex(pat.compile()?),
            };
            clauses.push((path.clone(), m));
        }
        Ok(CompiledFilter { clauses })
    }
}

#[derive(Debug)]
enum Matcher {
    Eq(JsonValue),
    Ne(JsonValue),
    In(Vec<JsonValue>),
    Range(Range),
    Regex(Regex),
}

/// A filter with its patterns compiled, ready to test documents.
#[derive(Debug)]
pub struct CompiledFilter {
    clauses: Vec<(String, Matcher)>,
}

impl CompiledFilter {
    pub fn matches(&self, doc: &Document) -> bool {
        self.clauses.iter().all(|(path, m)| {
            let found = lookup(doc, path);
            match m {
                Matcher::Eq(v) => any_equal(&found, v),
                Matcher::Ne(v) => !any_equal(&found, v),
                Matcher::In(items) => items.iter().any(|v| any_equal(&found, v)),
                Matcher::Range(r) => scalars(&found).any(|c| in_range(c, r)),
                Matcher::Regex(re) => scalars(&found).any(|c| c.as_str().is_some_and(|s| re.is_match(s))),
            }
        })
    }
}

/// Candidate values plus the elements of any array candidate.
fn scalars<'a>(found: &'a [&'a JsonValue]) -> impl Iterator<Item = &'a JsonValue> + 'a {
    found.iter().flat_map(|v| match v {
        JsonValue::Array(items) => items.iter().collect::<Vec<_>>(),
        other => vec![*other],
    })
}

fn any_equal(found: &[&JsonValue], v: &JsonValue) -> bool {
    if found.is_empty() {
        return v.is_null();
    }
    found.iter().any(|c| values_equal(c, v)) || scalars(found).any(|c| values_equal(c, v))
}

pub fn values_equal(a: &JsonValue, b: &JsonValue) -> bool {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn in_range(c: &JsonValue, r: &Range) -> bool {
    let check = |bound: &Option<JsonValue>, ok: fn(Ordering) -> bool| match bound {
        None => true,
        Some(b) => same_class_cmp(c, b).is_some_and(ok),
    };
    check(&r.gt, |o| o == Ordering::Greater)
        && check(&r.gte, |o| o != Ordering::Less)
        && check(&r.lt, |o| o == Ordering::Less)
        && check(&r.lte, |o| o != Ordering::Greater)
}

/// Range comparisons only hold between values of the same type class.
fn same_class_cmp(a: &JsonValue, b: &JsonValue) -> Option<Ordering> {
    if type_rank(a) != type_rank(b) {
        return None;
    }
    Some(compare_values(a, b))
}

fn type_rank(v: &JsonValue) -> u8 {
    match v {
        JsonValue::Null => 0,
        JsonValue::Number(_) => 1,
        JsonValue::String(_) => 2,
        JsonValue::Object(_) if ObjectId::from_value(v).is_some() => 5,
        JsonValue::Object(_) => 3,
        JsonValue::Array(_) => 4,
        JsonValue::Bool(_) => 6,
    }
}

/// Total order used for sorting: null < numbers < strings < objects <
/// arrays < ids < booleans.
pub fn compare_values(a: &JsonValue, b: &JsonValue) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (JsonValue::String(x), JsonValue::String(y)) => x.cmp(y),
        (JsonValue::Bool(x), JsonValue::Bool(y)) => x.cmp(y),
        (JsonValue::Array(x), JsonValue::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(l, r)| compare_values(l, r))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (JsonValue::Object(_), JsonValue::Object(_)) => {
            match (ObjectId::from_value(a), ObjectId::from_value(b)) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => a.to_string().cmp(&b.to_string()),
            }
        }
        _ => Ordering::Equal,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    fn parse(v: &JsonValue) -> Option<Self> {
        match v {
            JsonValue::Number(n) if n.as_f64() == Some(1.0) => Some(Self::Asc),
            JsonValue::Number(n) if n.as_f64() == Some(-1.0) => Some(Self::Desc),
            JsonValue::String(s) => match s.to_ascii_lowercase().as_str() {
                "asc" | "ascending" => Some(Self::Asc),
                "desc" | "descending" => Some(Self::Desc),
                _ => None,
            },
            _ => None,
        }
    }

    fn as_i32(self) -> i32 {
        match self {
            Self::Asc => 1,
            Self::Desc => -1,
        }
    }
}

/// Ordered field -> direction list; the JSON key order is the sort priority.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SortSpec(pub Vec<(String, SortDirection)>);

impl SortSpec {
    pub fn by(field: impl Into<String>, dir: SortDirection) -> Self {
        Self(vec![(field.into(), dir)])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Ties are broken by `_id` in the direction of the leading key so that
    /// documents stamped within the same millisecond keep creation order.
    pub fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for (field, dir) in &self.0 {
            let o = compare_values(first_or_null(a, field), first_or_null(b, field));
            let o = match dir {
                SortDirection::Asc => o,
                SortDirection::Desc => o.reverse(),
            };
            if o.is_ne() {
                return o;
            }
        }
        let o = compare_values(first_or_null(a, ID_FIELD), first_or_null(b, ID_FIELD));
        match self.0.first() {
            Some((_, SortDirection::Desc)) => o.reverse(),
            _ => o,
        }
    }
}

fn first_or_null<'a>(doc: &'a Document, path: &str) -> &'a JsonValue {
    lookup(doc, path).into_iter().next().unwrap_or(&JsonValue::Null)
}

impl Serialize for SortSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, d) in &self.0 {
            map.serialize_entry(k, &d.as_i32())?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for SortSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct SortVisitor;

        impl<'de> Visitor<'de> for SortVisitor {
            type Value = SortSpec;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of field to 1/-1/\"asc\"/\"desc\"")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<SortSpec, A::Error> {
                let mut keys = Vec::new();
                while let Some((k, v)) = access.next_entry::<String, JsonValue>()? {
                    let dir = SortDirection::parse(&v).ok_or_else(|| {
                        serde::de::Error::custom(format!("bad sort direction for {k}: {v}"))
                    })?;
                    keys.push((k, dir));
                }
                Ok(SortSpec(keys))
            }
        }

        deserializer.deserialize_map(SortVisitor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionMode {
    Include,
    Exclude,
}

/// Projection mask, field -> include flag.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Projection(pub Vec<(String, bool)>);

impl Projection {
    pub fn include<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(fields.into_iter().map(|f| (f.into(), true)).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Inclusion and exclusion cannot be mixed, except for dropping `_id`
    /// from an inclusion mask.
    pub fn mode(&self) -> Result<ProjectionMode> {
        let includes = self.0.iter().any(|(_, inc)| *inc);
        let excludes = self.0.iter().any(|(f, inc)| !*inc && f != ID_FIELD);
        match (includes, excludes) {
            (true, true) => Err(StateError::ProjectionMismatch(
                "cannot mix inclusion and exclusion".into(),
            )),
            (true, false) => Ok(ProjectionMode::Include),
            (false, _) => Ok(ProjectionMode::Exclude),
        }
    }

    pub fn apply(&self, doc: &Document) -> Result<Document> {
        match self.mode()? {
            ProjectionMode::Exclude => {
                let mut out = doc.clone();
                for (f, _) in &self.0 {
                    remove_path(&mut out, f);
                }
                Ok(out)
            }
            ProjectionMode::Include => {
                let mut out = Document::new();
                let drop_id = self.0.iter().any(|(f, inc)| f == ID_FIELD && !*inc);
                if !drop_id {
                    if let Some(id) = doc.get(ID_FIELD) {
                        out.insert(ID_FIELD.to_string(), id.clone());
                    }
                }
                for (f, inc) in &self.0 {
                    if *inc {
                        copy_path(doc, &mut out, f);
                    }
                }
                Ok(out)
            }
        }
    }
}

fn copy_path(src: &Document, dst: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            if let Some(v) = src.get(path) {
                dst.insert(path.to_string(), v.clone());
            }
        }
        Some((head, rest)) => {
            if let Some(JsonValue::Object(inner)) = src.get(head) {
                let slot = dst
                    .entry(head.to_string())
                    .or_insert_with(|| JsonValue::Object(Map::new()));
                if let JsonValue::Object(out) = slot {
                    copy_path(inner, out, rest);
                }
            }
        }
    }
}

impl Serialize for Projection {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, inc) in &self.0 {
            map.serialize_entry(k, &u8::from(*inc))?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Projection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ProjectionVisitor;

        impl<'de> Visitor<'de> for ProjectionVisitor {
            type Value = Projection;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of field to 1/0/true/false")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Projection, A::Error> {
                let mut fields = Vec::new();
                while let Some((k, v)) = access.next_entry::<String, JsonValue>()? {
                    let inc = match v {
                        JsonValue::Bool(b) => b,
                        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
                        other => {
                            return Err(serde::de::Error::custom(format!(
                                "unsupported projection for {k}: {other}"
                            )))
                        }
                    };
                    fields.push((k, inc));
                }
                Ok(Projection(fields))
            }
        }

        deserializer.deserialize_map(ProjectionVisitor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPagination", rename_all = "camelCase")]
pub struct Pagination {
    pub page_size: u64,
    pub current_page: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPagination {
    page_size: u64,
    current_page: u64,
}

impl TryFrom<RawPagination> for Pagination {
    type Error = StateError;

    fn try_from(raw: RawPagination) -> Result<Self> {
        Pagination::new(raw.page_size, raw.current_page)
    }
}

impl Pagination {
    pub fn new(page_size: u64, current_page: u64) -> Result<Self> {
        if page_size == 0 {
            return Err(StateError::Invalid("pageSize must be positive".into()));
        }
        Ok(Self {
            page_size,
            current_page,
        })
    }

    /// Pages start at 0.
    pub fn skip(&self) -> u64 {
        self.page_size.saturating_mul(self.current_page)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<Projection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}
