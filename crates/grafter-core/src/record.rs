//! JSON record helpers shared by the graph model, the engine, and the stores.
//!
//! A [`Record`] is a flat JSON object whose keys are column names (plus, in
//! graph input, relation names holding nested records). Properties whose name
//! starts with `#` are internal markers and are never written to storage.

use std::fmt;

use serde_json::{Map, Number, Value};
use smallvec::SmallVec;

/// A single row or input object.
pub type Record = Map<String, Value>;

/// Declares a symbolic identifier for later reference within the same call.
pub const UID_PROP: &str = "#id";
/// Makes a node a full reference to the node declared with that uid.
pub const UID_REF_PROP: &str = "#ref";
/// Makes a node a reference to an existing stored row by primary key.
pub const DB_REF_PROP: &str = "#dbRef";
/// Key of a query-computed value: `{"$raw": "<expression>"}`.
pub const RAW_PROP: &str = "$raw";

/// Values of an ordered list of columns, e.g. a (possibly composite) id.
pub type KeyTuple = SmallVec<[Value; 2]>;

/// Returns `true` for marker properties that are never persisted.
pub fn is_internal_prop(name: &str) -> bool {
    name.starts_with('#')
}

/// Returns `true` for query-computed values, which always count as changed.
pub fn is_query_value(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.len() == 1 && map.get(RAW_PROP).is_some_and(Value::is_string),
        _ => false,
    }
}

/// Extracts the values of `columns`. Returns `None` when any column is absent
/// or null.
pub fn key_of(record: &Record, columns: &[String]) -> Option<KeyTuple> {
    let mut key = KeyTuple::with_capacity(columns.len());
    for column in columns {
        match record.get(column) {
            None | Some(Value::Null) => return None,
            Some(value) => key.push(value.clone()),
        }
    }
    Some(key)
}

/// Returns `true` when every column in `columns` holds a non-null value.
pub fn has_key(record: &Record, columns: &[String]) -> bool {
    columns
        .iter()
        .all(|c| !matches!(record.get(c), None | Some(Value::Null)))
}

/// Writes `key` into `columns`, position by position.
pub fn set_key(record: &mut Record, columns: &[String], key: &[Value]) {
    for (column, value) in columns.iter().zip(key) {
        record.insert(column.clone(), value.clone());
    }
}

/// Renders a key tuple as its canonical correlation string.
///
/// Strings are used verbatim so that `5` and `"5"` correlate, mirroring the
/// relaxed equality used for change detection.
pub fn key_string(key: &[Value]) -> String {
    key.iter().map(scalar_text).collect::<Vec<_>>().join(",")
}

/// Text form of a value for interpolation and key rendering.
pub fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Copies `record` without internal markers and without `omit` columns.
pub fn storage_payload(record: &Record, omit: &[String]) -> Record {
    record
        .iter()
        .filter(|(k, _)| !is_internal_prop(k) && !omit.iter().any(|o| o == *k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Relaxed equality
// ---------------------------------------------------------------------------

/// Loose equality used for change detection.
///
/// Null equals missing, numbers compare numerically, a number equals a string
/// that parses to the same number, booleans equal 0/1, and composite values
/// compare by deep JSON equivalence.
pub fn loosely_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    let a = a.unwrap_or(&Value::Null);
    let b = b.unwrap_or(&Value::Null);

    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            match (parse_number(s), n.as_f64()) {
                (Some(p), Some(q)) => p == q,
                _ => false,
            }
        }
        (Value::Bool(flag), other) | (other, Value::Bool(flag)) => {
            let as_number = if *flag { 1.0 } else { 0.0 };
            match other {
                Value::Number(n) => n.as_f64() == Some(as_number),
                Value::String(s) => parse_number(s) == Some(as_number),
                _ => false,
            }
        }
        _ => deep_equal(a, b),
    }
}

fn parse_number(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok()
}

fn numbers_equal(x: &Number, y: &Number) -> bool {
    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (x.as_u64(), y.as_u64()) {
        return a == b;
    }
    x.as_f64() == y.as_f64()
}

fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| deep_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| deep_equal(x, y)))
        }
        _ => a == b,
    }
}

// ---------------------------------------------------------------------------
// Paths inside records
// ---------------------------------------------------------------------------

/// One step of a path into nested JSON.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(key) => write!(f, "{key}"),
            PathSegment::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// Renders a path as `children[0].pets[1]`.
pub fn format_path(path: &[PathSegment]) -> String {
    let mut out = String::new();
    for segment in path {
        match segment {
            PathSegment::Key(key) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(key);
            }
            PathSegment::Index(i) => {
                out.push('[');
                out.push_str(&i.to_string());
                out.push(']');
            }
        }
    }
    out
}

/// Looks up a value by a path of segments.
pub fn get_path<'a>(record: &'a Record, path: &[PathSegment]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = match first {
        PathSegment::Key(key) => record.get(key)?,
        PathSegment::Index(_) => return None,
    };
    for segment in rest {
        current = match (segment, current) {
            (PathSegment::Key(key), Value::Object(map)) => map.get(key)?,
            (PathSegment::Index(i), Value::Array(items)) => items.get(*i)?,
            _ => return None,
        };
    }
    Some(current)
}

fn get_path_mut<'a>(record: &'a mut Record, path: &[PathSegment]) -> Option<&'a mut Value> {
    let (first, rest) = path.split_first()?;
    let mut current = match first {
        PathSegment::Key(key) => record.get_mut(key)?,
        PathSegment::Index(_) => return None,
    };
    for segment in rest {
        current = match (segment, current) {
            (PathSegment::Key(key), Value::Object(map)) => map.get_mut(key)?,
            (PathSegment::Index(i), Value::Array(items)) => items.get_mut(*i)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Looks up a value by a dotted property path such as `address.city`.
///
/// Numeric segments index into arrays.
pub fn get_dotted<'a>(record: &'a Record, path: &[String]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = record.get(first)?;
    for segment in rest {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

// ---------------------------------------------------------------------------
// Property references: `#ref{uid.path.to.value}` inside strings
// ---------------------------------------------------------------------------

/// A `#ref{uid.path}` occurrence found inside a string property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyRef {
    /// Where the string lives inside the owning record.
    pub path: Vec<PathSegment>,
    /// The exact literal to substitute, e.g. `#ref{jenny.name}`.
    pub matched: String,
    /// The referenced uid.
    pub uid: String,
    /// Dotted path inside the referenced record.
    pub related_path: Vec<String>,
}

/// Finds every property reference in `record`, recursing into nested plain
/// objects and arrays. Internal marker properties are skipped.
pub fn property_refs(record: &Record) -> Vec<PropertyRef> {
    let mut out = Vec::new();
    let mut path = Vec::new();
    for (key, value) in record {
        if is_internal_prop(key) {
            continue;
        }
        path.push(PathSegment::Key(key.clone()));
        scan_value(value, &mut path, &mut out);
        path.pop();
    }
    out
}

fn scan_value(value: &Value, path: &mut Vec<PathSegment>, out: &mut Vec<PropertyRef>) {
    match value {
        Value::String(s) => {
            for (matched, uid, related) in parse_refs(s) {
                out.push(PropertyRef {
                    path: path.clone(),
                    matched,
                    uid,
                    related_path: related,
                });
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                path.push(PathSegment::Index(i));
                scan_value(item, path, out);
                path.pop();
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                path.push(PathSegment::Key(key.clone()));
                scan_value(item, path, out);
                path.pop();
            }
        }
        _ => {}
    }
}

/// Parses `#ref{uid.a.b}` occurrences. The uid may not contain `.` and the
/// path may not contain `}`.
fn parse_refs(s: &str) -> Vec<(String, String, Vec<String>)> {
    const OPEN: &str = "#ref{";
    let mut found = Vec::new();
    let mut rest = s;

    while let Some(start) = rest.find(OPEN) {
        let after = &rest[start + OPEN.len()..];
        let Some(end) = after.find('}') else {
            break;
        };
        let inner = &after[..end];
        if let Some((uid, path)) = inner.split_once('.') {
            if !uid.is_empty() && !path.is_empty() {
                found.push((
                    format!("{OPEN}{inner}}}"),
                    uid.to_string(),
                    path.split('.').map(str::to_string).collect(),
                ));
            }
        }
        rest = &after[end + 1..];
    }
    found
}

/// Replaces `matched` inside the string at `path` with `replacement`.
///
/// When the whole string equals the matched literal the value is replaced
/// outright (so numbers stay numbers); otherwise the replacement's text form
/// is interpolated. Returns `false` if the path no longer holds a string
/// containing the literal.
pub fn substitute_ref(
    record: &mut Record,
    path: &[PathSegment],
    matched: &str,
    replacement: &Value,
) -> bool {
    let Some(slot) = get_path_mut(record, path) else {
        return false;
    };
    let Value::String(current) = slot else {
        return false;
    };
    if current == matched {
        *slot = replacement.clone();
        true
    } else if current.contains(matched) {
        *current = current.replace(matched, &scalar_text(replacement));
        true
    } else {
        false
    }
}
