//! Dotted path navigation over JSON values.
//!
//! Paths are `.`-separated segments; a numeric segment indexes into an array
//! (`items.0.price`). An empty path addresses the value itself.

use serde_json::{Map, Value};

/// Split a dotted path into segments, ignoring empty ones.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}

/// Borrow the value at `path`, or `None` when any segment is missing.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    lookup_segments(value, segments(path))
}

/// Like [`lookup`], over pre-split segments.
pub fn lookup_segments<'a, 'p>(
    value: &'a Value,
    path: impl IntoIterator<Item = &'p str>,
) -> Option<&'a Value> {
    let mut current = value;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write `new` at `path`, creating intermediate objects as needed.
///
/// Returns `false` when an intermediate segment exists but is not an object.
pub fn insert(value: &mut Value, path: &str, new: Value) -> bool {
    let parts: Vec<&str> = segments(path).collect();
    let Some((last, parents)) = parts.split_last() else {
        *value = new;
        return true;
    };

    let mut current = value;
    for segment in parents {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return false;
        };
        current = map
            .entry((*segment).to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    if current.is_null() {
        *current = Value::Object(Map::new());
    }
    match current {
        Value::Object(map) => {
            map.insert((*last).to_owned(), new);
            true
        }
        _ => false,
    }
}

/// Remove and return the value at `path`.
pub fn remove(value: &mut Value, path: &str) -> Option<Value> {
    let parts: Vec<&str> = segments(path).collect();
    let (last, parents) = parts.split_last()?;

    let mut current = value;
    for segment in parents {
        current = match current {
            Value::Object(map) => map.get_mut(*segment)?,
            _ => return None,
        };
    }
    match current {
        Value::Object(map) => map.remove(*last),
        _ => None,
    }
}
