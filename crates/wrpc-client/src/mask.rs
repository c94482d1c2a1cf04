// ABOUTME: Field-mask derivation for partial updates.
// ABOUTME: Names the explicitly-set fields of a payload as lower-camel-case dotted paths.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::value_kind;
use crate::error::MaskError;

/// Ordered set of unique dotted field paths, sent as `{"paths": [...]}`.
///
/// An empty mask is meaningful: it asks the backend to change nothing, which
/// is different from sending no mask at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMask {
    pub paths: Vec<String>,
}

impl FieldMask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.iter().any(|p| p == path)
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    /// Append `path` unless already present. Returns whether it was added.
    pub fn push(&mut self, path: impl Into<String>) -> bool {
        let path = path.into();
        if self.contains(&path) {
            return false;
        }
        self.paths.push(path);
        true
    }

    /// Drop every entry equal to `path`.
    pub fn remove(&mut self, path: &str) {
        self.paths.retain(|p| p != path);
    }
}

impl FromIterator<String> for FieldMask {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut mask = FieldMask::new();
        for path in iter {
            mask.push(path);
        }
        mask
    }
}

/// Convert a serialized field name to lower camel case.
///
/// `snake_case`, `PascalCase` and `kebab-case` all map to `lowerCamel`; names
/// already in lower camel case pass through. A leading acronym is lowercased
/// as a unit: `ID` becomes `id` and `HTTPPort` becomes `httpPort`.
pub fn to_lower_camel(name: &str) -> String {
    let chars: Vec<char> = name
        .trim_start_matches(|c: char| c == '_' || c == '-')
        .chars()
        .collect();

    // the last capital of a run followed by lowercase starts the next word
    let run = chars.iter().take_while(|c| c.is_uppercase()).count();
    let lower_until = match chars.get(run) {
        Some(next) if run > 1 && next.is_lowercase() => run - 1,
        _ => run.max(1),
    };

    let mut out = String::with_capacity(chars.len());
    let mut upper_next = false;
    for (i, c) in chars.into_iter().enumerate() {
        if c == '_' || c == '-' {
            upper_next = true;
            continue;
        }
        if i < lower_until {
            out.extend(c.to_lowercase());
        } else if upper_next {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        upper_next = false;
    }
    out
}

/// `foo` and `foo.` both become `foo.`; empty stays empty.
fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('.') {
        prefix.to_string()
    } else {
        format!("{prefix}.")
    }
}

/// Mask naming every field of `payload` that serializes to a non-null value.
///
/// Unset fields are the ones serde leaves out (`skip_serializing_if`) or writes
/// as `null`. Paths are sorted so the result is deterministic.
pub fn derive_mask<T: Serialize + ?Sized>(payload: &T, prefix: &str) -> Result<FieldMask, MaskError> {
    let value = serde_json::to_value(payload)?;
    let fields = match value {
        Value::Object(fields) => fields,
        other => return Err(MaskError::NotAnObject(value_kind(&other))),
    };

    let prefix = normalize_prefix(prefix);
    let mut paths: Vec<String> = fields
        .into_iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(key, _)| format!("{prefix}{}", to_lower_camel(&key)))
        .collect();
    paths.sort();

    Ok(paths.into_iter().collect())
}

/// Replace the bare embedded-field entry of `outer` with the fields of `inner`.
///
/// The entry equal to `inner_prefix` minus its trailing `.` is removed and
/// `derive_mask(inner, inner_prefix)` is appended, so the result never holds
/// both the bare name and one of its children.
pub fn merge_inner_mask<T: Serialize + ?Sized>(
    inner: &T,
    mut outer: FieldMask,
    inner_prefix: &str,
) -> Result<FieldMask, MaskError> {
    let prefix = normalize_prefix(inner_prefix);
    let bare = prefix.trim_end_matches('.');
    outer.remove(bare);

    for path in derive_mask(inner, &prefix)?.paths {
        outer.push(path);
    }
    Ok(outer)
}
