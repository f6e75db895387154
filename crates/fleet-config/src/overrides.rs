//! Command-line overrides
//!
//! Overrides are given as `path=value` pairs separated by `;`:
//!
//! ```text
//! -o '/profiles/ms/count=3;%ami/suffix=-hvm'
//! ```
//!
//! A leading `/` addresses the inventory document, a leading `%` addresses
//! mixin data and is applied after every inventory scope.

use crate::{ConfigError, Result};
use serde_json::{Map, Value};
use std::str::FromStr;

/// Where an override is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideTarget {
    /// The inventory document (`/path`)
    Document,
    /// Mixin data (`%mixin/path`)
    Mixin,
}

/// A single parsed override
#[derive(Debug, Clone, PartialEq)]
pub struct Override {
    /// What the path addresses
    pub target: OverrideTarget,
    /// Path segments below the target root
    pub path: Vec<String>,
    /// Parsed value
    pub value: Value,
    /// Text as given on the command line
    pub raw: String,
}

impl FromStr for Override {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| ConfigError::InvalidOverride {
            raw: raw.to_string(),
            reason: reason.to_string(),
        };

        let (path, value) = raw.trim().split_once('=').ok_or_else(|| invalid("missing '='"))?;
        let path = path.trim_end();
        let value = value.trim_start();

        let (target, rest) = if let Some(rest) = path.strip_prefix('/') {
            (OverrideTarget::Document, rest)
        } else if let Some(rest) = path.strip_prefix('%') {
            (OverrideTarget::Mixin, rest)
        } else {
            return Err(invalid("no leading '/' or '%' in path"));
        };

        let segments: Vec<String> = rest.split('/').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(invalid("empty path segment"));
        }

        Ok(Override {
            target,
            path: segments,
            value: parse_literal(value),
            raw: raw.trim().to_string(),
        })
    }
}

/// Interpret an override value as a literal when possible, else a string
pub fn parse_literal(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::String(String::new());
    }
    match serde_yaml::from_str::<Value>(raw) {
        Ok(value) => value,
        Err(_) => Value::String(raw.to_string()),
    }
}

/// Set `value` at `path` below `base`, creating mappings along the way
pub fn set_path(base: &mut Value, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *base = value;
        return;
    };
    let mut cursor = base;
    for segment in parents {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        let Value::Object(map) = cursor else {
            return;
        };
        cursor = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !cursor.is_object() {
        *cursor = Value::Object(Map::new());
    }
    if let Value::Object(map) = cursor {
        map.insert(last.clone(), value);
    }
}

/// Ordered overrides, applied last and with highest precedence
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverrideSet {
    entries: Vec<Override>,
}

impl OverrideSet {
    /// An empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one `;`-separated override string
    pub fn parse(input: &str) -> Result<Self> {
        let entries = input
            .split(';')
            .filter(|part| !part.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    /// Parse several override strings (e.g. repeated `-o` flags)
    pub fn parse_all<I, S>(inputs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for input in inputs {
            set.entries.extend(Self::parse(input.as_ref())?.entries);
        }
        Ok(set)
    }

    /// Append an override
    pub fn push(&mut self, entry: Override) {
        self.entries.push(entry);
    }

    /// All entries in order
    pub fn entries(&self) -> &[Override] {
        &self.entries
    }

    /// True when no override was given
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply every `/path` override to an inventory document
    pub fn apply_to_document(&self, document: &mut Value) -> Result<()> {
        if !document.is_object() {
            return Err(ConfigError::ValidationError(
                "inventory root must be a mapping".to_string(),
            ));
        }
        for entry in self.of(OverrideTarget::Document) {
            set_path(document, &entry.path, entry.value.clone());
        }
        Ok(())
    }

    /// The `%mixin/path` overrides as a mapping keyed by mixin name
    pub fn mixin_overlay(&self) -> Map<String, Value> {
        let mut overlay = Value::Object(Map::new());
        for entry in self.of(OverrideTarget::Mixin) {
            set_path(&mut overlay, &entry.path, entry.value.clone());
        }
        match overlay {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn of(&self, target: OverrideTarget) -> impl Iterator<Item = &Override> {
        self.entries.iter().filter(move |e| e.target == target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_targets_and_literals() {
        let set = OverrideSet::parse(" /profiles/ms/count = 3 ; %ami/suffix=-hvm;%price=0.05").unwrap();
        let entries = set.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].target, OverrideTarget::Document);
        assert_eq!(entries[0].path, vec!["profiles", "ms", "count"]);
        assert_eq!(entries[0].value, json!(3));
        assert_eq!(entries[1].target, OverrideTarget::Mixin);
        assert_eq!(entries[1].value, json!("-hvm"));
        assert_eq!(entries[2].value, json!(0.05));
    }

    #[test]
    fn test_structured_literals() {
        assert_eq!(parse_literal("[a, b]"), json!(["a", "b"]));
        assert_eq!(parse_literal("true"), json!(true));
        assert_eq!(parse_literal("ami-1234"), json!("ami-1234"));
        assert_eq!(parse_literal(""), json!(""));
    }

    #[test]
    fn test_missing_prefix_rejected() {
        let err = OverrideSet::parse("profiles/ms/count=3").unwrap_err();
        assert!(err.to_string().contains("no leading '/' or '%'"));
        assert!(OverrideSet::parse("/profiles/ms").is_err());
        assert!(OverrideSet::parse("/profiles//count=1").is_err());
    }

    #[test]
    fn test_set_path_creates_intermediates() {
        let mut doc = json!({"profiles": {"ms": "scalar"}});
        set_path(&mut doc, &["profiles".into(), "ms".into(), "count".into()], json!(2));
        set_path(&mut doc, &["stacks".into(), "new".into()], json!({}));
        assert_eq!(doc, json!({"profiles": {"ms": {"count": 2}}, "stacks": {"new": {}}}));
    }

    #[test]
    fn test_mixin_overlay_groups_by_mixin() {
        let set = OverrideSet::parse_all(["%ami/prefix=base-", "%ami/suffix=-x;%volume/ebs/sdf/size=50"]).unwrap();
        assert_eq!(
            set.mixin_overlay(),
            json!({
                "ami": {"prefix": "base-", "suffix": "-x"},
                "volume": {"ebs": {"sdf": {"size": 50}}}
            })
            .as_object()
            .cloned()
            .unwrap()
        );
    }
}
