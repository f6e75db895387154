//! Inventory parser with schema validation

use crate::{ConfigError, Result, SchemaViolation, scope::ScopeTree};
use serde_json::Value;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

const INVENTORY_SCHEMA: &str = include_str!("../schema/inventory.schema.yaml");

/// Parse an inventory file
pub fn parse_file(path: impl AsRef<Path>) -> Result<ScopeTree> {
    let path = path.as_ref();
    debug!("Loading inventory from {}", path.display());
    let content = read_file(path)?;
    parse_str(&content)
}

/// Parse an inventory from a YAML string
pub fn parse_str(content: &str) -> Result<ScopeTree> {
    let document = parse_yaml(content)?;
    ScopeTree::from_value(document)
}

/// Read a file, keeping the path in the error
pub fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.to_path_buf(),
        source,
    })
}

/// Parse YAML into the shared value model
pub fn parse_yaml(content: &str) -> Result<Value> {
    let value: Value = serde_yaml::from_str(content)?;
    Ok(value)
}

/// The embedded inventory schema
pub fn inventory_schema() -> &'static Value {
    static SCHEMA: OnceLock<Value> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        serde_yaml::from_str(INVENTORY_SCHEMA).unwrap_or(Value::Bool(true))
    })
}

/// Validate a document against the inventory schema, failing with every violation
pub fn validate_document(document: &Value) -> Result<()> {
    let violations = validate_against(inventory_schema(), document);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::SchemaViolations(violations))
    }
}

/// Validate `data` against `schema` and collect all violations
///
/// An unusable schema is reported as a single violation at the root.
pub fn validate_against(schema: &Value, data: &Value) -> Vec<SchemaViolation> {
    match jsonschema::validator_for(schema) {
        Ok(validator) => validator
            .iter_errors(data)
            .map(|e| SchemaViolation {
                path: e.instance_path.to_string(),
                message: e.to_string(),
            })
            .collect(),
        Err(e) => vec![SchemaViolation {
            path: String::new(),
            message: format!("Invalid schema: {}", e),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_schema_parses() {
        assert!(inventory_schema().is_object());
    }

    #[test]
    fn test_yaml_error_carries_location() {
        let err = parse_str("organizations:\n  acme: [unclosed\n").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("line"), "{}", message);
    }

    #[test]
    fn test_all_violations_reported() {
        let yaml = r#"
organizations:
  acme: {}
regions:
  us-east-1:
    networks:
      ame1:
        subnets:
          dev:
            environment: 3
"#;
        match parse_str(yaml) {
            Err(ConfigError::SchemaViolations(violations)) => {
                assert_eq!(violations.len(), 2, "{:?}", violations);
                assert!(violations.iter().any(|v| v.path == "/organizations/acme"));
                assert!(
                    violations
                        .iter()
                        .any(|v| v.path == "/regions/us-east-1/networks/ame1/subnets/dev/environment")
                );
            }
            other => panic!("expected schema violations, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_file_keeps_path() {
        let err = parse_file("/nonexistent/inventory.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/inventory.yaml"));
    }
}
