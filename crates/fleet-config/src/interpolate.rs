//! `${VAR}` substitution
//!
//! Handles `${name}` and `${name:-default}`. Names are looked up in the
//! supplied variables first, then in the process environment.

use crate::{ConfigError, Result};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").unwrap());

/// Resolve every `${..}` reference in `input`
pub fn interpolate(input: &str, vars: &HashMap<String, String>) -> Result<String> {
    let mut result = input.to_string();
    let mut missing = Vec::new();

    for cap in PATTERN.captures_iter(input) {
        let full_match = &cap[0];
        let expr = &cap[1];

        let (name, default_value) = match expr.find(":-") {
            Some(pos) => (&expr[..pos], Some(&expr[pos + 2..])),
            None => (expr, None),
        };

        if let Some(value) = vars.get(name) {
            result = result.replace(full_match, value);
        } else if let Ok(value) = std::env::var(name) {
            result = result.replace(full_match, &value);
        } else if let Some(default) = default_value {
            result = result.replace(full_match, default);
        } else {
            missing.push(name.to_string());
        }
    }

    if !missing.is_empty() {
        return Err(ConfigError::VarNotFound(missing.join(", ")));
    }

    Ok(result)
}

/// Names referenced by `${..}` in `input` that have no value and no default
pub fn unresolved(input: &str, vars: &HashMap<String, String>) -> Vec<String> {
    PATTERN
        .captures_iter(input)
        .filter_map(|cap| {
            let expr = &cap[1];
            if expr.contains(":-") {
                return None;
            }
            let known = vars.contains_key(expr) || std::env::var(expr).is_ok();
            (!known).then(|| expr.to_string())
        })
        .collect()
}
