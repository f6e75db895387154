//! # Fleet Configuration
//!
//! Layered inventory handling for fleet.
//!
//! An inventory describes infrastructure at nested scopes (organization,
//! region, network, environment, subnetwork, stack, profile). This crate
//! parses and validates that document, applies command-line overrides and
//! merges every scope into a single [`EffectiveConfig`] per invocation.

#![warn(missing_docs)]

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub mod interpolate;
pub mod merge;
pub mod overrides;
pub mod parser;
pub mod resolver;
pub mod scope;
pub mod settings;

pub use overrides::{Override, OverrideSet, OverrideTarget};
pub use resolver::{ConfigResolver, EffectiveConfig, RunParams, Selection};
pub use scope::{ScopeLevel, ScopeNode, ScopeTree};
pub use settings::Settings;

/// A single schema violation found while validating a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    /// JSON pointer to the offending value (empty for the root)
    pub path: String,
    /// What was wrong with it
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        write!(f, "[{}] {}", path, self.message)
    }
}

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a configuration file
    #[error("Failed to read {path}: {source}")]
    ReadError {
        /// File that could not be read
        path: PathBuf,
        /// Underlying I/O failure
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML (the message carries line and column)
    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// The document does not satisfy its schema
    #[error("Invalid document ({} problem(s)):\n{}", .0.len(), format_violations(.0))]
    SchemaViolations(Vec<SchemaViolation>),

    /// A command-line override could not be parsed or applied
    #[error("Invalid override '{raw}': {reason}")]
    InvalidOverride {
        /// The override text as given
        raw: String,
        /// Why it was rejected
        reason: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// Variable referenced by `${..}` not found
    #[error("Variable not found: {0}")]
    VarNotFound(String),

    /// A scope or required mixin could not be resolved
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

/// Lookups that produced nothing where something was required
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// The inventory defines no organization
    #[error("No organization defined in the inventory")]
    NoOrganization,

    /// No region contains the network
    #[error("Network '{0}' not found in any region")]
    NetworkNotFound(String),

    /// The network has no such subnetwork
    #[error("Subnetwork '{subnetwork}' not found in network '{network}'")]
    SubnetworkNotFound {
        /// Network that was searched
        network: String,
        /// Subnetwork that was requested
        subnetwork: String,
    },

    /// The environment is not defined by the organization
    #[error("Environment '{0}' not found")]
    EnvironmentNotFound(String),

    /// No such stack
    #[error("Stack '{0}' not found")]
    StackNotFound(String),

    /// No such profile
    #[error("Profile '{0}' not found")]
    ProfileNotFound(String),

    /// A mixin the operation cannot run without is not defined at any scope
    #[error("Required mixin '{0}' is not defined at any applicable scope")]
    MissingMixin(String),

    /// A run parameter the operation needs is missing
    #[error("Required parameter '{0}' is not set")]
    MissingParameter(String),
}

fn format_violations(violations: &[SchemaViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("  {}", v))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;
