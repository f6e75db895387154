//! # Fleet Mixins
//!
//! Mixins are named units of configuration data that may also carry
//! remote behavior: templates rendered per server and installed or run
//! over the remote shell before or after bootstrap.
//!
//! - [`MixinRegistry`] maps names to factories. Built-ins register first,
//!   user directories registered later shadow them.
//! - [`Mixin`] is the capability interface every implementation offers.
//! - [`ExecutionPlan`] records scheduled actions per stage and server and
//!   executes them in registration order.

#![warn(missing_docs)]

use std::path::PathBuf;
use thiserror::Error;

pub mod builtin;
pub mod manifest;
pub mod mixin;
pub mod plan;
pub mod registry;
pub mod render;

pub use manifest::{ActionKind, FileSpec, MixinManifest, Stage};
pub use mixin::{ActionContext, DataMixin, Mixin, MixinCore, ScriptMixin, ServerContext};
pub use plan::{ActionHandle, ExecutionPlan, ScheduledAction};
pub use registry::{MixinFactory, MixinRegistry, MixinSet, MixinSource};
pub use render::Renderer;

/// Mixin error types
#[derive(Debug, Error)]
pub enum Error {
    /// A factory with this name already exists
    #[error("Mixin '{0}' already registered")]
    AlreadyRegistered(String),

    /// One or more mixins carry invalid data
    #[error("Mixin configuration invalid ({} problem(s)):\n{}", .0.len(), .0.join("\n"))]
    Invalid(Vec<String>),

    /// The mixin has no template by that name
    #[error("Template '{template}' not found for mixin '{mixin}'")]
    TemplateNotFound {
        /// Mixin name
        mixin: String,
        /// Template name
        template: String,
    },

    /// Template rendering failed
    #[error("Failed to render '{template}': {reason}")]
    Render {
        /// Template name
        template: String,
        /// Renderer message
        reason: String,
    },

    /// A manifest or data file could not be parsed
    #[error("Failed to parse {path}: {reason}")]
    Parse {
        /// Offending file
        path: PathBuf,
        /// Parser message
        reason: String,
    },

    /// A remote command exited non-zero
    #[error("Command failed with exit status {code} on {target}: {command}")]
    CommandFailed {
        /// Server fqdn
        target: String,
        /// Command line
        command: String,
        /// Exit status
        code: i32,
    },

    /// Remote shell failure
    #[error(transparent)]
    Shell(#[from] remote_shell::Error),

    /// Configuration failure (interpolation, typed data)
    #[error(transparent)]
    Config(#[from] fleet_config::ConfigError),

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a render error
    pub fn render(template: impl Into<String>, reason: impl ToString) -> Self {
        Self::Render {
            template: template.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for mixin operations
pub type Result<T> = std::result::Result<T, Error>;
