//! Error types for fleet-orchestration

use thiserror::Error;

/// Result type alias for orchestration operations
pub type Result<T> = std::result::Result<T, Error>;

/// How an error affects the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed or invalid inventory or mixin data
    Configuration,
    /// A required scope, mixin or resource lookup produced nothing
    Resolution,
    /// Provider state not reached yet, or a momentary API failure
    ProviderTransient,
    /// Failure scoped to one resource
    PerResource,
    /// Deliberate stop: checkpoint reached or confirmation declined
    UserAbort,
    /// Anything else that ends the run
    Fatal,
}

/// Orchestration error types
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error(transparent)]
    Config(#[from] fleet_config::ConfigError),

    /// Mixin error
    #[error(transparent)]
    Mixin(#[from] fleet_mixins::Error),

    /// Remote shell error
    #[error(transparent)]
    Shell(#[from] remote_shell::Error),

    /// A provider call failed
    #[error("Provider call '{operation}' failed: {message}")]
    Provider {
        /// Provider operation
        operation: String,
        /// Provider message
        message: String,
        /// Whether another attempt may succeed
        transient: bool,
    },

    /// A retried call never succeeded
    #[error("'{operation}' failed after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        /// Provider operation
        operation: String,
        /// Attempts made
        attempts: u32,
        /// Last failure
        last: Box<Error>,
    },

    /// A wait-for-state loop hit its cap
    #[error("Timed out after {seconds}s waiting for {what}")]
    Timeout {
        /// What was awaited
        what: String,
        /// Cap in seconds
        seconds: u64,
    },

    /// A lookup found nothing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Failure scoped to one resource
    #[error("{resource}: {message}")]
    Resource {
        /// Resource id or fqdn
        resource: String,
        /// What went wrong
        message: String,
    },

    /// Configuration-management enrollment failed
    #[error("Bootstrap of {node} failed: {message}")]
    Bootstrap {
        /// Node name
        node: String,
        /// What went wrong
        message: String,
    },

    /// Every item of a phase failed
    #[error("Phase {index} ({name}) failed for every resource ({failures} failure(s))")]
    PhaseFailed {
        /// Phase number
        index: usize,
        /// Phase name
        name: String,
        /// Number of failed items
        failures: usize,
    },

    /// The operator asked to stop after this phase
    #[error("Stopped after phase {index} ({name}) as requested")]
    Checkpoint {
        /// Phase number
        index: usize,
        /// Phase name
        name: String,
    },

    /// A destructive action was not confirmed
    #[error("Declined: {0}")]
    Declined(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a provider error
    pub fn provider(operation: impl Into<String>, message: impl ToString, transient: bool) -> Self {
        Self::Provider {
            operation: operation.into(),
            message: message.to_string(),
            transient,
        }
    }

    /// Create a per-resource error
    pub fn resource(resource: impl Into<String>, message: impl ToString) -> Self {
        Self::Resource {
            resource: resource.into(),
            message: message.to_string(),
        }
    }

    /// Create a bootstrap error
    pub fn bootstrap(node: impl Into<String>, message: impl ToString) -> Self {
        Self::Bootstrap {
            node: node.into(),
            message: message.to_string(),
        }
    }

    /// Classify for propagation and exit status
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Config(fleet_config::ConfigError::Resolution(_)) => ErrorClass::Resolution,
            Error::Config(_) => ErrorClass::Configuration,
            Error::Mixin(fleet_mixins::Error::Invalid(_))
            | Error::Mixin(fleet_mixins::Error::Parse { .. })
            | Error::Mixin(fleet_mixins::Error::Config(_)) => ErrorClass::Configuration,
            Error::Mixin(_) | Error::Shell(_) => ErrorClass::PerResource,
            Error::Provider { transient: true, .. } => ErrorClass::ProviderTransient,
            Error::Provider { .. } | Error::RetriesExhausted { .. } => ErrorClass::Fatal,
            Error::Timeout { .. } | Error::Resource { .. } | Error::Bootstrap { .. } => {
                ErrorClass::PerResource
            }
            Error::NotFound(_) => ErrorClass::Resolution,
            Error::Checkpoint { .. } | Error::Declined(_) => ErrorClass::UserAbort,
            Error::PhaseFailed { .. } | Error::Serialization(_) | Error::Io(_) => ErrorClass::Fatal,
        }
    }

    /// Whether another attempt may succeed
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::ProviderTransient
    }
}
