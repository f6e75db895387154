//! Error types for remote execution

use thiserror::Error;

/// Unified error type for remote execution
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to spawn a local helper process (ssh, scp)
    #[error("failed to spawn {program}: {reason}")]
    SpawnFailed {
        /// Program that could not be started
        program: String,
        /// The reason for the spawn failure
        reason: String,
    },

    /// A transfer to the remote host failed
    #[error("upload of {file} to {host} failed with exit code {code}")]
    UploadFailed {
        /// Local file name
        file: String,
        /// Remote host
        host: String,
        /// Exit code of the transfer
        code: i32,
    },

    /// The remote port did not accept connections in time
    #[error("{address}:{port} not reachable after {seconds}s")]
    Unreachable {
        /// Host address
        address: String,
        /// Port probed
        port: u16,
        /// How long we waited
        seconds: u64,
    },

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a spawn failed error
    pub fn spawn_failed(program: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            program: program.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
