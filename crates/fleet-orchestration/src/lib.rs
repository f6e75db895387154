//! # Fleet Orchestration
//!
//! Staged resource-lifecycle workflows: create servers and stacks,
//! snapshot and restore their volumes, add volumes to running servers,
//! delete servers and volumes.
//!
//! Every workflow is a fixed sequence of phases. Within a phase the
//! per-server work runs concurrently, bounded by the batch size; a server
//! whose work fails is dropped from later phases and the run carries on
//! as long as one server survives. A checkpoint stops a run cleanly after
//! any phase.
//!
//! The cloud is reached only through [`CloudProvider`], wrapped in a
//! [`RetryingProviderClient`] that retries transient failures and polls
//! for states. Tags are the only record of what belongs to what.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use fleet_orchestration::{Orchestrator, provider::MockProvider, bootstrap::NoopConfigManagement};
//! # use fleet_mixins::{MixinRegistry, Renderer};
//! # use remote_shell::RecordingShell;
//! # fn demo(renderer: Renderer) -> Result<(), fleet_mixins::Error> {
//! let orchestrator = Orchestrator::new(
//!     Arc::new(MockProvider::new()),
//!     Arc::new(RecordingShell::new("ubuntu")),
//!     Arc::new(NoopConfigManagement),
//!     MixinRegistry::with_builtins()?,
//!     renderer,
//! )
//! .with_checkpoint(Some(3));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod bootstrap;
pub mod confirm;
pub mod error;
pub mod image;
pub mod naming;
pub mod phase;
pub mod provider;
pub mod retry;
pub mod state;
pub mod tags;
pub mod workflows;

pub use bootstrap::{BootstrapRequest, ConfigManagement, KnifeCli, NoopConfigManagement, RecordingConfigManagement};
pub use confirm::{AssumeYes, Confirm, ScriptedConfirm};
pub use error::{Error, ErrorClass, Result};
pub use image::{ImageRequest, MatchProfile};
pub use phase::{Phase, PhaseOutcome, PhaseRunner};
pub use provider::{AwsCliProvider, CloudProvider, MockProvider};
pub use retry::{RetryPolicy, RetryingProviderClient, WaitPolicy};
pub use state::{Association, RunState, RunSummary, SummaryEntry};
pub use workflows::{
    Orchestrator,
    create::{CreateOptions, VolumeSource, match_profile},
    inventory::ServerDetails,
    restore::{RestoreOptions, RestoreReport, RestoreTarget},
    snapshot::{SnapshotProgress, SnapshotReport},
    volume_add::VolumeCreateOptions,
    volume_delete::VolumeDeleteOptions,
};
