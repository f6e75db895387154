//! Exit status of a run

use fleet_config::ConfigError;
use fleet_orchestration::{Error, ErrorClass};

/// Provider, per-resource or any other failure
pub const FAILURE: u8 = 1;
/// Invalid inventory, settings or selection
pub const CONFIGURATION: u8 = 2;
/// Checkpoint reached or confirmation declined
pub const USER_ABORT: u8 = 3;

/// Status for an error class
pub fn class_code(class: ErrorClass) -> u8 {
    match class {
        ErrorClass::Configuration | ErrorClass::Resolution => CONFIGURATION,
        ErrorClass::UserAbort => USER_ABORT,
        ErrorClass::ProviderTransient | ErrorClass::PerResource | ErrorClass::Fatal => FAILURE,
    }
}

/// Status for the error that ended the run
pub fn exit_code(error: &anyhow::Error) -> u8 {
    if let Some(e) = error.downcast_ref::<Error>() {
        return class_code(e.class());
    }
    if error.downcast_ref::<ConfigError>().is_some() {
        return CONFIGURATION;
    }
    match error.downcast_ref::<fleet_mixins::Error>() {
        Some(
            fleet_mixins::Error::Invalid(_)
            | fleet_mixins::Error::Parse { .. }
            | fleet_mixins::Error::Config(_)
            | fleet_mixins::Error::AlreadyRegistered(_),
        ) => CONFIGURATION,
        _ => FAILURE,
    }
}
