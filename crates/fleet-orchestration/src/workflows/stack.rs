//! Stack creation: one create run per profile of the stack

use super::{
    Orchestrator,
    create::{CREATE_REQUIRED_MIXINS, CreateOptions},
};
use crate::{Error, Result, state::Association};
use fleet_config::{ConfigResolver, EffectiveConfig, ResolutionError, Selection};
use futures::future::join_all;
use tracing::{info, warn};

/// Effective configuration of every profile of the selected stack
///
/// A count given by the stack wins over the profile's own.
pub fn stack_configs(resolver: &ConfigResolver, selection: &Selection) -> Result<Vec<EffectiveConfig>> {
    let stack = selection
        .stack
        .as_deref()
        .ok_or_else(|| fleet_config::ConfigError::from(ResolutionError::MissingParameter("stack".to_string())))?;
    let profiles = resolver.tree().stack_profiles(stack)?;
    if profiles.is_empty() {
        return Err(Error::NotFound(format!("profiles of stack {}", stack)));
    }
    profiles
        .into_iter()
        .map(|(profile, count)| {
            let mut config = resolver.resolve(&selection.clone().with_profile(&profile), CREATE_REQUIRED_MIXINS)?;
            if count.is_some() {
                config.params.count = count;
            }
            Ok(config)
        })
        .collect()
}

impl Orchestrator {
    /// Create every profile of a stack concurrently
    ///
    /// Every profile is resolved before anything is launched. A profile
    /// whose run fails is recorded and the others carry on; the run only
    /// fails when every profile does, or when a checkpoint is reached.
    pub async fn create_stack(
        &self,
        resolver: &ConfigResolver,
        selection: &Selection,
        options: &CreateOptions,
    ) -> Result<Vec<Association>> {
        let configs = stack_configs(resolver, selection)?;
        info!(
            "Creating stack {} with {} profile(s)",
            selection.stack.as_deref().unwrap_or_default(),
            configs.len()
        );

        let results = join_all(configs.iter().map(|config| self.create_servers(config, options))).await;

        let mut created = Vec::new();
        let mut first_error = None;
        for (config, result) in configs.iter().zip(results) {
            let profile = config.params.profile.as_deref().unwrap_or_default();
            match result {
                Ok(servers) => created.extend(servers),
                Err(e @ Error::Checkpoint { .. }) => return Err(e),
                Err(e) => {
                    warn!("Profile {} failed: {}", profile, e);
                    self.summary().fail("stack", profile, &e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if created.is_empty() => Err(e),
            _ => Ok(created),
        }
    }
}
