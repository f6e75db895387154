//! Operator confirmation for destructive actions

use crate::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tracing::info;

/// Asks the operator before something is destroyed
pub trait Confirm: Send + Sync {
    /// Whether the operator agreed to `prompt`
    fn confirm(&self, prompt: &str) -> bool;
}

/// Ask, turning a refusal into [`Error::Declined`]
pub fn require(confirm: &dyn Confirm, prompt: &str) -> Result<()> {
    if confirm.confirm(prompt) {
        Ok(())
    } else {
        Err(Error::Declined(prompt.to_string()))
    }
}

/// Agrees to everything (`--yes`)
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, prompt: &str) -> bool {
        info!("{}? yes (assumed)", prompt);
        true
    }
}

/// Answers from a script, recording every prompt
///
/// Once the script runs out every further prompt is refused.
#[derive(Debug, Default)]
pub struct ScriptedConfirm {
    answers: Mutex<VecDeque<bool>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedConfirm {
    /// Answer with `answers` in order
    pub fn new(answers: impl IntoIterator<Item = bool>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts shown so far
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Confirm for ScriptedConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prompt.to_string());
        self.answers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_runs_out() {
        let confirm = ScriptedConfirm::new([true]);
        assert!(require(&confirm, "Delete 2 server(s)").is_ok());
        let err = require(&confirm, "Really terminate").unwrap_err();
        assert!(matches!(err, Error::Declined(_)));
        assert_eq!(confirm.prompts(), vec!["Delete 2 server(s)", "Really terminate"]);
    }
}
