//! Interactive confirmation on the terminal

use fleet_orchestration::Confirm;
use tracing::warn;

/// Asks on the terminal, defaulting to no
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        match dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
        {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Cannot ask '{}': {}", prompt, e);
                false
            }
        }
    }
}
