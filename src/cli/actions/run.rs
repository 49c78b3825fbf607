use crate::cli::actions::{synth, validate, Action};
use anyhow::Result;

/// Execute the provided action.
// This is the single dispatch point for all CLI actions.
/// # Errors
/// Returns an error if the action fails.
pub fn execute(action: Action) -> Result<()> {
    match action {
        Action::Synth(args) => synth::execute(&args),
        Action::Validate(args) => validate::execute(&args),
    }
}
