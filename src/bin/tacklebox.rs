use anyhow::Result;
use tacklebox::cli;

fn main() -> Result<()> {
    // Start the program
    let action = cli::start()?;

    // Handle the action
    action.execute()?;

    Ok(())
}
