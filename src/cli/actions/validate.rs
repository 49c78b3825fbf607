use crate::{
    blueprint::{self, TopologyConfig},
    topology::validate::{validate, Report},
};
use anyhow::{Context, Result};
use std::{
    fmt::Write as _,
    io::{self, Write},
};

#[derive(Debug)]
pub struct Args {
    pub config: TopologyConfig,
}

/// Validate the configured topology and print its route table.
///
/// # Errors
/// Returns an error if the topology is invalid.
pub fn execute(args: &Args) -> Result<()> {
    let assembly = blueprint::build(&args.config).context("failed to compose topology")?;
    let report = validate(&assembly).context("topology is invalid")?;

    let mut stdout = io::stdout().lock();
    write!(stdout, "{}", render(&report)).context("failed to write report to stdout")?;

    Ok(())
}

fn render(report: &Report) -> String {
    let mut out = String::new();

    for tree in &report.routes {
        let _ = writeln!(out, "{} ({})", tree.api, tree.stage);
        for (path, method) in tree.methods() {
            let key = if method.api_key_required { "  [api key]" } else { "" };
            let _ = writeln!(
                out,
                "  {:<7} {:<40} -> {}{key}",
                method.method.to_string(),
                path,
                method.handler
            );
        }
    }
    for warning in &report.warnings {
        let _ = writeln!(out, "warning: {warning}");
    }
    let _ = writeln!(
        out,
        "{} imports resolved, {} warnings",
        report.imports_resolved,
        report.warnings.len()
    );

    out
}
