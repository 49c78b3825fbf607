use crate::blueprint::{self, TopologyConfig};
use anyhow::{Context, Result};
use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
};
use tracing::info;

#[derive(Debug)]
pub struct Args {
    pub config: TopologyConfig,
    /// Manifest destination, stdout when unset.
    pub output: Option<PathBuf>,
}

/// Render the manifest of the configured topology as pretty JSON.
///
/// # Errors
/// Returns an error if the topology is invalid or the manifest can't be written.
pub fn execute(args: &Args) -> Result<()> {
    let rendered = render(&args.config)?;

    match &args.output {
        Some(path) => {
            fs::write(path, rendered.as_bytes())
                .with_context(|| format!("failed to write manifest to {}", path.display()))?;
            info!(path = %path.display(), "manifest written");
        }
        None => {
            let mut stdout = io::stdout().lock();
            writeln!(stdout, "{rendered}").context("failed to write manifest to stdout")?;
        }
    }

    Ok(())
}

fn render(config: &TopologyConfig) -> Result<String> {
    let mut assembly = blueprint::build(config).context("failed to compose topology")?;
    let synthesis = assembly
        .synthesize()
        .context("failed to synthesize topology")?;
    serde_json::to_string_pretty(&synthesis.manifest).context("failed to serialize manifest")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_render_default_topology() {
        let rendered = render(&TopologyConfig::default()).unwrap();
        let manifest: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        let units = manifest["units"].as_array().unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0]["name"], "tacklebox-iam");
        assert_eq!(units[1]["depends_on"][0], "tacklebox-iam");
    }

    #[test]
    fn test_writes_output_file() {
        let path = std::env::temp_dir().join(format!("tacklebox-{}.json", std::process::id()));
        execute(&Args {
            config: TopologyConfig::default(),
            output: Some(path.clone()),
        })
        .unwrap();
        let written = fs::read_to_string(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert!(written.contains("AWSTemplateFormatVersion"));
    }

    #[test]
    fn test_invalid_topology_has_context() {
        let config = TopologyConfig {
            address_space: "10.0.0.0/24".parse().unwrap(),
            ..TopologyConfig::default()
        };
        let err = render(&config).unwrap_err();
        assert_eq!(err.to_string(), "failed to compose topology");
    }
}
