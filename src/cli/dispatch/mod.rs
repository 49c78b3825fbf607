//! Command-line argument dispatch.
//!
//! Maps the validated subcommand and its arguments to an [`Action`].

use crate::cli::actions::{synth, validate, Action};
use crate::cli::commands::{topology, ARG_OUTPUT, CMD_SYNTH, CMD_VALIDATE};
use anyhow::Result;
use std::path::PathBuf;

/// Map validated CLI matches to an action.
///
/// # Errors
/// Returns an error if the subcommand is unknown or the topology options are inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let options = topology::Options::parse(matches)?;

    match matches.subcommand() {
        Some((CMD_SYNTH, sub)) => Ok(Action::Synth(synth::Args {
            config: options.config,
            output: sub.get_one::<PathBuf>(ARG_OUTPUT).cloned(),
        })),
        Some((CMD_VALIDATE, _)) => Ok(Action::Validate(validate::Args {
            config: options.config,
        })),
        Some((name, _)) => anyhow::bail!("unknown subcommand: {name}"),
        None => anyhow::bail!("missing subcommand: {CMD_SYNTH} or {CMD_VALIDATE}"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn synth_with_output_and_env_config() {
        temp_env::with_vars(
            [
                ("TACKLEBOX_STAGE", Some("v2")),
                ("TACKLEBOX_DB_PASSWORD", None::<&str>),
                ("TACKLEBOX_OUTPUT", None),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec![
                    "tacklebox",
                    "synth",
                    "--output",
                    "out.json",
                ]);
                let Action::Synth(args) = handler(&matches).unwrap() else {
                    panic!("expected synth action");
                };
                assert_eq!(args.config.stage, "v2");
                assert_eq!(args.output, Some(PathBuf::from("out.json")));
                assert!(!args.config.credentials.is_insecure());
            },
        );
    }

    #[test]
    fn validate_takes_global_args_after_subcommand() {
        temp_env::with_vars(
            [
                ("TACKLEBOX_PREFIX", None::<&str>),
                ("TACKLEBOX_DB_RESET_ROUTE", None),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec![
                    "tacklebox",
                    "validate",
                    "--prefix",
                    "Staging",
                    "--db-reset-route",
                ]);
                let Action::Validate(args) = handler(&matches).unwrap() else {
                    panic!("expected validate action");
                };
                assert_eq!(args.config.prefix, "Staging");
                assert!(args.config.db_reset_route);
            },
        );
    }

    #[test]
    fn empty_database_name_is_rejected() {
        temp_env::with_vars([("TACKLEBOX_DB_NAME", Some(" "))], || {
            let matches =
                crate::cli::commands::new().get_matches_from(vec!["tacklebox", "validate"]);
            let result = handler(&matches);
            assert!(result.is_err());
            if let Err(err) = result {
                assert!(err
                    .to_string()
                    .contains("missing required argument: --db-name"));
            }
        });
    }
}
