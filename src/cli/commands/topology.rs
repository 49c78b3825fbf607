use crate::{blueprint::TopologyConfig, topology::store::CredentialPolicy};
use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use ipnetwork::Ipv4Network;
use secrecy::SecretString;
use std::{path::PathBuf, time::Duration};

pub const ARG_PREFIX: &str = "prefix";
pub const ARG_IAM_STACK: &str = "iam-stack";
pub const ARG_APP_STACK: &str = "app-stack";
pub const ARG_STAGE: &str = "stage";
pub const ARG_CORS_ORIGIN: &str = "cors-origin";
pub const ARG_CIDR: &str = "cidr";
pub const ARG_ZONES: &str = "zones";
pub const ARG_DB_NAME: &str = "db-name";
pub const ARG_DB_USERNAME: &str = "db-username";
pub const ARG_DB_PASSWORD: &str = "db-password";
pub const ARG_LAMBDA_DIR: &str = "lambda-dir";
pub const ARG_TIMEOUT: &str = "timeout";
pub const ARG_DB_RESET_ROUTE: &str = "db-reset-route";

#[derive(Debug, Clone)]
pub struct Options {
    pub config: TopologyConfig,
}

impl Options {
    /// Parse topology arguments from matches.
    ///
    /// Without `--db-password` the database credential is generated at
    /// deploy time.
    ///
    /// # Errors
    /// Returns an error if a value is empty or malformed.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let defaults = TopologyConfig::default();

        // Helper to filter empty strings which clap might pass through if env vars are set to ""
        let get_non_empty = |id: &str| {
            matches
                .get_one::<String>(id)
                .cloned()
                .filter(|v| !v.trim().is_empty())
        };
        let required = |id: &str| {
            get_non_empty(id).with_context(|| format!("missing required argument: --{id}"))
        };

        let address_space = match get_non_empty(ARG_CIDR) {
            Some(raw) => raw
                .parse::<Ipv4Network>()
                .with_context(|| format!("invalid --{ARG_CIDR}: {raw}"))?,
            None => defaults.address_space,
        };

        let cors_origins: Vec<String> = matches
            .get_many::<String>(ARG_CORS_ORIGIN)
            .map(|values| {
                values
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if cors_origins.is_empty() {
            anyhow::bail!("missing required argument: --{ARG_CORS_ORIGIN}");
        }

        let username = required(ARG_DB_USERNAME)?;
        let credentials = match get_non_empty(ARG_DB_PASSWORD) {
            Some(password) => CredentialPolicy::Fixed {
                username,
                password: SecretString::from(password),
            },
            None => CredentialPolicy::Generated { username },
        };

        Ok(Self {
            config: TopologyConfig {
                prefix: required(ARG_PREFIX)?,
                iam_unit: required(ARG_IAM_STACK)?,
                app_unit: required(ARG_APP_STACK)?,
                stage: required(ARG_STAGE)?,
                cors_origins,
                address_space,
                zones: matches
                    .get_one::<u8>(ARG_ZONES)
                    .copied()
                    .unwrap_or(defaults.zones),
                database_name: required(ARG_DB_NAME)?,
                credentials,
                lambda_dir: matches
                    .get_one::<PathBuf>(ARG_LAMBDA_DIR)
                    .cloned()
                    .unwrap_or(defaults.lambda_dir),
                timeout: matches
                    .get_one::<u64>(ARG_TIMEOUT)
                    .copied()
                    .map_or(defaults.timeout, Duration::from_secs),
                db_reset_route: matches.get_flag(ARG_DB_RESET_ROUTE),
            },
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_PREFIX)
                .long(ARG_PREFIX)
                .help("Prefix of role and topic names")
                .env("TACKLEBOX_PREFIX")
                .default_value("Tacklebox")
                .global(true),
        )
        .arg(
            Arg::new(ARG_IAM_STACK)
                .long(ARG_IAM_STACK)
                .help("Name of the unit holding the handler roles")
                .env("TACKLEBOX_IAM_STACK")
                .default_value("tacklebox-iam")
                .global(true),
        )
        .arg(
            Arg::new(ARG_APP_STACK)
                .long(ARG_APP_STACK)
                .help("Name of the application unit")
                .env("TACKLEBOX_APP_STACK")
                .default_value("Tacklebox")
                .global(true),
        )
        .arg(
            Arg::new(ARG_STAGE)
                .long(ARG_STAGE)
                .help("Deployment stage of the REST API")
                .env("TACKLEBOX_STAGE")
                .default_value("v1")
                .global(true),
        )
        .arg(
            Arg::new(ARG_CORS_ORIGIN)
                .long(ARG_CORS_ORIGIN)
                .help("Allowed CORS origin, repeat or comma separate for several")
                .env("TACKLEBOX_CORS_ORIGINS")
                .value_delimiter(',')
                .action(ArgAction::Append)
                .default_value("*")
                .global(true),
        )
        .arg(
            Arg::new(ARG_CIDR)
                .long(ARG_CIDR)
                .help("IPv4 address space of the private network")
                .env("TACKLEBOX_CIDR")
                .default_value("10.0.0.0/16")
                .global(true),
        )
        .arg(
            Arg::new(ARG_ZONES)
                .long(ARG_ZONES)
                .help("Number of availability zones")
                .env("TACKLEBOX_ZONES")
                .default_value("2")
                .value_parser(clap::value_parser!(u8).range(1..))
                .global(true),
        )
        .arg(
            Arg::new(ARG_DB_NAME)
                .long(ARG_DB_NAME)
                .help("Name of the application database")
                .env("TACKLEBOX_DB_NAME")
                .default_value("tacklebox")
                .global(true),
        )
        .arg(
            Arg::new(ARG_DB_USERNAME)
                .long(ARG_DB_USERNAME)
                .help("Master username of the database")
                .env("TACKLEBOX_DB_USERNAME")
                .default_value("tackleboxadmin")
                .global(true),
        )
        .arg(
            Arg::new(ARG_DB_PASSWORD)
                .long(ARG_DB_PASSWORD)
                .help("Fixed master password, embedded in the template")
                .long_help(
                    "Fixed master password of the database. It is embedded in clear text in the rendered template and reported as a warning.\n\nWhen omitted, the password is generated at deploy time and kept in a secret store.",
                )
                .env("TACKLEBOX_DB_PASSWORD")
                .hide_env_values(true)
                .global(true),
        )
        .arg(
            Arg::new(ARG_LAMBDA_DIR)
                .long(ARG_LAMBDA_DIR)
                .help("Directory holding one code asset per handler")
                .env("TACKLEBOX_LAMBDA_DIR")
                .default_value("./lambdas")
                .value_parser(clap::value_parser!(PathBuf))
                .global(true),
        )
        .arg(
            Arg::new(ARG_TIMEOUT)
                .long(ARG_TIMEOUT)
                .help("Handler timeout in seconds")
                .env("TACKLEBOX_TIMEOUT")
                .default_value("5")
                .value_parser(clap::value_parser!(u64).range(1..=900))
                .global(true),
        )
        .arg(
            Arg::new(ARG_DB_RESET_ROUTE)
                .long(ARG_DB_RESET_ROUTE)
                .help("Expose the database setup handler as POST /reset")
                .env("TACKLEBOX_DB_RESET_ROUTE")
                .action(ArgAction::SetTrue)
                .global(true),
        )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const VARS: [&str; 5] = [
        "TACKLEBOX_DB_PASSWORD",
        "TACKLEBOX_CIDR",
        "TACKLEBOX_STAGE",
        "TACKLEBOX_ZONES",
        "TACKLEBOX_DB_RESET_ROUTE",
    ];

    fn parse(args: &[&str]) -> anyhow::Result<Options> {
        let matches = with_args(Command::new("test")).try_get_matches_from(args)?;
        Options::parse(&matches)
    }

    #[test]
    fn test_defaults() {
        temp_env::with_vars(VARS.map(|var| (var, None::<&str>)), || {
            let options = parse(&["test"]).unwrap();
            let config = options.config;
            assert_eq!(config.prefix, "Tacklebox");
            assert_eq!(config.stage, "v1");
            assert_eq!(config.address_space.to_string(), "10.0.0.0/16");
            assert_eq!(config.zones, 2);
            assert_eq!(config.cors_origins, vec!["*".to_string()]);
            assert_eq!(config.timeout, Duration::from_secs(5));
            assert!(!config.db_reset_route);
            assert!(matches!(
                config.credentials,
                CredentialPolicy::Generated { ref username } if username == "tackleboxadmin"
            ));
        });
    }

    #[test]
    fn test_password_from_env_is_fixed() {
        temp_env::with_vars(
            [
                ("TACKLEBOX_DB_PASSWORD", Some("testing123!")),
                ("TACKLEBOX_DB_RESET_ROUTE", Some("true")),
            ],
            || {
                let options = parse(&["test"]).unwrap();
                assert!(options.config.credentials.is_insecure());
                assert!(options.config.db_reset_route);
                assert!(!format!("{options:?}").contains("testing123!"));
            },
        );
    }

    #[test]
    fn test_cors_origins_are_split() {
        temp_env::with_vars(VARS.map(|var| (var, None::<&str>)), || {
            let options = parse(&[
                "test",
                "--cors-origin",
                "https://a.example,https://b.example",
            ])
            .unwrap();
            assert_eq!(
                options.config.cors_origins,
                vec!["https://a.example".to_string(), "https://b.example".to_string()]
            );
        });
    }

    #[test]
    fn test_invalid_cidr() {
        temp_env::with_var("TACKLEBOX_CIDR", Some("10.0.0.0/33"), || {
            let err = parse(&["test"]).unwrap_err();
            assert!(err.to_string().contains("invalid --cidr"));
        });
    }

    #[test]
    fn test_empty_stage() {
        temp_env::with_var("TACKLEBOX_STAGE", Some(" "), || {
            let err = parse(&["test"]).unwrap_err();
            assert!(err
                .to_string()
                .contains("missing required argument: --stage"));
        });
    }

    #[test]
    fn test_zero_zones_rejected() {
        temp_env::with_vars(VARS.map(|var| (var, None::<&str>)), || {
            assert!(parse(&["test", "--zones", "0"]).is_err());
        });
    }
}
