pub mod logging;
pub mod topology;

use clap::{
    builder::styling::{AnsiColor, Effects, Styles},
    Arg, ColorChoice, Command,
};
use std::path::PathBuf;

pub const CMD_SYNTH: &str = "synth";
pub const CMD_VALIDATE: &str = "validate";
pub const ARG_OUTPUT: &str = "output";

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("tacklebox")
        .about("Webhook delivery platform topology")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new(CMD_SYNTH)
                .about("Validate the topology and render one template per unit")
                .arg(
                    Arg::new(ARG_OUTPUT)
                        .short('o')
                        .long(ARG_OUTPUT)
                        .help("Write the manifest to this file instead of stdout")
                        .env("TACKLEBOX_OUTPUT")
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new(CMD_VALIDATE)
                .about("Validate the topology and print its routes and warnings"),
        );

    let command = logging::with_args(command);
    topology::with_args(command)
}
