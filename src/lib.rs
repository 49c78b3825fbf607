//! # Tacklebox topology
//!
//! `tacklebox` composes the backend topology of the Tacklebox webhook delivery
//! platform at build time: a private network, a relational database, the
//! request handlers, the public REST surface and the roles that bind them.
//!
//! ## Resource graph
//!
//! Everything lives in an [`topology::Assembly`] of deployable units. Units
//! are append-only; resources are reached through typed handles that are only
//! valid inside the unit that issued them. Across units, values travel as
//! named exports and imports, resolved once every unit has been composed.
//!
//! ## Capabilities
//!
//! A role's capabilities are derived from its effective statements. Handlers
//! declare what they need through their environment (`RESEND_ARN` needs
//! messaging, `DESTINATION_ARN` needs logging and function permissions) and
//! are rejected at composition time when their role falls short.
//!
//! ## Validation and synthesis
//!
//! [`topology::validate::validate`] is a pure pass over the assembly.
//! [`topology::Assembly::synthesize`] runs it, freezes network layouts and
//! route trees, and renders one template per unit.

pub mod blueprint;
pub mod cli;
pub mod topology;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
