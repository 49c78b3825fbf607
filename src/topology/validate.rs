//! Whole-assembly validation.
//!
//! A pure pass: nothing is finalized or sealed here. Hard findings are
//! collected into [`Error::Invalid`]; soft findings become [`Warning`]s.

use crate::topology::{
    network::Service, routes::RouteTree, Assembly, Error, Result,
};
use serde::Serialize;
use std::{collections::BTreeMap, fmt};
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// An access point no attached resource consumes.
    UnusedAccessPoint {
        unit: String,
        network: String,
        service: Service,
    },
    /// A resource consumes a service its network has no access point for.
    UnreachableService {
        unit: String,
        network: String,
        resource: String,
        service: Service,
    },
    /// A store whose password is embedded in the topology.
    InsecureCredentials { unit: String, store: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnusedAccessPoint {
                unit,
                network,
                service,
            } => write!(f, "{unit}: access point {service} on {network} is never used"),
            Self::UnreachableService {
                unit,
                network,
                resource,
                service,
            } => write!(
                f,
                "{unit}: {resource} needs {service} but {network} has no access point for it"
            ),
            Self::InsecureCredentials { unit, store } => {
                write!(f, "{unit}: store {store} uses a fixed plaintext password")
            }
        }
    }
}

/// Outcome of a successful validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Report {
    pub warnings: Vec<Warning>,
    pub imports_resolved: usize,
    pub routes: Vec<RouteTree>,
}

/// Validate every unit of `assembly`.
///
/// # Errors
/// Returns the single finding, or [`Error::Invalid`] with all of them.
#[instrument(skip_all, fields(units = assembly.units().len()))]
pub fn validate(assembly: &Assembly) -> Result<Report> {
    let mut errors = Vec::new();
    let mut report = Report::default();

    // role names are global to a deployment
    let mut role_names: BTreeMap<&str, &str> = BTreeMap::new();
    for unit in assembly.units() {
        for role in unit.roles() {
            if role_names.insert(role.name(), unit.name()).is_some() {
                errors.push(Error::DuplicateRoleName {
                    unit: unit.name().to_string(),
                    name: role.name().to_string(),
                });
            }
            errors.extend(role.conflicts());
        }
    }

    errors.extend(assembly.duplicate_exports());
    let (bindings, import_errors) = assembly.bind_imports();
    errors.extend(import_errors);
    report.imports_resolved = bindings.len();

    for unit in assembly.units() {
        for segment in unit.networks() {
            if segment.finalized().is_none() {
                if let Err(err) = segment.layout() {
                    errors.push(err);
                }
            }
            report
                .warnings
                .extend(segment.unused_access_points().into_iter().map(|service| {
                    Warning::UnusedAccessPoint {
                        unit: unit.name().to_string(),
                        network: segment.id().to_string(),
                        service,
                    }
                }));
            report
                .warnings
                .extend(segment.unreachable().into_iter().map(|(resource, service)| {
                    Warning::UnreachableService {
                        unit: unit.name().to_string(),
                        network: segment.id().to_string(),
                        resource,
                        service,
                    }
                }));
        }

        report.warnings.extend(
            unit.stores()
                .iter()
                .filter(|store| store.credentials().is_insecure())
                .map(|store| Warning::InsecureCredentials {
                    unit: unit.name().to_string(),
                    store: store.id().to_string(),
                }),
        );

        for api in unit.apis() {
            let findings = api.check();
            if findings.is_empty() {
                report
                    .routes
                    .push(api.tree().cloned().unwrap_or_else(|| api.build_tree()));
            }
            errors.extend(findings);
        }
    }

    // derived logical ids can only be checked on an otherwise sound assembly
    if errors.is_empty() {
        errors.extend(
            assembly
                .units()
                .iter()
                .filter_map(|unit| unit.render_resources().err()),
        );
    }

    if !errors.is_empty() {
        warn!(errors = errors.len(), "topology is invalid");
        return Err(match errors.len() {
            1 => errors.remove(0),
            _ => Error::Invalid(errors),
        });
    }

    for warning in &report.warnings {
        warn!("{warning}");
    }
    info!(
        warnings = report.warnings.len(),
        imports = report.imports_resolved,
        "topology is valid"
    );
    Ok(report)
}
