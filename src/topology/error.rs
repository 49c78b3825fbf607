use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Broad class of a topology error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Duplicate names, conflicting statements, orphaned integrations.
    Configuration,
    /// Missing imports, references to resources that are not ready.
    UnresolvedReference,
    /// A handler needs a permission its role does not grant.
    Capability,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("unit {0} is already defined")]
    DuplicateUnit(String),
    #[error("unit #{index} does not belong to this assembly")]
    UnknownUnit { index: usize },
    #[error("{unit}: construct id {id} is already in use")]
    DuplicateResource { unit: String, id: String },
    #[error("{unit}: {id} is not defined")]
    UnknownResource { unit: String, id: String },
    #[error("{unit}: handle was issued by unit #{owner}")]
    ForeignHandle { unit: String, owner: usize },
    #[error("{unit}: role name {name} is already defined")]
    DuplicateRoleName { unit: String, name: String },
    #[error("role {role} both allows and denies {action} on {resource}")]
    ConflictingStatements {
        role: String,
        action: String,
        resource: String,
    },
    #[error("{unit}: policy statement in {role} has no actions or no resources")]
    EmptyStatement { unit: String, role: String },
    #[error("{unit}: export {name} is already published")]
    DuplicateExportName { unit: String, name: String },
    #[error("network {network}: cannot attach {resource} after finalization")]
    AttachAfterFinalize { network: String, resource: String },
    #[error("network {network}: invalid address space {reason}")]
    InvalidAddressSpace { network: String, reason: String },
    #[error("{path}: segment {segment} already exists")]
    DuplicateSibling { path: String, segment: String },
    #[error("{path}: invalid segment {segment:?}")]
    InvalidSegment { path: String, segment: String },
    #[error("{path}: method {method} is already bound")]
    DuplicateMethod { path: String, method: String },
    #[error("api {api}: integration for handler {handler} is not bound to any method")]
    OrphanIntegration { api: String, handler: String },
    #[error("api {api}: stage name {stage:?} is not a valid URL path segment")]
    InvalidStage { api: String, stage: String },
    #[error("api {api}: route tree is finalized")]
    RouteTreeFinalized { api: String },
    #[error("api {api}: methods require an API key but no usage plan carries one")]
    MissingUsagePlan { api: String },
    #[error("import {name} has {count} producers: {producers:?}")]
    AmbiguousImport {
        name: String,
        count: usize,
        producers: Vec<String>,
    },
    #[error("{unit}: import {name} is not published by any unit")]
    UnresolvedImport { unit: String, name: String },
    #[error("store {store}: network {network} is not finalized")]
    NetworkRequired { store: String, network: String },
    #[error("import {name}: expected {expected}, producer {producer} publishes {actual}")]
    ImportKindMismatch {
        name: String,
        producer: String,
        expected: String,
        actual: String,
    },
    #[error("handler {handler}: role {role} lacks capability {capability}")]
    RoleCapabilityMismatch {
        handler: String,
        role: String,
        capability: String,
    },
    #[error("import {name}: role from {producer} lacks declared capability {capability}")]
    ImportCapabilityMismatch {
        name: String,
        producer: String,
        capability: String,
    },
    #[error("topology is invalid:\n{}", render_all(.0))]
    Invalid(Vec<Error>),
}

fn render_all(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnresolvedImport { .. }
            | Self::AmbiguousImport { .. }
            | Self::NetworkRequired { .. }
            | Self::ImportKindMismatch { .. } => ErrorKind::UnresolvedReference,
            Self::RoleCapabilityMismatch { .. } | Self::ImportCapabilityMismatch { .. } => {
                ErrorKind::Capability
            }
            Self::Invalid(errors) => errors
                .first()
                .map_or(ErrorKind::Configuration, Self::kind),
            _ => ErrorKind::Configuration,
        }
    }

    /// Flatten nested validation failures into a single list.
    #[must_use]
    pub fn into_vec(self) -> Vec<Self> {
        match self {
            Self::Invalid(errors) => errors.into_iter().flat_map(Self::into_vec).collect(),
            other => vec![other],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let err = Error::DuplicateSibling {
            path: "/".to_string(),
            segment: "services".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err = Error::UnresolvedImport {
            unit: "Tacklebox".to_string(),
            name: "lambdaVpcRole".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::UnresolvedReference);

        let err = Error::RoleCapabilityMismatch {
            handler: "ManageMessages".to_string(),
            role: "vpcRole".to_string(),
            capability: "messaging".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Capability);
    }

    #[test]
    fn test_invalid_display_lists_every_error() {
        let err = Error::Invalid(vec![
            Error::DuplicateUnit("a".to_string()),
            Error::DuplicateUnit("b".to_string()),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("unit a is already defined"));
        assert!(msg.contains("unit b is already defined"));
        assert_eq!(err.into_vec().len(), 2);
    }

    #[test]
    fn test_capability_error_names_handler_and_capability() {
        let err = Error::RoleCapabilityMismatch {
            handler: "ManageMessages".to_string(),
            role: "vpcRole".to_string(),
            capability: "messaging".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("ManageMessages"));
        assert!(msg.contains("messaging"));
    }
}
