//! Cross-unit references.
//!
//! Units publish named outputs and import them by name. Imports are stored as
//! late-bound references; [`Assembly::resolve_imports`] binds them in two
//! phases, first collecting every publish across the assembly and then
//! resolving each import against that complete set. Build order of the units
//! therefore does not matter.

use crate::topology::{
    handler::{HandlerRef, RoleBinding},
    iam::{Capability, RoleRef},
    routes::{ApiKeyRef, ApiRef},
    Assembly, DeployableUnit, Error, Handle, Result, Token, UnitId,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, instrument};

pub type ImportRef = Handle<Import>;

/// What an export was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportSource {
    Role(RoleRef),
    Handler(HandlerRef),
    Api(ApiRef),
    ApiKey(ApiKeyRef),
    Value,
}

impl ExportSource {
    const fn describe(&self) -> &'static str {
        match self {
            Self::Role(_) => "role ARN",
            Self::Handler(_) => "handler ARN",
            Self::Api(_) => "API URL",
            Self::ApiKey(_) => "API key id",
            Self::Value => "value",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Export {
    name: String,
    description: Option<String>,
    value: Token,
    source: ExportSource,
}

impl Export {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn value(&self) -> &Token {
        &self.value
    }

    #[must_use]
    pub const fn source(&self) -> ExportSource {
        self.source
    }

    /// Output logical id: the export name without separators.
    pub(crate) fn output_id(&self) -> String {
        self.name.chars().filter(char::is_ascii_alphanumeric).collect()
    }

    pub(crate) fn render(&self) -> Value {
        let mut output = json!({
            "Value": self.value,
            "Export": { "Name": self.name },
        });
        if let Some(description) = &self.description {
            output["Description"] = json!(description);
        }
        output
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportKind {
    Value,
    /// A role ARN the consumer relies on for these capabilities.
    Role { capabilities: BTreeSet<Capability> },
}

#[derive(Debug, Clone)]
pub struct Import {
    name: String,
    kind: ImportKind,
}

impl Import {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn kind(&self) -> &ImportKind {
        &self.kind
    }

    #[must_use]
    pub fn token(&self) -> Token {
        Token::Import(self.name.clone())
    }
}

/// A published value as seen by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedValue {
    pub producer: String,
    pub value: Token,
}

/// Every import of the assembly bound to its producer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings {
    values: BTreeMap<(String, String), ResolvedValue>,
}

impl Bindings {
    #[must_use]
    pub fn get(&self, consumer: &str, name: &str) -> Option<&ResolvedValue> {
        self.values.get(&(consumer.to_string(), name.to_string()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &ResolvedValue)> {
        self.values
            .iter()
            .map(|((consumer, name), value)| (consumer.as_str(), name.as_str(), value))
    }
}

impl DeployableUnit {
    /// Publish a named value.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateExportName`] if this unit already published `name`.
    pub fn publish(&mut self, name: &str, value: Token, description: Option<&str>) -> Result<()> {
        self.publish_from(name, value, ExportSource::Value, description)
    }

    /// Publish the ARN of a role.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateExportName`] or [`Error::ForeignHandle`].
    pub fn publish_role(&mut self, name: &str, role: RoleRef, description: Option<&str>) -> Result<()> {
        let value = self.role_arn(role)?;
        self.publish_from(name, value, ExportSource::Role(role), description)
    }

    /// Publish the ARN of a handler.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateExportName`] or [`Error::ForeignHandle`].
    pub fn publish_handler(
        &mut self,
        name: &str,
        handler: HandlerRef,
        description: Option<&str>,
    ) -> Result<()> {
        let value = self.handler_arn(handler)?;
        self.publish_from(name, value, ExportSource::Handler(handler), description)
    }

    /// Publish the base URL of an API.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateExportName`] or [`Error::ForeignHandle`].
    pub fn publish_api_url(&mut self, name: &str, api: ApiRef, description: Option<&str>) -> Result<()> {
        let value = self.api_url(api)?;
        self.publish_from(name, value, ExportSource::Api(api), description)
    }

    /// Publish the id of an API key.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateExportName`] or [`Error::ForeignHandle`].
    pub fn publish_api_key(
        &mut self,
        name: &str,
        key: ApiKeyRef,
        description: Option<&str>,
    ) -> Result<()> {
        let value = self.api_key_id(key)?;
        self.publish_from(name, value, ExportSource::ApiKey(key), description)
    }

    fn publish_from(
        &mut self,
        name: &str,
        value: Token,
        source: ExportSource,
        description: Option<&str>,
    ) -> Result<()> {
        if self.exports.iter().any(|export| export.name == name) {
            return Err(Error::DuplicateExportName {
                unit: self.name().to_string(),
                name: name.to_string(),
            });
        }
        debug!(unit = %self.name(), export = name, value = %value, "output published");
        self.exports.push(Export {
            name: name.to_string(),
            description: description.map(ToString::to_string),
            value,
            source,
        });
        Ok(())
    }

    /// Reference a value another unit publishes. Resolution is deferred.
    pub fn import_value(&mut self, name: &str) -> ImportRef {
        if let Some(index) = self.imports.iter().position(|import| import.name == name) {
            return Handle::new(self.id(), index);
        }
        debug!(unit = %self.name(), import = name, "import declared");
        self.imports.push(Import {
            name: name.to_string(),
            kind: ImportKind::Value,
        });
        Handle::new(self.id(), self.imports.len() - 1)
    }

    /// Reference a role another unit publishes, declaring the capabilities relied on.
    pub fn import_role(
        &mut self,
        name: &str,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> RoleBinding {
        let capabilities: BTreeSet<Capability> = capabilities.into_iter().collect();
        let import = self.import_value(name);
        let entry = &mut self.imports[import.index()];
        match &mut entry.kind {
            ImportKind::Role {
                capabilities: declared,
            } => declared.extend(capabilities),
            kind @ ImportKind::Value => *kind = ImportKind::Role { capabilities },
        }
        RoleBinding::Imported(import)
    }

    /// # Errors
    /// Returns [`Error::ForeignHandle`] if `import` was not issued by this unit.
    pub fn import(&self, import: ImportRef) -> Result<&Import> {
        let index = self.owned(import, self.imports.len())?;
        Ok(&self.imports[index])
    }

    #[must_use]
    pub fn imports(&self) -> &[Import] {
        &self.imports
    }

    #[must_use]
    pub fn exports(&self) -> &[Export] {
        &self.exports
    }
}

impl Assembly {
    fn producers(&self, name: &str) -> Vec<(&DeployableUnit, &Export)> {
        self.units()
            .iter()
            .flat_map(|unit| {
                unit.exports
                    .iter()
                    .filter(move |export| export.name == name)
                    .map(move |export| (unit, export))
            })
            .collect()
    }

    /// Resolve `name` on behalf of `consumer`.
    ///
    /// # Errors
    /// Returns [`Error::UnresolvedImport`] if no unit publishes `name`, or
    /// [`Error::AmbiguousImport`] if several do, or [`Error::UnknownUnit`]
    /// if `consumer` belongs to another assembly.
    pub fn resolve(&self, consumer: UnitId, name: &str) -> Result<ResolvedValue> {
        let consumer = self.unit(consumer)?;
        let producers = self.producers(name);
        match producers.as_slice() {
            [] => Err(Error::UnresolvedImport {
                unit: consumer.name().to_string(),
                name: name.to_string(),
            }),
            [(unit, export)] => Ok(ResolvedValue {
                producer: unit.name().to_string(),
                value: export.value.clone(),
            }),
            many => Err(Error::AmbiguousImport {
                name: name.to_string(),
                count: many.len(),
                producers: many.iter().map(|(u, _)| u.name().to_string()).collect(),
            }),
        }
    }

    /// Bind every import of every unit.
    ///
    /// # Errors
    /// Returns every failed binding, wrapped in [`Error::Invalid`] when there are several.
    #[instrument(skip(self))]
    pub fn resolve_imports(&self) -> Result<Bindings> {
        let (bindings, mut errors) = self.bind_imports();
        match errors.len() {
            0 => Ok(bindings),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Invalid(errors)),
        }
    }

    pub(crate) fn bind_imports(&self) -> (Bindings, Vec<Error>) {
        // phase 1: the complete publish table
        let mut published: BTreeMap<&str, Vec<(&DeployableUnit, &Export)>> = BTreeMap::new();
        for unit in self.units() {
            for export in &unit.exports {
                published
                    .entry(export.name.as_str())
                    .or_default()
                    .push((unit, export));
            }
        }

        // phase 2: bind imports against it
        let mut bindings = Bindings::default();
        let mut errors = Vec::new();
        for consumer in self.units() {
            for import in &consumer.imports {
                let producers = published.get(import.name.as_str()).map_or(&[][..], Vec::as_slice);
                let (producer, export) = match producers {
                    [] => {
                        errors.push(Error::UnresolvedImport {
                            unit: consumer.name().to_string(),
                            name: import.name.clone(),
                        });
                        continue;
                    }
                    [single] => *single,
                    many => {
                        errors.push(Error::AmbiguousImport {
                            name: import.name.clone(),
                            count: many.len(),
                            producers: many.iter().map(|(u, _)| u.name().to_string()).collect(),
                        });
                        continue;
                    }
                };

                if let ImportKind::Role { capabilities } = &import.kind {
                    errors.extend(check_role_import(import, capabilities, producer, export));
                }

                bindings.values.insert(
                    (consumer.name().to_string(), import.name.clone()),
                    ResolvedValue {
                        producer: producer.name().to_string(),
                        value: export.value.clone(),
                    },
                );
            }
        }
        (bindings, errors)
    }

    /// Export names must be unique across the whole deployment.
    pub(crate) fn duplicate_exports(&self) -> Vec<Error> {
        let mut seen = BTreeSet::new();
        self.units()
            .iter()
            .flat_map(|unit| unit.exports.iter().map(move |export| (unit, export)))
            .filter(|(_, export)| !seen.insert(export.name.clone()))
            .map(|(unit, export)| Error::DuplicateExportName {
                unit: unit.name().to_string(),
                name: export.name.clone(),
            })
            .collect()
    }
}

fn check_role_import(
    import: &Import,
    declared: &BTreeSet<Capability>,
    producer: &DeployableUnit,
    export: &Export,
) -> Vec<Error> {
    let ExportSource::Role(role) = export.source else {
        return vec![Error::ImportKindMismatch {
            name: import.name.clone(),
            producer: producer.name().to_string(),
            expected: "role ARN".to_string(),
            actual: export.source.describe().to_string(),
        }];
    };
    let held = match producer.role(role) {
        Ok(role) => role.capabilities(),
        Err(err) => return vec![err],
    };
    declared
        .difference(&held)
        .map(|capability| Error::ImportCapabilityMismatch {
            name: import.name.clone(),
            producer: producer.name().to_string(),
            capability: capability.to_string(),
        })
        .collect()
}
