//! Manifest rendering.
//!
//! Synthesis validates the assembly, freezes every network layout and route
//! tree, seals each unit and renders one provider template per unit.

use crate::topology::{
    validate::{validate, Report},
    Assembly, DeployableUnit, Error, Handle, Result,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use tracing::{debug, info, instrument};

const TEMPLATE_FORMAT_VERSION: &str = "2010-09-09";

/// Rendered template of one unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitManifest {
    pub name: String,
    /// Units whose exports this unit imports. They must be deployed first.
    pub depends_on: Vec<String>,
    pub template: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Manifest {
    pub units: Vec<UnitManifest>,
}

impl Manifest {
    #[must_use]
    pub fn unit(&self, name: &str) -> Option<&UnitManifest> {
        self.units.iter().find(|unit| unit.name == name)
    }

    /// Resources of `unit`, keyed by logical id.
    #[must_use]
    pub fn resources(&self, unit: &str) -> Option<&Map<String, Value>> {
        self.unit(unit)?.template.get("Resources")?.as_object()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    pub manifest: Manifest,
    pub report: Report,
}

impl DeployableUnit {
    /// Every resource of the unit, keyed by logical id.
    ///
    /// Ids derived from construct ids (route paths, security groups, secrets,
    /// permissions) can clash with each other or with a construct id.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateResource`] for the first logical id rendered twice.
    pub(crate) fn render_resources(&self) -> Result<Map<String, Value>> {
        let mut resources: Vec<(String, Value)> = Vec::new();

        resources.extend(
            self.roles()
                .iter()
                .map(|role| (role.id().to_string(), role.to_json())),
        );
        for segment in self.networks() {
            let layout = match segment.finalized() {
                Some(layout) => layout.clone(),
                None => segment.layout()?,
            };
            resources.extend(segment.render(&layout));
        }
        for store in self.stores() {
            let network = self.network(store.network())?;
            resources.extend(store.render(network.id()));
        }
        resources.extend(
            self.topics()
                .iter()
                .map(|topic| (topic.id().to_string(), topic.render())),
        );
        for handler in self.handlers() {
            resources.extend(self.render_handler(handler)?);
        }
        for api in self.apis() {
            resources.extend(api.render());
        }

        let mut rendered = Map::new();
        for (id, resource) in resources {
            if rendered.contains_key(&id) {
                return Err(Error::DuplicateResource {
                    unit: self.name().to_string(),
                    id,
                });
            }
            rendered.insert(id, resource);
        }
        Ok(rendered)
    }

    fn render_template(&self) -> Result<Value> {
        let resources = self.render_resources()?;
        let outputs: Map<String, Value> = self
            .exports()
            .iter()
            .map(|export| (export.output_id(), export.render()))
            .collect();

        debug!(
            unit = %self.name(),
            resources = resources.len(),
            outputs = outputs.len(),
            "template rendered"
        );

        Ok(json!({
            "AWSTemplateFormatVersion": TEMPLATE_FORMAT_VERSION,
            "Description": format!("{} ({})", self.name(), crate::APP_USER_AGENT),
            "Resources": resources,
            "Outputs": outputs,
        }))
    }
}

impl Assembly {
    /// Validate, freeze and render the whole assembly.
    ///
    /// Nothing is frozen when validation fails. Afterwards every unit is
    /// sealed and further network attachments are rejected.
    ///
    /// # Errors
    /// Returns the validation findings, see [`validate`].
    #[instrument(skip(self))]
    pub fn synthesize(&mut self) -> Result<Synthesis> {
        let report = validate(self)?;
        let (bindings, _) = self.bind_imports();

        for unit in self.units_mut() {
            let id = unit.id();
            for index in 0..unit.networks().len() {
                unit.finalize_network(Handle::new(id, index))?;
            }
            for index in 0..unit.apis().len() {
                unit.finalize_routes(Handle::new(id, index))?;
            }
            unit.seal();
        }

        let units = self
            .units()
            .iter()
            .map(|unit| {
                let depends_on: BTreeSet<String> = bindings
                    .iter()
                    .filter(|(consumer, _, value)| {
                        *consumer == unit.name() && value.producer != unit.name()
                    })
                    .map(|(_, _, value)| value.producer.clone())
                    .collect();
                Ok(UnitManifest {
                    name: unit.name().to_string(),
                    depends_on: depends_on.into_iter().collect(),
                    template: unit.render_template()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        info!(units = units.len(), warnings = report.warnings.len(), "synthesis complete");
        Ok(Synthesis {
            manifest: Manifest { units },
            report,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::topology::{
        handler::HandlerSpec,
        iam::{Capability, CapabilityTier},
        network::{Attachment, AttachmentKind, NetworkSpec},
    };

    #[test]
    fn test_synthesis_seals_networks() {
        let mut assembly = Assembly::new();
        let iam = assembly.add_unit("tacklebox-iam").unwrap();
        let role = assembly
            .unit_mut(iam)
            .unwrap()
            .define_tier_role("vpcRole", "Tacklebox_lambdaVPCRole", CapabilityTier::Connectivity)
            .unwrap();
        assembly
            .unit_mut(iam)
            .unwrap()
            .publish_role("lambdaVpcRole", role, None)
            .unwrap();

        let app = assembly.add_unit("Tacklebox").unwrap();
        let unit = assembly.unit_mut(app).unwrap();
        let network = unit
            .define_network(
                "TackleboxVpc",
                NetworkSpec::new("10.0.0.0/16".parse().unwrap(), 2),
            )
            .unwrap();
        let role = unit.import_role("lambdaVpcRole", [Capability::NetworkAccess]);
        unit.define_handler("ManageStats", HandlerSpec::new(role, network, "./lambdas/stats"))
            .unwrap();

        let synthesis = assembly.synthesize().unwrap();
        let app_manifest = synthesis.manifest.unit("Tacklebox").unwrap();
        assert_eq!(app_manifest.depends_on, vec!["tacklebox-iam".to_string()]);
        let resources = synthesis.manifest.resources("Tacklebox").unwrap();
        assert!(resources.contains_key("ManageStats"));
        assert!(resources.contains_key("TackleboxVpcIsolatedSubnet2"));
        assert!(synthesis
            .manifest
            .unit("tacklebox-iam")
            .unwrap()
            .template["Outputs"]
            .get("lambdaVpcRole")
            .is_some());

        let unit = assembly.unit_mut(app).unwrap();
        assert!(unit.is_sealed());
        assert!(matches!(
            unit.attach(
                network,
                Attachment {
                    resource: "late".to_string(),
                    kind: AttachmentKind::Handler,
                    consumes: BTreeSet::new(),
                }
            ),
            Err(Error::AttachAfterFinalize { .. })
        ));
    }

    #[test]
    fn test_invalid_assembly_is_not_frozen() {
        let mut assembly = Assembly::new();
        let app = assembly.add_unit("Tacklebox").unwrap();
        let unit = assembly.unit_mut(app).unwrap();
        unit.define_network(
            "TackleboxVpc",
            NetworkSpec::new("10.0.0.0/16".parse().unwrap(), 2),
        )
        .unwrap();
        unit.import_value("apiHost");

        assert!(matches!(
            assembly.synthesize(),
            Err(Error::UnresolvedImport { .. })
        ));
        let unit = assembly.unit(app).unwrap();
        assert!(!unit.is_sealed());
        assert!(unit.networks()[0].finalized().is_none());
    }
}
