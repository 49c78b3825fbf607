//! Isolated network segments.
//!
//! A segment owns an IPv4 address space split into one isolated `/24` subnet
//! per zone, plus interface access points for the services attached resources
//! talk to. There is no internet egress: a resource whose service has no
//! access point cannot reach it.

use crate::topology::{DeployableUnit, Error, Handle, Result, Token};
use ipnetwork::Ipv4Network;
use serde::Serialize;
use serde_json::{json, Value};
use std::{collections::BTreeSet, fmt, net::Ipv4Addr};
use tracing::{debug, info};

pub type NetworkRef = Handle<NetworkSegment>;

const SUBNET_PREFIX: u8 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Service {
    Sns,
    CloudWatchLogs,
    Lambda,
    SecretsManager,
}

impl Service {
    #[must_use]
    pub const fn endpoint_suffix(self) -> &'static str {
        match self {
            Self::Sns => "sns",
            Self::CloudWatchLogs => "logs",
            Self::Lambda => "lambda",
            Self::SecretsManager => "secretsmanager",
        }
    }

    const fn construct_suffix(self) -> &'static str {
        match self {
            Self::Sns => "SnsEndpoint",
            Self::CloudWatchLogs => "LogsEndpoint",
            Self::Lambda => "LambdaEndpoint",
            Self::SecretsManager => "SecretsManagerEndpoint",
        }
    }

    fn service_name(self) -> Token {
        Token::Join(vec![
            Token::literal("com.amazonaws."),
            Token::region(),
            Token::literal(format!(".{}", self.endpoint_suffix())),
        ])
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.endpoint_suffix())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    address_space: Ipv4Network,
    zone_count: u8,
    access_points: BTreeSet<Service>,
}

impl NetworkSpec {
    #[must_use]
    pub fn new(address_space: Ipv4Network, zone_count: u8) -> Self {
        Self {
            address_space,
            zone_count,
            access_points: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_access_point(mut self, service: Service) -> Self {
        self.access_points.insert(service);
        self
    }

    #[must_use]
    pub fn with_access_points(mut self, services: impl IntoIterator<Item = Service>) -> Self {
        self.access_points.extend(services);
        self
    }
}

/// Kind of resource bound to a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Handler,
    Store,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub resource: String,
    pub kind: AttachmentKind,
    pub consumes: BTreeSet<Service>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subnet {
    pub id: String,
    pub zone: u8,
    pub cidr: String,
}

/// Frozen layout of a network segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalizedNetwork {
    pub id: String,
    pub address_space: String,
    pub subnets: Vec<Subnet>,
    pub access_points: Vec<Service>,
}

#[derive(Debug, Clone)]
pub struct NetworkSegment {
    id: String,
    spec: NetworkSpec,
    attachments: Vec<Attachment>,
    layout: Option<FinalizedNetwork>,
    sealed: bool,
}

impl NetworkSegment {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn address_space(&self) -> Ipv4Network {
        self.spec.address_space
    }

    #[must_use]
    pub const fn zone_count(&self) -> u8 {
        self.spec.zone_count
    }

    #[must_use]
    pub fn access_points(&self) -> &BTreeSet<Service> {
        &self.spec.access_points
    }

    #[must_use]
    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    #[must_use]
    pub const fn finalized(&self) -> Option<&FinalizedNetwork> {
        self.layout.as_ref()
    }

    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Compute the subnet layout without freezing anything.
    ///
    /// # Errors
    /// Returns [`Error::InvalidAddressSpace`] when the zones do not fit.
    pub fn layout(&self) -> Result<FinalizedNetwork> {
        let invalid = |reason: String| Error::InvalidAddressSpace {
            network: self.id.clone(),
            reason,
        };
        let space = self.spec.address_space;
        if space.prefix() > SUBNET_PREFIX {
            return Err(invalid(format!(
                "{space}: prefix must be /{SUBNET_PREFIX} or shorter"
            )));
        }
        if self.spec.zone_count == 0 {
            return Err(invalid(format!("{space}: at least one zone is required")));
        }
        let available = 1u64 << (SUBNET_PREFIX - space.prefix());
        if u64::from(self.spec.zone_count) > available {
            return Err(invalid(format!(
                "{space}: {} zones do not fit, room for {available}",
                self.spec.zone_count
            )));
        }

        let base = u32::from(space.network());
        let subnets = (0..self.spec.zone_count)
            .map(|zone| {
                let address = Ipv4Addr::from(base + (u32::from(zone) << 8));
                Ipv4Network::new(address, SUBNET_PREFIX)
                    .map(|cidr| Subnet {
                        id: format!("{}IsolatedSubnet{}", self.id, zone + 1),
                        zone,
                        cidr: cidr.to_string(),
                    })
                    .map_err(|e| invalid(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(FinalizedNetwork {
            id: self.id.clone(),
            address_space: space.to_string(),
            subnets,
            access_points: self.spec.access_points.iter().copied().collect(),
        })
    }

    /// Declared access points no attached resource consumes.
    #[must_use]
    pub fn unused_access_points(&self) -> Vec<Service> {
        let consumed: BTreeSet<Service> = self
            .attachments
            .iter()
            .flat_map(|a| a.consumes.iter().copied())
            .collect();
        self.spec
            .access_points
            .difference(&consumed)
            .copied()
            .collect()
    }

    /// (resource, service) pairs that stay unreachable for lack of an access point.
    #[must_use]
    pub fn unreachable(&self) -> Vec<(String, Service)> {
        self.attachments
            .iter()
            .flat_map(|a| {
                a.consumes
                    .iter()
                    .filter(|service| !self.spec.access_points.contains(service))
                    .map(|service| (a.resource.clone(), *service))
            })
            .collect()
    }

    /// Isolated subnet ids, in zone order.
    pub(crate) fn subnet_ids(&self) -> Vec<String> {
        (1..=self.spec.zone_count)
            .map(|zone| format!("{}IsolatedSubnet{zone}", self.id))
            .collect()
    }

    pub(crate) fn seal(&mut self) {
        self.sealed = true;
    }

    pub(crate) fn render(&self, layout: &FinalizedNetwork) -> Vec<(String, Value)> {
        let mut resources = vec![(
            self.id.clone(),
            json!({
                "Type": "AWS::EC2::VPC",
                "Properties": {
                    "CidrBlock": layout.address_space,
                    "EnableDnsHostnames": true,
                    "EnableDnsSupport": true,
                    "InstanceTenancy": "default",
                },
            }),
        )];

        for subnet in &layout.subnets {
            resources.push((
                subnet.id.clone(),
                json!({
                    "Type": "AWS::EC2::Subnet",
                    "Properties": {
                        "VpcId": Token::reference(&self.id),
                        "CidrBlock": subnet.cidr,
                        "AvailabilityZone": {
                            "Fn::Select": [subnet.zone, { "Fn::GetAZs": "" }],
                        },
                        "MapPublicIpOnLaunch": false,
                    },
                }),
            ));
        }

        let subnet_refs: Vec<Token> = layout
            .subnets
            .iter()
            .map(|s| Token::reference(&s.id))
            .collect();
        for service in &layout.access_points {
            resources.push((
                format!("{}{}", self.id, service.construct_suffix()),
                json!({
                    "Type": "AWS::EC2::VPCEndpoint",
                    "Properties": {
                        "ServiceName": service.service_name(),
                        "VpcEndpointType": "Interface",
                        "PrivateDnsEnabled": true,
                        "SubnetIds": subnet_refs,
                        "VpcId": Token::reference(&self.id),
                    },
                }),
            ));
        }
        resources
    }
}

impl DeployableUnit {
    /// Define an isolated network segment.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateResource`] if `id` is taken.
    pub fn define_network(&mut self, id: &str, spec: NetworkSpec) -> Result<NetworkRef> {
        self.claim(id)?;
        debug!(
            unit = %self.name(),
            network = id,
            address_space = %spec.address_space,
            zones = spec.zone_count,
            access_points = ?spec.access_points,
            "network defined"
        );
        self.networks.push(NetworkSegment {
            id: id.to_string(),
            spec,
            attachments: Vec::new(),
            layout: None,
            sealed: false,
        });
        Ok(Handle::new(self.id(), self.networks.len() - 1))
    }

    /// Declare an additional access point before the layout is finalized.
    ///
    /// # Errors
    /// Returns [`Error::AttachAfterFinalize`] once the network is finalized.
    pub fn add_access_point(&mut self, network: NetworkRef, service: Service) -> Result<()> {
        let index = self.owned(network, self.networks.len())?;
        let segment = &mut self.networks[index];
        if segment.layout.is_some() {
            return Err(Error::AttachAfterFinalize {
                network: segment.id.clone(),
                resource: format!("{service} access point"),
            });
        }
        debug!(network = %segment.id, %service, "access point added");
        segment.spec.access_points.insert(service);
        Ok(())
    }

    /// Record `attachment` as bound to `network`.
    ///
    /// # Errors
    /// Returns [`Error::AttachAfterFinalize`] once synthesis has sealed the network.
    pub fn attach(&mut self, network: NetworkRef, attachment: Attachment) -> Result<()> {
        let index = self.owned(network, self.networks.len())?;
        let segment = &mut self.networks[index];
        if segment.sealed {
            return Err(Error::AttachAfterFinalize {
                network: segment.id.clone(),
                resource: attachment.resource,
            });
        }
        debug!(network = %segment.id, resource = %attachment.resource, "resource attached");
        match segment
            .attachments
            .iter_mut()
            .find(|a| a.resource == attachment.resource)
        {
            Some(existing) => existing.consumes.extend(attachment.consumes),
            None => segment.attachments.push(attachment),
        }
        Ok(())
    }

    /// Freeze the network layout. Calling it again returns the same layout.
    ///
    /// # Errors
    /// Returns [`Error::InvalidAddressSpace`] when the zones do not fit.
    pub fn finalize_network(&mut self, network: NetworkRef) -> Result<FinalizedNetwork> {
        let index = self.owned(network, self.networks.len())?;
        let segment = &mut self.networks[index];
        if let Some(layout) = &segment.layout {
            return Ok(layout.clone());
        }
        let layout = segment.layout()?;
        info!(
            network = %segment.id,
            subnets = layout.subnets.len(),
            "network finalized"
        );
        segment.layout = Some(layout.clone());
        Ok(layout)
    }

    /// # Errors
    /// Returns [`Error::ForeignHandle`] if `network` was not issued by this unit.
    pub fn network(&self, network: NetworkRef) -> Result<&NetworkSegment> {
        let index = self.owned(network, self.networks.len())?;
        Ok(&self.networks[index])
    }

    #[must_use]
    pub fn networks(&self) -> &[NetworkSegment] {
        &self.networks
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::topology::Assembly;

    fn spec(cidr: &str, zones: u8) -> NetworkSpec {
        NetworkSpec::new(cidr.parse().unwrap(), zones)
    }

    fn handler(name: &str, consumes: &[Service]) -> Attachment {
        Attachment {
            resource: name.to_string(),
            kind: AttachmentKind::Handler,
            consumes: consumes.iter().copied().collect(),
        }
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let mut assembly = Assembly::new();
        let id = assembly.add_unit("Tacklebox").unwrap();
        let unit = assembly.unit_mut(id).unwrap();
        let net = unit
            .define_network(
                "tacklebox-vpc",
                spec("10.0.0.0/16", 2).with_access_points([Service::Sns, Service::Lambda]),
            )
            .unwrap();

        let first = unit.finalize_network(net).unwrap();
        let second = unit.finalize_network(net).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first
                .subnets
                .iter()
                .map(|s| s.cidr.as_str())
                .collect::<Vec<_>>(),
            vec!["10.0.0.0/24", "10.0.1.0/24"]
        );
    }

    #[test]
    fn test_access_point_after_finalize_rejected() {
        let mut assembly = Assembly::new();
        let id = assembly.add_unit("Tacklebox").unwrap();
        let unit = assembly.unit_mut(id).unwrap();
        let net = unit
            .define_network("tacklebox-vpc", spec("10.0.0.0/16", 2))
            .unwrap();
        unit.finalize_network(net).unwrap();
        assert!(matches!(
            unit.add_access_point(net, Service::Sns),
            Err(Error::AttachAfterFinalize { .. })
        ));
    }

    #[test]
    fn test_attach_after_seal_rejected() {
        let mut assembly = Assembly::new();
        let id = assembly.add_unit("Tacklebox").unwrap();
        let unit = assembly.unit_mut(id).unwrap();
        let net = unit
            .define_network("tacklebox-vpc", spec("10.0.0.0/16", 2))
            .unwrap();
        unit.attach(net, handler("ManageServices", &[])).unwrap();
        unit.seal();
        assert_eq!(
            unit.attach(net, handler("ManageUsers", &[])),
            Err(Error::AttachAfterFinalize {
                network: "tacklebox-vpc".to_string(),
                resource: "ManageUsers".to_string(),
            })
        );
    }

    #[test]
    fn test_zones_must_fit() {
        let mut assembly = Assembly::new();
        let id = assembly.add_unit("Tacklebox").unwrap();
        let unit = assembly.unit_mut(id).unwrap();
        let net = unit.define_network("small", spec("10.0.0.0/23", 3)).unwrap();
        assert!(matches!(
            unit.finalize_network(net),
            Err(Error::InvalidAddressSpace { .. })
        ));
        let net = unit.define_network("tiny", spec("10.0.0.0/28", 1)).unwrap();
        assert!(matches!(
            unit.finalize_network(net),
            Err(Error::InvalidAddressSpace { .. })
        ));
    }

    #[test]
    fn test_unused_and_unreachable_services() {
        let mut assembly = Assembly::new();
        let id = assembly.add_unit("Tacklebox").unwrap();
        let unit = assembly.unit_mut(id).unwrap();
        let net = unit
            .define_network(
                "tacklebox-vpc",
                spec("10.0.0.0/16", 2).with_access_points([Service::Sns, Service::CloudWatchLogs]),
            )
            .unwrap();
        unit.attach(net, handler("ManageMessages", &[Service::Sns]))
            .unwrap();
        unit.attach(net, handler("ManageEventTypes", &[Service::Lambda]))
            .unwrap();

        let segment = unit.network(net).unwrap();
        assert_eq!(segment.unused_access_points(), vec![Service::CloudWatchLogs]);
        assert_eq!(
            segment.unreachable(),
            vec![("ManageEventTypes".to_string(), Service::Lambda)]
        );
    }
}
