use crate::topology::{
    network::{Attachment, AttachmentKind, NetworkRef},
    DeployableUnit, Error, Handle, Result, Token,
};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::{json, Value};
use std::{collections::BTreeSet, fmt};
use tracing::{debug, warn};

pub type StoreRef = Handle<DataStore>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Engine {
    Postgres { version: String },
}

impl Engine {
    #[must_use]
    pub fn postgres(version: impl Into<String>) -> Self {
        Self::Postgres {
            version: version.into(),
        }
    }

    #[must_use]
    pub const fn default_port(&self) -> u16 {
        match self {
            Self::Postgres { .. } => 5432,
        }
    }

    const fn name(&self) -> &'static str {
        match self {
            Self::Postgres { .. } => "postgres",
        }
    }

    fn version(&self) -> &str {
        match self {
            Self::Postgres { version } => version,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingClass {
    Burstable3Micro,
    Burstable3Small,
    Burstable3Medium,
}

impl SizingClass {
    #[must_use]
    pub const fn instance_class(self) -> &'static str {
        match self {
            Self::Burstable3Micro => "db.t3.micro",
            Self::Burstable3Small => "db.t3.small",
            Self::Burstable3Medium => "db.t3.medium",
        }
    }
}

/// How the master credential of a store is obtained.
#[derive(Clone)]
pub enum CredentialPolicy {
    /// Password embedded in the topology in clear text. Dev and test only.
    Fixed {
        username: String,
        password: SecretString,
    },
    /// Password generated at deploy time and kept in a secret store.
    Generated { username: String },
}

impl CredentialPolicy {
    #[must_use]
    pub fn username(&self) -> &str {
        match self {
            Self::Fixed { username, .. } | Self::Generated { username } => username,
        }
    }

    #[must_use]
    pub const fn is_insecure(&self) -> bool {
        matches!(self, Self::Fixed { .. })
    }
}

impl fmt::Debug for CredentialPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed { username, .. } => f
                .debug_struct("Fixed")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            Self::Generated { username } => f
                .debug_struct("Generated")
                .field("username", username)
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreSpec {
    pub engine: Engine,
    pub sizing: SizingClass,
    pub database_name: String,
    pub credentials: CredentialPolicy,
}

/// Where handlers read the store password from.
#[derive(Clone)]
pub enum CredentialRef {
    Plaintext(SecretString),
    Secret { logical_id: String },
}

impl CredentialRef {
    /// Value handed to consumers. A plaintext password is exposed as-is.
    #[must_use]
    pub fn token(&self) -> Token {
        match self {
            Self::Plaintext(password) => Token::literal(password.expose_secret()),
            Self::Secret { logical_id } => Token::Join(vec![
                Token::literal("{{resolve:secretsmanager:"),
                Token::reference(logical_id),
                Token::literal(":SecretString:password}}"),
            ]),
        }
    }
}

impl fmt::Debug for CredentialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plaintext(_) => f.write_str("Plaintext(***)"),
            Self::Secret { logical_id } => {
                f.debug_struct("Secret").field("logical_id", logical_id).finish()
            }
        }
    }
}

/// Fields of a [`DataStoreDescriptor`] a handler can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StoreField {
    User,
    Host,
    Port,
    Name,
    Password,
}

/// Connection attributes of a store, fixed once the store exists.
#[derive(Debug, Clone)]
pub struct DataStoreDescriptor {
    store: StoreRef,
    id: String,
    port: u16,
    database_name: String,
    username: String,
    credential: CredentialRef,
}

impl DataStoreDescriptor {
    #[must_use]
    pub const fn store(&self) -> StoreRef {
        self.store
    }

    #[must_use]
    pub fn host(&self) -> Token {
        Token::get_att(&self.id, "Endpoint.Address")
    }

    #[must_use]
    pub fn port(&self) -> Token {
        Token::get_att(&self.id, "Endpoint.Port")
    }

    #[must_use]
    pub const fn port_number(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[must_use]
    pub fn credential(&self) -> &CredentialRef {
        &self.credential
    }

    #[must_use]
    pub fn field(&self, field: StoreField) -> Token {
        match field {
            StoreField::User => Token::literal(&self.username),
            StoreField::Host => self.host(),
            StoreField::Port => self.port(),
            StoreField::Name => Token::literal(&self.database_name),
            StoreField::Password => self.credential.token(),
        }
    }
}

/// Inbound rule of the store's security group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngressRule {
    pub cidr: String,
    pub protocol: &'static str,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DataStore {
    id: String,
    network: NetworkRef,
    subnets: Vec<String>,
    spec: StoreSpec,
    descriptor: DataStoreDescriptor,
    ingress: IngressRule,
}

impl DataStore {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn network(&self) -> NetworkRef {
        self.network
    }

    #[must_use]
    pub fn descriptor(&self) -> &DataStoreDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn ingress(&self) -> &IngressRule {
        &self.ingress
    }

    #[must_use]
    pub const fn credentials(&self) -> &CredentialPolicy {
        &self.spec.credentials
    }

    fn secret_id(&self) -> String {
        format!("{}Secret", self.id)
    }

    pub(crate) fn render(&self, network_id: &str) -> Vec<(String, Value)> {
        let subnet_group = format!("{}SubnetGroup", self.id);
        let security_group = format!("{}SecurityGroup", self.id);
        let mut resources = Vec::new();

        if let CredentialPolicy::Generated { username } = &self.spec.credentials {
            resources.push((
                self.secret_id(),
                json!({
                    "Type": "AWS::SecretsManager::Secret",
                    "Properties": {
                        "GenerateSecretString": {
                            "SecretStringTemplate": json!({ "username": username }).to_string(),
                            "GenerateStringKey": "password",
                            "ExcludeCharacters": " %+~`#$&*()|[]{}:;<>?!'/@\"\\",
                            "PasswordLength": 30,
                        },
                    },
                }),
            ));
        }

        resources.push((
            subnet_group.clone(),
            json!({
                "Type": "AWS::RDS::DBSubnetGroup",
                "Properties": {
                    "DBSubnetGroupDescription": format!("Subnet group for {} database", self.id),
                    "SubnetIds": self.subnets.iter().map(|s| Token::reference(s)).collect::<Vec<_>>(),
                },
            }),
        ));
        resources.push((
            security_group.clone(),
            json!({
                "Type": "AWS::EC2::SecurityGroup",
                "Properties": {
                    "GroupDescription": format!("Security group for {} database", self.id),
                    "VpcId": Token::reference(network_id),
                    "SecurityGroupIngress": [{
                        "CidrIp": self.ingress.cidr,
                        "IpProtocol": self.ingress.protocol,
                        "FromPort": self.ingress.port,
                        "ToPort": self.ingress.port,
                    }],
                },
            }),
        ));
        resources.push((
            self.id.clone(),
            json!({
                "Type": "AWS::RDS::DBInstance",
                "Properties": {
                    "Engine": self.spec.engine.name(),
                    "EngineVersion": self.spec.engine.version(),
                    "DBInstanceClass": self.spec.sizing.instance_class(),
                    "AllocatedStorage": "100",
                    "DBName": self.spec.database_name,
                    "MasterUsername": self.spec.credentials.username(),
                    "MasterUserPassword": self.descriptor.credential.token(),
                    "DBSubnetGroupName": Token::reference(subnet_group),
                    "VPCSecurityGroups": [Token::get_att(security_group, "GroupId")],
                    "StorageType": "gp2",
                    "CopyTagsToSnapshot": true,
                },
                "DeletionPolicy": "Snapshot",
                "UpdateReplacePolicy": "Snapshot",
            }),
        ));
        resources
    }
}

impl DeployableUnit {
    /// Define the durable store inside a finalized network.
    ///
    /// # Errors
    /// Returns [`Error::NetworkRequired`] if the network is not finalized, or
    /// [`Error::DuplicateResource`] if `id` is taken.
    pub fn define_store(
        &mut self,
        id: &str,
        network: NetworkRef,
        spec: StoreSpec,
    ) -> Result<DataStoreDescriptor> {
        let segment = self.network(network)?;
        let Some(layout) = segment.finalized() else {
            return Err(Error::NetworkRequired {
                store: id.to_string(),
                network: segment.id().to_string(),
            });
        };
        let subnets: Vec<String> = layout.subnets.iter().map(|s| s.id.clone()).collect();
        let ingress = IngressRule {
            cidr: layout.address_space.clone(),
            protocol: "tcp",
            port: spec.engine.default_port(),
        };

        self.ensure_unclaimed(id)?;
        self.attach(
            network,
            Attachment {
                resource: id.to_string(),
                kind: AttachmentKind::Store,
                consumes: BTreeSet::new(),
            },
        )?;
        self.claim(id)?;

        if spec.credentials.is_insecure() {
            warn!(store = id, "store uses a fixed plaintext credential");
        }

        let store = Handle::new(self.id(), self.stores.len());
        let credential = match &spec.credentials {
            CredentialPolicy::Fixed { password, .. } => CredentialRef::Plaintext(password.clone()),
            CredentialPolicy::Generated { .. } => CredentialRef::Secret {
                logical_id: format!("{id}Secret"),
            },
        };
        let descriptor = DataStoreDescriptor {
            store,
            id: id.to_string(),
            port: ingress.port,
            database_name: spec.database_name.clone(),
            username: spec.credentials.username().to_string(),
            credential,
        };

        debug!(
            unit = %self.name(),
            store = id,
            ingress = %ingress.cidr,
            port = ingress.port,
            "store defined"
        );

        self.stores.push(DataStore {
            id: id.to_string(),
            network,
            subnets,
            spec,
            descriptor: descriptor.clone(),
            ingress,
        });
        Ok(descriptor)
    }

    /// # Errors
    /// Returns [`Error::ForeignHandle`] if `store` was not issued by this unit.
    pub fn store(&self, store: StoreRef) -> Result<&DataStore> {
        let index = self.owned(store, self.stores.len())?;
        Ok(&self.stores[index])
    }

    #[must_use]
    pub fn stores(&self) -> &[DataStore] {
        &self.stores
    }
}
