//! Request handlers.
//!
//! A handler is bound to one role and one network. Its environment is a map of
//! well-known keys to values resolved from the store descriptor, peer handlers,
//! topics or imports. The capabilities a handler needs follow from that
//! environment and are checked against the role when the handler is defined.

use crate::topology::{
    exports::{ImportKind, ImportRef},
    iam::{Capability, RoleRef},
    messaging::TopicRef,
    network::{Attachment, AttachmentKind, NetworkRef, Service},
    store::{DataStoreDescriptor, StoreField, StoreRef},
    DeployableUnit, Error, Handle, Result, Token,
};
use serde_json::{json, Map, Value};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::debug;

pub type HandlerRef = Handle<Handler>;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const RUNTIME: &str = "nodejs14.x";
const ENTRYPOINT: &str = "index.handler";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EnvKey {
    DatabaseUser,
    DatabaseHost,
    DatabasePort,
    DatabaseName,
    DatabasePassword,
    DestinationArn,
    DestinationName,
    ResendArn,
    Custom(String),
}

impl EnvKey {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::DatabaseUser => "DATABASE_USER",
            Self::DatabaseHost => "DATABASE_HOST",
            Self::DatabasePort => "DATABASE_PORT",
            Self::DatabaseName => "DATABASE_NAME",
            Self::DatabasePassword => "DATABASE_PASSWORD",
            Self::DestinationArn => "DESTINATION_ARN",
            Self::DestinationName => "DESTINATION_NAME",
            Self::ResendArn => "RESEND_ARN",
            Self::Custom(name) => name,
        }
    }

    /// Capabilities implied by the key itself, whatever its value.
    #[must_use]
    pub const fn required_capabilities(&self) -> &'static [Capability] {
        match self {
            Self::ResendArn => &[Capability::Messaging],
            Self::DestinationArn => &[Capability::Logging, Capability::FunctionPermissions],
            _ => &[],
        }
    }
}

impl fmt::Display for EnvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvValue {
    Literal(String),
    Store(StoreRef, StoreField),
    HandlerArn(HandlerRef),
    HandlerName(HandlerRef),
    TopicArn(TopicRef),
    Import(ImportRef),
}

impl EnvValue {
    #[must_use]
    pub const fn required_capabilities(&self) -> &'static [Capability] {
        match self {
            Self::TopicArn(_) => &[Capability::Messaging],
            Self::HandlerArn(_) => &[Capability::FunctionPermissions],
            _ => &[],
        }
    }
}

/// Handler environment, ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<EnvKey, EnvValue>,
}

impl Environment {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The five `DATABASE_*` variables for a store.
    #[must_use]
    pub fn database(descriptor: &DataStoreDescriptor) -> Self {
        let store = descriptor.store();
        Self::new()
            .with(EnvKey::DatabaseUser, EnvValue::Store(store, StoreField::User))
            .with(EnvKey::DatabaseHost, EnvValue::Store(store, StoreField::Host))
            .with(EnvKey::DatabasePort, EnvValue::Store(store, StoreField::Port))
            .with(EnvKey::DatabaseName, EnvValue::Store(store, StoreField::Name))
            .with(
                EnvKey::DatabasePassword,
                EnvValue::Store(store, StoreField::Password),
            )
    }

    #[must_use]
    pub fn with(mut self, key: EnvKey, value: EnvValue) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: EnvKey, value: EnvValue) -> Option<EnvValue> {
        self.vars.insert(key, value)
    }

    #[must_use]
    pub fn get(&self, key: &EnvKey) -> Option<&EnvValue> {
        self.vars.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EnvKey, &EnvValue)> {
        self.vars.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    fn required_capabilities(&self) -> BTreeSet<Capability> {
        self.vars
            .iter()
            .flat_map(|(key, value)| {
                key.required_capabilities()
                    .iter()
                    .chain(value.required_capabilities())
                    .copied()
            })
            .collect()
    }
}

/// The role a handler runs as: defined in this unit or imported from another.
///
/// An imported role holds exactly the capabilities declared on its import
/// through [`DeployableUnit::import_role`]. A plain value import holds none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleBinding {
    Local(RoleRef),
    Imported(ImportRef),
}

#[derive(Debug, Clone)]
pub struct HandlerSpec {
    role: RoleBinding,
    network: NetworkRef,
    code: PathBuf,
    timeout: Duration,
    environment: Environment,
}

impl HandlerSpec {
    #[must_use]
    pub fn new(role: RoleBinding, network: NetworkRef, code: impl Into<PathBuf>) -> Self {
        Self {
            role,
            network,
            code: code.into(),
            timeout: DEFAULT_TIMEOUT,
            environment: Environment::new(),
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: EnvKey, value: EnvValue) -> Self {
        self.environment.insert(key, value);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Handler {
    id: String,
    spec: HandlerSpec,
    required: BTreeSet<Capability>,
}

impl Handler {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn role(&self) -> &RoleBinding {
        &self.spec.role
    }

    #[must_use]
    pub const fn network(&self) -> NetworkRef {
        self.spec.network
    }

    #[must_use]
    pub fn code(&self) -> &Path {
        &self.spec.code
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.spec.timeout
    }

    #[must_use]
    pub const fn environment(&self) -> &Environment {
        &self.spec.environment
    }

    #[must_use]
    pub const fn required_capabilities(&self) -> &BTreeSet<Capability> {
        &self.required
    }

    /// Services the handler reaches over its network.
    #[must_use]
    pub fn consumed_services(&self) -> BTreeSet<Service> {
        consumed_services(&self.required)
    }

    #[must_use]
    pub fn arn(&self) -> Token {
        Token::get_att(&self.id, "Arn")
    }

    /// `Ref` of a function resolves to its name.
    #[must_use]
    pub fn function_name(&self) -> Token {
        Token::reference(&self.id)
    }

    fn security_group_id(&self) -> String {
        format!("{}SecurityGroup", self.id)
    }
}

fn consumed_services(capabilities: &BTreeSet<Capability>) -> BTreeSet<Service> {
    capabilities.iter().filter_map(|c| c.service()).collect()
}

impl DeployableUnit {
    /// Define a handler and attach it to its network.
    ///
    /// Every reference in `spec` must be owned by this unit, and the role must
    /// hold every capability the environment implies.
    ///
    /// # Errors
    /// Returns [`Error::RoleCapabilityMismatch`] for a missing capability,
    /// [`Error::DuplicateResource`] if `id` is taken, or
    /// [`Error::AttachAfterFinalize`] if the network is sealed.
    pub fn define_handler(&mut self, id: &str, spec: HandlerSpec) -> Result<HandlerRef> {
        self.ensure_unclaimed(id)?;
        self.network(spec.network)?;
        for (_, value) in spec.environment.iter() {
            self.check_env_value(value)?;
        }

        let (role_label, held) = match &spec.role {
            RoleBinding::Local(role) => {
                let role = self.role(*role)?;
                (role.name().to_string(), role.capabilities())
            }
            RoleBinding::Imported(import) => {
                let import = self.import(*import)?;
                let held = match import.kind() {
                    ImportKind::Role { capabilities } => capabilities.clone(),
                    ImportKind::Value => BTreeSet::new(),
                };
                (import.name().to_string(), held)
            }
        };

        let mut required = spec.environment.required_capabilities();
        required.insert(Capability::NetworkAccess);
        if let Some(missing) = required.difference(&held).next() {
            return Err(Error::RoleCapabilityMismatch {
                handler: id.to_string(),
                role: role_label,
                capability: missing.to_string(),
            });
        }

        self.attach(
            spec.network,
            Attachment {
                resource: id.to_string(),
                kind: AttachmentKind::Handler,
                consumes: consumed_services(&required),
            },
        )?;
        self.claim(id)?;

        debug!(
            unit = %self.name(),
            handler = id,
            role = %role_label,
            code = %spec.code.display(),
            env = spec.environment.len(),
            "handler defined"
        );

        self.handlers.push(Handler {
            id: id.to_string(),
            spec,
            required,
        });
        Ok(Handle::new(self.id(), self.handlers.len() - 1))
    }

    fn check_env_value(&self, value: &EnvValue) -> Result<()> {
        match value {
            EnvValue::Literal(_) => Ok(()),
            EnvValue::Store(store, _) => self.store(*store).map(drop),
            EnvValue::HandlerArn(handler) | EnvValue::HandlerName(handler) => {
                self.handler(*handler).map(drop)
            }
            EnvValue::TopicArn(topic) => self.topic(*topic).map(drop),
            EnvValue::Import(import) => self.import(*import).map(drop),
        }
    }

    /// # Errors
    /// Returns [`Error::ForeignHandle`] if `handler` was not issued by this unit.
    pub fn handler(&self, handler: HandlerRef) -> Result<&Handler> {
        let index = self.owned(handler, self.handlers.len())?;
        Ok(&self.handlers[index])
    }

    /// # Errors
    /// Returns [`Error::ForeignHandle`] if `handler` was not issued by this unit.
    pub fn handler_arn(&self, handler: HandlerRef) -> Result<Token> {
        self.handler(handler).map(Handler::arn)
    }

    #[must_use]
    pub fn handlers(&self) -> &[Handler] {
        &self.handlers
    }

    /// Resolve a handler's environment to provider values.
    ///
    /// # Errors
    /// Returns [`Error::ForeignHandle`] for a reference this unit does not own.
    pub fn resolve_environment(&self, handler: &Handler) -> Result<BTreeMap<String, Token>> {
        handler
            .environment()
            .iter()
            .map(|(key, value)| {
                let token = match value {
                    EnvValue::Literal(value) => Token::literal(value),
                    EnvValue::Store(store, field) => {
                        self.store(*store)?.descriptor().field(*field)
                    }
                    EnvValue::HandlerArn(peer) => self.handler(*peer)?.arn(),
                    EnvValue::HandlerName(peer) => self.handler(*peer)?.function_name(),
                    EnvValue::TopicArn(topic) => self.topic(*topic)?.arn(),
                    EnvValue::Import(import) => self.import(*import)?.token(),
                };
                Ok((key.to_string(), token))
            })
            .collect()
    }

    fn role_token(&self, binding: &RoleBinding) -> Result<Token> {
        match binding {
            RoleBinding::Local(role) => self.role_arn(*role),
            RoleBinding::Imported(import) => Ok(self.import(*import)?.token()),
        }
    }

    pub(crate) fn render_handler(&self, handler: &Handler) -> Result<Vec<(String, Value)>> {
        let segment = self.network(handler.network())?;
        let variables: Map<String, Value> = self
            .resolve_environment(handler)?
            .into_iter()
            .map(|(key, token)| (key, token.to_json()))
            .collect();
        let subnets: Vec<Token> = segment
            .subnet_ids()
            .into_iter()
            .map(Token::reference)
            .collect();
        let security_group = handler.security_group_id();

        Ok(vec![
            (
                security_group.clone(),
                json!({
                    "Type": "AWS::EC2::SecurityGroup",
                    "Properties": {
                        "GroupDescription": format!("Automatic security group for handler {}", handler.id),
                        "VpcId": Token::reference(segment.id()),
                        "SecurityGroupEgress": [{ "CidrIp": "0.0.0.0/0", "IpProtocol": "-1" }],
                    },
                }),
            ),
            (
                handler.id.clone(),
                json!({
                    "Type": "AWS::Lambda::Function",
                    "Properties": {
                        "Runtime": RUNTIME,
                        "Handler": ENTRYPOINT,
                        "Role": self.role_token(handler.role())?,
                        "Timeout": handler.timeout().as_secs(),
                        "Environment": { "Variables": variables },
                        "VpcConfig": {
                            "SubnetIds": subnets,
                            "SecurityGroupIds": [Token::get_att(&security_group, "GroupId")],
                        },
                    },
                    "Metadata": { "tacklebox:asset-path": handler.code().display().to_string() },
                }),
            ),
        ])
    }
}
