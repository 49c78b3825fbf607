//! The webhook delivery platform.
//!
//! Two units: an IAM unit that owns the lambda roles and publishes their ARNs,
//! and the application unit with the network, database, retry topic, handlers
//! and the REST API. The application only reaches the roles through imports.

use crate::topology::{
    handler::{EnvKey, EnvValue, Environment, HandlerRef, HandlerSpec, RoleBinding},
    iam::{Capability, CapabilityTier, PolicyStatement, Principal, RoleRef, RoleSpec},
    network::{NetworkSpec, Service},
    routes::{AuthPolicy, HttpMethod, NodeRef, RestApiOptions},
    store::{CredentialPolicy, Engine, SizingClass, StoreSpec},
    Assembly, DeployableUnit, Error, Result, Token,
};
use ipnetwork::Ipv4Network;
use secrecy::SecretString;
use std::{borrow::Borrow, collections::BTreeMap, net::Ipv4Addr, path::PathBuf, time::Duration};
use tracing::{debug, info, instrument};

const POSTGRES_VERSION: &str = "12.5";

#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// Prefix of role and topic names.
    pub prefix: String,
    pub iam_unit: String,
    pub app_unit: String,
    pub stage: String,
    pub cors_origins: Vec<String>,
    pub address_space: Ipv4Network,
    pub zones: u8,
    pub database_name: String,
    pub credentials: CredentialPolicy,
    /// Directory holding one code asset directory per handler.
    pub lambda_dir: PathBuf,
    pub timeout: Duration,
    /// Expose the database setup handler as `POST /reset`.
    pub db_reset_route: bool,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            prefix: "Tacklebox".to_string(),
            iam_unit: "tacklebox-iam".to_string(),
            app_unit: "Tacklebox".to_string(),
            stage: "v1".to_string(),
            cors_origins: vec!["*".to_string()],
            address_space: Ipv4Network::new(Ipv4Addr::new(10, 0, 0, 0), 16)
                .unwrap_or_else(|_| Ipv4Network::from(Ipv4Addr::new(10, 0, 0, 0))),
            zones: 2,
            database_name: "tacklebox".to_string(),
            credentials: CredentialPolicy::Fixed {
                username: "tackleboxadmin".to_string(),
                password: SecretString::from("testing123!".to_string()),
            },
            lambda_dir: PathBuf::from("./lambdas"),
            timeout: Duration::from_secs(5),
            db_reset_route: false,
        }
    }
}

/// Exports of the IAM unit, one per tier.
const fn role_export(tier: CapabilityTier) -> &'static str {
    match tier {
        CapabilityTier::Connectivity => "lambdaVpcRole",
        CapabilityTier::Messaging => "lambdaVpcSnsRole",
        CapabilityTier::Telemetry => "lambdaVpcSnsLogsRole",
    }
}

/// Capabilities the application relies on when importing a tier role.
const fn relied_on(tier: CapabilityTier) -> &'static [Capability] {
    match tier {
        CapabilityTier::Connectivity => &[Capability::NetworkAccess],
        CapabilityTier::Messaging => &[Capability::NetworkAccess, Capability::Messaging],
        CapabilityTier::Telemetry => &[
            Capability::NetworkAccess,
            Capability::Messaging,
            Capability::Logging,
            Capability::FunctionPermissions,
        ],
    }
}

#[derive(Debug, Clone, Copy)]
enum Wiring {
    Plain,
    /// `RESEND_ARN` points at the retry topic.
    Resend,
    /// `DESTINATION_ARN`/`DESTINATION_NAME` point at a peer handler.
    LogDestination(&'static str),
}

struct HandlerPlan {
    id: &'static str,
    asset: &'static str,
    tier: CapabilityTier,
    wiring: Wiring,
}

const HANDLERS: &[HandlerPlan] = &[
    HandlerPlan {
        id: "dbSetup",
        asset: "resetDB",
        tier: CapabilityTier::Connectivity,
        wiring: Wiring::Plain,
    },
    HandlerPlan {
        id: "ManageServices",
        asset: "services",
        tier: CapabilityTier::Messaging,
        wiring: Wiring::Plain,
    },
    HandlerPlan {
        id: "ManageEvents",
        asset: "events",
        tier: CapabilityTier::Messaging,
        wiring: Wiring::Plain,
    },
    HandlerPlan {
        id: "ManageLogs",
        asset: "logMessages",
        tier: CapabilityTier::Messaging,
        wiring: Wiring::Plain,
    },
    HandlerPlan {
        id: "ManageEventTypes",
        asset: "eventTypes",
        tier: CapabilityTier::Telemetry,
        wiring: Wiring::LogDestination("ManageLogs"),
    },
    HandlerPlan {
        id: "ManageMessages",
        asset: "messages",
        tier: CapabilityTier::Messaging,
        wiring: Wiring::Resend,
    },
    HandlerPlan {
        id: "ManageSubscriptions",
        asset: "subscriptions",
        tier: CapabilityTier::Messaging,
        wiring: Wiring::Resend,
    },
    HandlerPlan {
        id: "ManageUsers",
        asset: "users",
        tier: CapabilityTier::Messaging,
        wiring: Wiring::Plain,
    },
    HandlerPlan {
        id: "ManageStats",
        asset: "stats",
        tier: CapabilityTier::Connectivity,
        wiring: Wiring::Plain,
    },
];

use HttpMethod::{Delete, Get, Post, Put};

/// Every route of the public API. All of them require an API key.
const ROUTES: &[(&str, &[HttpMethod], &str)] = &[
    ("/services", &[Get, Post], "ManageServices"),
    ("/services/{service_id}", &[Get, Delete], "ManageServices"),
    ("/services/{service_id}/stats", &[Get], "ManageStats"),
    ("/services/{service_id}/event_types", &[Get, Post], "ManageEventTypes"),
    (
        "/services/{service_id}/event_types/{event_type_id}",
        &[Get, Put, Delete],
        "ManageEventTypes",
    ),
    ("/services/{service_id}/users", &[Get, Post], "ManageUsers"),
    ("/services/{service_id}/users/{user_id}", &[Get, Delete], "ManageUsers"),
    ("/services/{service_id}/users/{user_id}/events", &[Get, Post], "ManageEvents"),
    ("/services/{service_id}/users/{user_id}/events/{event_id}", &[Get], "ManageEvents"),
    ("/services/{service_id}/users/{user_id}/messages", &[Get], "ManageMessages"),
    (
        "/services/{service_id}/users/{user_id}/messages/{message_id}",
        &[Get],
        "ManageMessages",
    ),
    (
        "/services/{service_id}/users/{user_id}/messages/{message_id}/resend",
        &[Post],
        "ManageMessages",
    ),
    (
        "/services/{service_id}/users/{user_id}/subscriptions",
        &[Get, Post],
        "ManageSubscriptions",
    ),
    (
        "/services/{service_id}/users/{user_id}/subscriptions/{subscription_id}",
        &[Get, Delete],
        "ManageSubscriptions",
    ),
    (
        "/services/{service_id}/users/{user_id}/subscriptions/{subscription_id}/test",
        &[Post],
        "ManageSubscriptions",
    ),
];

const RESET_ROUTE: &str = "/reset";
const RESET_METHODS: &[HttpMethod] = &[Post];

/// Compose the whole deployment.
///
/// # Errors
/// Returns the first composition error; the assembly is not validated here.
#[instrument(skip_all, fields(prefix = %config.prefix))]
pub fn build(config: &TopologyConfig) -> Result<Assembly> {
    let mut assembly = Assembly::new();

    let iam = assembly.add_unit(config.iam_unit.as_str())?;
    build_iam(assembly.unit_mut(iam)?, config)?;

    let app = assembly.add_unit(config.app_unit.as_str())?;
    build_app(assembly.unit_mut(app)?, config)?;

    info!(units = assembly.units().len(), "blueprint composed");
    Ok(assembly)
}

fn build_iam(unit: &mut DeployableUnit, config: &TopologyConfig) -> Result<()> {
    let role_ids = [
        (CapabilityTier::Connectivity, "vpcRole", "lambdaVPCRole"),
        (CapabilityTier::Messaging, "vpcSnsRole", "lambdaVPCSNSRole"),
        (CapabilityTier::Telemetry, "vpcSnsLogsRole", "lambdaVPCSNSLogsRole"),
    ];
    let mut roles: BTreeMap<CapabilityTier, RoleRef> = BTreeMap::new();
    for (tier, id, name) in role_ids {
        let role = unit.define_tier_role(id, &format!("{}_{name}", config.prefix), tier)?;
        roles.insert(tier, role);
    }

    // delivery status roles assumed by the messaging service
    let feedback = || {
        PolicyStatement::allow(
            [
                "logs:CreateLogGroup",
                "logs:CreateLogStream",
                "logs:PutLogEvents",
                "logs:PutMetricFilter",
                "logs:PutRetentionPolicy",
            ],
            [Token::literal("*")],
        )
    };
    let success = unit.define_role(
        "SNSSuccessFeedback",
        RoleSpec::new("SNSSuccessFeedback", Principal::sns()).with_statement(feedback()),
    )?;
    let failure = unit.define_role(
        "SNSFailureFeedback",
        RoleSpec::new("SNSFailureFeedback", Principal::sns()).with_statement(feedback()),
    )?;

    let telemetry = lookup(unit, &roles, &CapabilityTier::Telemetry, "vpcSnsLogsRole")?;
    let feedback_arns = [unit.role_arn(success)?, unit.role_arn(failure)?];
    unit.attach_statement(telemetry, PolicyStatement::allow(["iam:PassRole"], feedback_arns))?;
    unit.attach_statement(
        telemetry,
        PolicyStatement::allow(["lambda:AddPermission"], [Token::literal("*")]),
    )?;

    let descriptions = [
        (CapabilityTier::Connectivity, "ARN for lambda's that need to connect to the VPC"),
        (
            CapabilityTier::Telemetry,
            "ARN for lambda's that need to connect to the VPC, SNS, and CW Logs.",
        ),
        (
            CapabilityTier::Messaging,
            "ARN for lambda's that need to connect to the VPC and SNS",
        ),
    ];
    for (tier, description) in descriptions {
        let role = lookup(unit, &roles, &tier, role_export(tier))?;
        unit.publish_role(role_export(tier), role, Some(description))?;
    }
    Ok(())
}

fn build_app(unit: &mut DeployableUnit, config: &TopologyConfig) -> Result<()> {
    let mut tier_roles: BTreeMap<CapabilityTier, RoleBinding> = BTreeMap::new();
    for tier in CapabilityTier::ALL {
        let binding = unit.import_role(role_export(tier), relied_on(tier).iter().copied());
        tier_roles.insert(tier, binding);
    }

    let network = unit.define_network(
        "TackleboxVpc",
        NetworkSpec::new(config.address_space, config.zones).with_access_points([
            Service::Sns,
            Service::CloudWatchLogs,
            Service::Lambda,
        ]),
    )?;
    unit.finalize_network(network)?;

    let db = unit.define_store(
        "tackleboxdb",
        network,
        StoreSpec {
            engine: Engine::postgres(POSTGRES_VERSION),
            sizing: SizingClass::Burstable3Small,
            database_name: config.database_name.clone(),
            credentials: config.credentials.clone(),
        },
    )?;

    let retry_topic = unit.define_topic("Topic", &format!("{}_manual_message", config.prefix))?;

    let mut handlers: BTreeMap<&'static str, HandlerRef> = BTreeMap::new();
    for plan in HANDLERS {
        let role = lookup(unit, &tier_roles, &plan.tier, role_export(plan.tier))?;
        let mut environment = Environment::database(&db);
        match plan.wiring {
            Wiring::Plain => {}
            Wiring::Resend => {
                environment.insert(EnvKey::ResendArn, EnvValue::TopicArn(retry_topic));
            }
            Wiring::LogDestination(peer) => {
                let peer = lookup(unit, &handlers, peer, peer)?;
                environment.insert(EnvKey::DestinationArn, EnvValue::HandlerArn(peer));
                environment.insert(EnvKey::DestinationName, EnvValue::HandlerName(peer));
            }
        }
        let spec = HandlerSpec::new(role, network, config.lambda_dir.join(plan.asset))
            .with_timeout(config.timeout)
            .with_environment(environment);
        handlers.insert(plan.id, unit.define_handler(plan.id, spec)?);
    }

    let api = unit.define_api(
        "TackleboxApi",
        RestApiOptions {
            stage: config.stage.clone(),
            cors_origins: config.cors_origins.clone(),
            ..RestApiOptions::default()
        },
    )?;
    let key = unit.add_api_key(api, "ApiKey", &config.stage)?;
    let plan = unit.add_usage_plan(
        api,
        "UsagePlan",
        &config.stage,
        Some("Enforce API Key requirement"),
    )?;
    unit.add_plan_key(plan, key)?;

    let mut nodes: BTreeMap<String, NodeRef> = BTreeMap::new();
    nodes.insert("/".to_string(), unit.root(api)?);

    let mut routes: Vec<(&str, &[HttpMethod], &str)> = ROUTES.to_vec();
    if config.db_reset_route {
        routes.push((RESET_ROUTE, RESET_METHODS, "dbSetup"));
    }
    for (path, methods, handler_id) in routes {
        let handler = lookup(unit, &handlers, handler_id, handler_id)?;
        let node = node_for(unit, &mut nodes, path)?;
        let integration = unit.integration(api, handler)?;
        for method in methods {
            unit.add_method(node, *method, integration, AuthPolicy::ApiKey)?;
        }
    }

    unit.publish_api_url("apiHost", api, Some("The API host URL"))?;
    unit.publish_api_key("apiKeyId", key, Some("The API key ID"))?;
    let db_setup = lookup(unit, &handlers, "dbSetup", "dbSetup")?;
    unit.publish_handler("dbSetupLambda", db_setup, Some("ARN for DB Setup lambda"))?;
    Ok(())
}

/// Entry of a blueprint table. A table naming a construct that was never
/// defined is a composition error.
fn lookup<K, Q, T>(unit: &DeployableUnit, table: &BTreeMap<K, T>, key: &Q, id: &str) -> Result<T>
where
    K: Borrow<Q> + Ord,
    Q: Ord + ?Sized,
    T: Copy,
{
    table.get(key).copied().ok_or_else(|| Error::UnknownResource {
        unit: unit.name().to_string(),
        id: id.to_string(),
    })
}

/// Node for `path`, creating missing ancestors on the way.
fn node_for(
    unit: &mut DeployableUnit,
    nodes: &mut BTreeMap<String, NodeRef>,
    path: &str,
) -> Result<NodeRef> {
    if let Some(node) = nodes.get(path) {
        return Ok(*node);
    }
    let (parent_path, segment) = match path.rsplit_once('/') {
        Some(("", segment)) => ("/", segment),
        Some((parent, segment)) => (parent, segment),
        None => ("/", path),
    };
    let parent = node_for(unit, nodes, parent_path)?;
    let node = unit.add_resource(parent, segment)?;
    debug!(path, "route node created");
    nodes.insert(path.to_string(), node);
    Ok(node)
}
