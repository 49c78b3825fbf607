//! Roles and policy statements.
//!
//! A role's effective permission set is the union of its managed policies and
//! its inline statements. Capabilities are derived from that union, so the
//! order in which policies are attached never matters.

use crate::topology::{network::Service, DeployableUnit, Error, Handle, Result, Token};
use serde::Serialize;
use serde_json::{json, Value};
use std::{collections::BTreeSet, fmt};
use tracing::debug;

pub type RoleRef = Handle<Role>;

const MANAGED_POLICY_PREFIX: &str = "arn:aws:iam::aws:policy/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Effect {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyStatement {
    effect: Effect,
    actions: Vec<String>,
    resources: Vec<Token>,
}

impl PolicyStatement {
    pub fn new<A, R>(effect: Effect, actions: A, resources: R) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        R: IntoIterator<Item = Token>,
    {
        Self {
            effect,
            actions: actions.into_iter().map(Into::into).collect(),
            resources: resources.into_iter().collect(),
        }
    }

    pub fn allow<A, R>(actions: A, resources: R) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        R: IntoIterator<Item = Token>,
    {
        Self::new(Effect::Allow, actions, resources)
    }

    pub fn deny<A, R>(actions: A, resources: R) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        R: IntoIterator<Item = Token>,
    {
        Self::new(Effect::Deny, actions, resources)
    }

    #[must_use]
    pub const fn effect(&self) -> Effect {
        self.effect
    }

    #[must_use]
    pub fn actions(&self) -> &[String] {
        &self.actions
    }

    #[must_use]
    pub fn resources(&self) -> &[Token] {
        &self.resources
    }

    /// Whether any action pattern of this statement covers `action`.
    #[must_use]
    pub fn matches(&self, action: &str) -> bool {
        self.actions
            .iter()
            .any(|pattern| action_matches(pattern, action))
    }

    fn is_empty(&self) -> bool {
        self.actions.is_empty() || self.resources.is_empty()
    }

    pub(crate) fn to_json(&self) -> Value {
        json!({
            "Effect": self.effect,
            "Action": self.actions,
            "Resource": self.resources,
        })
    }
}

/// IAM action matching: case-insensitive, `*` wildcards at the end of a pattern.
fn action_matches(pattern: &str, action: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let action = action.to_ascii_lowercase();
    match pattern.strip_suffix('*') {
        Some(prefix) => action.starts_with(prefix),
        None => pattern == action,
    }
}

/// One (effect, action, resource) triple of an effective permission set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Permission {
    pub effect: Effect,
    pub action: String,
    pub resource: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Principal {
    Service(String),
}

impl Principal {
    #[must_use]
    pub fn lambda() -> Self {
        Self::Service("lambda.amazonaws.com".to_string())
    }

    #[must_use]
    pub fn sns() -> Self {
        Self::Service("sns.amazonaws.com".to_string())
    }

    fn to_json(&self) -> Value {
        match self {
            Self::Service(service) => json!({ "Service": service }),
        }
    }
}

/// Reference to a provider-managed policy.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ManagedPolicy {
    arn: String,
}

impl ManagedPolicy {
    #[must_use]
    pub fn from_arn(arn: impl Into<String>) -> Self {
        Self { arn: arn.into() }
    }

    #[must_use]
    pub fn aws(name: &str) -> Self {
        Self::from_arn(format!("{MANAGED_POLICY_PREFIX}{name}"))
    }

    #[must_use]
    pub fn lambda_vpc_access() -> Self {
        Self::aws("service-role/AWSLambdaVPCAccessExecutionRole")
    }

    #[must_use]
    pub fn sns_full_access() -> Self {
        Self::aws("AmazonSNSFullAccess")
    }

    #[must_use]
    pub fn logs_full_access() -> Self {
        Self::aws("CloudWatchLogsFullAccess")
    }

    #[must_use]
    pub fn arn(&self) -> &str {
        &self.arn
    }

    /// Statements of the managed policy. Policies outside the catalog grant nothing.
    #[must_use]
    pub fn statements(&self) -> Vec<PolicyStatement> {
        let any = || [Token::literal("*")];
        match self.arn.strip_prefix(MANAGED_POLICY_PREFIX) {
            Some("service-role/AWSLambdaVPCAccessExecutionRole") => vec![PolicyStatement::allow(
                [
                    "logs:CreateLogGroup",
                    "logs:CreateLogStream",
                    "logs:PutLogEvents",
                    "ec2:CreateNetworkInterface",
                    "ec2:DescribeNetworkInterfaces",
                    "ec2:DeleteNetworkInterface",
                    "ec2:AssignPrivateIpAddresses",
                    "ec2:UnassignPrivateIpAddresses",
                ],
                any(),
            )],
            Some("AmazonSNSFullAccess") => vec![PolicyStatement::allow(["sns:*"], any())],
            Some("CloudWatchLogsFullAccess") => {
                vec![PolicyStatement::allow(["logs:*", "cloudwatch:GenerateQuery"], any())]
            }
            _ => Vec::new(),
        }
    }
}

/// Runtime permission a handler may rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    NetworkAccess,
    Messaging,
    Logging,
    FunctionPermissions,
    PassRole,
}

impl Capability {
    pub const ALL: [Self; 5] = [
        Self::NetworkAccess,
        Self::Messaging,
        Self::Logging,
        Self::FunctionPermissions,
        Self::PassRole,
    ];

    /// Actions a role must allow to hold this capability.
    #[must_use]
    pub const fn required_actions(self) -> &'static [&'static str] {
        match self {
            Self::NetworkAccess => &[
                "ec2:CreateNetworkInterface",
                "ec2:DescribeNetworkInterfaces",
                "ec2:DeleteNetworkInterface",
            ],
            Self::Messaging => &["sns:Publish", "sns:Subscribe"],
            Self::Logging => &["logs:CreateLogGroup", "logs:PutRetentionPolicy"],
            Self::FunctionPermissions => &["lambda:AddPermission"],
            Self::PassRole => &["iam:PassRole"],
        }
    }

    /// Service endpoint a network-bound resource needs to exercise this capability.
    #[must_use]
    pub const fn service(self) -> Option<Service> {
        match self {
            Self::Messaging => Some(Service::Sns),
            Self::Logging => Some(Service::CloudWatchLogs),
            Self::FunctionPermissions => Some(Service::Lambda),
            Self::NetworkAccess | Self::PassRole => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NetworkAccess => "network_access",
            Self::Messaging => "messaging",
            Self::Logging => "logging",
            Self::FunctionPermissions => "function_permissions",
            Self::PassRole => "pass_role",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cumulative role tiers; each tier's managed policies include the previous tier's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CapabilityTier {
    Connectivity,
    Messaging,
    Telemetry,
}

impl CapabilityTier {
    pub const ALL: [Self; 3] = [Self::Connectivity, Self::Messaging, Self::Telemetry];

    #[must_use]
    pub fn managed_policies(self) -> Vec<ManagedPolicy> {
        let mut policies = vec![ManagedPolicy::lambda_vpc_access()];
        if self >= Self::Messaging {
            policies.push(ManagedPolicy::sns_full_access());
        }
        if self >= Self::Telemetry {
            policies.push(ManagedPolicy::logs_full_access());
        }
        policies
    }

    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Connectivity => "Lambda role that allows access to VPCs",
            Self::Messaging => "Lambda role that allows access to VPCs and SNS",
            Self::Telemetry => "Lambda role that allows access to VPCs, SNS, and CW Logs",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoleSpec {
    name: String,
    description: Option<String>,
    principal: Principal,
    managed_policies: Vec<ManagedPolicy>,
    statements: Vec<PolicyStatement>,
}

impl RoleSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, principal: Principal) -> Self {
        Self {
            name: name.into(),
            description: None,
            principal,
            managed_policies: Vec::new(),
            statements: Vec::new(),
        }
    }

    /// A lambda role holding the managed policies of `tier`.
    #[must_use]
    pub fn for_tier(name: impl Into<String>, tier: CapabilityTier) -> Self {
        tier.managed_policies().into_iter().fold(
            Self::new(name, Principal::lambda()).with_description(tier.description()),
            Self::with_managed_policy,
        )
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_managed_policy(mut self, policy: ManagedPolicy) -> Self {
        if !self.managed_policies.contains(&policy) {
            self.managed_policies.push(policy);
        }
        self
    }

    #[must_use]
    pub fn with_statement(mut self, statement: PolicyStatement) -> Self {
        self.statements.push(statement);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Role {
    id: String,
    name: String,
    description: Option<String>,
    principal: Principal,
    managed_policies: Vec<ManagedPolicy>,
    statements: Vec<PolicyStatement>,
}

impl Role {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    #[must_use]
    pub fn managed_policies(&self) -> &[ManagedPolicy] {
        &self.managed_policies
    }

    #[must_use]
    pub fn statements(&self) -> &[PolicyStatement] {
        &self.statements
    }

    #[must_use]
    pub fn arn(&self) -> Token {
        Token::get_att(&self.id, "Arn")
    }

    /// Managed and inline statements together.
    #[must_use]
    pub fn effective_statements(&self) -> Vec<PolicyStatement> {
        self.managed_policies
            .iter()
            .flat_map(ManagedPolicy::statements)
            .chain(self.statements.iter().cloned())
            .collect()
    }

    #[must_use]
    pub fn effective_permissions(&self) -> BTreeSet<Permission> {
        self.effective_statements()
            .iter()
            .flat_map(|statement| {
                statement.actions.iter().flat_map(move |action| {
                    statement.resources.iter().map(move |resource| Permission {
                        effect: statement.effect,
                        action: action.clone(),
                        resource: resource.to_string(),
                    })
                })
            })
            .collect()
    }

    /// Whether the effective statements allow `action` and nothing denies it.
    #[must_use]
    pub fn allows(&self, action: &str) -> bool {
        let statements = self.effective_statements();
        let allowed = statements
            .iter()
            .any(|s| s.effect == Effect::Allow && s.matches(action));
        let denied = statements
            .iter()
            .any(|s| s.effect == Effect::Deny && s.matches(action));
        allowed && !denied
    }

    #[must_use]
    pub fn capabilities(&self) -> BTreeSet<Capability> {
        Capability::ALL
            .into_iter()
            .filter(|capability| {
                capability
                    .required_actions()
                    .iter()
                    .all(|action| self.allows(action))
            })
            .collect()
    }

    /// Identical (action, resource) pairs that are both allowed and denied.
    #[must_use]
    pub fn conflicts(&self) -> Vec<Error> {
        let permissions = self.effective_permissions();
        let allowed: BTreeSet<(String, &str)> = permissions
            .iter()
            .filter(|p| p.effect == Effect::Allow)
            .map(|p| (p.action.to_ascii_lowercase(), p.resource.as_str()))
            .collect();
        permissions
            .iter()
            .filter(|p| p.effect == Effect::Deny)
            .filter(|p| allowed.contains(&(p.action.to_ascii_lowercase(), p.resource.as_str())))
            .map(|p| Error::ConflictingStatements {
                role: self.name.clone(),
                action: p.action.clone(),
                resource: p.resource.clone(),
            })
            .collect()
    }

    pub(crate) fn to_json(&self) -> Value {
        let mut properties = json!({
            "RoleName": self.name,
            "AssumeRolePolicyDocument": {
                "Version": "2012-10-17",
                "Statement": [{
                    "Effect": "Allow",
                    "Action": "sts:AssumeRole",
                    "Principal": self.principal.to_json(),
                }],
            },
            "ManagedPolicyArns": self
                .managed_policies
                .iter()
                .map(ManagedPolicy::arn)
                .collect::<Vec<_>>(),
        });
        if let Some(description) = &self.description {
            properties["Description"] = json!(description);
        }
        if !self.statements.is_empty() {
            properties["Policies"] = json!([{
                "PolicyName": format!("{}DefaultPolicy", self.id),
                "PolicyDocument": {
                    "Version": "2012-10-17",
                    "Statement": self
                        .statements
                        .iter()
                        .map(PolicyStatement::to_json)
                        .collect::<Vec<_>>(),
                },
            }]);
        }
        json!({ "Type": "AWS::IAM::Role", "Properties": properties })
    }
}

impl DeployableUnit {
    /// Define a role.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateRoleName`] if the role name is taken in this unit,
    /// [`Error::DuplicateResource`] if `id` is taken, or [`Error::EmptyStatement`].
    pub fn define_role(&mut self, id: &str, spec: RoleSpec) -> Result<RoleRef> {
        if self.roles.iter().any(|role| role.name == spec.name) {
            return Err(Error::DuplicateRoleName {
                unit: self.name().to_string(),
                name: spec.name,
            });
        }
        if spec.statements.iter().any(PolicyStatement::is_empty) {
            return Err(Error::EmptyStatement {
                unit: self.name().to_string(),
                role: spec.name,
            });
        }
        self.claim(id)?;

        debug!(
            unit = %self.name(),
            role = %spec.name,
            managed = spec.managed_policies.len(),
            inline = spec.statements.len(),
            "role defined"
        );

        self.roles.push(Role {
            id: id.to_string(),
            name: spec.name,
            description: spec.description,
            principal: spec.principal,
            managed_policies: spec.managed_policies,
            statements: spec.statements,
        });
        Ok(Handle::new(self.id(), self.roles.len() - 1))
    }

    /// Define a lambda role for a capability tier.
    ///
    /// # Errors
    /// Same as [`DeployableUnit::define_role`].
    pub fn define_tier_role(
        &mut self,
        id: &str,
        name: &str,
        tier: CapabilityTier,
    ) -> Result<RoleRef> {
        self.define_role(id, RoleSpec::for_tier(name, tier))
    }

    /// Append a statement to a role. Existing statements are never touched.
    ///
    /// # Errors
    /// Returns an error for a foreign handle or an empty statement.
    pub fn attach_statement(&mut self, role: RoleRef, statement: PolicyStatement) -> Result<()> {
        let index = self.owned(role, self.roles.len())?;
        if statement.is_empty() {
            return Err(Error::EmptyStatement {
                unit: self.name().to_string(),
                role: self.roles[index].name.clone(),
            });
        }
        debug!(unit = %self.name(), role = %self.roles[index].name, "statement attached");
        self.roles[index].statements.push(statement);
        Ok(())
    }

    /// # Errors
    /// Returns [`Error::ForeignHandle`] if `role` was not issued by this unit.
    pub fn role(&self, role: RoleRef) -> Result<&Role> {
        let index = self.owned(role, self.roles.len())?;
        Ok(&self.roles[index])
    }

    /// # Errors
    /// Returns [`Error::ForeignHandle`] if `role` was not issued by this unit.
    pub fn role_arn(&self, role: RoleRef) -> Result<Token> {
        self.role(role).map(Role::arn)
    }

    #[must_use]
    pub fn roles(&self) -> &[Role] {
        &self.roles
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::topology::Assembly;

    fn unit() -> (Assembly, crate::topology::UnitId) {
        let mut assembly = Assembly::new();
        let id = assembly.add_unit("tacklebox-iam").unwrap();
        (assembly, id)
    }

    #[test]
    fn test_action_matching() {
        assert!(action_matches("sns:*", "sns:Publish"));
        assert!(action_matches("*", "lambda:AddPermission"));
        assert!(action_matches("logs:Put*", "logs:PutRetentionPolicy"));
        assert!(action_matches("IAM:passrole", "iam:PassRole"));
        assert!(!action_matches("sns:Publish", "sns:Subscribe"));
        assert!(!action_matches("logs:Put*", "logs:CreateLogGroup"));
    }

    #[test]
    fn test_tier_supersets() {
        let (mut assembly, id) = unit();
        let unit = assembly.unit_mut(id).unwrap();
        let roles: Vec<RoleRef> = CapabilityTier::ALL
            .iter()
            .map(|tier| {
                unit.define_tier_role(&format!("{tier:?}"), &format!("role-{tier:?}"), *tier)
                    .unwrap()
            })
            .collect();

        for pair in roles.windows(2) {
            let lower = unit.role(pair[0]).unwrap();
            let higher = unit.role(pair[1]).unwrap();
            assert!(higher
                .effective_permissions()
                .is_superset(&lower.effective_permissions()));
            assert!(higher.capabilities().is_superset(&lower.capabilities()));
        }

        let base = unit.role(roles[0]).unwrap().capabilities();
        assert!(base.contains(&Capability::NetworkAccess));
        assert!(!base.contains(&Capability::Messaging));

        let messaging = unit.role(roles[1]).unwrap().capabilities();
        assert!(messaging.contains(&Capability::Messaging));
        assert!(!messaging.contains(&Capability::Logging));

        let telemetry = unit.role(roles[2]).unwrap().capabilities();
        assert!(telemetry.contains(&Capability::Logging));
    }

    #[test]
    fn test_duplicate_role_name() {
        let (mut assembly, id) = unit();
        let unit = assembly.unit_mut(id).unwrap();
        unit.define_tier_role("vpcRole", "Tacklebox_lambdaVPCRole", CapabilityTier::Connectivity)
            .unwrap();
        let err = unit
            .define_tier_role("otherRole", "Tacklebox_lambdaVPCRole", CapabilityTier::Messaging)
            .unwrap_err();
        assert_eq!(
            err,
            Error::DuplicateRoleName {
                unit: "tacklebox-iam".to_string(),
                name: "Tacklebox_lambdaVPCRole".to_string()
            }
        );
    }

    #[test]
    fn test_attach_statement_is_append_only() {
        let (mut assembly, id) = unit();
        let unit = assembly.unit_mut(id).unwrap();
        let role = unit
            .define_tier_role("vpcRole", "vpc", CapabilityTier::Connectivity)
            .unwrap();
        let before = unit.role(role).unwrap().effective_permissions();

        unit.attach_statement(
            role,
            PolicyStatement::allow(["lambda:AddPermission"], [Token::literal("*")]),
        )
        .unwrap();

        let after = unit.role(role).unwrap();
        assert!(after.effective_permissions().is_superset(&before));
        assert!(after
            .capabilities()
            .contains(&Capability::FunctionPermissions));
    }

    #[test]
    fn test_conflicting_statements_reported() {
        let (mut assembly, id) = unit();
        let unit = assembly.unit_mut(id).unwrap();
        let role = unit
            .define_role(
                "feedback",
                RoleSpec::new("SNSSuccessFeedback", Principal::sns())
                    .with_statement(PolicyStatement::allow(
                        ["logs:PutLogEvents"],
                        [Token::literal("*")],
                    ))
                    .with_statement(PolicyStatement::deny(
                        ["logs:PutLogEvents"],
                        [Token::literal("*")],
                    )),
            )
            .unwrap();
        let conflicts = unit.role(role).unwrap().conflicts();
        assert_eq!(conflicts.len(), 1);
        assert!(matches!(
            &conflicts[0],
            Error::ConflictingStatements { action, .. } if action == "logs:PutLogEvents"
        ));
    }

    #[test]
    fn test_deny_on_other_resource_is_not_a_conflict() {
        let role = Role {
            id: "r".to_string(),
            name: "r".to_string(),
            description: None,
            principal: Principal::lambda(),
            managed_policies: Vec::new(),
            statements: vec![
                PolicyStatement::allow(["iam:PassRole"], [Token::literal("*")]),
                PolicyStatement::deny(["iam:PassRole"], [Token::get_att("admin", "Arn")]),
            ],
        };
        assert!(role.conflicts().is_empty());
        // a deny on any resource removes the capability
        assert!(!role.capabilities().contains(&Capability::PassRole));
    }

    #[test]
    fn test_unknown_managed_policy_grants_nothing() {
        let policy = ManagedPolicy::from_arn("arn:aws:iam::123456789012:policy/custom");
        assert!(policy.statements().is_empty());
    }

    #[test]
    fn test_empty_statement_rejected() {
        let (mut assembly, id) = unit();
        let unit = assembly.unit_mut(id).unwrap();
        let role = unit
            .define_tier_role("vpcRole", "vpc", CapabilityTier::Connectivity)
            .unwrap();
        let empty: [&str; 0] = [];
        assert!(matches!(
            unit.attach_statement(role, PolicyStatement::allow(empty, [Token::literal("*")])),
            Err(Error::EmptyStatement { .. })
        ));
    }
}
