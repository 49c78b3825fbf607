//! REST surface.
//!
//! A [`RestApi`] owns an arena of route nodes rooted at `/`. Literal siblings
//! must be unique and a position holds at most one parameter segment; a
//! literal and a parameter may share a parent. Every method names its
//! authorization explicitly, nothing is inherited from parent nodes.

use crate::topology::{handler::HandlerRef, DeployableUnit, Error, Handle, Result, Token};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use std::{collections::BTreeMap, fmt, str::FromStr};
use tracing::{debug, info, instrument};
use url::Url;

pub type ApiRef = Handle<RestApi>;

const ROOT: usize = 0;
const LITERAL_SEGMENT: &str = r"^[A-Za-z0-9._-]+$";
const PARAM_SEGMENT: &str = r"^\{([A-Za-z_][A-Za-z0-9_]*)(\+?)\}$";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
    Any,
}

impl HttpMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Any => "ANY",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            "ANY" => Ok(Self::Any),
            other => Err(format!("unknown HTTP method: {other}")),
        }
    }
}

/// Authorization of a single method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPolicy {
    ApiKey,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Param { name: String, greedy: bool },
}

impl Segment {
    /// Parse `raw` as a literal (`services`) or a parameter (`{service_id}`, `{proxy+}`).
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        if Regex::new(LITERAL_SEGMENT).is_ok_and(|re| re.is_match(raw)) {
            return Some(Self::Literal(raw.to_string()));
        }
        let captures = Regex::new(PARAM_SEGMENT).ok()?.captures(raw)?;
        Some(Self::Param {
            name: captures.get(1)?.as_str().to_string(),
            greedy: captures.get(2).is_some_and(|m| !m.as_str().is_empty()),
        })
    }

    /// Siblings collide on the same literal, on two parameters, or when they
    /// render to the same logical id part (`event_types` and `event-types`).
    fn collides(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Literal(a), Self::Literal(b)) if a == b => true,
            (Self::Param { .. }, Self::Param { .. }) => true,
            _ => self.logical_part() == other.logical_part(),
        }
    }

    fn logical_part(&self) -> String {
        match self {
            Self::Literal(name) => camel_case(name),
            Self::Param { name, .. } => format!("Param{}", camel_case(name)),
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(name) => f.write_str(name),
            Self::Param { name, greedy } => {
                write!(f, "{{{name}{}}}", if *greedy { "+" } else { "" })
            }
        }
    }
}

fn camel_case(raw: &str) -> String {
    raw.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_ascii_uppercase().to_string() + chars.as_str()
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndpointType {
    Edge,
    #[default]
    Regional,
    Private,
}

impl EndpointType {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Edge => "EDGE",
            Self::Regional => "REGIONAL",
            Self::Private => "PRIVATE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestApiOptions {
    pub stage: String,
    pub endpoint: EndpointType,
    /// Origins answered by the preflight `OPTIONS` method. Empty disables CORS.
    pub cors_origins: Vec<String>,
}

impl Default for RestApiOptions {
    fn default() -> Self {
        Self {
            stage: "v1".to_string(),
            endpoint: EndpointType::Regional,
            cors_origins: vec!["*".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef {
    api: ApiRef,
    index: usize,
}

impl NodeRef {
    #[must_use]
    pub const fn api(&self) -> ApiRef {
        self.api
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntegrationRef {
    api: ApiRef,
    index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ApiKeyRef {
    api: ApiRef,
    index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsagePlanRef {
    api: ApiRef,
    index: usize,
}

#[derive(Debug, Clone)]
struct RouteNode {
    segment: Option<Segment>,
    parent: Option<usize>,
    children: Vec<usize>,
    methods: BTreeMap<HttpMethod, MethodBinding>,
}

#[derive(Debug, Clone, Copy)]
struct MethodBinding {
    integration: usize,
    auth: AuthPolicy,
}

/// Proxy binding of a handler into an API.
#[derive(Debug, Clone)]
pub struct Integration {
    handler: HandlerRef,
    handler_id: String,
}

impl Integration {
    #[must_use]
    pub const fn handler(&self) -> HandlerRef {
        self.handler
    }
}

#[derive(Debug, Clone)]
pub struct ApiKey {
    id: String,
    key_name: String,
}

#[derive(Debug, Clone)]
pub struct UsagePlan {
    id: String,
    name: String,
    description: Option<String>,
    keys: Vec<usize>,
}

/// Serializable view of a finalized API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteTree {
    pub api: String,
    pub stage: String,
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub path: String,
    pub methods: Vec<RouteMethod>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteMethod {
    pub method: HttpMethod,
    pub handler: String,
    pub api_key_required: bool,
}

impl RouteTree {
    /// Every (path, method) pair, depth first.
    pub fn methods(&self) -> impl Iterator<Item = (&str, &RouteMethod)> {
        self.routes.iter().flat_map(|route| {
            route
                .methods
                .iter()
                .map(move |method| (route.path.as_str(), method))
        })
    }

    #[must_use]
    pub fn find(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.path == path)
    }
}

#[derive(Debug, Clone)]
pub struct RestApi {
    id: String,
    options: RestApiOptions,
    nodes: Vec<RouteNode>,
    integrations: Vec<Integration>,
    keys: Vec<ApiKey>,
    plans: Vec<UsagePlan>,
    tree: Option<RouteTree>,
}

impl RestApi {
    fn new(id: &str, options: RestApiOptions) -> Self {
        Self {
            id: id.to_string(),
            options,
            nodes: vec![RouteNode {
                segment: None,
                parent: None,
                children: Vec::new(),
                methods: BTreeMap::new(),
            }],
            integrations: Vec::new(),
            keys: Vec::new(),
            plans: Vec::new(),
            tree: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn options(&self) -> &RestApiOptions {
        &self.options
    }

    #[must_use]
    pub const fn tree(&self) -> Option<&RouteTree> {
        self.tree.as_ref()
    }

    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        self.tree.is_some()
    }

    #[must_use]
    pub fn integrations(&self) -> &[Integration] {
        &self.integrations
    }

    /// Base URL of the deployed stage.
    #[must_use]
    pub fn url(&self) -> Token {
        Token::Join(vec![
            Token::literal("https://"),
            Token::reference(&self.id),
            Token::literal(".execute-api."),
            Token::region(),
            Token::literal("."),
            Token::url_suffix(),
            Token::literal(format!("/{}/", self.options.stage)),
        ])
    }

    fn path(&self, index: usize) -> String {
        let mut segments = Vec::new();
        let mut cursor = Some(index);
        while let Some(current) = cursor {
            let node = &self.nodes[current];
            if let Some(segment) = &node.segment {
                segments.push(segment.to_string());
            }
            cursor = node.parent;
        }
        segments.reverse();
        format!("/{}", segments.join("/"))
    }

    fn logical_id(&self, index: usize) -> String {
        let mut parts = Vec::new();
        let mut cursor = Some(index);
        while let Some(current) = cursor {
            let node = &self.nodes[current];
            if let Some(segment) = &node.segment {
                parts.push(segment.logical_part());
            }
            cursor = node.parent;
        }
        if parts.is_empty() {
            return format!("{}Root", self.id);
        }
        parts.reverse();
        format!("{}{}", self.id, parts.concat())
    }

    fn resource_token(&self, index: usize) -> Token {
        if index == ROOT {
            Token::get_att(&self.id, "RootResourceId")
        } else {
            Token::reference(self.logical_id(index))
        }
    }

    fn stage_id(&self) -> String {
        format!("{}DeploymentStage{}", self.id, camel_case(&self.options.stage))
    }

    /// Depth-first node order, children in insertion order.
    fn walk(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![ROOT];
        while let Some(index) = stack.pop() {
            order.push(index);
            stack.extend(self.nodes[index].children.iter().rev());
        }
        order
    }

    /// Integrations no method is bound to. These prevent finalization.
    fn orphans(&self) -> Vec<Error> {
        self
            .integrations
            .iter()
            .enumerate()
            .filter(|(index, _)| {
                !self
                    .nodes
                    .iter()
                    .any(|node| node.methods.values().any(|b| b.integration == *index))
            })
            .map(|(_, integration)| Error::OrphanIntegration {
                api: self.id.clone(),
                handler: integration.handler_id.clone(),
            })
            .collect()
    }

    /// Findings that make the API invalid: orphaned integrations, and
    /// API-key methods without a usage plan that carries a key.
    #[must_use]
    pub fn check(&self) -> Vec<Error> {
        let mut errors = self.orphans();
        let needs_key = self
            .nodes
            .iter()
            .any(|node| node.methods.values().any(|b| b.auth == AuthPolicy::ApiKey));
        let has_keyed_plan = self.plans.iter().any(|plan| !plan.keys.is_empty());
        if needs_key && !has_keyed_plan {
            errors.push(Error::MissingUsagePlan {
                api: self.id.clone(),
            });
        }
        errors
    }

    pub(crate) fn build_tree(&self) -> RouteTree {
        let routes = self
            .walk()
            .into_iter()
            .filter(|index| !self.nodes[*index].methods.is_empty())
            .map(|index| Route {
                path: self.path(index),
                methods: self.nodes[index]
                    .methods
                    .iter()
                    .map(|(method, binding)| RouteMethod {
                        method: *method,
                        handler: self.integrations[binding.integration].handler_id.clone(),
                        api_key_required: binding.auth == AuthPolicy::ApiKey,
                    })
                    .collect(),
            })
            .collect();
        RouteTree {
            api: self.id.clone(),
            stage: self.options.stage.clone(),
            routes,
        }
    }

    pub(crate) fn render(&self) -> Vec<(String, Value)> {
        let api = Token::reference(&self.id);
        let mut resources = vec![(
            self.id.clone(),
            json!({
                "Type": "AWS::ApiGateway::RestApi",
                "Properties": {
                    "Name": self.id,
                    "EndpointConfiguration": { "Types": [self.options.endpoint.as_str()] },
                },
            }),
        )];
        let mut method_ids = Vec::new();

        for index in self.walk() {
            let node = &self.nodes[index];
            let logical_id = self.logical_id(index);
            if let (Some(segment), Some(parent)) = (&node.segment, node.parent) {
                resources.push((
                    logical_id.clone(),
                    json!({
                        "Type": "AWS::ApiGateway::Resource",
                        "Properties": {
                            "ParentId": self.resource_token(parent),
                            "PathPart": segment.to_string(),
                            "RestApiId": api,
                        },
                    }),
                ));
            }

            for (method, binding) in &node.methods {
                let integration = &self.integrations[binding.integration];
                let method_id = format!("{logical_id}{method}");
                resources.push((
                    method_id.clone(),
                    json!({
                        "Type": "AWS::ApiGateway::Method",
                        "Properties": {
                            "HttpMethod": method,
                            "ResourceId": self.resource_token(index),
                            "RestApiId": api,
                            "AuthorizationType": "NONE",
                            "ApiKeyRequired": binding.auth == AuthPolicy::ApiKey,
                            "Integration": {
                                "Type": "AWS_PROXY",
                                "IntegrationHttpMethod": "POST",
                                "Uri": Token::Join(vec![
                                    Token::literal("arn:aws:apigateway:"),
                                    Token::region(),
                                    Token::literal(":lambda:path/2015-03-31/functions/"),
                                    Token::get_att(&integration.handler_id, "Arn"),
                                    Token::literal("/invocations"),
                                ]),
                            },
                        },
                    }),
                ));
                method_ids.push(method_id);
            }

            if !self.options.cors_origins.is_empty()
                && !node.methods.contains_key(&HttpMethod::Options)
            {
                let method_id = format!("{logical_id}OPTIONS");
                resources.push((method_id.clone(), self.render_preflight(index)));
                method_ids.push(method_id);
            }
        }

        for integration in &self.integrations {
            resources.push((
                format!("{}{}Permission", self.id, integration.handler_id),
                json!({
                    "Type": "AWS::Lambda::Permission",
                    "Properties": {
                        "Action": "lambda:InvokeFunction",
                        "FunctionName": Token::get_att(&integration.handler_id, "Arn"),
                        "Principal": "apigateway.amazonaws.com",
                        "SourceArn": Token::Join(vec![
                            Token::literal("arn:aws:execute-api:"),
                            Token::region(),
                            Token::literal(":"),
                            Token::reference("AWS::AccountId"),
                            Token::literal(":"),
                            api.clone(),
                            Token::literal("/*"),
                        ]),
                    },
                }),
            ));
        }

        let deployment = format!("{}Deployment", self.id);
        resources.push((
            deployment.clone(),
            json!({
                "Type": "AWS::ApiGateway::Deployment",
                "Properties": { "RestApiId": api },
                "DependsOn": method_ids,
            }),
        ));
        resources.push((
            self.stage_id(),
            json!({
                "Type": "AWS::ApiGateway::Stage",
                "Properties": {
                    "RestApiId": api,
                    "DeploymentId": Token::reference(deployment),
                    "StageName": self.options.stage,
                },
            }),
        ));

        for key in &self.keys {
            resources.push((
                key.id.clone(),
                json!({
                    "Type": "AWS::ApiGateway::ApiKey",
                    "Properties": {
                        "Name": key.key_name,
                        "Enabled": true,
                        "StageKeys": [{
                            "RestApiId": api,
                            "StageName": Token::reference(self.stage_id()),
                        }],
                    },
                }),
            ));
        }

        for plan in &self.plans {
            let mut properties = json!({
                "UsagePlanName": plan.name,
                "ApiStages": [{ "ApiId": api, "Stage": Token::reference(self.stage_id()) }],
            });
            if let Some(description) = &plan.description {
                properties["Description"] = json!(description);
            }
            resources.push((
                plan.id.clone(),
                json!({ "Type": "AWS::ApiGateway::UsagePlan", "Properties": properties }),
            ));
            for key in &plan.keys {
                let key = &self.keys[*key];
                resources.push((
                    format!("{}{}", plan.id, key.id),
                    json!({
                        "Type": "AWS::ApiGateway::UsagePlanKey",
                        "Properties": {
                            "KeyId": Token::reference(&key.id),
                            "KeyType": "API_KEY",
                            "UsagePlanId": Token::reference(&plan.id),
                        },
                    }),
                ));
            }
        }
        resources
    }

    fn render_preflight(&self, index: usize) -> Value {
        let origin = self.options.cors_origins.join(",");
        json!({
            "Type": "AWS::ApiGateway::Method",
            "Properties": {
                "HttpMethod": "OPTIONS",
                "ResourceId": self.resource_token(index),
                "RestApiId": Token::reference(&self.id),
                "AuthorizationType": "NONE",
                "Integration": {
                    "Type": "MOCK",
                    "RequestTemplates": { "application/json": "{ statusCode: 200 }" },
                    "IntegrationResponses": [{
                        "StatusCode": "204",
                        "ResponseParameters": {
                            "method.response.header.Access-Control-Allow-Headers":
                                "'Content-Type,X-Amz-Date,Authorization,X-Api-Key,X-Amz-Security-Token,X-Amz-User-Agent'",
                            "method.response.header.Access-Control-Allow-Origin": format!("'{origin}'"),
                            "method.response.header.Access-Control-Allow-Methods":
                                "'OPTIONS,GET,PUT,POST,DELETE,PATCH,HEAD'",
                        },
                    }],
                },
                "MethodResponses": [{
                    "StatusCode": "204",
                    "ResponseParameters": {
                        "method.response.header.Access-Control-Allow-Headers": true,
                        "method.response.header.Access-Control-Allow-Origin": true,
                        "method.response.header.Access-Control-Allow-Methods": true,
                    },
                }],
            },
        })
    }
}

/// The stage becomes the first path segment of every URL of the API.
fn stage_is_valid(stage: &str) -> bool {
    !stage.is_empty()
        && Url::parse(&format!("https://api.example.com/{stage}/"))
            .is_ok_and(|url| url.path() == format!("/{stage}/"))
}

impl DeployableUnit {
    /// Define a REST API with an empty root.
    ///
    /// # Errors
    /// Returns [`Error::InvalidStage`] or [`Error::DuplicateResource`].
    pub fn define_api(&mut self, id: &str, options: RestApiOptions) -> Result<ApiRef> {
        if !stage_is_valid(&options.stage) {
            return Err(Error::InvalidStage {
                api: id.to_string(),
                stage: options.stage,
            });
        }
        self.claim(id)?;
        debug!(unit = %self.name(), api = id, stage = %options.stage, "api defined");
        self.apis.push(RestApi::new(id, options));
        Ok(Handle::new(self.id(), self.apis.len() - 1))
    }

    /// # Errors
    /// Returns [`Error::ForeignHandle`] if `api` was not issued by this unit.
    pub fn root(&self, api: ApiRef) -> Result<NodeRef> {
        self.api(api)?;
        Ok(NodeRef { api, index: ROOT })
    }

    fn open_api(&mut self, api: ApiRef) -> Result<&mut RestApi> {
        let index = self.owned(api, self.apis.len())?;
        let rest_api = &mut self.apis[index];
        if rest_api.is_finalized() {
            return Err(Error::RouteTreeFinalized {
                api: rest_api.id.clone(),
            });
        }
        Ok(rest_api)
    }

    /// Add a child segment under `parent`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidSegment`], [`Error::DuplicateSibling`] or
    /// [`Error::RouteTreeFinalized`].
    pub fn add_resource(&mut self, parent: NodeRef, segment: &str) -> Result<NodeRef> {
        let rest_api = self.open_api(parent.api)?;
        let Some(parsed) = Segment::parse(segment) else {
            return Err(Error::InvalidSegment {
                path: rest_api.path(parent.index),
                segment: segment.to_string(),
            });
        };
        let collision = rest_api.nodes[parent.index]
            .children
            .iter()
            .filter_map(|child| rest_api.nodes[*child].segment.as_ref())
            .any(|sibling| sibling.collides(&parsed));
        if collision {
            return Err(Error::DuplicateSibling {
                path: rest_api.path(parent.index),
                segment: segment.to_string(),
            });
        }

        let index = rest_api.nodes.len();
        rest_api.nodes.push(RouteNode {
            segment: Some(parsed),
            parent: Some(parent.index),
            children: Vec::new(),
            methods: BTreeMap::new(),
        });
        rest_api.nodes[parent.index].children.push(index);
        debug!(api = %rest_api.id, path = %rest_api.path(index), "resource added");
        Ok(NodeRef {
            api: parent.api,
            index,
        })
    }

    /// Bind `method` on `node` to an integration of the same API.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateMethod`], [`Error::RouteTreeFinalized`], or
    /// [`Error::ForeignHandle`] when the integration belongs to another API.
    pub fn add_method(
        &mut self,
        node: NodeRef,
        method: HttpMethod,
        integration: IntegrationRef,
        auth: AuthPolicy,
    ) -> Result<()> {
        if integration.api != node.api {
            return Err(Error::ForeignHandle {
                unit: self.name().to_string(),
                owner: integration.api.unit().index(),
            });
        }
        let rest_api = self.open_api(node.api)?;
        if rest_api.nodes[node.index].methods.contains_key(&method) {
            return Err(Error::DuplicateMethod {
                path: rest_api.path(node.index),
                method: method.to_string(),
            });
        }
        rest_api.nodes[node.index].methods.insert(
            method,
            MethodBinding {
                integration: integration.index,
                auth,
            },
        );
        debug!(
            api = %rest_api.id,
            path = %rest_api.path(node.index),
            method = %method,
            handler = %rest_api.integrations[integration.index].handler_id,
            "method bound"
        );
        Ok(())
    }

    /// Integration of `handler` into `api`. One integration per handler, reused by every method.
    ///
    /// # Errors
    /// Returns [`Error::ForeignHandle`] or [`Error::RouteTreeFinalized`].
    pub fn integration(&mut self, api: ApiRef, handler: HandlerRef) -> Result<IntegrationRef> {
        let handler_id = self.handler(handler)?.id().to_string();
        let rest_api = self.open_api(api)?;
        if let Some(index) = rest_api
            .integrations
            .iter()
            .position(|i| i.handler == handler)
        {
            return Ok(IntegrationRef { api, index });
        }
        rest_api.integrations.push(Integration {
            handler,
            handler_id,
        });
        Ok(IntegrationRef {
            api,
            index: rest_api.integrations.len() - 1,
        })
    }

    /// # Errors
    /// Returns [`Error::DuplicateResource`] or [`Error::RouteTreeFinalized`].
    pub fn add_api_key(&mut self, api: ApiRef, id: &str, key_name: &str) -> Result<ApiKeyRef> {
        self.open_api(api)?;
        self.claim(id)?;
        let rest_api = self.open_api(api)?;
        rest_api.keys.push(ApiKey {
            id: id.to_string(),
            key_name: key_name.to_string(),
        });
        Ok(ApiKeyRef {
            api,
            index: rest_api.keys.len() - 1,
        })
    }

    /// # Errors
    /// Returns [`Error::DuplicateResource`] or [`Error::RouteTreeFinalized`].
    pub fn add_usage_plan(
        &mut self,
        api: ApiRef,
        id: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<UsagePlanRef> {
        self.open_api(api)?;
        self.claim(id)?;
        let rest_api = self.open_api(api)?;
        rest_api.plans.push(UsagePlan {
            id: id.to_string(),
            name: name.to_string(),
            description: description.map(ToString::to_string),
            keys: Vec::new(),
        });
        Ok(UsagePlanRef {
            api,
            index: rest_api.plans.len() - 1,
        })
    }

    /// # Errors
    /// Returns [`Error::ForeignHandle`] when plan and key belong to different APIs.
    pub fn add_plan_key(&mut self, plan: UsagePlanRef, key: ApiKeyRef) -> Result<()> {
        if plan.api != key.api {
            return Err(Error::ForeignHandle {
                unit: self.name().to_string(),
                owner: key.api.unit().index(),
            });
        }
        let rest_api = self.open_api(plan.api)?;
        let keys = &mut rest_api.plans[plan.index].keys;
        if !keys.contains(&key.index) {
            keys.push(key.index);
        }
        Ok(())
    }

    /// Freeze the route tree. Calling it again returns the same tree.
    ///
    /// A missing usage plan is left to [`crate::topology::validate::validate`].
    ///
    /// # Errors
    /// Returns [`Error::OrphanIntegration`], wrapped in [`Error::Invalid`]
    /// when there are several.
    #[instrument(skip(self))]
    pub fn finalize_routes(&mut self, api: ApiRef) -> Result<RouteTree> {
        let index = self.owned(api, self.apis.len())?;
        let rest_api = &mut self.apis[index];
        if let Some(tree) = &rest_api.tree {
            return Ok(tree.clone());
        }
        let mut errors = rest_api.orphans();
        match errors.len() {
            0 => {}
            1 => return Err(errors.remove(0)),
            _ => return Err(Error::Invalid(errors)),
        }
        let tree = rest_api.build_tree();
        info!(
            api = %rest_api.id,
            routes = tree.routes.len(),
            methods = tree.methods().count(),
            "route tree finalized"
        );
        rest_api.tree = Some(tree.clone());
        Ok(tree)
    }

    /// # Errors
    /// Returns [`Error::ForeignHandle`] if `api` was not issued by this unit.
    pub fn api(&self, api: ApiRef) -> Result<&RestApi> {
        let index = self.owned(api, self.apis.len())?;
        Ok(&self.apis[index])
    }

    /// # Errors
    /// Returns [`Error::ForeignHandle`] if `api` was not issued by this unit.
    pub fn api_url(&self, api: ApiRef) -> Result<Token> {
        self.api(api).map(RestApi::url)
    }

    /// `Ref` of an API key resolves to its id.
    ///
    /// # Errors
    /// Returns [`Error::ForeignHandle`] if `key` was not issued by this unit.
    pub fn api_key_id(&self, key: ApiKeyRef) -> Result<Token> {
        let rest_api = self.api(key.api)?;
        Ok(Token::reference(&rest_api.keys[key.index].id))
    }

    #[must_use]
    pub fn apis(&self) -> &[RestApi] {
        &self.apis
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::topology::{
        handler::{HandlerSpec, RoleBinding},
        iam::Capability,
        network::NetworkSpec,
        Assembly, UnitId,
    };

    struct Fixture {
        assembly: Assembly,
        unit: UnitId,
        api: ApiRef,
        users: HandlerRef,
        events: HandlerRef,
        messages: HandlerRef,
    }

    fn fixture() -> Fixture {
        let mut assembly = Assembly::new();
        let unit = assembly.add_unit("Tacklebox").unwrap();
        let app = assembly.unit_mut(unit).unwrap();
        let network = app
            .define_network(
                "TackleboxVpc",
                NetworkSpec::new("10.0.0.0/16".parse().unwrap(), 2),
            )
            .unwrap();
        let role = app.import_role("lambdaVpcSnsRole", [Capability::NetworkAccess]);
        let mut handler = |id: &str| {
            app.define_handler(id, HandlerSpec::new(role, network, format!("./lambdas/{id}")))
                .unwrap()
        };
        let users = handler("ManageUsers");
        let events = handler("ManageEvents");
        let messages = handler("ManageMessages");
        let api = app
            .define_api("TackleboxApi", RestApiOptions::default())
            .unwrap();
        Fixture {
            assembly,
            unit,
            api,
            users,
            events,
            messages,
        }
    }

    fn keyed(app: &mut DeployableUnit, api: ApiRef) {
        let key = app.add_api_key(api, "TackleboxApiApiKey", "v1").unwrap();
        let plan = app
            .add_usage_plan(api, "TackleboxApiUsagePlan", "v1", Some("Enforce API Key requirement"))
            .unwrap();
        app.add_plan_key(plan, key).unwrap();
    }

    #[test]
    fn test_segment_parsing() {
        assert_eq!(
            Segment::parse("event_types"),
            Some(Segment::Literal("event_types".to_string()))
        );
        assert_eq!(
            Segment::parse("{service_id}"),
            Some(Segment::Param {
                name: "service_id".to_string(),
                greedy: false
            })
        );
        assert!(matches!(
            Segment::parse("{proxy+}"),
            Some(Segment::Param { greedy: true, .. })
        ));
        assert_eq!(Segment::parse("a/b"), None);
        assert_eq!(Segment::parse("{1abc}"), None);
        assert_eq!(Segment::parse(""), None);
    }

    #[test]
    fn test_duplicate_sibling() {
        let Fixture {
            mut assembly,
            unit,
            api,
            ..
        } = fixture();
        let app = assembly.unit_mut(unit).unwrap();
        let root = app.root(api).unwrap();
        app.add_resource(root, "services").unwrap();
        assert_eq!(
            app.add_resource(root, "services"),
            Err(Error::DuplicateSibling {
                path: "/".to_string(),
                segment: "services".to_string(),
            })
        );
    }

    #[test]
    fn test_literal_and_param_siblings_coexist() {
        let Fixture {
            mut assembly,
            unit,
            api,
            ..
        } = fixture();
        let app = assembly.unit_mut(unit).unwrap();
        let root = app.root(api).unwrap();
        let services = app.add_resource(root, "services").unwrap();
        app.add_resource(services, "{service_id}").unwrap();
        app.add_resource(services, "search").unwrap();
        assert!(matches!(
            app.add_resource(services, "{id}"),
            Err(Error::DuplicateSibling { path, .. }) if path == "/services"
        ));
        assert!(matches!(
            app.add_resource(services, "has space"),
            Err(Error::InvalidSegment { .. })
        ));
    }

    #[test]
    fn test_siblings_rendering_to_the_same_id_collide() {
        let Fixture {
            mut assembly,
            unit,
            api,
            ..
        } = fixture();
        let app = assembly.unit_mut(unit).unwrap();
        let root = app.root(api).unwrap();
        app.add_resource(root, "event_types").unwrap();
        assert_eq!(
            app.add_resource(root, "event-types"),
            Err(Error::DuplicateSibling {
                path: "/".to_string(),
                segment: "event-types".to_string(),
            })
        );

        let users = app.add_resource(root, "users").unwrap();
        app.add_resource(users, "{user_id}").unwrap();
        assert!(matches!(
            app.add_resource(users, "ParamUserId"),
            Err(Error::DuplicateSibling { path, .. }) if path == "/users"
        ));
    }

    #[test]
    fn test_duplicate_method() {
        let Fixture {
            mut assembly,
            unit,
            api,
            users,
            ..
        } = fixture();
        let app = assembly.unit_mut(unit).unwrap();
        let root = app.root(api).unwrap();
        let node = app.add_resource(root, "users").unwrap();
        let integration = app.integration(api, users).unwrap();
        app.add_method(node, HttpMethod::Get, integration, AuthPolicy::ApiKey)
            .unwrap();
        assert!(matches!(
            app.add_method(node, HttpMethod::Get, integration, AuthPolicy::None),
            Err(Error::DuplicateMethod { .. })
        ));
    }

    #[test]
    fn test_user_events_and_messages_tree() {
        let Fixture {
            mut assembly,
            unit,
            api,
            users,
            events,
            messages,
        } = fixture();
        let app = assembly.unit_mut(unit).unwrap();
        keyed(app, api);
        let events = app.integration(api, events).unwrap();
        let messages = app.integration(api, messages).unwrap();
        let users = app.integration(api, users).unwrap();

        let root = app.root(api).unwrap();
        let user = app.add_resource(root, "{user_id}").unwrap();
        app.add_method(user, HttpMethod::Get, users, AuthPolicy::ApiKey)
            .unwrap();
        let events_node = app.add_resource(user, "events").unwrap();
        let event = app.add_resource(events_node, "{event_id}").unwrap();
        app.add_method(event, HttpMethod::Get, events, AuthPolicy::ApiKey)
            .unwrap();
        let messages_node = app.add_resource(user, "messages").unwrap();
        let message = app.add_resource(messages_node, "{message_id}").unwrap();
        app.add_method(message, HttpMethod::Get, messages, AuthPolicy::ApiKey)
            .unwrap();
        let resend = app.add_resource(message, "resend").unwrap();
        app.add_method(resend, HttpMethod::Post, messages, AuthPolicy::ApiKey)
            .unwrap();

        let tree = app.finalize_routes(api).unwrap();
        let reachable: Vec<(String, HttpMethod)> = tree
            .methods()
            .map(|(path, m)| (path.to_string(), m.method))
            .collect();
        assert_eq!(
            reachable,
            vec![
                ("/{user_id}".to_string(), HttpMethod::Get),
                ("/{user_id}/events/{event_id}".to_string(), HttpMethod::Get),
                ("/{user_id}/messages/{message_id}".to_string(), HttpMethod::Get),
                (
                    "/{user_id}/messages/{message_id}/resend".to_string(),
                    HttpMethod::Post
                ),
            ]
        );
        assert!(tree.methods().all(|(_, m)| m.api_key_required));
        assert_eq!(
            tree.find("/{user_id}/messages/{message_id}/resend")
                .unwrap()
                .methods[0]
                .handler,
            "ManageMessages"
        );
    }

    #[test]
    fn test_finalize_is_idempotent_and_freezes() {
        let Fixture {
            mut assembly,
            unit,
            api,
            users,
            ..
        } = fixture();
        let app = assembly.unit_mut(unit).unwrap();
        let root = app.root(api).unwrap();
        let node = app.add_resource(root, "users").unwrap();
        let integration = app.integration(api, users).unwrap();
        app.add_method(node, HttpMethod::Get, integration, AuthPolicy::None)
            .unwrap();

        let first = app.finalize_routes(api).unwrap();
        assert_eq!(first, app.finalize_routes(api).unwrap());
        assert_eq!(
            app.add_resource(root, "services"),
            Err(Error::RouteTreeFinalized {
                api: "TackleboxApi".to_string()
            })
        );
    }

    #[test]
    fn test_orphan_integration() {
        let Fixture {
            mut assembly,
            unit,
            api,
            users,
            events,
            ..
        } = fixture();
        let app = assembly.unit_mut(unit).unwrap();
        let root = app.root(api).unwrap();
        let node = app.add_resource(root, "users").unwrap();
        let integration = app.integration(api, users).unwrap();
        app.add_method(node, HttpMethod::Get, integration, AuthPolicy::None)
            .unwrap();
        app.integration(api, events).unwrap();

        assert_eq!(
            app.finalize_routes(api),
            Err(Error::OrphanIntegration {
                api: "TackleboxApi".to_string(),
                handler: "ManageEvents".to_string(),
            })
        );
    }

    #[test]
    fn test_api_key_methods_need_a_usage_plan() {
        let Fixture {
            mut assembly,
            unit,
            api,
            users,
            ..
        } = fixture();
        let app = assembly.unit_mut(unit).unwrap();
        let root = app.root(api).unwrap();
        let node = app.add_resource(root, "users").unwrap();
        let integration = app.integration(api, users).unwrap();
        app.add_method(node, HttpMethod::Get, integration, AuthPolicy::ApiKey)
            .unwrap();
        assert_eq!(
            app.api(api).unwrap().check(),
            vec![Error::MissingUsagePlan {
                api: "TackleboxApi".to_string()
            }]
        );
        keyed(app, api);
        assert!(app.api(api).unwrap().check().is_empty());
        assert!(app.finalize_routes(api).is_ok());
    }

    #[test]
    fn test_missing_usage_plan_does_not_block_finalize() {
        let Fixture {
            mut assembly,
            unit,
            api,
            users,
            ..
        } = fixture();
        let app = assembly.unit_mut(unit).unwrap();
        let root = app.root(api).unwrap();
        let node = app.add_resource(root, "users").unwrap();
        let integration = app.integration(api, users).unwrap();
        app.add_method(node, HttpMethod::Get, integration, AuthPolicy::ApiKey)
            .unwrap();
        let tree = app.finalize_routes(api).unwrap();
        assert!(tree.methods().all(|(_, m)| m.api_key_required));

        let errors = crate::topology::validate::validate(&assembly)
            .unwrap_err()
            .into_vec();
        assert!(errors
            .iter()
            .any(|err| matches!(err, Error::MissingUsagePlan { api } if api == "TackleboxApi")));
    }

    #[test]
    fn test_render_resources_and_preflight() {
        let Fixture {
            mut assembly,
            unit,
            api,
            users,
            ..
        } = fixture();
        let app = assembly.unit_mut(unit).unwrap();
        let root = app.root(api).unwrap();
        let services = app.add_resource(root, "services").unwrap();
        let service = app.add_resource(services, "{service_id}").unwrap();
        let integration = app.integration(api, users).unwrap();
        app.add_method(service, HttpMethod::Delete, integration, AuthPolicy::None)
            .unwrap();

        let rendered = app.api(api).unwrap().render();
        let ids: Vec<&str> = rendered.iter().map(|(id, _)| id.as_str()).collect();
        assert!(ids.contains(&"TackleboxApiServicesParamServiceId"));
        assert!(ids.contains(&"TackleboxApiServicesParamServiceIdDELETE"));
        assert!(ids.contains(&"TackleboxApiRootOPTIONS"));
        assert!(ids.contains(&"TackleboxApiManageUsersPermission"));
        assert!(ids.contains(&"TackleboxApiDeploymentStageV1"));

        let (_, resource) = rendered
            .iter()
            .find(|(id, _)| id == "TackleboxApiServices")
            .unwrap();
        assert_eq!(
            resource["Properties"]["ParentId"],
            json!({ "Fn::GetAtt": ["TackleboxApi", "RootResourceId"] })
        );
    }

    #[test]
    fn test_invalid_stage() {
        let Fixture {
            mut assembly, unit, ..
        } = fixture();
        let app = assembly.unit_mut(unit).unwrap();
        let options = RestApiOptions {
            stage: "v 1".to_string(),
            ..RestApiOptions::default()
        };
        assert!(matches!(
            app.define_api("OtherApi", options),
            Err(Error::InvalidStage { .. })
        ));
    }

    #[test]
    fn test_http_method_parsing() {
        assert_eq!("get".parse::<HttpMethod>(), Ok(HttpMethod::Get));
        assert_eq!(HttpMethod::Delete.to_string(), "DELETE");
        assert!("FETCH".parse::<HttpMethod>().is_err());
    }
}
