//! Resource graph for a deployment.
//!
//! An [`Assembly`] owns every [`DeployableUnit`]. Each unit is an append-only
//! collection of resources; the composer operations live next to the resource
//! they create (`iam`, `network`, `store`, `messaging`, `handler`, `routes`,
//! `exports`) and all of them hand back small `Copy` handles. A handle is tied
//! to the unit that issued it, so one unit can only reach another unit's
//! resources through a published export.
//!
//! Validation ([`validate::validate`]) is a separate pure pass over the whole
//! assembly, and synthesis ([`Assembly::synthesize`]) only renders a manifest
//! once validation succeeds.

pub mod error;
pub mod exports;
pub mod handler;
pub mod iam;
pub mod manifest;
pub mod messaging;
pub mod network;
pub mod routes;
pub mod store;
pub mod validate;

pub use error::{Error, ErrorKind, Result};

use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use std::{
    collections::BTreeSet,
    fmt,
    hash::Hash,
    marker::PhantomData,
    sync::atomic::{AtomicUsize, Ordering},
};
use tracing::debug;

static NEXT_ASSEMBLY: AtomicUsize = AtomicUsize::new(0);

/// Identifier of a unit inside one [`Assembly`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId {
    assembly: usize,
    index: usize,
}

impl UnitId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.index
    }
}

/// Typed reference to a resource owned by one unit.
pub struct Handle<T> {
    unit: UnitId,
    index: usize,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub(crate) const fn new(unit: UnitId, index: usize) -> Self {
        Self {
            unit,
            index,
            _kind: PhantomData,
        }
    }

    #[must_use]
    pub const fn unit(&self) -> UnitId {
        self.unit
    }

    pub(crate) const fn index(&self) -> usize {
        self.index
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.unit == other.unit && self.index == other.index
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.unit.hash(state);
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("unit", &self.unit.index)
            .field("index", &self.index)
            .finish()
    }
}

/// A value known to the provisioning engine, possibly only at deploy time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Token {
    Literal(String),
    Ref(String),
    GetAtt { logical_id: String, attribute: String },
    Import(String),
    Join(Vec<Token>),
}

impl Token {
    #[must_use]
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal(value.into())
    }

    #[must_use]
    pub fn reference(logical_id: impl Into<String>) -> Self {
        Self::Ref(logical_id.into())
    }

    #[must_use]
    pub fn get_att(logical_id: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self::GetAtt {
            logical_id: logical_id.into(),
            attribute: attribute.into(),
        }
    }

    #[must_use]
    pub fn region() -> Self {
        Self::Ref("AWS::Region".to_string())
    }

    #[must_use]
    pub fn url_suffix() -> Self {
        Self::Ref("AWS::URLSuffix".to_string())
    }

    /// Render as a CloudFormation intrinsic.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Literal(value) => Value::String(value.clone()),
            Self::Ref(id) => json!({ "Ref": id }),
            Self::GetAtt {
                logical_id,
                attribute,
            } => json!({ "Fn::GetAtt": [logical_id, attribute] }),
            Self::Import(name) => json!({ "Fn::ImportValue": name }),
            Self::Join(parts) => {
                let parts: Vec<Value> = parts.iter().map(Self::to_json).collect();
                json!({ "Fn::Join": ["", parts] })
            }
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => f.write_str(value),
            Self::Ref(id) => write!(f, "${{{id}}}"),
            Self::GetAtt {
                logical_id,
                attribute,
            } => write!(f, "${{{logical_id}.{attribute}}}"),
            Self::Import(name) => write!(f, "${{import:{name}}}"),
            Self::Join(parts) => parts.iter().try_for_each(|part| write!(f, "{part}")),
        }
    }
}

impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// A named, independently synthesizable collection of resources.
#[derive(Debug)]
pub struct DeployableUnit {
    id: UnitId,
    name: String,
    construct_ids: BTreeSet<String>,
    sealed: bool,
    pub(crate) roles: Vec<iam::Role>,
    pub(crate) networks: Vec<network::NetworkSegment>,
    pub(crate) stores: Vec<store::DataStore>,
    pub(crate) topics: Vec<messaging::Topic>,
    pub(crate) handlers: Vec<handler::Handler>,
    pub(crate) apis: Vec<routes::RestApi>,
    pub(crate) exports: Vec<exports::Export>,
    pub(crate) imports: Vec<exports::Import>,
}

impl DeployableUnit {
    fn new(id: UnitId, name: String) -> Self {
        Self {
            id,
            name,
            construct_ids: BTreeSet::new(),
            sealed: false,
            roles: Vec::new(),
            networks: Vec::new(),
            stores: Vec::new(),
            topics: Vec::new(),
            handlers: Vec::new(),
            apis: Vec::new(),
            exports: Vec::new(),
            imports: Vec::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> UnitId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether synthesis has sealed this unit against further attachments.
    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Reserve a construct id; ids are unique per unit.
    pub(crate) fn claim(&mut self, id: &str) -> Result<()> {
        if !self.construct_ids.insert(id.to_string()) {
            return Err(Error::DuplicateResource {
                unit: self.name.clone(),
                id: id.to_string(),
            });
        }
        debug!(unit = %self.name, id, "construct registered");
        Ok(())
    }

    pub(crate) fn ensure_unclaimed(&self, id: &str) -> Result<()> {
        if self.construct_ids.contains(id) {
            return Err(Error::DuplicateResource {
                unit: self.name.clone(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Check that `handle` was issued by this unit and points at one of `len` items.
    pub(crate) fn owned<T>(&self, handle: Handle<T>, len: usize) -> Result<usize> {
        if handle.unit != self.id || handle.index >= len {
            return Err(Error::ForeignHandle {
                unit: self.name.clone(),
                owner: handle.unit.index,
            });
        }
        Ok(handle.index)
    }

    pub(crate) fn seal(&mut self) {
        self.sealed = true;
        for network in &mut self.networks {
            network.seal();
        }
    }
}

/// Owner of every deployable unit in a deployment.
#[derive(Debug)]
pub struct Assembly {
    id: usize,
    units: Vec<DeployableUnit>,
}

impl Default for Assembly {
    fn default() -> Self {
        Self {
            id: NEXT_ASSEMBLY.fetch_add(1, Ordering::Relaxed),
            units: Vec::new(),
        }
    }
}

impl Assembly {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new unit.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateUnit`] if a unit with this name exists.
    pub fn add_unit(&mut self, name: impl Into<String>) -> Result<UnitId> {
        let name = name.into();
        if self.units.iter().any(|unit| unit.name == name) {
            return Err(Error::DuplicateUnit(name));
        }
        let id = UnitId {
            assembly: self.id,
            index: self.units.len(),
        };
        debug!(unit = %name, "unit registered");
        self.units.push(DeployableUnit::new(id, name));
        Ok(id)
    }

    /// # Errors
    /// Returns [`Error::UnknownUnit`] if `id` was issued by another assembly.
    pub fn unit(&self, id: UnitId) -> Result<&DeployableUnit> {
        if id.assembly != self.id {
            return Err(Error::UnknownUnit { index: id.index });
        }
        self.units
            .get(id.index)
            .ok_or(Error::UnknownUnit { index: id.index })
    }

    /// # Errors
    /// Returns [`Error::UnknownUnit`] if `id` was issued by another assembly.
    pub fn unit_mut(&mut self, id: UnitId) -> Result<&mut DeployableUnit> {
        if id.assembly != self.id {
            return Err(Error::UnknownUnit { index: id.index });
        }
        self.units
            .get_mut(id.index)
            .ok_or(Error::UnknownUnit { index: id.index })
    }

    #[must_use]
    pub fn units(&self) -> &[DeployableUnit] {
        &self.units
    }

    #[must_use]
    pub fn find_unit(&self, name: &str) -> Option<&DeployableUnit> {
        self.units.iter().find(|unit| unit.name == name)
    }

    pub(crate) fn units_mut(&mut self) -> &mut [DeployableUnit] {
        &mut self.units
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_unit() {
        let mut assembly = Assembly::new();
        assembly.add_unit("tacklebox-iam").unwrap();
        assert_eq!(
            assembly.add_unit("tacklebox-iam"),
            Err(Error::DuplicateUnit("tacklebox-iam".to_string()))
        );
    }

    #[test]
    fn test_claim_rejects_duplicate_construct_id() {
        let mut assembly = Assembly::new();
        let id = assembly.add_unit("Tacklebox").unwrap();
        let unit = assembly.unit_mut(id).unwrap();
        unit.claim("dbSetup").unwrap();
        assert!(matches!(
            unit.claim("dbSetup"),
            Err(Error::DuplicateResource { .. })
        ));
    }

    #[test]
    fn test_foreign_handle_rejected() {
        let mut assembly = Assembly::new();
        let a = assembly.add_unit("a").unwrap();
        let b = assembly.add_unit("b").unwrap();
        let handle: Handle<()> = Handle::new(a, 0);
        assert!(assembly.unit(a).unwrap().owned(handle, 1).is_ok());
        assert_eq!(
            assembly.unit(b).unwrap().owned(handle, 1),
            Err(Error::ForeignHandle {
                unit: "b".to_string(),
                owner: 0
            })
        );
    }

    #[test]
    fn test_unit_ids_are_scoped_to_their_assembly() {
        let mut first = Assembly::new();
        let mut second = Assembly::new();
        let a = first.add_unit("a").unwrap();
        let b = second.add_unit("b").unwrap();
        assert_eq!(a.index(), b.index());

        assert_eq!(first.unit(b).unwrap_err(), Error::UnknownUnit { index: 0 });
        assert!(first.unit_mut(b).is_err());
        assert!(first.resolve(b, "lambdaVpcRole").is_err());

        // same index, different assembly
        let handle: Handle<()> = Handle::new(b, 0);
        assert!(matches!(
            first.unit(a).unwrap().owned(handle, 1),
            Err(Error::ForeignHandle { .. })
        ));
    }

    #[test]
    fn test_token_rendering() {
        let url = Token::Join(vec![
            Token::literal("https://"),
            Token::reference("TackleboxApi"),
            Token::literal(".execute-api."),
            Token::region(),
        ]);
        assert_eq!(
            url.to_string(),
            "https://${TackleboxApi}.execute-api.${AWS::Region}"
        );
        assert_eq!(
            Token::get_att("vpcRole", "Arn").to_json(),
            json!({ "Fn::GetAtt": ["vpcRole", "Arn"] })
        );
        assert_eq!(
            Token::Import("lambdaVpcRole".to_string()).to_json(),
            json!({ "Fn::ImportValue": "lambdaVpcRole" })
        );
    }
}
