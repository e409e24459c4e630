//! Core data model: identifiers, declared specs, observed remote state and
//! the tracking record that binds them.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{Error, RemoteError, Result};

/// Stable identifier of one resource instance: the owning parent plus a
/// discriminator naming the slot on that parent (e.g. `c1:logging`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    parent: String,
    slot: String,
}

impl ResourceId {
    pub fn new(parent: impl Into<String>, slot: impl Into<String>) -> Self {
        Self {
            parent: parent.into(),
            slot: slot.into(),
        }
    }

    /// Parse `parent:slot`, or a bare `parent` in which case `default_slot`
    /// is assumed.
    pub fn parse(s: &str, default_slot: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((parent, slot)) => Self::checked(parent, slot),
            None => Self::checked(s, default_slot),
        }
    }

    fn checked(parent: &str, slot: &str) -> Result<Self> {
        if parent.is_empty() || slot.is_empty() || slot.contains(':') {
            return Err(Error::validation(format!(
                "invalid resource identifier '{}:{}'",
                parent, slot
            )));
        }
        Ok(Self::new(parent, slot))
    }

    pub fn parent(&self) -> &str {
        &self.parent
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.parent, self.slot)
    }
}

impl TryFrom<String> for ResourceId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        let (parent, slot) = s
            .split_once(':')
            .ok_or_else(|| Error::validation(format!("identifier '{}' has no slot", s)))?;
        Self::checked(parent, slot)
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.to_string()
    }
}

/// A typed configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<String>),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Str(_) => "string",
            Self::List(_) => "list",
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Str(s) => write!(f, "{:?}", s),
            Self::List(l) => write!(f, "[{}]", l.join(", ")),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for AttrValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<Vec<&str>> for AttrValue {
    fn from(l: Vec<&str>) -> Self {
        Self::List(l.into_iter().map(str::to_string).collect())
    }
}

impl From<Vec<String>> for AttrValue {
    fn from(l: Vec<String>) -> Self {
        Self::List(l)
    }
}

/// Desired configuration for one resource instance, as declared by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Label of the declaring block (e.g. `test` in `logging "test" {}`).
    pub name: String,
    /// Identifier of the owning resource.
    pub parent_identifier: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrValue>,
}

impl ResourceSpec {
    pub fn new(name: impl Into<String>, parent_identifier: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent_identifier: parent_identifier.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key)
    }

    /// Identifier this spec addresses in the given slot.
    pub fn id(&self, slot: &str) -> ResourceId {
        ResourceId::new(self.parent_identifier.clone(), slot)
    }
}

/// Last observed view of a resource as reported by the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteState {
    pub id: ResourceId,
    /// Same key space as [`ResourceSpec::attributes`].
    pub attributes: BTreeMap<String, AttrValue>,
    /// Server-computed, read-only fields. Never part of a diff.
    pub computed: BTreeMap<String, AttrValue>,
}

impl RemoteState {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            attributes: BTreeMap::new(),
            computed: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key)
    }

    pub fn parent_identifier(&self) -> &str {
        self.id.parent()
    }
}

/// Persisted record binding a spec to the identifier used to re-fetch its
/// remote state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedInstance {
    pub id: ResourceId,
    pub name: String,
    pub spec: ResourceSpec,
    /// Incremented on every successful reconcile.
    pub generation: u64,
    pub created_at: String,
    pub updated_at: String,
}

impl TrackedInstance {
    pub fn new(id: ResourceId, spec: ResourceSpec) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            id,
            name: spec.name.clone(),
            spec,
            generation: 1,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Record a successful reconcile against `spec`.
    pub fn advance(&mut self, spec: ResourceSpec) {
        self.name = spec.name.clone();
        self.spec = spec;
        self.generation += 1;
        self.updated_at = Utc::now().to_rfc3339();
    }
}

/// Outcome of one reconciliation attempt.
#[derive(Debug)]
pub enum ReconcileResult {
    /// Remote state matches (or was made to match) the desired state.
    Converged,
    /// The remote kept answering retryably until the budget ran out.
    Retryable { attempts: u32, last: RemoteError },
    /// Rejected by the remote, or the response could not be interpreted.
    Fatal(Error),
    /// The remote resource is confirmed absent.
    Gone,
    /// The caller canceled mid-flight.
    Canceled { attempts: u32 },
}

impl ReconcileResult {
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    /// Classify an engine error: budget exhaustion stays retryable, caller
    /// cancellation stays distinct, everything else is fatal.
    pub fn from_error(err: Error) -> Self {
        match err {
            Error::RetryExhausted { attempts, last, .. } => Self::Retryable { attempts, last },
            Error::Canceled { attempts, .. } => Self::Canceled { attempts },
            other => Self::Fatal(other),
        }
    }

    /// Collapse into an engine result. `Gone` becomes [`Error::NotFound`].
    pub fn into_result(self, operation: &'static str, id: &ResourceId) -> Result<()> {
        match self {
            Self::Converged => Ok(()),
            Self::Retryable { attempts, last } => Err(Error::RetryExhausted {
                operation,
                id: id.to_string(),
                attempts,
                last,
            }),
            Self::Fatal(e) => Err(e),
            Self::Gone => Err(Error::NotFound(id.to_string())),
            Self::Canceled { attempts } => Err(Error::Canceled {
                operation,
                id: id.to_string(),
                attempts,
            }),
        }
    }
}
