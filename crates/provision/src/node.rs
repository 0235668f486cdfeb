//! Provisioning actions and graph nodes
//!
//! A node names one infrastructure resource, the nodes it depends on and the
//! action that converges it. Actions must be safe to re-run: locks are
//! best-effort leases and a stolen lease can let two runs overlap.

use crate::context::ActionContext;
use crate::error::ActionError;
use crate::types::NodeStatus;
use serde_json::Value;
use statekit::StateRecord;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// An idempotent provisioning step
///
/// # Example
///
/// ```ignore
/// use provision::{ActionContext, ActionError, ProvisionAction};
/// use serde_json::{json, Value};
/// use statekit::StateRecord;
///
/// #[derive(Debug)]
/// struct Vpc { cidr: String }
///
/// impl ProvisionAction for Vpc {
///     fn describe(&self) -> String {
///         format!("VPC {}", self.cidr)
///     }
///
///     fn provision(
///         &self,
///         current: Option<&StateRecord>,
///         _ctx: &ActionContext,
///     ) -> Result<Value, ActionError> {
///         if let Some(record) = current {
///             return Ok(record.payload.clone());
///         }
///         Ok(json!({ "vpc_id": "vpc-123", "cidr": self.cidr }))
///     }
/// }
/// ```
pub trait ProvisionAction: Send + Sync + fmt::Debug {
    /// Human-readable description of what the action does
    fn describe(&self) -> String;

    /// Converge the resource and return its new state payload
    ///
    /// `current` is the latest recorded state, `None` on first provisioning.
    /// Returning a payload equal to `current` records nothing new.
    fn provision(
        &self,
        current: Option<&StateRecord>,
        ctx: &ActionContext,
    ) -> Result<Value, ActionError>;
}

/// Action built from a closure, handy for small in-process steps
pub struct FnAction<F> {
    description: String,
    run: F,
}

impl<F> FnAction<F>
where
    F: Fn(Option<&StateRecord>, &ActionContext) -> Result<Value, ActionError> + Send + Sync,
{
    pub fn new(description: impl Into<String>, run: F) -> Self {
        Self {
            description: description.into(),
            run,
        }
    }
}

impl<F> fmt::Debug for FnAction<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnAction")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl<F> ProvisionAction for FnAction<F>
where
    F: Fn(Option<&StateRecord>, &ActionContext) -> Result<Value, ActionError> + Send + Sync,
{
    fn describe(&self) -> String {
        self.description.clone()
    }

    fn provision(
        &self,
        current: Option<&StateRecord>,
        ctx: &ActionContext,
    ) -> Result<Value, ActionError> {
        (self.run)(current, ctx)
    }
}

/// A node in the provisioning graph
#[derive(Debug, Clone)]
pub struct ResourceNode {
    pub name: String,
    pub depends_on: BTreeSet<String>,
    /// External resource the node mutates; nodes without one share the
    /// run's global lock
    pub state_resource: Option<String>,
    /// A failure at or upstream of this node aborts the whole run
    pub critical: bool,
    pub action: Arc<dyn ProvisionAction>,
    pub status: NodeStatus,
}

impl ResourceNode {
    pub fn new(name: impl Into<String>, action: Arc<dyn ProvisionAction>) -> Self {
        Self {
            name: name.into(),
            depends_on: BTreeSet::new(),
            state_resource: None,
            critical: false,
            action,
            status: NodeStatus::Pending,
        }
    }

    /// Add dependencies
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Set the external resource used as lock key
    pub fn state_resource(mut self, resource: impl Into<String>) -> Self {
        self.state_resource = Some(resource.into());
        self
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    /// Lock key for this node
    pub fn lock_key<'a>(&'a self, global: &'a str) -> &'a str {
        self.state_resource.as_deref().unwrap_or(global)
    }

    pub fn description(&self) -> String {
        self.action.describe()
    }
}
