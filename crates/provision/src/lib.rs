//! # Provision
//!
//! Dependency-ordered provisioning of infrastructure resources.
//!
//! ## Core Concepts
//!
//! - **ResourceNode**: a named resource, its dependencies and the action that converges it
//! - **ProvisionGraph**: a validated DAG of nodes with a deterministic order
//! - **GraphExecutor**: runs the graph on a bounded pool, one lock and one
//!   compare-and-swap state write per node
//! - **with_retry**: exponential backoff for transient action failures
//!
//! ## Example
//!
//! ```no_run
//! use provision::{
//!     CancelToken, ExecuteOptions, FnAction, GraphExecutor, ResourceNode,
//! };
//! use serde_json::json;
//! use statekit::{LockManager, MemoryStateStore};
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStateStore::new());
//! let executor = GraphExecutor::new(
//!     store.clone(),
//!     LockManager::new(store),
//!     ExecuteOptions::default(),
//! );
//!
//! let vpc = FnAction::new("create VPC", |_, _| Ok(json!({ "vpc_id": "vpc-1" })));
//! let db = FnAction::new("create database", |_, _| Ok(json!({ "host": "db" })));
//! let nodes = vec![
//!     ResourceNode::new("vpc", Arc::new(vpc)).critical(true),
//!     ResourceNode::new("database", Arc::new(db)).depends_on(["vpc"]),
//! ];
//!
//! let report = executor.run_simple(nodes, &CancelToken::new())?;
//! assert!(report.summary().is_success());
//! # Ok::<(), provision::ProvisionError>(())
//! ```
//!
//! ## Guarantees
//!
//! - A node runs only after every dependency succeeded.
//! - A failed node's transitive dependents are skipped, never run.
//! - Two nodes with the same lock key never run at the same time in one run.
//! - Locks are leases: a crashed holder's lock can be taken once it expires,
//!   so actions must be idempotent.

pub mod context;
pub mod error;
pub mod executor;
pub mod graph;
pub mod node;
pub mod retry;
pub mod types;

pub use context::{ActionContext, CancelToken, NoProgress, ProgressCallback};
pub use error::{ActionError, ProvisionError, ValidationError};
pub use executor::GraphExecutor;
pub use graph::ProvisionGraph;
pub use node::{FnAction, ProvisionAction, ResourceNode};
pub use retry::{LogCallback, NoCallback, RetryCallback, RetryConfig, with_retry, with_retry_in};
pub use types::{
    ExecuteOptions, ExecuteSummary, GraphReport, NodeOutcome, NodeStatus, SkipReason,
};
