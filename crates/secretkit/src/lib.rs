//! # secretkit
//!
//! Secret stores, secret sinks and a reconciler that copies values from one
//! to the other.
//!
//! This crate provides:
//! - [`SecretValue`], a zeroized, redacted container for secret material
//! - [`SecretStore`] backends: external CLI, JSON file, environment, memory
//! - [`SecretSink`] backends: external CLI (`gh secret set`), dotenv file, memory
//! - [`Reconciler`], which propagates mappings independently and reports
//!   names and outcome kinds, never values
//!
//! ## Example
//!
//! ```no_run
//! use secretkit::{MemorySecretStore, MemorySink, Reconciler, SecretMapping};
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemorySecretStore::with_secrets([("db_password", "s3cr3t")]));
//! let sink = Arc::new(MemorySink::new("github"));
//! let reconciler = Reconciler::new(store).with_sink(sink);
//!
//! let mappings = vec![SecretMapping::new("db_password", "github", "DB_PASSWORD")];
//! reconciler.validate(&mappings)?;
//! for outcome in reconciler.sync(&mappings) {
//!     println!("{} -> {:?}", outcome.target, outcome.result);
//! }
//! # Ok::<(), secretkit::Error>(())
//! ```

#![warn(missing_docs)]

pub mod audit;
pub mod error;
mod fsutil;
pub mod mapping;
pub mod process;
pub mod reconcile;
pub mod sink;
pub mod store;
pub mod value;

pub use audit::SinkDrift;
pub use error::{Error, ErrorCategory, Result, scrub};
pub use mapping::{
    FailureKind, MappingOutcome, MappingResult, SecretMapping, SinkTarget, SkipKind,
};
pub use process::NAME_PLACEHOLDER;
pub use reconcile::{DEFAULT_JOBS, Reconciler};
pub use sink::{CommandSink, DotenvSink, MemorySink, SecretSink};
pub use store::{
    CommandSecretStore, EnvSecretStore, FileSecretStore, MemorySecretStore, SecretStore,
};
pub use value::{REDACTED, SecretValue};
