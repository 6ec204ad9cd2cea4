//! Shared plumbing for manifold adapters: the error taxonomy, tenant name
//! derivation, per-request authentication, audit emission, service
//! discovery, and server bootstrap helpers.

pub mod audit;
pub mod auth;
pub mod discovery;
pub mod error;
pub mod rpc;
pub mod serve;
pub mod tenant;

pub use audit::{AuditRecord, AuditSink, AuditStatus};
pub use auth::{AuthValidator, RequireUserId};
pub use error::{Error, Result};
pub use rpc::{AdapterContext, RpcScope};
