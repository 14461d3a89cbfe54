//! REST KMS connector core.
//!
//! The connector mediates between typed in-process request channels and one
//! or more external KMS endpoints speaking a JSON-over-HTTPS dialect. Hosts
//! embed it like so:
//!
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise telemetry ([`telemetry::init`]).
//! 3. Build an HTTP transport ([`ReqwestClient`], or any [`RestClient`]).
//! 4. Construct a [`ConnectorContext`] and call [`connector::spawn`].
//! 5. Issue lookups through the returned [`ConnectorClient`].
//!
//! Startup discovers the KMS endpoint pool and procures validation tokens;
//! the loop accepts no requests until both succeed.

pub mod config;
pub mod connector;
pub mod context;
pub mod discovery;
pub mod engine;
pub mod http;
pub mod kcv;
pub mod pool;
pub mod request;
pub mod response;
pub mod rpc;
pub mod telemetry;
pub mod tokens;

#[cfg(test)]
pub(crate) mod testutil;

pub use common::{ConnectorError, SchemaViolation};
pub use config::Config;
pub use connector::{run, spawn};
pub use context::ConnectorContext;
pub use http::{ReqwestClient, RestClient};
pub use rpc::{CipherKeyRef, ConnectorClient};
