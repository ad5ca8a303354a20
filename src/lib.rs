//! Automatic JOIN inference for PostgreSQL.
//!
//! Given a SELECT that references columns from tables missing from its
//! FROM clause, the planner consults the database's foreign keys and
//! splices in the shortest chain of joins that makes the query valid.
//! The [`proxy`] module wraps the rewriter in a transparent wire-level
//! proxy; the binaries expose both the proxy and a one-shot CLI.

pub mod cache;
pub mod catalog;
pub mod graph;
pub mod introspect;
pub mod join;
pub mod proxy;
pub mod tls;
pub mod wire;

pub use cache::SchemaCache;
pub use catalog::{Catalog, PgSchemaLoader, SchemaLoader};
pub use join::{add_missing_joins, JoinBehavior, JoinError, JoinPlan};
pub use proxy::{CredentialDefaults, ProxyConfig, ProxyServer};
