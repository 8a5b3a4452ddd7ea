//! dbc: a query gateway for PostgreSQL-family databases.
//!
//! The gateway sits between an editor UI and live databases: it accepts
//! free-form SQL, classifies it, rewrites selects into pageable queries,
//! executes through pooled sessions, annotates result columns with catalog
//! provenance and caches responses until the schema changes underneath.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod server;
pub mod sql;

pub use error::{Error, Result};
