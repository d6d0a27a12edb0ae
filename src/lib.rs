//! # bedrock-mongo
//!
//! Connection lifecycle management for MongoDB-backed bedrock services.
//!
//! This crate gets one process safely connected to shared storage exactly
//! once and exposes already-open collection handles to callers. It covers:
//!
//! - negotiating a connection against a server whose authentication
//!   requirements are not known in advance ([`connect`]),
//! - validating the server version against a semver requirement,
//! - an idempotent, race-tolerant collection cache ([`context::DbContext`]),
//! - key encoding and dot-notation update builders for storing documents
//!   with untrusted field names ([`update`]),
//! - ordered startup phases for first-run setup ([`bootstrap`]).
//!
//! It is not a query engine, schema system, or cluster manager; the driver's
//! wire protocol, pooling, and retries are consumed as an opaque transport.

pub mod bootstrap;
pub mod config;
pub mod connect;
pub mod context;
pub mod error;
pub mod update;
pub mod url;

pub use bootstrap::{Bootstrapper, CredentialPrompt, OnceGate, ProcessOnceGate};
pub use config::DbConfig;
pub use connect::{ConnectionHandle, ServerInfo};
pub use context::{DbContext, IndexSpec, IndexSpecOptions};
pub use error::{
    categorize, is_already_exists, is_authentication_error, is_database_error,
    is_duplicate_error, Error, ErrorCategory, Result,
};
pub use update::{build_update, decode, decode_key, encode, encode_key, hash, UpdateOptions};
