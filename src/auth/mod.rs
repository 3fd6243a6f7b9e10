//! Authentication for the replication-mode connection.
//!
//! Supports cleartext password and SCRAM-SHA-256, which covers stock
//! PostgreSQL 10+ deployments. MD5, GSSAPI and certificate authentication
//! are not implemented.

pub mod scram;

pub use scram::ScramExchange;
