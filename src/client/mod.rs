//! The logical replication client.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐ ensure slot / drop ┌───────────────────┐
//! │ ReplicationSession├───────────────────►│ ControlConnection │──► SQL
//! │                  │                    └───────────────────┘
//! │  start_streaming │
//! └────────┬─────────┘
//!          │ owns, then hands off
//!          ▼
//! ┌──────────────────┐   read half        ┌───────────────────┐
//! │ ReplicationStream ├───────────────────►│    PostgreSQL     │
//! │                  │   write half       │    (walsender)    │
//! │  KeepaliveLoop ──┼── (shared mutex) ──►│                   │
//! └──────────────────┘                    └───────────────────┘
//! ```
//!
//! The session builds everything; the stream is the live handle the caller
//! reads from and acknowledges through. The keepalive loop is an optional
//! task on the caller's runtime that keeps status updates flowing while
//! the read loop is busy or idle.

pub(crate) mod connection;
mod keepalive;
pub(crate) mod session;
mod stream;

pub use session::ReplicationSession;
pub use stream::ReplicationStream;
