//! # pg-logical-replication
//!
//! A Tokio-based PostgreSQL logical replication client that manages the
//! full slot lifecycle: attach to (or create) a named replication slot,
//! stream logical decoding messages out of the WAL, and report
//! received/applied/flushed LSNs back so the server can recycle WAL
//! segments behind the client.
//!
//! ## Features
//!
//! - **Slot lifecycle** - create-or-validate on startup, temporary slots
//!   on servers that support them, optional drop on close
//! - **Resumable positions** - the starting LSN is computed from the
//!   slot's confirmed flush position and the server's current xlog
//!   position, and acknowledged messages are never re-delivered
//! - **Option negotiation** - plugin options are retried with
//!   progressively smaller sets when the server-side plugin predates them
//! - **Pluggable decoding** - message bodies go through a
//!   [`MessageDecoder`] capability; the client never interprets row data
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pg_logical_replication::{
//!     LogicalMessage, PgOutputDecoder, Plugin, SessionBuilder,
//! };
//!
//! # async fn example() -> pg_logical_replication::Result<()> {
//! let mut builder = SessionBuilder::default();
//! builder.connection.host = "localhost".into();
//! builder.connection.database = "mydb".into();
//! builder.slot_name = "my_slot".into();
//! builder.plugin = Some(Plugin::Pgoutput);
//!
//! let mut session = builder
//!     .build(Box::new(PgOutputDecoder::new("my_publication")))
//!     .await?;
//!
//! let mut stream = session.start_streaming(None).await?;
//! stream.start_keep_alive(&tokio::runtime::Handle::current());
//!
//! let mut processor = |message: LogicalMessage| -> pg_logical_replication::Result<()> {
//!     println!("change at {}: {} bytes", message.lsn, message.data.len());
//!     Ok(())
//! };
//!
//! loop {
//!     stream.read(&mut processor).await?;
//!     if let Some(lsn) = stream.last_received_lsn() {
//!         // after the message is durably consumed downstream:
//!         stream.flush_lsn(lsn).await?;
//!     }
//! }
//! # }
//! ```

#![warn(
    clippy::all,
    clippy::cargo,
    clippy::perf,
    clippy::style,
    clippy::correctness,
    clippy::suspicious
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::multiple_crate_versions
)]

pub mod auth;
pub mod builder;
pub mod client;
pub mod config;
pub mod control;
pub mod decoder;
pub mod error;
pub mod lsn;
pub mod protocol;
pub mod slot;

pub use builder::SessionBuilder;
pub use client::{ReplicationSession, ReplicationStream};
pub use config::ConnectionConfig;
pub use decoder::{
    LogicalMessage, MessageDecoder, MessageProcessor, PgOutputDecoder, Plugin, StreamOptions,
    Wal2JsonDecoder,
};
pub use error::{Error, Result, ServerError};
pub use lsn::Lsn;
pub use slot::{SlotInfo, SlotState, SlotXminTracker};
