//! The replication session: slot setup, stream negotiation, teardown.
//!
//! A session owns the replication-mode connection from construction until
//! `start_streaming` hands it to the stream. Opening the logical stream
//! negotiates plugin options in up to three attempts, because deployed
//! output plugins drift: newer option names are simply unknown to older
//! builds and the server rejects the whole command.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, error, warn};

use crate::config::ConnectionConfig;
use crate::control::ControlConnection;
use crate::decoder::{MessageDecoder, Plugin, StreamOptions};
use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::slot::SlotManager;

use super::connection::ReplicationConnection;
use super::stream::{ReplicationStream, StreamShared};

/// Validated session configuration, produced by the builder.
#[derive(Debug, Clone)]
pub(crate) struct SessionConfig {
    pub(crate) connection: ConnectionConfig,
    pub(crate) slot_name: String,
    pub(crate) plugin: Plugin,
    pub(crate) drop_slot_on_close: bool,
    pub(crate) status_update_interval: Duration,
    pub(crate) stream_params: Vec<(String, String)>,
}

/// A configured logical replication session bound to one slot.
pub struct ReplicationSession {
    config: SessionConfig,
    slot_manager: SlotManager,
    conn: Option<ReplicationConnection>,
    decoder: Option<Box<dyn MessageDecoder>>,
    default_starting_pos: Lsn,
    /// Shared half of the stream once streaming started; lets `close`
    /// stop the keepalive and shut the socket without owning the stream.
    shared: Option<Arc<StreamShared>>,
    closed: bool,
}

impl ReplicationSession {
    /// Open connections, create-or-validate the slot, and learn the
    /// default starting position.
    pub(crate) async fn connect(
        config: SessionConfig,
        decoder: Box<dyn MessageDecoder>,
    ) -> Result<ReplicationSession> {
        let control = ControlConnection::connect(&config.connection).await?;
        let server_major = control.server_major_version().await?;
        // TEMPORARY slots appeared in version 10.
        let temporary = config.drop_slot_on_close && server_major >= 10;
        let slot_manager = SlotManager::new(&config.slot_name, config.plugin, temporary);

        let mut conn = ReplicationConnection::connect(&config.connection).await?;
        let default_starting_pos = match slot_manager.ensure(&mut conn, &control).await {
            Ok(lsn) => lsn,
            Err(e) => {
                // Never leak the half-built session; a created temporary
                // slot dies with this connection anyway.
                conn.close().await;
                return Err(e);
            }
        };

        Ok(ReplicationSession {
            config,
            slot_manager,
            conn: Some(conn),
            decoder: Some(decoder),
            default_starting_pos,
            shared: None,
            closed: false,
        })
    }

    /// The starting position computed at construction: the server's
    /// current xlog position for a fresh slot, otherwise the slot's
    /// confirmed flush clamped to the server position.
    pub fn default_starting_pos(&self) -> Lsn {
        self.default_starting_pos
    }

    /// Open the logical stream.
    ///
    /// `None` (or a zero LSN) starts from the default position computed at
    /// construction. The stream takes over the replication connection; the
    /// session keeps enough shared state to tear it down from `close`.
    pub async fn start_streaming(&mut self, requested: Option<Lsn>) -> Result<ReplicationStream> {
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| Error::Internal("session is closed or already streaming".into()))?;
        let mut decoder = self
            .decoder
            .take()
            .ok_or_else(|| Error::Internal("decoder already handed to a stream".into()))?;

        let lsn = match requested {
            Some(lsn) if !lsn.is_zero() => lsn,
            _ => self.default_starting_pos,
        };
        debug!("starting streaming from LSN '{lsn}'");

        match self.open_stream(&mut conn, decoder.as_mut(), lsn).await {
            Ok(()) => {}
            Err(e) => {
                // Hand everything back so close() still cleans up and the
                // caller may retry from another position.
                self.conn = Some(conn);
                self.decoder = Some(decoder);
                return Err(e);
            }
        }

        // Brief settle after entering copy-both mode: when connections are
        // opened and closed in fast sequence the walsender can still be
        // tearing down its predecessor. TODO: drop once the race is fixed
        // server-side.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (reader, writer, notices) = conn.into_stream_parts();
        let shared = Arc::new(StreamShared::new(writer, lsn));
        // Tell the server our position right away instead of waiting out
        // the first status interval.
        shared.force_update_status().await?;

        self.shared = Some(Arc::clone(&shared));
        Ok(ReplicationStream::new(
            reader,
            shared,
            decoder,
            lsn,
            self.config.status_update_interval,
            notices,
        ))
    }

    /// Drive the option negotiation until the server accepts
    /// `START_REPLICATION` or the failure is terminal.
    async fn open_stream(
        &mut self,
        conn: &mut ReplicationConnection,
        decoder: &mut dyn MessageDecoder,
        lsn: Lsn,
    ) -> Result<()> {
        let mut attempt = StartAttempt::Full;
        loop {
            let sql = self.start_replication_sql(decoder, lsn, attempt);
            let failure = match conn.start_replication(&sql).await {
                Ok(()) => {
                    let contains_metadata =
                        !self.config.plugin.force_rds() && attempt != StartAttempt::WithoutMetadata;
                    decoder.set_contains_metadata(contains_metadata);
                    return Ok(());
                }
                Err(Error::Server(e)) => e,
                Err(other) => return Err(other),
            };

            attempt = match next_attempt(attempt, &failure.message) {
                NegotiationStep::Retry(next) => {
                    match next {
                        StartAttempt::Steady => debug!(
                            "could not register for streaming, \
                             retrying without optional options: {failure}"
                        ),
                        _ => warn!(
                            "could not register for streaming with metadata in messages, \
                             falling back to messages without metadata"
                        ),
                    }
                    // A failed start can leave a temporary slot in an
                    // inconsistent state on the server; rebuild it before
                    // the next attempt.
                    self.reensure_temporary_slot(conn).await?;
                    next
                }
                NegotiationStep::WalGone => {
                    error!("cannot rewind to last processed WAL position: {failure}");
                    return Err(Error::WalGone);
                }
                NegotiationStep::OptionRejected => {
                    return Err(Error::DecoderOptionRejected(failure))
                }
                NegotiationStep::Fatal => return Err(Error::Server(failure)),
            };
        }
    }

    async fn reensure_temporary_slot(&mut self, conn: &mut ReplicationConnection) -> Result<()> {
        if !self.slot_manager.temporary() {
            return Ok(());
        }
        let control = ControlConnection::connect(&self.config.connection).await?;
        self.default_starting_pos = self.slot_manager.ensure(conn, &control).await?;
        Ok(())
    }

    fn start_replication_sql(
        &self,
        decoder: &dyn MessageDecoder,
        lsn: Lsn,
        attempt: StartAttempt,
    ) -> String {
        let mut options = StreamOptions::new();
        for (k, v) in &self.config.stream_params {
            options.set(k.clone(), v.clone());
        }

        let force_rds = self.config.plugin.force_rds();
        match attempt {
            StartAttempt::Full => {
                decoder.try_once_options(&mut options);
                if force_rds {
                    decoder.options_without_metadata(&mut options);
                } else {
                    decoder.options_with_metadata(&mut options);
                }
            }
            StartAttempt::Steady => {
                if force_rds {
                    decoder.options_without_metadata(&mut options);
                } else {
                    decoder.options_with_metadata(&mut options);
                }
            }
            StartAttempt::WithoutMetadata => decoder.options_without_metadata(&mut options),
        }

        format!(
            "START_REPLICATION SLOT {} LOGICAL {}{}",
            self.config.slot_name,
            lsn,
            options.to_sql_clause()
        )
    }

    /// Idempotent teardown: stop the keepalive, shut the stream's socket
    /// down, close the connection, and drop the slot when configured.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        debug!("closing replication connection");

        if let Some(shared) = self.shared.take() {
            shared.stop_keepalive();
            shared.shutdown().await;
        }
        if let Some(conn) = self.conn.take() {
            conn.close().await;
        }
        self.decoder = None;

        if self.config.drop_slot_on_close {
            // Dropped via a regular connection; the replication connection
            // is gone by now. Failures must not propagate out of close.
            match ControlConnection::connect(&self.config.connection).await {
                Ok(control) => {
                    control
                        .drop_replication_slot(&self.config.slot_name)
                        .await
                }
                Err(e) => error!("unexpected error while dropping replication slot: {e}"),
            }
        }
    }
}

/// Which option set the next `START_REPLICATION` attempt uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartAttempt {
    /// Try-once extras plus the steady-state set.
    Full,
    /// Steady-state set only.
    Steady,
    /// Metadata emission disabled.
    WithoutMetadata,
}

#[derive(Debug, PartialEq, Eq)]
enum NegotiationStep {
    Retry(StartAttempt),
    WalGone,
    /// Even the metadata-less set was rejected; nothing left to drop.
    OptionRejected,
    Fatal,
}

/// Pick the next attempt after a server rejection.
///
/// The first failure always retries without the try-once options; after
/// that, only an "option ... is unknown" rejection downgrades further.
fn next_attempt(attempt: StartAttempt, server_message: &str) -> NegotiationStep {
    if is_wal_removed(server_message) {
        return NegotiationStep::WalGone;
    }
    match attempt {
        StartAttempt::Full => NegotiationStep::Retry(StartAttempt::Steady),
        StartAttempt::Steady if is_option_unknown(server_message) => {
            NegotiationStep::Retry(StartAttempt::WithoutMetadata)
        }
        StartAttempt::WithoutMetadata if is_option_unknown(server_message) => {
            NegotiationStep::OptionRejected
        }
        _ => NegotiationStep::Fatal,
    }
}

// The exact server wordings are a compatibility contract; old wal2json
// builds are detected by nothing else.
fn is_option_unknown(message: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)option .* is unknown").expect("static regex"))
        .is_match(message)
}

fn is_wal_removed(message: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)requested WAL segment .* has already been removed").expect("static regex")
    })
    .is_match(message)
}
