//! The live replication stream handle.
//!
//! Two tasks touch a stream: the caller's read loop and the optional
//! keepalive loop. Everything they share lives in [`StreamShared`] - the
//! socket write half behind an async mutex and the LSN cursors as atomics.
//! The read half stays exclusively with the stream, so reads never contend
//! with status updates.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::decoder::{MessageDecoder, MessageProcessor};
use crate::error::{Error, Result, ServerError};
use crate::lsn::Lsn;
use crate::protocol::framing::{write_copy_data, write_copy_done, FrameReader};
use crate::protocol::messages::parse_error_fields;
use crate::protocol::replication::{
    encode_standby_status_update, parse_copy_data, pg_epoch_micros, ReplicationCopyData,
    StandbyStatus,
};

use super::keepalive::run_keepalive;

const CHECK_WARNINGS_AFTER_COUNT: u32 = 100;

/// State shared between the reader and the keepalive loop.
///
/// The keepalive loop holds only a `Weak` to this, so a stream that goes
/// away takes its loop down with it.
pub(crate) struct StreamShared {
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Highest LSN observed from the server; release/acquire so the
    /// keepalive sees reasonably fresh values. Stale reads are fine -
    /// status updates are periodic anyway.
    last_received: AtomicU64,
    /// False until the first frame arrives; the cursor holds the starting
    /// position until then.
    observed: AtomicBool,
    flushed: AtomicU64,
    applied: AtomicU64,
    last_status_sent: std::sync::Mutex<Instant>,
    keepalive_running: AtomicBool,
    keepalive_wakeup: Notify,
}

impl StreamShared {
    pub(crate) fn new(writer: OwnedWriteHalf, starting_lsn: Lsn) -> StreamShared {
        StreamShared {
            writer: Mutex::new(Some(writer)),
            last_received: AtomicU64::new(starting_lsn.as_u64()),
            observed: AtomicBool::new(false),
            flushed: AtomicU64::new(starting_lsn.as_u64()),
            applied: AtomicU64::new(starting_lsn.as_u64()),
            last_status_sent: std::sync::Mutex::new(Instant::now()),
            keepalive_running: AtomicBool::new(false),
            keepalive_wakeup: Notify::new(),
        }
    }

    /// Fold a wire-observed LSN into the receive cursor; returns the new
    /// cursor value. Positions never regress (mid-transaction XLogData can
    /// report a zero start).
    fn observe(&self, lsn: Lsn) -> Lsn {
        let prev = self.last_received.fetch_max(lsn.as_u64(), Ordering::AcqRel);
        self.observed.store(true, Ordering::Release);
        Lsn(prev.max(lsn.as_u64()))
    }

    pub(crate) fn last_received(&self) -> Option<Lsn> {
        if self.observed.load(Ordering::Acquire) {
            Some(Lsn(self.last_received.load(Ordering::Acquire)))
        } else {
            None
        }
    }

    /// Send a standby status update now. Serialized internally; safe to
    /// call from the reader and the keepalive loop concurrently.
    pub(crate) async fn force_update_status(&self) -> Result<()> {
        let status = StandbyStatus {
            written: Lsn(self.last_received.load(Ordering::Acquire)),
            flushed: Lsn(self.flushed.load(Ordering::Acquire)),
            applied: Lsn(self.applied.load(Ordering::Acquire)),
            reply_requested: false,
        };

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::ConnectionLost("stream is closed".into()))?;
        let payload = encode_standby_status_update(status, pg_epoch_micros());
        write_copy_data(writer, &payload).await?;
        drop(guard);

        *self.last_status_sent.lock().expect("status clock lock") = Instant::now();
        trace!(
            "status update sent: written '{}', flushed '{}'",
            status.written,
            status.flushed
        );
        Ok(())
    }

    fn status_due(&self, interval: Duration) -> bool {
        !interval.is_zero()
            && self
                .last_status_sent
                .lock()
                .expect("status clock lock")
                .elapsed()
                >= interval
    }

    pub(crate) fn keepalive_running(&self) -> &AtomicBool {
        &self.keepalive_running
    }

    pub(crate) fn keepalive_wakeup(&self) -> &Notify {
        &self.keepalive_wakeup
    }

    /// Clear the keepalive flag and interrupt its pause. Returns whether a
    /// loop was running.
    pub(crate) fn stop_keepalive(&self) -> bool {
        let was_running = self.keepalive_running.swap(false, Ordering::AcqRel);
        if was_running {
            self.keepalive_wakeup.notify_waiters();
        }
        was_running
    }

    /// Close the write half: CopyDone best-effort, then socket shutdown.
    /// Subsequent status updates fail with ConnectionLost.
    pub(crate) async fn shutdown(&self) {
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            let _ = write_copy_done(&mut writer).await;
            let _ = writer.shutdown().await;
        }
    }
}

/// Handle to an open logical replication stream.
///
/// Obtained from
/// [`ReplicationSession::start_streaming`](super::ReplicationSession::start_streaming).
/// Messages are delivered in server LSN order; anything at or below the
/// starting position is discarded so a restart against the same slot never
/// re-delivers acknowledged data.
pub struct ReplicationStream {
    reader: FrameReader<OwnedReadHalf>,
    shared: Arc<StreamShared>,
    decoder: Box<dyn MessageDecoder>,
    starting_lsn: Lsn,
    status_interval: Duration,
    notices: Vec<ServerError>,
    warning_check_counter: u32,
}

enum FrameOutcome {
    /// An XLogData frame was delivered; the read call is complete.
    ReadComplete,
    /// Keepalive, skipped message, or other bookkeeping; keep going.
    Continue,
}

impl ReplicationStream {
    pub(crate) fn new(
        reader: FrameReader<OwnedReadHalf>,
        shared: Arc<StreamShared>,
        decoder: Box<dyn MessageDecoder>,
        starting_lsn: Lsn,
        status_interval: Duration,
        notices: Vec<ServerError>,
    ) -> ReplicationStream {
        ReplicationStream {
            reader,
            shared,
            decoder,
            starting_lsn,
            status_interval,
            notices,
            warning_check_counter: CHECK_WARNINGS_AFTER_COUNT,
        }
    }

    /// The exclusive lower bound for delivered messages.
    pub fn starting_lsn(&self) -> Lsn {
        self.starting_lsn
    }

    /// Blocking read of the next message.
    ///
    /// Server keepalives are answered inline and messages at or below the
    /// starting position are discarded; neither completes the call. It
    /// returns once a message has been delivered to the processor.
    /// Cancel-safe: dropping the future leaves partial frames buffered.
    pub async fn read(&mut self, processor: &mut dyn MessageProcessor) -> Result<()> {
        loop {
            if self.shared.status_due(self.status_interval) {
                self.shared.force_update_status().await?;
            }
            let frame = self.reader.read_frame().await?;
            if let FrameOutcome::ReadComplete = self.handle_frame(frame.tag, frame.payload, processor).await? {
                return Ok(());
            }
        }
    }

    /// Non-blocking variant of [`read`](Self::read).
    ///
    /// Returns `false` when no complete message is available right now, or
    /// when the only available message was at/below the starting position.
    pub async fn read_pending(&mut self, processor: &mut dyn MessageProcessor) -> Result<bool> {
        loop {
            let Some(frame) = self.reader.read_frame_now()? else {
                return Ok(false);
            };
            match frame.tag {
                b'd' => match parse_copy_data(frame.payload)? {
                    ReplicationCopyData::PrimaryKeepalive {
                        wal_end,
                        reply_requested,
                        ..
                    } => {
                        // Answer and keep draining; an XLogData frame may
                        // already sit behind the heartbeat.
                        self.handle_keepalive(wal_end, reply_requested).await?;
                    }
                    ReplicationCopyData::XLogData {
                        wal_start, data, ..
                    } => return self.handle_xlogdata(wal_start, data, processor).await,
                },
                tag => {
                    // Control frames never complete a pending read.
                    self.handle_control_frame(tag, frame.payload)?;
                }
            }
        }
    }

    async fn handle_frame(
        &mut self,
        tag: u8,
        payload: bytes::Bytes,
        processor: &mut dyn MessageProcessor,
    ) -> Result<FrameOutcome> {
        match tag {
            b'd' => match parse_copy_data(payload)? {
                ReplicationCopyData::PrimaryKeepalive {
                    wal_end,
                    reply_requested,
                    ..
                } => {
                    self.handle_keepalive(wal_end, reply_requested).await?;
                    Ok(FrameOutcome::Continue)
                }
                ReplicationCopyData::XLogData {
                    wal_start, data, ..
                } => {
                    if self.handle_xlogdata(wal_start, data, processor).await? {
                        Ok(FrameOutcome::ReadComplete)
                    } else {
                        // Skipped as at/below the starting position; a
                        // completed read must have delivered something.
                        Ok(FrameOutcome::Continue)
                    }
                }
            },
            tag => self.handle_control_frame(tag, payload),
        }
    }

    async fn handle_keepalive(&mut self, wal_end: Lsn, reply_requested: bool) -> Result<()> {
        self.shared.observe(wal_end);
        trace!("server keepalive at '{wal_end}', reply_requested: {reply_requested}");
        if reply_requested {
            self.shared.force_update_status().await?;
        }
        Ok(())
    }

    /// Returns `true` when the message was delivered to the processor.
    async fn handle_xlogdata(
        &mut self,
        wal_start: Lsn,
        data: bytes::Bytes,
        processor: &mut dyn MessageProcessor,
    ) -> Result<bool> {
        let current = self.shared.observe(wal_start);
        self.process_warnings(false);

        // The starting position is inclusive on the server side; treat it
        // as exclusive here so a restart never re-delivers the message the
        // last session already acknowledged.
        if current <= self.starting_lsn {
            trace!(
                "skipping message at '{current}', at or below starting point '{}'",
                self.starting_lsn
            );
            return Ok(false);
        }

        self.decoder.process_message(current, data, processor)?;
        Ok(true)
    }

    fn handle_control_frame(&mut self, tag: u8, payload: bytes::Bytes) -> Result<FrameOutcome> {
        match tag {
            b'N' => {
                self.notices.push(parse_error_fields(&payload));
                Ok(FrameOutcome::Continue)
            }
            b'E' => Err(Error::Server(parse_error_fields(&payload))),
            b'c' => Err(Error::ConnectionLost("server ended the copy stream".into())),
            other => {
                trace!("ignoring copy-both frame tag {}", other as char);
                Ok(FrameOutcome::Continue)
            }
        }
    }

    /// Record `lsn` as both flushed and applied and push a status update
    /// immediately. Callers must only pass positions they have durably
    /// consumed; passing a smaller LSN than previously flushed is not an
    /// error but has no effect server-side.
    pub async fn flush_lsn(&mut self, lsn: Lsn) -> Result<()> {
        self.shared.flushed.store(lsn.as_u64(), Ordering::Release);
        self.shared.applied.store(lsn.as_u64(), Ordering::Release);
        self.shared.force_update_status().await
    }

    /// Highest LSN observed from the server, or `None` before the first
    /// frame. Safe to call while another task runs the keepalive.
    pub fn last_received_lsn(&self) -> Option<Lsn> {
        self.shared.last_received()
    }

    /// Start the keepalive loop on the caller's runtime handle.
    ///
    /// The stream never creates its own runtime or thread; the caller owns
    /// the scheduler. A second call while a loop is running is a no-op, as
    /// is starting with a zero status interval.
    pub fn start_keep_alive(&mut self, handle: &tokio::runtime::Handle) {
        if self.status_interval.is_zero() {
            debug!("status update interval is zero, not starting keepalive");
            return;
        }
        if self.shared.keepalive_running().swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(&self.shared);
        handle.spawn(run_keepalive(weak, self.status_interval));
    }

    /// Stop the keepalive loop; a second call is a no-op. Cooperative: the
    /// loop observes the cleared flag at its next iteration, its pause is
    /// interrupted immediately.
    pub fn stop_keep_alive(&mut self) {
        if self.shared.stop_keepalive() {
            debug!("keepalive loop stopped");
        }
    }

    /// Drain buffered server notices into the log. Runs every
    /// `CHECK_WARNINGS_AFTER_COUNT` reads, or immediately when forced.
    fn process_warnings(&mut self, forced: bool) {
        self.warning_check_counter -= 1;
        if self.warning_check_counter == 0 || forced {
            self.warning_check_counter = CHECK_WARNINGS_AFTER_COUNT;
            for notice in self.notices.drain(..) {
                debug!(
                    "server-side message: '{}', state = {}",
                    notice.message,
                    notice.sqlstate.as_deref().unwrap_or("<none>")
                );
            }
        }
    }

    /// Close the stream: stop the keepalive, drain warnings, send CopyDone
    /// and shut the socket down. Does not drop the slot - that is the
    /// session's decision.
    pub async fn close(mut self) {
        self.stop_keep_alive();
        self.process_warnings(true);
        self.shared.shutdown().await;
    }
}
