//! Copy-both replication sub-messages.
//!
//! While streaming, every CopyData frame wraps either `XLogData` ('w') or a
//! primary keepalive ('k'). The client answers with standby status updates
//! ('r') reporting its written/flushed/applied positions.

use bytes::{Buf, Bytes};

use crate::error::{Error, Result};
use crate::lsn::Lsn;

/// PostgreSQL epoch (2000-01-01T00:00:00Z) in Unix seconds.
const PG_EPOCH_UNIX_SECS: i64 = 946_684_800;

#[derive(Debug, Clone)]
pub enum ReplicationCopyData {
    /// A logical decoding message produced by the output plugin.
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        server_time_micros: i64,
        data: Bytes,
    },
    /// Server heartbeat; `reply_requested` demands an immediate status
    /// update (the server is about to time the standby out).
    PrimaryKeepalive {
        wal_end: Lsn,
        server_time_micros: i64,
        reply_requested: bool,
    },
}

/// Parse the payload of a CopyData frame received in copy-both mode.
pub fn parse_copy_data(payload: Bytes) -> Result<ReplicationCopyData> {
    let mut b = payload;
    if b.is_empty() {
        return Err(Error::Protocol("empty CopyData payload".into()));
    }
    match b.get_u8() {
        b'w' => {
            if b.remaining() < 8 + 8 + 8 {
                return Err(Error::Protocol("XLogData payload too short".into()));
            }
            let wal_start = Lsn(b.get_u64());
            let wal_end = Lsn(b.get_u64());
            let server_time_micros = b.get_i64();
            let data = b.copy_to_bytes(b.remaining());
            Ok(ReplicationCopyData::XLogData {
                wal_start,
                wal_end,
                server_time_micros,
                data,
            })
        }
        b'k' => {
            if b.remaining() < 8 + 8 + 1 {
                return Err(Error::Protocol("keepalive payload too short".into()));
            }
            let wal_end = Lsn(b.get_u64());
            let server_time_micros = b.get_i64();
            let reply_requested = b.get_u8() == 1;
            Ok(ReplicationCopyData::PrimaryKeepalive {
                wal_end,
                server_time_micros,
                reply_requested,
            })
        }
        kind => Err(Error::Protocol(format!("unknown CopyData kind: {kind}"))),
    }
}

/// Positions reported in a standby status update.
///
/// `written` is the highest LSN received off the wire; `flushed` and
/// `applied` only advance when the caller acknowledges durable consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandbyStatus {
    pub written: Lsn,
    pub flushed: Lsn,
    pub applied: Lsn,
    pub reply_requested: bool,
}

/// Encode a StandbyStatusUpdate ('r') payload for a CopyData frame.
pub fn encode_standby_status_update(status: StandbyStatus, client_time_micros: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 8 * 4 + 1);
    out.push(b'r');
    out.extend_from_slice(&status.written.as_u64().to_be_bytes());
    out.extend_from_slice(&status.flushed.as_u64().to_be_bytes());
    out.extend_from_slice(&status.applied.as_u64().to_be_bytes());
    out.extend_from_slice(&client_time_micros.to_be_bytes());
    out.push(u8::from(status.reply_requested));
    out
}

/// Current wall-clock time in microseconds since the PostgreSQL epoch.
pub fn pg_epoch_micros() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let unix_micros = (now.as_secs() as i64) * 1_000_000 + i64::from(now.subsec_micros());
    unix_micros - PG_EPOCH_UNIX_SECS * 1_000_000
}
