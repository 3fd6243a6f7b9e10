//! Replication slot lifecycle.
//!
//! A slot is the server-side bookmark that stops WAL recycling past the
//! client's confirmed position. [`SlotManager::ensure`] makes sure the
//! configured slot exists before streaming starts and computes the
//! position streaming resumes from.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::client::connection::ReplicationConnection;
use crate::control::{is_duplicate_object, ControlConnection};
use crate::decoder::Plugin;
use crate::error::{Error, Result};
use crate::lsn::Lsn;

/// Server-side state of a replication slot, as read from the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    /// A slot has at most one active consumer.
    pub active: bool,
    /// Oldest WAL position the server retains for this slot; `None` right
    /// after creation, before the first acknowledgement.
    pub confirmed_flush_lsn: Option<Lsn>,
    /// Transaction-id horizon held back by the slot.
    pub catalog_xmin: Option<i64>,
}

impl SlotInfo {
    /// False immediately after creation and before any acknowledgement.
    pub fn has_valid_flushed_lsn(&self) -> bool {
        self.confirmed_flush_lsn.is_some()
    }
}

/// The subset of slot state upstream lag tracking cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotState {
    pub confirmed_flush_lsn: Option<Lsn>,
    pub catalog_xmin: Option<i64>,
}

/// Ensures the configured slot exists and picks the starting LSN.
pub struct SlotManager {
    slot_name: String,
    plugin: Plugin,
    /// Temporary slots are created through the raw replication command and
    /// die with the replication connection.
    temporary: bool,
}

impl SlotManager {
    pub fn new(slot_name: impl Into<String>, plugin: Plugin, temporary: bool) -> SlotManager {
        SlotManager {
            slot_name: slot_name.into(),
            plugin,
            temporary,
        }
    }

    pub fn temporary(&self) -> bool {
        self.temporary
    }

    /// Create-or-validate the slot, then compute where streaming starts.
    ///
    /// Fails with [`Error::SlotBusy`] when the slot already has an active
    /// consumer and with [`Error::NotAReplicationConnection`] when
    /// `IDENTIFY_SYSTEM` yields no row.
    pub async fn ensure(
        &self,
        repl: &mut ReplicationConnection,
        control: &ControlConnection,
    ) -> Result<Lsn> {
        let plugin_name = self.plugin.postgres_plugin_name();
        let mut slot_info = control.read_slot_info(&self.slot_name, plugin_name).await?;
        let mut should_create = slot_info.is_none();

        if should_create {
            debug!(
                "creating replication slot '{}' for plugin '{}' (temporary: {})",
                self.slot_name, plugin_name, self.temporary
            );
            let created = if self.temporary {
                repl.create_temporary_slot(&self.slot_name, plugin_name).await
            } else {
                control.create_logical_slot(&self.slot_name, plugin_name).await
            };

            if let Err(e) = created {
                if !is_duplicate_object(&e) {
                    return Err(e);
                }
                // Another client won the creation race; validate their slot
                // the way a pre-existing one is validated.
                debug!("slot '{}' was created concurrently, re-reading", self.slot_name);
                slot_info = control.read_slot_info(&self.slot_name, plugin_name).await?;
                if slot_info.is_none() {
                    return Err(e);
                }
                should_create = false;
            }
        }

        if let (false, Some(info)) = (should_create, &slot_info) {
            if info.active {
                return Err(Error::SlotBusy {
                    slot: self.slot_name.clone(),
                });
            }
        }

        let xlog_start = repl.identify_system().await?;
        let starting = starting_lsn(should_create, slot_info.as_ref(), xlog_start);
        debug!(
            "slot '{}' ready, streaming starts at '{starting}' (server xlogpos '{xlog_start}')",
            self.slot_name
        );
        Ok(starting)
    }
}

/// Starting position rule: a freshly created slot (or one that never
/// confirmed a flush) starts at the server's current xlog position;
/// otherwise resume at the recorded flush, clamped to the server position
/// for the crash-restart case where the server's xlog fell behind the
/// slot's bookkeeping.
fn starting_lsn(created: bool, slot: Option<&SlotInfo>, xlog_start: Lsn) -> Lsn {
    match slot {
        Some(info) if !created => match info.confirmed_flush_lsn {
            Some(flushed) => {
                if flushed < xlog_start {
                    debug!("found previous flushed LSN '{flushed}'");
                    flushed
                } else {
                    xlog_start
                }
            }
            None => xlog_start,
        },
        _ => xlog_start,
    }
}

/// Caches the slot's catalog xmin, refreshing it through the control
/// connection at a fixed interval. A zero interval disables tracking so
/// the periodic catalog query can be avoided entirely.
pub struct SlotXminTracker {
    slot_name: String,
    plugin: Plugin,
    refresh_interval: Duration,
    last_fetch: Option<Instant>,
    last_xmin: Option<i64>,
}

impl SlotXminTracker {
    pub fn new(
        slot_name: impl Into<String>,
        plugin: Plugin,
        refresh_interval: Duration,
    ) -> SlotXminTracker {
        SlotXminTracker {
            slot_name: slot_name.into(),
            plugin,
            refresh_interval,
            last_fetch: None,
            last_xmin: None,
        }
    }

    fn refresh_due(&self) -> bool {
        !self.refresh_interval.is_zero()
            && self
                .last_fetch
                .map_or(true, |t| t.elapsed() >= self.refresh_interval)
    }

    /// Latest known catalog xmin; `None` while tracking is disabled or the
    /// slot reports no horizon.
    pub async fn current_xmin(&mut self, control: &ControlConnection) -> Result<Option<i64>> {
        if self.refresh_interval.is_zero() {
            return Ok(None);
        }
        if self.refresh_due() {
            let state = control
                .current_slot_state(&self.slot_name, self.plugin.postgres_plugin_name())
                .await?;
            self.last_xmin = state.catalog_xmin;
            self.last_fetch = Some(Instant::now());
            debug!("fetched new xmin from slot: {:?}", self.last_xmin);
        } else {
            trace!("reusing xmin value of {:?}", self.last_xmin);
        }
        Ok(self.last_xmin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(active: bool, flushed: Option<u64>) -> SlotInfo {
        SlotInfo {
            active,
            confirmed_flush_lsn: flushed.map(Lsn),
            catalog_xmin: Some(700),
        }
    }

    #[test]
    fn fresh_slot_starts_at_server_position() {
        let xlog = Lsn::parse("0/1A2B3C00").unwrap();
        assert_eq!(starting_lsn(true, None, xlog), xlog);
        // created even though a row came back (duplicate race re-read did not happen)
        assert_eq!(starting_lsn(true, Some(&slot(false, Some(0x50))), xlog), xlog);
    }

    #[test]
    fn resume_uses_confirmed_flush() {
        let xlog = Lsn::parse("0/200").unwrap();
        let info = slot(false, Some(0x100));
        assert_eq!(starting_lsn(false, Some(&info), xlog), Lsn(0x100));
    }

    #[test]
    fn resume_past_server_clamps_to_xlogpos() {
        let xlog = Lsn::parse("0/200").unwrap();
        let info = slot(false, Some(0x300));
        assert_eq!(starting_lsn(false, Some(&info), xlog), xlog);
    }

    #[test]
    fn slot_without_valid_flush_starts_at_server_position() {
        let xlog = Lsn::parse("0/200").unwrap();
        let info = slot(false, None);
        assert!(!info.has_valid_flushed_lsn());
        assert_eq!(starting_lsn(false, Some(&info), xlog), xlog);
    }

    #[test]
    fn xmin_tracker_disabled_at_zero_interval() {
        let tracker = SlotXminTracker::new("s", Plugin::Pgoutput, Duration::ZERO);
        assert!(!tracker.refresh_due());
    }

    #[test]
    fn xmin_tracker_due_on_first_use_then_waits() {
        let mut tracker =
            SlotXminTracker::new("s", Plugin::Pgoutput, Duration::from_secs(3600));
        assert!(tracker.refresh_due());
        tracker.last_fetch = Some(Instant::now());
        assert!(!tracker.refresh_due());
    }
}
