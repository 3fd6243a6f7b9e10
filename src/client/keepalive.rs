//! Background keepalive: periodic forced status updates while the stream
//! is otherwise idle, so the server keeps seeing a live standby and can
//! advance its WAL horizon.

use std::sync::atomic::Ordering;
use std::sync::Weak;
use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{error, trace};

use super::stream::StreamShared;

/// Fixed-period pacer.
///
/// Beats stay aligned to the start instant: a pause that begins late does
/// not push subsequent beats later, and missed beats are skipped rather
/// than replayed in a burst.
pub(crate) struct Metronome {
    ticker: Interval,
}

impl Metronome {
    pub(crate) fn new(period: Duration) -> Metronome {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Metronome { ticker }
    }

    /// Wait until the next beat.
    pub(crate) async fn pause(&mut self) {
        self.ticker.tick().await;
    }
}

/// The keepalive task body.
///
/// Holds only a `Weak` to the stream's shared state: when the stream is
/// dropped or closed the loop winds down on its own, and it can never keep
/// the stream alive or close it. On a status-update failure the loop logs
/// the error and terminates; the stream itself is left untouched.
pub(crate) async fn run_keepalive(shared: Weak<StreamShared>, period: Duration) {
    // Built here rather than by the caller so the timer is registered with
    // the runtime the task actually runs on.
    let mut metronome = Metronome::new(period);
    loop {
        let Some(stream) = shared.upgrade() else {
            trace!("keepalive loop exiting: stream is gone");
            return;
        };
        if !stream.keepalive_running().load(Ordering::Acquire) {
            trace!("keepalive loop exiting: stopped");
            return;
        }

        trace!("forcing status update with replication stream");
        if let Err(e) = stream.force_update_status().await {
            error!("keepalive loop terminated by error: {e}");
            stream.keepalive_running().store(false, Ordering::Release);
            return;
        }

        // Interruptible pause: stop_keep_alive wakes us so the flag check
        // above runs immediately instead of after a full period.
        tokio::select! {
            _ = metronome.pause() => {}
            _ = stream.keepalive_wakeup().notified() => {}
        }
    }
}
