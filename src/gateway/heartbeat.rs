//! Heartbeat scheduling for one socket generation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::gateway::connection::GatewayShared;
use crate::gateway::proto;
use crate::gateway::session::SessionState;
use crate::retry::jitter_factor;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatAction {
    Wait,
    Send,
    /// The previous heartbeat was never acknowledged.
    Expired,
}

/// Decides when to send a heartbeat and when the link has gone quiet.
///
/// Each heartbeat is due after the server interval scaled by a random factor
/// in `[jitter_min, jitter_max)`. Expiry is reported once; afterwards the
/// timer only answers [`HeartbeatAction::Wait`].
#[derive(Debug)]
pub struct HeartbeatTimer {
    interval: Duration,
    jitter_min: f64,
    jitter_max: f64,
    next_due: Instant,
    expired: bool,
}

impl HeartbeatTimer {
    pub fn new(interval: Duration, jitter_min: f64, jitter_max: f64, now: Instant) -> Self {
        let mut timer = Self {
            interval,
            jitter_min,
            jitter_max,
            next_due: now,
            expired: false,
        };
        timer.schedule(now);
        timer
    }

    pub fn next_due(&self) -> Instant {
        self.next_due
    }

    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// `acked` is cleared on every send and set again by the receiver on ACK.
    pub fn poll(&mut self, now: Instant, acked: &AtomicBool) -> HeartbeatAction {
        if self.expired || now < self.next_due {
            return HeartbeatAction::Wait;
        }
        if !acked.load(Ordering::SeqCst) {
            self.expired = true;
            return HeartbeatAction::Expired;
        }
        acked.store(false, Ordering::SeqCst);
        self.schedule(now);
        HeartbeatAction::Send
    }

    fn schedule(&mut self, now: Instant) {
        let factor = jitter_factor(self.jitter_min, self.jitter_max);
        self.next_due = now + self.interval.mul_f64(factor);
    }
}

pub(crate) async fn run_heartbeat(
    shared: Arc<GatewayShared>,
    interval_ms: u64,
    running: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let options = &shared.options;
    let mut timer = HeartbeatTimer::new(
        Duration::from_millis(interval_ms),
        options.heartbeat_jitter_min,
        options.heartbeat_jitter_max,
        Instant::now(),
    );
    let mut ticker = tokio::time::interval(options.heartbeat_poll());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(event = "heartbeat_started", interval_ms);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        if !running.load(Ordering::SeqCst) || shared.is_stopped() {
            break;
        }

        match timer.poll(Instant::now(), &shared.liveness) {
            HeartbeatAction::Wait => {}
            HeartbeatAction::Send => {
                let sequence = shared.sequence();
                trace!(event = "heartbeat_sent", sequence = ?sequence);
                shared.send(&proto::heartbeat(sequence)).await;
            }
            HeartbeatAction::Expired => {
                warn!(event = "heartbeat_timeout", interval_ms);
                running.store(false, Ordering::SeqCst);
                shared.set_state(SessionState::Disconnected);
                shared.reconnect.raise("heartbeat_timeout");
                break;
            }
        }
    }

    debug!(event = "heartbeat_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(1_000);

    #[test]
    fn first_heartbeat_is_due_within_jitter_window() {
        let start = Instant::now();
        let timer = HeartbeatTimer::new(INTERVAL, 0.6, 0.8, start);
        let wait = timer.next_due() - start;
        assert!(wait >= Duration::from_millis(600));
        assert!(wait < Duration::from_millis(800));
    }

    #[test]
    fn sends_when_due_and_clears_ack() {
        let start = Instant::now();
        let acked = AtomicBool::new(true);
        let mut timer = HeartbeatTimer::new(INTERVAL, 0.6, 0.8, start);

        assert_eq!(timer.poll(start, &acked), HeartbeatAction::Wait);
        let due = timer.next_due();
        assert_eq!(timer.poll(due, &acked), HeartbeatAction::Send);
        assert!(!acked.load(Ordering::SeqCst));
        assert!(timer.next_due() > due);
    }

    #[test]
    fn acknowledged_heartbeats_keep_the_link_alive() {
        let start = Instant::now();
        let acked = AtomicBool::new(true);
        let mut timer = HeartbeatTimer::new(INTERVAL, 0.6, 0.8, start);

        for _ in 0..5 {
            let due = timer.next_due();
            assert_eq!(timer.poll(due, &acked), HeartbeatAction::Send);
            acked.store(true, Ordering::SeqCst);
        }
        assert!(!timer.is_expired());
    }

    #[test]
    fn missing_ack_expires_exactly_once() {
        let start = Instant::now();
        let acked = AtomicBool::new(true);
        let mut timer = HeartbeatTimer::new(INTERVAL, 0.6, 0.8, start);

        let due = timer.next_due();
        assert_eq!(timer.poll(due, &acked), HeartbeatAction::Send);

        let late = timer.next_due();
        assert_eq!(timer.poll(late, &acked), HeartbeatAction::Expired);
        assert_eq!(
            timer.poll(late + INTERVAL, &acked),
            HeartbeatAction::Wait,
            "expiry must be reported only once"
        );
        assert!(timer.is_expired());
    }
}
