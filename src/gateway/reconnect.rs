//! Recovery after a dropped connection.
//!
//! [`run_supervisor`] is the only place a recovery worker is spawned. It polls
//! the shared [`ReconnectSignal`] and starts a worker only when the previous
//! one has finished, so any number of raises from the receiver, heartbeat or
//! send path collapse into one recovery at a time.
//!
//! A worker first tries to resume the existing session. Any non-fatal resume
//! failure drops the resume data and falls back to a fresh identify; only an
//! identify that cannot reach the gateway parks the session in `WaitOffline`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::gateway::client::GatewayError;
use crate::gateway::codec::FrameCodec;
use crate::gateway::connection::{
    open_socket, read_hello, read_payload, Generation, GatewayShared, ResumeTarget,
};
use crate::gateway::proto::{self, opcode, PresenceUpdate};
use crate::gateway::receiver::{self, Control};
use crate::gateway::session::{ReconnectSignal, SessionState};

/// Polls `signal` and runs at most one worker built by `make_worker` at a time.
pub(crate) async fn run_supervisor<F, Fut>(
    signal: Arc<ReconnectSignal>,
    poll: Duration,
    mut stop: watch::Receiver<bool>,
    mut make_worker: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut worker: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }
        if *stop.borrow() {
            break;
        }

        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            continue;
        }
        if let Some(finished) = worker.take() {
            if let Err(err) = finished.await {
                warn!(event = "recovery_worker_failed", error = %err);
            }
        }

        if signal.take() {
            info!(event = "recovery_started", raised = signal.raised_count());
            worker = Some(tokio::spawn(make_worker()));
        }
    }

    if let Some(worker) = worker {
        worker.abort();
    }
    debug!(event = "supervisor_stopped");
}

enum ResumeOutcome {
    Resumed,
    Rejected,
}

/// One recovery attempt: tear down, resume or identify, park offline on
/// connectivity loss.
pub(crate) async fn recover(shared: Arc<GatewayShared>) {
    if shared.is_stopped() || shared.fatal_error().is_some() {
        return;
    }

    shared.set_state(SessionState::Reconnecting);
    let mut codec = shared.teardown().await;
    // Anything raised while the old generation wound down is covered by this attempt.
    shared.reconnect.clear();
    shared.set_state(SessionState::Reconnecting);

    let result = match shared.resume_target() {
        Some(target) => match try_resume(&shared, &mut codec, &target).await {
            Ok(ResumeOutcome::Resumed) => Ok(()),
            Ok(ResumeOutcome::Rejected) => identify_fresh(&shared, &mut codec).await,
            Err(err) if err.is_fatal() => Err(err),
            // The resume host may be gone while the gateway is fine; only a
            // failed identify below counts as being offline.
            Err(err) => {
                warn!(event = "resume_failed", error = %err);
                shared.clear_resume();
                shared.teardown().await;
                identify_fresh(&shared, &mut codec).await
            }
        },
        None => {
            debug!(event = "resume_unavailable");
            identify_fresh(&shared, &mut codec).await
        }
    };

    if let Err(err) = result {
        handle_recovery_error(&shared, err).await;
    }
}

async fn try_resume(
    shared: &Arc<GatewayShared>,
    codec: &mut FrameCodec,
    target: &ResumeTarget,
) -> Result<ResumeOutcome, GatewayError> {
    let timeout = shared.options.connect_timeout();
    let url = proto::gateway_query_url(&target.url, shared.options.api_version);
    info!(event = "resume_attempt", session_id = %target.session_id, sequence = target.sequence);

    codec.reset();
    let (sink, mut stream) = open_socket(&url, timeout).await?;
    let hello = read_hello(&mut stream, codec, timeout).await?;
    shared.set_heartbeat_interval(hello.heartbeat_interval);
    shared.install_sink(sink).await;
    shared
        .send_checked(&proto::resume(
            shared.token(),
            &target.session_id,
            target.sequence,
        ))
        .await?;

    let first = read_payload(&mut stream, codec, timeout, "resume reply")
        .await
        .map_err(|err| match err {
            GatewayError::Timeout(what) => {
                GatewayError::Protocol(format!("no {what} before deadline"))
            }
            other => other,
        })?;

    if first.op == opcode::INVALID_SESSION {
        info!(event = "resume_rejected");
        shared.clear_resume();
        shared.teardown().await;
        return Ok(ResumeOutcome::Rejected);
    }

    let control = receiver::handle_payload(shared, first).await;
    let generation = Generation::start(
        shared,
        stream,
        std::mem::take(codec),
        hello.heartbeat_interval,
    );
    shared.install_generation(generation).await;
    shared.set_state(SessionState::Connected);
    info!(event = "resume_succeeded", sequence = ?shared.sequence());

    if let Control::Reconnect(reason) = control {
        shared.reconnect.raise(reason);
    }
    Ok(ResumeOutcome::Resumed)
}

/// Opens a socket to the gateway endpoint and identifies as a new session.
///
/// Session identity and every cache are discarded once the new socket has
/// said HELLO.
pub(crate) async fn identify_fresh(
    shared: &Arc<GatewayShared>,
    codec: &mut FrameCodec,
) -> Result<(), GatewayError> {
    let options = &shared.options;
    let timeout = options.connect_timeout();
    let base = shared.resolve_gateway_url().await?;
    let url = proto::gateway_query_url(&base, options.api_version);

    codec.reset();
    let (sink, mut stream) = open_socket(&url, timeout).await?;
    let hello = read_hello(&mut stream, codec, timeout).await?;

    shared.reset_for_identify();
    shared.set_heartbeat_interval(hello.heartbeat_interval);
    shared.install_sink(sink).await;
    let generation = Generation::start(
        shared,
        stream,
        std::mem::take(codec),
        hello.heartbeat_interval,
    );
    shared.install_generation(generation).await;

    let presence = PresenceUpdate::status(options.initial_status.clone());
    shared
        .send_checked(&proto::identify(
            shared.token(),
            options.capabilities,
            &options.properties,
            &presence,
        ))
        .await?;

    shared.set_state(SessionState::Connected);
    info!(
        event = "identify_sent",
        gateway = %base,
        heartbeat_interval_ms = hello.heartbeat_interval
    );
    Ok(())
}

async fn handle_recovery_error(shared: &GatewayShared, err: GatewayError) {
    if err.is_fatal() {
        shared.set_fatal(&err);
        shared.teardown().await;
        return;
    }
    if err.is_connectivity() {
        warn!(event = "network_unavailable", error = %err);
        wait_offline(shared).await;
        return;
    }

    warn!(event = "recovery_failed", error = %err);
    shared.set_state(SessionState::Disconnected);
    tokio::time::sleep(shared.options.recovery_backoff()).await;
    if !shared.is_stopped() {
        shared.reconnect.raise("recovery_retry");
    }
}

/// Parks until the gateway host is reachable again, then re-flags recovery.
async fn wait_offline(shared: &GatewayShared) {
    shared.set_state(SessionState::WaitOffline);
    let interval = shared.options.offline_probe_interval();

    loop {
        tokio::time::sleep(interval).await;
        if shared.is_stopped() {
            return;
        }
        if shared.probe_connectivity().await {
            info!(event = "network_restored");
            shared.set_state(SessionState::Reconnecting);
            shared.reconnect.raise("network_restored");
            return;
        }
        debug!(event = "network_probe_failed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn supervisor_never_overlaps_workers() {
        let signal = Arc::new(ReconnectSignal::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(AtomicUsize::new(0));
        let (stop_tx, stop_rx) = watch::channel(false);

        let supervisor = tokio::spawn(run_supervisor(
            Arc::clone(&signal),
            Duration::from_millis(2),
            stop_rx,
            {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                let started = Arc::clone(&started);
                move || {
                    let active = Arc::clone(&active);
                    let peak = Arc::clone(&peak);
                    let started = Arc::clone(&started);
                    async move {
                        started.fetch_add(1, Ordering::SeqCst);
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            },
        ));

        for _ in 0..200 {
            signal.raise("test");
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        let _ = stop_tx.send(true);
        supervisor.await.expect("supervisor join");

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        let runs = started.load(Ordering::SeqCst);
        assert!(runs >= 2, "expected repeated recoveries, got {runs}");
        assert!(runs < 200, "raises must collapse, got {runs} workers");
    }

    #[tokio::test]
    async fn supervisor_idles_without_a_request() {
        let signal = Arc::new(ReconnectSignal::new());
        let started = Arc::new(AtomicUsize::new(0));
        let (stop_tx, stop_rx) = watch::channel(false);

        let supervisor = tokio::spawn(run_supervisor(
            Arc::clone(&signal),
            Duration::from_millis(1),
            stop_rx,
            {
                let started = Arc::clone(&started);
                move || {
                    started.fetch_add(1, Ordering::SeqCst);
                    async {}
                }
            },
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(started.load(Ordering::SeqCst), 0);

        signal.raise("test");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);

        let _ = stop_tx.send(true);
        supervisor.await.expect("supervisor join");
    }
}
