//! Socket plumbing shared by the connect path and the reconnect worker.
//!
//! [`GatewayShared`] is the single owner of session state, caches, buffers
//! and the write half of the socket. A [`Generation`] pairs one socket's
//! receiver and heartbeat tasks so they can be stopped and joined together
//! before the next socket is installed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::gateway::cache::{ReadyInfo, SnapshotCache};
use crate::gateway::client::{GatewayError, GatewayOptions};
use crate::gateway::codec::FrameCodec;
use crate::gateway::events::EventBuffers;
use crate::gateway::proto::{self, close_code, opcode, GatewayPayload, GatewayUrlResponse, HelloPayload};
use crate::gateway::session::{ReconnectSignal, Session, SessionState};
use crate::gateway::{heartbeat, receiver};
use crate::retry::{retry_async, with_timeout};

pub(crate) type WsSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsSink = SplitSink<WsSocket, Message>;
pub(crate) type WsStream = SplitStream<WsSocket>;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where and how to resume the current session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ResumeTarget {
    pub url: String,
    pub session_id: String,
    pub sequence: u64,
}

pub(crate) struct GatewayShared {
    token: SecretString,
    pub(crate) options: GatewayOptions,
    api_base: String,
    gateway_url: StdMutex<Option<String>>,
    session: StdMutex<Session>,
    cache: StdMutex<SnapshotCache>,
    pub(crate) buffers: EventBuffers,
    pub(crate) reconnect: Arc<ReconnectSignal>,
    /// Set when the last heartbeat was acknowledged.
    pub(crate) liveness: AtomicBool,
    writer: Mutex<Option<WsSink>>,
    generation: Mutex<Option<Generation>>,
    fatal: StdMutex<Option<String>>,
    stopped: AtomicBool,
    http: reqwest::Client,
}

impl GatewayShared {
    pub(crate) fn new(
        token: SecretString,
        api_base: String,
        gateway_url: Option<String>,
        options: GatewayOptions,
    ) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout())
            .build()
            .map_err(GatewayError::Http)?;
        let cache = SnapshotCache::new(options.member_roles_per_guild);

        Ok(Self {
            token,
            options,
            api_base,
            gateway_url: StdMutex::new(gateway_url),
            session: StdMutex::new(Session::default()),
            cache: StdMutex::new(cache),
            buffers: EventBuffers::default(),
            reconnect: Arc::new(ReconnectSignal::new()),
            liveness: AtomicBool::new(true),
            writer: Mutex::new(None),
            generation: Mutex::new(None),
            fatal: StdMutex::new(None),
            stopped: AtomicBool::new(false),
            http,
        })
    }

    pub(crate) fn token(&self) -> &str {
        self.token.expose_secret()
    }

    pub(crate) fn state(&self) -> SessionState {
        lock(&self.session).state
    }

    pub(crate) fn set_state(&self, next: SessionState) {
        let mut session = lock(&self.session);
        if session.state != next {
            info!(event = "session_state_changed", from = %session.state, to = %next);
            session.state = next;
        }
    }

    pub(crate) fn session(&self) -> Session {
        lock(&self.session).clone()
    }

    pub(crate) fn sequence(&self) -> Option<u64> {
        lock(&self.session).sequence
    }

    pub(crate) fn observe_sequence(&self, sequence: u64) -> bool {
        lock(&self.session).observe_sequence(sequence)
    }

    pub(crate) fn set_heartbeat_interval(&self, interval_ms: u64) {
        lock(&self.session).heartbeat_interval_ms = interval_ms;
    }

    pub(crate) fn record_ready(&self, ready: &ReadyInfo) {
        let mut session = lock(&self.session);
        session.session_id = Some(ready.session_id.clone());
        session.resume_url = match ready.resume_url.as_deref() {
            Some(url) if proto::is_valid_resume_url(url) => Some(url.to_string()),
            Some(url) => {
                warn!(event = "resume_url_rejected", url, "ignoring invalid resume url");
                None
            }
            None => None,
        };
    }

    pub(crate) fn clear_resume(&self) {
        lock(&self.session).clear_resume();
    }

    pub(crate) fn resume_target(&self) -> Option<ResumeTarget> {
        let session = lock(&self.session);
        if !session.can_resume() {
            return None;
        }
        Some(ResumeTarget {
            url: session.resume_url.clone()?,
            session_id: session.session_id.clone()?,
            sequence: session.sequence?,
        })
    }

    /// Discards session identity and every cache ahead of a fresh identify.
    pub(crate) fn reset_for_identify(&self) {
        lock(&self.session).reset_for_identify();
        lock(&self.cache).clear();
    }

    pub(crate) fn with_cache<R>(&self, f: impl FnOnce(&mut SnapshotCache) -> R) -> R {
        f(&mut lock(&self.cache))
    }

    pub(crate) fn set_fatal(&self, err: &GatewayError) {
        error!(event = "gateway_fatal", error = %err);
        *lock(&self.fatal) = Some(err.to_string());
        self.reconnect.clear();
        self.set_state(SessionState::Disconnected);
    }

    pub(crate) fn fatal_error(&self) -> Option<String> {
        lock(&self.fatal).clone()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Writes one payload; a failed write flags a reconnect instead of erroring.
    pub(crate) async fn send(&self, payload: &GatewayPayload) {
        match self.send_checked(payload).await {
            Ok(()) => {}
            Err(GatewayError::NotConnected) => {
                debug!(event = "send_dropped", op = payload.op, "no socket installed");
            }
            Err(err) => {
                warn!(event = "send_failed", op = payload.op, error = %err);
                self.reconnect.raise("send_failed");
            }
        }
    }

    /// Writes one payload through the single-writer sink.
    pub(crate) async fn send_checked(&self, payload: &GatewayPayload) -> Result<(), GatewayError> {
        let text = payload.to_text()?;
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(GatewayError::NotConnected)?;
        with_timeout(self.options.connect_timeout(), sink.send(Message::Text(text)))
            .await
            .map_err(|_| GatewayError::Timeout("socket write"))??;
        Ok(())
    }

    pub(crate) async fn install_sink(&self, sink: WsSink) {
        if let Some(mut stale) = self.writer.lock().await.replace(sink) {
            let _ = with_timeout(self.options.teardown_timeout(), stale.close()).await;
        }
    }

    async fn close_sink(&self) {
        let sink = self.writer.lock().await.take();
        if let Some(mut sink) = sink {
            if with_timeout(self.options.teardown_timeout(), sink.close())
                .await
                .is_err()
            {
                debug!(event = "socket_close_timeout");
            }
        }
    }

    pub(crate) async fn install_generation(&self, generation: Generation) {
        let stale = self.generation.lock().await.replace(generation);
        if let Some(stale) = stale {
            warn!(event = "stale_generation_replaced");
            stale.stop(self.options.teardown_timeout()).await;
        }
    }

    /// Closes the socket and joins its receiver and heartbeat tasks.
    ///
    /// Returns the codec the old receiver was using so the caller can reset
    /// it onto the next socket.
    pub(crate) async fn teardown(&self) -> FrameCodec {
        self.close_sink().await;
        let generation = self.generation.lock().await.take();
        match generation {
            Some(generation) => generation.stop(self.options.teardown_timeout()).await,
            None => FrameCodec::new(),
        }
    }

    /// Returns the gateway endpoint, resolving it over HTTP once per client.
    pub(crate) async fn resolve_gateway_url(&self) -> Result<String, GatewayError> {
        let cached = lock(&self.gateway_url).clone();
        if let Some(url) = cached {
            return Ok(url);
        }

        let endpoint = format!("{}/gateway", self.api_base.trim_end_matches('/'));
        let policy = self.options.resolve_retry_policy();
        let url = retry_async(
            &policy,
            |attempt| {
                let endpoint = endpoint.clone();
                async move { self.fetch_gateway_url(&endpoint, attempt).await }
            },
            GatewayError::is_retryable,
        )
        .await?;

        info!(event = "gateway_url_resolved", url = %url);
        *lock(&self.gateway_url) = Some(url.clone());
        Ok(url)
    }

    async fn fetch_gateway_url(&self, endpoint: &str, attempt: usize) -> Result<String, GatewayError> {
        debug!(event = "gateway_url_request", endpoint, attempt);
        let response = self
            .http
            .get(endpoint)
            .header(AUTHORIZATION, self.token())
            .timeout(self.options.connect_timeout())
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(GatewayError::AuthenticationFailed);
        }
        if !status.is_success() {
            return Err(GatewayError::HttpStatus(status));
        }

        let body: GatewayUrlResponse = response.json().await?;
        Ok(body.url)
    }

    /// Checks whether the gateway host accepts TCP connections at all.
    pub(crate) async fn probe_connectivity(&self) -> bool {
        let target = lock(&self.gateway_url)
            .clone()
            .unwrap_or_else(|| self.api_base.clone());
        let Some((host, port)) = host_and_port(&target) else {
            warn!(event = "connectivity_probe_skipped", target = %target);
            return false;
        };
        matches!(
            with_timeout(
                self.options.connect_timeout(),
                TcpStream::connect((host.as_str(), port))
            )
            .await,
            Ok(Ok(_))
        )
    }
}

fn host_and_port(url: &str) -> Option<(String, u16)> {
    let uri: Uri = url.trim().parse().ok()?;
    let host = uri.host()?.to_string();
    let port = uri
        .port_u16()
        .unwrap_or(match uri.scheme_str() {
            Some("wss") | Some("https") => 443,
            _ => 80,
        });
    Some((host, port))
}

/// Maps a websocket close code to the error the session ends with.
pub(crate) fn close_error(code: Option<u16>) -> GatewayError {
    match code {
        Some(close_code::AUTHENTICATION_FAILED) => GatewayError::AuthenticationFailed,
        Some(code) if close_code::is_unrecoverable(code) => GatewayError::UnrecoverableClose(code),
        code => GatewayError::Closed { code },
    }
}

/// Opens a websocket to `url` and splits it into write and read halves.
pub(crate) async fn open_socket(
    url: &str,
    connect_timeout: Duration,
) -> Result<(WsSink, WsStream), GatewayError> {
    debug!(event = "socket_connecting", url);
    let (socket, _) = with_timeout(connect_timeout, connect_async(url))
        .await
        .map_err(|_| GatewayError::Timeout("websocket connect"))??;
    Ok(socket.split())
}

/// Reads frames until one complete payload is decoded.
pub(crate) async fn read_payload(
    stream: &mut WsStream,
    codec: &mut FrameCodec,
    timeout: Duration,
    waiting_for: &'static str,
) -> Result<GatewayPayload, GatewayError> {
    let read = async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(bytes))) => {
                    if let Some(raw) = codec.decompress(&bytes)? {
                        return Ok(GatewayPayload::from_slice(&raw)?);
                    }
                }
                Some(Ok(Message::Text(text))) => return Ok(GatewayPayload::from_text(&text)?),
                Some(Ok(Message::Close(frame))) => {
                    return Err(close_error(frame.map(|frame| u16::from(frame.code))));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err.into()),
                None => return Err(GatewayError::Closed { code: None }),
            }
        }
    };

    with_timeout(timeout, read)
        .await
        .map_err(|_| GatewayError::Timeout(waiting_for))?
}

pub(crate) async fn read_hello(
    stream: &mut WsStream,
    codec: &mut FrameCodec,
    timeout: Duration,
) -> Result<HelloPayload, GatewayError> {
    let payload = read_payload(stream, codec, timeout, "hello").await?;
    if payload.op != opcode::HELLO {
        return Err(GatewayError::Protocol(format!(
            "expected hello as first frame, got op {}",
            payload.op
        )));
    }
    let data = payload
        .d
        .ok_or_else(|| GatewayError::Protocol("hello without payload".to_string()))?;
    Ok(serde_json::from_value(data)?)
}

/// Receiver and heartbeat tasks bound to one socket.
pub(crate) struct Generation {
    running: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    receiver: JoinHandle<FrameCodec>,
    heartbeat: JoinHandle<()>,
}

impl Generation {
    pub(crate) fn start(
        shared: &Arc<GatewayShared>,
        stream: WsStream,
        codec: FrameCodec,
        heartbeat_interval_ms: u64,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let (shutdown, shutdown_rx) = watch::channel(false);
        shared.liveness.store(true, Ordering::SeqCst);

        let receiver = tokio::spawn(receiver::run_receiver(
            Arc::clone(shared),
            stream,
            codec,
            Arc::clone(&running),
            shutdown_rx.clone(),
        ));
        let heartbeat = tokio::spawn(heartbeat::run_heartbeat(
            Arc::clone(shared),
            heartbeat_interval_ms,
            Arc::clone(&running),
            shutdown_rx,
        ));

        Self {
            running,
            shutdown,
            receiver,
            heartbeat,
        }
    }

    /// Stops both tasks and waits for them; returns the receiver's codec.
    pub(crate) async fn stop(self, join_timeout: Duration) -> FrameCodec {
        let Self {
            running,
            shutdown,
            mut receiver,
            mut heartbeat,
        } = self;
        running.store(false, Ordering::SeqCst);
        let _ = shutdown.send(true);

        if with_timeout(join_timeout, &mut heartbeat).await.is_err() {
            heartbeat.abort();
        }

        match with_timeout(join_timeout, &mut receiver).await {
            Ok(Ok(codec)) => codec,
            Ok(Err(err)) => {
                warn!(event = "receiver_join_failed", error = %err);
                FrameCodec::new()
            }
            Err(_) => {
                warn!(event = "receiver_join_timeout");
                receiver.abort();
                FrameCodec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_and_port_uses_scheme_defaults() {
        assert_eq!(
            host_and_port("wss://gateway.example"),
            Some(("gateway.example".to_string(), 443))
        );
        assert_eq!(
            host_and_port("https://api.example/api/v9"),
            Some(("api.example".to_string(), 443))
        );
        assert_eq!(
            host_and_port("ws://127.0.0.1:9001"),
            Some(("127.0.0.1".to_string(), 9001))
        );
        assert_eq!(host_and_port("not a url"), None);
    }

    #[test]
    fn close_codes_map_to_fatal_and_recoverable_errors() {
        assert!(matches!(close_error(Some(4004)), GatewayError::AuthenticationFailed));
        assert!(matches!(close_error(Some(4014)), GatewayError::UnrecoverableClose(4014)));
        assert!(matches!(
            close_error(Some(4000)),
            GatewayError::Closed { code: Some(4000) }
        ));
        assert!(!close_error(None).is_fatal());
    }
}
