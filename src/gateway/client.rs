//! Public entry points: [`GatewayClient`] configures and connects,
//! [`Gateway`] is the running session the application polls.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{error, info};

use crate::gateway::cache::{DirectMessage, Guild, GuildRoles, Presence};
use crate::gateway::codec::{CodecError, FrameCodec};
use crate::gateway::connection::GatewayShared;
use crate::gateway::events::{AckEvent, MessageEvent, SummaryEvent, TypingEvent};
use crate::gateway::proto::{self, Activity, ClientProperties, GatewayPayload, PresenceUpdate};
use crate::gateway::reconnect;
use crate::gateway::session::{Session, SessionState};
use crate::retry::RetryPolicy;

/// REST base the gateway endpoint is resolved against.
pub const API_BASE_URL: &str = "https://discord.com/api/v9";

/// Default values for [`GatewayOptions`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GatewayDefaults;

impl GatewayDefaults {
    pub const API_VERSION: u8 = 9;
    pub const CAPABILITIES: u64 = 30_717;
    pub const INITIAL_STATUS: &'static str = "online";
    pub const HEARTBEAT_POLL: Duration = Duration::from_millis(500);
    pub const HEARTBEAT_JITTER_MIN: f64 = 0.6;
    pub const HEARTBEAT_JITTER_MAX: f64 = 0.8;
    pub const RECONNECT_POLL: Duration = Duration::from_millis(500);
    pub const OFFLINE_PROBE_INTERVAL: Duration = Duration::from_secs(5);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);
    pub const RECOVERY_BACKOFF: Duration = Duration::from_secs(1);
    pub const MEMBER_ROLES_PER_GUILD: usize = 50;
    pub const RESOLVE_MAX_ATTEMPTS: usize = 3;
    pub const RESOLVE_BACKOFF: Duration = Duration::from_millis(250);
    pub const RESOLVE_MAX_BACKOFF: Duration = Duration::from_secs(2);
}

/// Tunables for a gateway session.
///
/// Durations are plain milliseconds so the struct can be loaded from an
/// application's own config file; every field is optional there.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct GatewayOptions {
    pub api_version: u8,
    pub capabilities: u64,
    pub properties: ClientProperties,
    pub initial_status: String,
    pub heartbeat_poll_ms: u64,
    pub heartbeat_jitter_min: f64,
    pub heartbeat_jitter_max: f64,
    pub reconnect_poll_ms: u64,
    pub offline_probe_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub teardown_timeout_ms: u64,
    pub recovery_backoff_ms: u64,
    pub member_roles_per_guild: usize,
    pub resolve_max_attempts: usize,
    pub resolve_backoff_ms: u64,
    pub resolve_max_backoff_ms: u64,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            api_version: GatewayDefaults::API_VERSION,
            capabilities: GatewayDefaults::CAPABILITIES,
            properties: ClientProperties::default(),
            initial_status: GatewayDefaults::INITIAL_STATUS.to_string(),
            heartbeat_poll_ms: millis(GatewayDefaults::HEARTBEAT_POLL),
            heartbeat_jitter_min: GatewayDefaults::HEARTBEAT_JITTER_MIN,
            heartbeat_jitter_max: GatewayDefaults::HEARTBEAT_JITTER_MAX,
            reconnect_poll_ms: millis(GatewayDefaults::RECONNECT_POLL),
            offline_probe_interval_ms: millis(GatewayDefaults::OFFLINE_PROBE_INTERVAL),
            connect_timeout_ms: millis(GatewayDefaults::CONNECT_TIMEOUT),
            teardown_timeout_ms: millis(GatewayDefaults::TEARDOWN_TIMEOUT),
            recovery_backoff_ms: millis(GatewayDefaults::RECOVERY_BACKOFF),
            member_roles_per_guild: GatewayDefaults::MEMBER_ROLES_PER_GUILD,
            resolve_max_attempts: GatewayDefaults::RESOLVE_MAX_ATTEMPTS,
            resolve_backoff_ms: millis(GatewayDefaults::RESOLVE_BACKOFF),
            resolve_max_backoff_ms: millis(GatewayDefaults::RESOLVE_MAX_BACKOFF),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

impl GatewayOptions {
    /// How often the heartbeat task checks its timer.
    pub fn heartbeat_poll(&self) -> Duration {
        Duration::from_millis(self.heartbeat_poll_ms.max(1))
    }

    /// How often the supervisor checks for a reconnect request.
    pub fn reconnect_poll(&self) -> Duration {
        Duration::from_millis(self.reconnect_poll_ms.max(1))
    }

    /// Delay between connectivity probes while offline.
    pub fn offline_probe_interval(&self) -> Duration {
        Duration::from_millis(self.offline_probe_interval_ms)
    }

    /// Bound on each socket open, handshake read, write and HTTP request.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// How long teardown waits for a socket close or task join.
    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    /// Pause before retrying a recovery that failed for a non-network reason.
    pub fn recovery_backoff(&self) -> Duration {
        Duration::from_millis(self.recovery_backoff_ms)
    }

    /// Retry policy for the endpoint-resolution request.
    pub fn resolve_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.resolve_max_attempts,
            initial_backoff: Duration::from_millis(self.resolve_backoff_ms),
            max_backoff: Duration::from_millis(self.resolve_max_backoff_ms),
            ..RetryPolicy::gateway_resolution()
        }
    }

    /// Rejects option sets the session cannot run with.
    pub fn validate(&self) -> Result<(), GatewayError> {
        let jitter_ok = self.heartbeat_jitter_min > 0.0
            && self.heartbeat_jitter_min <= self.heartbeat_jitter_max
            && self.heartbeat_jitter_max <= 1.0;
        if !jitter_ok {
            return Err(GatewayError::InvalidOptions(format!(
                "heartbeat jitter range [{}, {}) must lie within (0, 1]",
                self.heartbeat_jitter_min, self.heartbeat_jitter_max
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(GatewayError::InvalidOptions(
                "connect_timeout_ms must be positive".to_string(),
            ));
        }
        if self.member_roles_per_guild == 0 {
            return Err(GatewayError::InvalidOptions(
                "member_roles_per_guild must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Errors produced by the gateway client.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Websocket transport failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Payload could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Endpoint-resolution request failed before a response arrived.
    #[error("gateway url request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Endpoint-resolution request returned a non-success status.
    #[error("gateway url request returned http status {0}")]
    HttpStatus(StatusCode),

    /// Compressed stream could not be inflated.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Token rejected by the gateway or the REST API.
    #[error("authentication rejected by the gateway")]
    AuthenticationFailed,

    /// Server closed with a code that rules out reconnecting.
    #[error("gateway ended the session with unrecoverable close code {0}")]
    UnrecoverableClose(u16),

    /// Server closed the socket with a recoverable or missing code.
    #[error("gateway socket closed (code {code:?})")]
    Closed { code: Option<u16> },

    /// A bounded wait expired.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Server sent something out of protocol order or shape.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// [`GatewayOptions::validate`] rejected the options.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// No socket is installed to write to.
    #[error("no socket is connected")]
    NotConnected,
}

impl GatewayError {
    /// Errors after which no reconnect can ever succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed | Self::UnrecoverableClose(_) | Self::InvalidOptions(_)
        )
    }

    /// Errors that mean the network path itself is down.
    pub fn is_connectivity(&self) -> bool {
        match self {
            Self::WebSocket(WsError::Io(_)) => true,
            Self::Http(err) => err.is_connect() || err.is_timeout(),
            Self::Timeout(_) => true,
            _ => false,
        }
    }

    pub(crate) fn is_retryable(&self) -> bool {
        match self {
            Self::Http(err) => err.is_connect() || err.is_timeout() || err.is_request(),
            Self::HttpStatus(status) => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

/// Builder for a gateway session.
#[derive(Clone, Debug)]
pub struct GatewayClient {
    token: SecretString,
    api_base: String,
    gateway_url: Option<String>,
    options: GatewayOptions,
}

impl GatewayClient {
    /// Creates a client for `token` with default options and endpoint resolution.
    pub fn new(token: SecretString) -> Self {
        Self {
            token,
            api_base: API_BASE_URL.to_string(),
            gateway_url: None,
            options: GatewayOptions::default(),
        }
    }

    /// Overrides the REST base used to resolve the gateway endpoint.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// Skips endpoint resolution and connects to `url` directly.
    pub fn with_gateway_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_url = Some(url.into());
        self
    }

    /// Sets explicit session options.
    pub fn with_options(mut self, options: GatewayOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns the options the session will connect with.
    pub fn options(&self) -> &GatewayOptions {
        &self.options
    }

    /// Resolves the endpoint, identifies, and starts the background tasks.
    ///
    /// Any failure here is final: bootstrap never retries beyond the endpoint
    /// resolution policy.
    pub async fn connect(&self) -> Result<Gateway, GatewayError> {
        self.options.validate()?;
        let shared = Arc::new(GatewayShared::new(
            self.token.clone(),
            self.api_base.clone(),
            self.gateway_url.clone(),
            self.options.clone(),
        )?);

        let mut codec = FrameCodec::new();
        if let Err(err) = reconnect::identify_fresh(&shared, &mut codec).await {
            error!(event = "bootstrap_failed", error = %err);
            shared.mark_stopped();
            shared.teardown().await;
            shared.set_fatal(&err);
            return Err(err);
        }

        let (stop, stop_rx) = watch::channel(false);
        let supervisor = tokio::spawn(reconnect::run_supervisor(
            Arc::clone(&shared.reconnect),
            shared.options.reconnect_poll(),
            stop_rx,
            {
                let shared = Arc::clone(&shared);
                move || reconnect::recover(Arc::clone(&shared))
            },
        ));

        Ok(Gateway {
            shared,
            supervisor: Some(supervisor),
            stop,
        })
    }
}

/// A live gateway session.
///
/// Getters never block: event getters pop the oldest buffered event of their
/// family, cache getters return a snapshot copy.
pub struct Gateway {
    shared: Arc<GatewayShared>,
    supervisor: Option<JoinHandle<()>>,
    stop: watch::Sender<bool>,
}

impl Gateway {
    /// Sends a raw payload. Write failures trigger a reconnect instead of
    /// surfacing here.
    pub async fn send(&self, payload: &GatewayPayload) {
        self.shared.send(payload).await;
    }

    /// Announces a status, an optional custom status line and activities.
    pub async fn send_presence_update(
        &self,
        status: &str,
        custom_status: Option<&str>,
        activities: Vec<Activity>,
    ) {
        let presence = PresenceUpdate {
            status: status.to_string(),
            custom_status: custom_status.map(str::to_string),
            activities,
        };
        self.send(&proto::presence_update(&presence)).await;
    }

    /// Subscribes to typing, activity and member-list feeds of a guild channel.
    pub async fn subscribe(&self, channel_id: &str, guild_id: &str) {
        self.send(&proto::subscribe(guild_id, channel_id)).await;
    }

    /// Asks for member records; their roles land in the member-role cache.
    pub async fn request_members(&self, guild_id: &str, member_ids: &[String]) {
        self.send(&proto::request_members(guild_id, member_ids))
            .await;
    }

    /// Current connection state.
    pub fn get_state(&self) -> SessionState {
        self.shared.state()
    }

    /// `true` once both snapshot events of the current session have arrived.
    pub fn get_ready(&self) -> bool {
        self.shared.with_cache(|cache| cache.is_ready())
    }

    /// Pops the oldest message create, update or delete event.
    pub fn get_message_event(&self) -> Option<MessageEvent> {
        self.shared.buffers.messages.pop()
    }

    /// Pops the oldest typing event.
    pub fn get_typing_event(&self) -> Option<TypingEvent> {
        self.shared.buffers.typing.pop()
    }

    /// Pops the oldest conversation summary update.
    pub fn get_summary_event(&self) -> Option<SummaryEvent> {
        self.shared.buffers.summaries.pop()
    }

    /// Pops the oldest read acknowledgement.
    pub fn get_ack_event(&self) -> Option<AckEvent> {
        self.shared.buffers.acks.pop()
    }

    /// Guilds of the current snapshot.
    pub fn get_guilds(&self) -> Vec<Guild> {
        self.shared.with_cache(|cache| cache.guilds.clone())
    }

    /// Role lists per guild.
    pub fn get_roles(&self) -> Vec<GuildRoles> {
        self.shared.with_cache(|cache| cache.roles.clone())
    }

    /// Direct and group message channels.
    pub fn get_dms(&self) -> Vec<DirectMessage> {
        self.shared.with_cache(|cache| cache.dms.clone())
    }

    /// Channels with messages newer than the last read one.
    pub fn get_unseen(&self) -> Vec<String> {
        self.shared.with_cache(|cache| cache.unseen.clone())
    }

    /// Channels with unread mentions.
    pub fn get_pings(&self) -> Vec<String> {
        self.shared.with_cache(|cache| cache.pings.clone())
    }

    /// User ids the account has blocked.
    pub fn get_blocked(&self) -> HashSet<String> {
        self.shared.with_cache(|cache| cache.blocked.clone())
    }

    /// Latest presence per user id.
    pub fn get_activities(&self) -> HashMap<String, Presence> {
        self.shared.with_cache(|cache| cache.activities.clone())
    }

    /// Cached roles of one member; counts as a use for LRU eviction.
    pub fn get_member_roles(&self, guild_id: &str, user_id: &str) -> Option<Vec<String>> {
        self.shared
            .with_cache(|cache| cache.member_roles.get(guild_id, user_id))
    }

    /// Id of the authenticated user, once READY has arrived.
    pub fn get_my_user_id(&self) -> Option<String> {
        self.shared.with_cache(|cache| cache.my_user_id.clone())
    }

    /// Why the session gave up for good, if it did.
    pub fn get_fatal_error(&self) -> Option<String> {
        self.shared.fatal_error()
    }

    /// Copy of the session identity and connection state.
    pub fn session(&self) -> Session {
        self.shared.session()
    }

    /// Last dispatch sequence number seen.
    pub fn sequence(&self) -> Option<u64> {
        self.shared.sequence()
    }

    /// Stops recovery, closes the socket and joins the background tasks.
    pub async fn disconnect(mut self) {
        self.shared.mark_stopped();
        let _ = self.stop.send(true);
        if let Some(supervisor) = self.supervisor.take() {
            let _ = supervisor.await;
        }
        self.shared.teardown().await;
        self.shared.set_state(SessionState::Disconnected);
        info!(event = "gateway_disconnected");
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if self.supervisor.is_none() {
            return;
        }
        self.shared.mark_stopped();
        let _ = self.stop.send(true);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let shared = Arc::clone(&self.shared);
            runtime.spawn(async move {
                shared.teardown().await;
            });
        }
    }
}
