//! Inbound loop for one socket: decode, route, and hand failures to the
//! reconnect supervisor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use crate::gateway::client::GatewayError;
use crate::gateway::codec::FrameCodec;
use crate::gateway::connection::{close_error, GatewayShared, WsStream};
use crate::gateway::events::{
    AckEvent, MessageEvent, MessageRecord, MessageRef, ReactionRecord, SummaryEvent, TypingEvent,
};
use crate::gateway::proto::{self, opcode, GatewayPayload, HelloPayload};
use crate::gateway::session::SessionState;

/// What the receive loop should do after handling a payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Control {
    Continue,
    Reconnect(&'static str),
}

enum ReceiverExit {
    Stopped,
    Reconnect(&'static str),
    Closed(Option<u16>),
    Failed(GatewayError),
}

pub(crate) async fn run_receiver(
    shared: Arc<GatewayShared>,
    mut stream: WsStream,
    mut codec: FrameCodec,
    running: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) -> FrameCodec {
    debug!(event = "receiver_started", codec_resets = codec.resets());

    let exit = loop {
        if !running.load(Ordering::SeqCst) || shared.is_stopped() {
            break ReceiverExit::Stopped;
        }

        let next = tokio::select! {
            biased;
            _ = shutdown.changed() => break ReceiverExit::Stopped,
            next = stream.next() => next,
        };

        let decoded = match next {
            Some(Ok(Message::Binary(bytes))) => match codec.decompress(&bytes) {
                Ok(Some(raw)) => GatewayPayload::from_slice(&raw),
                Ok(None) => {
                    trace!(event = "partial_frame_buffered", len = bytes.len());
                    continue;
                }
                Err(err) => break ReceiverExit::Failed(err.into()),
            },
            Some(Ok(Message::Text(text))) => GatewayPayload::from_text(&text),
            Some(Ok(Message::Close(frame))) => {
                break ReceiverExit::Closed(frame.map(|frame| u16::from(frame.code)));
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => break ReceiverExit::Failed(err.into()),
            None => break ReceiverExit::Closed(None),
        };

        let payload = match decoded {
            Ok(payload) => payload,
            Err(err) => {
                warn!(event = "frame_parse_failed", error = %err, "dropping undecodable frame");
                continue;
            }
        };

        if let Control::Reconnect(reason) = handle_payload(&shared, payload).await {
            break ReceiverExit::Reconnect(reason);
        }
    };

    running.store(false, Ordering::SeqCst);
    match exit {
        ReceiverExit::Stopped => debug!(event = "receiver_stopped"),
        ReceiverExit::Reconnect(reason) => {
            info!(event = "receiver_reconnect", reason);
            shared.set_state(SessionState::Disconnected);
            shared.reconnect.raise(reason);
        }
        ReceiverExit::Closed(code) => {
            let err = close_error(code);
            if err.is_fatal() {
                shared.set_fatal(&err);
                // This task belongs to the generation being torn down and cannot join itself.
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    shared.teardown().await;
                });
            } else {
                warn!(event = "socket_closed", code = ?code);
                shared.set_state(SessionState::Disconnected);
                shared.reconnect.raise("socket_closed");
            }
        }
        ReceiverExit::Failed(err) => {
            warn!(event = "receiver_failed", error = %err);
            shared.set_state(SessionState::Disconnected);
            shared.reconnect.raise("receive_failed");
        }
    }

    codec
}

/// Applies one inbound payload to session state, caches and buffers.
pub(crate) async fn handle_payload(shared: &GatewayShared, payload: GatewayPayload) -> Control {
    match payload.op {
        opcode::DISPATCH => {
            dispatch(shared, payload);
            Control::Continue
        }
        opcode::HEARTBEAT_ACK => {
            shared.liveness.store(true, Ordering::SeqCst);
            trace!(event = "heartbeat_acked");
            Control::Continue
        }
        opcode::HEARTBEAT => {
            debug!(event = "heartbeat_requested");
            shared.send(&proto::heartbeat(shared.sequence())).await;
            Control::Continue
        }
        opcode::HELLO => {
            match payload.d.map(serde_json::from_value::<HelloPayload>) {
                Some(Ok(hello)) => shared.set_heartbeat_interval(hello.heartbeat_interval),
                _ => warn!(event = "hello_malformed"),
            }
            Control::Continue
        }
        opcode::RECONNECT => {
            info!(event = "server_requested_reconnect");
            Control::Reconnect("server_reconnect")
        }
        opcode::INVALID_SESSION => {
            let resumable = payload.d.as_ref().and_then(Value::as_bool).unwrap_or(false);
            if !resumable {
                shared.clear_resume();
            }
            info!(event = "invalid_session", resumable);
            Control::Reconnect("invalid_session")
        }
        op => {
            debug!(event = "unknown_opcode", op);
            Control::Continue
        }
    }
}

type DispatchHandler = fn(&GatewayShared, &Value) -> Result<(), serde_json::Error>;

const ROUTES: &[(&str, DispatchHandler)] = &[
    ("READY", on_ready),
    ("READY_SUPPLEMENTAL", on_ready_supplemental),
    ("RESUMED", on_resumed),
    ("MESSAGE_CREATE", on_message_create),
    ("MESSAGE_UPDATE", on_message_update),
    ("MESSAGE_DELETE", on_message_delete),
    ("MESSAGE_REACTION_ADD", on_reaction_add),
    ("MESSAGE_REACTION_REMOVE", on_reaction_remove),
    ("TYPING_START", on_typing_start),
    ("CONVERSATION_SUMMARY_UPDATE", on_summary_update),
    ("MESSAGE_ACK", on_message_ack),
    ("PRESENCE_UPDATE", on_presence_update),
    ("GUILD_MEMBERS_CHUNK", on_members_chunk),
    ("RELATIONSHIP_ADD", on_relationship_add),
    ("RELATIONSHIP_REMOVE", on_relationship_remove),
    ("CHANNEL_CREATE", on_channel_create),
    ("CHANNEL_DELETE", on_channel_delete),
];

fn route(name: &str) -> Option<DispatchHandler> {
    static TABLE: OnceLock<HashMap<&'static str, DispatchHandler>> = OnceLock::new();
    TABLE
        .get_or_init(|| ROUTES.iter().copied().collect())
        .get(name)
        .copied()
}

fn dispatch(shared: &GatewayShared, payload: GatewayPayload) {
    if let Some(sequence) = payload.s {
        shared.observe_sequence(sequence);
    }
    let Some(name) = payload.t.as_deref() else {
        debug!(event = "dispatch_without_name");
        return;
    };
    let d = payload.d.unwrap_or(Value::Null);

    match route(name) {
        Some(handler) => {
            if let Err(err) = handler(shared, &d) {
                warn!(event = "dispatch_malformed", name, error = %err);
            }
        }
        None => trace!(event = "dispatch_ignored", name),
    }
}

fn on_ready(shared: &GatewayShared, d: &Value) -> Result<(), serde_json::Error> {
    let ready = shared.with_cache(|cache| cache.apply_ready(d))?;
    shared.record_ready(&ready);
    shared.set_state(SessionState::Connected);
    info!(
        event = "session_ready",
        session_id = %ready.session_id,
        user_id = %ready.user_id
    );
    Ok(())
}

fn on_ready_supplemental(shared: &GatewayShared, d: &Value) -> Result<(), serde_json::Error> {
    let ready = shared.with_cache(|cache| {
        cache.apply_ready_supplemental(d)?;
        Ok::<_, serde_json::Error>(cache.is_ready())
    })?;
    info!(event = "snapshot_supplemented", ready);
    Ok(())
}

fn on_resumed(shared: &GatewayShared, _d: &Value) -> Result<(), serde_json::Error> {
    info!(event = "session_resumed", sequence = ?shared.sequence());
    Ok(())
}

fn on_message_create(shared: &GatewayShared, d: &Value) -> Result<(), serde_json::Error> {
    let record = MessageRecord::from_payload(d)?;
    shared.buffers.messages.push(MessageEvent::Created(record));
    Ok(())
}

fn on_message_update(shared: &GatewayShared, d: &Value) -> Result<(), serde_json::Error> {
    let record = MessageRecord::from_payload(d)?;
    shared.buffers.messages.push(MessageEvent::Updated(record));
    Ok(())
}

fn on_message_delete(shared: &GatewayShared, d: &Value) -> Result<(), serde_json::Error> {
    let reference = MessageRef::from_payload(d)?;
    shared.buffers.messages.push(MessageEvent::Deleted(reference));
    Ok(())
}

fn on_reaction_add(shared: &GatewayShared, d: &Value) -> Result<(), serde_json::Error> {
    let reaction = ReactionRecord::from_payload(d)?;
    shared
        .buffers
        .messages
        .push(MessageEvent::ReactionAdded(reaction));
    Ok(())
}

fn on_reaction_remove(shared: &GatewayShared, d: &Value) -> Result<(), serde_json::Error> {
    let reaction = ReactionRecord::from_payload(d)?;
    shared
        .buffers
        .messages
        .push(MessageEvent::ReactionRemoved(reaction));
    Ok(())
}

fn on_typing_start(shared: &GatewayShared, d: &Value) -> Result<(), serde_json::Error> {
    shared.buffers.typing.push(TypingEvent::from_payload(d)?);
    Ok(())
}

fn on_summary_update(shared: &GatewayShared, d: &Value) -> Result<(), serde_json::Error> {
    shared.buffers.summaries.push(SummaryEvent::from_payload(d)?);
    Ok(())
}

fn on_message_ack(shared: &GatewayShared, d: &Value) -> Result<(), serde_json::Error> {
    let ack = AckEvent::from_payload(d)?;
    shared.with_cache(|cache| cache.mark_acked(&ack.channel_id));
    shared.buffers.acks.push(ack);
    Ok(())
}

fn on_presence_update(shared: &GatewayShared, d: &Value) -> Result<(), serde_json::Error> {
    shared.with_cache(|cache| cache.patch_presence(d))
}

fn on_members_chunk(shared: &GatewayShared, d: &Value) -> Result<(), serde_json::Error> {
    let stored = shared.with_cache(|cache| cache.apply_members_chunk(d))?;
    debug!(event = "member_roles_cached", stored);
    Ok(())
}

fn on_relationship_add(shared: &GatewayShared, d: &Value) -> Result<(), serde_json::Error> {
    shared.with_cache(|cache| cache.patch_relationship_add(d))
}

fn on_relationship_remove(shared: &GatewayShared, d: &Value) -> Result<(), serde_json::Error> {
    shared.with_cache(|cache| cache.patch_relationship_remove(d))
}

fn on_channel_create(shared: &GatewayShared, d: &Value) -> Result<(), serde_json::Error> {
    shared.with_cache(|cache| cache.patch_channel_create(d))
}

fn on_channel_delete(shared: &GatewayShared, d: &Value) -> Result<(), serde_json::Error> {
    shared.with_cache(|cache| cache.patch_channel_delete(d))
}
