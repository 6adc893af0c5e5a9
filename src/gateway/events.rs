//! Normalized event records and the per-family FIFO buffers the receiver
//! fills for the consumer.

use std::sync::{Mutex, PoisonError};

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// Minimal user reference carried by messages, typing and DM recipients.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UserRef {
    pub id: String,
    pub username: String,
    pub global_name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    pub url: String,
    pub size: u64,
}

/// A created or edited message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: String,
    pub channel_id: String,
    pub guild_id: Option<String>,
    pub author: Option<UserRef>,
    pub content: Option<String>,
    pub timestamp: Option<String>,
    pub edited_timestamp: Option<String>,
    pub referenced_message_id: Option<String>,
    pub mention_ids: Vec<String>,
    pub attachments: Vec<Attachment>,
}

/// Identifies a message without its content, as delivered on delete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRef {
    pub id: String,
    pub channel_id: String,
    pub guild_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EmojiRef {
    pub id: Option<String>,
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReactionRecord {
    pub message_id: String,
    pub channel_id: String,
    pub guild_id: Option<String>,
    pub user_id: String,
    pub emoji: EmojiRef,
}

/// Message-mutation family: everything that changes what a channel shows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageEvent {
    Created(MessageRecord),
    Updated(MessageRecord),
    Deleted(MessageRef),
    ReactionAdded(ReactionRecord),
    ReactionRemoved(ReactionRecord),
}

impl MessageEvent {
    pub fn message_id(&self) -> &str {
        match self {
            Self::Created(record) | Self::Updated(record) => &record.id,
            Self::Deleted(reference) => &reference.id,
            Self::ReactionAdded(reaction) | Self::ReactionRemoved(reaction) => {
                &reaction.message_id
            }
        }
    }

    pub fn channel_id(&self) -> &str {
        match self {
            Self::Created(record) | Self::Updated(record) => &record.channel_id,
            Self::Deleted(reference) => &reference.channel_id,
            Self::ReactionAdded(reaction) | Self::ReactionRemoved(reaction) => {
                &reaction.channel_id
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypingEvent {
    pub channel_id: String,
    pub guild_id: Option<String>,
    pub user_id: String,
    pub username: Option<String>,
    pub timestamp: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Summary {
    pub id: String,
    pub topic: String,
    #[serde(rename = "summ_short")]
    pub description: String,
    pub start_id: String,
    pub end_id: String,
    pub people: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SummaryEvent {
    pub channel_id: String,
    pub guild_id: Option<String>,
    pub summaries: Vec<Summary>,
}

/// Read-state echo for a channel, usually caused by another client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckEvent {
    pub channel_id: String,
    pub message_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireMessage {
    id: String,
    channel_id: String,
    guild_id: Option<String>,
    author: Option<UserRef>,
    content: Option<String>,
    timestamp: Option<String>,
    edited_timestamp: Option<String>,
    message_reference: Option<WireReference>,
    mentions: Vec<UserRef>,
    attachments: Vec<Attachment>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireReference {
    message_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireReaction {
    message_id: String,
    channel_id: String,
    guild_id: Option<String>,
    user_id: String,
    emoji: EmojiRef,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireTyping {
    channel_id: String,
    guild_id: Option<String>,
    user_id: String,
    timestamp: u64,
    member: Option<WireMember>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireMember {
    user: Option<UserRef>,
    nick: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireSummaryUpdate {
    channel_id: String,
    guild_id: Option<String>,
    summaries: Vec<Summary>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireAck {
    channel_id: String,
    message_id: Option<String>,
}

impl MessageRecord {
    pub fn from_payload(d: &Value) -> Result<Self, serde_json::Error> {
        let wire = WireMessage::deserialize(d)?;
        Ok(Self {
            id: wire.id,
            channel_id: wire.channel_id,
            guild_id: wire.guild_id,
            author: wire.author,
            content: wire.content,
            timestamp: wire.timestamp,
            edited_timestamp: wire.edited_timestamp,
            referenced_message_id: wire.message_reference.and_then(|r| r.message_id),
            mention_ids: wire.mentions.into_iter().map(|user| user.id).collect(),
            attachments: wire.attachments,
        })
    }
}

impl MessageRef {
    pub fn from_payload(d: &Value) -> Result<Self, serde_json::Error> {
        let wire = WireMessage::deserialize(d)?;
        Ok(Self {
            id: wire.id,
            channel_id: wire.channel_id,
            guild_id: wire.guild_id,
        })
    }
}

impl ReactionRecord {
    pub fn from_payload(d: &Value) -> Result<Self, serde_json::Error> {
        let wire = WireReaction::deserialize(d)?;
        Ok(Self {
            message_id: wire.message_id,
            channel_id: wire.channel_id,
            guild_id: wire.guild_id,
            user_id: wire.user_id,
            emoji: wire.emoji,
        })
    }
}

impl TypingEvent {
    pub fn from_payload(d: &Value) -> Result<Self, serde_json::Error> {
        let wire = WireTyping::deserialize(d)?;
        let username = wire.member.and_then(|member| {
            member.nick.or_else(|| {
                member
                    .user
                    .map(|user| user.global_name.unwrap_or(user.username))
            })
        });
        Ok(Self {
            channel_id: wire.channel_id,
            guild_id: wire.guild_id,
            user_id: wire.user_id,
            username,
            timestamp: wire.timestamp,
        })
    }
}

impl SummaryEvent {
    pub fn from_payload(d: &Value) -> Result<Self, serde_json::Error> {
        let wire = WireSummaryUpdate::deserialize(d)?;
        Ok(Self {
            channel_id: wire.channel_id,
            guild_id: wire.guild_id,
            summaries: wire.summaries,
        })
    }
}

impl AckEvent {
    pub fn from_payload(d: &Value) -> Result<Self, serde_json::Error> {
        let wire = WireAck::deserialize(d)?;
        Ok(Self {
            channel_id: wire.channel_id,
            message_id: wire.message_id,
        })
    }
}

/// Unbounded FIFO with a non-blocking consumer side.
#[derive(Debug)]
pub struct EventQueue<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: Mutex<mpsc::UnboundedReceiver<T>>,
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn push(&self, item: T) {
        // The receiver lives as long as the queue, so this cannot fail.
        let _ = self.tx.send(item);
    }

    /// Returns the oldest queued item, or `None` without waiting.
    pub fn pop(&self) -> Option<T> {
        self.rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_recv()
            .ok()
    }

    pub fn drain(&self) -> Vec<T> {
        let mut rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One queue per event family.
#[derive(Debug, Default)]
pub struct EventBuffers {
    pub messages: EventQueue<MessageEvent>,
    pub typing: EventQueue<TypingEvent>,
    pub summaries: EventQueue<SummaryEvent>,
    pub acks: EventQueue<AckEvent>,
}
