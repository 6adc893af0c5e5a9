//! Session-scoped snapshot caches.
//!
//! Built from the two snapshot dispatches (`READY` and `READY_SUPPLEMENTAL`)
//! and patched by later events. Discarded on every fresh identify, kept across
//! a resume.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Deserialize;
use serde_json::Value;

use crate::gateway::events::UserRef;

/// Number of snapshot events that must be applied before the cache is usable.
pub const SNAPSHOT_STAGES: u8 = 2;

const RELATIONSHIP_BLOCKED: u8 = 2;
const CHANNEL_DM: u8 = 1;
const CHANNEL_GROUP_DM: u8 = 3;

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Channel {
    pub id: String,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: u8,
    pub parent_id: Option<String>,
    pub position: i64,
    pub topic: Option<String>,
    pub last_message_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Guild {
    pub id: String,
    pub name: String,
    pub owner_id: Option<String>,
    pub channels: Vec<Channel>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Role {
    pub id: String,
    pub name: String,
    pub color: u32,
    pub position: i64,
    pub hoist: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GuildRoles {
    pub guild_id: String,
    pub roles: Vec<Role>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirectMessage {
    pub id: String,
    pub kind: u8,
    pub name: Option<String>,
    pub recipients: Vec<UserRef>,
    pub last_message_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ActivityRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: u8,
    pub state: Option<String>,
    pub details: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Presence {
    pub user_id: String,
    pub status: String,
    pub activities: Vec<ActivityRecord>,
}

/// Session identity learned from `READY`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadyInfo {
    pub session_id: String,
    pub resume_url: Option<String>,
    pub user_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireReady {
    session_id: String,
    resume_gateway_url: Option<String>,
    user: UserRef,
    users: Vec<UserRef>,
    guilds: Vec<WireGuild>,
    private_channels: Vec<WirePrivateChannel>,
    read_state: WireReadState,
    relationships: Vec<WireRelationship>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireGuild {
    id: String,
    name: Option<String>,
    owner_id: Option<String>,
    properties: Option<WireGuildProperties>,
    channels: Vec<Channel>,
    roles: Vec<Role>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireGuildProperties {
    name: Option<String>,
    owner_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WirePrivateChannel {
    id: String,
    #[serde(rename = "type")]
    kind: u8,
    name: Option<String>,
    last_message_id: Option<String>,
    recipients: Vec<UserRef>,
    recipient_ids: Vec<String>,
}

/// `read_state` arrives either as a bare list or wrapped in `entries`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireReadState {
    Wrapped { entries: Vec<WireReadEntry> },
    Bare(Vec<WireReadEntry>),
}

impl Default for WireReadState {
    fn default() -> Self {
        Self::Bare(Vec::new())
    }
}

impl WireReadState {
    fn entries(&self) -> &[WireReadEntry] {
        match self {
            Self::Wrapped { entries } | Self::Bare(entries) => entries,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireReadEntry {
    id: String,
    last_message_id: Option<Value>,
    mention_count: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireRelationship {
    id: String,
    user_id: Option<String>,
    #[serde(rename = "type")]
    kind: u8,
}

impl WireRelationship {
    fn user_id(&self) -> &str {
        self.user_id.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireSupplemental {
    merged_presences: WireMergedPresences,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireMergedPresences {
    friends: Vec<WirePresence>,
    guilds: Vec<Vec<WirePresence>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WirePresence {
    user_id: Option<String>,
    user: Option<UserRef>,
    status: String,
    activities: Vec<ActivityRecord>,
}

impl WirePresence {
    fn into_presence(self) -> Option<Presence> {
        let user_id = self.user_id.or_else(|| self.user.map(|user| user.id))?;
        Some(Presence {
            user_id,
            status: self.status,
            activities: self.activities,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireMembersChunk {
    guild_id: String,
    members: Vec<WireChunkMember>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireChunkMember {
    user: UserRef,
    roles: Vec<String>,
}

/// Compares snowflake ids numerically, falling back to string order.
fn snowflake_newer(candidate: &str, seen: &str) -> bool {
    match (candidate.parse::<u64>(), seen.parse::<u64>()) {
        (Ok(candidate), Ok(seen)) => candidate > seen,
        _ => candidate != seen,
    }
}

fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Fixed-capacity least-recently-used cache of member roles, one per guild.
#[derive(Clone, Debug)]
pub struct MemberRoleCache {
    capacity: usize,
    guilds: HashMap<String, GuildMemberRoles>,
}

#[derive(Clone, Debug, Default)]
struct GuildMemberRoles {
    recency: VecDeque<String>,
    roles: HashMap<String, Vec<String>>,
}

impl GuildMemberRoles {
    fn touch(&mut self, user_id: &str) {
        if let Some(index) = self.recency.iter().position(|id| id == user_id) {
            if let Some(id) = self.recency.remove(index) {
                self.recency.push_back(id);
            }
        }
    }
}

impl MemberRoleCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            guilds: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Inserts or refreshes one member; evicts the least recently used member
    /// of the same guild when full.
    pub fn insert(&mut self, guild_id: &str, user_id: &str, roles: Vec<String>) {
        let guild = self.guilds.entry(guild_id.to_string()).or_default();
        if guild.roles.contains_key(user_id) {
            guild.roles.insert(user_id.to_string(), roles);
            guild.touch(user_id);
            return;
        }

        if guild.recency.len() >= self.capacity {
            if let Some(evicted) = guild.recency.pop_front() {
                guild.roles.remove(&evicted);
            }
        }
        guild.recency.push_back(user_id.to_string());
        guild.roles.insert(user_id.to_string(), roles);
    }

    /// Looks up a member's roles and marks the entry as recently used.
    pub fn get(&mut self, guild_id: &str, user_id: &str) -> Option<Vec<String>> {
        let guild = self.guilds.get_mut(guild_id)?;
        let roles = guild.roles.get(user_id).cloned()?;
        guild.touch(user_id);
        Some(roles)
    }

    pub fn len(&self, guild_id: &str) -> usize {
        self.guilds.get(guild_id).map_or(0, |guild| guild.roles.len())
    }

    pub fn is_empty(&self) -> bool {
        self.guilds.values().all(|guild| guild.roles.is_empty())
    }

    pub fn clear(&mut self) {
        self.guilds.clear();
    }
}

/// Everything the session learned from its snapshot events.
#[derive(Clone, Debug)]
pub struct SnapshotCache {
    pub my_user_id: Option<String>,
    pub guilds: Vec<Guild>,
    pub roles: Vec<GuildRoles>,
    pub dms: Vec<DirectMessage>,
    pub unseen: Vec<String>,
    pub pings: Vec<String>,
    pub blocked: HashSet<String>,
    pub activities: HashMap<String, Presence>,
    pub member_roles: MemberRoleCache,
    ready_stage: u8,
}

impl SnapshotCache {
    pub fn new(member_roles_per_guild: usize) -> Self {
        Self {
            my_user_id: None,
            guilds: Vec::new(),
            roles: Vec::new(),
            dms: Vec::new(),
            unseen: Vec::new(),
            pings: Vec::new(),
            blocked: HashSet::new(),
            activities: HashMap::new(),
            member_roles: MemberRoleCache::new(member_roles_per_guild),
            ready_stage: 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready_stage >= SNAPSHOT_STAGES
    }

    pub fn ready_stage(&self) -> u8 {
        self.ready_stage
    }

    /// Drops all session state ahead of a fresh identify.
    pub fn clear(&mut self) {
        let capacity = self.member_roles.capacity();
        *self = Self::new(capacity);
    }

    fn advance_stage(&mut self) {
        self.ready_stage = self.ready_stage.saturating_add(1).min(SNAPSHOT_STAGES);
    }

    /// Applies the first snapshot event.
    pub fn apply_ready(&mut self, d: &Value) -> Result<ReadyInfo, serde_json::Error> {
        let ready = WireReady::deserialize(d)?;
        let users: HashMap<&str, &UserRef> = ready
            .users
            .iter()
            .map(|user| (user.id.as_str(), user))
            .collect();

        let mut last_messages: HashMap<String, String> = HashMap::new();

        self.guilds.clear();
        self.roles.clear();
        for guild in &ready.guilds {
            let properties = guild.properties.as_ref();
            let name = guild
                .name
                .clone()
                .or_else(|| properties.and_then(|p| p.name.clone()))
                .unwrap_or_default();
            let owner_id = guild
                .owner_id
                .clone()
                .or_else(|| properties.and_then(|p| p.owner_id.clone()));
            for channel in &guild.channels {
                if let Some(last) = &channel.last_message_id {
                    last_messages.insert(channel.id.clone(), last.clone());
                }
            }
            self.guilds.push(Guild {
                id: guild.id.clone(),
                name,
                owner_id,
                channels: guild.channels.clone(),
            });
            self.roles.push(GuildRoles {
                guild_id: guild.id.clone(),
                roles: guild.roles.clone(),
            });
        }

        self.dms.clear();
        for channel in &ready.private_channels {
            let recipients = if channel.recipients.is_empty() {
                channel
                    .recipient_ids
                    .iter()
                    .map(|id| {
                        users.get(id.as_str()).map_or_else(
                            || UserRef {
                                id: id.clone(),
                                ..UserRef::default()
                            },
                            |user| (*user).clone(),
                        )
                    })
                    .collect()
            } else {
                channel.recipients.clone()
            };
            if let Some(last) = &channel.last_message_id {
                last_messages.insert(channel.id.clone(), last.clone());
            }
            self.dms.push(DirectMessage {
                id: channel.id.clone(),
                kind: channel.kind,
                name: channel.name.clone(),
                recipients,
                last_message_id: channel.last_message_id.clone(),
            });
        }

        self.unseen.clear();
        self.pings.clear();
        for entry in ready.read_state.entries() {
            if entry.mention_count > 0 {
                self.pings.push(entry.id.clone());
            }
            let acked = entry.last_message_id.as_ref().and_then(value_as_id);
            if let (Some(latest), Some(acked)) = (last_messages.get(&entry.id), acked) {
                if snowflake_newer(latest, &acked) {
                    self.unseen.push(entry.id.clone());
                }
            }
        }

        self.blocked = ready
            .relationships
            .iter()
            .filter(|relationship| relationship.kind == RELATIONSHIP_BLOCKED)
            .map(|relationship| relationship.user_id().to_string())
            .collect();

        self.my_user_id = Some(ready.user.id.clone());
        self.advance_stage();

        Ok(ReadyInfo {
            session_id: ready.session_id,
            resume_url: ready.resume_gateway_url,
            user_id: ready.user.id,
        })
    }

    /// Applies the second snapshot event: presences of friends and guild members.
    pub fn apply_ready_supplemental(&mut self, d: &Value) -> Result<(), serde_json::Error> {
        let supplemental = WireSupplemental::deserialize(d)?;
        let merged = supplemental.merged_presences;
        let presences = merged
            .friends
            .into_iter()
            .chain(merged.guilds.into_iter().flatten())
            .filter_map(WirePresence::into_presence);
        for presence in presences {
            self.activities.insert(presence.user_id.clone(), presence);
        }
        self.advance_stage();
        Ok(())
    }

    pub fn patch_presence(&mut self, d: &Value) -> Result<(), serde_json::Error> {
        if let Some(presence) = WirePresence::deserialize(d)?.into_presence() {
            self.activities.insert(presence.user_id.clone(), presence);
        }
        Ok(())
    }

    pub fn patch_relationship_add(&mut self, d: &Value) -> Result<(), serde_json::Error> {
        let relationship = WireRelationship::deserialize(d)?;
        let user_id = relationship.user_id().to_string();
        if relationship.kind == RELATIONSHIP_BLOCKED {
            self.blocked.insert(user_id);
        } else {
            self.blocked.remove(&user_id);
        }
        Ok(())
    }

    pub fn patch_relationship_remove(&mut self, d: &Value) -> Result<(), serde_json::Error> {
        let relationship = WireRelationship::deserialize(d)?;
        self.blocked.remove(relationship.user_id());
        Ok(())
    }

    pub fn patch_channel_create(&mut self, d: &Value) -> Result<(), serde_json::Error> {
        let channel = WirePrivateChannel::deserialize(d)?;
        if !matches!(channel.kind, CHANNEL_DM | CHANNEL_GROUP_DM) {
            return Ok(());
        }
        self.dms.retain(|dm| dm.id != channel.id);
        self.dms.insert(
            0,
            DirectMessage {
                id: channel.id,
                kind: channel.kind,
                name: channel.name,
                recipients: channel.recipients,
                last_message_id: channel.last_message_id,
            },
        );
        Ok(())
    }

    pub fn patch_channel_delete(&mut self, d: &Value) -> Result<(), serde_json::Error> {
        let channel = WirePrivateChannel::deserialize(d)?;
        self.dms.retain(|dm| dm.id != channel.id);
        Ok(())
    }

    /// A channel was read, here or on another client.
    pub fn mark_acked(&mut self, channel_id: &str) {
        self.unseen.retain(|id| id != channel_id);
        self.pings.retain(|id| id != channel_id);
    }

    pub fn apply_members_chunk(&mut self, d: &Value) -> Result<usize, serde_json::Error> {
        let chunk = WireMembersChunk::deserialize(d)?;
        let count = chunk.members.len();
        for member in chunk.members {
            self.member_roles
                .insert(&chunk.guild_id, &member.user.id, member.roles);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn ready_payload() -> Value {
        json!({
            "session_id": "sess-1",
            "resume_gateway_url": "wss://resume.example",
            "user": {"id": "1", "username": "me"},
            "users": [{"id": "7", "username": "friend"}],
            "guilds": [{
                "id": "100",
                "properties": {"name": "rustaceans", "owner_id": "7"},
                "channels": [
                    {"id": "200", "name": "general", "type": 0, "last_message_id": "500"},
                    {"id": "201", "name": "offtopic", "type": 0, "last_message_id": "300"}
                ],
                "roles": [{"id": "100", "name": "@everyone", "position": 0}]
            }],
            "private_channels": [
                {"id": "300", "type": 1, "recipient_ids": ["7"], "last_message_id": "900"}
            ],
            "read_state": {"entries": [
                {"id": "200", "last_message_id": "400", "mention_count": 0},
                {"id": "201", "last_message_id": "300", "mention_count": 2},
                {"id": "300", "last_message_id": 900, "mention_count": 0}
            ]},
            "relationships": [
                {"id": "7", "type": 1},
                {"id": "8", "type": 2}
            ]
        })
    }

    fn supplemental_payload() -> Value {
        json!({
            "merged_presences": {
                "friends": [{"user_id": "7", "status": "idle", "activities": [{"name": "chess", "type": 0}]}],
                "guilds": [[{"user_id": "9", "status": "online", "activities": []}]]
            }
        })
    }

    #[test]
    fn readiness_requires_both_snapshot_events() {
        let mut cache = SnapshotCache::new(8);
        assert!(!cache.is_ready());

        cache.apply_ready(&ready_payload()).expect("ready");
        assert!(!cache.is_ready());

        cache
            .apply_ready_supplemental(&supplemental_payload())
            .expect("supplemental");
        assert!(cache.is_ready());
    }

    #[test]
    fn ready_populates_directories() {
        let mut cache = SnapshotCache::new(8);
        let info = cache.apply_ready(&ready_payload()).expect("ready");

        assert_eq!(info.session_id, "sess-1");
        assert_eq!(info.resume_url.as_deref(), Some("wss://resume.example"));
        assert_eq!(cache.my_user_id.as_deref(), Some("1"));
        assert_eq!(cache.guilds[0].name, "rustaceans");
        assert_eq!(cache.guilds[0].channels.len(), 2);
        assert_eq!(cache.roles[0].roles[0].name, "@everyone");
        assert_eq!(cache.dms[0].recipients[0].username, "friend");
        assert_eq!(cache.unseen, vec!["200".to_string()]);
        assert_eq!(cache.pings, vec!["201".to_string()]);
        assert!(cache.blocked.contains("8"));
        assert!(!cache.blocked.contains("7"));
    }

    #[test]
    fn supplemental_fills_activity_table() {
        let mut cache = SnapshotCache::new(8);
        cache
            .apply_ready_supplemental(&supplemental_payload())
            .expect("supplemental");
        assert_eq!(cache.activities["7"].activities[0].name, "chess");
        assert_eq!(cache.activities["9"].status, "online");
    }

    #[test]
    fn presence_update_patches_by_user_id() {
        let mut cache = SnapshotCache::new(8);
        cache
            .apply_ready_supplemental(&supplemental_payload())
            .expect("supplemental");
        cache
            .patch_presence(&json!({"user": {"id": "7"}, "status": "dnd", "activities": []}))
            .expect("presence");
        assert_eq!(cache.activities["7"].status, "dnd");
        assert!(cache.activities["7"].activities.is_empty());
    }

    #[test]
    fn clear_resets_readiness_and_directories() {
        let mut cache = SnapshotCache::new(3);
        cache.apply_ready(&ready_payload()).expect("ready");
        cache
            .apply_ready_supplemental(&supplemental_payload())
            .expect("supplemental");
        cache.member_roles.insert("100", "7", vec!["r".to_string()]);

        cache.clear();

        assert!(!cache.is_ready());
        assert_eq!(cache.ready_stage(), 0);
        assert!(cache.guilds.is_empty());
        assert!(cache.activities.is_empty());
        assert!(cache.member_roles.is_empty());
        assert_eq!(cache.member_roles.capacity(), 3);
    }

    #[test]
    fn relationship_patches_track_blocked_users() {
        let mut cache = SnapshotCache::new(8);
        cache
            .patch_relationship_add(&json!({"id": "5", "type": 2}))
            .expect("add");
        assert!(cache.blocked.contains("5"));
        cache
            .patch_relationship_remove(&json!({"id": "5", "type": 2}))
            .expect("remove");
        assert!(!cache.blocked.contains("5"));
    }

    #[test]
    fn channel_create_only_tracks_private_channels() {
        let mut cache = SnapshotCache::new(8);
        cache
            .patch_channel_create(&json!({"id": "1", "type": 0, "guild_id": "9"}))
            .expect("guild channel");
        assert!(cache.dms.is_empty());
        cache
            .patch_channel_create(&json!({"id": "2", "type": 1, "recipients": [{"id": "7", "username": "f"}]}))
            .expect("dm");
        assert_eq!(cache.dms[0].id, "2");
        cache
            .patch_channel_delete(&json!({"id": "2", "type": 1}))
            .expect("delete");
        assert!(cache.dms.is_empty());
    }

    #[test]
    fn member_role_cache_evicts_least_recently_used() {
        let mut cache = MemberRoleCache::new(2);
        cache.insert("g", "a", vec!["1".to_string()]);
        cache.insert("g", "b", vec!["2".to_string()]);

        // Touch "a" so "b" becomes the eviction candidate.
        assert_eq!(cache.get("g", "a"), Some(vec!["1".to_string()]));
        cache.insert("g", "c", vec!["3".to_string()]);

        assert_eq!(cache.len("g"), 2);
        assert!(cache.get("g", "b").is_none());
        assert!(cache.get("g", "a").is_some());
        assert!(cache.get("g", "c").is_some());
    }

    #[test]
    fn member_role_cache_capacity_is_per_guild() {
        let mut cache = MemberRoleCache::new(1);
        cache.insert("g1", "a", Vec::new());
        cache.insert("g2", "b", Vec::new());
        assert_eq!(cache.len("g1"), 1);
        assert_eq!(cache.len("g2"), 1);
    }

    #[test]
    fn reinserting_member_updates_roles_without_eviction() {
        let mut cache = MemberRoleCache::new(2);
        cache.insert("g", "a", vec!["1".to_string()]);
        cache.insert("g", "b", vec!["2".to_string()]);
        cache.insert("g", "a", vec!["9".to_string()]);
        assert_eq!(cache.len("g"), 2);
        assert_eq!(cache.get("g", "a"), Some(vec!["9".to_string()]));
        assert!(cache.get("g", "b").is_some());
    }

    #[test]
    fn members_chunk_feeds_role_cache() {
        let mut cache = SnapshotCache::new(8);
        let count = cache
            .apply_members_chunk(&json!({
                "guild_id": "100",
                "members": [{"user": {"id": "7", "username": "f"}, "roles": ["r1", "r2"]}]
            }))
            .expect("chunk");
        assert_eq!(count, 1);
        assert_eq!(
            cache.member_roles.get("100", "7"),
            Some(vec!["r1".to_string(), "r2".to_string()])
        );
    }
}
