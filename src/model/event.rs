//! Events and payloads exchanged with the gateway.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::serial::Eq;

use super::{
    Activity, Channel, ChannelId, CurrentUser, CurrentUserPatch, Emoji, Guild, GuildCreate,
    GuildId, Intents, Member, Message, MessageId, OnlineStatus, PossibleGuild, Presence,
    ReactionEmoji, Role, RoleId, User, UserId, VoiceState,
};

// Inbound

/// A JSON payload message received over the gateway, of any purpose, not
/// just event dispatching.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum GatewayPayload {
    /// An event was sent by the gateway.
    Dispatch {
        #[doc(hidden)]
        op: Eq<0>,

        /// The received dispatch.
        #[serde(flatten)]
        dispatch: DispatchPayload,
    },

    /// The gateway requests an immediate heartbeat.
    Heartbeat {
        #[doc(hidden)]
        op: Eq<1>,
    },

    /// The gateway asks the client to reconnect (and resume).
    Reconnect {
        #[doc(hidden)]
        op: Eq<7>,
    },

    /// The current gateway session is invalid.
    InvalidSession {
        #[doc(hidden)]
        op: Eq<9>,

        /// Whether the session can still be resumed.
        #[serde(rename = "d", default)]
        resumable: bool,
    },

    /// The first message sent to the client.
    Hello {
        #[doc(hidden)]
        op: Eq<10>,

        #[serde(rename = "d")]
        payload: HelloPayload,
    },

    /// Acknowledges a heartbeat sent by the client.
    HeartbeatAck {
        #[doc(hidden)]
        op: Eq<11>,
    },
}

/// The data (`d`) field of a gateway `Hello` message.
#[derive(Debug, Clone, Deserialize)]
pub struct HelloPayload {
    /// Interval (in milliseconds) the client should heartbeat with.
    pub heartbeat_interval: u64,
}

/// A dispatch (opcode 0) received from the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchPayload {
    /// The event that occurred.
    #[serde(flatten)]
    pub event: Event,

    /// The sequence number of the event.
    #[serde(rename = "s")]
    pub sequence: u64,
}

/// Turns raw gateway frames into typed payloads.
///
/// The default implementation parses the standard JSON framing; a custom
/// decoder can substitute alternative codecs or instrumentation.
pub trait Decoder: Send + Sync {
    fn decode(&self, frame: &[u8]) -> Result<GatewayPayload>;
}

/// The standard `{op, d, s?, t?}` JSON decoder.
#[derive(Debug, Default)]
pub struct JsonDecoder;

impl Decoder for JsonDecoder {
    fn decode(&self, frame: &[u8]) -> Result<GatewayPayload> {
        serde_json::from_slice(frame).map_err(Error::Json)
    }
}

/// Event received over a gateway connection.
///
/// The `Guild*` variants past `VoiceServerUpdate` are derived by the state
/// layer from `GuildCreate`/`GuildDelete` and never appear on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(tag = "t", content = "d")]
pub enum Event {
    /// The first event in a connection, containing the initial state.
    Ready(ReadyEvent),
    /// The connection has successfully resumed after a disconnect.
    Resumed(ResumedEvent),

    /// Update to the logged-in user's information
    UserUpdate(CurrentUserPatch),
    /// Update to a note the logged-in user has set for another user.
    UserNoteUpdate(UserNoteUpdateEvent),
    /// Update to the logged-in user's client settings
    UserSettingsUpdate(Value),
    /// Update to the logged-in user's per-guild notification settings
    UserGuildSettingsUpdate(Value),

    GuildCreate(PossibleGuild),
    GuildUpdate(Guild),
    GuildDelete(GuildDeleteEvent),

    GuildMemberAdd(MemberAddEvent),
    GuildMemberUpdate(MemberUpdateEvent),
    GuildMemberRemove(MemberRemoveEvent),
    GuildMembersChunk(MembersChunkEvent),

    GuildRoleCreate(RoleEvent),
    GuildRoleUpdate(RoleEvent),
    GuildRoleDelete(RoleDeleteEvent),

    GuildEmojisUpdate(EmojisUpdateEvent),

    ChannelCreate(Channel),
    ChannelUpdate(Channel),
    ChannelDelete(Channel),

    MessageCreate(Box<Message>),
    MessageUpdate(MessageUpdateEvent),
    MessageDelete(MessageDeleteEvent),

    MessageReactionAdd(ReactionEvent),
    MessageReactionRemove(ReactionEvent),
    MessageReactionRemoveAll(ReactionRemoveAllEvent),
    MessageReactionRemoveEmoji(ReactionRemoveEmojiEvent),

    /// A member's presence (or username or avatar) has changed
    PresenceUpdate(PresenceUpdateEvent),
    /// The presence list should be replaced entirely
    PresencesReplace(Vec<Presence>),

    /// A user is typing; considered to last 5 seconds
    TypingStart(TypingStartEvent),

    /// A member's voice state has changed
    VoiceStateUpdate(VoiceState),
    /// Voice server information is available
    VoiceServerUpdate(VoiceServerUpdateEvent),

    // Derived events, produced by the state layer.
    /// A guild announced in `Ready` has been fully delivered.
    GuildReady(GuildCreate),
    /// A previously unavailable guild has come back.
    GuildAvailable(GuildCreate),
    /// The current user has joined a new guild.
    GuildJoin(GuildCreate),
    /// A guild has become unavailable due to an outage.
    GuildUnavailable(GuildId),
    /// The current user has left or been removed from a guild.
    GuildLeave(GuildId),

    /// An event type not covered by the above
    #[serde(other)]
    Unknown,
}

/// The exact variant of an [`Event`], used for dispatcher filters.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub enum EventType {
    Ready,
    Resumed,
    UserUpdate,
    UserNoteUpdate,
    UserSettingsUpdate,
    UserGuildSettingsUpdate,
    GuildCreate,
    GuildUpdate,
    GuildDelete,
    GuildMemberAdd,
    GuildMemberUpdate,
    GuildMemberRemove,
    GuildMembersChunk,
    GuildRoleCreate,
    GuildRoleUpdate,
    GuildRoleDelete,
    GuildEmojisUpdate,
    ChannelCreate,
    ChannelUpdate,
    ChannelDelete,
    MessageCreate,
    MessageUpdate,
    MessageDelete,
    MessageReactionAdd,
    MessageReactionRemove,
    MessageReactionRemoveAll,
    MessageReactionRemoveEmoji,
    PresenceUpdate,
    PresencesReplace,
    TypingStart,
    VoiceStateUpdate,
    VoiceServerUpdate,
    GuildReady,
    GuildAvailable,
    GuildJoin,
    GuildUnavailable,
    GuildLeave,
    Unknown,
}

impl Event {
    /// The exact variant of this event.
    pub fn kind(&self) -> EventType {
        match self {
            Event::Ready(_) => EventType::Ready,
            Event::Resumed(_) => EventType::Resumed,
            Event::UserUpdate(_) => EventType::UserUpdate,
            Event::UserNoteUpdate(_) => EventType::UserNoteUpdate,
            Event::UserSettingsUpdate(_) => EventType::UserSettingsUpdate,
            Event::UserGuildSettingsUpdate(_) => EventType::UserGuildSettingsUpdate,
            Event::GuildCreate(_) => EventType::GuildCreate,
            Event::GuildUpdate(_) => EventType::GuildUpdate,
            Event::GuildDelete(_) => EventType::GuildDelete,
            Event::GuildMemberAdd(_) => EventType::GuildMemberAdd,
            Event::GuildMemberUpdate(_) => EventType::GuildMemberUpdate,
            Event::GuildMemberRemove(_) => EventType::GuildMemberRemove,
            Event::GuildMembersChunk(_) => EventType::GuildMembersChunk,
            Event::GuildRoleCreate(_) => EventType::GuildRoleCreate,
            Event::GuildRoleUpdate(_) => EventType::GuildRoleUpdate,
            Event::GuildRoleDelete(_) => EventType::GuildRoleDelete,
            Event::GuildEmojisUpdate(_) => EventType::GuildEmojisUpdate,
            Event::ChannelCreate(_) => EventType::ChannelCreate,
            Event::ChannelUpdate(_) => EventType::ChannelUpdate,
            Event::ChannelDelete(_) => EventType::ChannelDelete,
            Event::MessageCreate(_) => EventType::MessageCreate,
            Event::MessageUpdate(_) => EventType::MessageUpdate,
            Event::MessageDelete(_) => EventType::MessageDelete,
            Event::MessageReactionAdd(_) => EventType::MessageReactionAdd,
            Event::MessageReactionRemove(_) => EventType::MessageReactionRemove,
            Event::MessageReactionRemoveAll(_) => EventType::MessageReactionRemoveAll,
            Event::MessageReactionRemoveEmoji(_) => EventType::MessageReactionRemoveEmoji,
            Event::PresenceUpdate(_) => EventType::PresenceUpdate,
            Event::PresencesReplace(_) => EventType::PresencesReplace,
            Event::TypingStart(_) => EventType::TypingStart,
            Event::VoiceStateUpdate(_) => EventType::VoiceStateUpdate,
            Event::VoiceServerUpdate(_) => EventType::VoiceServerUpdate,
            Event::GuildReady(_) => EventType::GuildReady,
            Event::GuildAvailable(_) => EventType::GuildAvailable,
            Event::GuildJoin(_) => EventType::GuildJoin,
            Event::GuildUnavailable(_) => EventType::GuildUnavailable,
            Event::GuildLeave(_) => EventType::GuildLeave,
            Event::Unknown => EventType::Unknown,
        }
    }
}

/// The "Ready" event, containing initial state.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyEvent {
    /// Active gateway version
    #[serde(rename = "v")]
    pub version: u64,

    /// Logged in user.
    pub user: CurrentUser,

    /// The ID of the current session, used for resuming.
    pub session_id: String,
    /// The gateway URL to resume on, when provided.
    #[serde(default)]
    pub resume_gateway_url: Option<String>,

    /// The guilds the user is in; most arrive offline here and are
    /// populated by discrete `GuildCreate` events.
    #[serde(default)]
    pub guilds: Vec<PossibleGuild>,

    /// Direct and group channels already open.
    #[serde(default)]
    pub private_channels: Vec<Channel>,

    /// Initial presences, for user accounts.
    #[serde(default)]
    pub presences: Vec<Presence>,

    /// For bot users, the shard info for this session; the shard ID used
    /// and the total number of shards.
    #[serde(default)]
    pub shard: Option<[u32; 2]>,
}

/// The "Resumed" event.
#[derive(Debug, Clone, Deserialize)]
pub struct ResumedEvent {
    /// The trace of gateway servers involved in serving this connection.
    #[serde(rename = "_trace", default)]
    pub trace: Option<Vec<Option<String>>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserNoteUpdateEvent {
    pub id: UserId,
    pub note: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuildDeleteEvent {
    pub id: GuildId,
    /// Set when the guild went down rather than the user leaving it.
    #[serde(default)]
    pub unavailable: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemberAddEvent {
    pub guild_id: GuildId,
    #[serde(flatten)]
    pub member: Member,
}

/// A partial member update; only non-null fields are applied to the cache.
#[derive(Debug, Clone, Deserialize)]
pub struct MemberUpdateEvent {
    pub guild_id: GuildId,
    pub user: User,
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub roles: Option<Vec<RoleId>>,
    #[serde(default)]
    pub joined_at: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub mute: Option<bool>,
    #[serde(default)]
    pub deaf: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemberRemoveEvent {
    pub guild_id: GuildId,
    pub user: User,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MembersChunkEvent {
    pub guild_id: GuildId,
    pub members: Vec<Member>,
    #[serde(default)]
    pub chunk_index: u32,
    #[serde(default)]
    pub chunk_count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleEvent {
    pub guild_id: GuildId,
    pub role: Role,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleDeleteEvent {
    pub guild_id: GuildId,
    pub role_id: RoleId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmojisUpdateEvent {
    pub guild_id: GuildId,
    pub emojis: Vec<Emoji>,
}

/// A message edit; only non-null fields changed.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageUpdateEvent {
    pub id: MessageId,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub edited_timestamp: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub pinned: Option<bool>,
    #[serde(default)]
    pub mention_everyone: Option<bool>,
    #[serde(default)]
    pub mentions: Option<Vec<User>>,
    #[serde(default)]
    pub embeds: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageDeleteEvent {
    pub id: MessageId,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
}

/// A single user added or removed a single reaction.
#[derive(Debug, Clone, Deserialize)]
pub struct ReactionEvent {
    pub user_id: UserId,
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    #[serde(with = "crate::serial::reaction_emoji")]
    pub emoji: ReactionEmoji,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReactionRemoveAllEvent {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReactionRemoveEmojiEvent {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    #[serde(with = "crate::serial::reaction_emoji")]
    pub emoji: ReactionEmoji,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresenceUpdateEvent {
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    #[serde(flatten)]
    pub presence: Presence,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TypingStartEvent {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    /// Unix time (in seconds) of when the user started typing.
    pub timestamp: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceServerUpdateEvent {
    pub guild_id: GuildId,
    pub token: String,
    /// The voice server host; absent when the current server went away and a
    /// new one has not yet been allocated.
    #[serde(default)]
    pub endpoint: Option<String>,
}

// Outbound

/// A JSON payload message sent to the gateway.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Command {
    /// Used to maintain an active gateway connection.
    Heartbeat {
        #[doc(hidden)]
        op: Eq<1>,

        /// The last event sequence number received, if any.
        #[serde(rename = "d")]
        sequence: Option<u64>,
    },

    /// Used to trigger the initial handshake with the gateway.
    Identify {
        #[doc(hidden)]
        op: Eq<2>,

        #[serde(rename = "d")]
        payload: IdentifyPayload,
    },

    /// Sent by the client to indicate a presence or status update.
    UpdatePresence {
        #[doc(hidden)]
        op: Eq<3>,

        #[serde(rename = "d")]
        payload: UpdatePresencePayload,
    },

    /// Sent when the client wants to join, move, or disconnect from a voice
    /// channel.
    UpdateVoiceState {
        #[doc(hidden)]
        op: Eq<4>,

        #[serde(rename = "d")]
        payload: UpdateVoiceStatePayload,
    },

    /// Used to replay missed events when a disconnected client resumes.
    Resume {
        #[doc(hidden)]
        op: Eq<6>,

        #[serde(rename = "d")]
        payload: ResumePayload,
    },

    /// Used to request members for a guild.
    RequestGuildMembers {
        #[doc(hidden)]
        op: Eq<8>,

        #[serde(rename = "d")]
        payload: RequestGuildMembersPayload,
    },
}

impl Command {
    pub fn heartbeat(sequence: Option<u64>) -> Command {
        Command::Heartbeat { op: Eq, sequence }
    }

    pub fn identify(payload: IdentifyPayload) -> Command {
        Command::Identify { op: Eq, payload }
    }

    pub fn update_presence(payload: UpdatePresencePayload) -> Command {
        Command::UpdatePresence { op: Eq, payload }
    }

    pub fn update_voice_state(payload: UpdateVoiceStatePayload) -> Command {
        Command::UpdateVoiceState { op: Eq, payload }
    }

    pub fn resume(payload: ResumePayload) -> Command {
        Command::Resume { op: Eq, payload }
    }

    pub fn request_guild_members(payload: RequestGuildMembersPayload) -> Command {
        Command::RequestGuildMembers { op: Eq, payload }
    }
}

/// The payload sent along with the `Identify` command (opcode 2).
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyPayload {
    /// Authentication token.
    pub token: String,
    /// Gateway intents to receive.
    pub intents: Intents,
    /// Whether this connection supports compression of frames.
    pub compress: bool,
    /// Member count past which a guild is sent with offline members elided.
    pub large_threshold: u64,
    /// `(shard_id, num_shards)` pair, for guild sharding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u32; 2]>,

    /// System fingerprinting information.
    pub properties: ConnectionProperties,
}

/// A connection fingerprint of sorts, describing the client's environment.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionProperties {
    #[serde(rename = "$os")]
    pub os: String,
    #[serde(rename = "$browser")]
    pub browser: String,
    #[serde(rename = "$device")]
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        ConnectionProperties {
            os: ::std::env::consts::OS.to_owned(),
            browser: "discord-realtime".to_owned(),
            device: "discord-realtime".to_owned(),
        }
    }
}

/// The payload sent along with the `Resume` command (opcode 6).
#[derive(Debug, Clone, Serialize)]
pub struct ResumePayload {
    pub token: String,
    pub session_id: String,
    #[serde(rename = "seq")]
    pub sequence: u64,
}

/// The payload sent along with the `RequestGuildMembers` command (opcode 8).
#[derive(Debug, Clone, Serialize)]
pub struct RequestGuildMembersPayload {
    pub guild_id: GuildId,
    /// Username prefix to match, or empty to return all members.
    pub query: String,
    /// Maximum members to return; 0 with an empty query returns everyone.
    pub limit: u32,
}

/// The payload sent along with the `UpdateVoiceState` command (opcode 4).
#[derive(Debug, Clone, Serialize)]
pub struct UpdateVoiceStatePayload {
    pub guild_id: GuildId,
    /// The voice channel to join, or `None` to disconnect.
    pub channel_id: Option<ChannelId>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// The payload sent along with the `UpdatePresence` command (opcode 3).
#[derive(Debug, Clone, Serialize)]
pub struct UpdatePresencePayload {
    pub activities: Vec<Activity>,
    pub status: OnlineStatus,
    /// Unix time (ms) of when the client went idle, if it is.
    pub since: Option<u64>,
    pub afk: bool,
}

// Voice

/// A payload received over a voice gateway connection.
#[cfg(feature = "voice")]
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum VoicePayload {
    /// The voice handshake succeeded (opcode 2).
    Ready {
        #[doc(hidden)]
        op: Eq<2>,

        #[serde(rename = "d")]
        payload: VoiceReadyPayload,
    },

    /// Carries the media secret key (opcode 4).
    SessionDescription {
        #[doc(hidden)]
        op: Eq<4>,

        #[serde(rename = "d")]
        payload: SessionDescriptionPayload,
    },

    /// A user's speaking state changed (opcode 5).
    Speaking {
        #[doc(hidden)]
        op: Eq<5>,

        #[serde(rename = "d")]
        payload: SpeakingPayload,
    },

    /// Acknowledges a voice heartbeat (opcode 6).
    HeartbeatAck {
        #[doc(hidden)]
        op: Eq<6>,

        #[serde(rename = "d", default)]
        nonce: Value,
    },

    /// The first message on a voice connection (opcode 8).
    Hello {
        #[doc(hidden)]
        op: Eq<8>,

        #[serde(rename = "d")]
        payload: VoiceHelloPayload,
    },

    /// A voice resume succeeded (opcode 9).
    Resumed {
        #[doc(hidden)]
        op: Eq<9>,

        #[serde(rename = "d", default)]
        _ignored: Value,
    },

    /// A user disconnected from voice (opcode 13).
    ClientDisconnect {
        #[doc(hidden)]
        op: Eq<13>,

        #[serde(rename = "d")]
        payload: ClientDisconnectPayload,
    },

    /// Any other voice opcode.
    Unknown(Value),
}

#[cfg(feature = "voice")]
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceReadyPayload {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    /// Encryption modes offered by the server.
    pub modes: Vec<String>,
}

#[cfg(feature = "voice")]
#[derive(Debug, Clone, Deserialize)]
pub struct SessionDescriptionPayload {
    pub mode: String,
    /// The 32-byte media secret.
    pub secret_key: Vec<u8>,
}

#[cfg(feature = "voice")]
#[derive(Debug, Clone, Deserialize)]
pub struct SpeakingPayload {
    #[serde(default)]
    pub user_id: Option<UserId>,
    pub ssrc: u32,
    /// Speaking flag bits; 0 means silent.
    pub speaking: u64,
}

#[cfg(feature = "voice")]
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceHelloPayload {
    /// Interval (in milliseconds) to heartbeat with. Fractional values have
    /// been observed on some voice servers.
    pub heartbeat_interval: f64,
}

#[cfg(feature = "voice")]
#[derive(Debug, Clone, Deserialize)]
pub struct ClientDisconnectPayload {
    pub user_id: UserId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_hello() {
        let frame = json!({"op": 10, "d": {"heartbeat_interval": 41250}}).to_string();
        match JsonDecoder.decode(frame.as_bytes()).unwrap() {
            GatewayPayload::Hello { payload, .. } => {
                assert_eq!(payload.heartbeat_interval, 41250)
            }
            other => panic!("expected hello, got {:?}", other),
        }
    }

    #[test]
    fn decode_invalid_session() {
        let frame = json!({"op": 9, "d": true}).to_string();
        match JsonDecoder.decode(frame.as_bytes()).unwrap() {
            GatewayPayload::InvalidSession { resumable, .. } => assert!(resumable),
            other => panic!("expected invalid session, got {:?}", other),
        }
    }

    #[test]
    fn decode_message_create_dispatch() {
        let frame = json!({
            "op": 0,
            "s": 42,
            "t": "MESSAGE_CREATE",
            "d": {
                "id": "3",
                "channel_id": "7",
                "guild_id": "11",
                "author": {"id": "5", "username": "hime"},
                "content": "hime arikawa",
                "timestamp": "2020-01-01T00:00:00+00:00"
            }
        })
        .to_string();

        match JsonDecoder.decode(frame.as_bytes()).unwrap() {
            GatewayPayload::Dispatch { dispatch, .. } => {
                assert_eq!(dispatch.sequence, 42);
                match dispatch.event {
                    Event::MessageCreate(msg) => {
                        assert_eq!(msg.content, "hime arikawa");
                        assert_eq!(msg.channel_id, ChannelId(7));
                        assert_eq!(msg.guild_id, Some(GuildId(11)));
                    }
                    other => panic!("expected message create, got {:?}", other),
                }
            }
            other => panic!("expected dispatch, got {:?}", other),
        }
    }

    #[test]
    fn decode_unknown_event_type() {
        let frame = json!({
            "op": 0, "s": 1, "t": "SOME_FUTURE_EVENT", "d": {"x": 1}
        })
        .to_string();
        match JsonDecoder.decode(frame.as_bytes()).unwrap() {
            GatewayPayload::Dispatch { dispatch, .. } => {
                assert_eq!(dispatch.event.kind(), EventType::Unknown)
            }
            other => panic!("expected dispatch, got {:?}", other),
        }
    }

    #[test]
    fn identify_serializes_with_opcode() {
        let cmd = Command::identify(IdentifyPayload {
            token: "t".into(),
            intents: Intents::GUILDS,
            compress: true,
            large_threshold: 250,
            shard: None,
            properties: ConnectionProperties::default(),
        });
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(value["op"], 2);
        assert_eq!(value["d"]["intents"], 1);
        assert!(value["d"].get("shard").is_none());
    }

    #[cfg(feature = "voice")]
    #[test]
    fn decode_voice_session_description() {
        let frame = json!({
            "op": 4,
            "d": {"mode": "xsalsa20_poly1305", "secret_key": ([1u8; 32]).to_vec()}
        })
        .to_string();
        match serde_json::from_str::<VoicePayload>(&frame).unwrap() {
            VoicePayload::SessionDescription { payload, .. } => {
                assert_eq!(payload.secret_key.len(), 32);
                assert_eq!(payload.mode, "xsalsa20_poly1305");
            }
            other => panic!("expected session description, got {:?}", other),
        }
    }
}
