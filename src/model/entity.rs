//! Domain entities maintained by the gateway and the state cache.

use bitflags::bitflags;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_repr::{Deserialize_repr, Serialize_repr};
use tracing::warn;

use super::{ChannelId, EmojiId, GuildId, MessageId, RoleId, UserId};

// Users

/// Public user information, accessible without any shared guild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// The user's ID
    pub id: UserId,

    /// The user's username, not unique across the platform.
    #[serde(rename = "username")]
    pub name: String,

    /// The user's avatar hash
    #[serde(default)]
    pub avatar: Option<String>,

    /// Whether the user belongs to an OAuth2 application
    #[serde(default)]
    pub bot: bool,
}

/// Information about the logged-in user.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CurrentUser {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub bot: bool,
}

/// A partial update to the logged-in user, from a `UserUpdate` event.
///
/// Only the non-null fields are to be applied.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CurrentUserPatch {
    pub id: Option<UserId>,
    pub username: Option<String>,
    pub avatar: Option<String>,
    pub email: Option<String>,
    pub verified: Option<bool>,
    pub bot: Option<bool>,
}

impl CurrentUser {
    pub fn update_from(&mut self, patch: &CurrentUserPatch) {
        update_field(&mut self.id, &patch.id);
        update_field(&mut self.username, &patch.username);
        update_field_opt(&mut self.avatar, &patch.avatar);
        update_field_opt(&mut self.email, &patch.email);
        update_field(&mut self.verified, &patch.verified);
        update_field(&mut self.bot, &patch.bot);
    }
}

fn update_field<T: Clone>(item: &mut T, patch: &Option<T>) {
    if let Some(value) = patch.clone() {
        *item = value;
    }
}

fn update_field_opt<T: Clone>(item: &mut Option<T>, patch: &Option<T>) {
    if let Some(value) = patch.clone() {
        *item = Some(value);
    }
}

// Guilds

/// A guild ("server") the current user is a member of.
///
/// The guild's role set and emoji list live inside the guild rather than in
/// standalone maps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guild {
    /// The ID of the guild.
    pub id: GuildId,
    /// The name of the guild (2-100 characters).
    pub name: String,
    /// The guild's icon hash.
    #[serde(default)]
    pub icon: Option<String>,
    /// The user who owns the guild.
    pub owner_id: UserId,

    /// All roles defined on this guild, including `@everyone`.
    #[serde(default)]
    pub roles: Vec<Role>,
    /// The custom emoji uploaded to this guild.
    #[serde(default)]
    pub emojis: Vec<Emoji>,

    /// Enabled guild feature strings.
    #[serde(default)]
    pub features: Vec<String>,
}

impl Guild {
    /// Calculate the effective permissions for a member in a channel of this
    /// guild.
    pub fn permissions_for(&self, channel: &Channel, member: &Member) -> Permissions {
        // Owner has all permissions
        if member.user.id == self.owner_id {
            return Permissions::all();
        }

        let everyone = match self.roles.iter().find(|r| r.id == self.id.everyone()) {
            Some(r) => r,
            None => {
                warn!(guild = %self.id, "missing @everyone role in permissions lookup");
                return Permissions::empty();
            }
        };

        // OR together all the member's roles
        let mut perms = everyone.permissions;
        for &role in &member.roles {
            if let Some(role) = self.roles.iter().find(|r| r.id == role) {
                perms |= role.permissions;
            }
        }

        // Administrators have all permissions in any channel
        if perms.contains(Permissions::ADMINISTRATOR) {
            return Permissions::all();
        }

        // Role overwrites, denied then allowed, then member overwrites
        for overwrite in &channel.permission_overwrites {
            if overwrite.kind == OverwriteType::Role
                && (member.roles.contains(&RoleId(overwrite.id))
                    || overwrite.id == self.id.0)
            {
                perms = (perms & !overwrite.deny) | overwrite.allow;
            }
        }
        for overwrite in &channel.permission_overwrites {
            if overwrite.kind == OverwriteType::Member && overwrite.id == member.user.id.0 {
                perms = (perms & !overwrite.deny) | overwrite.allow;
            }
        }

        if !perms.contains(Permissions::VIEW_CHANNEL) {
            perms &= Permissions::KICK_MEMBERS
                | Permissions::BAN_MEMBERS
                | Permissions::ADMINISTRATOR
                | Permissions::MANAGE_GUILD
                | Permissions::CHANGE_NICKNAME
                | Permissions::MANAGE_NICKNAMES;
        }

        if channel.kind == ChannelType::Text {
            perms &= !(Permissions::CONNECT
                | Permissions::SPEAK
                | Permissions::MUTE_MEMBERS
                | Permissions::DEAFEN_MEMBERS
                | Permissions::MOVE_MEMBERS);
        }
        perms
    }
}

/// A guild reference which may be offline.
///
/// The initial snapshot in `Ready` announces most guilds this way; a later
/// `GuildCreate` delivers the full guild.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PossibleGuild {
    /// A full guild payload.
    Online(GuildCreate),
    /// A guild known only by ID.
    Offline {
        id: GuildId,
        #[serde(default)]
        unavailable: bool,
    },
}

impl PossibleGuild {
    pub fn id(&self) -> GuildId {
        match *self {
            PossibleGuild::Offline { id, .. } => id,
            PossibleGuild::Online(ref g) => g.guild.id,
        }
    }
}

/// The payload of a `GuildCreate` event: the guild itself plus the live
/// pieces only delivered over the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuildCreate {
    #[serde(flatten)]
    pub guild: Guild,

    #[serde(default)]
    pub joined_at: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub large: bool,
    #[serde(default)]
    pub unavailable: bool,
    #[serde(default)]
    pub member_count: u64,

    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub presences: Vec<Presence>,
    #[serde(default)]
    pub voice_states: Vec<VoiceState>,
}

// Roles

/// A set of permissions and display settings granted to guild members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    /// Color in `0xRRGGBB` form.
    #[serde(default)]
    pub color: u32,
    /// Whether the role is displayed separately in the member list.
    #[serde(default)]
    pub hoist: bool,
    #[serde(default)]
    pub position: i64,
    pub permissions: Permissions,
    #[serde(default)]
    pub managed: bool,
    #[serde(default)]
    pub mentionable: bool,
}

bitflags! {
    /// Permission bits checked against role and overwrite sets.
    ///
    /// See https://discord.com/developers/docs/topics/permissions
    #[derive(Serialize, Deserialize, Default)]
    #[serde(transparent)]
    pub struct Permissions: u64 {
        const CREATE_INSTANT_INVITE = 1 << 0;
        const KICK_MEMBERS = 1 << 1;
        const BAN_MEMBERS = 1 << 2;
        const ADMINISTRATOR = 1 << 3;
        const MANAGE_CHANNELS = 1 << 4;
        const MANAGE_GUILD = 1 << 5;
        const ADD_REACTIONS = 1 << 6;
        const VIEW_CHANNEL = 1 << 10;
        const SEND_MESSAGES = 1 << 11;
        const SEND_TTS_MESSAGES = 1 << 12;
        const MANAGE_MESSAGES = 1 << 13;
        const EMBED_LINKS = 1 << 14;
        const ATTACH_FILES = 1 << 15;
        const READ_MESSAGE_HISTORY = 1 << 16;
        const MENTION_EVERYONE = 1 << 17;
        const CONNECT = 1 << 20;
        const SPEAK = 1 << 21;
        const MUTE_MEMBERS = 1 << 22;
        const DEAFEN_MEMBERS = 1 << 23;
        const MOVE_MEMBERS = 1 << 24;
        const CHANGE_NICKNAME = 1 << 26;
        const MANAGE_NICKNAMES = 1 << 27;
        const MANAGE_ROLES = 1 << 28;
        const MANAGE_EMOJIS = 1 << 30;
    }
}

// Emoji

/// A custom emoji uploaded to a guild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Emoji {
    pub id: EmojiId,
    pub name: String,
    #[serde(default)]
    pub roles: Vec<RoleId>,
    #[serde(default)]
    pub managed: bool,
    #[serde(default)]
    pub animated: bool,
}

// Channels

/// A text, voice, or DM channel.
///
/// Every channel either carries a valid guild ID or is a direct channel.
/// Channels are equal iff their channel ID matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    #[serde(rename = "type")]
    pub kind: ChannelType,

    #[serde(default)]
    pub guild_id: Option<GuildId>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub position: Option<i64>,
    #[serde(default)]
    pub parent_id: Option<ChannelId>,
    #[serde(default)]
    pub last_message_id: Option<MessageId>,

    /// The other parties of a direct or group channel.
    #[serde(default)]
    pub recipients: Vec<User>,

    #[serde(default)]
    pub permission_overwrites: Vec<PermissionOverwrite>,
}

impl PartialEq for Channel {
    fn eq(&self, other: &Channel) -> bool {
        self.id == other.id
    }
}

impl Eq for Channel {}

impl Channel {
    /// Whether this is a direct or group channel rather than a guild channel.
    pub fn is_private(&self) -> bool {
        matches!(self.kind, ChannelType::Direct | ChannelType::Group)
    }
}

/// The variety of a channel.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ChannelType {
    /// A text channel in a guild
    Text = 0,
    /// A direct message channel between two users
    Direct = 1,
    /// A voice channel in a guild
    Voice = 2,
    /// A group direct message channel
    Group = 3,
    /// An organizational category containing other channels
    Category = 4,
    /// A feed channel guild users can follow
    News = 5,
}

/// A permission overwrite attached to a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionOverwrite {
    /// Role or user ID, depending on `kind`.
    #[serde(deserialize_with = "crate::serial::deserialize_id")]
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: OverwriteType,
    pub allow: Permissions,
    pub deny: Permissions,
}

/// What kind of subject a [`PermissionOverwrite`] applies to.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum OverwriteType {
    Role = 0,
    Member = 1,
}

// Members

/// Information about a member of a guild.
///
/// Members are uniquely identified by their (guild, user) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub user: User,

    /// The user's guild nickname.
    #[serde(default)]
    pub nick: Option<String>,
    /// The roles granted to the user.
    #[serde(default)]
    pub roles: Vec<RoleId>,
    /// When the user joined this guild.
    #[serde(default)]
    pub joined_at: Option<DateTime<FixedOffset>>,

    /// If the user has been muted by an administrator.
    #[serde(default)]
    pub mute: bool,
    /// If the user has been deafened by an administrator.
    #[serde(default)]
    pub deaf: bool,
}

impl Member {
    /// This member's nickname if present, their username otherwise.
    pub fn display_name(&self) -> &str {
        self.nick.as_deref().unwrap_or(&self.user.name)
    }
}

// Messages

/// Message transmitted over a text channel.
///
/// Messages are uniquely identified by their (channel, message) pair. The
/// `guild_id` is only present where derivable: gateway events carry it, and
/// cache getters back-fill it on messages fetched from the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,

    pub author: User,
    pub content: String,
    pub timestamp: DateTime<FixedOffset>,
    #[serde(default)]
    pub edited_timestamp: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub tts: bool,
    #[serde(default)]
    pub pinned: bool,
    /// Raw message type discriminant.
    #[serde(rename = "type", default)]
    pub kind: u8,

    #[serde(default)]
    pub mention_everyone: bool,
    #[serde(default)]
    pub mentions: Vec<User>,
    #[serde(default)]
    pub mention_roles: Vec<RoleId>,

    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Follows the OEmbed standard.
    #[serde(default)]
    pub embeds: Vec<Value>,

    /// Reaction summaries, absent when the message has none.
    #[serde(default)]
    pub reactions: Option<Vec<MessageReaction>>,
}

/// File upload attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    pub url: String,
    pub proxy_url: String,
    pub size: u64,
    #[serde(default)]
    pub width: Option<u64>,
    #[serde(default)]
    pub height: Option<u64>,
}

/// Information on a reaction as available at a glance on a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageReaction {
    /// The amount of people that have reacted with this emoji.
    pub count: u64,
    /// If the current user has placed this reaction.
    pub me: bool,
    /// The emoji used to react.
    #[serde(with = "crate::serial::reaction_emoji")]
    pub emoji: ReactionEmoji,
}

/// Emoji information as sent with reaction events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionEmoji {
    /// A user reacted with a custom emoji.
    Custom {
        name: String,
        id: EmojiId,
        animated: bool,
    },
    /// A user reacted with a stock unicode emoji.
    Unicode { name: String },
}

// Presences

/// A guild member's online status and activities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Presence {
    pub user: PartialUser,
    pub status: OnlineStatus,
    #[serde(default)]
    pub activities: Vec<Activity>,
}

impl Presence {
    pub fn user_id(&self) -> UserId {
        self.user.id
    }
}

/// The always-present sliver of a user object carried by presence events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialUser {
    pub id: UserId,
}

/// A user's online presence status.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnlineStatus {
    #[serde(rename = "dnd")]
    DoNotDisturb,
    Invisible,
    Offline,
    Online,
    Idle,
}

/// Something a user is currently doing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ActivityType,
    #[serde(default)]
    pub url: Option<String>,
}

/// A type of activity in a presence.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ActivityType {
    Playing = 0,
    Streaming = 1,
    Listening = 2,
    Watching = 3,
    Custom = 4,
    Competing = 5,
}

// Voice states

/// A member's state within a voice channel.
///
/// Stored per (guild, user); a state whose `channel_id` is absent means the
/// user has left voice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceState {
    pub user_id: UserId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    #[serde(default)]
    pub channel_id: Option<ChannelId>,

    /// The voice session ID, needed to identify against a voice server.
    pub session_id: String,

    /// If the user has muted themselves locally.
    #[serde(rename = "self_mute", default)]
    pub mute: bool,
    /// If the user has deafened themselves locally.
    #[serde(rename = "self_deaf", default)]
    pub deaf: bool,
    /// If the user has been muted by an administrator.
    #[serde(rename = "mute", default)]
    pub guild_mute: bool,
    /// If the user has been deafened by an administrator.
    #[serde(rename = "deaf", default)]
    pub guild_deaf: bool,
    /// Whether this user's permission to speak has been suppressed.
    #[serde(default)]
    pub suppress: bool,
}

// Intents

bitflags! {
    /// Event families requested at identify time.
    ///
    /// Intents scope which events the gateway sends and thereby which entity
    /// kinds the state cache is authoritative for.
    #[derive(Serialize, Deserialize, Default)]
    #[serde(transparent)]
    pub struct Intents: u64 {
        const GUILDS = 1 << 0;
        const GUILD_MEMBERS = 1 << 1;
        const GUILD_BANS = 1 << 2;
        const GUILD_EMOJIS = 1 << 3;
        const GUILD_INTEGRATIONS = 1 << 4;
        const GUILD_WEBHOOKS = 1 << 5;
        const GUILD_INVITES = 1 << 6;
        const GUILD_VOICE_STATES = 1 << 7;
        const GUILD_PRESENCES = 1 << 8;
        const GUILD_MESSAGES = 1 << 9;
        const GUILD_MESSAGE_REACTIONS = 1 << 10;
        const GUILD_MESSAGE_TYPING = 1 << 11;
        const DIRECT_MESSAGES = 1 << 12;
        const DIRECT_MESSAGE_REACTIONS = 1 << 13;
        const DIRECT_MESSAGE_TYPING = 1 << 14;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_equal_by_id() {
        let mk = |id, name: &str| Channel {
            id: ChannelId(id),
            kind: ChannelType::Text,
            guild_id: Some(GuildId(1)),
            name: Some(name.to_owned()),
            topic: None,
            position: None,
            parent_id: None,
            last_message_id: None,
            recipients: vec![],
            permission_overwrites: vec![],
        };
        assert_eq!(mk(10, "a"), mk(10, "b"));
        assert_ne!(mk(10, "a"), mk(11, "a"));
    }

    #[test]
    fn reaction_emoji_serde() {
        let r: MessageReaction =
            serde_json::from_value(serde_json::json!({
                "count": 2, "me": false, "emoji": {"name": "🦊", "id": null}
            }))
            .unwrap();
        assert_eq!(
            r.emoji,
            ReactionEmoji::Unicode { name: "🦊".into() }
        );

        let r: MessageReaction = serde_json::from_value(serde_json::json!({
            "count": 1, "me": true, "emoji": {"name": "blob", "id": "9"}
        }))
        .unwrap();
        assert_eq!(
            r.emoji,
            ReactionEmoji::Custom { name: "blob".into(), id: EmojiId(9), animated: false }
        );
    }

    #[test]
    fn current_user_patch_applies_non_null_fields() {
        let mut me = CurrentUser {
            id: UserId(1),
            username: "old".into(),
            avatar: None,
            email: None,
            verified: false,
            bot: true,
        };
        me.update_from(&CurrentUserPatch {
            id: None,
            username: Some("new".into()),
            avatar: Some("hash".into()),
            email: None,
            verified: None,
            bot: None,
        });
        assert_eq!(me.username, "new");
        assert_eq!(me.avatar.as_deref(), Some("hash"));
        assert_eq!(me.id, UserId(1));
        assert!(me.bot);
    }

    #[test]
    fn owner_has_all_permissions() {
        let guild = Guild {
            id: GuildId(1),
            name: "g".into(),
            icon: None,
            owner_id: UserId(5),
            roles: vec![],
            emojis: vec![],
            features: vec![],
        };
        let channel = Channel {
            id: ChannelId(2),
            kind: ChannelType::Text,
            guild_id: Some(GuildId(1)),
            name: None,
            topic: None,
            position: None,
            parent_id: None,
            last_message_id: None,
            recipients: vec![],
            permission_overwrites: vec![],
        };
        let member = Member {
            user: User {
                id: UserId(5),
                name: "owner".into(),
                avatar: None,
                bot: false,
            },
            nick: None,
            roles: vec![],
            joined_at: None,
            mute: false,
            deaf: false,
        };
        assert_eq!(guild.permissions_for(&channel, &member), Permissions::all());
    }
}
