//! The state cache ("cabinet"): a local, consistent view of guilds,
//! channels, members, and messages, fed by gateway events and backed by the
//! REST API for misses.
//!
//! Every getter follows the same contract: consult the cache when the held
//! intents make it authoritative for that entity kind, otherwise fetch from
//! the [`ApiClient`] and populate the cache when the kind is cacheable.

mod hook;
mod store;

pub use store::{
    MemoryMessages, MemoryStore, MessageStore, NoopStore, Store, DEFAULT_MESSAGE_CAP,
};

use std::sync::{Arc, RwLock};

use crate::api::ApiClient;
use crate::model::{
    Channel, ChannelId, CurrentUser, Emoji, Event, Guild, GuildId, Intents, Member, Message,
    MessageId, Permissions, Presence, Role, RoleId, UserId, VoiceState,
};
use crate::{Error, Result};

/// Cache lifecycle of a guild.
///
/// A guild is *unready* when announced in the initial snapshot but not yet
/// delivered, *unavailable* when the server marked it down, and *present*
/// once fully known. Absence from the store means unknown.
#[derive(Debug, Clone)]
pub enum GuildSlot {
    Unready,
    Unavailable,
    Present(Guild),
}

/// Applies gateway events to a state container before dispatch.
///
/// Returns derived events to deliver (via direct dispatch) after the
/// originating event.
pub trait StateHook: Send + Sync {
    fn apply(&self, event: &Event) -> Vec<Event>;
}

/// The state cache: a family of per-kind substores plus the API fallback.
///
/// Substores are public and individually swappable; replace one before the
/// cabinet starts receiving events.
pub struct Cabinet {
    api: Arc<dyn ApiClient>,
    intents: Intents,

    pub me: Box<dyn Store<(), CurrentUser>>,
    pub guilds: Box<dyn Store<GuildId, GuildSlot>>,
    pub channels: Box<dyn Store<ChannelId, Channel>>,
    pub private_channels: Box<dyn Store<ChannelId, Channel>>,
    pub emojis: Box<dyn Store<GuildId, Vec<Emoji>>>,
    pub members: Box<dyn Store<(GuildId, UserId), Member>>,
    pub presences: Box<dyn Store<(GuildId, UserId), Presence>>,
    pub voice_states: Box<dyn Store<(GuildId, UserId), VoiceState>>,
    pub messages: Box<dyn MessageStore>,
    pub notes: Box<dyn Store<UserId, String>>,
    pub settings: Box<dyn Store<(), serde_json::Value>>,

    shard: RwLock<Option<[u32; 2]>>,
}

impl Cabinet {
    /// A cabinet with in-memory stores for every kind.
    pub fn new(api: Arc<dyn ApiClient>, intents: Intents) -> Cabinet {
        Cabinet {
            api,
            intents,
            me: Box::new(MemoryStore::default()),
            guilds: Box::new(MemoryStore::default()),
            channels: Box::new(MemoryStore::default()),
            private_channels: Box::new(MemoryStore::default()),
            emojis: Box::new(MemoryStore::default()),
            members: Box::new(MemoryStore::default()),
            presences: Box::new(MemoryStore::default()),
            voice_states: Box::new(MemoryStore::default()),
            messages: Box::new(MemoryMessages::default()),
            notes: Box::new(MemoryStore::default()),
            settings: Box::new(MemoryStore::default()),
            shard: RwLock::new(None),
        }
    }

    /// A cabinet that caches nothing, making every getter a pure API call.
    pub fn noop(api: Arc<dyn ApiClient>, intents: Intents) -> Cabinet {
        Cabinet {
            api,
            intents,
            me: Box::new(NoopStore),
            guilds: Box::new(NoopStore),
            channels: Box::new(NoopStore),
            private_channels: Box::new(NoopStore),
            emojis: Box::new(NoopStore),
            members: Box::new(NoopStore),
            presences: Box::new(NoopStore),
            voice_states: Box::new(NoopStore),
            messages: Box::new(NoopStore),
            notes: Box::new(NoopStore),
            settings: Box::new(NoopStore),
            shard: RwLock::new(None),
        }
    }

    /// The intents this cabinet keys cache authoritativeness off.
    pub fn intents(&self) -> Intents {
        self.intents
    }

    /// Shard info recorded from the `Ready` event, if any.
    pub fn shard(&self) -> Option<[u32; 2]> {
        *self.shard.read().expect("cabinet lock poisoned")
    }

    pub(crate) fn set_shard(&self, shard: Option<[u32; 2]>) {
        *self.shard.write().expect("cabinet lock poisoned") = shard;
    }

    fn authoritative(&self, intent: Intents) -> bool {
        self.intents.contains(intent)
    }

    /// The intent gating message caching for a channel.
    fn message_intent(&self, channel: ChannelId) -> Intents {
        if self.private_channels.get(&channel).is_some() {
            Intents::DIRECT_MESSAGES
        } else {
            Intents::GUILD_MESSAGES
        }
    }

    // Getters

    /// The logged-in user.
    pub async fn current_user(&self) -> Result<CurrentUser> {
        if let Some(me) = self.me.get(&()) {
            return Ok(me);
        }
        let me = self.api.current_user().await?;
        self.me.insert((), me.clone());
        Ok(me)
    }

    /// A guild by ID.
    pub async fn guild(&self, id: GuildId) -> Result<Guild> {
        if self.authoritative(Intents::GUILDS) {
            if let Some(GuildSlot::Present(guild)) = self.guilds.get(&id) {
                return Ok(guild);
            }
        }
        let guild = self.api.guild(id).await?;
        if self.authoritative(Intents::GUILDS) {
            self.guilds.insert(id, GuildSlot::Present(guild.clone()));
        }
        Ok(guild)
    }

    /// A channel by ID, covering both guild channels and DMs.
    pub async fn channel(&self, id: ChannelId) -> Result<Channel> {
        if self.authoritative(Intents::GUILDS) {
            if let Some(channel) = self.channels.get(&id) {
                return Ok(channel);
            }
        }
        let channel = self.api.channel(id).await?;
        if self.authoritative(Intents::GUILDS) {
            self.channels.insert(id, channel.clone());
            if channel.is_private() {
                self.private_channels.insert(id, channel.clone());
            }
        }
        Ok(channel)
    }

    /// A guild member by (guild, user).
    pub async fn member(&self, guild: GuildId, user: UserId) -> Result<Member> {
        if self.authoritative(Intents::GUILD_MEMBERS) {
            if let Some(member) = self.members.get(&(guild, user)) {
                return Ok(member);
            }
        }
        let member = self.api.member(guild, user).await?;
        if self.authoritative(Intents::GUILD_MEMBERS) {
            self.members.insert((guild, user), member.clone());
        }
        Ok(member)
    }

    /// A role of a guild. Roles live inside their guild.
    pub async fn role(&self, guild: GuildId, role: RoleId) -> Result<Role> {
        let guild = self.guild(guild).await?;
        guild
            .roles
            .into_iter()
            .find(|r| r.id == role)
            .ok_or(Error::NotFound("role"))
    }

    /// The custom emoji of a guild.
    pub async fn emojis(&self, guild: GuildId) -> Result<Vec<Emoji>> {
        if self.authoritative(Intents::GUILD_EMOJIS) {
            if let Some(emojis) = self.emojis.get(&guild) {
                return Ok(emojis);
            }
        }
        let emojis = self.api.emojis(guild).await?;
        if self.authoritative(Intents::GUILD_EMOJIS) {
            self.emojis.insert(guild, emojis.clone());
        }
        Ok(emojis)
    }

    /// A member's presence. Presences are never fetched from the API;
    /// absence yields [`Error::NotFound`].
    pub async fn presence(&self, guild: GuildId, user: UserId) -> Result<Presence> {
        self.presences
            .get(&(guild, user))
            .ok_or(Error::NotFound("presence"))
    }

    /// A member's voice state. There is no API fallback for voice states.
    pub async fn voice_state(&self, guild: GuildId, user: UserId) -> Result<VoiceState> {
        self.voice_states
            .get(&(guild, user))
            .ok_or(Error::NotFound("voice state"))
    }

    /// A single message by (channel, message).
    pub async fn message(&self, channel: ChannelId, id: MessageId) -> Result<Message> {
        if self.authoritative(self.message_intent(channel)) {
            if let Some(message) = self
                .messages
                .messages(channel)
                .into_iter()
                .find(|m| m.id == id)
            {
                return Ok(message);
            }
        }
        let mut message = self.api.message(channel, id).await?;
        if message.guild_id.is_none() {
            message.guild_id = self.guild_id_of_channel(channel);
        }
        Ok(message)
    }

    /// The latest messages of a channel, newest first.
    ///
    /// A channel previously observed to contain its whole (short) history is
    /// served from cache alone; otherwise the cache is completed by
    /// paginating the API up to the store's cap. API messages get their
    /// guild ID back-filled from a cached sibling or the cached channel.
    pub async fn recent_messages(
        &self,
        channel: ChannelId,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let cap = self.messages.cap();
        let authoritative = cap > 0 && self.authoritative(self.message_intent(channel));
        let want = match (limit, cap) {
            (0, 0) => return self.api.messages(channel, 0, None).await,
            (0, cap) => cap,
            (limit, 0) => limit,
            (limit, cap) => limit.min(cap),
        };

        let mut cached = if authoritative {
            self.messages.messages(channel)
        } else {
            Vec::new()
        };

        if authoritative && self.messages.is_few(channel) {
            cached.truncate(want);
            return Ok(cached);
        }
        if cached.len() >= want {
            cached.truncate(want);
            return Ok(cached);
        }

        let mut fetched: Vec<Message> = Vec::new();
        let mut before = cached.last().map(|m| m.id);
        let mut exhausted = false;
        while cached.len() + fetched.len() < want {
            let need = want - cached.len() - fetched.len();
            let batch = self.api.messages(channel, need, before).await?;
            let got = batch.len();
            for mut message in batch {
                if message.guild_id.is_none() {
                    message.guild_id = self
                        .sibling_guild_id(&cached, &fetched)
                        .or_else(|| self.guild_id_of_channel(channel));
                }
                before = Some(message.id);
                fetched.push(message);
            }
            if got < need {
                exhausted = true;
                break;
            }
        }

        if authoritative {
            self.messages.extend_older(channel, fetched.clone());
            if exhausted {
                self.messages.mark_few(channel);
            }
        }

        cached.extend(fetched);
        cached.truncate(want);
        Ok(cached)
    }

    /// Effective permissions of a member in a channel. The guild, channel,
    /// and member lookups run concurrently.
    pub async fn permissions(
        &self,
        guild: GuildId,
        channel: ChannelId,
        user: UserId,
    ) -> Result<Permissions> {
        let (guild, channel, member) = tokio::try_join!(
            self.guild(guild),
            self.channel(channel),
            self.member(guild, user),
        )?;
        Ok(guild.permissions_for(&channel, &member))
    }

    fn sibling_guild_id(&self, cached: &[Message], fetched: &[Message]) -> Option<GuildId> {
        cached
            .iter()
            .chain(fetched.iter())
            .find_map(|m| m.guild_id)
    }

    fn guild_id_of_channel(&self, channel: ChannelId) -> Option<GuildId> {
        self.channels.get(&channel).and_then(|ch| ch.guild_id)
    }
}

impl StateHook for Cabinet {
    fn apply(&self, event: &Event) -> Vec<Event> {
        self.apply_event(event)
    }
}
