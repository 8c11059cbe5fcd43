//! Event-driven cache mutation.
//!
//! The cabinet consumes every gateway event synchronously before the
//! dispatcher fans it out, so user handlers always observe the cache already
//! updated. A handful of events additionally resolve to derived events
//! (guild ready/available/join/unavailable/leave) which the session delivers
//! directly after the originating event.

use tracing::debug;

use crate::model::{
    Event, GuildCreate, GuildId, MessageReaction, PossibleGuild, ReactionEmoji, UserId,
};

use super::{Cabinet, GuildSlot};

impl Cabinet {
    pub(crate) fn apply_event(&self, event: &Event) -> Vec<Event> {
        let mut derived = Vec::new();
        match event {
            Event::Ready(ready) => {
                self.me.insert((), ready.user.clone());
                self.set_shard(ready.shard);
                for channel in &ready.private_channels {
                    self.channels.insert(channel.id, channel.clone());
                    self.private_channels.insert(channel.id, channel.clone());
                }
                for presence in &ready.presences {
                    self.presences
                        .insert((GuildId(0), presence.user_id()), presence.clone());
                }
                for guild in &ready.guilds {
                    match guild {
                        PossibleGuild::Online(create) => self.install_guild(create),
                        PossibleGuild::Offline { id, .. } => {
                            self.guilds.insert(*id, GuildSlot::Unready)
                        }
                    }
                }
            }
            Event::Resumed(_) => {}

            Event::GuildCreate(PossibleGuild::Online(create)) => {
                let id = create.guild.id;
                let prior = self.guilds.get(&id);
                self.install_guild(create);
                derived.push(match prior {
                    Some(GuildSlot::Unready) => Event::GuildReady(create.clone()),
                    Some(GuildSlot::Unavailable) => Event::GuildAvailable(create.clone()),
                    _ => Event::GuildJoin(create.clone()),
                });
            }
            Event::GuildCreate(PossibleGuild::Offline { id, .. }) => {
                self.guilds.insert(*id, GuildSlot::Unavailable);
            }
            Event::GuildUpdate(guild) => {
                let mut incoming = guild.clone();
                self.guilds.update(&guild.id, &mut |slot| {
                    if let GuildSlot::Present(old) = slot {
                        // Partial payloads must not wipe what we know.
                        if incoming.roles.is_empty() {
                            incoming.roles = old.roles.clone();
                        }
                        if incoming.emojis.is_empty() {
                            incoming.emojis = old.emojis.clone();
                        }
                    }
                    *slot = GuildSlot::Present(incoming.clone());
                });
            }
            Event::GuildDelete(delete) => {
                if delete.unavailable {
                    self.guilds.insert(delete.id, GuildSlot::Unavailable);
                    derived.push(Event::GuildUnavailable(delete.id));
                } else {
                    self.guilds.remove(&delete.id);
                    self.evict_guild(delete.id);
                    derived.push(Event::GuildLeave(delete.id));
                }
            }

            Event::GuildMemberAdd(add) => {
                self.members
                    .insert((add.guild_id, add.member.user.id), add.member.clone());
            }
            Event::GuildMemberUpdate(update) => {
                let applied =
                    self.members
                        .update(&(update.guild_id, update.user.id), &mut |member| {
                            member.user = update.user.clone();
                            if let Some(nick) = &update.nick {
                                member.nick = Some(nick.clone());
                            }
                            if let Some(roles) = &update.roles {
                                member.roles = roles.clone();
                            }
                            if let Some(joined_at) = update.joined_at {
                                member.joined_at = Some(joined_at);
                            }
                            if let Some(mute) = update.mute {
                                member.mute = mute;
                            }
                            if let Some(deaf) = update.deaf {
                                member.deaf = deaf;
                            }
                        });
                if !applied {
                    debug!(guild = %update.guild_id, user = %update.user.id,
                        "member update for uncached member");
                }
            }
            Event::GuildMemberRemove(remove) => {
                self.members.remove(&(remove.guild_id, remove.user.id));
                self.presences.remove(&(remove.guild_id, remove.user.id));
            }
            Event::GuildMembersChunk(chunk) => {
                for member in &chunk.members {
                    self.members
                        .insert((chunk.guild_id, member.user.id), member.clone());
                }
            }

            Event::GuildRoleCreate(create) | Event::GuildRoleUpdate(create) => {
                self.guilds.update(&create.guild_id, &mut |slot| {
                    if let GuildSlot::Present(guild) = slot {
                        match guild.roles.iter_mut().find(|r| r.id == create.role.id) {
                            Some(role) => *role = create.role.clone(),
                            None => guild.roles.push(create.role.clone()),
                        }
                    }
                });
            }
            Event::GuildRoleDelete(delete) => {
                self.guilds.update(&delete.guild_id, &mut |slot| {
                    if let GuildSlot::Present(guild) = slot {
                        guild.roles.retain(|r| r.id != delete.role_id);
                    }
                });
            }

            Event::GuildEmojisUpdate(update) => {
                self.emojis.insert(update.guild_id, update.emojis.clone());
                self.guilds.update(&update.guild_id, &mut |slot| {
                    if let GuildSlot::Present(guild) = slot {
                        guild.emojis = update.emojis.clone();
                    }
                });
            }

            Event::ChannelCreate(channel) | Event::ChannelUpdate(channel) => {
                self.channels.insert(channel.id, channel.clone());
                if channel.is_private() {
                    self.private_channels.insert(channel.id, channel.clone());
                }
            }
            Event::ChannelDelete(channel) => {
                self.channels.remove(&channel.id);
                self.private_channels.remove(&channel.id);
            }

            Event::MessageCreate(message) => {
                self.messages.push((**message).clone());
            }
            Event::MessageUpdate(update) => {
                self.messages.update(update.channel_id, update.id, &mut |message| {
                    if let Some(content) = &update.content {
                        message.content = content.clone();
                    }
                    if let Some(edited) = update.edited_timestamp {
                        message.edited_timestamp = Some(edited);
                    }
                    if let Some(pinned) = update.pinned {
                        message.pinned = pinned;
                    }
                    if let Some(mention_everyone) = update.mention_everyone {
                        message.mention_everyone = mention_everyone;
                    }
                    if let Some(mentions) = &update.mentions {
                        message.mentions = mentions.clone();
                    }
                    if let Some(embeds) = &update.embeds {
                        message.embeds = embeds.clone();
                    }
                });
            }
            Event::MessageDelete(delete) => {
                self.messages.remove(delete.channel_id, delete.id);
            }

            Event::MessageReactionAdd(reaction) => {
                let own = self.own_user_id();
                self.messages
                    .update(reaction.channel_id, reaction.message_id, &mut |message| {
                        let me = own == Some(reaction.user_id);
                        let reactions = message.reactions.get_or_insert_with(Vec::new);
                        match reactions.iter_mut().find(|r| r.emoji == reaction.emoji) {
                            Some(existing) => {
                                existing.count += 1;
                                existing.me |= me;
                            }
                            None => reactions.push(MessageReaction {
                                count: 1,
                                me,
                                emoji: reaction.emoji.clone(),
                            }),
                        }
                    });
            }
            Event::MessageReactionRemove(reaction) => {
                let own = self.own_user_id();
                self.messages
                    .update(reaction.channel_id, reaction.message_id, &mut |message| {
                        remove_reaction(
                            &mut message.reactions,
                            &reaction.emoji,
                            own == Some(reaction.user_id),
                        );
                    });
            }
            Event::MessageReactionRemoveAll(remove) => {
                self.messages
                    .update(remove.channel_id, remove.message_id, &mut |message| {
                        message.reactions = None;
                    });
            }
            Event::MessageReactionRemoveEmoji(remove) => {
                self.messages
                    .update(remove.channel_id, remove.message_id, &mut |message| {
                        if let Some(reactions) = &mut message.reactions {
                            reactions.retain(|r| r.emoji != remove.emoji);
                            if reactions.is_empty() {
                                message.reactions = None;
                            }
                        }
                    });
            }

            Event::PresenceUpdate(update) => {
                let guild = update.guild_id.unwrap_or_default();
                self.presences
                    .insert((guild, update.presence.user_id()), update.presence.clone());
            }
            Event::PresencesReplace(presences) => {
                for presence in presences {
                    self.presences
                        .insert((GuildId(0), presence.user_id()), presence.clone());
                }
            }

            Event::TypingStart(_) => {}

            Event::UserUpdate(patch) => {
                self.me.update(&(), &mut |me| me.update_from(patch));
            }
            Event::UserNoteUpdate(update) => {
                if update.note.is_empty() {
                    self.notes.remove(&update.id);
                } else {
                    self.notes.insert(update.id, update.note.clone());
                }
            }
            Event::UserSettingsUpdate(value) | Event::UserGuildSettingsUpdate(value) => {
                self.settings.insert((), value.clone());
            }

            Event::VoiceStateUpdate(state) => {
                let guild = state.guild_id.unwrap_or_default();
                match state.channel_id {
                    Some(_) => self
                        .voice_states
                        .insert((guild, state.user_id), state.clone()),
                    None => {
                        self.voice_states.remove(&(guild, state.user_id));
                    }
                }
            }
            Event::VoiceServerUpdate(_) => {}

            // Derived events are produced, not consumed, here.
            Event::GuildReady(_)
            | Event::GuildAvailable(_)
            | Event::GuildJoin(_)
            | Event::GuildUnavailable(_)
            | Event::GuildLeave(_) => {}

            Event::Unknown => {}
        }
        derived
    }

    /// Install a fully delivered guild and its live pieces.
    fn install_guild(&self, create: &GuildCreate) {
        let id = create.guild.id;
        self.guilds
            .insert(id, GuildSlot::Present(create.guild.clone()));
        self.emojis.insert(id, create.guild.emojis.clone());
        for channel in &create.channels {
            let mut channel = channel.clone();
            channel.guild_id.get_or_insert(id);
            self.channels.insert(channel.id, channel);
        }
        for member in &create.members {
            self.members.insert((id, member.user.id), member.clone());
        }
        for presence in &create.presences {
            self.presences
                .insert((id, presence.user_id()), presence.clone());
        }
        for state in &create.voice_states {
            if state.channel_id.is_some() {
                self.voice_states.insert((id, state.user_id), state.clone());
            }
        }
    }

    /// Drop everything cached under a guild the user left.
    fn evict_guild(&self, id: GuildId) {
        self.emojis.remove(&id);
        for channel in self.channels.values() {
            if channel.guild_id == Some(id) {
                self.channels.remove(&channel.id);
            }
        }
        for member in self.members.values() {
            self.members.remove(&(id, member.user.id));
        }
        for presence in self.presences.values() {
            self.presences.remove(&(id, presence.user_id()));
        }
        for state in self.voice_states.values() {
            self.voice_states.remove(&(id, state.user_id));
        }
    }

    fn own_user_id(&self) -> Option<UserId> {
        self.me.get(&()).map(|me| me.id)
    }
}

fn remove_reaction(
    reactions: &mut Option<Vec<MessageReaction>>,
    emoji: &ReactionEmoji,
    own: bool,
) {
    if let Some(list) = reactions {
        if let Some(index) = list.iter().position(|r| &r.emoji == emoji) {
            let entry = &mut list[index];
            entry.count = entry.count.saturating_sub(1);
            if own {
                entry.me = false;
            }
            if entry.count == 0 {
                list.remove(index);
            }
        }
        if list.is_empty() {
            *reactions = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiClient;
    use crate::model::*;
    use crate::state::StateHook;
    use crate::{Error, Result};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    struct DeadApi;

    #[async_trait]
    impl ApiClient for DeadApi {
        async fn current_user(&self) -> Result<CurrentUser> {
            Err(Error::NotFound("user"))
        }
        async fn guild(&self, _: GuildId) -> Result<Guild> {
            Err(Error::NotFound("guild"))
        }
        async fn channel(&self, _: ChannelId) -> Result<Channel> {
            Err(Error::NotFound("channel"))
        }
        async fn member(&self, _: GuildId, _: UserId) -> Result<Member> {
            Err(Error::NotFound("member"))
        }
        async fn message(&self, _: ChannelId, _: MessageId) -> Result<Message> {
            Err(Error::NotFound("message"))
        }
        async fn messages(
            &self,
            _: ChannelId,
            _: usize,
            _: Option<MessageId>,
        ) -> Result<Vec<Message>> {
            Ok(vec![])
        }
        async fn emojis(&self, _: GuildId) -> Result<Vec<Emoji>> {
            Ok(vec![])
        }
    }

    fn cabinet() -> super::super::Cabinet {
        super::super::Cabinet::new(
            Arc::new(DeadApi),
            Intents::GUILDS | Intents::GUILD_MEMBERS | Intents::GUILD_MESSAGES,
        )
    }

    fn event(value: serde_json::Value) -> Event {
        serde_json::from_value(value).unwrap()
    }

    fn guild_create(id: u64) -> Event {
        event(json!({
            "t": "GUILD_CREATE",
            "d": {
                "id": id.to_string(),
                "name": "guild",
                "owner_id": "1",
                "roles": [],
                "unavailable": false
            }
        }))
    }

    #[test]
    fn guild_availability_transitions() {
        let cabinet = cabinet();

        let ready = event(json!({
            "t": "READY",
            "d": {
                "v": 6,
                "user": {"id": "900", "username": "me"},
                "session_id": "s",
                "guilds": [{"id": "1", "unavailable": true}]
            }
        }));
        assert!(cabinet.apply(&ready).is_empty());

        let derived = cabinet.apply(&guild_create(1));
        assert_eq!(derived.len(), 1);
        assert!(matches!(derived[0], Event::GuildReady(_)));

        let derived = cabinet.apply(&event(json!({
            "t": "GUILD_DELETE",
            "d": {"id": "1", "unavailable": true}
        })));
        assert!(matches!(
            derived.as_slice(),
            [Event::GuildUnavailable(GuildId(1))]
        ));

        let derived = cabinet.apply(&guild_create(1));
        assert_eq!(derived.len(), 1);
        assert!(matches!(derived[0], Event::GuildAvailable(_)));

        let derived = cabinet.apply(&event(json!({
            "t": "GUILD_DELETE",
            "d": {"id": "1", "unavailable": false}
        })));
        assert!(matches!(derived.as_slice(), [Event::GuildLeave(GuildId(1))]));
        assert!(cabinet.guilds.get(&GuildId(1)).is_none());
    }

    #[test]
    fn unknown_guild_create_derives_join() {
        let cabinet = cabinet();
        let derived = cabinet.apply(&guild_create(2));
        assert!(matches!(derived.as_slice(), [Event::GuildJoin(_)]));
    }

    #[test]
    fn applying_an_event_twice_is_idempotent() {
        let cabinet = cabinet();
        cabinet.apply(&guild_create(3));
        let roles_once = match cabinet.guilds.get(&GuildId(3)) {
            Some(GuildSlot::Present(g)) => g.roles.len(),
            other => panic!("unexpected slot: {:?}", other),
        };
        cabinet.apply(&guild_create(3));
        match cabinet.guilds.get(&GuildId(3)) {
            Some(GuildSlot::Present(g)) => assert_eq!(g.roles.len(), roles_once),
            other => panic!("unexpected slot: {:?}", other),
        }
    }

    #[test]
    fn role_delete_splices_correctly() {
        let cabinet = cabinet();
        cabinet.apply(&guild_create(4));
        for role in 1..=3u64 {
            cabinet.apply(&event(json!({
                "t": "GUILD_ROLE_CREATE",
                "d": {
                    "guild_id": "4",
                    "role": {"id": role.to_string(), "name": format!("r{}", role), "permissions": 0}
                }
            })));
        }

        // Deleting the middle role must keep both neighbours.
        cabinet.apply(&event(json!({
            "t": "GUILD_ROLE_DELETE",
            "d": {"guild_id": "4", "role_id": "2"}
        })));
        match cabinet.guilds.get(&GuildId(4)) {
            Some(GuildSlot::Present(g)) => {
                let ids: Vec<u64> = g.roles.iter().map(|r| r.id.0).collect();
                assert_eq!(ids, vec![1, 3]);
            }
            other => panic!("unexpected slot: {:?}", other),
        }
    }

    #[test]
    fn member_update_applies_only_non_null_fields() {
        let cabinet = cabinet();
        cabinet.apply(&event(json!({
            "t": "GUILD_MEMBER_ADD",
            "d": {
                "guild_id": "5",
                "user": {"id": "6", "username": "alice"},
                "nick": "al",
                "roles": ["7"]
            }
        })));

        cabinet.apply(&event(json!({
            "t": "GUILD_MEMBER_UPDATE",
            "d": {
                "guild_id": "5",
                "user": {"id": "6", "username": "alice2"},
                "roles": ["7", "8"]
            }
        })));

        let member = cabinet.members.get(&(GuildId(5), UserId(6))).unwrap();
        assert_eq!(member.user.name, "alice2");
        assert_eq!(member.nick.as_deref(), Some("al")); // untouched
        assert_eq!(member.roles, vec![RoleId(7), RoleId(8)]);
    }

    fn seed_message(cabinet: &super::super::Cabinet) {
        cabinet.apply(&event(json!({
            "t": "MESSAGE_CREATE",
            "d": {
                "id": "10",
                "channel_id": "11",
                "guild_id": "5",
                "author": {"id": "900", "username": "me"},
                "content": "hi",
                "timestamp": "2020-01-01T00:00:00+00:00"
            }
        })));
    }

    #[test]
    fn reaction_add_and_remove_all() {
        let cabinet = cabinet();
        // The own user, for "me" bookkeeping.
        cabinet.me.insert(
            (),
            CurrentUser {
                id: UserId(900),
                username: "me".into(),
                avatar: None,
                email: None,
                verified: false,
                bot: false,
            },
        );
        seed_message(&cabinet);

        cabinet.apply(&event(json!({
            "t": "MESSAGE_REACTION_ADD",
            "d": {
                "user_id": "900",
                "channel_id": "11",
                "message_id": "10",
                "emoji": {"name": "🦊", "id": null}
            }
        })));

        let message = &cabinet.messages.messages(ChannelId(11))[0];
        let reactions = message.reactions.as_ref().unwrap();
        assert_eq!(reactions.len(), 1);
        assert_eq!(reactions[0].count, 1);
        assert!(reactions[0].me);

        cabinet.apply(&event(json!({
            "t": "MESSAGE_REACTION_REMOVE_ALL",
            "d": {"channel_id": "11", "message_id": "10"}
        })));
        let message = &cabinet.messages.messages(ChannelId(11))[0];
        assert!(message.reactions.is_none());
    }

    #[test]
    fn reaction_remove_decrements_and_clears() {
        let cabinet = cabinet();
        seed_message(&cabinet);
        for user in ["900", "901"] {
            cabinet.apply(&event(json!({
                "t": "MESSAGE_REACTION_ADD",
                "d": {
                    "user_id": user,
                    "channel_id": "11",
                    "message_id": "10",
                    "emoji": {"name": "🦊", "id": null}
                }
            })));
        }

        cabinet.apply(&event(json!({
            "t": "MESSAGE_REACTION_REMOVE",
            "d": {
                "user_id": "901",
                "channel_id": "11",
                "message_id": "10",
                "emoji": {"name": "🦊", "id": null}
            }
        })));
        let message = &cabinet.messages.messages(ChannelId(11))[0];
        assert_eq!(message.reactions.as_ref().unwrap()[0].count, 1);

        cabinet.apply(&event(json!({
            "t": "MESSAGE_REACTION_REMOVE",
            "d": {
                "user_id": "900",
                "channel_id": "11",
                "message_id": "10",
                "emoji": {"name": "🦊", "id": null}
            }
        })));
        let message = &cabinet.messages.messages(ChannelId(11))[0];
        assert!(message.reactions.is_none());
    }

    #[test]
    fn voice_state_channel_none_removes() {
        let cabinet = cabinet();
        cabinet.apply(&event(json!({
            "t": "VOICE_STATE_UPDATE",
            "d": {
                "guild_id": "20",
                "user_id": "21",
                "channel_id": "22",
                "session_id": "abc"
            }
        })));
        assert!(cabinet.voice_states.get(&(GuildId(20), UserId(21))).is_some());

        cabinet.apply(&event(json!({
            "t": "VOICE_STATE_UPDATE",
            "d": {
                "guild_id": "20",
                "user_id": "21",
                "channel_id": null,
                "session_id": "abc"
            }
        })));
        assert!(cabinet.voice_states.get(&(GuildId(20), UserId(21))).is_none());
    }

    #[test]
    fn guild_leave_evicts_guild_data() {
        let cabinet = cabinet();
        cabinet.apply(&guild_create(5));
        cabinet.apply(&event(json!({
            "t": "CHANNEL_CREATE",
            "d": {"id": "50", "type": 0, "guild_id": "5"}
        })));
        cabinet.apply(&event(json!({
            "t": "GUILD_MEMBER_ADD",
            "d": {"guild_id": "5", "user": {"id": "51", "username": "bob"}}
        })));

        cabinet.apply(&event(json!({
            "t": "GUILD_DELETE",
            "d": {"id": "5", "unavailable": false}
        })));
        assert!(cabinet.channels.get(&ChannelId(50)).is_none());
        assert!(cabinet.members.get(&(GuildId(5), UserId(51))).is_none());
    }
}
