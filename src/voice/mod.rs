//! Voice communication: per-guild sessions coordinated from main-gateway
//! events, each owning a WebSocket control plane and a managed UDP media
//! socket.

mod manager;
mod session;
mod udp;

pub use manager::UdpManager;
pub use session::VoiceSession;
pub use udp::{OwnedPacket, Packet, UdpConnection};

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tracing::debug;

use crate::dispatch::{Dispatcher, Filter, Handle};
use crate::gateway::CommandSender;
use crate::model::{
    ChannelId, Command, Event, EventType, GuildId, UpdateVoiceStatePayload, UserId,
};
use crate::Result;

/// Tracks one [`VoiceSession`] per guild and routes the voice-state and
/// voice-server halves from the main gateway into them.
pub struct VoiceCoordinator {
    commands: CommandSender,
    user_id: StdMutex<Option<UserId>>,
    sessions: StdMutex<HashMap<GuildId, Arc<VoiceSession>>>,
}

impl VoiceCoordinator {
    pub fn new(commands: CommandSender) -> Arc<VoiceCoordinator> {
        Arc::new(VoiceCoordinator {
            commands,
            user_id: StdMutex::new(None),
            sessions: StdMutex::new(HashMap::new()),
        })
    }

    /// Subscribe the coordinator to the events it routes. The returned
    /// handles unsubscribe it.
    pub fn attach(self: &Arc<Self>, dispatcher: &Dispatcher) -> Vec<Handle> {
        [
            EventType::Ready,
            EventType::VoiceStateUpdate,
            EventType::VoiceServerUpdate,
        ]
        .into_iter()
        .map(|kind| {
            let coordinator = self.clone();
            dispatcher.subscribe_sync(Filter::Exact(kind), move |event| {
                coordinator.on_event(event);
            })
        })
        .collect()
    }

    fn on_event(&self, event: &Event) {
        match event {
            Event::Ready(ready) => {
                *self.user_id.lock().expect("voice lock poisoned") = Some(ready.user.id);
            }
            Event::VoiceStateUpdate(state) => {
                let Some(guild_id) = state.guild_id else {
                    return;
                };
                if let Some(session) = self.session(guild_id) {
                    session.update_state(state);
                }
            }
            Event::VoiceServerUpdate(update) => {
                if let Some(session) = self.session(update.guild_id) {
                    session.update_server(update.endpoint.as_deref(), &update.token);
                }
            }
            _ => {}
        }
    }

    /// The session for a guild, if one exists.
    pub fn session(&self, guild: GuildId) -> Option<Arc<VoiceSession>> {
        self.sessions
            .lock()
            .expect("voice lock poisoned")
            .get(&guild)
            .cloned()
    }

    /// Join (or move within) a guild's voice channel.
    ///
    /// Sends the voice-state command on the main gateway and returns the
    /// session, created if absent. The session connects once the server
    /// answers with the voice-state and voice-server events.
    pub fn join_channel(
        &self,
        guild: GuildId,
        channel: ChannelId,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<Arc<VoiceSession>> {
        let user_id = (*self.user_id.lock().expect("voice lock poisoned"))
            .ok_or(crate::Error::Protocol("no ready event seen yet"))?;

        self.commands
            .send(&Command::update_voice_state(UpdateVoiceStatePayload {
                guild_id: guild,
                channel_id: Some(channel),
                self_mute,
                self_deaf,
            }))?;

        let session = self
            .sessions
            .lock()
            .expect("voice lock poisoned")
            .entry(guild)
            .or_insert_with(|| Arc::new(VoiceSession::new(guild, user_id)))
            .clone();
        debug!(%guild, %channel, "joining voice channel");
        Ok(session)
    }

    /// Leave a guild's voice channel and tear its session down.
    pub fn leave(&self, guild: GuildId) -> Result<()> {
        self.commands
            .send(&Command::update_voice_state(UpdateVoiceStatePayload {
                guild_id: guild,
                channel_id: None,
                self_mute: false,
                self_deaf: false,
            }))?;

        if let Some(session) = self
            .sessions
            .lock()
            .expect("voice lock poisoned")
            .remove(&guild)
        {
            session.close();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn voice_events_route_to_their_session() {
        let dispatcher = Dispatcher::new();
        // A session without a live gateway; commands fail, routing works.
        let session_map: StdMutex<HashMap<GuildId, Arc<VoiceSession>>> = StdMutex::new(
            [(GuildId(1), Arc::new(VoiceSession::new(GuildId(1), UserId(2))))].into(),
        );

        let coordinator = Arc::new(VoiceCoordinator {
            commands: disconnected_commands(),
            user_id: StdMutex::new(Some(UserId(2))),
            sessions: session_map,
        });
        let handles = coordinator.attach(&dispatcher);

        let event: Event = serde_json::from_value(serde_json::json!({
            "t": "VOICE_SERVER_UPDATE",
            "d": {"guild_id": "1", "token": "tok", "endpoint": "voice.example:80"}
        }))
        .unwrap();
        dispatcher.dispatch(&event).await;

        // Routing a state for an unknown guild is a no-op.
        let event: Event = serde_json::from_value(serde_json::json!({
            "t": "VOICE_STATE_UPDATE",
            "d": {"guild_id": "9", "user_id": "2", "channel_id": "3", "session_id": "s"}
        }))
        .unwrap();
        dispatcher.dispatch(&event).await;

        for handle in handles {
            handle.remove();
        }
        if let Some(session) = coordinator.session(GuildId(1)) {
            session.close();
        }
    }

    fn disconnected_commands() -> CommandSender {
        let session = crate::Session::new(
            crate::gateway::SessionConfig::new(
                "token",
                "wss://example.invalid",
                crate::model::Intents::GUILDS,
            ),
            Dispatcher::new(),
        );
        session.commands()
    }
}
