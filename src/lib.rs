//! Realtime core for the [Discord](https://discord.com) API.
//!
//! The realtime platform is a dual-plane transport: a persistent WebSocket
//! control connection to the chat gateway, plus, on demand, negotiated
//! WebSocket+UDP voice connections. This crate implements that core:
//!
//! * a type-routed [`Dispatcher`] fanning gateway events out to callback and
//!   channel subscriptions,
//! * a reconnecting gateway [`Session`] with heartbeats, identify/resume and
//!   a synchronous state hook,
//! * the state cache ([`Cabinet`]) keeping a local view of guilds, channels,
//!   members, and messages, with an API fallback for misses,
//! * a [`ShardManager`](shard::ShardManager) coordinating a set of sessions,
//! * and the voice transport: per-guild sessions that perform IP discovery
//!   and key exchange, then stream paced, sealed RTP through a pauseable
//!   [`UdpManager`](voice::UdpManager) that survives server migrations.
//!
//! The HTTP REST client stays outside; the cache consumes it through the
//! [`ApiClient`] capability. Opus encoding is likewise out of scope: media
//! frames pass through the voice transport as opaque bytes.
//!
#![cfg_attr(
    not(feature = "voice"),
    doc = "*<b>NOTE</b>: The library has been compiled without voice support.*"
)]
//! A typical bot wires the pieces together like so: build a [`Dispatcher`],
//! subscribe handlers, construct a [`Cabinet`] over your REST client, and
//! open a [`Session`] with the cabinet installed as its state hook. To join
//! voice, attach a [`voice::VoiceCoordinator`] to the dispatcher and call
//! `join_channel`.

mod api;
mod dispatch;
mod error;
mod gateway;
mod io;
mod serial;
mod shard;
mod signal;
mod state;

/// Struct and enum definitions of values in the Discord model.
pub mod model {
    mod entity;
    mod event;
    mod id;

    pub use self::entity::*;
    pub use self::event::*;
    pub use self::id::*;
}

#[cfg(feature = "voice")]
pub mod voice;

pub use api::ApiClient;
pub use dispatch::{Dispatcher, ErrorSink, Filter, Handle};
pub use error::{Error, Result};
pub use gateway::{CommandSender, ConnectionState, Session, SessionConfig};
pub use shard::{Shard, ShardFactory, ShardId, ShardManager};
pub use signal::Flag;
pub use state::{
    Cabinet, GuildSlot, MemoryMessages, MemoryStore, MessageStore, NoopStore, StateHook, Store,
    DEFAULT_MESSAGE_CAP,
};
