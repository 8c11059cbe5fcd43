//! The REST API capability consumed by the state cache.
//!
//! The actual HTTP client lives outside this crate; the cache only needs the
//! handful of getters it falls back to on a miss, plus enough to paginate a
//! channel's message history.

use async_trait::async_trait;

use crate::model::{
    Channel, ChannelId, CurrentUser, Emoji, Guild, GuildId, Member, Message, MessageId, UserId,
};
use crate::Result;

/// Getters the state cache delegates to on cache misses.
///
/// Implementations return [`Error::NotFound`](crate::Error::NotFound) when
/// the remote side reports the entity absent, so callers can distinguish a
/// true miss from an IO failure.
#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn current_user(&self) -> Result<CurrentUser>;

    async fn guild(&self, id: GuildId) -> Result<Guild>;

    async fn channel(&self, id: ChannelId) -> Result<Channel>;

    async fn member(&self, guild: GuildId, user: UserId) -> Result<Member>;

    async fn message(&self, channel: ChannelId, id: MessageId) -> Result<Message>;

    /// Up to `limit` messages of a channel, newest first, all strictly older
    /// than `before` when given.
    async fn messages(
        &self,
        channel: ChannelId,
        limit: usize,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>>;

    async fn emojis(&self, guild: GuildId) -> Result<Vec<Emoji>>;
}
