//! Kind-tagged snowflake identifiers.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Milliseconds of the Discord epoch (2015-01-01T00:00:00Z).
const DISCORD_EPOCH_MS: i64 = 1_420_070_400_000;

macro_rules! snowflake {
    ($(#[$attr:meta] $name:ident;)*) => {
        $(
            #[$attr]
            ///
            /// Identifiers compare by their numeric value. They can be
            /// debug-printed using the `{:?}` specifier, or their raw number
            /// printed using the `{}` specifier.
            #[derive(Copy, Clone, Hash, Eq, PartialEq, Debug, Ord, PartialOrd, Default)]
            #[derive(Serialize, Deserialize)]
            pub struct $name(
                #[serde(deserialize_with = "crate::serial::deserialize_id")] pub u64,
            );

            impl $name {
                /// Whether this identifier holds a real value. The zero
                /// snowflake is used on the wire to mean "none".
                pub fn is_valid(&self) -> bool {
                    self.0 != 0
                }

                /// Get the creation date of the object referred to by this ID.
                ///
                /// Discord generates identifiers using a scheme based on
                /// [Twitter Snowflake](https://github.com/twitter/snowflake).
                pub fn creation_date(&self) -> DateTime<Utc> {
                    let ms = DISCORD_EPOCH_MS + (self.0 >> 22) as i64;
                    Utc.timestamp_millis_opt(ms)
                        .single()
                        .unwrap_or(DateTime::<Utc>::MIN_UTC)
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl From<u64> for $name {
                fn from(raw: u64) -> Self {
                    $name(raw)
                }
            }
        )*
    }
}

snowflake! {
    /// Bots are identified sometimes by their application ID
    ApplicationId;
    /// An identifier for a User
    UserId;
    /// An identifier for a Guild
    GuildId;
    /// An identifier for a Channel
    ChannelId;
    /// An identifier for a Message
    MessageId;
    /// An identifier for a Role
    RoleId;
    /// An identifier for an Emoji
    EmojiId;
}

impl GuildId {
    /// The `@everyone` role of a guild shares the guild's own ID.
    pub fn everyone(&self) -> RoleId {
        RoleId(self.0)
    }
}
