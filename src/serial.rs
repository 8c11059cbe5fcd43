//! Serde integration support.

use std::fmt;

use serde::de::{Error, Unexpected, Visitor};
use serde::*;

/// Ignore deserialization errors and revert to default.
pub fn ignore_errors<'d, T: Deserialize<'d> + Default, D: Deserializer<'d>>(
    d: D,
) -> Result<T, D::Error> {
    use serde_json::Value;

    let v = Value::deserialize(d)?;
    Ok(T::deserialize(v).ok().unwrap_or_default())
}

/// Deserialize a maybe-string ID into a u64.
pub fn deserialize_id<'d, D: Deserializer<'d>>(d: D) -> Result<u64, D::Error> {
    struct IdVisitor;
    impl<'d> Visitor<'d> for IdVisitor {
        type Value = u64;

        fn expecting(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
            write!(fmt, "a u64 or parseable string")
        }

        fn visit_i64<E: Error>(self, v: i64) -> Result<u64, E> {
            if v >= 0 {
                Ok(v as u64)
            } else {
                Err(E::invalid_value(Unexpected::Signed(v), &self))
            }
        }

        fn visit_u64<E: Error>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }

        fn visit_str<E: Error>(self, v: &str) -> Result<u64, E> {
            v.parse::<u64>()
                .map_err(|_| E::invalid_value(Unexpected::Str(v), &self))
        }
    }

    d.deserialize_any(IdVisitor)
}

/// Special support for the oddly complex `ReactionEmoji`.
pub mod reaction_emoji {
    use super::*;
    use crate::model::{EmojiId, ReactionEmoji};

    #[derive(Serialize)]
    struct EmojiSer<'s> {
        name: &'s str,
        id: Option<EmojiId>,
        animated: Option<bool>,
    }

    #[derive(Deserialize)]
    struct EmojiDe {
        name: String,
        id: Option<EmojiId>,
        #[serde(default)]
        animated: Option<bool>,
    }

    pub fn serialize<S: Serializer>(v: &ReactionEmoji, s: S) -> Result<S::Ok, S::Error> {
        (match *v {
            ReactionEmoji::Unicode { ref name } => EmojiSer {
                name,
                id: None,
                animated: None,
            },
            ReactionEmoji::Custom {
                ref name,
                id,
                animated,
            } => EmojiSer {
                id: Some(id),
                name,
                animated: Some(animated),
            },
        })
        .serialize(s)
    }

    pub fn deserialize<'d, D: Deserializer<'d>>(d: D) -> Result<ReactionEmoji, D::Error> {
        Ok(match EmojiDe::deserialize(d)? {
            EmojiDe { name, id: None, .. } => ReactionEmoji::Unicode { name },
            EmojiDe {
                name,
                id: Some(id),
                animated,
            } => ReactionEmoji::Custom {
                name,
                id,
                animated: animated.unwrap_or(false),
            },
        })
    }
}

/// Make sure a field holds a certain numeric value, or fail otherwise.
///
/// Used to pin the `op` field of wire payloads at the type level.
#[derive(Debug, Clone)]
pub struct Eq<const N: u64>;

impl<'de, const N: u64> Deserialize<'de> for Eq<N> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct NumberVisitor<const N: u64>;

        impl<'d, const N: u64> Visitor<'d> for NumberVisitor<N> {
            type Value = ();

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "the number {}", N)
            }

            fn visit_u64<E: Error>(self, v: u64) -> Result<(), E> {
                if v == N {
                    Ok(())
                } else {
                    Err(E::invalid_value(Unexpected::Unsigned(v), &self))
                }
            }

            fn visit_i64<E: Error>(self, v: i64) -> Result<(), E> {
                if v >= 0 && v as u64 == N {
                    Ok(())
                } else {
                    Err(E::invalid_value(Unexpected::Signed(v), &self))
                }
            }
        }

        deserializer.deserialize_any(NumberVisitor::<N>)?;
        Ok(Self)
    }
}

impl<const N: u64> Serialize for Eq<N> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(N)
    }
}

#[cfg(test)]
mod tests {
    use super::Eq;

    #[test]
    fn const_eq_round_trip() {
        let json = serde_json::to_string(&Eq::<10>).unwrap();
        assert_eq!(json, "10");
        assert!(serde_json::from_str::<Eq<10>>("10").is_ok());
        assert!(serde_json::from_str::<Eq<10>>("11").is_err());
    }
}
