use serde_json::Error as JsonError;
use serde_json::Value;
use std::error::Error as StdError;
use std::fmt::Display;
use std::io::Error as IoError;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Discord realtime `Result` alias type.
pub type Result<T> = ::std::result::Result<T, Error>;

/// Discord realtime error type.
#[derive(Debug)]
pub enum Error {
    /// A `tungstenite` crate error
    WebSocket(WsError),
    /// A `serde_json` crate error
    Json(JsonError),
    /// A `std::io` module error
    Io(IoError),
    /// A websocket connection was closed, possibly with a message
    Closed(Option<u16>, String),
    /// A json decoding error, with a description and the offending value
    Decode(&'static str, Value),
    /// A Discord protocol error, with a description
    Protocol(&'static str),
    /// An entity was absent from the cache and, if applicable, the API.
    ///
    /// Cache getters use this as an internal sentinel to drive the API
    /// fallback; it only reaches callers when the API agrees.
    NotFound(&'static str),
    /// A sealed voice packet failed to open with the installed secret
    Crypto,
    /// The caller's cancellation flag tripped before the operation finished
    Cancelled,
    /// The voice UDP manager has been closed
    ManagerClosed,
    /// An operation needed a live connection where none exists yet
    NotConnected,
    /// A miscellaneous error, with a description
    Other(&'static str),
}

impl From<IoError> for Error {
    fn from(err: IoError) -> Error {
        Error::Io(err)
    }
}

impl From<JsonError> for Error {
    fn from(err: JsonError) -> Error {
        Error::Json(err)
    }
}

impl From<WsError> for Error {
    fn from(err: WsError) -> Error {
        Error::WebSocket(err)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        match *self {
            Error::WebSocket(ref inner) => inner.fmt(f),
            Error::Json(ref inner) => inner.fmt(f),
            Error::Io(ref inner) => inner.fmt(f),
            Error::Closed(code, ref message) => {
                write!(f, "Connection closed ({:?}): {}", code, message)
            }
            Error::Decode(msg, ref value) => write!(f, "{}: {}", msg, value),
            Error::Protocol(msg) | Error::Other(msg) => f.write_str(msg),
            Error::NotFound(kind) => write!(f, "{} not found", kind),
            Error::Crypto => f.write_str("Packet failed to decrypt"),
            Error::Cancelled => f.write_str("Operation cancelled"),
            Error::ManagerClosed => f.write_str("Voice UDP manager closed"),
            Error::NotConnected => f.write_str("Not connected"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match *self {
            Error::WebSocket(ref inner) => Some(inner),
            Error::Json(ref inner) => Some(inner),
            Error::Io(ref inner) => Some(inner),
            _ => None,
        }
    }
}

impl Error {
    /// Whether this error is the cache-miss sentinel.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Whether this error came from a caller-supplied cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
