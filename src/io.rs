//! JSON accepting [Stream]s and [Sink]s over the gateway WebSocket.

use std::io::Read;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{SplitSink, SplitStream};
use futures::{ready, SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::model::{Decoder, GatewayPayload};
use crate::{Error, Result};

/// The connected WebSocket transport type.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dial a gateway URL, requesting zlib frame compression.
pub async fn connect(url: &str) -> Result<(PayloadSink, SplitStream<WsStream>)> {
    let mut request = url.into_client_request()?;
    request
        .headers_mut()
        .insert("Accept-Encoding", HeaderValue::from_static("zlib"));

    let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
    let (sink, stream) = ws.split();
    Ok((PayloadSink { inner: sink }, stream))
}

/// Inflate one zlib-compressed frame.
fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut inflated = Vec::with_capacity(data.len() * 4);
    flate2::read::ZlibDecoder::new(data).read_to_end(&mut inflated)?;
    Ok(inflated)
}

/// JSON-encoded values received from a WebSocket.
///
/// Ping and pong frames are skipped (the transport answers pings itself);
/// close frames surface as [`Error::Closed`].
#[derive(Debug)]
pub struct JsonStream<T> {
    inner: SplitStream<WsStream>,
    _t: PhantomData<T>,
}

impl<T> JsonStream<T> {
    pub fn new(read: SplitStream<WsStream>) -> Self {
        Self {
            inner: read,
            _t: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Stream for JsonStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // SAFETY: `inner` is `Unpin` and is never moved; `_t` is a zero-sized
        // `PhantomData<T>` that is never accessed, so projecting through the
        // pin is sound regardless of whether `T` is `Unpin`.
        let this = unsafe { self.get_unchecked_mut() };
        loop {
            let message = match ready!(this.inner.poll_next_unpin(cx)) {
                Some(Ok(message)) => message,
                Some(Err(err)) => return Poll::Ready(Some(Err(Error::WebSocket(err)))),
                None => return Poll::Ready(None),
            };

            return Poll::Ready(Some(match message {
                Message::Text(text) => serde_json::from_str(&text).map_err(Error::Json),
                Message::Binary(bin) => serde_json::from_slice(&bin).map_err(Error::Json),
                Message::Close(frame) => Err(close_error(frame)),
                // Answered by the transport; nothing to surface.
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Frame(_) => Err(Error::Protocol("unexpected raw frame")),
            }));
        }
    }
}

/// A stream over main-gateway payloads, inflating compressed frames and
/// decoding them with the session's [`Decoder`].
pub struct PayloadStream {
    inner: SplitStream<WsStream>,
    decoder: Arc<dyn Decoder>,
}

impl PayloadStream {
    pub fn new(read: SplitStream<WsStream>, decoder: Arc<dyn Decoder>) -> Self {
        Self {
            inner: read,
            decoder,
        }
    }
}

impl Stream for PayloadStream {
    type Item = Result<GatewayPayload>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let message = match ready!(self.inner.poll_next_unpin(cx)) {
                Some(Ok(message)) => message,
                Some(Err(err)) => return Poll::Ready(Some(Err(Error::WebSocket(err)))),
                None => return Poll::Ready(None),
            };

            return Poll::Ready(Some(match message {
                Message::Text(text) => self.decoder.decode(text.as_bytes()),
                Message::Binary(bin) => {
                    inflate(&bin).and_then(|json| self.decoder.decode(&json))
                }
                Message::Close(frame) => Err(close_error(frame)),
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Frame(_) => Err(Error::Protocol("unexpected raw frame")),
            }));
        }
    }
}

fn close_error(frame: Option<CloseFrame<'_>>) -> Error {
    match frame {
        Some(frame) => Error::Closed(Some(frame.code.into()), frame.reason.into_owned()),
        None => Error::Closed(None, String::new()),
    }
}

/// JSON-encoded values sent to a WebSocket peer.
#[derive(Debug)]
pub struct PayloadSink {
    inner: SplitSink<WsStream, Message>,
}

impl PayloadSink {
    /// Serialize and send one payload as a text frame.
    pub async fn send<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.inner.send(Message::Text(json)).await?;
        Ok(())
    }

    /// Send a close frame. A non-1000 code leaves the session resumable.
    pub async fn close(&mut self, code: u16) -> Result<()> {
        self.inner
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: "".into(),
            })))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn inflate_round_trip() {
        let payload = br#"{"op":11}"#;
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(payload).unwrap();
        let compressed = encoder.finish().unwrap();

        assert_eq!(inflate(&compressed).unwrap(), payload);
    }
}
