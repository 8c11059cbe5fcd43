//! The dialed voice UDP socket: IP discovery, send pacing, and sealed RTP
//! framing.

use std::net::SocketAddr;
use std::time::Duration;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use sodiumoxide::crypto::secretbox;
use tokio::net::UdpSocket;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, trace};

use crate::signal::Flag;
use crate::{Error, Result};

/// Size of the IP discovery request and reply.
const DISCOVERY_LEN: usize = 74;
/// Fixed RTP header length.
const HEADER_LEN: usize = 12;
/// Largest datagram read off the socket.
const MAX_PACKET: usize = 1400;

/// Default pacing: one 20 ms frame per packet at 48 kHz.
const DEFAULT_FRAME_TIME: Duration = Duration::from_millis(20);
const DEFAULT_TIMESTAMP_INCR: u32 = 960;

/// One dialed voice media socket bound to a (remote address, SSRC) pair.
///
/// Not safe for concurrent use; the [`UdpManager`](super::UdpManager)
/// serializes access across reconnects.
pub struct UdpConnection {
    socket: UdpSocket,
    ssrc: u32,

    gateway_ip: String,
    gateway_port: u16,

    secret: Option<secretbox::Key>,
    sequence: u16,
    timestamp: u32,
    timestamp_incr: u32,
    pacer: Interval,

    closed: Flag,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,

    /// Opened payload of the last [`read_packet`](Self::read_packet); the
    /// returned packet borrows this until the next call.
    payload: Vec<u8>,
}

impl UdpConnection {
    /// Dial the voice media endpoint and perform IP discovery.
    ///
    /// The externally visible address the server saw is available from
    /// [`gateway_addr`](Self::gateway_addr) afterwards.
    pub async fn dial(addr: SocketAddr, ssrc: u32) -> Result<UdpConnection> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;
        debug!(local = ?socket.local_addr(), remote = %addr, "voice UDP dialed");

        // https://discord.com/developers/docs/topics/voice-connections#ip-discovery
        let mut request = [0u8; DISCOVERY_LEN];
        {
            let mut cursor = &mut request[..];
            cursor.write_u16::<BigEndian>(0x1)?;
            cursor.write_u16::<BigEndian>(70)?;
            cursor.write_u32::<BigEndian>(ssrc)?;
        }
        trace!("sending IP discovery for ssrc {}", ssrc);
        socket.send(&request).await?;

        let mut reply = [0u8; DISCOVERY_LEN];
        let len = socket.recv(&mut reply).await?;
        if len < DISCOVERY_LEN {
            return Err(Error::Protocol("short IP discovery reply"));
        }
        let (gateway_ip, gateway_port) = parse_discovery(&reply)?;
        debug!(%gateway_ip, gateway_port, "IP discovery complete");

        let mut pacer = interval(DEFAULT_FRAME_TIME);
        pacer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(UdpConnection {
            socket,
            ssrc,
            gateway_ip,
            gateway_port,
            secret: None,
            sequence: 0,
            timestamp: 0,
            timestamp_incr: DEFAULT_TIMESTAMP_INCR,
            pacer,
            closed: Flag::new(),
            read_timeout: None,
            write_timeout: None,
            payload: Vec::new(),
        })
    }

    /// The externally visible (address, port) found by IP discovery.
    pub fn gateway_addr(&self) -> (&str, u16) {
        (&self.gateway_ip, self.gateway_port)
    }

    /// The SSRC this connection stamps into outbound packets.
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Install the shared secret. Must happen before the first write or
    /// read.
    pub fn use_secret(&mut self, key: [u8; 32]) {
        self.secret = secretbox::Key::from_slice(&key);
    }

    /// Set the outbound pacer interval and per-packet timestamp increment.
    ///
    /// Valid pairs at 48 kHz: 10 ms↔480, 20 ms↔960, 40 ms↔1920, 60 ms↔2880.
    pub fn reset_frequency(&mut self, frame_time: Duration, timestamp_incr: u32) {
        let mut pacer = interval(frame_time);
        pacer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.pacer = pacer;
        self.timestamp_incr = timestamp_incr;
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.write_timeout = timeout;
    }

    /// Seal one opaque Opus frame and write it as a single RTP datagram.
    ///
    /// Waits for a pacer tick first, so consecutive writes are spaced at
    /// least one frame time apart. On success the full frame length is
    /// reported written.
    pub async fn write(&mut self, frame: &[u8]) -> Result<usize> {
        let secret = self
            .secret
            .as_ref()
            .ok_or(Error::Protocol("no secret installed"))?;

        if self.closed.is_triggered() {
            return Err(Error::Closed(None, "voice connection closed".into()));
        }
        tokio::select! {
            _ = self.pacer.tick() => {}
            _ = self.closed.triggered() => {
                return Err(Error::Closed(None, "voice connection closed".into()))
            }
        }

        let mut packet = Vec::with_capacity(HEADER_LEN + frame.len() + secretbox::MACBYTES);
        packet.extend_from_slice(&[0x80, 0x78]);
        packet.write_u16::<BigEndian>(self.sequence)?;
        packet.write_u32::<BigEndian>(self.timestamp)?;
        packet.write_u32::<BigEndian>(self.ssrc)?;

        // The nonce is the RTP header padded with zeroes.
        let mut nonce = secretbox::Nonce([0; 24]);
        nonce.0[..HEADER_LEN].copy_from_slice(&packet[..HEADER_LEN]);
        packet.extend_from_slice(&secretbox::seal(frame, &nonce, secret));

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.timestamp_incr);

        match self.write_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.socket.send(&packet)).await {
                Ok(sent) => sent?,
                Err(_) => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "voice write timed out",
                    )))
                }
            },
            None => self.socket.send(&packet).await?,
        };
        Ok(frame.len())
    }

    /// Read and open the next voice packet.
    ///
    /// Datagrams that are too short or carry an unexpected first byte are
    /// dropped. A packet that fails to open yields [`Error::Crypto`] without
    /// advancing any state. The returned [`Packet`] borrows this
    /// connection's buffer and is invalidated by the next call; use
    /// [`Packet::to_owned`] to keep it.
    pub async fn read_packet(&mut self) -> Result<Packet<'_>> {
        let secret = self
            .secret
            .clone()
            .ok_or(Error::Protocol("no secret installed"))?;

        loop {
            let mut buf = [0u8; MAX_PACKET];
            let len = tokio::select! {
                received = self.recv_with_timeout(&mut buf) => received?,
                _ = self.closed.triggered() => {
                    return Err(Error::Closed(None, "voice connection closed".into()))
                }
            };
            let data = &buf[..len];

            if len < HEADER_LEN || (data[0] != 0x80 && data[0] != 0x90) {
                trace!(len, "dropping non-RTP datagram");
                continue;
            }

            let mut nonce = secretbox::Nonce([0; 24]);
            nonce.0[..HEADER_LEN].copy_from_slice(&data[..HEADER_LEN]);
            let mut opened =
                secretbox::open(&data[HEADER_LEN..], &nonce, &secret).map_err(|_| Error::Crypto)?;

            let mut header = &data[2..HEADER_LEN];
            let sequence = header.read_u16::<BigEndian>()?;
            let timestamp = header.read_u32::<BigEndian>()?;
            let ssrc = header.read_u32::<BigEndian>()?;

            // Strip the RTP extension header when flagged (and not a marker
            // frame).
            if data[0] & 0x10 != 0 && data[1] & 0x80 == 0 && opened.len() >= 4 {
                let words = (&opened[2..4]).read_u16::<BigEndian>()? as usize;
                let skip = 4 + 4 * words;
                if skip <= opened.len() {
                    opened.drain(..skip);
                }
            }

            self.payload = opened;
            return Ok(Packet {
                kind: data[0],
                payload_type: data[1],
                sequence,
                timestamp,
                ssrc,
                payload: &self.payload,
            });
        }
    }

    async fn recv_with_timeout(&self, buf: &mut [u8]) -> Result<usize> {
        match self.read_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.socket.recv(buf)).await {
                Ok(received) => Ok(received?),
                Err(_) => Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "voice read timed out",
                ))),
            },
            None => Ok(self.socket.recv(buf).await?),
        }
    }

    /// Send the 4-byte SSRC keepalive that holds the media path open.
    pub async fn keepalive(&self) -> Result<()> {
        let mut bytes = [0u8; 4];
        (&mut bytes[..]).write_u32::<BigEndian>(self.ssrc)?;
        self.socket.send(&bytes).await?;
        Ok(())
    }

    /// Stop the pacer and wake blocked reads and writes. Idempotent; the
    /// socket itself is released on drop.
    pub fn close(&self) {
        self.closed.trigger();
    }
}

fn parse_discovery(reply: &[u8]) -> Result<(String, u16)> {
    let addr = &reply[8..72];
    let end = addr.iter().position(|&b| b == 0).unwrap_or(addr.len());
    let ip = std::str::from_utf8(&addr[..end])
        .map_err(|_| Error::Protocol("non-ASCII discovery address"))?
        .to_owned();
    let port = (&reply[72..74]).read_u16::<LittleEndian>()?;
    Ok((ip, port))
}

/// One received voice packet, borrowing the connection's read buffer.
#[derive(Debug)]
pub struct Packet<'a> {
    /// First RTP header byte (version and flags).
    pub kind: u8,
    /// Second RTP header byte (payload type).
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    /// The opened Opus frame.
    pub payload: &'a [u8],
}

impl Packet<'_> {
    /// Copy the packet out of the connection's buffer.
    pub fn to_owned(&self) -> OwnedPacket {
        OwnedPacket {
            kind: self.kind,
            payload_type: self.payload_type,
            sequence: self.sequence,
            timestamp: self.timestamp,
            ssrc: self.ssrc,
            payload: self.payload.to_vec(),
        }
    }
}

/// A [`Packet`] detached from the connection's buffer.
#[derive(Debug, Clone)]
pub struct OwnedPacket {
    pub kind: u8,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Vec<u8>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A fake voice media server that answers IP discovery and forwards
    /// every later datagram to the returned channel.
    pub(crate) async fn discovery_peer(
        ip: &'static str,
        port: u16,
    ) -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>) {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = peer.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut buf = [0u8; MAX_PACKET];
            loop {
                let Ok((len, from)) = peer.recv_from(&mut buf).await else {
                    return;
                };
                let data = &buf[..len];
                if len == DISCOVERY_LEN && data[0] == 0 && data[1] == 1 {
                    let mut reply = [0u8; DISCOVERY_LEN];
                    reply[..8].copy_from_slice(&data[..8]);
                    reply[1] = 2;
                    reply[8..8 + ip.len()].copy_from_slice(ip.as_bytes());
                    (&mut reply[72..74]).write_u16::<LittleEndian>(port).unwrap();
                    let _ = peer.send_to(&reply, from).await;
                } else if tx.send(data.to_vec()).is_err() {
                    return;
                }
            }
        });

        (addr, rx)
    }

    pub(crate) fn test_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = i as u8 + 1;
        }
        key
    }

    #[tokio::test]
    async fn discovery_round_trip() {
        let (addr, _media) = discovery_peer("203.0.113.5", 8080).await;
        let conn = UdpConnection::dial(addr, 7).await.unwrap();
        assert_eq!(conn.gateway_addr(), ("203.0.113.5", 8080));
        assert_eq!(conn.ssrc(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn rtp_packetization() {
        let (addr, mut media) = discovery_peer("198.51.100.1", 4000).await;
        let mut conn = UdpConnection::dial(addr, 0x11223344).await.unwrap();
        conn.use_secret(test_key());

        for _ in 0..3 {
            let written = conn.write(&[0xAA, 0xBB]).await.unwrap();
            assert_eq!(written, 2);
        }

        let key = secretbox::Key::from_slice(&test_key()).unwrap();
        for (index, expected_ts) in [(0u16, 0u32), (1, 960), (2, 1920)] {
            let frame = media.recv().await.unwrap();
            assert_eq!(frame[0], 0x80);
            assert_eq!(frame[1], 0x78);
            assert_eq!((&frame[2..4]).read_u16::<BigEndian>().unwrap(), index);
            assert_eq!((&frame[4..8]).read_u32::<BigEndian>().unwrap(), expected_ts);
            assert_eq!((&frame[8..12]).read_u32::<BigEndian>().unwrap(), 0x11223344);

            let mut nonce = secretbox::Nonce([0; 24]);
            nonce.0[..HEADER_LEN].copy_from_slice(&frame[..HEADER_LEN]);
            let opened = secretbox::open(&frame[HEADER_LEN..], &nonce, &key).unwrap();
            assert_eq!(opened, vec![0xAA, 0xBB]);
        }
    }

    /// A connection wired straight to a peer socket, skipping discovery.
    /// Connected UDP sockets only accept datagrams from their peer, so the
    /// inbound tests need the sender to *be* that peer.
    async fn udp_pair() -> (UdpConnection, UdpSocket) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(b.local_addr().unwrap()).await.unwrap();
        b.connect(a.local_addr().unwrap()).await.unwrap();

        let mut pacer = interval(DEFAULT_FRAME_TIME);
        pacer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut conn = UdpConnection {
            socket: a,
            ssrc: 9,
            gateway_ip: "127.0.0.1".into(),
            gateway_port: 0,
            secret: None,
            sequence: 0,
            timestamp: 0,
            timestamp_incr: DEFAULT_TIMESTAMP_INCR,
            pacer,
            closed: Flag::new(),
            read_timeout: None,
            write_timeout: None,
            payload: Vec::new(),
        };
        conn.use_secret(test_key());
        (conn, b)
    }

    fn seal_packet(first: u8, second: u8, sequence: u16, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![first, second];
        packet.write_u16::<BigEndian>(sequence).unwrap();
        packet.write_u32::<BigEndian>(100).unwrap();
        packet.write_u32::<BigEndian>(55).unwrap();
        let mut nonce = secretbox::Nonce([0; 24]);
        nonce.0[..HEADER_LEN].copy_from_slice(&packet[..HEADER_LEN]);
        let key = secretbox::Key::from_slice(&test_key()).unwrap();
        packet.extend_from_slice(&secretbox::seal(payload, &nonce, &key));
        packet
    }

    #[tokio::test]
    async fn read_drops_foreign_frames() {
        let (mut conn, sender) = udp_pair().await;
        sender.send(&[0x01, 0x02, 0x03]).await.unwrap(); // bad first byte
        sender.send(&[0x80; 4]).await.unwrap(); // too short
        sender
            .send(&seal_packet(0x80, 0x78, 3, b"voice"))
            .await
            .unwrap();

        let packet = conn.read_packet().await.unwrap();
        assert_eq!(packet.sequence, 3);
        assert_eq!(packet.ssrc, 55);
        assert_eq!(packet.payload, b"voice");
    }

    #[tokio::test]
    async fn read_reports_crypto_failure() {
        let (mut conn, sender) = udp_pair().await;
        let mut bogus = vec![0x80, 0x78];
        bogus.extend_from_slice(&[0; 10]);
        bogus.extend_from_slice(b"not actually sealed data");
        sender.send(&bogus).await.unwrap();

        assert!(matches!(conn.read_packet().await, Err(Error::Crypto)));
    }

    #[tokio::test]
    async fn read_strips_extension_header() {
        let (mut conn, sender) = udp_pair().await;
        // One extension word: 2 bytes profile, u16 length = 1, 4 bytes data.
        let mut payload = vec![0xBE, 0xDE, 0x00, 0x01, 1, 2, 3, 4];
        payload.extend_from_slice(b"opus");
        sender
            .send(&seal_packet(0x90, 0x78, 1, &payload))
            .await
            .unwrap();

        let packet = conn.read_packet().await.unwrap();
        assert_eq!(packet.payload, b"opus");
    }

    #[tokio::test]
    async fn close_unblocks_write() {
        let (addr, _media) = discovery_peer("198.51.100.1", 4000).await;
        let mut conn = UdpConnection::dial(addr, 9).await.unwrap();
        conn.use_secret(test_key());
        conn.close();
        conn.close(); // idempotent

        // The pacer never fires once closed.
        let result = conn.write(&[1]).await;
        assert!(matches!(result, Err(Error::Closed(..))));
    }
}
