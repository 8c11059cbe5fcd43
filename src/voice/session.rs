//! The voice gateway session: a WebSocket control plane for one call,
//! driving the UDP manager through discovery, key exchange, and migrations.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::UdpManager;
use crate::io::{self, JsonStream, PayloadSink};
use crate::model::{GuildId, UserId, VoicePayload, VoiceState};
use crate::signal::Flag;
use crate::{Error, Result};

const VOICE_GATEWAY_VERSION: u64 = 4;
const ENCRYPTION_MODE: &str = "xsalsa20_poly1305";

/// Interval of the 4-byte UDP keepalive while a call is up.
const UDP_KEEPALIVE: Duration = Duration::from_secs(5);

const BACKOFF_FLOOR: Duration = Duration::from_secs(1);
const BACKOFF_CEIL: Duration = Duration::from_secs(60);

enum Control {
    Connect {
        endpoint: String,
        token: String,
        session_id: String,
        resume: bool,
    },
    Disconnect,
}

struct VoiceInner {
    guild_id: GuildId,
    user_id: UserId,
    udp: UdpManager,

    /// Writer of the active voice WebSocket, when connected.
    ws_commands: StdMutex<Option<mpsc::UnboundedSender<Value>>>,
    /// Our SSRC, once the voice handshake delivered it.
    ssrc: AtomicU32,
    stop: Flag,
}

/// The session-id / server-token pairing; a call can only start once both
/// halves have arrived on the main gateway.
#[derive(Default)]
struct Pairing {
    session_id: Option<String>,
    server: Option<(String, String)>,
    connected: bool,
}

/// A WebSocket+UDP pair bound to one guild's voice call.
pub struct VoiceSession {
    inner: Arc<VoiceInner>,
    control: mpsc::UnboundedSender<Control>,
    pairing: StdMutex<Pairing>,
}

impl VoiceSession {
    /// Create a session. It stays idle until the main gateway delivers the
    /// voice-state and voice-server halves via
    /// [`update_state`](Self::update_state) /
    /// [`update_server`](Self::update_server).
    pub fn new(guild_id: GuildId, user_id: UserId) -> VoiceSession {
        let inner = Arc::new(VoiceInner {
            guild_id,
            user_id,
            udp: UdpManager::new(),
            ws_commands: StdMutex::new(None),
            ssrc: AtomicU32::new(0),
            stop: Flag::new(),
        });
        let (control, control_rx) = mpsc::unbounded_channel();
        tokio::spawn(runner(inner.clone(), control_rx));
        VoiceSession {
            inner,
            control,
            pairing: StdMutex::new(Pairing::default()),
        }
    }

    /// The media pipe. Writes block while the session migrates servers.
    pub fn udp(&self) -> &UdpManager {
        &self.inner.udp
    }

    pub fn guild_id(&self) -> GuildId {
        self.inner.guild_id
    }

    /// Route the own user's voice-state update into the pairing.
    pub fn update_state(&self, state: &VoiceState) {
        if state.user_id != self.inner.user_id {
            return;
        }
        let mut pairing = self.pairing.lock().expect("voice lock poisoned");
        if state.channel_id.is_some() {
            pairing.session_id = Some(state.session_id.clone());
            self.try_connect(&mut pairing);
        } else {
            pairing.session_id = None;
            pairing.connected = false;
            let _ = self.control.send(Control::Disconnect);
        }
    }

    /// Route a voice-server update into the pairing. An absent endpoint
    /// means the current server went away; the session waits for the next
    /// update.
    pub fn update_server(&self, endpoint: Option<&str>, token: &str) {
        let mut pairing = self.pairing.lock().expect("voice lock poisoned");
        match endpoint {
            Some(endpoint) => {
                pairing.server = Some((endpoint.to_owned(), token.to_owned()));
                self.try_connect(&mut pairing);
            }
            None => {
                let _ = self.control.send(Control::Disconnect);
            }
        }
    }

    fn try_connect(&self, pairing: &mut Pairing) {
        let (Some(session_id), Some((endpoint, token))) =
            (pairing.session_id.clone(), pairing.server.clone())
        else {
            return;
        };
        let resume = pairing.connected;
        pairing.connected = true;
        let _ = self.control.send(Control::Connect {
            endpoint,
            token,
            session_id,
            resume,
        });
    }

    /// Send the speaking command for our SSRC.
    pub fn speaking(&self, speaking: bool) -> Result<()> {
        let ssrc = self.inner.ssrc.load(Ordering::Acquire);
        self.inner.send_ws(json!({
            "op": 5,
            "d": {
                "speaking": if speaking { 1 } else { 0 },
                "delay": 0,
                "ssrc": ssrc,
            }
        }))
    }

    /// Tear the call down for good. The UDP manager closes with it.
    pub fn close(&self) {
        let _ = self.control.send(Control::Disconnect);
        self.inner.stop.trigger();
        self.inner.udp.close();
    }
}

impl VoiceInner {
    fn send_ws(&self, value: Value) -> Result<()> {
        let commands = self.ws_commands.lock().expect("voice lock poisoned");
        match commands.as_ref() {
            Some(tx) => tx.send(value).map_err(|_| Error::NotConnected),
            None => Err(Error::NotConnected),
        }
    }
}

/// Owns the per-session call task, replacing it as connect/disconnect
/// control arrives.
async fn runner(inner: Arc<VoiceInner>, mut control: mpsc::UnboundedReceiver<Control>) {
    let mut call: Option<(Flag, tokio::task::JoinHandle<()>)> = None;

    while let Some(message) = control.recv().await {
        // A newer control message supersedes the running call.
        if let Some((call_stop, handle)) = call.take() {
            call_stop.trigger();
            let _ = handle.await;
        }
        if inner.stop.is_triggered() {
            break;
        }

        match message {
            Control::Connect {
                endpoint,
                token,
                session_id,
                resume,
            } => {
                let call_stop = Flag::new();
                let handle = tokio::spawn(run_call(
                    inner.clone(),
                    endpoint,
                    token,
                    session_id,
                    resume,
                    call_stop.clone(),
                ));
                call = Some((call_stop, handle));
            }
            Control::Disconnect => {}
        }
    }

    if let Some((call_stop, handle)) = call.take() {
        call_stop.trigger();
        let _ = handle.await;
    }
}

/// One call connection, reconnecting with backoff until stopped.
async fn run_call(
    inner: Arc<VoiceInner>,
    endpoint: String,
    token: String,
    session_id: String,
    mut resume: bool,
    call_stop: Flag,
) {
    let mut attempts: u32 = 0;
    loop {
        match run_call_once(&inner, &endpoint, &token, &session_id, resume, &call_stop).await {
            Ok(()) => return,
            Err(err) => {
                if call_stop.is_triggered() || inner.stop.is_triggered() {
                    return;
                }
                warn!(error = %err, "voice connection failed, reconnecting");
                attempts += 1;
                // Resumes that keep failing give way to a fresh identify.
                resume = attempts < 2;

                let exp = attempts.saturating_sub(1).min(6);
                let ceiling = (BACKOFF_FLOOR * 2u32.pow(exp)).min(BACKOFF_CEIL);
                let wait = Duration::from_millis(
                    rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64),
                );
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = call_stop.triggered() => return,
                    _ = inner.stop.triggered() => return,
                }
            }
        }
    }
}

async fn run_call_once(
    inner: &Arc<VoiceInner>,
    endpoint: &str,
    token: &str,
    session_id: &str,
    resume: bool,
    call_stop: &Flag,
) -> Result<()> {
    // Pending user writes block, never fail, while we renegotiate.
    let paused_here = match inner.udp.pause(call_stop).await {
        Ok(()) => true,
        Err(Error::Other(_)) => false, // already paused by an earlier attempt
        Err(err) => return Err(err),
    };
    let _ = paused_here;

    let url = build_voice_url(endpoint);
    trace!(%url, "dialing voice gateway");
    let (mut sink, stream) = tokio::select! {
        connected = io::connect(&url) => connected?,
        _ = call_stop.triggered() => return Err(Error::Cancelled),
        _ = inner.stop.triggered() => return Err(Error::Cancelled),
    };
    let mut stream = JsonStream::<VoicePayload>::new(stream);

    // Identify (or resume) before anything else.
    let handshake = if resume {
        json!({
            "op": 7,
            "d": {
                "server_id": inner.guild_id,
                "session_id": session_id,
                "token": token,
            }
        })
    } else {
        json!({
            "op": 0,
            "d": {
                "server_id": inner.guild_id,
                "user_id": inner.user_id,
                "session_id": session_id,
                "token": token,
            }
        })
    };
    sink.send(&handshake).await?;

    // Serialized writer; voice heartbeats outrank queued commands.
    let (hb_tx, hb_rx) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    tokio::spawn(voice_writer(sink, hb_rx, cmd_rx));
    *inner.ws_commands.lock().expect("voice lock poisoned") = Some(cmd_tx);

    let acked = Arc::new(AtomicBool::new(true));
    let missed = Flag::new();
    let mut heartbeat_running = false;

    let mut keepalive = tokio::time::interval(UDP_KEEPALIVE);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut media_up = false;

    loop {
        let payload = tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(payload)) => payload,
                Some(Err(err)) => return Err(err),
                None => return Err(Error::Closed(None, "voice connection ended".into())),
            },
            _ = missed.triggered() => {
                return Err(Error::Protocol("voice heartbeat acknowledgement missed"));
            }
            _ = keepalive.tick(), if media_up => {
                let _ = inner.udp.keepalive().await;
                continue;
            }
            _ = call_stop.triggered() => return Ok(()),
            _ = inner.stop.triggered() => return Ok(()),
        };

        match payload {
            VoicePayload::Hello { payload, .. } => {
                if !heartbeat_running {
                    heartbeat_running = true;
                    let interval =
                        Duration::from_millis(payload.heartbeat_interval.max(1.0) as u64);
                    tokio::spawn(voice_heartbeat(
                        interval,
                        hb_tx.clone(),
                        acked.clone(),
                        missed.clone(),
                        call_stop.clone(),
                    ));
                }
            }
            VoicePayload::Ready { payload, .. } => {
                debug!(ssrc = payload.ssrc, "voice ready, starting IP discovery");
                inner.ssrc.store(payload.ssrc, Ordering::Release);
                if !payload.modes.iter().any(|m| m == ENCRYPTION_MODE) {
                    return Err(Error::Protocol("xsalsa20_poly1305 unavailable"));
                }

                let addr = tokio::net::lookup_host((payload.ip.as_str(), payload.port))
                    .await?
                    .next()
                    .ok_or(Error::Protocol("failed to resolve voice host"))?;
                let (address, port) = inner.udp.dial(call_stop, addr, payload.ssrc).await?;

                inner.send_ws(json!({
                    "op": 1,
                    "d": {
                        "protocol": "udp",
                        "data": {
                            "address": address,
                            "port": port,
                            "mode": ENCRYPTION_MODE,
                        }
                    }
                }))?;
            }
            VoicePayload::SessionDescription { payload, .. } => {
                if payload.mode != ENCRYPTION_MODE {
                    return Err(Error::Protocol("unexpected encryption mode selected"));
                }
                let key: [u8; 32] = payload
                    .secret_key
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Protocol("secret key is not 32 bytes"))?;
                inner.udp.use_secret(key).await?;
                inner.udp.unpause();
                media_up = true;
                debug!("voice media path established");
            }
            VoicePayload::Resumed { .. } => {
                // Same server, same key; media can flow again.
                trace!("voice session resumed");
                inner.udp.unpause();
                media_up = true;
            }
            VoicePayload::HeartbeatAck { .. } => {
                acked.store(true, Ordering::Release);
            }
            VoicePayload::Speaking { payload, .. } => {
                trace!(ssrc = payload.ssrc, speaking = payload.speaking, "speaking update");
            }
            VoicePayload::ClientDisconnect { payload, .. } => {
                trace!(user = %payload.user_id, "client disconnected from voice");
            }
            VoicePayload::Unknown(value) => {
                debug!("unknown voice payload: {}", value);
            }
        }
    }
}

async fn voice_heartbeat(
    interval: Duration,
    hb_tx: mpsc::UnboundedSender<Value>,
    acked: Arc<AtomicBool>,
    missed: Flag,
    stop: Flag,
) {
    let nonce = AtomicU64::new(0);
    let mut wait = interval.mul_f64(0.7);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = stop.triggered() => return,
        }
        wait = interval;

        if !acked.swap(false, Ordering::AcqRel) {
            missed.trigger();
            return;
        }
        let beat = json!({
            "op": 3,
            "d": nonce.fetch_add(1, Ordering::Relaxed),
        });
        if hb_tx.send(beat).is_err() {
            return;
        }
    }
}

async fn voice_writer(
    mut sink: PayloadSink,
    mut heartbeats: mpsc::UnboundedReceiver<Value>,
    mut commands: mpsc::UnboundedReceiver<Value>,
) {
    loop {
        tokio::select! {
            biased;

            beat = heartbeats.recv() => match beat {
                Some(value) => {
                    if sink.send(&value).await.is_err() {
                        return;
                    }
                }
                None => return,
            },
            cmd = commands.recv() => match cmd {
                Some(value) => {
                    if sink.send(&value).await.is_err() {
                        return;
                    }
                }
                None => return,
            },
        }
    }
}

fn build_voice_url(endpoint: &str) -> String {
    let endpoint = endpoint.strip_suffix(":80").unwrap_or(endpoint);
    format!("wss://{}?v={}", endpoint, VOICE_GATEWAY_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voice_url_strips_legacy_port() {
        assert_eq!(
            build_voice_url("smart.loyal.discord.media:80"),
            "wss://smart.loyal.discord.media?v=4"
        );
        assert_eq!(
            build_voice_url("smart.loyal.discord.media"),
            "wss://smart.loyal.discord.media?v=4"
        );
    }

    #[tokio::test]
    async fn pairing_connects_only_when_both_halves_arrive() {
        let session = VoiceSession::new(GuildId(1), UserId(2));

        // Server half alone does nothing.
        session.update_server(Some("endpoint.example:80"), "tok");
        assert!(!session.pairing.lock().unwrap().connected);

        // A foreign user's state is ignored.
        let foreign: VoiceState = serde_json::from_value(serde_json::json!({
            "user_id": "99", "channel_id": "5", "session_id": "zzz"
        }))
        .unwrap();
        session.update_state(&foreign);
        assert!(!session.pairing.lock().unwrap().connected);

        // Our own state completes the pairing.
        let own: VoiceState = serde_json::from_value(serde_json::json!({
            "user_id": "2", "channel_id": "5", "session_id": "abc"
        }))
        .unwrap();
        session.update_state(&own);
        assert!(session.pairing.lock().unwrap().connected);

        session.close();
    }

    #[tokio::test]
    async fn leaving_voice_clears_the_pairing() {
        let session = VoiceSession::new(GuildId(1), UserId(2));
        let own_leave: VoiceState = serde_json::from_value(serde_json::json!({
            "user_id": "2", "channel_id": null, "session_id": "abc"
        }))
        .unwrap();
        session.update_state(&own_leave);
        let pairing = session.pairing.lock().unwrap();
        assert!(pairing.session_id.is_none());
        assert!(!pairing.connected);
        drop(pairing);
        session.close();
    }
}
