//! The main gateway session: one logical WebSocket connection with
//! heartbeats, identify/resume, reconnection backoff, and event demultiplex.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::dispatch::Dispatcher;
use crate::io::{self, PayloadSink, PayloadStream};
use crate::model::{
    Command, ConnectionProperties, Decoder, Event, GatewayPayload, IdentifyPayload, Intents,
    JsonDecoder, RequestGuildMembersPayload, ResumePayload, UpdatePresencePayload,
    UpdateVoiceStatePayload,
};
use crate::signal::Flag;
use crate::state::StateHook;
use crate::{Error, Result};

const GATEWAY_VERSION: u64 = 6;

/// Close code that leaves the session resumable on the server side.
const RESUMABLE_CLOSE: u16 = 4000;
/// Clean close; the server discards the session.
const NORMAL_CLOSE: u16 = 1000;

const BACKOFF_FLOOR: Duration = Duration::from_secs(1);
const BACKOFF_CEIL: Duration = Duration::from_secs(60);

/// Where a session currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Dialing,
    Identifying,
    Resuming,
    Running,
    Reconnecting,
}

/// Configuration of a [`Session`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bot token.
    pub token: String,
    /// Gateway URL to dial, without query parameters.
    pub gateway_url: String,
    /// Intents to identify with.
    pub intents: Intents,
    /// `[shard_id, num_shards]`, for guild sharding.
    pub shard: Option<[u32; 2]>,
    /// Fingerprint sent with identify.
    pub properties: ConnectionProperties,
    /// Member count past which offline members are elided.
    pub large_threshold: u64,
    /// Reconnect attempts before the session gives up; `None` retries
    /// forever.
    pub max_reconnect_attempts: Option<u32>,
}

impl SessionConfig {
    pub fn new(token: impl Into<String>, gateway_url: impl Into<String>, intents: Intents) -> Self {
        SessionConfig {
            token: token.into(),
            gateway_url: gateway_url.into(),
            intents,
            shard: None,
            properties: ConnectionProperties::default(),
            large_threshold: 250,
            max_reconnect_attempts: None,
        }
    }
}

/// What to remember for resuming a dropped connection.
#[derive(Debug, Clone, Default)]
struct ResumeInfo {
    session_id: String,
    resume_url: Option<String>,
}

enum WriterCmd {
    Payload(Value),
    Close(u16),
}

struct SessionInner {
    config: SessionConfig,
    dispatcher: Dispatcher,
    decoder: Arc<dyn Decoder>,
    state_hook: Option<Arc<dyn StateHook>>,
    pre_handler: Option<Arc<dyn Fn(&Event) + Send + Sync>>,

    state: StdMutex<ConnectionState>,
    resume: StdMutex<ResumeInfo>,
    /// Last sequence number observed; 0 means none yet.
    sequence: AtomicU64,

    /// Sender into the live writer task, when connected.
    commands: StdMutex<Option<mpsc::UnboundedSender<WriterCmd>>>,
    /// Feed into the event pump.
    events: StdMutex<Option<mpsc::UnboundedSender<Event>>>,

    stop: Flag,
}

/// A reconnecting gateway session.
///
/// Events flow: frame → decoder → state hook (synchronous) → dispatcher;
/// derived events follow their originating event through direct dispatch.
pub struct Session {
    inner: Arc<SessionInner>,
    runner: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    pump: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

/// A clonable handle for submitting gateway commands, used by the voice
/// coordinator to send voice-state updates on the main connection.
#[derive(Clone)]
pub struct CommandSender {
    inner: Arc<SessionInner>,
}

impl CommandSender {
    pub fn send(&self, command: &Command) -> Result<()> {
        self.inner.send_command(command)
    }
}

impl Session {
    pub fn new(config: SessionConfig, dispatcher: Dispatcher) -> Session {
        Session {
            inner: Arc::new(SessionInner {
                config,
                dispatcher,
                decoder: Arc::new(JsonDecoder),
                state_hook: None,
                pre_handler: None,
                state: StdMutex::new(ConnectionState::Closed),
                resume: StdMutex::new(ResumeInfo::default()),
                sequence: AtomicU64::new(0),
                commands: StdMutex::new(None),
                events: StdMutex::new(None),
                stop: Flag::new(),
            }),
            runner: StdMutex::new(None),
            pump: StdMutex::new(None),
        }
    }

    /// Replace the frame decoder.
    pub fn with_decoder(mut self, decoder: Arc<dyn Decoder>) -> Session {
        Arc::get_mut(&mut self.inner)
            .expect("with_decoder after open")
            .decoder = decoder;
        self
    }

    /// Install a state hook, run synchronously on every event before
    /// dispatch.
    pub fn with_state(mut self, hook: Arc<dyn StateHook>) -> Session {
        Arc::get_mut(&mut self.inner)
            .expect("with_state after open")
            .state_hook = Some(hook);
        self
    }

    /// Install a pre-handler, run before state mutation for low-level
    /// introspection.
    pub fn with_pre_handler(
        mut self,
        handler: Arc<dyn Fn(&Event) + Send + Sync>,
    ) -> Session {
        Arc::get_mut(&mut self.inner)
            .expect("with_pre_handler after open")
            .pre_handler = Some(handler);
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().expect("session lock poisoned")
    }

    /// A handle for submitting commands from elsewhere.
    pub fn commands(&self) -> CommandSender {
        CommandSender {
            inner: self.inner.clone(),
        }
    }

    /// Dial the gateway and run the session until closed.
    ///
    /// Returns once the first `Ready`/`Resumed` arrives; reading, heartbeats
    /// and reconnection continue on background tasks. A `cancel` tripped
    /// during the dial aborts it; tripped later, it closes the connection
    /// with a resumable code.
    pub async fn open(&self, cancel: Flag) -> Result<()> {
        {
            let mut runner = self.runner.lock().expect("session lock poisoned");
            if runner.as_ref().map(|r| !r.is_finished()).unwrap_or(false) {
                return Err(Error::Other("session already open"));
            }
            *runner = None;
        }

        // The pump drains decoded events to the state hook and dispatcher,
        // keeping the reader free to answer heartbeats.
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        *self.inner.events.lock().expect("session lock poisoned") = Some(events_tx);
        let pump = {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    inner.deliver(event).await;
                }
            })
        };
        *self.pump.lock().expect("session lock poisoned") = Some(pump);

        let (ready_tx, ready_rx) = oneshot::channel();
        let runner = {
            let inner = self.inner.clone();
            tokio::spawn(run_loop(inner, cancel, ready_tx))
        };
        *self.runner.lock().expect("session lock poisoned") = Some(runner);

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Protocol("session ended before becoming ready")),
        }
    }

    /// Gracefully close the session and wait for its tasks to finish.
    pub async fn close(&self) {
        self.inner.stop.trigger();
        let _ = self
            .inner
            .send_writer(WriterCmd::Close(NORMAL_CLOSE));

        let runner = self.runner.lock().expect("session lock poisoned").take();
        if let Some(runner) = runner {
            let _ = runner.await;
        }
        // Dropping the event feed lets the pump drain and stop.
        self.inner.events.lock().expect("session lock poisoned").take();
        let pump = self.pump.lock().expect("session lock poisoned").take();
        if let Some(pump) = pump {
            let _ = pump.await;
        }
        self.inner.set_state(ConnectionState::Closed);
    }

    /// Send a presence update.
    pub fn update_presence(&self, payload: UpdatePresencePayload) -> Result<()> {
        self.inner.send_command(&Command::update_presence(payload))
    }

    /// Ask to join, move within, or leave voice.
    pub fn update_voice_state(&self, payload: UpdateVoiceStatePayload) -> Result<()> {
        self.inner
            .send_command(&Command::update_voice_state(payload))
    }

    /// Request member chunks for a guild.
    pub fn request_guild_members(&self, payload: RequestGuildMembersPayload) -> Result<()> {
        self.inner
            .send_command(&Command::request_guild_members(payload))
    }
}

impl SessionInner {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().expect("session lock poisoned") = state;
    }

    fn send_command(&self, command: &Command) -> Result<()> {
        let value = serde_json::to_value(command)?;
        self.send_writer(WriterCmd::Payload(value))
    }

    fn send_writer(&self, cmd: WriterCmd) -> Result<()> {
        let commands = self.commands.lock().expect("session lock poisoned");
        match commands.as_ref() {
            Some(tx) => tx.send(cmd).map_err(|_| Error::NotConnected),
            None => Err(Error::NotConnected),
        }
    }

    fn remembered_resume(&self) -> Option<(ResumeInfo, u64)> {
        let sequence = self.sequence.load(Ordering::Acquire);
        let resume = self.resume.lock().expect("session lock poisoned").clone();
        if resume.session_id.is_empty() || sequence == 0 {
            None
        } else {
            Some((resume, sequence))
        }
    }

    fn forget_resume(&self) {
        *self.resume.lock().expect("session lock poisoned") = ResumeInfo::default();
        self.sequence.store(0, Ordering::Release);
    }

    fn identify_command(&self) -> Command {
        Command::identify(IdentifyPayload {
            token: self.config.token.clone(),
            intents: self.config.intents,
            compress: false,
            large_threshold: self.config.large_threshold,
            shard: self.config.shard,
            properties: self.config.properties.clone(),
        })
    }

    async fn deliver(&self, event: Event) {
        if let Some(pre) = &self.pre_handler {
            pre(&event);
        }
        let derived = match &self.state_hook {
            Some(hook) => hook.apply(&event),
            None => Vec::new(),
        };
        self.dispatcher.dispatch(&event).await;
        for event in derived {
            self.dispatcher.dispatch_direct(&event).await;
        }
    }

    fn feed_event(&self, event: Event) {
        let events = self.events.lock().expect("session lock poisoned");
        if let Some(tx) = events.as_ref() {
            let _ = tx.send(event);
        }
    }
}

/// Why one connection attempt ended.
enum LoopEnd {
    /// Reconnect and resume.
    Resume,
    /// Reconnect and identify afresh.
    Fresh,
    /// Stop for good.
    Closed,
}

async fn run_loop(
    inner: Arc<SessionInner>,
    cancel: Flag,
    ready_tx: oneshot::Sender<Result<()>>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut attempts: u32 = 0;
    let mut resume_next = true; // remembered_resume() gates actual resumes

    loop {
        let end = run_connection(&inner, &cancel, resume_next, &mut ready_tx, &mut attempts)
            .await;
        match end {
            Ok(LoopEnd::Resume) => resume_next = true,
            Ok(LoopEnd::Fresh) => {
                inner.forget_resume();
                resume_next = false;
            }
            Ok(LoopEnd::Closed) => break,
            Err(err) => {
                if cancel.is_triggered() || inner.stop.is_triggered() {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(Err(Error::Cancelled));
                    }
                    break;
                }
                warn!(error = %err, "gateway connection failed, reconnecting");
                resume_next = true;

                attempts += 1;
                if let Some(max) = inner.config.max_reconnect_attempts {
                    if attempts >= max {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(Err(err));
                        }
                        break;
                    }
                }
                inner.set_state(ConnectionState::Reconnecting);

                // Exponential backoff with full jitter.
                let exp = attempts.saturating_sub(1).min(6);
                let ceiling = (BACKOFF_FLOOR * 2u32.pow(exp)).min(BACKOFF_CEIL);
                let wait =
                    Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64));
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = inner.stop.triggered() => break,
                    _ = cancel.triggered() => break,
                }
            }
        }
    }

    inner.commands.lock().expect("session lock poisoned").take();
    inner.set_state(ConnectionState::Closed);
    if let Some(tx) = ready_tx.take() {
        let _ = tx.send(Err(Error::Closed(None, "session closed".into())));
    }
}

async fn run_connection(
    inner: &Arc<SessionInner>,
    cancel: &Flag,
    try_resume: bool,
    ready_tx: &mut Option<oneshot::Sender<Result<()>>>,
    attempts: &mut u32,
) -> Result<LoopEnd> {
    inner.set_state(ConnectionState::Dialing);

    let resume = if try_resume {
        inner.remembered_resume()
    } else {
        None
    };

    let base_url = resume
        .as_ref()
        .and_then(|(info, _)| info.resume_url.clone())
        .unwrap_or_else(|| inner.config.gateway_url.clone());
    let url = build_gateway_url(&base_url);
    trace!(%url, "dialing gateway");

    let (sink, stream) = tokio::select! {
        connected = io::connect(&url) => connected?,
        _ = cancel.triggered() => return Err(Error::Cancelled),
        _ = inner.stop.triggered() => return Ok(LoopEnd::Closed),
    };

    // Serialized writer; heartbeats outrank queued user commands.
    let (hb_tx, hb_rx) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(writer_task(sink, hb_rx, cmd_rx));
    *inner.commands.lock().expect("session lock poisoned") = Some(cmd_tx.clone());

    let mut stream = PayloadStream::new(stream, inner.decoder.clone());

    // Hello carries the heartbeat interval.
    let hello = tokio::select! {
        frame = stream.next() => match frame {
            Some(frame) => frame?,
            None => return Err(Error::Closed(None, "closed during handshake".into())),
        },
        _ = cancel.triggered() => return Err(Error::Cancelled),
        _ = inner.stop.triggered() => return Ok(LoopEnd::Closed),
    };
    let interval = match hello {
        GatewayPayload::Hello { payload, .. } => Duration::from_millis(payload.heartbeat_interval),
        other => {
            debug!("unexpected payload during handshake: {:?}", other);
            return Err(Error::Protocol("expected hello during handshake"));
        }
    };

    let acked = Arc::new(AtomicBool::new(true));
    let missed = Flag::new();
    let (hb_stop_tx, hb_stop_rx) = oneshot::channel::<()>();
    tokio::spawn(heartbeat_task(
        interval,
        hb_tx.clone(),
        inner.clone(),
        acked.clone(),
        missed.clone(),
        hb_stop_rx,
    ));
    // Stops the heartbeat when this connection winds down, whatever the path.
    let _hb_guard = HeartbeatGuard(Some(hb_stop_tx));

    match &resume {
        Some((info, sequence)) => {
            inner.set_state(ConnectionState::Resuming);
            inner.send_command(&Command::resume(ResumePayload {
                token: inner.config.token.clone(),
                session_id: info.session_id.clone(),
                sequence: *sequence,
            }))?;
        }
        None => {
            inner.set_state(ConnectionState::Identifying);
            inner.send_command(&inner.identify_command())?;
        }
    }

    loop {
        let payload = tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(payload)) => payload,
                Some(Err(Error::Closed(code, reason))) => {
                    debug!(?code, %reason, "gateway closed the connection");
                    return Err(Error::Closed(code, reason));
                }
                Some(Err(err)) => return Err(err),
                None => return Err(Error::Closed(None, "connection ended".into())),
            },
            _ = missed.triggered() => {
                warn!("heartbeat ack missed, tearing down transport");
                return Err(Error::Protocol("heartbeat acknowledgement missed"));
            }
            _ = cancel.triggered() => {
                let _ = inner.send_writer(WriterCmd::Close(RESUMABLE_CLOSE));
                // Wait for the server (or writer) to finish the close.
                let _ = tokio::time::timeout(Duration::from_secs(5), stream.next()).await;
                let _ = writer.await;
                return Ok(LoopEnd::Closed);
            }
            _ = inner.stop.triggered() => {
                let _ = inner.send_writer(WriterCmd::Close(NORMAL_CLOSE));
                let _ = tokio::time::timeout(Duration::from_secs(5), stream.next()).await;
                let _ = writer.await;
                return Ok(LoopEnd::Closed);
            }
        };

        match payload {
            GatewayPayload::Dispatch { dispatch, .. } => {
                inner
                    .sequence
                    .store(dispatch.sequence, Ordering::Release);

                match &dispatch.event {
                    Event::Ready(ready) => {
                        {
                            let mut info =
                                inner.resume.lock().expect("session lock poisoned");
                            info.session_id = ready.session_id.clone();
                            info.resume_url = ready.resume_gateway_url.clone();
                        }
                        inner.set_state(ConnectionState::Running);
                        *attempts = 0;
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(Ok(()));
                        }
                    }
                    Event::Resumed(_) => {
                        trace!("resumed successfully");
                        inner.set_state(ConnectionState::Running);
                        *attempts = 0;
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(Ok(()));
                        }
                    }
                    _ => {}
                }

                inner.feed_event(dispatch.event);
            }
            GatewayPayload::Heartbeat { .. } => {
                let sequence = inner.sequence.load(Ordering::Acquire);
                let beat = Command::heartbeat((sequence > 0).then_some(sequence));
                if let Ok(value) = serde_json::to_value(&beat) {
                    let _ = hb_tx.send(value);
                }
            }
            GatewayPayload::HeartbeatAck { .. } => {
                acked.store(true, Ordering::Release);
            }
            GatewayPayload::Reconnect { .. } => {
                debug!("server requested reconnect");
                return Ok(LoopEnd::Resume);
            }
            GatewayPayload::Hello { .. } => {
                debug!("unexpected hello payload outside handshake");
            }
            GatewayPayload::InvalidSession { resumable, .. } => {
                let state = *inner.state.lock().expect("session lock poisoned");
                if state == ConnectionState::Resuming {
                    // Re-identify on the same connection.
                    debug!("session invalidated during resume, re-identifying");
                    inner.forget_resume();
                    inner.set_state(ConnectionState::Identifying);
                    inner.send_command(&inner.identify_command())?;
                } else if resumable {
                    return Ok(LoopEnd::Resume);
                } else {
                    return Ok(LoopEnd::Fresh);
                }
            }
        }
    }
}

/// Drops the heartbeat task when the owning connection ends.
struct HeartbeatGuard(Option<oneshot::Sender<()>>);

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.0.take();
    }
}

async fn heartbeat_task(
    interval: Duration,
    hb_tx: mpsc::UnboundedSender<Value>,
    inner: Arc<SessionInner>,
    acked: Arc<AtomicBool>,
    missed: Flag,
    mut stop: oneshot::Receiver<()>,
) {
    // The first beat fires early, at 0.7x the declared interval.
    let mut wait = interval.mul_f64(0.7);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = &mut stop => return,
        }
        wait = interval;

        if !acked.swap(false, Ordering::AcqRel) {
            missed.trigger();
            return;
        }

        let sequence = inner.sequence.load(Ordering::Acquire);
        let beat = Command::heartbeat((sequence > 0).then_some(sequence));
        let value = match serde_json::to_value(&beat) {
            Ok(value) => value,
            Err(_) => return,
        };
        if hb_tx.send(value).is_err() {
            return;
        }
    }
}

async fn writer_task(
    mut sink: PayloadSink,
    mut heartbeats: mpsc::UnboundedReceiver<Value>,
    mut commands: mpsc::UnboundedReceiver<WriterCmd>,
) {
    loop {
        tokio::select! {
            biased;

            beat = heartbeats.recv() => match beat {
                Some(value) => {
                    if let Err(err) = sink.send(&value).await {
                        debug!(error = %err, "gateway write failed");
                        return;
                    }
                }
                None => return,
            },
            cmd = commands.recv() => match cmd {
                Some(WriterCmd::Payload(value)) => {
                    if let Err(err) = sink.send(&value).await {
                        debug!(error = %err, "gateway write failed");
                        return;
                    }
                }
                Some(WriterCmd::Close(code)) => {
                    let _ = sink.close(code).await;
                    return;
                }
                None => return,
            },
        }
    }
}

#[inline]
fn build_gateway_url(base: &str) -> String {
    format!(
        "{}?v={}&encoding=json",
        base.trim_end_matches('/'),
        GATEWAY_VERSION
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_url_carries_version() {
        assert_eq!(
            build_gateway_url("wss://gateway.discord.gg/"),
            "wss://gateway.discord.gg?v=6&encoding=json"
        );
    }

    #[test]
    fn heartbeat_serializes_sequence() {
        let beat = Command::heartbeat(Some(12));
        let value = serde_json::to_value(&beat).unwrap();
        assert_eq!(value["op"], 1);
        assert_eq!(value["d"], 12);

        let beat = Command::heartbeat(None);
        let value = serde_json::to_value(&beat).unwrap();
        assert_eq!(value["d"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn commands_error_when_not_connected() {
        let session = Session::new(
            SessionConfig::new("token", "wss://example.invalid", Intents::GUILDS),
            Dispatcher::new(),
        );
        let err = session
            .request_guild_members(RequestGuildMembersPayload {
                guild_id: crate::model::GuildId(1),
                query: String::new(),
                limit: 0,
            })
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn open_aborts_when_cancelled_during_dial() {
        let session = Session::new(
            // A non-routable port; the dial hangs or fails slowly.
            SessionConfig::new("token", "ws://127.0.0.1:9", Intents::GUILDS),
            Dispatcher::new(),
        );
        let cancel = Flag::new();
        cancel.trigger();
        let err = session.open(cancel).await.unwrap_err();
        assert!(err.is_cancelled() || matches!(err, Error::Closed(..)));
        session.close().await;
    }
}
