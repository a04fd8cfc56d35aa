//! Session protocol shared by every transport.
//!
//! A [`Transport`] only moves frames: it connects, reports
//! [`NetEvent`]s and executes [`NetCommand`]s. Everything else (hello
//! handshake, session id, goodbye handling, control messages) lives in
//! [`Protocol`], which normalizes the link into [`ProtocolEvent`]s.

pub mod mqtt;
pub mod websocket;

use crate::config::{Config, HelloConfig, TransportKind};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// How long a local close waits for the link to flush goodbye and exit.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub enum NetEvent {
    Connected,
    Disconnected,
    Text(String),
    Binary(Bytes),
    /// The link gave up; no further events follow.
    Error(String),
}

#[derive(Debug, Clone)]
pub enum NetCommand {
    SendText(String),
    SendBinary(Bytes),
    Close,
}

#[async_trait]
pub trait Transport: Send {
    /// Value announced in the hello's `transport` field.
    fn hello_transport(&self) -> &'static str;

    /// Whether binary audio frames can be sent over this link.
    fn carries_audio(&self) -> bool {
        true
    }

    /// Drive the link until a local `Close`, the command channel closing, or
    /// a terminal error.
    async fn run(self: Box<Self>, events: mpsc::Sender<NetEvent>, commands: mpsc::Receiver<NetCommand>);
}

pub type TransportFactory = Arc<dyn Fn() -> Box<dyn Transport> + Send + Sync>;

/// Factory for the transport named in the configuration.
pub fn transport_factory(config: &Config) -> TransportFactory {
    match config.network.transport {
        TransportKind::WebSocket => {
            let network = config.network.clone();
            Arc::new(move || Box::new(websocket::WebSocketTransport::new(&network)) as Box<dyn Transport>)
        }
        TransportKind::Mqtt => {
            let mqtt = config.mqtt.clone();
            let timeout = config.network.connect_timeout;
            Arc::new(move || Box::new(mqtt::MqttTransport::new(&mqtt, timeout)) as Box<dyn Transport>)
        }
    }
}

// ======================== Messages ========================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListeningMode {
    #[serde(rename = "realtime")]
    Realtime,
    #[serde(rename = "auto")]
    AutoStop,
    #[serde(rename = "manual")]
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    WakeWordDetected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum ListenState {
    Start,
    Stop,
    Detect,
}

// 音频参数结构体
#[derive(Serialize)]
struct AudioParams<'a> {
    format: &'a str,
    sample_rate: u32,
    channels: u8,
    frame_duration: u32,
}

// Features 声明结构体，用于告知服务端设备支持的能力
#[derive(Serialize)]
struct Features {
    mcp: bool,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage<'a> {
    Hello {
        version: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        features: Option<Features>,
        transport: &'a str,
        audio_params: AudioParams<'a>,
    },
    Listen {
        session_id: &'a str,
        state: ListenState,
        #[serde(skip_serializing_if = "Option::is_none")]
        mode: Option<ListeningMode>,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<&'a str>,
    },
    Abort {
        session_id: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<AbortReason>,
    },
    Goodbye {
        session_id: &'a str,
    },
}

impl ClientMessage<'_> {
    fn to_json(&self) -> String {
        // Plain structs of strings and numbers always serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Typed view of the inbound directives the controller acts on.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub state: Option<String>,
    pub text: Option<String>,
    pub emotion: Option<String>,
    pub session_id: Option<String>,
}

impl ServerMessage {
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// UDP audio parameters offered in a server hello.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct UdpParams {
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub nonce: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    IncomingJson(Value),
    IncomingAudio(Bytes),
    AudioChannelOpened,
    AudioChannelClosed,
    NetworkError(String),
}

// ======================== Session state ========================

#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkStatus {
    Idle,
    Connecting,
    Open(String),
    Failed(String),
}

struct Session {
    status: watch::Sender<LinkStatus>,
    connected: AtomicBool,
    udp: Mutex<Option<UdpParams>>,
}

impl Session {
    fn session_id(&self) -> Option<String> {
        match &*self.status.borrow() {
            LinkStatus::Open(id) => Some(id.clone()),
            _ => None,
        }
    }

    fn set_udp(&self, udp: Option<UdpParams>) {
        *self.udp.lock().unwrap_or_else(|p| p.into_inner()) = udp;
    }

    /// Leave the open state. True when a session was actually open.
    fn end(&self, next: LinkStatus) -> bool {
        let mut was_open = false;
        self.status.send_modify(|status| {
            was_open = matches!(status, LinkStatus::Open(_));
            if was_open || *status == LinkStatus::Connecting {
                *status = next;
            }
        });
        if was_open {
            self.set_udp(None);
        }
        was_open
    }
}

struct Link {
    commands: mpsc::Sender<NetCommand>,
    transport: JoinHandle<()>,
    pump: JoinHandle<()>,
}

pub struct Protocol {
    hello: HelloConfig,
    version: u8,
    hello_timeout: Duration,
    factory: TransportFactory,
    events: mpsc::Sender<ProtocolEvent>,
    session: Arc<Session>,
    link: Option<Link>,
    carries_audio: bool,
}

impl Protocol {
    pub fn new(config: &Config, factory: TransportFactory) -> (Self, mpsc::Receiver<ProtocolEvent>) {
        let (events, events_rx) = mpsc::channel(256);
        let (status, _) = watch::channel(LinkStatus::Idle);
        let protocol = Self {
            hello: config.hello.clone(),
            version: config.network.protocol_version,
            hello_timeout: config.network.hello_timeout,
            factory,
            events,
            session: Arc::new(Session {
                status,
                connected: AtomicBool::new(false),
                udp: Mutex::new(None),
            }),
            link: None,
            carries_audio: true,
        };
        (protocol, events_rx)
    }

    pub fn is_audio_channel_opened(&self) -> bool {
        self.link.is_some() && self.session.connected.load(Ordering::SeqCst) && self.session.session_id().is_some()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.session_id()
    }

    pub fn udp_params(&self) -> Option<UdpParams> {
        self.session.udp.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Connect and complete the hello handshake. True once the server hello
    /// has arrived; false on link failure or hello timeout.
    pub async fn open_audio_channel(&mut self) -> bool {
        if self.is_audio_channel_opened() {
            return true;
        }
        // A half-open link (reconnecting, or never got its hello) is replaced.
        self.teardown(false).await;

        let transport = (self.factory)();
        self.carries_audio = transport.carries_audio();
        let hello = ClientMessage::Hello {
            version: self.version,
            features: self.hello.mcp.then_some(Features { mcp: true }),
            transport: transport.hello_transport(),
            audio_params: AudioParams {
                format: &self.hello.format,
                sample_rate: self.hello.sample_rate,
                channels: self.hello.channels,
                frame_duration: self.hello.frame_duration,
            },
        }
        .to_json();

        let mut status_rx = self.session.status.subscribe();
        self.session.status.send_replace(LinkStatus::Connecting);

        let (cmd_tx, cmd_rx) = mpsc::channel(100);
        let (net_tx, net_rx) = mpsc::channel(100);
        let transport = tokio::spawn(transport.run(net_tx, cmd_rx));
        let pump = tokio::spawn(pump(
            net_rx,
            cmd_tx.clone(),
            hello,
            self.session.clone(),
            self.events.clone(),
        ));
        self.link = Some(Link {
            commands: cmd_tx,
            transport,
            pump,
        });

        let outcome = tokio::time::timeout(
            self.hello_timeout,
            status_rx.wait_for(|s| !matches!(s, LinkStatus::Connecting)),
        )
        .await
        .map(|r| r.map(|s| s.clone()));

        match outcome {
            Ok(Ok(LinkStatus::Open(session_id))) => {
                log::info!("Audio channel opened, session_id={}", session_id);
                true
            }
            Ok(Ok(LinkStatus::Failed(e))) => {
                log::error!("Failed to open audio channel: {}", e);
                self.teardown(false).await;
                false
            }
            Ok(_) => {
                log::error!("Audio channel closed during handshake");
                self.teardown(false).await;
                false
            }
            Err(_) => {
                log::error!("Server hello timeout after {:?}", self.hello_timeout);
                self.emit(ProtocolEvent::NetworkError("Server hello timeout".to_string())).await;
                self.teardown(false).await;
                false
            }
        }
    }

    /// Send goodbye if a session is open, stop the link and report the
    /// channel closed. Safe to call repeatedly.
    pub async fn close_audio_channel(&mut self) {
        self.teardown(true).await;
    }

    async fn teardown(&mut self, say_goodbye: bool) {
        let Some(link) = self.link.take() else {
            return;
        };

        if say_goodbye && self.session.connected.load(Ordering::SeqCst) {
            if let Some(session_id) = self.session.session_id() {
                let goodbye = ClientMessage::Goodbye {
                    session_id: &session_id,
                }
                .to_json();
                let _ = link.commands.send(NetCommand::SendText(goodbye)).await;
            }
        }
        let _ = link.commands.send(NetCommand::Close).await;
        drop(link.commands);

        let mut transport = link.transport;
        if tokio::time::timeout(CLOSE_GRACE, &mut transport).await.is_err() {
            log::warn!("Transport did not stop in time, aborting it");
            transport.abort();
        }
        if let Err(e) = link.pump.await {
            log::warn!("Protocol pump ended abnormally: {}", e);
        }

        self.session.connected.store(false, Ordering::SeqCst);
        if self.session.end(LinkStatus::Idle) {
            self.emit(ProtocolEvent::AudioChannelClosed).await;
        }
        self.session.status.send_replace(LinkStatus::Idle);
    }

    async fn emit(&self, event: ProtocolEvent) {
        if self.events.send(event).await.is_err() {
            log::debug!("Protocol event receiver dropped");
        }
    }

    /// Queue a text frame. False when no link is connected.
    pub async fn send_text(&self, text: String) -> bool {
        self.send(NetCommand::SendText(text)).await
    }

    /// Queue a binary audio frame. False when no link is connected or the
    /// transport cannot carry audio.
    pub async fn send_audio(&self, frame: Bytes) -> bool {
        if !self.carries_audio {
            return false;
        }
        self.send(NetCommand::SendBinary(frame)).await
    }

    async fn send(&self, command: NetCommand) -> bool {
        let Some(link) = &self.link else {
            return false;
        };
        if !self.session.connected.load(Ordering::SeqCst) {
            return false;
        }
        link.commands.send(command).await.is_ok()
    }

    pub async fn send_start_listening(&self, mode: ListeningMode) -> bool {
        let session_id = self.session_id().unwrap_or_default();
        let msg = ClientMessage::Listen {
            session_id: &session_id,
            state: ListenState::Start,
            mode: Some(mode),
            text: None,
        };
        self.send_text(msg.to_json()).await
    }

    pub async fn send_stop_listening(&self) -> bool {
        let session_id = self.session_id().unwrap_or_default();
        let msg = ClientMessage::Listen {
            session_id: &session_id,
            state: ListenState::Stop,
            mode: None,
            text: None,
        };
        self.send_text(msg.to_json()).await
    }

    pub async fn send_wake_word_detected(&self, text: &str) -> bool {
        let session_id = self.session_id().unwrap_or_default();
        let msg = ClientMessage::Listen {
            session_id: &session_id,
            state: ListenState::Detect,
            mode: None,
            text: Some(text),
        };
        self.send_text(msg.to_json()).await
    }

    pub async fn send_abort_speaking(&self, reason: Option<AbortReason>) -> bool {
        let session_id = self.session_id().unwrap_or_default();
        let msg = ClientMessage::Abort {
            session_id: &session_id,
            reason,
        };
        self.send_text(msg.to_json()).await
    }
}

/// Classify link events into protocol events for one link's lifetime.
async fn pump(
    mut net_rx: mpsc::Receiver<NetEvent>,
    commands: mpsc::Sender<NetCommand>,
    hello: String,
    session: Arc<Session>,
    events: mpsc::Sender<ProtocolEvent>,
) {
    while let Some(event) = net_rx.recv().await {
        let out = match event {
            NetEvent::Connected => {
                session.connected.store(true, Ordering::SeqCst);
                session.status.send_modify(|s| {
                    if *s != LinkStatus::Connecting {
                        *s = LinkStatus::Connecting;
                    }
                });
                log::info!("Sending Hello: {}", hello);
                if commands.send(NetCommand::SendText(hello.clone())).await.is_err() {
                    break;
                }
                None
            }
            NetEvent::Disconnected => {
                session.connected.store(false, Ordering::SeqCst);
                session.end(LinkStatus::Connecting).then_some(ProtocolEvent::AudioChannelClosed)
            }
            NetEvent::Binary(data) => Some(ProtocolEvent::IncomingAudio(data)),
            NetEvent::Text(text) => classify(&text, &session, &commands).await,
            NetEvent::Error(e) => {
                session.connected.store(false, Ordering::SeqCst);
                let was_open = session.end(LinkStatus::Failed(e.clone()));
                if !was_open {
                    session.status.send_replace(LinkStatus::Failed(e.clone()));
                } else if events.send(ProtocolEvent::AudioChannelClosed).await.is_err() {
                    break;
                }
                Some(ProtocolEvent::NetworkError(e))
            }
        };
        if let Some(out) = out {
            if events.send(out).await.is_err() {
                break;
            }
        }
    }

    // Link ended on its own.
    session.connected.store(false, Ordering::SeqCst);
    if session.end(LinkStatus::Idle) {
        let _ = events.send(ProtocolEvent::AudioChannelClosed).await;
    }
}

async fn classify(text: &str, session: &Session, commands: &mpsc::Sender<NetCommand>) -> Option<ProtocolEvent> {
    let message: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("Dropping malformed JSON from server: {} ({})", e, text);
            return None;
        }
    };
    let msg_type = message.get("type").and_then(Value::as_str).unwrap_or_default();

    match msg_type {
        "hello" => {
            log::info!("Received server hello: {}", message);
            let session_id = message
                .get("session_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let udp = if message.get("transport").and_then(Value::as_str) == Some("udp") {
                message.get("udp").and_then(|u| serde_json::from_value(u.clone()).ok())
            } else {
                None
            };
            session.set_udp(udp);
            session.status.send_replace(LinkStatus::Open(session_id));
            Some(ProtocolEvent::AudioChannelOpened)
        }
        "goodbye" => {
            let current = session.session_id();
            let target = message.get("session_id").and_then(Value::as_str);
            if target.is_some() && target != current.as_deref() {
                log::debug!("Ignoring goodbye for session {:?}", target);
                return None;
            }
            log::info!("Server said goodbye");
            let _ = commands.send(NetCommand::Close).await;
            session.connected.store(false, Ordering::SeqCst);
            session.end(LinkStatus::Idle).then_some(ProtocolEvent::AudioChannelClosed)
        }
        _ => Some(ProtocolEvent::IncomingJson(message)),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process transport that records what the client sends and lets a
    //! test play the server.

    use super::*;

    pub(crate) struct LoopbackServer {
        sent: Arc<Mutex<Vec<NetCommand>>>,
        inject: Arc<Mutex<Option<mpsc::UnboundedSender<NetEvent>>>>,
    }

    impl LoopbackServer {
        pub(crate) fn sent(&self) -> Vec<NetCommand> {
            self.sent.lock().unwrap().clone()
        }

        /// Sent text frames, parsed.
        pub(crate) fn texts(&self) -> Vec<Value> {
            self.sent()
                .into_iter()
                .filter_map(|c| match c {
                    NetCommand::SendText(t) => serde_json::from_str(&t).ok(),
                    _ => None,
                })
                .collect()
        }

        /// Compact wire log: `hello`, `listen:start:auto`, `audio`, `close`, ...
        pub(crate) fn wire(&self) -> Vec<String> {
            self.sent()
                .into_iter()
                .map(|c| match c {
                    NetCommand::SendText(t) => {
                        let v: Value = serde_json::from_str(&t).unwrap();
                        [v.get("type"), v.get("state"), v.get("mode")]
                            .into_iter()
                            .flatten()
                            .filter_map(Value::as_str)
                            .collect::<Vec<_>>()
                            .join(":")
                    }
                    NetCommand::SendBinary(_) => "audio".to_string(),
                    NetCommand::Close => "close".to_string(),
                })
                .collect()
        }

        pub(crate) fn push(&self, event: NetEvent) {
            let inject = self.inject.lock().unwrap();
            inject.as_ref().expect("no live link").send(event).unwrap();
        }

        pub(crate) fn push_json(&self, value: Value) {
            self.push(NetEvent::Text(value.to_string()));
        }
    }

    struct LoopbackTransport {
        sent: Arc<Mutex<Vec<NetCommand>>>,
        inject_rx: mpsc::UnboundedReceiver<NetEvent>,
        reply_session: Option<String>,
        audio: bool,
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        fn hello_transport(&self) -> &'static str {
            "websocket"
        }

        fn carries_audio(&self) -> bool {
            self.audio
        }

        async fn run(mut self: Box<Self>, events: mpsc::Sender<NetEvent>, mut commands: mpsc::Receiver<NetCommand>) {
            if events.send(NetEvent::Connected).await.is_err() {
                return;
            }
            loop {
                tokio::select! {
                    cmd = commands.recv() => {
                        let Some(cmd) = cmd else { return };
                        self.sent.lock().unwrap().push(cmd.clone());
                        match cmd {
                            NetCommand::Close => return,
                            NetCommand::SendText(t) if t.contains("\"type\":\"hello\"") => {
                                if let Some(id) = &self.reply_session {
                                    let reply = serde_json::json!({
                                        "type": "hello",
                                        "transport": "websocket",
                                        "session_id": id,
                                    });
                                    let _ = events.send(NetEvent::Text(reply.to_string())).await;
                                }
                            }
                            _ => {}
                        }
                    }
                    Some(ev) = self.inject_rx.recv() => {
                        let terminal = matches!(ev, NetEvent::Error(_));
                        let _ = events.send(ev).await;
                        if terminal {
                            return;
                        }
                    }
                }
            }
        }
    }

    /// A factory whose links answer hello with `session` (or stay silent on
    /// `None`).
    pub(crate) fn loopback(session: Option<&str>, audio: bool) -> (TransportFactory, LoopbackServer) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let inject = Arc::new(Mutex::new(None));
        let server = LoopbackServer {
            sent: sent.clone(),
            inject: inject.clone(),
        };
        let reply_session = session.map(str::to_string);
        let factory: TransportFactory = Arc::new(move || {
            let (tx, rx) = mpsc::unbounded_channel();
            *inject.lock().unwrap() = Some(tx);
            Box::new(LoopbackTransport {
                sent: sent.clone(),
                inject_rx: rx,
                reply_session: reply_session.clone(),
                audio,
            }) as Box<dyn Transport>
        });
        (factory, server)
    }
}
