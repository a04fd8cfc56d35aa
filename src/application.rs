//! Session controller: the device state machine that ties the protocol,
//! capture, playback and speech detection together.
//!
//! The controller is a single task. Every state change goes through
//! [`Application::set_device_state`], which drops no-op transitions and
//! notifies each observer synchronously, in subscription order.

use crate::audio::{AudioCapture, AudioPlayer, OpusEncoder, create_decoder};
use crate::config::Config;
use crate::protocol::{AbortReason, ListeningMode, Protocol, ProtocolEvent, ServerMessage, TransportFactory};
use crate::streaming::{StreamingConfig, StreamingContext};
use crate::vad::{SpeechDetector, VadEvent};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Idle,
    Listening,
    Speaking,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Idle => "idle",
            DeviceState::Listening => "listening",
            DeviceState::Speaking => "speaking",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub device_state: DeviceState,
    pub listening_mode: ListeningMode,
    pub keep_listening: bool,
    pub audio_opened: bool,
}

/// Receives controller notifications. Called on the controller task, so
/// implementations must return quickly.
pub trait SessionObserver: Send {
    fn on_device_state_changed(&mut self, _from: DeviceState, _to: DeviceState) {}
    fn on_incoming_json(&mut self, _message: &Value) {}
    fn on_network_error(&mut self, _error: &str) {}
    /// The microphone could not be opened; the requested operation did nothing.
    fn on_audio_error(&mut self, _error: &str) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged { from: DeviceState, to: DeviceState },
    IncomingJson(Value),
    NetworkError(String),
    AudioError(String),
}

/// Forwards notifications to another task (typically a UI) over a channel.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            log::debug!("Session event receiver dropped");
        }
    }
}

impl SessionObserver for ChannelObserver {
    fn on_device_state_changed(&mut self, from: DeviceState, to: DeviceState) {
        self.forward(SessionEvent::StateChanged { from, to });
    }

    fn on_incoming_json(&mut self, message: &Value) {
        self.forward(SessionEvent::IncomingJson(message.clone()));
    }

    fn on_network_error(&mut self, error: &str) {
        self.forward(SessionEvent::NetworkError(error.to_string()));
    }

    fn on_audio_error(&mut self, error: &str) {
        self.forward(SessionEvent::AudioError(error.to_string()));
    }
}

/// Requests from the UI side, consumed by [`Application::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiCommand {
    StartAutoConversation,
    StartListening,
    StopListening,
    StopConversation,
    AbortSpeaking,
    WakeWordDetected(String),
    Shutdown,
}

/// Builds the playback adapter when the controller initializes. Runs on the
/// blocking pool since opening a device may take a while.
pub type PlayerFactory = Arc<dyn Fn(&Config) -> anyhow::Result<AudioPlayer> + Send + Sync>;

/// Downlink routing: through the jitter buffer, or frame by frame.
enum Playback {
    Buffered {
        player: Arc<AudioPlayer>,
        streaming: StreamingContext,
    },
    Direct(Arc<AudioPlayer>),
}

impl Playback {
    fn push(&self, frame: bytes::Bytes) {
        match self {
            Playback::Buffered { streaming, .. } => streaming.push_frames([frame]),
            Playback::Direct(player) => player.play_frame(&frame),
        }
    }

    fn stop(&self) {
        match self {
            Playback::Buffered { streaming, .. } => streaming.reset(),
            Playback::Direct(player) => player.stop(),
        }
    }

    async fn close(self) {
        match self {
            Playback::Buffered { player, mut streaming } => {
                streaming.shutdown().await;
                player.close();
            }
            Playback::Direct(player) => player.close(),
        }
    }
}

pub struct Application {
    factory: TransportFactory,
    capture: Box<dyn AudioCapture>,
    players: PlayerFactory,
    detector: Option<SpeechDetector>,
    observers: Vec<Box<dyn SessionObserver>>,

    protocol: Option<Protocol>,
    protocol_events: Option<mpsc::Receiver<ProtocolEvent>>,
    playback: Option<Playback>,
    encoder: Option<OpusEncoder>,
    frames_tx: mpsc::Sender<Vec<f32>>,
    frames_rx: mpsc::Receiver<Vec<f32>>,

    device_state: DeviceState,
    listening_mode: ListeningMode,
    keep_listening: bool,
    running: bool,
}

impl Application {
    pub fn new(factory: TransportFactory, capture: Box<dyn AudioCapture>, players: PlayerFactory) -> Self {
        let (frames_tx, frames_rx) = mpsc::channel(64);
        Self {
            factory,
            capture,
            players,
            detector: None,
            observers: Vec::new(),
            protocol: None,
            protocol_events: None,
            playback: None,
            encoder: None,
            frames_tx,
            frames_rx,
            device_state: DeviceState::Idle,
            listening_mode: ListeningMode::AutoStop,
            keep_listening: false,
            running: false,
        }
    }

    /// Gate the uplink on detected speech and allow barge-in.
    pub fn set_speech_detector(&mut self, detector: Option<SpeechDetector>) {
        self.detector = detector;
    }

    pub fn subscribe(&mut self, observer: Box<dyn SessionObserver>) {
        self.observers.push(observer);
    }

    /// Connect, complete the hello handshake and start the playback
    /// pipeline. True when the controller is running afterwards.
    pub async fn initialize(&mut self, config: Config) -> bool {
        if self.running {
            log::warn!("Application already running");
            return true;
        }

        let (mut protocol, events) = Protocol::new(&config, self.factory.clone());
        self.protocol_events = Some(events);
        if !protocol.open_audio_channel().await {
            log::error!("Failed to connect to server");
            self.drain_protocol_events().await;
            self.protocol_events = None;
            return false;
        }

        let encoder = match OpusEncoder::new(
            config.hello.sample_rate,
            config.hello.channels as u32,
            config.hello.frame_duration,
            config.audio.opus_bitrate,
        ) {
            Ok(encoder) => encoder,
            Err(e) => {
                log::error!("Failed to create uplink encoder: {}", e);
                protocol.close_audio_channel().await;
                self.protocol_events = None;
                return false;
            }
        };

        let playback = match self.start_playback(&config).await {
            Ok(playback) => playback,
            Err(e) => {
                log::error!("Failed to start playback: {:#}", e);
                protocol.close_audio_channel().await;
                self.protocol_events = None;
                return false;
            }
        };

        self.protocol = Some(protocol);
        self.encoder = Some(encoder);
        self.playback = Some(playback);
        self.running = true;
        log::info!("Application initialized successfully");
        true
    }

    async fn start_playback(&self, config: &Config) -> anyhow::Result<Playback> {
        let players = self.players.clone();
        let device_config = config.clone();
        let player = Arc::new(tokio::task::spawn_blocking(move || players(&device_config)).await??);
        if !config.audio.jitter_buffer {
            return Ok(Playback::Direct(player));
        }
        let decoder = create_decoder(&config.audio.stream_format, config.audio.output_sample_rate, 1)?;
        let streaming = StreamingContext::start(
            decoder,
            player.clone(),
            StreamingConfig {
                sample_rate: config.audio.output_sample_rate,
                channels: 1,
                pre_roll_ms: config.audio.pre_roll_ms,
                pre_roll_factor: config.audio.pre_roll_factor,
                underrun_grace: config.audio.underrun_grace,
            },
        );
        Ok(Playback::Buffered { player, streaming })
    }

    // ======================== User operations ========================

    pub async fn start_auto_conversation(&mut self) {
        if !self.ensure_channel().await {
            return;
        }
        if !self.start_capture() {
            return;
        }
        self.listening_mode = ListeningMode::AutoStop;
        self.keep_listening = true;

        if let Some(protocol) = &self.protocol {
            protocol.send_start_listening(self.listening_mode).await;
        }
        self.set_device_state(DeviceState::Listening);
    }

    /// Push-to-talk: interrupts any speech in progress.
    pub async fn start_listening_manual(&mut self) {
        if !self.ensure_channel().await {
            return;
        }
        if !self.start_capture() {
            return;
        }
        self.keep_listening = false;

        if self.device_state == DeviceState::Speaking {
            if let Some(protocol) = &self.protocol {
                protocol.send_abort_speaking(None).await;
            }
            self.stop_playback();
            self.set_device_state(DeviceState::Idle);
        }

        self.listening_mode = ListeningMode::Manual;
        if let Some(protocol) = &self.protocol {
            protocol.send_start_listening(ListeningMode::Manual).await;
        }
        self.set_device_state(DeviceState::Listening);
    }

    pub async fn stop_listening_manual(&mut self) {
        let Some(protocol) = &self.protocol else {
            return;
        };
        protocol.send_stop_listening().await;
        self.stop_capture();
        self.set_device_state(DeviceState::Idle);
    }

    pub async fn stop_conversation(&mut self) {
        self.keep_listening = false;
        self.stop_capture();
        if let Some(protocol) = &self.protocol {
            protocol.send_stop_listening().await;
        }
        self.set_device_state(DeviceState::Idle);
    }

    pub async fn abort_speaking(&mut self, reason: Option<AbortReason>) {
        let Some(protocol) = &self.protocol else {
            return;
        };
        protocol.send_abort_speaking(reason).await;
        self.stop_playback();
        if self.device_state == DeviceState::Speaking {
            self.set_device_state(DeviceState::Idle);
        }
    }

    pub async fn send_wake_word_detected(&mut self, text: &str) {
        if !self.ensure_channel().await {
            return;
        }
        if let Some(protocol) = &self.protocol {
            protocol.send_wake_word_detected(text).await;
        }
    }

    /// Stop capture, say goodbye and release the playback pipeline. Later
    /// calls do nothing until the next `initialize`.
    pub async fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        log::info!("Shutting down application...");
        self.running = false;

        self.stop_capture();
        if let Some(mut protocol) = self.protocol.take() {
            protocol.close_audio_channel().await;
        }
        self.protocol_events = None;
        if let Some(playback) = self.playback.take() {
            playback.close().await;
        }
        if let Some(mut encoder) = self.encoder.take() {
            encoder.destroy();
        }
        log::info!("Application shutdown complete");
    }

    // ======================== Queries ========================

    pub fn device_state(&self) -> DeviceState {
        self.device_state
    }

    pub fn is_idle(&self) -> bool {
        self.device_state == DeviceState::Idle
    }

    pub fn is_listening(&self) -> bool {
        self.device_state == DeviceState::Listening
    }

    pub fn is_speaking(&self) -> bool {
        self.device_state == DeviceState::Speaking
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn state_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            device_state: self.device_state,
            listening_mode: self.listening_mode,
            keep_listening: self.keep_listening,
            audio_opened: self
                .protocol
                .as_ref()
                .is_some_and(Protocol::is_audio_channel_opened),
        }
    }

    // ======================== Event loop ========================

    /// Multiplex UI commands, protocol events and captured audio until a
    /// `Shutdown` command arrives or the command channel closes.
    pub async fn run(&mut self, mut commands: mpsc::Receiver<UiCommand>) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(UiCommand::Shutdown) | None => {
                        self.shutdown().await;
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                },
                event = next_protocol_event(&mut self.protocol_events) => {
                    self.handle_protocol_event(event).await;
                }
                Some(frame) = self.frames_rx.recv() => self.handle_captured_frame(frame).await,
            }
        }
    }

    async fn handle_command(&mut self, cmd: UiCommand) {
        log::debug!("UI command: {:?}", cmd);
        match cmd {
            UiCommand::StartAutoConversation => self.start_auto_conversation().await,
            UiCommand::StartListening => self.start_listening_manual().await,
            UiCommand::StopListening => self.stop_listening_manual().await,
            UiCommand::StopConversation => self.stop_conversation().await,
            UiCommand::AbortSpeaking => self.abort_speaking(None).await,
            UiCommand::WakeWordDetected(text) => self.send_wake_word_detected(&text).await,
            UiCommand::Shutdown => self.shutdown().await,
        }
    }

    async fn handle_protocol_event(&mut self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::IncomingJson(message) => self.handle_incoming_json(message).await,
            ProtocolEvent::IncomingAudio(frame) => {
                if let Some(playback) = &self.playback {
                    playback.push(frame);
                }
            }
            ProtocolEvent::AudioChannelOpened => log::info!("Audio channel opened"),
            ProtocolEvent::AudioChannelClosed => {
                log::info!("Audio channel closed");
                self.stop_capture();
                self.set_device_state(DeviceState::Idle);
            }
            ProtocolEvent::NetworkError(error) => {
                log::error!("Network error: {}", error);
                for observer in &mut self.observers {
                    observer.on_network_error(&error);
                }
            }
        }
    }

    async fn handle_incoming_json(&mut self, message: Value) {
        if let Some(msg) = ServerMessage::from_value(&message) {
            match (msg.msg_type.as_str(), msg.state.as_deref()) {
                ("tts", Some("start")) => {
                    if self.keep_listening && self.listening_mode == ListeningMode::Realtime {
                        self.set_device_state(DeviceState::Listening);
                    } else {
                        self.set_device_state(DeviceState::Speaking);
                    }
                }
                ("tts", Some("stop")) => {
                    if self.keep_listening {
                        if let Some(protocol) = &self.protocol {
                            protocol.send_start_listening(self.listening_mode).await;
                        }
                        self.set_device_state(DeviceState::Listening);
                    } else {
                        self.set_device_state(DeviceState::Idle);
                    }
                }
                ("tts", _) => {
                    if let Some(text) = &msg.text {
                        log::info!("TTS: {}", text);
                    }
                }
                ("stt", _) => log::info!("STT Result: {}", msg.text.as_deref().unwrap_or_default()),
                ("llm", _) => log::debug!("Emotion: {}", msg.emotion.as_deref().unwrap_or_default()),
                (other, _) => log::debug!("Forwarding message type: {}", other),
            }
        }

        for observer in &mut self.observers {
            observer.on_incoming_json(&message);
        }
    }

    async fn handle_captured_frame(&mut self, frame: Vec<f32>) {
        let Some(detector) = self.detector.as_mut() else {
            if self.device_state == DeviceState::Listening {
                self.send_frame(&frame).await;
            }
            return;
        };

        match detector.process(&frame) {
            Some(VadEvent::SpeechStart { pre_roll }) => {
                log::debug!("Speech start ({} pre-roll frames)", pre_roll.len());
                if self.device_state == DeviceState::Speaking && self.keep_listening {
                    log::info!("Barge-in: user spoke over playback");
                    if let Some(protocol) = &self.protocol {
                        protocol.send_abort_speaking(None).await;
                    }
                    self.stop_playback();
                    self.set_device_state(DeviceState::Listening);
                }
                if self.device_state == DeviceState::Listening {
                    for f in &pre_roll {
                        self.send_frame(f).await;
                    }
                }
            }
            Some(VadEvent::SpeechEnd) => log::debug!("Speech end"),
            Some(VadEvent::Misfire) => log::debug!("VAD misfire"),
            None => {
                let in_speech = detector.in_speech();
                if in_speech && self.device_state == DeviceState::Listening {
                    self.send_frame(&frame).await;
                }
            }
        }
    }

    // ======================== Helpers ========================

    async fn send_frame(&mut self, pcm: &[f32]) {
        let (Some(encoder), Some(protocol)) = (self.encoder.as_mut(), &self.protocol) else {
            return;
        };
        match encoder.encode(pcm) {
            Ok(packet) => {
                protocol.send_audio(packet).await;
            }
            Err(e) => log::warn!("Dropping uplink frame: {}", e),
        }
    }

    async fn ensure_channel(&mut self) -> bool {
        let Some(protocol) = self.protocol.as_mut() else {
            log::error!("Protocol not initialized");
            return false;
        };
        if protocol.is_audio_channel_opened() {
            return true;
        }
        protocol.open_audio_channel().await
    }

    /// Deliver whatever the protocol has already reported.
    async fn drain_protocol_events(&mut self) {
        let mut pending = Vec::new();
        if let Some(events) = self.protocol_events.as_mut() {
            while let Ok(event) = events.try_recv() {
                pending.push(event);
            }
        }
        for event in pending {
            self.handle_protocol_event(event).await;
        }
    }

    /// True when the microphone is running afterwards.
    fn start_capture(&mut self) -> bool {
        if self.capture.is_running() {
            return true;
        }
        if let Some(detector) = self.detector.as_mut() {
            detector.reset();
        }
        match self.capture.start(self.frames_tx.clone()) {
            Ok(()) => true,
            Err(e) => {
                log::error!("Failed to start audio capture: {}", e);
                let error = e.to_string();
                for observer in &mut self.observers {
                    observer.on_audio_error(&error);
                }
                false
            }
        }
    }

    fn stop_capture(&mut self) {
        self.capture.stop();
        // Frames still queued belong to the turn that just ended.
        while self.frames_rx.try_recv().is_ok() {}
        if let Some(detector) = self.detector.as_mut() {
            detector.reset();
        }
    }

    fn stop_playback(&self) {
        if let Some(playback) = &self.playback {
            playback.stop();
        }
    }

    fn set_device_state(&mut self, state: DeviceState) {
        if self.device_state == state {
            return;
        }
        let from = self.device_state;
        self.device_state = state;
        log::info!("Device state changed: {} -> {}", from, state);
        for observer in &mut self.observers {
            observer.on_device_state_changed(from, state);
        }
    }
}

async fn next_protocol_event(events: &mut Option<mpsc::Receiver<ProtocolEvent>>) -> ProtocolEvent {
    if let Some(rx) = events {
        if let Some(event) = rx.recv().await {
            return event;
        }
    }
    std::future::pending().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::OutputDevice;
    use crate::audio::stream_decoder::PcmDecoder;
    use crate::config::VadConfig;
    use crate::error::AudioError;
    use crate::protocol::testing::{LoopbackServer, loopback};
    use crate::vad::SpeechClassifier;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    const FRAME: usize = 960;

    type FrameSlot = Arc<Mutex<Option<mpsc::Sender<Vec<f32>>>>>;

    /// Hands its frame sender to the test instead of opening a device.
    struct FakeCapture {
        slot: FrameSlot,
    }

    impl AudioCapture for FakeCapture {
        fn start(&mut self, frames_tx: mpsc::Sender<Vec<f32>>) -> Result<(), AudioError> {
            *self.slot.lock().unwrap() = Some(frames_tx);
            Ok(())
        }

        fn stop(&mut self) {
            self.slot.lock().unwrap().take();
        }

        fn is_running(&self) -> bool {
            self.slot.lock().unwrap().is_some()
        }
    }

    /// A microphone that is never available.
    struct DeadMic;

    impl AudioCapture for DeadMic {
        fn start(&mut self, _frames_tx: mpsc::Sender<Vec<f32>>) -> Result<(), AudioError> {
            Err(AudioError::Device("no capture device".to_string()))
        }

        fn stop(&mut self) {}

        fn is_running(&self) -> bool {
            false
        }
    }

    struct NullOutput;

    impl OutputDevice for NullOutput {
        fn write(&mut self, _samples: &[f32]) -> anyhow::Result<()> {
            Ok(())
        }

        fn drop_pending(&mut self) {}
    }

    struct FirstSample;

    impl SpeechClassifier for FirstSample {
        fn probability(&mut self, frame: &[f32]) -> anyhow::Result<f32> {
            Ok(frame[0])
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.network.hello_timeout = Duration::from_millis(500);
        config.audio.stream_format = "pcm".to_string();
        config
    }

    fn app(factory: TransportFactory) -> (Application, FrameSlot) {
        let slot: FrameSlot = Arc::new(Mutex::new(None));
        let capture = FakeCapture { slot: slot.clone() };
        (app_with(factory, Box::new(capture)), slot)
    }

    fn app_with(factory: TransportFactory, capture: Box<dyn AudioCapture>) -> Application {
        let players: PlayerFactory = Arc::new(|_config: &Config| {
            AudioPlayer::new(
                || Ok(Box::new(NullOutput) as Box<dyn OutputDevice>),
                Box::new(PcmDecoder::new()),
            )
        });
        Application::new(factory, capture, players)
    }

    async fn started(session: &str) -> (Application, FrameSlot, LoopbackServer, mpsc::UnboundedReceiver<SessionEvent>) {
        let (factory, server) = loopback(Some(session), true);
        let (mut app, slot) = app(factory);
        let (observer, events) = ChannelObserver::new();
        app.subscribe(Box::new(observer));
        assert!(app.initialize(config()).await);
        (app, slot, server, events)
    }

    fn states(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<(DeviceState, DeviceState)> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::StateChanged { from, to } = event {
                out.push((from, to));
            }
        }
        out
    }

    async fn next_state(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> (DeviceState, DeviceState) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("timed out waiting for state change")
                .expect("observer channel closed");
            if let SessionEvent::StateChanged { from, to } = event {
                return (from, to);
            }
        }
    }

    async fn wait_for_wire(server: &LoopbackServer, cond: impl Fn(&[String]) -> bool) {
        for _ in 0..200 {
            if cond(&server.wire()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("wire never matched: {:?}", server.wire());
    }

    fn count(wire: &[String], label: &str) -> usize {
        wire.iter().filter(|w| *w == label).count()
    }

    #[tokio::test]
    async fn manual_listen_round_trip_notifies_twice() {
        let (mut app, _slot, _server, mut events) = started("s1").await;

        app.start_listening_manual().await;
        assert!(app.is_listening());
        app.stop_listening_manual().await;
        assert!(app.is_idle());

        assert_eq!(
            states(&mut events),
            vec![
                (DeviceState::Idle, DeviceState::Listening),
                (DeviceState::Listening, DeviceState::Idle),
            ]
        );
        app.shutdown().await;
    }

    #[tokio::test]
    async fn tts_start_respects_listening_mode() {
        let (mut app, _slot, _server, mut events) = started("s1").await;
        let tts_start = json!({"type": "tts", "state": "start"});

        app.keep_listening = true;
        app.listening_mode = ListeningMode::Realtime;
        app.handle_protocol_event(ProtocolEvent::IncomingJson(tts_start.clone())).await;
        assert_eq!(app.device_state(), DeviceState::Listening);

        app.set_device_state(DeviceState::Idle);
        app.listening_mode = ListeningMode::AutoStop;
        app.handle_protocol_event(ProtocolEvent::IncomingJson(tts_start.clone())).await;
        assert_eq!(app.device_state(), DeviceState::Speaking);

        // Directives are forwarded after the state handling.
        let forwarded: Vec<Value> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|e| match e {
                SessionEvent::IncomingJson(v) => Some(v),
                _ => None,
            })
            .collect();
        assert_eq!(forwarded, vec![tts_start.clone(), tts_start]);
        app.shutdown().await;
    }

    #[tokio::test]
    async fn auto_conversation_end_to_end() {
        let (mut app, slot, server, mut events) = started("abc").await;
        let hello = &server.texts()[0];
        assert_eq!(hello["audio_params"]["sample_rate"], 16000);
        assert!(app.state_snapshot().audio_opened);

        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let task = tokio::spawn(async move {
            app.run(cmd_rx).await;
            app
        });

        cmd_tx.send(UiCommand::StartAutoConversation).await.unwrap();
        assert_eq!(next_state(&mut events).await, (DeviceState::Idle, DeviceState::Listening));

        let mic = slot.lock().unwrap().clone().expect("capture started");
        mic.send(vec![0.0; FRAME]).await.unwrap();
        wait_for_wire(&server, |w| w.iter().any(|l| l == "audio")).await;

        server.push_json(json!({"type": "tts", "state": "start", "session_id": "abc"}));
        assert_eq!(next_state(&mut events).await, (DeviceState::Listening, DeviceState::Speaking));

        server.push(crate::protocol::NetEvent::Binary(bytes::Bytes::from_static(&[0, 0, 0, 0])));

        server.push_json(json!({"type": "tts", "state": "stop", "session_id": "abc"}));
        assert_eq!(next_state(&mut events).await, (DeviceState::Speaking, DeviceState::Listening));
        wait_for_wire(&server, |w| count(w, "listen:start:auto") == 2).await;

        assert_eq!(
            server.wire(),
            vec!["hello", "listen:start:auto", "audio", "listen:start:auto"]
        );
        let listens: Vec<Value> = server
            .texts()
            .into_iter()
            .filter(|t| t["type"] == "listen")
            .collect();
        assert!(listens.iter().all(|l| l["session_id"] == "abc"));

        cmd_tx.send(UiCommand::Shutdown).await.unwrap();
        let app = task.await.unwrap();
        assert!(!app.is_running());
        let wire = server.wire();
        assert_eq!(&wire[wire.len() - 2..], &["goodbye".to_string(), "close".to_string()]);
    }

    #[tokio::test]
    async fn manual_listen_interrupts_speaking() {
        let (mut app, _slot, server, mut events) = started("s1").await;
        app.handle_protocol_event(ProtocolEvent::IncomingJson(json!({"type": "tts", "state": "start"})))
            .await;
        assert!(app.is_speaking());

        app.start_listening_manual().await;
        assert_eq!(
            states(&mut events),
            vec![
                (DeviceState::Idle, DeviceState::Speaking),
                (DeviceState::Speaking, DeviceState::Idle),
                (DeviceState::Idle, DeviceState::Listening),
            ]
        );
        wait_for_wire(&server, |w| w.len() >= 3).await;
        assert_eq!(server.wire(), vec!["hello", "abort", "listen:start:manual"]);
        let abort = &server.texts()[1];
        assert!(abort.get("reason").is_none());
        app.shutdown().await;
    }

    #[tokio::test]
    async fn channel_close_returns_to_idle() {
        let (mut app, slot, server, mut events) = started("s1").await;
        app.start_auto_conversation().await;
        assert!(slot.lock().unwrap().is_some());

        server.push_json(json!({"type": "goodbye", "session_id": "s1"}));
        loop {
            let event = tokio::time::timeout(Duration::from_secs(1), app.protocol_events.as_mut().unwrap().recv())
                .await
                .unwrap()
                .unwrap();
            let closed = event == ProtocolEvent::AudioChannelClosed;
            app.handle_protocol_event(event).await;
            if closed {
                break;
            }
        }

        assert!(app.is_idle());
        assert!(slot.lock().unwrap().is_none());
        assert_eq!(
            states(&mut events),
            vec![
                (DeviceState::Idle, DeviceState::Listening),
                (DeviceState::Listening, DeviceState::Idle),
            ]
        );
        assert!(!app.state_snapshot().audio_opened);
        app.shutdown().await;
    }

    #[tokio::test]
    async fn failed_connect_reports_network_error() {
        let (factory, _server) = loopback(None, true);
        let (mut app, _slot) = app(factory);
        let (observer, mut events) = ChannelObserver::new();
        app.subscribe(Box::new(observer));

        assert!(!app.initialize(config()).await);
        assert!(!app.is_running());
        assert_eq!(
            events.try_recv().ok(),
            Some(SessionEvent::NetworkError("Server hello timeout".to_string()))
        );

        // Nothing to act on without a protocol.
        app.start_auto_conversation().await;
        app.stop_conversation().await;
        app.shutdown().await;
        assert!(app.is_idle());
    }

    #[tokio::test]
    async fn operations_after_shutdown_are_inert() {
        let (mut app, slot, server, _events) = started("s1").await;
        app.shutdown().await;
        app.shutdown().await;
        let sent = server.wire().len();

        app.start_listening_manual().await;
        app.stop_listening_manual().await;
        app.abort_speaking(Some(AbortReason::WakeWordDetected)).await;
        assert!(slot.lock().unwrap().is_none());
        assert_eq!(server.wire().len(), sent);
        assert!(app.is_idle());
    }

    #[tokio::test]
    async fn speech_detector_gates_uplink_and_barges_in() {
        let (mut app, _slot, server, _events) = started("s1").await;
        let vad = VadConfig {
            enabled: true,
            ..VadConfig::default()
        };
        app.set_speech_detector(Some(SpeechDetector::new(Box::new(FirstSample), vad)));
        app.start_auto_conversation().await;

        for _ in 0..3 {
            app.handle_captured_frame(vec![0.0; FRAME]).await;
        }
        assert_eq!(count(&server.wire(), "audio"), 0);

        // Third speech frame confirms: two padding frames plus three candidates.
        for _ in 0..3 {
            app.handle_captured_frame(vec![0.9; FRAME]).await;
        }
        wait_for_wire(&server, |w| count(w, "audio") == 5).await;
        app.handle_captured_frame(vec![0.9; FRAME]).await;
        wait_for_wire(&server, |w| count(w, "audio") == 6).await;

        // End the utterance, then let the server speak.
        for _ in 0..10 {
            app.handle_captured_frame(vec![0.0; FRAME]).await;
        }
        app.handle_protocol_event(ProtocolEvent::IncomingJson(json!({"type": "tts", "state": "start"})))
            .await;
        assert!(app.is_speaking());

        for _ in 0..3 {
            app.handle_captured_frame(vec![0.9; FRAME]).await;
        }
        assert!(app.is_listening());
        wait_for_wire(&server, |w| w.iter().any(|l| l == "abort")).await;
        let wire = server.wire();
        let abort_at = wire.iter().position(|l| l == "abort").unwrap();
        assert!(wire[abort_at + 1..].iter().any(|l| l == "audio"));
        app.shutdown().await;
    }

    #[tokio::test]
    async fn microphone_failure_leaves_state_unchanged() {
        let (factory, server) = loopback(Some("s1"), true);
        let mut app = app_with(factory, Box::new(DeadMic));
        let (observer, mut events) = ChannelObserver::new();
        app.subscribe(Box::new(observer));
        assert!(app.initialize(config()).await);

        app.start_listening_manual().await;
        assert!(app.is_idle());
        app.start_auto_conversation().await;
        assert!(app.is_idle());
        assert!(!app.state_snapshot().keep_listening);

        // While speaking, a failed push-to-talk must not interrupt the reply.
        app.handle_protocol_event(ProtocolEvent::IncomingJson(json!({"type": "tts", "state": "start"})))
            .await;
        app.start_listening_manual().await;
        assert!(app.is_speaking());

        let events: Vec<SessionEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        let audio_errors = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::AudioError(msg) if msg.contains("no capture device")))
            .count();
        assert_eq!(audio_errors, 3);
        let transitions: Vec<&SessionEvent> = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::StateChanged { .. }))
            .collect();
        assert_eq!(
            transitions,
            vec![&SessionEvent::StateChanged {
                from: DeviceState::Idle,
                to: DeviceState::Speaking
            }]
        );
        assert_eq!(server.wire(), vec!["hello"]);
        app.shutdown().await;
    }

    #[tokio::test]
    async fn frames_outside_listening_are_not_sent() {
        let (mut app, _slot, server, _events) = started("s1").await;

        app.handle_captured_frame(vec![0.3; FRAME]).await;

        app.start_auto_conversation().await;
        app.handle_protocol_event(ProtocolEvent::IncomingJson(json!({"type": "tts", "state": "start"})))
            .await;
        assert!(app.is_speaking());
        app.handle_captured_frame(vec![0.3; FRAME]).await;

        // Anything sent above would precede this on the wire.
        app.stop_conversation().await;
        wait_for_wire(&server, |w| w.iter().any(|l| l == "listen:stop")).await;
        assert_eq!(count(&server.wire(), "audio"), 0);
        assert_eq!(server.wire(), vec!["hello", "listen:start:auto", "listen:stop"]);
        app.shutdown().await;
    }

    #[tokio::test]
    async fn stopping_capture_discards_queued_frames() {
        let (mut app, slot, server, _events) = started("s1").await;
        app.start_auto_conversation().await;
        let mic = slot.lock().unwrap().clone().expect("capture started");
        for _ in 0..3 {
            mic.send(vec![0.3; FRAME]).await.unwrap();
        }

        app.stop_conversation().await;
        assert!(app.frames_rx.try_recv().is_err());

        app.start_listening_manual().await;
        assert!(app.is_listening());
        assert!(app.frames_rx.try_recv().is_err());
        wait_for_wire(&server, |w| w.iter().any(|l| l == "listen:start:manual")).await;
        assert_eq!(count(&server.wire(), "audio"), 0);
        app.shutdown().await;
    }

    #[tokio::test]
    async fn player_is_opened_off_the_controller_thread() {
        let (factory, _server) = loopback(Some("s1"), true);
        let opened_on = Arc::new(Mutex::new(None));
        let recorder = opened_on.clone();
        let players: PlayerFactory = Arc::new(move |_config: &Config| {
            *recorder.lock().unwrap() = Some(std::thread::current().id());
            AudioPlayer::new(
                || Ok(Box::new(NullOutput) as Box<dyn OutputDevice>),
                Box::new(PcmDecoder::new()),
            )
        });
        let slot: FrameSlot = Arc::new(Mutex::new(None));
        let mut app = Application::new(factory, Box::new(FakeCapture { slot }), players);

        assert!(app.initialize(config()).await);
        let opened_on = opened_on.lock().unwrap().expect("player factory called");
        assert_ne!(opened_on, std::thread::current().id());
        app.shutdown().await;
    }
}
