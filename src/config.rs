use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// 会话使用的传输层
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[serde(rename = "websocket")]
    WebSocket,
    Mqtt,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::Mqtt => "mqtt",
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(TransportKind::WebSocket),
            "mqtt" => Ok(TransportKind::Mqtt),
            other => Err(format!("unknown transport: {}", other)),
        }
    }
}

/// Capped exponential backoff used by transports that reconnect on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based): base, 2×base, 4×base, ... capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << shift);
        delay.min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub transport: TransportKind,
    pub ws_url: String,
    pub ota_url: String,
    pub ws_token: String,
    // 设备标识（动态部分，可在运行时修改）
    pub device_id: String,
    pub client_id: String,
    pub protocol_version: u8,
    pub connect_timeout: Duration,
    pub hello_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::WebSocket,
            ws_url: "ws://127.0.0.1:8000/xiaozhi/v1/".to_string(),
            ota_url: String::new(),
            ws_token: String::new(),
            device_id: "unknown-device".to_string(),
            client_id: "unknown-client".to_string(),
            protocol_version: 1,
            connect_timeout: Duration::from_secs(10),
            hello_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Broker credentials and topics for the MQTT transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub endpoint: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub publish_topic: String,
    pub subscribe_topic: Option<String>,
}

/// Audio parameters announced in the client hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloConfig {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub frame_duration: u32,
    pub mcp: bool,
}

impl HelloConfig {
    /// Samples per channel in one uplink frame.
    pub fn frame_size(&self) -> usize {
        (self.sample_rate * self.frame_duration / 1000) as usize
    }
}

impl Default for HelloConfig {
    fn default() -> Self {
        Self {
            format: "opus".to_string(),
            sample_rate: 16000,
            channels: 1,
            frame_duration: 60,
            mcp: true,
        }
    }
}

/// Audio system configuration.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    /// ALSA playback device name
    pub playback_device: String,
    /// Desired ALSA channel count for capture
    pub capture_channels: u32,
    /// Sample rate of the downlink (TTS) stream
    pub output_sample_rate: u32,
    /// Desired ALSA playback channel count
    pub playback_channels: u32,
    /// Desired ALSA playback period size (0 = let ALSA decide)
    pub playback_period_size: usize,
    /// Uplink Opus bitrate in bits/s
    pub opus_bitrate: i32,
    /// 网络下发流的编码格式: "opus", "pcm"
    pub stream_format: String,
    /// Route downlink audio through the jitter-buffered streaming context
    pub jitter_buffer: bool,
    pub pre_roll_ms: u32,
    pub pre_roll_factor: u32,
    pub underrun_grace: Duration,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
            capture_channels: 1,
            output_sample_rate: 24000,
            playback_channels: 2,
            playback_period_size: 1024,
            opus_bitrate: 64000,
            stream_format: "opus".to_string(),
            jitter_buffer: true,
            pre_roll_ms: 100,
            pre_roll_factor: 3,
            underrun_grace: Duration::from_millis(500),
        }
    }
}

/// Speech detector thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct VadConfig {
    pub enabled: bool,
    /// WebRTC aggressiveness, 0-3
    pub mode: u8,
    /// Probability at or above which a frame counts as speech
    pub positive_threshold: f32,
    /// Probability below which a frame counts as silence
    pub negative_threshold: f32,
    /// Speech frames needed to confirm a speech start
    pub min_speech_frames: u32,
    /// Silence frames that discard an unconfirmed speech candidate
    pub min_silence_frames: u32,
    /// Frames before the candidate handed out with the start event
    pub pre_speech_pad_frames: u32,
    /// Silence frames that end confirmed speech
    pub redemption_frames: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: 2,
            positive_threshold: 0.5,
            negative_threshold: 0.35,
            min_speech_frames: 3,
            min_silence_frames: 6,
            pre_speech_pad_frames: 2,
            redemption_frames: 10,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub network: NetworkConfig,
    pub mqtt: MqttConfig,
    pub hello: HelloConfig,
    pub audio: AudioConfig,
    pub vad: VadConfig,
}

fn parse<T: FromStr>(value: &'static str, err: &'static str) -> Result<T, &'static str> {
    value.trim().parse().map_err(|_| err)
}

fn non_empty(value: &'static str) -> Option<String> {
    match value.trim() {
        "" | "null" => None,
        v => Some(v.to_string()),
    }
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        let network = NetworkConfig {
            transport: parse(env!("TRANSPORT"), "Failed to parse TRANSPORT")?,
            ws_url: env!("WS_URL").to_string(),
            ota_url: env!("OTA_URL").to_string(),
            ws_token: env!("WS_TOKEN").to_string(),
            device_id: env!("DEVICE_ID").to_string(),
            client_id: env!("CLIENT_ID").to_string(),
            protocol_version: parse(env!("PROTOCOL_VERSION"), "Failed to parse PROTOCOL_VERSION")?,
            connect_timeout: Duration::from_millis(parse(
                env!("CONNECT_TIMEOUT_MS"),
                "Failed to parse CONNECT_TIMEOUT_MS",
            )?),
            hello_timeout: Duration::from_millis(parse(
                env!("HELLO_TIMEOUT_MS"),
                "Failed to parse HELLO_TIMEOUT_MS",
            )?),
            reconnect: ReconnectPolicy {
                max_attempts: parse(
                    env!("RECONNECT_MAX_ATTEMPTS"),
                    "Failed to parse RECONNECT_MAX_ATTEMPTS",
                )?,
                base_delay: Duration::from_millis(parse(
                    env!("RECONNECT_BASE_DELAY_MS"),
                    "Failed to parse RECONNECT_BASE_DELAY_MS",
                )?),
                max_delay: Duration::from_millis(parse(
                    env!("RECONNECT_MAX_DELAY_MS"),
                    "Failed to parse RECONNECT_MAX_DELAY_MS",
                )?),
            },
        };

        let mqtt = MqttConfig {
            endpoint: env!("MQTT_ENDPOINT").to_string(),
            client_id: env!("MQTT_CLIENT_ID").to_string(),
            username: env!("MQTT_USERNAME").to_string(),
            password: env!("MQTT_PASSWORD").to_string(),
            publish_topic: env!("MQTT_PUBLISH_TOPIC").to_string(),
            subscribe_topic: non_empty(env!("MQTT_SUBSCRIBE_TOPIC")),
        };

        let hello = HelloConfig {
            format: env!("HELLO_FORMAT").to_string(),
            sample_rate: parse(env!("HELLO_SAMPLE_RATE"), "Failed to parse HELLO_SAMPLE_RATE")?,
            channels: parse(env!("HELLO_CHANNELS"), "Failed to parse HELLO_CHANNELS")?,
            frame_duration: parse(
                env!("HELLO_FRAME_DURATION"),
                "Failed to parse HELLO_FRAME_DURATION",
            )?,
            mcp: parse(env!("HELLO_MCP"), "Failed to parse HELLO_MCP")?,
        };

        let audio = AudioConfig {
            capture_device: env!("AUDIO_CAPTURE_DEVICE").to_string(),
            playback_device: env!("AUDIO_PLAYBACK_DEVICE").to_string(),
            capture_channels: parse(
                env!("AUDIO_CAPTURE_CHANNELS"),
                "Failed to parse AUDIO_CAPTURE_CHANNELS",
            )?,
            output_sample_rate: parse(
                env!("AUDIO_OUTPUT_SAMPLE_RATE"),
                "Failed to parse AUDIO_OUTPUT_SAMPLE_RATE",
            )?,
            playback_channels: parse(
                env!("AUDIO_PLAYBACK_CHANNELS"),
                "Failed to parse AUDIO_PLAYBACK_CHANNELS",
            )?,
            playback_period_size: parse(
                env!("AUDIO_PLAYBACK_PERIOD_SIZE"),
                "Failed to parse AUDIO_PLAYBACK_PERIOD_SIZE",
            )?,
            opus_bitrate: parse(env!("AUDIO_OPUS_BITRATE"), "Failed to parse AUDIO_OPUS_BITRATE")?,
            stream_format: env!("AUDIO_STREAM_FORMAT").to_string(),
            jitter_buffer: parse(env!("AUDIO_JITTER_BUFFER"), "Failed to parse AUDIO_JITTER_BUFFER")?,
            pre_roll_ms: parse(env!("AUDIO_PRE_ROLL_MS"), "Failed to parse AUDIO_PRE_ROLL_MS")?,
            pre_roll_factor: parse(
                env!("AUDIO_PRE_ROLL_FACTOR"),
                "Failed to parse AUDIO_PRE_ROLL_FACTOR",
            )?,
            underrun_grace: Duration::from_millis(parse(
                env!("AUDIO_UNDERRUN_GRACE_MS"),
                "Failed to parse AUDIO_UNDERRUN_GRACE_MS",
            )?),
        };

        let vad = VadConfig {
            enabled: parse(env!("VAD_ENABLED"), "Failed to parse VAD_ENABLED")?,
            mode: parse(env!("VAD_MODE"), "Failed to parse VAD_MODE")?,
            positive_threshold: parse(
                env!("VAD_POSITIVE_THRESHOLD"),
                "Failed to parse VAD_POSITIVE_THRESHOLD",
            )?,
            negative_threshold: parse(
                env!("VAD_NEGATIVE_THRESHOLD"),
                "Failed to parse VAD_NEGATIVE_THRESHOLD",
            )?,
            min_speech_frames: parse(
                env!("VAD_MIN_SPEECH_FRAMES"),
                "Failed to parse VAD_MIN_SPEECH_FRAMES",
            )?,
            min_silence_frames: parse(
                env!("VAD_MIN_SILENCE_FRAMES"),
                "Failed to parse VAD_MIN_SILENCE_FRAMES",
            )?,
            pre_speech_pad_frames: parse(
                env!("VAD_PRE_SPEECH_PAD_FRAMES"),
                "Failed to parse VAD_PRE_SPEECH_PAD_FRAMES",
            )?,
            redemption_frames: parse(
                env!("VAD_REDEMPTION_FRAMES"),
                "Failed to parse VAD_REDEMPTION_FRAMES",
            )?,
        };

        Ok(Self {
            network,
            mqtt,
            hello,
            audio,
            vad,
        })
    }
}
