use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Deserialize)]
struct Config {
    application: Application,
    board: Board,
    network: Network,
    mqtt: Mqtt,
    hello_message: HelloMessage,
    audio: Audio,
    vad: Vad,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Board {
    #[serde(rename = "type")]
    type_: String,
    name: String,
}

#[derive(Deserialize)]
struct Network {
    transport: String,
    ws_url: String,
    ota_url: String,
    ws_token: String,
    device_id: String,
    client_id: String,
    protocol_version: u8,
    connect_timeout_ms: u64,
    hello_timeout_ms: u64,
    reconnect_max_attempts: u32,
    reconnect_base_delay_ms: u64,
    reconnect_max_delay_ms: u64,
}

#[derive(Deserialize)]
struct Mqtt {
    endpoint: String,
    client_id: String,
    username: String,
    password: String,
    publish_topic: String,
    subscribe_topic: String,
}

#[derive(Deserialize)]
struct HelloMessage {
    format: String,
    sample_rate: u32,
    channels: u8,
    frame_duration: u32,
    mcp: bool,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    capture_channels: u32,
    output_sample_rate: u32,
    playback_channels: u32,
    playback_period_size: usize,
    opus_bitrate: i32,
    stream_format: String,
    jitter_buffer: bool,
    pre_roll_ms: u32,
    pre_roll_factor: u32,
    underrun_grace_ms: u64,
}

#[derive(Deserialize)]
struct Vad {
    enabled: bool,
    mode: u8,
    positive_threshold: f32,
    negative_threshold: f32,
    min_speech_frames: u32,
    min_silence_frames: u32,
    pre_speech_pad_frames: u32,
    redemption_frames: u32,
}

fn env(key: &str, value: impl std::fmt::Display) {
    println!("cargo:rustc-env={}={}", key, value);
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 应用和板子信息
    env("APP_NAME", &config.application.name);
    env("APP_VERSION", &config.application.version);
    env("BOARD_TYPE", &config.board.type_);
    env("BOARD_NAME", &config.board.name);

    // 网络配置
    env("TRANSPORT", &config.network.transport);
    env("WS_URL", &config.network.ws_url);
    env("OTA_URL", &config.network.ota_url);
    env("WS_TOKEN", &config.network.ws_token);
    env("DEVICE_ID", &config.network.device_id);
    env("CLIENT_ID", &config.network.client_id);
    env("PROTOCOL_VERSION", config.network.protocol_version);
    env("CONNECT_TIMEOUT_MS", config.network.connect_timeout_ms);
    env("HELLO_TIMEOUT_MS", config.network.hello_timeout_ms);
    env("RECONNECT_MAX_ATTEMPTS", config.network.reconnect_max_attempts);
    env("RECONNECT_BASE_DELAY_MS", config.network.reconnect_base_delay_ms);
    env("RECONNECT_MAX_DELAY_MS", config.network.reconnect_max_delay_ms);

    // MQTT 配置
    env("MQTT_ENDPOINT", &config.mqtt.endpoint);
    env("MQTT_CLIENT_ID", &config.mqtt.client_id);
    env("MQTT_USERNAME", &config.mqtt.username);
    env("MQTT_PASSWORD", &config.mqtt.password);
    env("MQTT_PUBLISH_TOPIC", &config.mqtt.publish_topic);
    env("MQTT_SUBSCRIBE_TOPIC", &config.mqtt.subscribe_topic);

    // Hello 消息配置
    env("HELLO_FORMAT", &config.hello_message.format);
    env("HELLO_SAMPLE_RATE", config.hello_message.sample_rate);
    env("HELLO_CHANNELS", config.hello_message.channels);
    env("HELLO_FRAME_DURATION", config.hello_message.frame_duration);
    env("HELLO_MCP", config.hello_message.mcp);

    // 音频配置
    env("AUDIO_CAPTURE_DEVICE", &config.audio.capture_device);
    env("AUDIO_PLAYBACK_DEVICE", &config.audio.playback_device);
    env("AUDIO_CAPTURE_CHANNELS", config.audio.capture_channels);
    env("AUDIO_OUTPUT_SAMPLE_RATE", config.audio.output_sample_rate);
    env("AUDIO_PLAYBACK_CHANNELS", config.audio.playback_channels);
    env("AUDIO_PLAYBACK_PERIOD_SIZE", config.audio.playback_period_size);
    env("AUDIO_OPUS_BITRATE", config.audio.opus_bitrate);
    env("AUDIO_STREAM_FORMAT", &config.audio.stream_format);
    env("AUDIO_JITTER_BUFFER", config.audio.jitter_buffer);
    env("AUDIO_PRE_ROLL_MS", config.audio.pre_roll_ms);
    env("AUDIO_PRE_ROLL_FACTOR", config.audio.pre_roll_factor);
    env("AUDIO_UNDERRUN_GRACE_MS", config.audio.underrun_grace_ms);

    // VAD 配置
    env("VAD_ENABLED", config.vad.enabled);
    env("VAD_MODE", config.vad.mode);
    env("VAD_POSITIVE_THRESHOLD", config.vad.positive_threshold);
    env("VAD_NEGATIVE_THRESHOLD", config.vad.negative_threshold);
    env("VAD_MIN_SPEECH_FRAMES", config.vad.min_speech_frames);
    env("VAD_MIN_SILENCE_FRAMES", config.vad.min_silence_frames);
    env("VAD_PRE_SPEECH_PAD_FRAMES", config.vad.pre_speech_pad_frames);
    env("VAD_REDEMPTION_FRAMES", config.vad.redemption_frames);

    // SpeexDSP 只在 ALSA 后端启用时链接
    if std::env::var("CARGO_FEATURE_ALSA_BACKEND").is_err() {
        return;
    }

    let target = std::env::var("TARGET").unwrap_or_default();
    if target.contains("musl") {
        // musl 目标：使用手动编译的静态库，不依赖 pkg-config
        if let Ok(sysroot) = std::env::var("MUSL_SYSROOT") {
            println!("cargo:rustc-link-search=native={}/usr/lib", sysroot);
        }
        println!("cargo:rustc-link-lib=static=speexdsp");
        return;
    }

    pkg_config::Config::new()
        .probe("speexdsp")
        .expect("Failed to find speexdsp. Please install libspeexdsp-dev.");
}
