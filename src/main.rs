use anyhow::bail;
use mac_address::get_mac_address;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use uuid::Uuid;
use xiaozhi_voice_client::activation::{self, ActivationResult};
use xiaozhi_voice_client::application::{Application, ChannelObserver, PlayerFactory, SessionEvent, UiCommand};
use xiaozhi_voice_client::audio::{create_capture, create_player};
use xiaozhi_voice_client::config::Config;
use xiaozhi_voice_client::protocol::transport_factory;
use xiaozhi_voice_client::vad::{SpeechDetector, WebRtcClassifier};

const UUID_FILE: &str = "xiaozhi_uuid.txt";
const ACTIVATION_POLL: std::time::Duration = std::time::Duration::from_secs(5);

const HELP: &str = "commands: a=auto conversation, l=start listening, s=stop listening, \
x=stop conversation, i=interrupt, w <text>=wake word, q=quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let mut config = Config::new().unwrap_or_else(|e| {
        log::error!("{}, using defaults", e);
        Config::default()
    });
    resolve_identity(&mut config);

    // 在建立会话前检查激活
    loop {
        let result = tokio::select! {
            _ = signal::ctrl_c() => return Ok(()),
            result = activation::check_device_activation(&config) => result,
        };
        match result {
            ActivationResult::Activated(provisioning) => {
                log::info!("Device is activated");
                provisioning.apply(&mut config);
                break;
            }
            ActivationResult::NeedActivation(info) => {
                log::warn!("Device NOT activated. Code: {}", info.code);
                println!("请在控制面板输入验证码: {}", info.code);
                if !info.message.is_empty() {
                    println!("{}", info.message);
                }
            }
            ActivationResult::Error(e) => log::error!("Activation check error: {}. Retrying in 5s...", e),
        }
        tokio::select! {
            _ = signal::ctrl_c() => return Ok(()),
            _ = tokio::time::sleep(ACTIVATION_POLL) => {}
        }
    }

    let capture = create_capture(&config)?;
    let players: PlayerFactory = Arc::new(create_player);
    let mut app = Application::new(transport_factory(&config), capture, players);

    if config.vad.enabled {
        let classifier = WebRtcClassifier::new(config.hello.sample_rate, config.vad.mode, config.hello.frame_size())?;
        app.set_speech_detector(Some(SpeechDetector::new(Box::new(classifier), config.vad.clone())));
    }

    let (observer, session_events) = ChannelObserver::new();
    app.subscribe(Box::new(observer));
    tokio::spawn(report_session_events(session_events));

    if !app.initialize(config.clone()).await {
        bail!("Failed to open a session with {}", config.network.transport.as_str());
    }

    let (cmd_tx, cmd_rx) = mpsc::channel::<UiCommand>(16);
    tokio::spawn(read_commands(cmd_tx.clone()));
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            log::info!("Received Ctrl+C, shutting down...");
            let _ = cmd_tx.send(UiCommand::Shutdown).await;
        }
    });

    println!("{}", HELP);
    app.run(cmd_rx).await;
    Ok(())
}

/// 设备id和客户端id的处理
fn resolve_identity(config: &mut Config) {
    let network = &mut config.network;
    if network.device_id == "unknown-device" {
        network.device_id = match get_mac_address() {
            Ok(Some(mac)) => mac.to_string().to_lowercase(),
            _ => Uuid::new_v4().to_string(),
        };
    }

    // 先从本地文件读取以保持重启间身份一致
    if network.client_id == "unknown-client" {
        if let Ok(content) = std::fs::read_to_string(UUID_FILE) {
            let trimmed = content.trim();
            if !trimmed.is_empty() {
                network.client_id = trimmed.to_string();
                log::info!("Loaded Client ID from file: {}", network.client_id);
            }
        }
    }

    if network.client_id == "unknown-client" {
        network.client_id = Uuid::new_v4().to_string();
        log::info!("Generated new Client ID: {}", network.client_id);
        if let Err(e) = std::fs::write(UUID_FILE, &network.client_id) {
            log::error!("Failed to save Client ID to file: {}", e);
        }
    }
}

fn parse_command(line: &str) -> Option<UiCommand> {
    let line = line.trim();
    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    match cmd {
        "a" => Some(UiCommand::StartAutoConversation),
        "l" => Some(UiCommand::StartListening),
        "s" => Some(UiCommand::StopListening),
        "x" => Some(UiCommand::StopConversation),
        "i" => Some(UiCommand::AbortSpeaking),
        "w" if !rest.trim().is_empty() => Some(UiCommand::WakeWordDetected(rest.trim().to_string())),
        "q" => Some(UiCommand::Shutdown),
        _ => None,
    }
}

async fn read_commands(tx: mpsc::Sender<UiCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match parse_command(&line) {
            Some(cmd) => {
                if tx.send(cmd).await.is_err() {
                    break;
                }
            }
            None if line.trim().is_empty() => {}
            None => println!("{}", HELP),
        }
    }
}

async fn report_session_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::StateChanged { to, .. } => println!("[{}]", to),
            SessionEvent::IncomingJson(message) => {
                let kind = message.get("type").and_then(|t| t.as_str()).unwrap_or_default();
                if let Some(text) = message.get("text").and_then(|t| t.as_str()) {
                    println!("{}: {}", kind, text);
                }
            }
            SessionEvent::NetworkError(e) => println!("network error: {}", e),
            SessionEvent::AudioError(e) => println!("audio error: {}", e),
        }
    }
}
