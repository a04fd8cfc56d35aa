//! WebSocket link with bearer-token handshake and bounded reconnect.

use super::{NetCommand, NetEvent, Transport};
use crate::config::{NetworkConfig, ReconnectPolicy};
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum LinkEnd {
    /// Close requested locally, or the protocol dropped its command sender.
    Local,
    /// The server or the network ended the connection.
    Remote(String),
}

pub struct WebSocketTransport {
    url: String,
    token: String,
    device_id: String,
    client_id: String,
    protocol_version: u8,
    connect_timeout: Duration,
    reconnect: ReconnectPolicy,
}

impl WebSocketTransport {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            url: config.ws_url.clone(),
            token: config.ws_token.clone(),
            device_id: config.device_id.clone(),
            client_id: config.client_id.clone(),
            protocol_version: config.protocol_version,
            connect_timeout: config.connect_timeout,
            reconnect: config.reconnect,
        }
    }

    async fn connect(&self) -> anyhow::Result<WsStream> {
        // 根据配置构建WebSocket请求
        let url = Url::parse(&self.url).with_context(|| format!("invalid WebSocket URL '{}'", self.url))?;
        let host = url.host_str().ok_or_else(|| anyhow!("WebSocket URL '{}' has no host", self.url))?;
        let host = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let request = tokio_tungstenite::tungstenite::http::Request::builder()
            .method("GET")
            .uri(self.url.as_str())
            .header("Host", host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Device-Id", &self.device_id)
            .header("Client-Id", &self.client_id)
            .header("Protocol-Version", self.protocol_version.to_string())
            .body(())?;

        log::info!("Connecting to {}...", self.url);
        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| anyhow!("connect timed out after {:?}", self.connect_timeout))??;
        log::info!("Connected!");
        Ok(ws_stream)
    }

    async fn pump(
        &self,
        ws_stream: WsStream,
        events: &mpsc::Sender<NetEvent>,
        commands: &mut mpsc::Receiver<NetCommand>,
    ) -> LinkEnd {
        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                msg = read.next() => {
                    let forwarded = match msg {
                        Some(Ok(Message::Text(text))) => events.send(NetEvent::Text(text.to_string())).await,
                        Some(Ok(Message::Binary(data))) => events.send(NetEvent::Binary(data)).await,
                        Some(Ok(Message::Close(frame))) => {
                            return LinkEnd::Remote(format!("server closed connection: {:?}", frame));
                        }
                        Some(Ok(_)) => Ok(()),
                        Some(Err(e)) => return LinkEnd::Remote(e.to_string()),
                        None => return LinkEnd::Remote("connection closed".to_string()),
                    };
                    if forwarded.is_err() {
                        return LinkEnd::Local;
                    }
                }
                cmd = commands.recv() => {
                    let sent = match cmd {
                        Some(NetCommand::SendText(text)) => write.send(Message::Text(text.into())).await,
                        Some(NetCommand::SendBinary(data)) => write.send(Message::Binary(data)).await,
                        Some(NetCommand::Close) | None => {
                            let _ = write.send(Message::Close(None)).await;
                            let _ = write.close().await;
                            return LinkEnd::Local;
                        }
                    };
                    if let Err(e) = sent {
                        return LinkEnd::Remote(e.to_string());
                    }
                }
            }
        }
    }

    /// Sleep out the backoff delay. False if a local close arrived meanwhile.
    async fn backoff(&self, delay: Duration, commands: &mut mpsc::Receiver<NetCommand>) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                cmd = commands.recv() => match cmd {
                    Some(NetCommand::Close) | None => return false,
                    Some(_) => log::warn!("Dropping outbound frame while reconnecting"),
                },
            }
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn hello_transport(&self) -> &'static str {
        "websocket"
    }

    async fn run(self: Box<Self>, events: mpsc::Sender<NetEvent>, mut commands: mpsc::Receiver<NetCommand>) {
        let mut attempt = 0u32;
        let mut ever_connected = false;

        loop {
            match self.connect().await {
                Ok(stream) => {
                    attempt = 0;
                    ever_connected = true;
                    if events.send(NetEvent::Connected).await.is_err() {
                        return;
                    }
                    match self.pump(stream, &events, &mut commands).await {
                        LinkEnd::Local => {
                            log::info!("WebSocket closed locally");
                            return;
                        }
                        LinkEnd::Remote(reason) => {
                            log::warn!("WebSocket disconnected: {}", reason);
                            if events.send(NetEvent::Disconnected).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(e) if !ever_connected => {
                    let _ = events
                        .send(NetEvent::Error(format!("WebSocket connection failed: {:#}", e)))
                        .await;
                    return;
                }
                Err(e) => log::warn!("Reconnect attempt {} failed: {:#}", attempt, e),
            }

            attempt += 1;
            if attempt > self.reconnect.max_attempts {
                log::error!("Max reconnect attempts reached");
                let _ = events
                    .send(NetEvent::Error(format!(
                        "Failed to reconnect after {} attempts",
                        self.reconnect.max_attempts
                    )))
                    .await;
                return;
            }
            let delay = self.reconnect.delay_for(attempt);
            log::info!(
                "Attempting to reconnect in {:?} (attempt {}/{})",
                delay,
                attempt,
                self.reconnect.max_attempts
            );
            if !self.backoff(delay, &mut commands).await {
                return;
            }
        }
    }
}
