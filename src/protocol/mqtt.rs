//! Control channel over an MQTT broker. Audio is expected on a separate UDP
//! path, so this link only carries JSON.

use super::{NetCommand, NetEvent, Transport};
use crate::config::MqttConfig;
use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS, Transport as BrokerTransport};
use std::time::Duration;
use tokio::sync::mpsc;

const DEFAULT_PORT: u16 = 8883;
const KEEP_ALIVE: Duration = Duration::from_secs(90);
const DISCONNECT_FLUSH: Duration = Duration::from_secs(1);

/// Split `host[:port]`, defaulting to the TLS port.
pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16)> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        bail!("MQTT endpoint is empty");
    }
    match endpoint.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                bail!("MQTT endpoint '{}' has no host", endpoint);
            }
            let port = port
                .parse()
                .map_err(|_| anyhow!("invalid port in MQTT endpoint '{}'", endpoint))?;
            Ok((host.to_string(), port))
        }
        None => Ok((endpoint.to_string(), DEFAULT_PORT)),
    }
}

pub struct MqttTransport {
    config: MqttConfig,
    connect_timeout: Duration,
}

impl MqttTransport {
    pub fn new(config: &MqttConfig, connect_timeout: Duration) -> Self {
        Self {
            config: config.clone(),
            connect_timeout,
        }
    }

    fn options(&self) -> Result<MqttOptions> {
        let (host, port) = parse_endpoint(&self.config.endpoint)?;
        let client_id = match self.config.client_id.trim() {
            "" => format!("xiaozhi-{}", uuid::Uuid::new_v4()),
            id => id.to_string(),
        };
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(KEEP_ALIVE);
        if !self.config.username.is_empty() {
            options.set_credentials(self.config.username.clone(), self.config.password.clone());
        }
        if port == DEFAULT_PORT {
            options.set_transport(BrokerTransport::tls_with_default_config());
        }
        Ok(options)
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn hello_transport(&self) -> &'static str {
        "udp"
    }

    fn carries_audio(&self) -> bool {
        false
    }

    async fn run(self: Box<Self>, events: mpsc::Sender<NetEvent>, mut commands: mpsc::Receiver<NetCommand>) {
        let options = match self.options() {
            Ok(options) => options,
            Err(e) => {
                let _ = events.send(NetEvent::Error(format!("{:#}", e))).await;
                return;
            }
        };
        log::info!("Connecting to MQTT broker {}", self.config.endpoint);
        let (client, mut eventloop) = AsyncClient::new(options, 10);

        let deadline = tokio::time::sleep(self.connect_timeout);
        tokio::pin!(deadline);
        let mut connected = false;

        loop {
            tokio::select! {
                _ = &mut deadline, if !connected => {
                    let _ = events
                        .send(NetEvent::Error(format!("MQTT connect timed out after {:?}", self.connect_timeout)))
                        .await;
                    return;
                }
                polled = eventloop.poll() => match polled {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        log::info!("MQTT connected");
                        connected = true;
                        if let Some(topic) = &self.config.subscribe_topic {
                            if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                                log::warn!("MQTT subscribe to {} failed: {}", topic, e);
                            }
                        }
                        if events.send(NetEvent::Connected).await.is_err() {
                            return;
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => match String::from_utf8(publish.payload.to_vec()) {
                        Ok(text) => {
                            if events.send(NetEvent::Text(text)).await.is_err() {
                                return;
                            }
                        }
                        Err(_) => log::warn!("Dropping non-UTF-8 MQTT message on {}", publish.topic),
                    },
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        log::warn!("MQTT broker closed the session");
                        if connected {
                            let _ = events.send(NetEvent::Disconnected).await;
                        }
                        let _ = events.send(NetEvent::Error("MQTT broker disconnected".to_string())).await;
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::error!("MQTT connection error: {}", e);
                        if connected {
                            let _ = events.send(NetEvent::Disconnected).await;
                        }
                        let _ = events.send(NetEvent::Error(format!("MQTT connection failed: {}", e))).await;
                        return;
                    }
                },
                cmd = commands.recv() => match cmd {
                    Some(NetCommand::SendText(text)) => {
                        if let Err(e) = client.try_publish(
                            self.config.publish_topic.as_str(),
                            QoS::AtLeastOnce,
                            false,
                            text.into_bytes(),
                        ) {
                            log::warn!("MQTT publish failed: {}", e);
                        }
                    }
                    Some(NetCommand::SendBinary(_)) => log::warn!("MQTT link does not carry audio, dropping frame"),
                    Some(NetCommand::Close) | None => {
                        let _ = client.try_disconnect();
                        // Let the event loop put DISCONNECT on the wire.
                        let _ = tokio::time::timeout(DISCONNECT_FLUSH, async {
                            loop {
                                match eventloop.poll().await {
                                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                                    Ok(_) => {}
                                }
                            }
                        })
                        .await;
                        log::info!("MQTT closed locally");
                        return;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_defaults_to_tls_port() {
        assert_eq!(parse_endpoint("mqtt.example.com").unwrap(), ("mqtt.example.com".to_string(), 8883));
        assert_eq!(parse_endpoint(" broker:1883 ").unwrap(), ("broker".to_string(), 1883));
        assert!(parse_endpoint("").is_err());
        assert!(parse_endpoint(":1883").is_err());
        assert!(parse_endpoint("broker:port").is_err());
    }

    #[test]
    fn link_is_control_only() {
        let transport = MqttTransport::new(&MqttConfig::default(), Duration::from_secs(1));
        assert_eq!(transport.hello_transport(), "udp");
        assert!(!transport.carries_audio());
    }

    #[tokio::test]
    async fn bad_endpoint_is_a_terminal_error() {
        let transport = Box::new(MqttTransport::new(&MqttConfig::default(), Duration::from_secs(1)));
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let (_commands_tx, commands_rx) = mpsc::channel(4);
        transport.run(events_tx, commands_rx).await;
        match events_rx.recv().await {
            Some(NetEvent::Error(e)) => assert!(e.contains("empty")),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn refused_broker_is_a_terminal_error() {
        let addr = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let config = MqttConfig {
            endpoint: format!("127.0.0.1:{}", addr.port()),
            client_id: "test-client".to_string(),
            publish_topic: "device/out".to_string(),
            ..MqttConfig::default()
        };
        let transport = Box::new(MqttTransport::new(&config, Duration::from_secs(2)));
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let (_commands_tx, commands_rx) = mpsc::channel(4);
        transport.run(events_tx, commands_rx).await;
        match events_rx.recv().await {
            Some(NetEvent::Error(e)) => assert!(e.starts_with("MQTT")),
            other => panic!("expected error, got {:?}", other),
        }
    }
}
