//! OTA provisioning: ask the server whether this device is activated and
//! where its voice session lives.

use crate::config::{Config, MqttConfig, TransportKind};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WebsocketEndpoint {
    pub url: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ActivationInfo {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct OtaResponse {
    websocket: Option<WebsocketEndpoint>,
    mqtt: Option<MqttConfig>,
    activation: Option<ActivationInfo>,
}

/// Endpoints handed out to an activated device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provisioning {
    pub websocket: Option<WebsocketEndpoint>,
    pub mqtt: Option<MqttConfig>,
}

impl Provisioning {
    /// Overlay the provisioned endpoints onto the build-time configuration.
    pub fn apply(&self, config: &mut Config) {
        if let Some(ws) = &self.websocket {
            config.network.ws_url = ws.url.clone();
            if !ws.token.is_empty() {
                config.network.ws_token = ws.token.clone();
            }
        }
        if let Some(mqtt) = &self.mqtt {
            if !mqtt.endpoint.is_empty() {
                config.mqtt = mqtt.clone();
            }
        }
        // Without MQTT credentials there is nothing else to talk to.
        if config.network.transport == TransportKind::Mqtt && config.mqtt.endpoint.is_empty() {
            log::warn!("MQTT selected but not provisioned, falling back to WebSocket");
            config.network.transport = TransportKind::WebSocket;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationResult {
    Activated(Provisioning),
    NeedActivation(ActivationInfo), // 包含 6 位验证码
    Error(String),
}

pub async fn check_device_activation(config: &Config) -> ActivationResult {
    let http_url = config.network.ota_url.as_str();
    if http_url.is_empty() {
        log::info!("No OTA URL configured, using built-in endpoints");
        return ActivationResult::Activated(Provisioning::default());
    }

    let client = match Client::builder().timeout(config.network.connect_timeout).build() {
        Ok(client) => client,
        Err(e) => return ActivationResult::Error(format!("HTTP client error: {}", e)),
    };

    log::info!("Checking activation status via HTTP: {}", http_url);

    let mac = mac_address::get_mac_address()
        .ok()
        .flatten()
        .map(|m| m.to_string().to_lowercase())
        .unwrap_or_else(|| config.network.device_id.clone());
    let body = json!({
        "uuid": config.network.client_id,
        "mac_address": mac,
        "application": {
            "name": env!("APP_NAME"),
            "version": env!("APP_VERSION")
        },
        "ota": {},
        "board": {
            "type": env!("BOARD_TYPE"),
            "name": env!("BOARD_NAME")
        }
    });

    let response = client
        .post(http_url)
        .header("Device-Id", &config.network.device_id)
        .header("Client-Id", &config.network.client_id)
        .header("Content-Type", "application/json")
        .header("Accept-Language", "zh-CN")
        .json(&body)
        .send()
        .await;

    match response {
        Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
            Ok(json) => parse_response(json),
            Err(e) => ActivationResult::Error(format!("JSON parse error: {}", e)),
        },
        Ok(resp) => ActivationResult::Error(format!("HTTP Error: {}", resp.status())),
        Err(e) => ActivationResult::Error(format!("Request failed: {}", e)),
    }
}

fn parse_response(json: Value) -> ActivationResult {
    let response: OtaResponse = match serde_json::from_value(json) {
        Ok(r) => r,
        Err(e) => return ActivationResult::Error(format!("Unexpected OTA response: {}", e)),
    };
    match response.activation {
        Some(activation) if !activation.code.is_empty() => ActivationResult::NeedActivation(activation),
        // 如果没有 activation 字段，或者字段为空，视为已激活
        _ => ActivationResult::Activated(Provisioning {
            websocket: response.websocket,
            mqtt: response.mqtt,
        }),
    }
}
