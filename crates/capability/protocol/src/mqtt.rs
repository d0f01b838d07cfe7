//! MQTT 发布传输
//!
//! 写入路径把命令发布到设备的命令 topic；订阅由采集侧的 MqttSource 负责。

use crate::error::TransportError;
use crate::transport::{Timeouts, Transport};
use crate::types::{Reply, Request};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

/// Broker 连接参数。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// 订阅与发布 topic 的公共前缀
    pub topic_prefix: String,
    pub qos: u8,
}

impl MqttSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            topic_prefix: String::new(),
            qos: 0,
        }
    }

    /// 构造客户端参数；`role` 区分同一插件的发布与订阅连接。
    pub fn options(&self, role: &str) -> MqttOptions {
        let client_id = format!("devgw-{}-{}", role, uuid::Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (self.username.as_ref(), self.password.as_ref()) {
            options.set_credentials(username, password);
        }
        options
    }

    /// 拼接前缀与相对 topic。
    pub fn topic(&self, relative: &str) -> String {
        let prefix = self.topic_prefix.trim_end_matches('/');
        let relative = relative.trim_start_matches('/');
        if prefix.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{}", prefix, relative)
        }
    }
}

pub fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

/// MQTT 发布传输
pub struct MqttTransport {
    settings: MqttSettings,
    timeouts: Timeouts,
    client: Option<AsyncClient>,
    connected: Arc<AtomicBool>,
    eventloop: Option<JoinHandle<()>>,
}

impl MqttTransport {
    pub fn new(settings: MqttSettings, timeouts: Timeouts) -> Self {
        Self {
            settings,
            timeouts,
            client: None,
            connected: Arc::new(AtomicBool::new(false)),
            eventloop: None,
        }
    }

    async fn wait_connected(&self) -> bool {
        let deadline = Instant::now() + self.timeouts.connect;
        while Instant::now() < deadline {
            if self.connected.load(Ordering::Acquire) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.connected.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn kind(&self) -> &'static str {
        "mqtt"
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        if self.client.is_some() && self.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        self.close().await;

        let (client, mut eventloop) = rumqttc::AsyncClient::new(self.settings.options("publish"), 10);
        let connected = Arc::clone(&self.connected);
        let broker = format!("{}:{}", self.settings.host, self.settings.port);
        let handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        connected.store(true, Ordering::Release);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        if connected.swap(false, Ordering::AcqRel) {
                            warn!(target: "devgw.protocol", broker = %broker, error = %err, "mqtt_publish_eventloop_error");
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
        self.client = Some(client);
        self.eventloop = Some(handle);

        if !self.wait_connected().await {
            self.close().await;
            return Err(TransportError::Connect(format!(
                "broker {}:{} not reachable",
                self.settings.host, self.settings.port
            )));
        }
        info!(
            target: "devgw.protocol",
            host = %self.settings.host,
            port = self.settings.port,
            "mqtt_connected"
        );
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.try_disconnect();
        }
        if let Some(handle) = self.eventloop.take() {
            handle.abort();
        }
        self.connected.store(false, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        self.client.is_some() && self.connected.load(Ordering::Acquire)
    }

    async fn request(&mut self, request: Request) -> Result<Reply, TransportError> {
        match request {
            Request::Publish {
                topic,
                payload,
                retain,
            } => {
                if !self.connected.load(Ordering::Acquire) {
                    return Err(TransportError::NotOpen);
                }
                let client = self.client.as_ref().ok_or(TransportError::NotOpen)?;
                let topic = self.settings.topic(&topic);
                tokio::time::timeout(
                    self.timeouts.request,
                    client.publish(topic, qos_from_u8(self.settings.qos), retain, payload),
                )
                .await
                .map_err(|_| TransportError::Timeout("mqtt publish".to_string()))?
                .map_err(|err| TransportError::Io(err.to_string()))?;
                Ok(Reply::Ack)
            }
            other => Err(TransportError::Unsupported(format!(
                "mqtt cannot {}",
                other.describe()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_joins_prefix() {
        let mut settings = MqttSettings::new("broker", 1883);
        assert_eq!(settings.topic("/heating/set"), "heating/set");
        settings.topic_prefix = "home/".to_string();
        assert_eq!(settings.topic("heating/set"), "home/heating/set");
    }

    #[tokio::test]
    async fn publish_before_open_is_not_open() {
        let mut transport = MqttTransport::new(MqttSettings::new("127.0.0.1", 1883), Timeouts::default());
        let err = transport
            .request(Request::Publish {
                topic: "x".to_string(),
                payload: b"1".to_vec(),
                retain: false,
            })
            .await
            .expect_err("closed");
        assert!(matches!(err, TransportError::NotOpen));
        assert!(!transport.is_open());
    }
}
