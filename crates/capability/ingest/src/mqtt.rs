//! MQTT 订阅采集
//!
//! 每次 ConnAck 后重新订阅全部过滤器；负载类型取第一个匹配的过滤器。

use crate::event::{IngestError, ListenerKind, PayloadFormat, PushEvent, PushHandler, Source};
use async_trait::async_trait;
use devgw_protocol::{MqttSettings, qos_from_u8};
use rumqttc::{AsyncClient, Event, Packet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// 订阅过滤器（已带前缀的完整 topic 过滤器）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    pub pattern: String,
    pub format: PayloadFormat,
}

impl TopicFilter {
    pub fn new(pattern: impl Into<String>, format: PayloadFormat) -> Self {
        Self {
            pattern: pattern.into(),
            format,
        }
    }
}

/// MQTT 过滤器匹配，支持 `+` 与 `#`。
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(level)) if expected == level => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// MQTT 订阅采集源
pub struct MqttSource {
    settings: MqttSettings,
    filters: Vec<TopicFilter>,
}

impl MqttSource {
    pub fn new(settings: MqttSettings, filters: Vec<TopicFilter>) -> Self {
        Self { settings, filters }
    }

    pub fn filters(&self) -> &[TopicFilter] {
        &self.filters
    }

    /// 按声明顺序取第一个匹配过滤器的负载类型。
    pub fn format_for(&self, topic: &str) -> Option<PayloadFormat> {
        self.filters
            .iter()
            .find(|filter| topic_matches(&filter.pattern, topic))
            .map(|filter| filter.format)
    }

    async fn subscribe_all(&self, client: &AsyncClient) -> Result<(), IngestError> {
        let qos = qos_from_u8(self.settings.qos);
        for filter in &self.filters {
            client
                .subscribe(filter.pattern.clone(), qos)
                .await
                .map_err(|err| IngestError::Source(err.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Source for MqttSource {
    fn name(&self) -> String {
        format!("mqtt:{}:{}", self.settings.host, self.settings.port)
    }

    async fn run(
        &self,
        handler: Arc<dyn PushHandler>,
        cancel: CancellationToken,
    ) -> Result<(), IngestError> {
        let label = self.name();
        let (client, mut eventloop) = AsyncClient::new(self.settings.options("sub"), 64);
        loop {
            let polled = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = client.disconnect().await;
                    return Ok(());
                }
                polled = eventloop.poll() => polled,
            };
            match polled {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(target: "devgw.ingest", listener = %label, filters = self.filters.len(), "mqtt_subscriber_connected");
                    self.subscribe_all(&client).await?;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let Some(format) = self.format_for(&publish.topic) else {
                        debug!(target: "devgw.ingest", topic = %publish.topic, "mqtt_topic_unmatched");
                        continue;
                    };
                    let event =
                        PushEvent::new(ListenerKind::Mqtt, label.clone(), publish.payload.to_vec())
                            .with_topic(publish.topic.clone())
                            .with_format(format);
                    if let Err(err) = handler.handle(event).await {
                        warn!(target: "devgw.ingest", topic = %publish.topic, error = %err, "push_event_failed");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(target: "devgw.ingest", listener = %label, error = %err, "mqtt_subscriber_error");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
            }
        }
    }
}
