use crate::alert::AlertStatus;
use crate::config::Config;
use crate::error::{PublishError, TransportError};
use crate::ingest::{AlertPublisher, NodeLanes};
use crate::stats::IngestStats;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, QoS,
    SubscribeReasonCode,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const CLIENT_CHANNEL_CAPACITY: usize = 32;
const NODE_ID_PLACEHOLDER: &str = "{node_id}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Subscribed,
}

struct Link {
    state: LinkState,
    stats: Arc<IngestStats>,
}

impl Link {
    fn new(stats: Arc<IngestStats>) -> Self {
        Self {
            state: LinkState::Disconnected,
            stats,
        }
    }

    fn enter(&mut self, next: LinkState) {
        if self.state == next {
            return;
        }
        tracing::debug!(from = ?self.state, to = ?next, "mqtt link state");
        self.state = next;
        self.stats
            .set_mqtt_connected(matches!(next, LinkState::Subscribed));
    }
}

fn mqtt_options(config: &Config) -> MqttOptions {
    let mut options = MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_host.clone(),
        config.mqtt_port,
    );
    options.set_keep_alive(config.mqtt_keepalive());
    options.set_clean_session(true);
    if let Some(username) = &config.mqtt_username {
        options.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }
    options
}

/// Connects to the broker and subscribes to the sensor topic. Returns once
/// the subscription is acknowledged; the event loop must be handed to
/// [`run_listener`] right after.
pub async fn connect(
    config: &Config,
    stats: Arc<IngestStats>,
) -> Result<(AsyncClient, EventLoop), TransportError> {
    let mut link = Link::new(stats);
    link.enter(LinkState::Connecting);
    tracing::info!(
        host=%config.mqtt_host,
        port = config.mqtt_port,
        client_id=%config.mqtt_client_id,
        "connecting to mqtt broker"
    );

    let (client, mut eventloop) = AsyncClient::new(mqtt_options(config), CLIENT_CHANNEL_CAPACITY);
    let wait = config.connect_timeout();

    let result = async {
        timeout(wait, await_connack(&mut eventloop))
            .await
            .map_err(|_| TransportError::Timeout(wait, "CONNACK"))??;

        client
            .subscribe(config.sensor_topic.clone(), QoS::AtLeastOnce)
            .await?;
        timeout(wait, await_suback(&mut eventloop, &config.sensor_topic))
            .await
            .map_err(|_| TransportError::Timeout(wait, "SUBACK"))??;
        Ok::<(), TransportError>(())
    }
    .await;

    match result {
        Ok(()) => {
            link.enter(LinkState::Subscribed);
            tracing::info!(topic=%config.sensor_topic, "subscribed to sensor feed");
            Ok((client, eventloop))
        }
        Err(err) => {
            link.enter(LinkState::Disconnected);
            Err(err)
        }
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        if let Event::Incoming(Incoming::ConnAck(ack)) = eventloop.poll().await? {
            if ack.code != ConnectReturnCode::Success {
                return Err(TransportError::Refused(ack.code));
            }
            return Ok(());
        }
    }
}

async fn await_suback(eventloop: &mut EventLoop, topic: &str) -> Result<(), TransportError> {
    loop {
        if let Event::Incoming(Incoming::SubAck(ack)) = eventloop.poll().await? {
            if ack
                .return_codes
                .iter()
                .any(|code| matches!(code, SubscribeReasonCode::Failure))
            {
                return Err(TransportError::SubscriptionRejected(topic.to_string()));
            }
            return Ok(());
        }
    }
}

/// Polls the broker and hands every sensor payload to the node lanes. Only
/// returns on a connection error; message-level failures never surface here.
pub async fn run_listener(
    mut eventloop: EventLoop,
    sensor_topic: String,
    lanes: NodeLanes,
    stats: Arc<IngestStats>,
) -> Result<(), TransportError> {
    let mut link = Link::new(stats);
    link.enter(LinkState::Subscribed);
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                if !topic_matches(&sensor_topic, &publish.topic) {
                    tracing::trace!(topic=%publish.topic, "ignoring message on unrelated topic");
                    continue;
                }
                lanes.dispatch_payload(&publish.topic, &publish.payload);
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                link.enter(LinkState::Disconnected);
                tracing::error!("broker sent disconnect");
                return Err(TransportError::ClosedByBroker);
            }
            Ok(_) => {}
            Err(err) => {
                link.enter(LinkState::Disconnected);
                tracing::error!(error=%err, "mqtt connection lost");
                return Err(err.into());
            }
        }
    }
}

/// MQTT topic filter match with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

pub fn alert_topic_for(template: &str, node_id: &str) -> String {
    template.replace(NODE_ID_PLACEHOLDER, node_id)
}

#[derive(Debug, Serialize)]
struct StatusMessage {
    status: u8,
}

pub fn encode_status(status: AlertStatus) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&StatusMessage {
        status: status.as_flag(),
    })
}

/// Publishes alert transitions over the listener's client. Publishing only
/// enqueues into the client; delivery needs the event loop to keep polling.
#[derive(Clone)]
pub struct MqttAlertPublisher {
    client: AsyncClient,
    topic_template: String,
    publish_timeout: Duration,
}

impl MqttAlertPublisher {
    pub fn new(client: AsyncClient, topic_template: impl Into<String>, publish_timeout: Duration) -> Self {
        Self {
            client,
            topic_template: topic_template.into(),
            publish_timeout,
        }
    }
}

#[async_trait]
impl AlertPublisher for MqttAlertPublisher {
    async fn publish_status(&self, node_id: &str, status: AlertStatus) -> Result<(), PublishError> {
        let topic = alert_topic_for(&self.topic_template, node_id);
        let payload = Bytes::from(encode_status(status)?);
        timeout(
            self.publish_timeout,
            self.client
                .publish_bytes(topic.clone(), QoS::AtLeastOnce, false, payload),
        )
        .await
        .map_err(|_| PublishError::Timeout(self.publish_timeout))??;
        tracing::debug!(topic=%topic, node=%node_id, status = status.as_flag(), "published alert status");
        Ok(())
    }
}
