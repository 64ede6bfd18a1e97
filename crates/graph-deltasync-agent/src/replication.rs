//! MQTT transport for wire messages.

use async_trait::async_trait;
use graph_deltasync_engine::{Delivery, MessageHandler, Subscription, Transport, TransportError};
use graph_deltasync_proto::{ChannelScheme, WireMessage};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use url::Url;

type Handlers = Arc<Mutex<HashMap<u64, MessageHandler>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Publishes wire messages as CBOR and dispatches inbound ones to handlers.
pub struct MqttTransport {
    client: AsyncClient,
    scheme: ChannelScheme,
    handlers: Handlers,
    next_handler: AtomicU64,
    connected: watch::Sender<bool>,
}

impl MqttTransport {
    /// Create a transport. The returned event loop must be driven with
    /// [`MqttTransport::pump`].
    ///
    /// # Errors
    ///
    /// Returns error if the broker URL is invalid.
    pub fn new(
        mqtt_broker: &str,
        client_id: &str,
        scheme: ChannelScheme,
    ) -> Result<(Arc<Self>, EventLoop), ReplicationError> {
        let (host, port) = parse_mqtt_url(mqtt_broker)?;

        let mut mqtt_options = MqttOptions::new(client_id, host, port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);
        let (connected, _) = watch::channel(false);

        Ok((
            Arc::new(Self {
                client,
                scheme,
                handlers: Arc::new(Mutex::new(HashMap::new())),
                next_handler: AtomicU64::new(0),
                connected,
            }),
            eventloop,
        ))
    }

    /// Subscribe to every channel of the tenant.
    ///
    /// # Errors
    ///
    /// Returns error if subscription fails.
    pub async fn subscribe_tenant(&self) -> Result<(), ReplicationError> {
        let topic = self.scheme.tenant_wildcard();

        tracing::info!(topic, "Subscribing to replication topic");

        self.client
            .subscribe(&topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| ReplicationError::Subscribe(e.to_string()))?;

        Ok(())
    }

    /// Connectivity updates, `true` after each broker acknowledgement.
    #[must_use]
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// Drive the MQTT event loop, dispatching inbound messages.
    pub async fn pump(self: Arc<Self>, mut eventloop: EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    tracing::info!("Connected to MQTT broker");
                    self.connected.send_replace(true);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    tracing::debug!(
                        topic = %publish.topic,
                        payload_len = publish.payload.len(),
                        "Received replication message"
                    );
                    if self.scheme.parse(&publish.topic).is_none() {
                        continue;
                    }
                    match WireMessage::from_cbor(&publish.payload) {
                        Ok(message) => self.dispatch(&message),
                        Err(err) => tracing::warn!(error = %err, "Failed to decode wire message"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    if self.connected.send_replace(false) {
                        tracing::warn!("Disconnected from MQTT broker");
                    }
                    tracing::error!(error = %e, "MQTT error");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    fn dispatch(&self, message: &WireMessage) {
        let handlers: Vec<MessageHandler> = lock(&self.handlers).values().cloned().collect();
        for handler in handlers {
            handler(message.clone());
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn send(&self, message: &WireMessage) -> Result<Delivery, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Unavailable("not connected to MQTT broker".to_string()));
        }

        let topic = self.scheme.topic_for(message);
        let payload = message
            .to_cbor()
            .map_err(|e| TransportError::Failed(e.to_string()))?;

        tracing::debug!(topic, kind = message.kind(), payload_len = payload.len(), "Publishing message");

        self.client
            .publish(&topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Failed(e.to_string()))?;

        Ok(Delivery::Accepted)
    }

    fn subscribe(&self, handler: MessageHandler) -> Subscription {
        let id = self.next_handler.fetch_add(1, Ordering::Relaxed);
        lock(&self.handlers).insert(id, handler);

        let handlers = Arc::clone(&self.handlers);
        Subscription::new(move || {
            lock(&handlers).remove(&id);
        })
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }
}

/// Parse MQTT URL into host and port.
fn parse_mqtt_url(input: &str) -> Result<(String, u16), ReplicationError> {
    if input.contains("://") {
        let url = Url::parse(input)
            .map_err(|e| ReplicationError::InvalidBrokerUrl(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => {
                return Err(ReplicationError::InvalidBrokerUrl(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| ReplicationError::InvalidBrokerUrl(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(1883);

        return Ok((host.to_string(), port));
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ReplicationError::InvalidBrokerUrl(format!("{input}: missing host")))?;
    let port = match parts.next() {
        None => 1883,
        Some(port) => port.parse().map_err(|_| {
            ReplicationError::InvalidBrokerUrl(format!("{input}: invalid port '{port}'"))
        })?,
    };
    if parts.next().is_some() {
        return Err(ReplicationError::InvalidBrokerUrl(format!(
            "{input}: too many ':' separators"
        )));
    }

    Ok((host.to_string(), port))
}

/// Errors for replication operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReplicationError {
    /// Subscription failed
    #[error("subscription error: {0}")]
    Subscribe(String),
    /// Invalid MQTT broker URL
    #[error("invalid MQTT broker URL: {0}")]
    InvalidBrokerUrl(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_broker_urls() {
        assert_eq!(parse_mqtt_url("tcp://broker:1884").unwrap(), ("broker".to_string(), 1884));
        assert_eq!(parse_mqtt_url("mqtt://broker").unwrap(), ("broker".to_string(), 1883));
        assert_eq!(parse_mqtt_url("localhost").unwrap(), ("localhost".to_string(), 1883));
        assert_eq!(parse_mqtt_url("10.0.0.2:1999").unwrap(), ("10.0.0.2".to_string(), 1999));
    }

    #[test]
    fn rejects_bad_broker_urls() {
        assert!(parse_mqtt_url("ws://broker").is_err());
        assert!(parse_mqtt_url(":1883").is_err());
        assert!(parse_mqtt_url("host:port").is_err());
        assert!(parse_mqtt_url("a:1:2").is_err());
    }

    #[tokio::test]
    async fn unconnected_transport_reports_unavailable() {
        let (transport, _eventloop) =
            MqttTransport::new("tcp://localhost:1883", "test-client", ChannelScheme::new("t")).unwrap();
        assert!(!transport.is_connected());

        let ack = WireMessage::Ack(graph_deltasync_proto::AckBatch {
            acker_id: "a".to_string(),
            source_id: "b".to_string(),
            ids: Vec::new(),
        });
        assert!(matches!(transport.send(&ack).await, Err(TransportError::Unavailable(_))));

        let subscription = transport.subscribe(Arc::new(|_: WireMessage| {}));
        assert_eq!(lock(&transport.handlers).len(), 1);
        drop(subscription);
        assert!(lock(&transport.handlers).is_empty());
    }
}
