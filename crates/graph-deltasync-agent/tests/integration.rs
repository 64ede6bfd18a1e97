use graph_deltasync_core::{DeltaOperation, GraphDelta, TargetKind};
use graph_deltasync_proto::{Channel, ChannelScheme, OrderedMessage, Payload, WireMessage};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use uuid::Uuid;

fn parse_mqtt_url(url: &str) -> (String, u16) {
    let url = url
        .strip_prefix("tcp://")
        .or_else(|| url.strip_prefix("mqtt://"))
        .unwrap_or(url);

    let parts: Vec<&str> = url.split(':').collect();

    let host = parts.first().copied().unwrap_or("localhost").to_string();
    let port = parts.get(1).and_then(|p| p.parse().ok()).unwrap_or(1883);

    (host, port)
}

async fn spawn_eventloop(mut eventloop: EventLoop) {
    loop {
        if eventloop.poll().await.is_err() {
            break;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mqtt_ordered_message_roundtrip() {
    if std::env::var("DELTASYNC_INTEGRATION").is_err() {
        eprintln!("Skipping integration test; set DELTASYNC_INTEGRATION=1 to run");
        return;
    }

    let broker = std::env::var("DELTASYNC_MQTT_BROKER")
        .unwrap_or_else(|_| "tcp://localhost:1883".to_string());
    let (host, port) = parse_mqtt_url(&broker);

    let scheme = ChannelScheme::new("integration");
    let topic = scheme.topic(Channel::Updates);

    let mut sub_opts = MqttOptions::new(format!("sub-{}", Uuid::new_v4()), host.clone(), port);
    sub_opts.set_keep_alive(Duration::from_secs(5));
    let (sub_client, mut sub_eventloop) = AsyncClient::new(sub_opts, 10);
    sub_client
        .subscribe(scheme.tenant_wildcard(), QoS::AtLeastOnce)
        .await
        .unwrap();

    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        loop {
            match sub_eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let _ = tx.send((publish.topic.clone(), publish.payload.to_vec()));
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    let mut pub_opts = MqttOptions::new(format!("pub-{}", Uuid::new_v4()), host, port);
    pub_opts.set_keep_alive(Duration::from_secs(5));
    let (pub_client, pub_eventloop) = AsyncClient::new(pub_opts, 10);
    tokio::spawn(spawn_eventloop(pub_eventloop));

    tokio::time::sleep(Duration::from_millis(200)).await;

    let delta = GraphDelta::generate("edge-1", 1_000)
        .with_operation(DeltaOperation::update(TargetKind::Node, "n1", serde_json::json!({"temp": 42})));
    let payload = Payload::Delta(delta.clone());
    let message = WireMessage::Ordered(
        OrderedMessage::new("edge-1", 1, payload.message_type(), payload.to_value().unwrap(), 1_000).with_ack(),
    );
    assert_eq!(scheme.topic_for(&message), topic);

    pub_client
        .publish(&topic, QoS::AtLeastOnce, false, message.to_cbor().unwrap())
        .await
        .unwrap();

    let (received_topic, received) = timeout(Duration::from_secs(5), rx)
        .await
        .expect("timeout waiting for MQTT message")
        .expect("subscriber dropped");

    assert_eq!(scheme.parse(&received_topic), Some(Channel::Updates));
    let WireMessage::Ordered(decoded) = WireMessage::from_cbor(&received).unwrap() else {
        panic!("expected an ordered message");
    };
    assert!(decoded.verify_hash());
    assert_eq!(decoded.payload().unwrap(), Payload::Delta(delta));
}
