//! Integration Tests for the mqgate MQTT Broker
//!
//! These tests run a real broker on a loopback port, connect raw MQTT
//! clients over TCP and check both the wire behavior and the metrics the
//! broker keeps about it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use mqgate::broker::{Broker, BrokerConfig};
use mqgate::codec::{Decoder, Encoder};
use mqgate::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, Publish, QoS, SubAck, SubAckReturnCode,
    Subscribe, Subscription, Unsubscribe, Will,
};

// Atomic port counter to avoid port conflicts between tests
static PORT_COUNTER: AtomicU16 = AtomicU16::new(19000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Test configuration helper
fn test_config(port: u16) -> BrokerConfig {
    BrokerConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], port)),
        connect_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(1),
        num_workers: 2,
        ..Default::default()
    }
}

struct TestBroker {
    broker: Arc<Broker>,
    addr: SocketAddr,
    task: JoinHandle<std::io::Result<()>>,
}

impl TestBroker {
    async fn start() -> Self {
        let config = test_config(next_port());
        let addr = config.bind_addr;
        let broker = Arc::new(Broker::new(config));

        let runner = broker.clone();
        let task = tokio::spawn(async move { runner.run().await });

        // Give the listener a moment to bind
        tokio::time::sleep(Duration::from_millis(100)).await;
        Self { broker, addr, task }
    }

    async fn stop(self) {
        self.broker.shutdown();
        let result = timeout(Duration::from_secs(5), self.task)
            .await
            .expect("broker did not stop in time")
            .expect("broker task panicked");
        assert!(result.is_ok());
    }
}

/// Poll `check` until it holds or two seconds pass
async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Helper struct for MQTT client operations in tests
struct TestClient {
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
    read_buf: BytesMut,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("Failed to connect");
        Self {
            stream,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            read_buf: BytesMut::with_capacity(4096),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let mut buf = BytesMut::new();
        self.encoder
            .encode(packet, &mut buf)
            .expect("Failed to encode");
        self.stream.write_all(&buf).await.expect("Failed to write");
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("Failed to write");
    }

    /// Next packet from the broker, or None on close or timeout
    async fn recv_within(&mut self, wait: Duration) -> Option<Packet> {
        loop {
            if let Ok(Some((packet, consumed))) = self.decoder.decode(&self.read_buf) {
                self.read_buf.advance(consumed);
                return Some(packet);
            }

            match timeout(wait, self.stream.read_buf(&mut self.read_buf)).await {
                Ok(Ok(n)) if n > 0 => continue,
                _ => return None,
            }
        }
    }

    async fn recv(&mut self) -> Option<Packet> {
        self.recv_within(Duration::from_secs(5)).await
    }

    /// True when nothing arrives for a short while
    async fn expect_silence(&mut self) -> bool {
        self.recv_within(Duration::from_millis(200)).await.is_none()
    }

    /// True once the broker has closed the socket
    async fn is_closed(&mut self) -> bool {
        let mut buf = [0u8; 64];
        matches!(
            timeout(Duration::from_secs(5), self.stream.read(&mut buf)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }

    async fn connect_with(&mut self, connect: Connect) -> ConnAck {
        self.send(&Packet::Connect(Box::new(connect))).await;
        match self.recv().await {
            Some(Packet::ConnAck(ack)) => ack,
            other => panic!("Expected CONNACK, got {:?}", other),
        }
    }

    async fn mqtt_connect(&mut self, client_id: &str) -> ConnAck {
        self.connect_with(Connect::new(client_id)).await
    }

    async fn subscribe(&mut self, packet_id: u16, filters: &[&str]) -> SubAck {
        let subscribe = Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions: filters
                .iter()
                .map(|f| Subscription::new(*f, QoS::AtMostOnce))
                .collect(),
        });
        self.send(&subscribe).await;

        match self.recv().await {
            Some(Packet::SubAck(ack)) => ack,
            other => panic!("Expected SUBACK, got {:?}", other),
        }
    }

    async fn publish(&mut self, topic: &str, payload: &'static [u8]) {
        let publish = Packet::Publish(Publish {
            topic: Arc::from(topic),
            payload: Bytes::from_static(payload),
            ..Default::default()
        });
        self.send(&publish).await;
    }

    async fn recv_publish(&mut self) -> Publish {
        match self.recv().await {
            Some(Packet::Publish(p)) => p,
            other => panic!("Expected PUBLISH, got {:?}", other),
        }
    }

    async fn disconnect(&mut self) {
        self.send(&Packet::Disconnect).await;
    }
}

fn will(topic: &str, payload: &'static [u8]) -> Will {
    Will {
        topic: topic.to_string(),
        payload: Bytes::from_static(payload),
        qos: QoS::AtMostOnce,
        retain: false,
    }
}

#[tokio::test]
async fn test_connect_accepted() {
    let broker = TestBroker::start().await;

    let mut client = TestClient::connect(broker.addr).await;
    let connack = client.mqtt_connect("client-a").await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);
    assert!(!connack.session_present);

    assert!(wait_until(|| broker.broker.session_count() == 1).await);
    let snapshot = broker.broker.metrics().snapshot();
    assert_eq!(snapshot.connect_attempts, 1);
    assert_eq!(snapshot.connect_successes, 1);
    assert_eq!(snapshot.connections_current, 1);

    broker.stop().await;
}

#[tokio::test]
async fn test_connect_mqtt_31() {
    let broker = TestBroker::start().await;

    let mut client = TestClient::connect(broker.addr).await;
    let connack = client
        .connect_with(Connect::with_version(
            mqgate::ProtocolVersion::V31,
            "legacy",
        ))
        .await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);

    broker.stop().await;
}

#[tokio::test]
async fn test_connect_refusals() {
    let broker = TestBroker::start().await;

    // MQTT 5 is not served
    let mut client = TestClient::connect(broker.addr).await;
    let mut connect = Connect::new("v5");
    connect.protocol_level = 5;
    let connack = client.connect_with(connect).await;
    assert_eq!(
        connack.return_code,
        ConnectReturnCode::UnacceptableProtocolVersion
    );
    assert!(client.is_closed().await);

    // Password without a user name
    let mut client = TestClient::connect(broker.addr).await;
    let mut connect = Connect::new("nopass");
    connect.password = Some(Bytes::from_static(b"secret"));
    let connack = client.connect_with(connect).await;
    assert_eq!(connack.return_code, ConnectReturnCode::BadUsernameOrPassword);
    assert!(client.is_closed().await);

    // Persistent sessions are not supported
    let mut client = TestClient::connect(broker.addr).await;
    let mut connect = Connect::new("durable");
    connect.clean_session = false;
    let connack = client.connect_with(connect).await;
    assert_eq!(connack.return_code, ConnectReturnCode::IdentifierRejected);
    assert!(client.is_closed().await);

    // Blank client id
    let mut client = TestClient::connect(broker.addr).await;
    let connack = client.mqtt_connect("   ").await;
    assert_eq!(connack.return_code, ConnectReturnCode::IdentifierRejected);
    assert!(client.is_closed().await);

    let metrics = broker.broker.metrics().clone();
    assert!(wait_until(|| metrics.snapshot().connections_current == 0).await);
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.connect_attempts, 4);
    assert_eq!(snapshot.connect_failures, 4);
    assert_eq!(snapshot.connect_successes, 0);
    assert_eq!(broker.broker.session_count(), 0);

    broker.stop().await;
}

#[tokio::test]
async fn test_first_packet_must_be_connect() {
    let broker = TestBroker::start().await;

    let mut client = TestClient::connect(broker.addr).await;
    client.send(&Packet::PingReq).await;
    assert!(client.is_closed().await);

    broker.stop().await;
}

#[tokio::test]
async fn test_duplicate_client_id_replaces_session() {
    let broker = TestBroker::start().await;

    let mut watcher = TestClient::connect(broker.addr).await;
    watcher.mqtt_connect("watcher").await;
    watcher.subscribe(1, &["wills/#"]).await;

    let mut first = TestClient::connect(broker.addr).await;
    let mut connect = Connect::new("dup");
    connect.will = Some(will("wills/dup", b"first gone"));
    first.connect_with(connect).await;

    let mut second = TestClient::connect(broker.addr).await;
    let connack = second.mqtt_connect("dup").await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);

    // The replaced connection is closed and its Will suppressed
    assert!(first.is_closed().await);
    assert!(watcher.expect_silence().await);

    assert_eq!(broker.broker.session_count(), 2);
    let snapshot = broker.broker.metrics().snapshot();
    assert_eq!(snapshot.wills_published, 0);
    assert_eq!(snapshot.wills_discarded, 1);

    // The new connection is fully usable
    second.send(&Packet::PingReq).await;
    assert_eq!(second.recv().await, Some(Packet::PingResp));

    broker.stop().await;
}

#[tokio::test]
async fn test_will_published_on_abrupt_close() {
    let broker = TestBroker::start().await;

    let mut watcher = TestClient::connect(broker.addr).await;
    watcher.mqtt_connect("watcher").await;
    watcher.subscribe(1, &["status/+"]).await;

    let mut doomed = TestClient::connect(broker.addr).await;
    let mut connect = Connect::new("sensor-1");
    connect.will = Some(will("status/sensor-1", b"offline"));
    doomed.connect_with(connect).await;

    // Drop the socket without DISCONNECT
    drop(doomed);

    let publish = watcher.recv_publish().await;
    assert_eq!(&*publish.topic, "status/sensor-1");
    assert_eq!(publish.payload, Bytes::from_static(b"offline"));
    assert_eq!(publish.qos, QoS::AtMostOnce);

    let metrics = broker.broker.metrics().clone();
    assert!(wait_until(|| metrics.snapshot().wills_published == 1).await);
    assert!(wait_until(|| broker.broker.session_count() == 1).await);

    broker.stop().await;
}

#[tokio::test]
async fn test_will_discarded_on_disconnect() {
    let broker = TestBroker::start().await;

    let mut watcher = TestClient::connect(broker.addr).await;
    watcher.mqtt_connect("watcher").await;
    watcher.subscribe(1, &["status/#"]).await;

    let mut polite = TestClient::connect(broker.addr).await;
    let mut connect = Connect::new("sensor-2");
    connect.will = Some(will("status/sensor-2", b"offline"));
    polite.connect_with(connect).await;
    polite.disconnect().await;
    assert!(polite.is_closed().await);

    assert!(watcher.expect_silence().await);
    let metrics = broker.broker.metrics().clone();
    assert!(wait_until(|| metrics.snapshot().wills_discarded == 1).await);
    assert_eq!(metrics.snapshot().wills_published, 0);

    broker.stop().await;
}

#[tokio::test]
async fn test_qos1_publish_is_acked() {
    let broker = TestBroker::start().await;

    let mut subscriber = TestClient::connect(broker.addr).await;
    subscriber.mqtt_connect("sub").await;
    subscriber.subscribe(1, &["q/1"]).await;

    let mut publisher = TestClient::connect(broker.addr).await;
    publisher.mqtt_connect("pub").await;
    publisher
        .send(&Packet::Publish(Publish {
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: Arc::from("q/1"),
            packet_id: Some(42),
            payload: Bytes::from_static(b"hello"),
            ..Default::default()
        }))
        .await;

    match publisher.recv().await {
        Some(Packet::PubAck(ack)) => assert_eq!(ack.packet_id, 42),
        other => panic!("Expected PUBACK, got {:?}", other),
    }

    // Delivered downgraded to QoS 0, retain cleared
    let delivered = subscriber.recv_publish().await;
    assert_eq!(delivered.qos, QoS::AtMostOnce);
    assert_eq!(delivered.packet_id, None);
    assert!(!delivered.retain);
    assert_eq!(delivered.payload, Bytes::from_static(b"hello"));

    broker.stop().await;
}

#[tokio::test]
async fn test_wildcard_fan_out_and_metrics() {
    let broker = TestBroker::start().await;

    let mut alice = TestClient::connect(broker.addr).await;
    alice.mqtt_connect("alice").await;
    let suback = alice.subscribe(1, &["room/#"]).await;
    assert_eq!(suback.packet_id, 1);
    assert_eq!(
        suback.return_codes,
        vec![SubAckReturnCode::Granted(QoS::AtMostOnce)]
    );

    let mut bob = TestClient::connect(broker.addr).await;
    bob.mqtt_connect("bob").await;
    bob.subscribe(2, &["room/+/temp"]).await;

    let mut publisher = TestClient::connect(broker.addr).await;
    publisher.mqtt_connect("publisher").await;
    publisher.publish("room/kitchen/temp", b"21.5").await;

    let a = alice.recv_publish().await;
    let b = bob.recv_publish().await;
    assert_eq!(&*a.topic, "room/kitchen/temp");
    assert_eq!(&*b.topic, "room/kitchen/temp");
    assert_eq!(a.payload, Bytes::from_static(b"21.5"));

    // The publisher is not subscribed and gets nothing back
    assert!(publisher.expect_silence().await);

    let metrics = broker.broker.metrics().clone();
    assert!(wait_until(|| metrics.snapshot().messages_sent == 2).await);
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.messages_received, 1);
    assert_eq!(snapshot.bytes_received, 4);
    assert_eq!(snapshot.bytes_sent, 8);
    assert_eq!(snapshot.active_topics, 2);
    assert_eq!(snapshot.subscriptions_current, 2);
    assert_eq!(metrics.topic_stats("room/#").unwrap().publish_count, 1);
    assert_eq!(metrics.topic_stats("room/+/temp").unwrap().publish_count, 1);

    let report = broker.broker.metrics_report();
    assert!(report.contains("MQTT BROKER METRICS REPORT"));
    assert!(report.contains("room/#"));

    broker.stop().await;
}

#[tokio::test]
async fn test_overlapping_filters_deliver_once() {
    let broker = TestBroker::start().await;

    let mut client = TestClient::connect(broker.addr).await;
    client.mqtt_connect("overlap").await;
    let suback = client.subscribe(7, &["a/#", "a/+", "a/b"]).await;
    assert_eq!(suback.return_codes.len(), 3);

    let mut publisher = TestClient::connect(broker.addr).await;
    publisher.mqtt_connect("publisher").await;
    publisher.publish("a/b", b"x").await;

    let publish = client.recv_publish().await;
    assert_eq!(&*publish.topic, "a/b");
    assert!(client.expect_silence().await);

    broker.stop().await;
}

#[tokio::test]
async fn test_invalid_filter_fails_only_its_slot() {
    let broker = TestBroker::start().await;

    let mut client = TestClient::connect(broker.addr).await;
    client.mqtt_connect("picky").await;
    let suback = client.subscribe(3, &["ok/#", "bad/#/more", "sport+"]).await;
    assert_eq!(
        suback.return_codes,
        vec![
            SubAckReturnCode::Granted(QoS::AtMostOnce),
            SubAckReturnCode::Failure,
            SubAckReturnCode::Failure,
        ]
    );

    // Connection stays open
    client.send(&Packet::PingReq).await;
    assert_eq!(client.recv().await, Some(Packet::PingResp));
    assert_eq!(broker.broker.subscription_count(), 1);

    broker.stop().await;
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let broker = TestBroker::start().await;

    let mut client = TestClient::connect(broker.addr).await;
    client.mqtt_connect("fickle").await;
    client.subscribe(1, &["news"]).await;

    client
        .send(&Packet::Unsubscribe(Unsubscribe {
            packet_id: 2,
            filters: vec!["news".to_string(), "never-subscribed".to_string()],
        }))
        .await;
    match client.recv().await {
        Some(Packet::UnsubAck(ack)) => assert_eq!(ack.packet_id, 2),
        other => panic!("Expected UNSUBACK, got {:?}", other),
    }

    assert_eq!(broker.broker.publish("news", Bytes::from_static(b"x")), Ok(0));
    assert!(client.expect_silence().await);
    assert_eq!(broker.broker.subscription_count(), 0);
    assert_eq!(broker.broker.metrics().snapshot().active_topics, 0);

    broker.stop().await;
}

#[tokio::test]
async fn test_unsupported_packet_closes_connection() {
    let broker = TestBroker::start().await;

    let mut client = TestClient::connect(broker.addr).await;
    client.mqtt_connect("old-school").await;
    // PUBREL, packet id 1
    client.send_raw(&[0x62, 0x02, 0x00, 0x01]).await;
    assert!(client.is_closed().await);

    let metrics = broker.broker.metrics().clone();
    assert!(wait_until(|| metrics.snapshot().unsupported_messages == 1).await);
    assert!(wait_until(|| broker.broker.session_count() == 0).await);

    broker.stop().await;
}

#[tokio::test]
async fn test_qos2_publish_delivered_at_qos0() {
    let broker = TestBroker::start().await;

    let mut subscriber = TestClient::connect(broker.addr).await;
    subscriber.mqtt_connect("qos2-sub").await;
    subscriber.subscribe(1, &["q/#"]).await;

    let mut client = TestClient::connect(broker.addr).await;
    client.mqtt_connect("exactly-once").await;
    client
        .send(&Packet::Publish(Publish {
            qos: QoS::ExactlyOnce,
            topic: Arc::from("q/2"),
            packet_id: Some(9),
            payload: Bytes::from_static(b"twice"),
            ..Default::default()
        }))
        .await;

    let delivered = subscriber.recv_publish().await;
    assert_eq!(&*delivered.topic, "q/2");
    assert_eq!(delivered.qos, QoS::AtMostOnce);
    assert_eq!(delivered.packet_id, None);
    assert_eq!(&delivered.payload[..], b"twice");

    // No PUBREC; the connection stays usable
    client.send(&Packet::PingReq).await;
    assert_eq!(client.recv().await, Some(Packet::PingResp));

    let metrics = broker.broker.metrics().clone();
    assert_eq!(metrics.snapshot().unsupported_messages, 0);
    assert_eq!(metrics.snapshot().messages_received, 1);

    broker.stop().await;
}

#[tokio::test]
async fn test_ping() {
    let broker = TestBroker::start().await;

    let mut client = TestClient::connect(broker.addr).await;
    client.mqtt_connect("pinger").await;
    client.send(&Packet::PingReq).await;
    assert_eq!(client.recv().await, Some(Packet::PingResp));

    broker.stop().await;
}

#[tokio::test]
async fn test_server_publish() {
    let broker = TestBroker::start().await;

    let mut client = TestClient::connect(broker.addr).await;
    client.mqtt_connect("listener").await;
    client.subscribe(1, &["alerts/+"]).await;

    assert_eq!(
        broker
            .broker
            .publish("alerts/fire", Bytes::from_static(b"!")),
        Ok(1)
    );
    assert!(broker.broker.publish("alerts/#", Bytes::new()).is_err());

    let publish = client.recv_publish().await;
    assert_eq!(&*publish.topic, "alerts/fire");

    broker.stop().await;
}

#[tokio::test]
async fn test_shutdown_discards_wills_and_returns() {
    let broker = TestBroker::start().await;

    let mut client = TestClient::connect(broker.addr).await;
    let mut connect = Connect::new("lingering");
    connect.will = Some(will("status/lingering", b"offline"));
    client.connect_with(connect).await;
    assert!(wait_until(|| broker.broker.session_count() == 1).await);

    let metrics = broker.broker.metrics().clone();
    broker.stop().await;

    assert!(client.is_closed().await);
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.wills_published, 0);
    assert_eq!(snapshot.wills_discarded, 1);
    assert_eq!(snapshot.connections_current, 0);
}

#[tokio::test]
async fn test_shutdown_before_run() {
    let broker = Broker::new(test_config(next_port()));
    broker.shutdown();
    timeout(Duration::from_secs(2), broker.run())
        .await
        .expect("run should return at once")
        .unwrap();
}
