//! Integration tests for the broker.
//!
//! Most tests drive the broker with a raw packet client built on
//! [`crate::protocol`], which gives exact control over packet ids and
//! acknowledgements. The rest use the standard rumqttc client.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::net::TcpStream;

use crate::protocol::{
    self, ConnAck, ConnectReturnCode, LastWill, Packet, PubAck, PubComp, PubRec, PubRel, Publish,
    SubAck, SubscribeReasonCode, MAX_PACKET_SIZE,
};
use crate::{
    Authenticator, Broker, BrokerBuilder, BrokerConfig, DeliveryFailure, Error, FailureReason,
    MemoryStore, Message, QoS,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

fn test_config() -> BrokerConfig {
    BrokerConfig::new("127.0.0.1:0")
}

async fn start(builder: BrokerBuilder) -> (Arc<Broker>, u16) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let broker = Arc::new(builder.build());
    let addr = broker.start().await.unwrap();
    (broker, addr.port())
}

/// Raw MQTT client for driving the broker packet by packet.
struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
}

impl TestClient {
    async fn open(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    async fn connect(port: u16, client_id: &str, clean_session: bool) -> (Self, ConnAck) {
        Self::connect_with(port, protocol::create_connect(client_id, None, 30, clean_session)).await
    }

    async fn connect_with(port: u16, connect: Packet) -> (Self, ConnAck) {
        let mut client = Self::open(port).await;
        client.send(&connect).await;
        match client.recv().await {
            Packet::ConnAck(ack) => (client, ack),
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        protocol::write_packet(&mut self.stream, packet).await.unwrap();
    }

    async fn recv(&mut self) -> Packet {
        tokio::time::timeout(
            RECV_TIMEOUT,
            protocol::read_packet(&mut self.stream, &mut self.buf, MAX_PACKET_SIZE),
        )
        .await
        .expect("timed out waiting for packet")
        .unwrap()
    }

    /// Next packet within `wait`, or `None`.
    async fn try_recv(&mut self, wait: Duration) -> Option<Packet> {
        tokio::time::timeout(
            wait,
            protocol::read_packet(&mut self.stream, &mut self.buf, MAX_PACKET_SIZE),
        )
        .await
        .ok()
        .and_then(|result| result.ok())
    }

    /// Wait until the broker closes the socket.
    async fn expect_closed(&mut self) {
        let result = tokio::time::timeout(
            RECV_TIMEOUT,
            protocol::read_packet(&mut self.stream, &mut self.buf, MAX_PACKET_SIZE),
        )
        .await
        .expect("connection was not closed");
        assert!(
            matches!(result, Err(Error::ConnectionClosed) | Err(Error::Io(_))),
            "expected close, got {:?}",
            result
        );
    }

    async fn recv_publish(&mut self) -> Publish {
        match self.recv().await {
            Packet::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    async fn subscribe(&mut self, pkid: u16, filter: &str, qos: QoS) -> SubAck {
        self.send(&protocol::create_subscribe(pkid, &[(filter, qos)])).await;
        match self.recv().await {
            Packet::SubAck(ack) => {
                assert_eq!(ack.pkid, pkid);
                ack
            }
            other => panic!("expected SUBACK, got {:?}", other),
        }
    }

    async fn publish(&mut self, topic: &str, payload: &str, qos: QoS, pkid: u16) {
        let msg = Message::new(topic, payload.to_string());
        self.send(&protocol::create_publish(&msg, qos, pkid, false, false))
            .await;
    }

    async fn disconnect(mut self) {
        self.send(&Packet::Disconnect).await;
    }
}

// ============================================================================
// Tests: raw client
// ============================================================================

mod delivery_tests {
    use super::*;

    #[tokio::test]
    async fn test_qos0_pub_sub() {
        let (broker, port) = start(Broker::builder(test_config())).await;

        let (mut sub, ack) = TestClient::connect(port, "sub", true).await;
        assert_eq!(ack.code, ConnectReturnCode::Success);
        assert!(!ack.session_present);
        let suback = sub.subscribe(1, "sensors/+/temp", QoS::AtMostOnce).await;
        assert_eq!(
            suback.return_codes,
            vec![SubscribeReasonCode::Success(QoS::AtMostOnce.into())]
        );

        let (mut publisher, _) = TestClient::connect(port, "pub", true).await;
        publisher.publish("sensors/kitchen/temp", "21.5", QoS::AtMostOnce, 0).await;

        let publish = sub.recv_publish().await;
        assert_eq!(publish.topic, "sensors/kitchen/temp");
        assert_eq!(publish.payload.as_ref(), b"21.5");
        assert!(!publish.retain);

        broker.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_qos1_acknowledged_delivery() {
        let (broker, port) = start(Broker::builder(test_config())).await;

        let (mut sub, _) = TestClient::connect(port, "q1-sub", true).await;
        sub.subscribe(1, "q1/t", QoS::AtLeastOnce).await;

        let (mut publisher, _) = TestClient::connect(port, "q1-pub", true).await;
        publisher.publish("q1/t", "hello", QoS::AtLeastOnce, 7).await;
        assert_eq!(publisher.recv().await, Packet::PubAck(PubAck::new(7)));

        let publish = sub.recv_publish().await;
        assert_eq!(QoS::from(publish.qos), QoS::AtLeastOnce);
        assert_ne!(publish.pkid, 0);
        assert!(!publish.dup);

        let session = broker.registry().lookup("q1-sub").unwrap();
        assert_eq!(session.inflight_len(), 1);

        sub.send(&Packet::PubAck(PubAck::new(publish.pkid))).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.inflight_len(), 0);

        broker.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_qos2_duplicate_publish_routed_once() {
        let (broker, port) = start(Broker::builder(test_config())).await;

        let (mut sub, _) = TestClient::connect(port, "q2-sub", true).await;
        sub.subscribe(1, "q2/#", QoS::ExactlyOnce).await;

        let (mut publisher, _) = TestClient::connect(port, "q2-pub", true).await;
        publisher.publish("q2/t", "once", QoS::ExactlyOnce, 5).await;
        assert_eq!(publisher.recv().await, Packet::PubRec(PubRec::new(5)));

        // Retransmission before PUBREL must not be routed again.
        let msg = Message::new("q2/t", "once");
        publisher
            .send(&protocol::create_publish(&msg, QoS::ExactlyOnce, 5, false, true))
            .await;
        assert_eq!(publisher.recv().await, Packet::PubRec(PubRec::new(5)));

        publisher.send(&Packet::PubRel(PubRel::new(5))).await;
        assert_eq!(publisher.recv().await, Packet::PubComp(PubComp::new(5)));

        let publish = sub.recv_publish().await;
        assert_eq!(QoS::from(publish.qos), QoS::ExactlyOnce);
        assert_eq!(publish.payload.as_ref(), b"once");

        sub.send(&Packet::PubRec(PubRec::new(publish.pkid))).await;
        assert_eq!(sub.recv().await, Packet::PubRel(PubRel::new(publish.pkid)));
        sub.send(&Packet::PubComp(PubComp::new(publish.pkid))).await;

        assert!(sub.try_recv(Duration::from_millis(200)).await.is_none());
        assert_eq!(broker.registry().lookup("q2-sub").unwrap().inflight_len(), 0);

        broker.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_qos_downgraded_to_subscription() {
        let (broker, port) = start(Broker::builder(test_config())).await;

        let (mut sub, _) = TestClient::connect(port, "down-sub", true).await;
        sub.subscribe(1, "down/t", QoS::AtMostOnce).await;

        let (mut publisher, _) = TestClient::connect(port, "down-pub", true).await;
        publisher.publish("down/t", "x", QoS::ExactlyOnce, 3).await;
        assert_eq!(publisher.recv().await, Packet::PubRec(PubRec::new(3)));

        let publish = sub.recv_publish().await;
        assert_eq!(QoS::from(publish.qos), QoS::AtMostOnce);
        assert_eq!(publish.pkid, 0);

        broker.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_per_publisher_order_beyond_inflight_window() {
        let config = test_config().max_inflight(4);
        let (broker, port) = start(Broker::builder(config)).await;

        let (mut sub, _) = TestClient::connect(port, "order-sub", true).await;
        sub.subscribe(1, "order/t", QoS::AtLeastOnce).await;

        let (mut publisher, _) = TestClient::connect(port, "order-pub", true).await;
        for i in 0..20u16 {
            publisher
                .publish("order/t", &i.to_string(), QoS::AtLeastOnce, i + 1)
                .await;
        }
        for i in 0..20u16 {
            assert_eq!(publisher.recv().await, Packet::PubAck(PubAck::new(i + 1)));
        }

        for i in 0..20u16 {
            let publish = sub.recv_publish().await;
            assert_eq!(publish.payload.as_ref(), i.to_string().as_bytes());
            sub.send(&Packet::PubAck(PubAck::new(publish.pkid))).await;
        }

        broker.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_qos1_retries_then_failure_reported() {
        let failures = Arc::new(Mutex::new(Vec::<DeliveryFailure>::new()));
        let failures_clone = Arc::clone(&failures);

        let config = test_config()
            .retry_interval(Duration::from_millis(100))
            .max_delivery_retries(2);
        let builder = Broker::builder(config).on_delivery_failure(move |failure| {
            failures_clone.lock().push(failure.clone());
        });
        let (broker, port) = start(builder).await;

        let (mut sub, _) = TestClient::connect(port, "silent", true).await;
        sub.subscribe(1, "retry/t", QoS::AtLeastOnce).await;

        broker
            .publish(Message::new("retry/t", "ping").with_qos(QoS::AtLeastOnce))
            .unwrap();

        let first = sub.recv_publish().await;
        assert!(!first.dup);
        let again = sub.recv_publish().await;
        assert!(again.dup);
        assert_eq!(again.pkid, first.pkid);

        tokio::time::sleep(Duration::from_millis(600)).await;
        let failures = failures.lock().clone();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].client_id, "silent");
        assert_eq!(failures[0].topic, "retry/t");
        assert_eq!(failures[0].pkid, first.pkid);
        assert_eq!(failures[0].reason, FailureReason::RetriesExhausted);
        assert_eq!(broker.registry().lookup("silent").unwrap().inflight_len(), 0);

        broker.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let (broker, port) = start(Broker::builder(test_config())).await;

        let (mut sub, _) = TestClient::connect(port, "unsub", true).await;
        sub.subscribe(1, "u/#", QoS::AtMostOnce).await;
        sub.send(&protocol::create_unsubscribe(2, &["u/#"])).await;
        assert_eq!(sub.recv().await, protocol::create_unsuback(2));

        let receipt = broker.publish(Message::new("u/x", "gone")).unwrap();
        assert_eq!(receipt.matched, 0);
        assert!(sub.try_recv(Duration::from_millis(100)).await.is_none());

        broker.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_ping() {
        let (broker, port) = start(Broker::builder(test_config())).await;

        let (mut client, _) = TestClient::connect(port, "pinger", true).await;
        client.send(&Packet::PingReq).await;
        assert_eq!(client.recv().await, Packet::PingResp);

        broker.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_order_kept_with_single_slot_queue() {
        let config = test_config()
            .outbound_queue_capacity(1)
            .retry_interval(Duration::from_millis(500));
        let (broker, port) = start(Broker::builder(config)).await;

        let (mut sub, _) = TestClient::connect(port, "narrow", true).await;
        sub.subscribe(1, "narrow/t", QoS::AtLeastOnce).await;

        for n in 0..20 {
            broker
                .publish(Message::new("narrow/t", n.to_string()).with_qos(QoS::AtLeastOnce))
                .unwrap();
        }

        let mut seen = Vec::new();
        while seen.len() < 20 {
            let publish = sub.recv_publish().await;
            sub.send(&Packet::PubAck(PubAck::new(publish.pkid))).await;
            if publish.dup {
                continue;
            }
            let n: u32 = std::str::from_utf8(&publish.payload).unwrap().parse().unwrap();
            seen.push(n);
        }
        assert_eq!(seen, (0..20).collect::<Vec<u32>>());

        broker.stop(Duration::from_millis(200)).await;
    }
}

mod retained_tests {
    use super::*;

    #[tokio::test]
    async fn test_retained_replayed_to_new_subscriber() {
        let (broker, port) = start(Broker::builder(test_config())).await;

        let (mut publisher, _) = TestClient::connect(port, "ret-pub", true).await;
        let msg = Message::new("home/light", "on").with_retain(true);
        publisher
            .send(&protocol::create_publish(&msg, QoS::AtMostOnce, 0, true, false))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (mut sub, _) = TestClient::connect(port, "ret-sub", true).await;
        sub.subscribe(1, "home/#", QoS::AtLeastOnce).await;

        let publish = sub.recv_publish().await;
        assert_eq!(publish.topic, "home/light");
        assert_eq!(publish.payload.as_ref(), b"on");
        assert!(publish.retain);
        assert_eq!(QoS::from(publish.qos), QoS::AtMostOnce);

        broker.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_empty_retained_clears() {
        let (broker, port) = start(Broker::builder(test_config())).await;

        broker
            .publish(Message::new("cfg/mode", "eco").with_retain(true))
            .unwrap();
        broker
            .publish(Message::new("cfg/mode", "").with_retain(true))
            .unwrap();
        assert!(broker.router().retained("cfg/#").is_empty());

        let (mut sub, _) = TestClient::connect(port, "clear-sub", true).await;
        sub.subscribe(1, "cfg/#", QoS::AtMostOnce).await;
        assert!(sub.try_recv(Duration::from_millis(150)).await.is_none());

        broker.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_live_delivery_clears_retain_flag() {
        let (broker, port) = start(Broker::builder(test_config())).await;

        let (mut sub, _) = TestClient::connect(port, "live-sub", true).await;
        sub.subscribe(1, "live/t", QoS::AtMostOnce).await;

        broker
            .publish(Message::new("live/t", "now").with_retain(true))
            .unwrap();
        let publish = sub.recv_publish().await;
        assert!(!publish.retain);

        broker.stop(Duration::from_millis(200)).await;
    }
}

mod session_tests {
    use super::*;
    use crate::protocol::Connect;

    #[tokio::test]
    async fn test_takeover_closes_old_connection_and_fires_will() {
        let (broker, port) = start(Broker::builder(test_config())).await;

        let (mut watcher, _) = TestClient::connect(port, "watcher", true).await;
        watcher.subscribe(1, "wills/#", QoS::AtMostOnce).await;

        let mut connect = Connect::new("gear-1");
        connect.keep_alive = 30;
        connect.last_will = Some(LastWill::new(
            "wills/gear-1",
            "offline",
            QoS::AtMostOnce.into(),
            false,
        ));
        let (mut first, ack) = TestClient::connect_with(port, Packet::Connect(connect)).await;
        assert_eq!(ack.code, ConnectReturnCode::Success);

        let (_second, ack) = TestClient::connect(port, "gear-1", true).await;
        assert_eq!(ack.code, ConnectReturnCode::Success);

        first.expect_closed().await;

        let will = watcher.recv_publish().await;
        assert_eq!(will.topic, "wills/gear-1");
        assert_eq!(will.payload.as_ref(), b"offline");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(broker.registry().len(), 2);
        assert!(broker.registry().lookup("gear-1").unwrap().is_connected());

        broker.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_graceful_disconnect_suppresses_will() {
        let (broker, port) = start(Broker::builder(test_config())).await;

        let (mut watcher, _) = TestClient::connect(port, "watcher", true).await;
        watcher.subscribe(1, "wills/#", QoS::AtMostOnce).await;

        let mut connect = Connect::new("polite");
        connect.last_will = Some(LastWill::new("wills/polite", "bye", QoS::AtMostOnce.into(), false));
        let (client, _) = TestClient::connect_with(port, Packet::Connect(connect)).await;
        client.disconnect().await;

        assert!(watcher.try_recv(Duration::from_millis(200)).await.is_none());
        assert!(broker.registry().lookup("polite").is_err());

        broker.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_persistent_session_queues_while_offline() {
        let (broker, port) = start(Broker::builder(test_config())).await;

        let (mut client, ack) = TestClient::connect(port, "keeper", false).await;
        assert!(!ack.session_present);
        client.subscribe(1, "inbox/keeper", QoS::AtLeastOnce).await;
        client.disconnect().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let session = broker.registry().lookup("keeper").unwrap();
        assert!(!session.is_connected());

        let receipt = broker
            .publish(Message::new("inbox/keeper", "while away").with_qos(QoS::AtLeastOnce))
            .unwrap();
        assert_eq!(receipt.queued, 1);
        // QoS 0 is not kept for offline sessions.
        let receipt = broker.publish(Message::new("inbox/keeper", "lost")).unwrap();
        assert_eq!(receipt.dropped, 1);

        let (mut client, ack) = TestClient::connect(port, "keeper", false).await;
        assert!(ack.session_present);
        let publish = client.recv_publish().await;
        assert_eq!(publish.payload.as_ref(), b"while away");
        client.send(&Packet::PubAck(PubAck::new(publish.pkid))).await;
        assert!(client.try_recv(Duration::from_millis(150)).await.is_none());

        broker.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_clean_session_discards_state() {
        let (broker, port) = start(Broker::builder(test_config())).await;

        let (mut client, _) = TestClient::connect(port, "flip", false).await;
        client.subscribe(1, "flip/t", QoS::AtLeastOnce).await;
        client.disconnect().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (_client, ack) = TestClient::connect(port, "flip", true).await;
        assert!(!ack.session_present);
        assert_eq!(broker.publish(Message::new("flip/t", "x")).unwrap().matched, 0);

        broker.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_keep_alive_timeout() {
        let (broker, port) = start(Broker::builder(test_config())).await;

        let (mut client, _) = TestClient::connect_with(
            port,
            protocol::create_connect("sleepy", None, 1, true),
        )
        .await;
        // 1.5 x 1s without traffic.
        client.expect_closed().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(broker.registry().lookup("sleepy").is_err());

        broker.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_sessions_restored_from_store() {
        let store = MemoryStore::new();
        let (broker, port) = start(Broker::builder(test_config()).store(store.clone())).await;

        let (mut client, _) = TestClient::connect(port, "durable", false).await;
        client.subscribe(1, "d/+", QoS::AtLeastOnce).await;
        client.disconnect().await;
        broker
            .publish(Message::new("d/state", "ready").with_retain(true))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        broker.stop(Duration::from_millis(200)).await;

        assert_eq!(store.session_count(), 1);
        assert_eq!(store.retained_count(), 1);

        let (restarted, port) = start(Broker::builder(test_config()).store(store.clone())).await;
        let session = restarted.registry().lookup("durable").unwrap();
        assert_eq!(session.subscriptions(), vec![("d/+".to_string(), QoS::AtLeastOnce)]);
        assert_eq!(restarted.router().retained("d/#").len(), 1);

        let (_client, ack) = TestClient::connect(port, "durable", false).await;
        assert!(ack.session_present);

        restarted.stop(Duration::from_millis(200)).await;
    }
}

mod connect_tests {
    use super::*;

    #[tokio::test]
    async fn test_protocol_level_refused() {
        let (broker, port) = start(Broker::builder(test_config())).await;

        let mut buf = BytesMut::new();
        protocol::create_connect("old", None, 30, true)
            .write(&mut buf, MAX_PACKET_SIZE)
            .unwrap();
        // fixed header (2) + "MQTT" length-prefixed (6), then the level
        assert_eq!(buf[8], 4);
        buf[8] = 3;

        let mut client = TestClient::open(port).await;
        tokio::io::AsyncWriteExt::write_all(&mut client.stream, &buf)
            .await
            .unwrap();
        match client.recv().await {
            Packet::ConnAck(ack) => assert_eq!(ack.code, ConnectReturnCode::RefusedProtocolVersion),
            other => panic!("expected CONNACK, got {:?}", other),
        }
        client.expect_closed().await;

        broker.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_empty_client_id() {
        let (broker, port) = start(Broker::builder(test_config())).await;

        let (_client, ack) = TestClient::connect(port, "", false).await;
        assert_eq!(ack.code, ConnectReturnCode::BadClientId);

        let (_client, ack) = TestClient::connect(port, "", true).await;
        assert_eq!(ack.code, ConnectReturnCode::Success);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let sessions = broker.registry().sessions();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].id().starts_with("shoepad-"));

        broker.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_first_packet_must_be_connect() {
        let (broker, port) = start(Broker::builder(test_config())).await;

        let mut client = TestClient::open(port).await;
        client.send(&Packet::PingReq).await;
        client.expect_closed().await;

        broker.stop(Duration::from_millis(200)).await;
    }

    struct Acl;

    impl Authenticator for Acl {
        fn authenticate(&self, _client_id: &str, username: &str, password: &[u8]) -> bool {
            username == "admin" && password == b"secret"
        }

        fn authorize_publish(&self, _client_id: &str, topic: &str) -> bool {
            !topic.starts_with("readonly/")
        }

        fn authorize_subscribe(&self, _client_id: &str, filter: &str) -> bool {
            !filter.starts_with("private/")
        }
    }

    #[tokio::test]
    async fn test_authentication() {
        let (broker, port) = start(Broker::builder(test_config()).authenticator(Acl)).await;

        let (mut client, ack) = TestClient::connect(port, "intruder", true).await;
        assert_eq!(ack.code, ConnectReturnCode::NotAuthorized);
        client.expect_closed().await;

        let (_client, ack) = TestClient::connect_with(
            port,
            protocol::create_connect("admin-1", Some(("admin", "secret")), 30, true),
        )
        .await;
        assert_eq!(ack.code, ConnectReturnCode::Success);

        broker.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_acl() {
        let (broker, port) = start(Broker::builder(test_config()).authenticator(Acl)).await;

        let (mut client, _) = TestClient::connect_with(
            port,
            protocol::create_connect("acl-1", Some(("admin", "secret")), 30, true),
        )
        .await;

        client
            .send(&protocol::create_subscribe(
                1,
                &[("private/x", QoS::AtMostOnce), ("readonly/#", QoS::AtMostOnce)],
            ))
            .await;
        match client.recv().await {
            Packet::SubAck(ack) => assert_eq!(
                ack.return_codes,
                vec![
                    SubscribeReasonCode::Failure,
                    SubscribeReasonCode::Success(QoS::AtMostOnce.into()),
                ]
            ),
            other => panic!("expected SUBACK, got {:?}", other),
        }

        // Denied publishes are acknowledged but not routed.
        client.publish("readonly/a", "nope", QoS::AtLeastOnce, 9).await;
        assert_eq!(client.recv().await, Packet::PubAck(PubAck::new(9)));
        assert!(client.try_recv(Duration::from_millis(150)).await.is_none());

        broker.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_max_qos_caps_grant() {
        let config = test_config().max_qos(QoS::AtLeastOnce);
        let (broker, port) = start(Broker::builder(config)).await;

        let (mut client, _) = TestClient::connect(port, "capped", true).await;
        let ack = client.subscribe(1, "c/t", QoS::ExactlyOnce).await;
        assert_eq!(
            ack.return_codes,
            vec![SubscribeReasonCode::Success(QoS::AtLeastOnce.into())]
        );

        broker.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_misbehaving_clients_do_not_affect_others() {
        let (broker, port) = start(Broker::builder(test_config())).await;

        let (mut sub, _) = TestClient::connect(port, "steady-sub", true).await;
        sub.subscribe(1, "steady/t", QoS::AtLeastOnce).await;
        let (mut publisher, _) = TestClient::connect(port, "steady-pub", true).await;

        // reserved packet type 0
        let (mut garbage, _) = TestClient::connect(port, "garbage", true).await;
        tokio::io::AsyncWriteExt::write_all(&mut garbage.stream, &[0x00, 0x00])
            .await
            .unwrap();
        garbage.expect_closed().await;

        let (mut twice, _) = TestClient::connect(port, "twice", true).await;
        twice
            .send(&protocol::create_connect("twice", None, 30, true))
            .await;
        twice.expect_closed().await;

        for (pkid, payload) in [(1, "a"), (2, "b")] {
            publisher.publish("steady/t", payload, QoS::AtLeastOnce, pkid).await;
            assert_eq!(publisher.recv().await, Packet::PubAck(PubAck::new(pkid)));
            let publish = sub.recv_publish().await;
            assert_eq!(publish.payload.as_ref(), payload.as_bytes());
            sub.send(&Packet::PubAck(PubAck::new(publish.pkid))).await;
        }

        sub.send(&Packet::PingReq).await;
        assert_eq!(sub.recv().await, Packet::PingResp);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(broker.registry().lookup("garbage").is_err());
        assert!(broker.registry().lookup("twice").is_err());

        broker.stop(Duration::from_millis(200)).await;
    }
}

mod sys_tests {
    use super::*;

    #[tokio::test]
    async fn test_sys_events_hidden_from_root_wildcard() {
        let (broker, port) = start(Broker::builder(test_config())).await;

        let (mut all, _) = TestClient::connect(port, "all", true).await;
        all.subscribe(1, "#", QoS::AtMostOnce).await;

        let (mut sys, _) = TestClient::connect(port, "sys", true).await;
        sys.subscribe(1, "$SYS/brokers/+/connected", QoS::AtMostOnce).await;

        let (_gear, _) = TestClient::connect(port, "gear-9", true).await;

        let event = sys.recv_publish().await;
        assert_eq!(event.topic, "$SYS/brokers/gear-9/connected");
        let json: serde_json::Value = serde_json::from_slice(&event.payload).unwrap();
        assert_eq!(json["clientid"], "gear-9");
        assert_eq!(json["clean_session"], true);

        assert!(all.try_recv(Duration::from_millis(200)).await.is_none());

        broker.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_sys_events_disabled() {
        let (broker, port) = start(Broker::builder(test_config().sys_events(false))).await;

        let (mut sys, _) = TestClient::connect(port, "sys", true).await;
        sys.subscribe(1, "$SYS/#", QoS::AtMostOnce).await;
        let (_gear, _) = TestClient::connect(port, "gear-10", true).await;

        assert!(sys.try_recv(Duration::from_millis(200)).await.is_none());

        broker.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_no_event_for_wildcard_client_id() {
        let (broker, port) = start(Broker::builder(test_config())).await;

        let (mut sys, _) = TestClient::connect(port, "sys", true).await;
        sys.subscribe(1, "$SYS/#", QoS::AtMostOnce).await;

        let (mut odd, ack) = TestClient::connect(port, "a/+", true).await;
        assert_eq!(ack.code, ConnectReturnCode::Success);
        odd.send(&Packet::PingReq).await;
        assert_eq!(odd.recv().await, Packet::PingResp);
        odd.disconnect().await;

        assert!(sys.try_recv(Duration::from_millis(200)).await.is_none());

        let (_gear, _) = TestClient::connect(port, "gear-11", true).await;
        assert_eq!(sys.recv_publish().await.topic, "$SYS/brokers/gear-11/connected");

        broker.stop(Duration::from_millis(200)).await;
    }
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_address_in_use() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let broker = Broker::new(BrokerConfig::new(&addr));
        let result = broker.start().await;
        assert!(
            matches!(result, Err(Error::AddressInUse { .. })),
            "expected AddressInUse, got {:?}",
            result
        );
        assert!(!broker.is_running());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let broker = Broker::new(test_config());
        let first = broker.start().await.unwrap();
        let second = broker.start().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(broker.local_addr(), Some(first));
        broker.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_stop_disconnects_and_restarts() {
        let disconnected = Arc::new(Mutex::new(Vec::<String>::new()));
        let disconnected_clone = Arc::clone(&disconnected);

        let builder = Broker::builder(test_config()).on_disconnect(move |id| {
            disconnected_clone.lock().push(id.to_string());
        });
        let (broker, port) = start(builder).await;

        let (mut client, _) = TestClient::connect(port, "stay", true).await;
        broker.stop(Duration::from_millis(500)).await;
        assert!(!broker.is_running());
        client.expect_closed().await;
        assert_eq!(*disconnected.lock(), vec!["stay".to_string()]);

        // Stop on a stopped broker is a no-op.
        broker.stop(Duration::from_millis(100)).await;

        let addr = broker.start().await.unwrap();
        let (_client, ack) = TestClient::connect(addr.port(), "again", true).await;
        assert_eq!(ack.code, ConnectReturnCode::Success);
        broker.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_serve_returns_after_stop() {
        let broker = Arc::new(Broker::new(test_config()));
        let serving = Arc::clone(&broker);
        let handle = tokio::spawn(async move { serving.serve().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(broker.is_running());
        broker.stop(Duration::from_millis(200)).await;

        let result = tokio::time::timeout(RECV_TIMEOUT, handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_publishers() {
        let config = test_config().outbound_queue_capacity(512);
        let (broker, port) = start(Broker::builder(config)).await;

        let (mut sub, _) = TestClient::connect(port, "fan-in", true).await;
        sub.subscribe(1, "load/+", QoS::AtMostOnce).await;

        let mut handles = Vec::new();
        for p in 0..4 {
            handles.push(tokio::spawn(async move {
                let (mut client, _) = TestClient::connect(port, &format!("load-{}", p), true).await;
                for n in 0..25 {
                    client
                        .publish(&format!("load/{}", p), &n.to_string(), QoS::AtMostOnce, 0)
                        .await;
                }
                client.disconnect().await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut last = [-1i32; 4];
        for _ in 0..100 {
            let publish = sub.recv_publish().await;
            let p: usize = publish.topic["load/".len()..].parse().unwrap();
            let n: i32 = std::str::from_utf8(&publish.payload).unwrap().parse().unwrap();
            assert!(n > last[p], "publisher {} out of order", p);
            last[p] = n;
        }
        assert_eq!(last, [24; 4]);

        broker.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_stop_closes_connection_stuck_on_write() {
        let config = test_config().drain_timeout(Duration::from_secs(30));
        let (broker, port) = start(Broker::builder(config)).await;

        // subscribes, then never reads again
        let (mut stuck, _) = TestClient::connect(port, "stuck", true).await;
        stuck.subscribe(1, "flood", QoS::AtMostOnce).await;

        let payload = bytes::Bytes::from(vec![0u8; 256 * 1024]);
        for _ in 0..200 {
            broker.publish(Message::new("flood", payload.clone())).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = tokio::time::Instant::now();
        tokio::time::timeout(RECV_TIMEOUT, broker.stop(Duration::from_millis(300)))
            .await
            .expect("stop must not wait on a connection stuck writing");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!broker.is_running());
        assert!(broker.registry().lookup("stuck").is_err());
        drop(stuck);
    }
}

// ============================================================================
// Tests: standard rumqttc client
// ============================================================================

mod rumqttc_tests {
    use super::*;
    use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS as RumqttQoS};

    /// Test publish and subscribe with rumqttc.
    #[tokio::test]
    async fn test_rumqttc_pub_sub() {
        let (broker, port) = start(Broker::builder(test_config())).await;

        let mut options = MqttOptions::new("rumqttc-client", "127.0.0.1", port);
        options.set_keep_alive(Duration::from_secs(5));

        let (client, mut eventloop) = AsyncClient::new(options, 10);

        client.subscribe("test/topic", RumqttQoS::AtLeastOnce).await.unwrap();
        client
            .publish("test/topic", RumqttQoS::AtLeastOnce, false, b"hello".to_vec())
            .await
            .unwrap();

        let mut received = false;
        for _ in 0..20 {
            match tokio::time::timeout(RECV_TIMEOUT, eventloop.poll()).await {
                Ok(Ok(Event::Incoming(Incoming::Publish(p)))) => {
                    assert_eq!(p.topic, "test/topic");
                    assert_eq!(p.payload.as_ref(), b"hello");
                    received = true;
                    break;
                }
                Ok(Ok(_)) => {}
                other => panic!("eventloop failed: {:?}", other.map(|r| r.is_ok())),
            }
        }
        assert!(received, "Did not receive message");

        client.disconnect().await.unwrap();
        broker.stop(Duration::from_millis(200)).await;
    }

    /// Test on_connect and on_disconnect callbacks.
    #[tokio::test]
    async fn test_rumqttc_callbacks() {
        let connected = Arc::new(Mutex::new(Vec::<String>::new()));
        let disconnected = Arc::new(Mutex::new(Vec::<String>::new()));

        let connected_clone = Arc::clone(&connected);
        let disconnected_clone = Arc::clone(&disconnected);

        let builder = Broker::builder(test_config())
            .on_connect(move |id| connected_clone.lock().push(id.to_string()))
            .on_disconnect(move |id| disconnected_clone.lock().push(id.to_string()));
        let (broker, port) = start(builder).await;

        let mut options = MqttOptions::new("callback-test", "127.0.0.1", port);
        options.set_keep_alive(Duration::from_secs(5));
        let (client, mut eventloop) = AsyncClient::new(options, 10);

        let event = eventloop.poll().await;
        assert!(event.is_ok(), "Failed to connect: {:?}", event.err());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(connected.lock().contains(&"callback-test".to_string()));

        client.disconnect().await.unwrap();
        let _ = tokio::time::timeout(Duration::from_millis(100), eventloop.poll()).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(
            disconnected.lock().contains(&"callback-test".to_string()),
            "on_disconnect was not called. Connected: {:?}, Disconnected: {:?}",
            connected.lock(),
            disconnected.lock()
        );

        broker.stop(Duration::from_millis(200)).await;
    }

    /// A persistent rumqttc session sees `session_present` on reconnect.
    #[tokio::test]
    async fn test_rumqttc_session_present() {
        let (broker, port) = start(Broker::builder(test_config())).await;

        for expected in [false, true] {
            let mut options = MqttOptions::new("rumqttc-durable", "127.0.0.1", port);
            options.set_keep_alive(Duration::from_secs(5));
            options.set_clean_session(false);
            let (client, mut eventloop) = AsyncClient::new(options, 10);

            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    assert_eq!(ack.session_present, expected);
                }
                other => panic!("expected CONNACK, got {:?}", other),
            }

            client.disconnect().await.unwrap();
            let _ = tokio::time::timeout(Duration::from_millis(100), eventloop.poll()).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        broker.stop(Duration::from_millis(200)).await;
    }
}
