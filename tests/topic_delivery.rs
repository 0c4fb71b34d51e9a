//! Topic destinations: fan-out to the subscribers present at send time.

mod common;

use std::time::Duration;

use common::{TestClient, body, broker};
use stomp_broker::{Broker, BrokerConfig, Command, DestinationKind, Frame};

#[tokio::test]
async fn topic_message_reaches_every_subscriber() {
    let broker = broker();
    let mut a = TestClient::connected(&broker).await;
    let mut b = TestClient::connected(&broker).await;
    let mut producer = TestClient::connected(&broker).await;

    a.subscribe("0", "/topic/news", "auto").await;
    b.subscribe("7", "/topic/news", "auto").await;
    producer.publish("/topic/news", "hi").await;

    let got_a = a.recv().await;
    let got_b = b.recv().await;
    assert_eq!(body(&got_a), "hi");
    assert_eq!(body(&got_b), "hi");
    assert_eq!(got_a.get_header("subscription"), Some("0"));
    assert_eq!(got_b.get_header("subscription"), Some("7"));
    assert_eq!(got_a.get_header("message-id"), got_b.get_header("message-id"));
    producer.expect_silence().await;
}

#[tokio::test]
async fn late_subscriber_misses_earlier_messages() {
    let broker = broker();
    let mut early = TestClient::connected(&broker).await;
    let mut producer = TestClient::connected(&broker).await;

    early.subscribe("0", "/topic/t", "auto").await;
    producer.publish("/topic/t", "before").await;

    let mut late = TestClient::connected(&broker).await;
    late.subscribe("0", "/topic/t", "auto").await;
    producer.publish("/topic/t", "after").await;

    assert_eq!(body(&early.recv().await), "before");
    assert_eq!(body(&early.recv().await), "after");
    assert_eq!(body(&late.recv().await), "after");
    late.expect_silence().await;
}

#[tokio::test]
async fn topic_send_without_subscribers_is_dropped() {
    let broker = broker();
    let mut producer = TestClient::connected(&broker).await;
    producer.publish("/topic/void", "nobody").await;

    let mut late = TestClient::connected(&broker).await;
    late.subscribe("0", "/topic/void", "auto").await;
    late.expect_silence().await;
}

#[tokio::test]
async fn unsubscribed_client_stops_receiving() {
    let broker = broker();
    let mut a = TestClient::connected(&broker).await;
    let mut producer = TestClient::connected(&broker).await;

    a.subscribe("0", "/topic/t", "auto").await;
    a.send(
        Frame::new(Command::Unsubscribe)
            .header("id", "0")
            .header("receipt", "gone"),
    )
    .await;
    a.until_receipt("gone").await;

    producer.publish("/topic/t", "x").await;
    a.expect_silence().await;
}

#[tokio::test]
async fn acking_a_topic_message_is_accepted() {
    let broker = broker();
    let mut a = TestClient::connected(&broker).await;
    let mut producer = TestClient::connected(&broker).await;

    a.subscribe("0", "/topic/acked", "client").await;
    producer.publish("/topic/acked", "x").await;
    let msg = a.recv().await;
    let ack = msg.get_header("ack").unwrap().to_string();

    a.send(Frame::new(Command::Ack).header("id", ack).header("receipt", "ok"))
        .await;
    a.until_receipt("ok").await;
}

#[tokio::test]
async fn destination_kind_follows_queue_prefix() {
    let broker = broker();
    assert_eq!(broker.router().kind("/queue/a"), DestinationKind::Queue);
    assert_eq!(broker.router().kind("/topic/a"), DestinationKind::Topic);
    assert_eq!(broker.router().kind("/exchange/a"), DestinationKind::Topic);
}

#[tokio::test]
async fn stalled_subscriber_is_dropped_while_others_keep_receiving() {
    let broker = Broker::new(BrokerConfig::default().with_outbound_capacity(1));
    let mut stalled = TestClient::connected(&broker).await;
    let mut reader = TestClient::connected(&broker).await;
    let mut producer = TestClient::connected(&broker).await;
    stalled.subscribe("0", "/topic/firehose", "auto").await;
    reader.subscribe("0", "/topic/firehose", "auto").await;

    // enough bytes to fill the stalled client's pipe and its outbound queue
    let payload = "x".repeat(16 * 1024);
    for i in 0..12 {
        producer
            .publish("/topic/firehose", &format!("{}:{}", i, payload))
            .await;
        let got = reader.recv().await;
        assert!(body(&got).starts_with(&format!("{}:", i)), "reader missed message {}", i);
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let stats = broker.router().stats("/topic/firehose").await.unwrap();
            if stats.subscriptions == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stalled subscriber still registered");

    // whatever reached the pipe before the overflow drains, then EOF
    stalled.expect_closed().await;
    producer.publish("/topic/firehose", "after").await;
    assert_eq!(body(&reader.recv().await), "after");
}
