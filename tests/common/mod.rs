//! In-memory STOMP client used by the broker integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use stomp_broker::{Broker, BrokerConfig, Command, Frame, StompCodec, StompItem};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio_util::codec::Framed;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn broker() -> Broker {
    Broker::new(BrokerConfig::default())
}

pub struct TestClient {
    framed: Framed<DuplexStream, StompCodec>,
    /// Frames that arrived while waiting for a receipt.
    pending: VecDeque<Frame>,
}

impl TestClient {
    /// Open an in-memory connection to `broker`.
    pub fn open(broker: &Broker) -> Self {
        Self::open_with(broker, StompCodec::new())
    }

    /// Open a connection whose client side frames with `codec`.
    pub fn open_with(broker: &Broker, codec: StompCodec) -> Self {
        let (client, server) = tokio::io::duplex(64 * 1024);
        broker.accept(server, "duplex");
        Self {
            framed: Framed::new(client, codec),
            pending: VecDeque::new(),
        }
    }

    /// Open a connection and complete a 1.2 CONNECT handshake.
    pub async fn connected(broker: &Broker) -> Self {
        let mut client = Self::open(broker);
        let reply = client
            .request(
                Frame::new(Command::Connect)
                    .header("accept-version", "1.2")
                    .header("host", "/"),
            )
            .await;
        assert_eq!(reply.command, Command::Connected, "handshake failed: {}", reply);
        client
    }

    pub async fn send(&mut self, frame: Frame) {
        self.framed
            .send(StompItem::Frame(frame))
            .await
            .expect("send frame");
    }

    pub async fn send_heartbeat(&mut self) {
        self.framed
            .send(StompItem::Heartbeat)
            .await
            .expect("send heartbeat");
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let stream = self.framed.get_mut();
        stream.write_all(bytes).await.expect("write raw bytes");
        stream.flush().await.expect("flush");
    }

    /// Send `frame` and return the first frame the broker answers with.
    pub async fn request(&mut self, frame: Frame) -> Frame {
        self.send(frame).await;
        self.recv().await
    }

    /// Next item, heart-beats included. `None` once the broker has closed
    /// the connection.
    pub async fn recv_item(&mut self) -> Option<StompItem> {
        tokio::time::timeout(RECV_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for the broker")
            .map(|item| item.expect("decode broker output"))
    }

    /// Next frame, skipping heart-beats.
    pub async fn recv(&mut self) -> Frame {
        if let Some(frame) = self.pending.pop_front() {
            return frame;
        }
        self.recv_wire().await
    }

    async fn recv_wire(&mut self) -> Frame {
        loop {
            match self.recv_item().await {
                Some(StompItem::Frame(frame)) => return frame,
                Some(StompItem::Heartbeat) => continue,
                None => panic!("connection closed while waiting for a frame"),
            }
        }
    }

    /// Assert the broker closes the connection, skipping anything still
    /// queued ahead of the close.
    pub async fn expect_closed(&mut self) {
        while self.recv_item().await.is_some() {}
    }

    /// Assert nothing arrives within a short window.
    pub async fn expect_silence(&mut self) {
        assert!(self.pending.is_empty(), "unread frames: {:?}", self.pending);
        let res = tokio::time::timeout(Duration::from_millis(100), self.framed.next()).await;
        if let Ok(Some(item)) = res {
            panic!("expected silence, got {:?}", item);
        }
    }

    /// Read until the RECEIPT for `tag`, keeping any MESSAGE that arrives
    /// first for later `recv` calls.
    pub async fn until_receipt(&mut self, tag: &str) {
        loop {
            let frame = self.recv_wire().await;
            match frame.command {
                Command::Receipt if frame.get_header("receipt-id") == Some(tag) => return,
                Command::Message => self.pending.push_back(frame),
                _ => panic!("expected RECEIPT {}, got {}", tag, frame),
            }
        }
    }

    /// SUBSCRIBE and wait for the broker to confirm it.
    pub async fn subscribe(&mut self, id: &str, destination: &str, ack: &str) {
        let receipt = format!("sub-{}", id);
        self.send(
            Frame::new(Command::Subscribe)
                .header("id", id)
                .header("destination", destination)
                .header("ack", ack)
                .header("receipt", receipt.as_str()),
        )
        .await;
        self.until_receipt(&receipt).await;
    }

    /// SEND with a receipt and wait for it.
    pub async fn publish(&mut self, destination: &str, body: &str) {
        self.publish_frame(
            Frame::new(Command::Send)
                .header("destination", destination)
                .set_body(body.as_bytes().to_vec()),
        )
        .await;
    }

    pub async fn publish_frame(&mut self, frame: Frame) {
        self.send(frame.header("receipt", "send")).await;
        self.until_receipt("send").await;
    }

    /// Wait for the broker to acknowledge a receipt-carrying no-op, which
    /// proves every earlier frame has been processed.
    pub async fn sync(&mut self, tag: &str) {
        self.send(
            Frame::new(Command::Send)
                .header("destination", "/topic/__sync")
                .header("receipt", tag),
        )
        .await;
        self.until_receipt(tag).await;
    }

    pub async fn disconnect(mut self) {
        self.send(Frame::new(Command::Disconnect).header("receipt", "bye"))
            .await;
        self.until_receipt("bye").await;
        self.expect_closed().await;
    }

    /// Drop the connection without DISCONNECT.
    pub fn abandon(self) {
        drop(self);
    }
}

pub fn body(frame: &Frame) -> &str {
    std::str::from_utf8(&frame.body).expect("utf8 body")
}
