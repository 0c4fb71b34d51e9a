//! Pluggable queue storage: failures surface as ERROR frames to the
//! connection that triggered them only.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use common::{TestClient, body};
use stomp_broker::{
    Broker, BrokerConfig, Command, Frame, MemoryQueueStorage, Message, QueueStorage, StorageError,
};

/// In-memory storage whose appends can be switched off.
#[derive(Default)]
struct FlakyStorage {
    inner: MemoryQueueStorage,
    failing: AtomicBool,
}

#[async_trait]
impl QueueStorage for FlakyStorage {
    async fn append(&self, queue: &str, message: Message) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("disk full".to_string()));
        }
        self.inner.append(queue, message).await
    }

    async fn requeue(&self, queue: &str, message: Message) -> Result<(), StorageError> {
        self.inner.requeue(queue, message).await
    }

    async fn pop_next(&self, queue: &str) -> Result<Option<Message>, StorageError> {
        self.inner.pop_next(queue).await
    }

    async fn acknowledge(&self, queue: &str, message_id: &str) -> Result<(), StorageError> {
        self.inner.acknowledge(queue, message_id).await
    }
}

fn broker_with(storage: Arc<FlakyStorage>) -> Broker {
    Broker::builder()
        .config(BrokerConfig::default())
        .storage(storage)
        .build()
}

#[tokio::test]
async fn append_failure_closes_only_the_sender() {
    let storage = Arc::new(FlakyStorage::default());
    let broker = broker_with(storage.clone());
    let mut bystander = TestClient::connected(&broker).await;
    let mut sender = TestClient::connected(&broker).await;
    bystander.subscribe("0", "/queue/q", "auto").await;

    storage.failing.store(true, Ordering::SeqCst);
    let reply = sender
        .request(
            Frame::new(Command::Send)
                .header("destination", "/queue/q")
                .set_body(b"x".to_vec()),
        )
        .await;
    assert_eq!(reply.command, Command::Error);
    assert_eq!(reply.get_header("message"), Some("storage failure"));
    sender.expect_closed().await;

    storage.failing.store(false, Ordering::SeqCst);
    let mut other = TestClient::connected(&broker).await;
    other.publish("/queue/q", "y").await;
    assert_eq!(body(&bystander.recv().await), "y");
}

#[tokio::test]
async fn topics_do_not_touch_storage() {
    let storage = Arc::new(FlakyStorage::default());
    storage.failing.store(true, Ordering::SeqCst);
    let broker = broker_with(storage);
    let mut consumer = TestClient::connected(&broker).await;
    let mut producer = TestClient::connected(&broker).await;
    consumer.subscribe("0", "/topic/t", "auto").await;
    producer.publish("/topic/t", "fine").await;
    assert_eq!(body(&consumer.recv().await), "fine");
}
