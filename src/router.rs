//! Broker-wide destination registry.
//!
//! Every destination owns its own lock, so SEND, SUBSCRIBE-triggered drain,
//! ACK/NACK and UNSUBSCRIBE on one destination are serialized while distinct
//! destinations proceed independently.
//!
//! Queue destinations keep their pending messages in the configured
//! [`QueueStorage`] and dispatch each to one subscription, round-robin in
//! registration order. Topic destinations keep nothing: a SEND is fanned out
//! to the subscriptions registered at that instant.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::connection::ConnectionId;
use crate::message::Message;
use crate::storage::{QueueStorage, StorageError};
use crate::subscription::{AckMode, Subscription};
use crate::transaction::SendAction;

/// Errors returned by [`Router`] operations.
#[derive(Error, Debug)]
pub enum RouterError {
    /// ACK/NACK for a message id the broker never issued, or one held by
    /// another connection.
    #[error("unknown message '{0}'")]
    UnknownMessage(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    Queue,
    Topic,
}

/// Snapshot of one destination, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationStats {
    pub kind: DestinationKind,
    pub subscriptions: usize,
    /// Queue messages delivered and waiting for ACK/NACK.
    pub unacked: usize,
}

/// A queue message handed to a subscription that has not acknowledged it.
struct Delivery {
    message: Message,
    conn: ConnectionId,
    subscription: String,
}

#[derive(Default)]
struct QueueState {
    /// Registration order.
    subscriptions: Vec<Subscription>,
    /// Round-robin cursor into `subscriptions`.
    next: usize,
    /// Delivery order.
    unacked: Vec<Delivery>,
}

impl QueueState {
    fn has_unacked(&self, conn: ConnectionId, subscription: &str) -> bool {
        self.unacked
            .iter()
            .any(|d| d.conn == conn && d.subscription == subscription)
    }

    /// Index of the next subscription able to take a message, starting at
    /// the round-robin cursor. `client` subscriptions hold at most one
    /// unacknowledged message.
    fn next_available(&self) -> Option<usize> {
        let n = self.subscriptions.len();
        (0..n).map(|i| (self.next + i) % n).find(|&i| {
            let sub = &self.subscriptions[i];
            !sub.conn.is_closed()
                && !(sub.ack == AckMode::Client && self.has_unacked(sub.conn.id(), &sub.id))
        })
    }

    fn remove_subscription(&mut self, conn: ConnectionId, id: &str) -> bool {
        let Some(pos) = self.subscriptions.iter().position(|s| s.is(conn, id)) else {
            return false;
        };
        self.subscriptions.remove(pos);
        if pos < self.next {
            self.next -= 1;
        }
        true
    }

    fn ack_mode(&self, conn: ConnectionId, id: &str) -> AckMode {
        self.subscriptions
            .iter()
            .find(|s| s.is(conn, id))
            .map(|s| s.ack)
            .unwrap_or(AckMode::ClientIndividual)
    }

    /// Remove every delivery matching `pred`, keeping delivery order.
    fn take_unacked(&mut self, mut pred: impl FnMut(usize, &Delivery) -> bool) -> Vec<Delivery> {
        let mut taken = Vec::new();
        let mut kept = Vec::with_capacity(self.unacked.len());
        for (i, d) in std::mem::take(&mut self.unacked).into_iter().enumerate() {
            if pred(i, &d) {
                taken.push(d);
            } else {
                kept.push(d);
            }
        }
        self.unacked = kept;
        taken
    }
}

#[derive(Default)]
struct TopicState {
    subscriptions: Vec<Subscription>,
}

impl TopicState {
    fn fan_out(&self, message: &Message) -> usize {
        let mut delivered = 0;
        for sub in &self.subscriptions {
            let ack = sub.ack.requires_ack().then_some(message.id.as_str());
            if sub.conn.deliver(message.to_frame(&sub.id, ack)) {
                delivered += 1;
            } else {
                debug!(
                    conn = sub.conn.id(),
                    subscription = %sub.id,
                    message_id = %message.id,
                    "topic delivery failed, message dropped for subscriber"
                );
            }
        }
        delivered
    }
}

enum Destination {
    Queue(QueueState),
    Topic(TopicState),
}

enum Settle {
    Ack,
    Nack,
}

/// The shared destination registry.
pub struct Router {
    destinations: DashMap<String, Arc<Mutex<Destination>>>,
    /// ack token (message id) -> queue holding the unacknowledged delivery
    in_flight: DashMap<String, String>,
    storage: Arc<dyn QueueStorage>,
    queue_prefix: String,
    next_message_id: AtomicU64,
}

impl Router {
    pub fn new(storage: Arc<dyn QueueStorage>, queue_prefix: impl Into<String>) -> Self {
        Self {
            destinations: DashMap::new(),
            in_flight: DashMap::new(),
            storage,
            queue_prefix: queue_prefix.into(),
            next_message_id: AtomicU64::new(1),
        }
    }

    pub fn kind(&self, destination: &str) -> DestinationKind {
        if destination.starts_with(&self.queue_prefix) {
            DestinationKind::Queue
        } else {
            DestinationKind::Topic
        }
    }

    pub async fn start(&self) -> Result<(), RouterError> {
        Ok(self.storage.start().await?)
    }

    pub async fn stop(&self) -> Result<(), RouterError> {
        Ok(self.storage.stop().await?)
    }

    fn destination(&self, name: &str) -> Arc<Mutex<Destination>> {
        self.destinations
            .entry(name.to_string())
            .or_insert_with(|| {
                let dest = match self.kind(name) {
                    DestinationKind::Queue => Destination::Queue(QueueState::default()),
                    DestinationKind::Topic => Destination::Topic(TopicState::default()),
                };
                Arc::new(Mutex::new(dest))
            })
            .value()
            .clone()
    }

    fn existing(&self, name: &str) -> Option<Arc<Mutex<Destination>>> {
        self.destinations.get(name).map(|d| d.value().clone())
    }

    /// Accept a SEND. Returns the id assigned to the message.
    pub async fn send(&self, action: SendAction) -> Result<String, RouterError> {
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst).to_string();
        let name = action.destination;
        let message = Message::new(id.clone(), name.clone(), action.headers, action.body);

        let dest = self.destination(&name);
        let mut dest = dest.lock().await;
        match &mut *dest {
            Destination::Queue(q) => {
                self.storage.append(&name, message).await?;
                self.drain(&name, q).await?;
            }
            Destination::Topic(t) => {
                let n = t.fan_out(&message);
                debug!(destination = %name, message_id = %id, subscribers = n, "topic message fanned out");
            }
        }
        Ok(id)
    }

    /// Register a subscription. Queue subscriptions receive any backlog
    /// before this returns.
    pub async fn subscribe(&self, sub: Subscription) -> Result<(), RouterError> {
        let name = sub.destination.clone();
        debug!(conn = sub.conn.id(), subscription = %sub.id, destination = %name, ack = %sub.ack, "subscribe");

        let dest = self.destination(&name);
        let mut dest = dest.lock().await;
        match &mut *dest {
            Destination::Queue(q) => {
                q.subscriptions.push(sub);
                self.drain(&name, q).await?;
            }
            Destination::Topic(t) => t.subscriptions.push(sub),
        }
        Ok(())
    }

    /// Release a subscription. Its unacknowledged queue messages go back to
    /// the front of the queue for redelivery.
    pub async fn unsubscribe(
        &self,
        conn: ConnectionId,
        destination: &str,
        id: &str,
    ) -> Result<(), RouterError> {
        let Some(dest) = self.existing(destination) else {
            return Ok(());
        };
        let mut dest = dest.lock().await;
        match &mut *dest {
            Destination::Queue(q) => {
                q.remove_subscription(conn, id);
                let released = q.take_unacked(|_, d| d.conn == conn && d.subscription == id);
                if !released.is_empty() {
                    debug!(conn, subscription = %id, destination, count = released.len(), "requeueing unacknowledged messages");
                }
                self.requeue(destination, released).await?;
                self.drain(destination, q).await?;
            }
            Destination::Topic(t) => t.subscriptions.retain(|s| !s.is(conn, id)),
        }
        Ok(())
    }

    /// Acknowledge the delivery identified by `ack_id`. In `client` mode
    /// every earlier delivery to the same subscription is acknowledged too.
    pub async fn ack(&self, conn: ConnectionId, ack_id: &str) -> Result<(), RouterError> {
        self.settle(conn, ack_id, Settle::Ack).await
    }

    /// Reject the delivery identified by `ack_id`; it is requeued at the
    /// front of its queue. Cumulative in `client` mode, like ACK.
    pub async fn nack(&self, conn: ConnectionId, ack_id: &str) -> Result<(), RouterError> {
        self.settle(conn, ack_id, Settle::Nack).await
    }

    /// Check that `conn` may ACK or NACK `ack_id` without settling anything.
    ///
    /// Accepts exactly the ids [`Router::ack`] and [`Router::nack`] accept,
    /// as long as the connection does not settle anything in between.
    pub async fn can_settle(&self, conn: ConnectionId, ack_id: &str) -> Result<(), RouterError> {
        let Some(queue) = self.in_flight.get(ack_id).map(|e| e.value().clone()) else {
            return self.check_issued(ack_id);
        };
        let dest = self.queue_of(&queue, ack_id)?;
        let dest = dest.lock().await;
        match &*dest {
            Destination::Queue(q) => self.locate(q, conn, ack_id).map(|_| ()),
            Destination::Topic(_) => Err(RouterError::UnknownMessage(ack_id.to_string())),
        }
    }

    fn queue_of(&self, queue: &str, ack_id: &str) -> Result<Arc<Mutex<Destination>>, RouterError> {
        self.existing(queue)
            .ok_or_else(|| RouterError::UnknownMessage(ack_id.to_string()))
    }

    /// Position of `ack_id` among the deliveries `conn` holds on `q`. `None`
    /// for an issued id that is no longer in flight.
    fn locate(
        &self,
        q: &QueueState,
        conn: ConnectionId,
        ack_id: &str,
    ) -> Result<Option<usize>, RouterError> {
        match q.unacked.iter().position(|d| d.message.id == ack_id) {
            None => self.check_issued(ack_id).map(|()| None),
            Some(pos) if q.unacked[pos].conn != conn => {
                Err(RouterError::UnknownMessage(ack_id.to_string()))
            }
            Some(pos) => Ok(Some(pos)),
        }
    }

    async fn settle(&self, conn: ConnectionId, ack_id: &str, how: Settle) -> Result<(), RouterError> {
        let Some(queue) = self.in_flight.get(ack_id).map(|e| e.value().clone()) else {
            // topic messages and already-settled queue messages
            return self.check_issued(ack_id);
        };
        let dest = self.queue_of(&queue, ack_id)?;
        let mut dest = dest.lock().await;
        let Destination::Queue(q) = &mut *dest else {
            return Err(RouterError::UnknownMessage(ack_id.to_string()));
        };

        let Some(pos) = self.locate(q, conn, ack_id)? else {
            return Ok(());
        };
        let subscription = q.unacked[pos].subscription.clone();
        let settled = match q.ack_mode(conn, &subscription) {
            AckMode::Client => {
                q.take_unacked(|i, d| i <= pos && d.conn == conn && d.subscription == subscription)
            }
            _ => q.take_unacked(|i, _| i == pos),
        };

        match how {
            Settle::Ack => {
                for d in settled {
                    self.in_flight.remove(&d.message.id);
                    self.storage.acknowledge(&queue, &d.message.id).await?;
                }
            }
            Settle::Nack => {
                debug!(conn, subscription = %subscription, destination = %queue, count = settled.len(), "nack, requeueing");
                self.requeue(&queue, settled).await?;
            }
        }
        self.drain(&queue, q).await
    }

    /// An id that is not in flight is fine as long as the broker issued it.
    fn check_issued(&self, ack_id: &str) -> Result<(), RouterError> {
        let issued = self.next_message_id.load(Ordering::SeqCst);
        match ack_id.parse::<u64>() {
            Ok(n) if n >= 1 && n < issued => Ok(()),
            _ => Err(RouterError::UnknownMessage(ack_id.to_string())),
        }
    }

    /// Put deliveries back at the front of `queue`, oldest first.
    async fn requeue(&self, queue: &str, deliveries: Vec<Delivery>) -> Result<(), RouterError> {
        for d in deliveries.into_iter().rev() {
            self.in_flight.remove(&d.message.id);
            let mut message = d.message;
            message.redelivered = true;
            self.storage.requeue(queue, message).await?;
        }
        Ok(())
    }

    /// Dispatch pending messages of `queue` while some subscription can take
    /// one. Callers hold the destination lock.
    async fn drain(&self, queue: &str, q: &mut QueueState) -> Result<(), RouterError> {
        while let Some(idx) = q.next_available() {
            let Some(message) = self.storage.pop_next(queue).await? else {
                break;
            };
            q.next = idx + 1;
            let sub = &q.subscriptions[idx];
            let ack = sub.ack.requires_ack().then_some(message.id.as_str());
            if !sub.conn.deliver(message.to_frame(&sub.id, ack)) {
                // the subscriber's connection is now closed, so it is skipped
                // from here on
                self.storage.requeue(queue, message).await?;
                continue;
            }
            debug!(
                conn = sub.conn.id(),
                subscription = %sub.id,
                destination = queue,
                message_id = %message.id,
                "queue message dispatched"
            );
            if sub.ack.requires_ack() {
                self.in_flight.insert(message.id.clone(), queue.to_string());
                q.unacked.push(Delivery {
                    conn: sub.conn.id(),
                    subscription: sub.id.clone(),
                    message,
                });
            } else {
                self.storage.acknowledge(queue, &message.id).await?;
            }
        }
        Ok(())
    }

    /// Current state of `destination`, if it has ever been referenced.
    pub async fn stats(&self, destination: &str) -> Option<DestinationStats> {
        let dest = self.existing(destination)?;
        let dest = dest.lock().await;
        Some(match &*dest {
            Destination::Queue(q) => DestinationStats {
                kind: DestinationKind::Queue,
                subscriptions: q.subscriptions.len(),
                unacked: q.unacked.len(),
            },
            Destination::Topic(t) => DestinationStats {
                kind: DestinationKind::Topic,
                subscriptions: t.subscriptions.len(),
                unacked: 0,
            },
        })
    }
}
