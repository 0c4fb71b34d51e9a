//! An embeddable STOMP 1.0/1.1/1.2 message broker built on tokio.
//!
//! ```no_run
//! use stomp_broker::{Broker, BrokerConfig};
//!
//! # async fn run() -> std::io::Result<()> {
//! let broker = Broker::new(BrokerConfig::default().with_addr("127.0.0.1:61613"));
//! broker.listen_and_serve().await
//! # }
//! ```

pub mod auth;
pub mod broker;
pub mod codec;
pub mod config;
pub mod connection;
pub mod frame;
pub mod heartbeat;
pub mod message;
pub mod parser;
pub mod router;
pub mod session;
pub mod storage;
pub mod subscription;
pub mod transaction;

pub use auth::{AllowAll, Authenticator, StaticCredentials};
pub use broker::{Broker, BrokerBuilder};
pub use codec::{FrameError, HeaderEscaping, StompCodec, StompItem};
pub use config::BrokerConfig;
pub use connection::{ConnectionHandle, ConnectionId};
pub use frame::{Command, Frame};
pub use heartbeat::{Heartbeats, negotiate_heartbeats, parse_heartbeat_header};
pub use message::Message;
pub use router::{DestinationKind, DestinationStats, Router, RouterError};
pub use session::{ConnectionSession, ErrorKind, SessionError, SessionState, Version};
pub use storage::{MemoryQueueStorage, QueueStorage, StorageError};
pub use subscription::{AckMode, Subscription};
pub use transaction::{TransactionError, TransactionManager};
