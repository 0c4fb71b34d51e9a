use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::auth::Authenticator;
use crate::codec::StompCodec;
use crate::config::BrokerConfig;
use crate::connection::{self, ConnectionHandle};
use crate::heartbeat::Activity;
use crate::router::Router;
use crate::session::ConnectionSession;
use crate::storage::{MemoryQueueStorage, QueueStorage};

/// Builder for [`Broker`].
///
/// Without an authenticator every client is accepted; without a storage
/// backend queues live in memory.
#[derive(Default)]
pub struct BrokerBuilder {
    config: BrokerConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
    storage: Option<Arc<dyn QueueStorage>>,
}

impl BrokerBuilder {
    pub fn config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn QueueStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn build(self) -> Broker {
        let config = self.config.normalized();
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryQueueStorage::new()));
        let router = Arc::new(Router::new(storage, config.queue_prefix.clone()));
        Broker {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                router,
                authenticator: self.authenticator,
                next_conn_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

struct Inner {
    config: Arc<BrokerConfig>,
    router: Arc<Router>,
    authenticator: Option<Arc<dyn Authenticator>>,
    next_conn_id: AtomicU64,
    shutdown: CancellationToken,
}

/// A STOMP broker.
///
/// Owns the single shared [`Router`] and spawns one task per accepted
/// connection. Cloning a `Broker` yields another handle to the same broker.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::default()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.inner.router
    }

    /// Listen on `config.addr` and serve until shutdown or an accept error.
    pub async fn listen_and_serve(&self) -> io::Result<()> {
        let listener = TcpListener::bind(self.inner.config.bind_addr()).await?;
        self.serve(listener).await
    }

    /// Accept connections from `listener`, one task each.
    ///
    /// Returns `Ok(())` after [`Broker::shutdown`], or the accept error that
    /// stopped the loop. Connections already accepted keep running after an
    /// accept error.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        self.inner.router.start().await.map_err(io::Error::other)?;
        info!(addr = ?listener.local_addr().ok(), "stomp broker listening");

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!(%peer, error = %e, "failed to set TCP_NODELAY");
                        }
                        self.accept(stream, peer.to_string());
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed, no longer accepting connections");
                        return Err(e);
                    }
                }
            }
        }

        info!("stomp broker stopped accepting connections");
        if let Err(e) = self.inner.router.stop().await {
            warn!(error = %e, "queue storage did not stop cleanly");
        }
        Ok(())
    }

    /// Serve a single already-accepted byte stream.
    pub fn accept<S>(&self, stream: S, peer: impl Into<String>) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let inner = &self.inner;
        let id = inner.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let peer = peer.into();
        let (handle, outbound_rx) = ConnectionHandle::new(
            id,
            &peer,
            inner.config.outbound_capacity,
            &inner.shutdown,
        );
        let codec =
            StompCodec::with_limits(inner.config.max_header_bytes, inner.config.max_body_bytes)
                .with_header_escaping(handle.header_escaping().clone());
        let activity = Arc::new(Activity::new());
        let session = ConnectionSession::new(
            handle,
            inner.router.clone(),
            inner.authenticator.clone(),
            inner.config.clone(),
            activity.clone(),
        );

        tokio::spawn(connection::run(stream, codec, session, outbound_rx, activity))
    }

    /// Stop accepting connections and close every live one.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}
