//! Per-connection STOMP protocol state machine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::codec::FrameError;
use crate::config::BrokerConfig;
use crate::connection::ConnectionHandle;
use crate::frame::{Command, Frame};
use crate::heartbeat::{
    Activity, HeartbeatMonitor, Heartbeats, negotiate_heartbeats, parse_heartbeat_header,
};
use crate::router::{Router, RouterError};
use crate::storage::StorageError;
use crate::subscription::{AckMode, Subscription};
use crate::transaction::{Action, SendAction, TransactionError, TransactionManager};

/// Protocol versions the broker speaks, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Version {
    V1_0,
    V1_1,
    V1_2,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::V1_0 => "1.0",
            Version::V1_1 => "1.1",
            Version::V1_2 => "1.2",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "1.0" => Some(Version::V1_0),
            "1.1" => Some(Version::V1_1),
            "1.2" => Some(Version::V1_2),
            _ => None,
        }
    }

    /// Highest version listed in an `accept-version` header. A missing
    /// header means the client speaks 1.0.
    pub fn negotiate(accept_version: Option<&str>) -> Option<Self> {
        match accept_version {
            None => Some(Version::V1_0),
            Some(list) => list.split(',').filter_map(Version::parse).max(),
        }
    }
}

/// Error classes; they decide what a failure does to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Protocol,
    Authentication,
    Application,
    Transport,
    Storage,
}

/// Errors raised while processing a client frame. Every one of them ends
/// the connection.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("missing required header '{0}'")]
    MissingHeader(&'static str),
    #[error("no supported protocol version in '{0}'")]
    UnsupportedVersion(String),
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("unknown subscription '{0}'")]
    UnknownSubscription(String),
    #[error("duplicate subscription '{0}'")]
    DuplicateSubscription(String),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error("connection is closed")]
    Closed,
}

impl From<StorageError> for SessionError {
    fn from(e: StorageError) -> Self {
        SessionError::Router(RouterError::Storage(e))
    }
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Frame(FrameError::Io(_)) | SessionError::Closed => ErrorKind::Transport,
            SessionError::Frame(_)
            | SessionError::Protocol(_)
            | SessionError::MissingHeader(_)
            | SessionError::UnsupportedVersion(_) => ErrorKind::Protocol,
            SessionError::AuthenticationFailed => ErrorKind::Authentication,
            SessionError::UnknownSubscription(_)
            | SessionError::DuplicateSubscription(_)
            | SessionError::Transaction(_)
            | SessionError::Router(RouterError::UnknownMessage(_)) => ErrorKind::Application,
            SessionError::Router(RouterError::Storage(_)) => ErrorKind::Storage,
        }
    }

    fn summary(&self) -> &'static str {
        match self {
            SessionError::Frame(FrameError::TooLarge { .. }) => "frame too large",
            SessionError::Frame(_) => "malformed frame",
            SessionError::Protocol(_) | SessionError::MissingHeader(_) => "protocol violation",
            SessionError::UnsupportedVersion(_) => "unsupported version",
            SessionError::AuthenticationFailed => "access denied",
            SessionError::UnknownSubscription(_) => "unknown subscription",
            SessionError::DuplicateSubscription(_) => "duplicate subscription",
            SessionError::Transaction(TransactionError::DuplicateTransaction(_)) => {
                "duplicate transaction"
            }
            SessionError::Transaction(TransactionError::TransactionNotFound(_)) => {
                "unknown transaction"
            }
            SessionError::Router(RouterError::UnknownMessage(_)) => "unknown message",
            SessionError::Router(RouterError::Storage(_)) => "storage failure",
            SessionError::Closed => "connection closed",
        }
    }

    /// ERROR frame describing this failure; `receipt` is echoed as
    /// `receipt-id` when the offending frame asked for one.
    pub fn to_error_frame(&self, receipt: Option<&str>) -> Frame {
        let mut frame = Frame::new(Command::Error).header("message", self.summary());
        if let Some(receipt) = receipt {
            frame = frame.header("receipt-id", receipt);
        }
        frame
            .header("content-type", "text/plain")
            .set_body(self.to_string().into_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingConnect,
    Connected {
        version: Version,
        heartbeats: Heartbeats,
    },
    Disconnecting,
    Closed,
    Error,
}

/// What the connection driver should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// The protocol engine of a single connection.
///
/// Owns the connection's subscriptions, open transactions and heart-beat
/// monitor; everything shared lives in the [`Router`].
pub struct ConnectionSession {
    state: SessionState,
    conn: ConnectionHandle,
    router: Arc<Router>,
    authenticator: Option<Arc<dyn Authenticator>>,
    config: Arc<BrokerConfig>,
    activity: Arc<Activity>,
    principal: Option<String>,
    /// subscription id -> destination
    subscriptions: HashMap<String, String>,
    transactions: TransactionManager,
    monitor: Option<HeartbeatMonitor>,
    torn_down: bool,
}

impl ConnectionSession {
    pub fn new(
        conn: ConnectionHandle,
        router: Arc<Router>,
        authenticator: Option<Arc<dyn Authenticator>>,
        config: Arc<BrokerConfig>,
        activity: Arc<Activity>,
    ) -> Self {
        Self {
            state: SessionState::AwaitingConnect,
            conn,
            router,
            authenticator,
            config,
            activity,
            principal: None,
            subscriptions: HashMap::new(),
            transactions: TransactionManager::new(),
            monitor: None,
            torn_down: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.conn
    }

    /// How long a fresh connection may stay silent before CONNECT.
    pub fn connect_timeout(&self) -> Duration {
        self.config.heartbeat
    }

    /// Login of the authenticated client, if it sent one.
    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    /// Process one client frame: apply it, emit the RECEIPT it asked for,
    /// or report the failure with an ERROR frame.
    pub async fn process(&mut self, frame: Frame) -> Flow {
        let receipt = frame.receipt().map(str::to_owned);
        let command = frame.command;
        match self.handle_frame(frame).await {
            Ok(flow) => {
                if let Some(receipt) = receipt {
                    if !matches!(command, Command::Connect | Command::Stomp) {
                        self.conn
                            .deliver(Frame::new(Command::Receipt).header("receipt-id", receipt));
                    }
                }
                flow
            }
            Err(err) => {
                self.fail(&err, receipt.as_deref());
                Flow::Close
            }
        }
    }

    /// Report a fatal error to the client (best effort) and move to a
    /// terminal state.
    pub fn fail(&mut self, err: &SessionError, receipt: Option<&str>) {
        warn!(conn = self.conn.id(), kind = ?err.kind(), error = %err, "closing connection");
        if err.kind() != ErrorKind::Transport {
            self.conn.deliver(err.to_error_frame(receipt));
        }
        self.state = match err.kind() {
            ErrorKind::Authentication => SessionState::Closed,
            _ => SessionState::Error,
        };
    }

    /// Apply one frame according to the current state.
    pub async fn handle_frame(&mut self, frame: Frame) -> Result<Flow, SessionError> {
        use SessionState as S;
        match (self.state, frame.command) {
            (S::AwaitingConnect, Command::Connect | Command::Stomp) => self.on_connect(frame).await,
            (S::AwaitingConnect, other) => Err(SessionError::Protocol(format!(
                "expected CONNECT, got {}",
                other
            ))),

            (S::Connected { .. }, Command::Send) => self.on_send(frame).await,
            (S::Connected { .. }, Command::Subscribe) => self.on_subscribe(frame).await,
            (S::Connected { .. }, Command::Unsubscribe) => self.on_unsubscribe(frame).await,
            (S::Connected { .. }, Command::Ack) => self.on_ack(frame, false).await,
            (S::Connected { .. }, Command::Nack) => self.on_ack(frame, true).await,
            (S::Connected { .. }, Command::Begin) => self.on_begin(frame),
            (S::Connected { .. }, Command::Commit) => self.on_commit(frame).await,
            (S::Connected { .. }, Command::Abort) => self.on_abort(frame),
            (S::Connected { .. }, Command::Disconnect) => self.on_disconnect(),
            (S::Connected { .. }, Command::Connect | Command::Stomp) => {
                Err(SessionError::Protocol("already connected".to_string()))
            }
            (
                S::Connected { .. },
                Command::Connected | Command::Message | Command::Receipt | Command::Error,
            ) => Err(SessionError::Protocol(format!(
                "{} is a server frame",
                frame.command
            ))),

            (S::Disconnecting | S::Closed | S::Error, _) => Err(SessionError::Closed),
        }
    }

    fn version(&self) -> Version {
        match self.state {
            SessionState::Connected { version, .. } => version,
            _ => Version::V1_0,
        }
    }

    async fn on_connect(&mut self, frame: Frame) -> Result<Flow, SessionError> {
        let accept = frame.get_header("accept-version");
        let version = Version::negotiate(accept)
            .ok_or_else(|| SessionError::UnsupportedVersion(accept.unwrap_or_default().to_string()))?;

        let login = frame.get_header("login");
        let passcode = frame.get_header("passcode");
        if let Some(auth) = &self.authenticator {
            if !auth.authenticate(login, passcode).await {
                return Err(SessionError::AuthenticationFailed);
            }
        }
        self.principal = login.map(str::to_owned);

        let (cx, cy) = match (version, frame.get_header("heart-beat")) {
            (Version::V1_0, _) | (_, None) => (0, 0),
            (_, Some(hb)) => parse_heartbeat_header(hb),
        };
        let heartbeats = negotiate_heartbeats(cx, cy, self.config.heartbeat.as_millis() as u64);

        let mut connected = Frame::new(Command::Connected);
        if version == Version::V1_0 {
            self.conn.header_escaping().disable();
        } else {
            connected = connected.header("version", version.as_str());
        }
        connected = connected
            .header("heart-beat", heartbeats.header_value())
            .header("session", format!("session-{}", self.conn.id()))
            .header("server", concat!("stomp-broker/", env!("CARGO_PKG_VERSION")));
        self.conn.deliver(connected);

        self.state = SessionState::Connected {
            version,
            heartbeats,
        };
        self.monitor = HeartbeatMonitor::start(
            heartbeats,
            self.config.heartbeat_grace,
            self.activity.clone(),
            self.conn.clone(),
        );
        info!(
            conn = self.conn.id(),
            login = self.principal.as_deref().unwrap_or("<anonymous>"),
            version = version.as_str(),
            heart_beat = %heartbeats.header_value(),
            "client connected"
        );
        Ok(Flow::Continue)
    }

    async fn on_send(&mut self, frame: Frame) -> Result<Flow, SessionError> {
        let destination = required(&frame, "destination")?.to_string();
        let transaction = frame.transaction().map(str::to_owned);
        let action = SendAction {
            destination,
            headers: frame.headers,
            body: frame.body,
        };
        match transaction {
            Some(tx) => self.transactions.defer(&tx, Action::Send(action))?,
            None => {
                self.router.send(action).await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_subscribe(&mut self, frame: Frame) -> Result<Flow, SessionError> {
        let destination = required(&frame, "destination")?.to_string();
        let id = match (frame.get_header("id"), self.version()) {
            (Some(id), _) => id.to_string(),
            (None, Version::V1_0) => destination.clone(),
            (None, _) => return Err(SessionError::MissingHeader("id")),
        };
        let ack = match frame.get_header("ack") {
            Some(mode) => mode.parse::<AckMode>().map_err(SessionError::Protocol)?,
            None => AckMode::Auto,
        };
        if self.subscriptions.contains_key(&id) {
            return Err(SessionError::DuplicateSubscription(id));
        }

        self.subscriptions.insert(id.clone(), destination.clone());
        self.router
            .subscribe(Subscription::new(id, destination, ack, self.conn.clone()))
            .await?;
        Ok(Flow::Continue)
    }

    async fn on_unsubscribe(&mut self, frame: Frame) -> Result<Flow, SessionError> {
        let id = match (frame.get_header("id"), self.version()) {
            (Some(id), _) => id,
            (None, Version::V1_0) => required(&frame, "destination")?,
            (None, _) => return Err(SessionError::MissingHeader("id")),
        };
        let destination = self
            .subscriptions
            .remove(id)
            .ok_or_else(|| SessionError::UnknownSubscription(id.to_string()))?;
        self.router
            .unsubscribe(self.conn.id(), &destination, id)
            .await?;
        Ok(Flow::Continue)
    }

    async fn on_ack(&mut self, frame: Frame, nack: bool) -> Result<Flow, SessionError> {
        let ack_id = match (frame.get_header("id"), self.version()) {
            (Some(id), Version::V1_2) => id,
            _ => frame
                .get_header("message-id")
                .or_else(|| frame.get_header("id"))
                .ok_or(SessionError::MissingHeader("id"))?,
        }
        .to_string();
        if let Some(sub) = frame.get_header("subscription") {
            if !self.subscriptions.contains_key(sub) {
                return Err(SessionError::UnknownSubscription(sub.to_string()));
            }
        }

        let action = if nack {
            Action::Nack(ack_id)
        } else {
            Action::Ack(ack_id)
        };
        match frame.transaction() {
            Some(tx) => self.transactions.defer(tx, action)?,
            None => self.apply(action).await?,
        }
        Ok(Flow::Continue)
    }

    fn on_begin(&mut self, frame: Frame) -> Result<Flow, SessionError> {
        let tx = required(&frame, "transaction")?;
        self.transactions.begin(tx)?;
        debug!(conn = self.conn.id(), transaction = tx, "transaction started");
        Ok(Flow::Continue)
    }

    async fn on_commit(&mut self, frame: Frame) -> Result<Flow, SessionError> {
        let tx = required(&frame, "transaction")?;
        let actions = self.transactions.commit(tx)?;
        debug!(conn = self.conn.id(), transaction = tx, actions = actions.len(), "committing");
        // a commit that would fail on an ACK/NACK applies nothing
        for action in &actions {
            if let Action::Ack(id) | Action::Nack(id) = action {
                self.router.can_settle(self.conn.id(), id).await?;
            }
        }
        for action in actions {
            self.apply(action).await?;
        }
        Ok(Flow::Continue)
    }

    fn on_abort(&mut self, frame: Frame) -> Result<Flow, SessionError> {
        let tx = required(&frame, "transaction")?;
        self.transactions.abort(tx)?;
        debug!(conn = self.conn.id(), transaction = tx, "transaction aborted");
        Ok(Flow::Continue)
    }

    fn on_disconnect(&mut self) -> Result<Flow, SessionError> {
        self.state = SessionState::Disconnecting;
        Ok(Flow::Close)
    }

    /// The single entry point for router effects, immediate or committed.
    async fn apply(&mut self, action: Action) -> Result<(), SessionError> {
        match action {
            Action::Send(send) => {
                self.router.send(send).await?;
            }
            Action::Ack(id) => self.router.ack(self.conn.id(), &id).await?,
            Action::Nack(id) => self.router.nack(self.conn.id(), &id).await?,
        }
        Ok(())
    }

    /// Release everything the connection holds: stop the heart-beat timers,
    /// unregister subscriptions (requeueing their unacknowledged messages)
    /// and drop open transactions. Safe to call more than once.
    pub async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if let Some(monitor) = self.monitor.take() {
            monitor.cancel();
        }

        for (id, destination) in self.subscriptions.drain() {
            if let Err(e) = self
                .router
                .unsubscribe(self.conn.id(), &destination, &id)
                .await
            {
                warn!(conn = self.conn.id(), subscription = %id, error = %e, "failed to release subscription");
            }
        }

        let discarded = self.transactions.discard_all();
        if discarded > 0 {
            debug!(conn = self.conn.id(), discarded, "open transactions discarded");
        }

        if !matches!(self.state, SessionState::Error) {
            self.state = SessionState::Closed;
        }
    }
}

fn required<'a>(frame: &'a Frame, name: &'static str) -> Result<&'a str, SessionError> {
    frame
        .get_header(name)
        .ok_or(SessionError::MissingHeader(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticCredentials;
    use crate::codec::StompItem;
    use crate::storage::MemoryQueueStorage;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn session(
        auth: Option<Arc<dyn Authenticator>>,
    ) -> (ConnectionSession, mpsc::Receiver<StompItem>) {
        let router = Arc::new(Router::new(Arc::new(MemoryQueueStorage::new()), "/queue"));
        let (handle, rx) = ConnectionHandle::new(1, "test", 32, &CancellationToken::new());
        let config = Arc::new(BrokerConfig::default());
        let s = ConnectionSession::new(handle, router, auth, config, Arc::new(Activity::new()));
        (s, rx)
    }

    fn next_frame(rx: &mut mpsc::Receiver<StompItem>) -> Frame {
        match rx.try_recv() {
            Ok(StompItem::Frame(f)) => f,
            other => panic!("expected frame, got {:?}", other),
        }
    }

    fn connect() -> Frame {
        Frame::new(Command::Connect)
            .header("accept-version", "1.1,1.2")
            .header("host", "/")
    }

    #[test]
    fn version_negotiation_picks_highest_common() {
        assert_eq!(Version::negotiate(None), Some(Version::V1_0));
        assert_eq!(Version::negotiate(Some("1.0,1.1")), Some(Version::V1_1));
        assert_eq!(Version::negotiate(Some("1.2, 1.0")), Some(Version::V1_2));
        assert_eq!(Version::negotiate(Some("2.0")), None);
    }

    #[tokio::test]
    async fn frames_before_connect_are_rejected() {
        let (mut s, mut rx) = session(None);
        let flow = s
            .process(Frame::new(Command::Send).header("destination", "/queue/a"))
            .await;
        assert_eq!(flow, Flow::Close);
        assert_eq!(s.state(), SessionState::Error);
        assert_eq!(next_frame(&mut rx).command, Command::Error);
    }

    #[tokio::test]
    async fn connect_negotiates_version_and_heartbeat() {
        let (mut s, mut rx) = session(None);
        let flow = s
            .process(connect().header("heart-beat", "0,120000"))
            .await;
        assert_eq!(flow, Flow::Continue);
        let connected = next_frame(&mut rx);
        assert_eq!(connected.command, Command::Connected);
        assert_eq!(connected.get_header("version"), Some("1.2"));
        // broker writes every 120s (client asked), never expects reads
        assert_eq!(connected.get_header("heart-beat"), Some("120000,0"));
        s.teardown().await;
    }

    #[tokio::test]
    async fn failed_authentication_closes_without_connected() {
        let auth: Arc<dyn Authenticator> = Arc::new(StaticCredentials::new().with_user("u", "p"));
        let (mut s, mut rx) = session(Some(auth));
        let flow = s
            .process(connect().header("login", "a").header("passcode", "b"))
            .await;
        assert_eq!(flow, Flow::Close);
        assert_eq!(s.state(), SessionState::Closed);
        let err = next_frame(&mut rx);
        assert_eq!(err.command, Command::Error);
        assert_eq!(err.get_header("message"), Some("access denied"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn receipt_follows_action() {
        let (mut s, mut rx) = session(None);
        s.process(connect()).await;
        next_frame(&mut rx);

        s.process(
            Frame::new(Command::Subscribe)
                .header("id", "0")
                .header("destination", "/queue/a")
                .header("receipt", "r-1"),
        )
        .await;
        let receipt = next_frame(&mut rx);
        assert_eq!(receipt.command, Command::Receipt);
        assert_eq!(receipt.get_header("receipt-id"), Some("r-1"));
    }

    #[tokio::test]
    async fn duplicate_subscription_id_is_fatal() {
        let (mut s, mut rx) = session(None);
        s.process(connect()).await;
        next_frame(&mut rx);
        let sub = Frame::new(Command::Subscribe)
            .header("id", "0")
            .header("destination", "/topic/a");
        assert_eq!(s.process(sub.clone()).await, Flow::Continue);
        assert_eq!(s.process(sub.header("receipt", "r9")).await, Flow::Close);
        let err = next_frame(&mut rx);
        assert_eq!(err.command, Command::Error);
        assert_eq!(err.get_header("receipt-id"), Some("r9"));
    }

    #[tokio::test]
    async fn unknown_transaction_is_fatal() {
        let (mut s, mut rx) = session(None);
        s.process(connect()).await;
        next_frame(&mut rx);
        let err = s
            .handle_frame(Frame::new(Command::Commit).header("transaction", "nope"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Application);
    }

    #[tokio::test]
    async fn disconnect_with_receipt() {
        let (mut s, mut rx) = session(None);
        s.process(connect()).await;
        next_frame(&mut rx);
        let flow = s
            .process(Frame::new(Command::Disconnect).header("receipt", "bye"))
            .await;
        assert_eq!(flow, Flow::Close);
        let receipt = next_frame(&mut rx);
        assert_eq!(receipt.command, Command::Receipt);
        assert_eq!(receipt.get_header("receipt-id"), Some("bye"));
        s.teardown().await;
        assert_eq!(s.state(), SessionState::Closed);
    }
}
