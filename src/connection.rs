use futures::{Sink, SinkExt, StreamExt};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{FrameError, HeaderEscaping, StompCodec, StompItem};
use crate::frame::Frame;
use crate::heartbeat::Activity;
use crate::session::{ConnectionSession, Flow, SessionState};

/// Broker-assigned identity of an accepted connection.
pub type ConnectionId = u64;

/// How long the writer may keep flushing queued frames (ERROR, RECEIPT)
/// after the connection has been closed.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Cloneable handle to one client connection.
///
/// The handle is the only way the rest of the broker talks to a client:
/// frames are pushed onto a bounded outbound queue drained by the
/// connection's writer task, so a slow client never blocks the router. A
/// full queue counts as a failed transport and closes the connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: Arc<str>,
    outbound_tx: mpsc::Sender<StompItem>,
    closed: CancellationToken,
    escaping: HeaderEscaping,
}

impl ConnectionHandle {
    /// Create a handle whose close signal is a child of `parent`, together
    /// with the receiving end of its outbound queue.
    pub fn new(
        id: ConnectionId,
        peer: &str,
        capacity: usize,
        parent: &CancellationToken,
    ) -> (Self, mpsc::Receiver<StompItem>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id,
            peer: Arc::from(peer),
            outbound_tx,
            closed: parent.child_token(),
            escaping: HeaderEscaping::default(),
        };
        (handle, outbound_rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Escaping switch shared with this connection's codec.
    pub fn header_escaping(&self) -> &HeaderEscaping {
        &self.escaping
    }

    /// Queue a frame for the client. Returns `false` when the frame could
    /// not be queued; the connection is closed in that case.
    pub fn deliver(&self, frame: Frame) -> bool {
        self.push(StompItem::Frame(frame))
    }

    pub(crate) fn push(&self, item: StompItem) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        match self.outbound_tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(conn = self.id, peer = %self.peer, "outbound queue full, closing connection");
                self.closed.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.closed.cancel();
                false
            }
        }
    }

    /// Ask the connection to shut down. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has been asked to shut down.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub(crate) fn close_signal(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Transport wrapper that stamps read activity on every read that yields
/// bytes, including reads in the middle of a frame.
struct ReadTracking<S> {
    inner: S,
    activity: Arc<Activity>,
}

impl<S> ReadTracking<S> {
    fn new(inner: S, activity: Arc<Activity>) -> Self {
        Self { inner, activity }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReadTracking<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.activity.touch_read();
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReadTracking<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Serve one client connection until it closes.
///
/// The calling task reads and processes frames; a spawned writer task
/// drains the outbound queue. Whatever ends the connection (DISCONNECT,
/// protocol error, heart-beat timeout, transport failure, outbound overflow
/// or broker shutdown), the session is torn down through the same path
/// before this returns.
pub(crate) async fn run<S>(
    stream: S,
    codec: StompCodec,
    mut session: ConnectionSession,
    outbound_rx: mpsc::Receiver<StompItem>,
    activity: Arc<Activity>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let handle = session.handle().clone();
    let transport = ReadTracking::new(stream, activity.clone());
    let (sink, mut stream) = Framed::new(transport, codec).split();
    let mut writer = tokio::spawn(write_loop(
        sink,
        outbound_rx,
        handle.close_signal(),
        activity.clone(),
    ));

    info!(conn = handle.id(), peer = %handle.peer(), "connection accepted");

    let connect_deadline = tokio::time::sleep(session.connect_timeout());
    tokio::pin!(connect_deadline);

    loop {
        tokio::select! {
            _ = handle.closed() => {
                debug!(conn = handle.id(), "connection close requested");
                break;
            }
            _ = &mut connect_deadline, if session.state() == SessionState::AwaitingConnect => {
                warn!(conn = handle.id(), peer = %handle.peer(), "no CONNECT received in time, closing connection");
                break;
            }
            item = stream.next() => match item {
                Some(Ok(StompItem::Heartbeat)) => {}
                Some(Ok(StompItem::Frame(frame))) => {
                    debug!(conn = handle.id(), command = %frame.command, "frame received");
                    if let Flow::Close = session.process(frame).await {
                        break;
                    }
                }
                Some(Err(FrameError::Io(e))) => {
                    debug!(conn = handle.id(), error = %e, "transport error");
                    break;
                }
                Some(Err(e)) => {
                    session.fail(&e.into(), None);
                    break;
                }
                None => {
                    debug!(conn = handle.id(), "peer closed the connection");
                    break;
                }
            }
        }
    }

    session.teardown().await;
    handle.close();
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(conn = handle.id(), peer = %handle.peer(), "connection closed");
}

async fn write_loop<W>(
    mut sink: W,
    mut outbound_rx: mpsc::Receiver<StompItem>,
    closed: CancellationToken,
    activity: Arc<Activity>,
) where
    W: Sink<StompItem, Error = FrameError> + Unpin,
{
    loop {
        tokio::select! {
            biased;
            item = outbound_rx.recv() => match item {
                Some(item) => {
                    if let Err(e) = sink.send(item).await {
                        debug!(error = %e, "write failed");
                        closed.cancel();
                        return;
                    }
                    activity.touch_write();
                }
                None => break,
            },
            _ = closed.cancelled() => {
                // frames queued before the close (ERROR, RECEIPT) still go out
                while let Ok(item) = outbound_rx.try_recv() {
                    if sink.feed(item).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }
    let _ = sink.close().await;
}
