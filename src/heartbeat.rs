use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::codec::StompItem;
use crate::connection::ConnectionHandle;

/// Parse the STOMP `heart-beat` header value (format: "cx,cy").
///
/// Parameters
/// - `header`: header string from the client (for example "10000,10000").
///   The values represent milliseconds.
///
/// Returns a tuple `(cx, cy)` where `cx` is how often the client will send
/// and `cy` how often it wants to receive. Missing or invalid fields default
/// to `0`.
pub fn parse_heartbeat_header(header: &str) -> (u64, u64) {
    let mut parts = header.split(',');
    let cx = parts
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    let cy = parts
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    (cx, cy)
}

/// Negotiated heart-beat intervals, from the broker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Heartbeats {
    /// How long the broker tolerates silence from the client (before grace).
    pub read: Option<Duration>,
    /// How often the broker must send something to the client.
    pub write: Option<Duration>,
}

impl Heartbeats {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_disabled(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }

    /// Value for the `heart-beat` header of CONNECTED ("sx,sy" in ms).
    pub fn header_value(&self) -> String {
        let ms = |d: Option<Duration>| d.map(|d| d.as_millis()).unwrap_or(0);
        format!("{},{}", ms(self.write), ms(self.read))
    }
}

/// Negotiate heartbeat intervals between a client and the broker.
///
/// Parameters
/// - `client_send`: interval at which the client offers to send (cx).
/// - `client_recv`: interval at which the client wants to receive (cy).
/// - `server_pref`: broker's preferred interval for both directions.
///
/// Each direction takes the maximum of the two sides, and a zero on either
/// side disables that direction.
pub fn negotiate_heartbeats(client_send: u64, client_recv: u64, server_pref: u64) -> Heartbeats {
    let pick = |client: u64| {
        if client == 0 || server_pref == 0 {
            None
        } else {
            Some(Duration::from_millis(client.max(server_pref)))
        }
    };
    Heartbeats {
        read: pick(client_send),
        write: pick(client_recv),
    }
}

/// Read/write activity stamps for one connection.
///
/// Stamps are milliseconds since the connection was created and are updated
/// atomically by the reader and writer on every item.
#[derive(Debug)]
pub struct Activity {
    epoch: Instant,
    last_read: AtomicU64,
    last_write: AtomicU64,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_read: AtomicU64::new(0),
            last_write: AtomicU64::new(0),
        }
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn touch_read(&self) {
        self.last_read.store(self.now_millis(), Ordering::SeqCst);
    }

    pub fn touch_write(&self) {
        self.last_write.store(self.now_millis(), Ordering::SeqCst);
    }

    pub fn since_read(&self) -> Duration {
        let last = self.last_read.load(Ordering::SeqCst);
        Duration::from_millis(self.now_millis().saturating_sub(last))
    }

    pub fn since_write(&self) -> Duration {
        let last = self.last_write.load(Ordering::SeqCst);
        Duration::from_millis(self.now_millis().saturating_sub(last))
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection heart-beat timer pair.
///
/// Runs as its own task next to the connection's read loop. A client that
/// stays silent longer than `read × grace` gets its connection closed; when
/// the broker has not written anything for `write`, a lone LF is queued.
/// The task stops when cancelled, dropped, or when the connection closes.
pub struct HeartbeatMonitor {
    task: JoinHandle<()>,
}

impl HeartbeatMonitor {
    /// Start monitoring. Returns `None` when both directions are disabled.
    pub fn start(
        heartbeats: Heartbeats,
        grace: f64,
        activity: Arc<Activity>,
        conn: ConnectionHandle,
    ) -> Option<Self> {
        if heartbeats.is_disabled() {
            return None;
        }
        let task = tokio::spawn(run(heartbeats, grace, activity, conn));
        Some(Self { task })
    }

    /// Stop the timers. Idempotent.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(heartbeats: Heartbeats, grace: f64, activity: Arc<Activity>, conn: ConnectionHandle) {
    let read_limit = heartbeats.read.map(|d| d.mul_f64(grace));
    debug!(conn = conn.id(), ?read_limit, write = ?heartbeats.write, "heart-beat monitor started");

    loop {
        let mut wait = Duration::from_secs(3600);

        if let Some(limit) = read_limit {
            let silent = activity.since_read();
            if silent >= limit {
                warn!(
                    conn = conn.id(),
                    silent_ms = silent.as_millis() as u64,
                    "no heart-beat from client, closing connection"
                );
                conn.close();
                return;
            }
            wait = wait.min(limit - silent);
        }

        if let Some(interval) = heartbeats.write {
            let idle = activity.since_write();
            if idle >= interval {
                if !conn.push(StompItem::Heartbeat) {
                    return;
                }
                activity.touch_write();
                wait = wait.min(interval);
            } else {
                wait = wait.min(interval - idle);
            }
        }

        // never spin on a zero-length sleep
        let wait = wait.max(Duration::from_millis(1));
        tokio::select! {
            _ = conn.closed() => return,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
