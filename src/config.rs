use std::time::Duration;

/// Default address for listening for connections.
pub const DEFAULT_ADDR: &str = ":61613";
/// Default maximum bytes for the header part of a frame.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 1 << 12;
/// Default maximum bytes for the body part of a frame.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1 << 20;
/// Default preferred heart-beat interval.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);
/// Default multiplier applied to the negotiated read interval before a
/// silent peer is declared dead.
pub const DEFAULT_HEARTBEAT_GRACE: f64 = 2.0;
/// Default number of frames that may wait in a connection's outbound queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;
/// Destinations starting with this prefix are queues; all others are topics.
pub const DEFAULT_QUEUE_PREFIX: &str = "/queue";

/// Broker configuration.
///
/// Every field is optional in spirit: a zero or empty value means "use the
/// default". Call [`BrokerConfig::normalized`] to resolve them.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    /// TCP address to listen on. A leading `:` binds every interface.
    pub addr: String,
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
    /// Preferred heart-beat interval, advertised in both directions.
    pub heartbeat: Duration,
    pub heartbeat_grace: f64,
    /// Outbound queue ceiling per connection; exceeding it closes the
    /// connection.
    pub outbound_capacity: usize,
    pub queue_prefix: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            heartbeat: DEFAULT_HEARTBEAT,
            heartbeat_grace: DEFAULT_HEARTBEAT_GRACE,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            queue_prefix: DEFAULT_QUEUE_PREFIX.to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    pub fn with_max_header_bytes(mut self, n: usize) -> Self {
        self.max_header_bytes = n;
        self
    }

    pub fn with_max_body_bytes(mut self, n: usize) -> Self {
        self.max_body_bytes = n;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_heartbeat_grace(mut self, grace: f64) -> Self {
        self.heartbeat_grace = grace;
        self
    }

    pub fn with_outbound_capacity(mut self, n: usize) -> Self {
        self.outbound_capacity = n;
        self
    }

    pub fn with_queue_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.queue_prefix = prefix.into();
        self
    }

    /// Replace zero/empty values with their defaults.
    pub fn normalized(mut self) -> Self {
        if self.addr.trim().is_empty() {
            self.addr = DEFAULT_ADDR.to_string();
        }
        if self.max_header_bytes == 0 {
            self.max_header_bytes = DEFAULT_MAX_HEADER_BYTES;
        }
        if self.max_body_bytes == 0 {
            self.max_body_bytes = DEFAULT_MAX_BODY_BYTES;
        }
        if self.heartbeat.is_zero() {
            self.heartbeat = DEFAULT_HEARTBEAT;
        }
        if !(self.heartbeat_grace.is_finite() && self.heartbeat_grace >= 1.0) {
            self.heartbeat_grace = DEFAULT_HEARTBEAT_GRACE;
        }
        if self.outbound_capacity == 0 {
            self.outbound_capacity = DEFAULT_OUTBOUND_CAPACITY;
        }
        if self.queue_prefix.is_empty() {
            self.queue_prefix = DEFAULT_QUEUE_PREFIX.to_string();
        }
        self
    }

    /// The address in a form `TcpListener::bind` accepts.
    pub fn bind_addr(&self) -> String {
        if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        }
    }
}
