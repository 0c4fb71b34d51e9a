use std::time::Duration;

use clap::Parser;
use stomp_broker::BrokerConfig;
use stomp_broker::config::{DEFAULT_ADDR, DEFAULT_MAX_BODY_BYTES, DEFAULT_MAX_HEADER_BYTES};

#[derive(Parser)]
#[command(name = "stompd")]
#[command(version)]
#[command(about = "STOMP message broker")]
pub struct Cli {
    /// Listen address (host:port, or :port for all interfaces)
    #[arg(short, long, default_value = DEFAULT_ADDR)]
    pub address: String,

    /// Largest accepted command + header section, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_HEADER_BYTES)]
    pub max_header_bytes: usize,

    /// Largest accepted frame body, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: usize,

    /// Preferred heart-beat interval in ms
    #[arg(long, default_value_t = 60_000)]
    pub heartbeat_ms: u64,

    /// Require this login on CONNECT (needs --passcode)
    #[arg(short, long, requires = "passcode")]
    pub login: Option<String>,

    /// Passcode for --login
    #[arg(short, long, requires = "login")]
    pub passcode: Option<String>,

    /// Log filter, e.g. "info" or "stomp_broker=debug" (overrides RUST_LOG)
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Cli {
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig::new()
            .with_addr(self.address.clone())
            .with_max_header_bytes(self.max_header_bytes)
            .with_max_body_bytes(self.max_body_bytes)
            .with_heartbeat(Duration::from_millis(self.heartbeat_ms))
    }
}
