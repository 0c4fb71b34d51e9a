use std::fmt;
use std::str::FromStr;

use crate::connection::{ConnectionHandle, ConnectionId};

/// Subscription acknowledgement modes as defined by STOMP 1.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    #[default]
    Auto,
    Client,
    ClientIndividual,
}

impl AckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }

    /// Whether deliveries under this mode wait for an ACK.
    pub fn requires_ack(&self) -> bool {
        !matches!(self, AckMode::Auto)
    }
}

impl FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(AckMode::Auto),
            "client" => Ok(AckMode::Client),
            "client-individual" => Ok(AckMode::ClientIndividual),
            other => Err(format!("invalid ack mode '{}'", other)),
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered subscription.
///
/// The id is chosen by the client and is only unique within its connection,
/// so the router identifies a subscription by `(connection id, id)`.
#[derive(Clone)]
pub struct Subscription {
    pub id: String,
    pub destination: String,
    pub ack: AckMode,
    pub conn: ConnectionHandle,
}

impl Subscription {
    pub fn new(
        id: impl Into<String>,
        destination: impl Into<String>,
        ack: AckMode,
        conn: ConnectionHandle,
    ) -> Self {
        Self {
            id: id.into(),
            destination: destination.into(),
            ack,
            conn,
        }
    }

    /// Broker-wide identity of the subscription.
    pub fn key(&self) -> (ConnectionId, &str) {
        (self.conn.id(), self.id.as_str())
    }

    pub(crate) fn is(&self, conn: ConnectionId, id: &str) -> bool {
        self.key() == (conn, id)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("ack", &self.ack)
            .field("conn", &self.conn.id())
            .finish()
    }
}
