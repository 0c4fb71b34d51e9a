use crate::frame::{Command, Frame};

/// Headers owned by the broker; a sender cannot forward them to subscribers.
const RESERVED_HEADERS: &[&str] = &[
    "destination",
    "message-id",
    "subscription",
    "ack",
    "transaction",
    "receipt",
    "content-length",
    "redelivered",
];

/// A message accepted from a SEND frame.
///
/// Queue messages live in storage until acknowledged; topic messages exist
/// only for the duration of the fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub destination: String,
    /// User headers from the SEND frame, in their original order.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Set once the message has been returned to its queue after a NACK or
    /// after its holder went away.
    pub redelivered: bool,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        destination: impl Into<String>,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    ) -> Self {
        let headers = headers
            .into_iter()
            .filter(|(k, _)| !RESERVED_HEADERS.contains(&k.as_str()))
            .collect();
        Self {
            id: id.into(),
            destination: destination.into(),
            headers,
            body,
            redelivered: false,
        }
    }

    /// Build the MESSAGE frame delivered to `subscription`.
    ///
    /// `ack` is the token the client echoes in ACK/NACK; it is only present
    /// for subscriptions that acknowledge explicitly.
    pub fn to_frame(&self, subscription: &str, ack: Option<&str>) -> Frame {
        let mut frame = Frame::new(Command::Message)
            .header("destination", &self.destination)
            .header("message-id", &self.id)
            .header("subscription", subscription);
        if let Some(ack) = ack {
            frame = frame.header("ack", ack);
        }
        if self.redelivered {
            frame = frame.header("redelivered", "true");
        }
        frame.headers.extend(self.headers.iter().cloned());
        frame.set_body(self.body.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_headers_are_not_forwarded() {
        let msg = Message::new(
            "7",
            "/queue/a",
            vec![
                ("destination".into(), "/queue/a".into()),
                ("receipt".into(), "r1".into()),
                ("content-type".into(), "text/plain".into()),
                ("transaction".into(), "tx".into()),
            ],
            b"x".to_vec(),
        );
        assert_eq!(msg.headers, vec![("content-type".to_string(), "text/plain".to_string())]);

        let frame = msg.to_frame("sub-1", Some("7"));
        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.get_header("destination"), Some("/queue/a"));
        assert_eq!(frame.get_header("message-id"), Some("7"));
        assert_eq!(frame.get_header("subscription"), Some("sub-1"));
        assert_eq!(frame.get_header("ack"), Some("7"));
        assert_eq!(frame.get_header("content-type"), Some("text/plain"));
        assert_eq!(frame.get_header("receipt"), None);
        assert_eq!(frame.body, b"x");
    }
}
