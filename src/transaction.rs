use std::collections::HashMap;

use thiserror::Error;

/// Errors returned by [`TransactionManager`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("transaction '{0}' is already open")]
    DuplicateTransaction(String),
    #[error("transaction '{0}' not found")]
    TransactionNotFound(String),
}

/// A SEND as the router sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendAction {
    pub destination: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// A router operation that can be deferred inside a transaction.
///
/// Plain data: the session replays committed actions through the same
/// router entry points it uses for immediate ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send(SendAction),
    /// ACK by ack token
    Ack(String),
    /// NACK by ack token
    Nack(String),
}

/// Per-connection buffer of open transactions.
#[derive(Debug, Default)]
pub struct TransactionManager {
    open: HashMap<String, Vec<Action>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, id: &str) -> Result<(), TransactionError> {
        if self.open.contains_key(id) {
            return Err(TransactionError::DuplicateTransaction(id.to_string()));
        }
        self.open.insert(id.to_string(), Vec::new());
        Ok(())
    }

    /// Buffer `action` under transaction `id`.
    pub fn defer(&mut self, id: &str, action: Action) -> Result<(), TransactionError> {
        self.open
            .get_mut(id)
            .map(|actions| actions.push(action))
            .ok_or_else(|| TransactionError::TransactionNotFound(id.to_string()))
    }

    /// Close transaction `id` and hand back its actions in submission order
    /// for the caller to apply.
    pub fn commit(&mut self, id: &str) -> Result<Vec<Action>, TransactionError> {
        self.open
            .remove(id)
            .ok_or_else(|| TransactionError::TransactionNotFound(id.to_string()))
    }

    /// Discard transaction `id` without applying anything.
    pub fn abort(&mut self, id: &str) -> Result<(), TransactionError> {
        self.open
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| TransactionError::TransactionNotFound(id.to_string()))
    }

    /// Drop every open transaction; returns how many were discarded.
    pub fn discard_all(&mut self) -> usize {
        let n = self.open.len();
        self.open.clear();
        n
    }

    pub fn is_open(&self, id: &str) -> bool {
        self.open.contains_key(id)
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send(body: &str) -> Action {
        Action::Send(SendAction {
            destination: "/queue/a".into(),
            headers: Vec::new(),
            body: body.as_bytes().to_vec(),
        })
    }

    #[test]
    fn commit_returns_actions_in_submission_order() {
        let mut tx = TransactionManager::new();
        tx.begin("t1").unwrap();
        tx.defer("t1", send("one")).unwrap();
        tx.defer("t1", Action::Ack("5".into())).unwrap();
        tx.defer("t1", send("two")).unwrap();

        let actions = tx.commit("t1").unwrap();
        assert_eq!(actions, vec![send("one"), Action::Ack("5".into()), send("two")]);
        assert!(!tx.is_open("t1"));
    }

    #[test]
    fn duplicate_begin_fails() {
        let mut tx = TransactionManager::new();
        tx.begin("t1").unwrap();
        assert_eq!(
            tx.begin("t1"),
            Err(TransactionError::DuplicateTransaction("t1".into()))
        );
    }

    #[test]
    fn unknown_transaction_fails_everywhere() {
        let mut tx = TransactionManager::new();
        let missing = Err(TransactionError::TransactionNotFound("nope".into()));
        assert_eq!(tx.defer("nope", send("x")), missing);
        assert_eq!(tx.abort("nope"), missing);
        assert_eq!(tx.commit("nope").map(|_| ()), missing);
    }

    #[test]
    fn abort_and_discard_drop_buffers() {
        let mut tx = TransactionManager::new();
        tx.begin("t1").unwrap();
        tx.begin("t2").unwrap();
        tx.defer("t1", send("x")).unwrap();
        tx.abort("t1").unwrap();
        assert!(tx.commit("t1").is_err());
        assert_eq!(tx.discard_all(), 1);
        assert_eq!(tx.open_count(), 0);
    }
}
