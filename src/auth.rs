use std::collections::HashMap;

use async_trait::async_trait;

/// Authenticates STOMP clients at CONNECT time.
///
/// Either credential may be absent, meaning the client did not send that
/// header. Invoked exactly once per connection.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, login: Option<&str>, passcode: Option<&str>) -> bool;
}

/// Accepts every client, anonymous ones included.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(&self, _login: Option<&str>, _passcode: Option<&str>) -> bool {
        true
    }
}

/// A fixed login → passcode table. Anonymous clients are rejected.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    users: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, login: impl Into<String>, passcode: impl Into<String>) -> Self {
        self.users.insert(login.into(), passcode.into());
        self
    }
}

#[async_trait]
impl Authenticator for StaticCredentials {
    async fn authenticate(&self, login: Option<&str>, passcode: Option<&str>) -> bool {
        match (login, passcode) {
            (Some(login), Some(passcode)) => self
                .users
                .get(login)
                .is_some_and(|expected| expected == passcode),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_credentials_match_exactly() {
        let auth = StaticCredentials::new().with_user("guest", "guest");
        assert!(auth.authenticate(Some("guest"), Some("guest")).await);
        assert!(!auth.authenticate(Some("guest"), Some("nope")).await);
        assert!(!auth.authenticate(Some("guest"), None).await);
        assert!(!auth.authenticate(None, None).await);
    }

    #[tokio::test]
    async fn allow_all_accepts_anonymous() {
        assert!(AllowAll.authenticate(None, None).await);
    }
}
