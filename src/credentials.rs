use std::fmt;

use tokio::sync::watch;

/// Access token shared between the login flow and the HTTP client.
///
/// Cloning yields a handle to the same store. Subscribers are notified on
/// every change, including [`TokenStore::clear`].
#[derive(Clone)]
pub struct TokenStore {
    tx: watch::Sender<Option<String>>,
}

impl TokenStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        let store = Self::new();
        store.set_token(token);
        store
    }

    pub fn get_token(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Store `token`; blank tokens clear the store.
    pub fn set_token(&self, token: impl Into<String>) {
        let token = token.into();
        let value = (!token.trim().is_empty()).then_some(token);
        self.tx.send_replace(value);
    }

    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenStore")
            .field("has_token", &self.tx.borrow().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_token_clears() {
        let store = TokenStore::with_token("abc");
        assert_eq!(store.get_token().as_deref(), Some("abc"));
        store.set_token("  ");
        assert_eq!(store.get_token(), None);
    }

    #[test]
    fn debug_does_not_leak_the_token() {
        let store = TokenStore::with_token("secret-token");
        assert!(!format!("{store:?}").contains("secret"));
    }

    #[tokio::test]
    async fn subscribers_see_changes() {
        let store = TokenStore::new();
        let mut rx = store.subscribe();
        let clone = store.clone();
        clone.set_token("t1");
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().as_deref(), Some("t1"));
        store.clear();
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_none());
    }
}
