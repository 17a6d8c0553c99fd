use tokio::sync::watch;

use crate::models::account::AuthTokens;

/// In-memory holder for the courier's bearer tokens.
///
/// Cloning shares the same slot; subscribers see every login, refresh and
/// logout as a change.
#[derive(Debug, Clone)]
pub struct TokenStore {
    tx: watch::Sender<Option<AuthTokens>>,
}

impl TokenStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn with_tokens(tokens: AuthTokens) -> Self {
        let store = Self::new();
        store.set(tokens);
        store
    }

    pub fn access_token(&self) -> Option<String> {
        self.tx
            .borrow()
            .as_ref()
            .map(|tokens| tokens.access_token.clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.tx
            .borrow()
            .as_ref()
            .map(|tokens| tokens.refresh_token.clone())
            .filter(|token| !token.is_empty())
    }

    pub fn set(&self, tokens: AuthTokens) {
        self.tx.send_replace(Some(tokens));
    }

    pub fn clear(&self) {
        self.tx.send_if_modified(|current| current.take().is_some());
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<AuthTokens>> {
        self.tx.subscribe()
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}
