// src/services/auth_service.rs
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing;

use crate::config::AuthPolicy;
use crate::errors::{OkadaError, OkadaResult};
use crate::realtime::channel::RealtimeChannel;

/// Capability handed in by the host app's auth layer. Token storage and
/// expiry decoding stay outside the core; this is only "give me the current
/// token" and "refresh now".
#[async_trait]
pub trait AuthSession: Send + Sync {
    async fn current_token(&self) -> OkadaResult<String>;

    /// Forces a refresh and returns the new token.
    async fn refresh_now(&self) -> OkadaResult<String>;
}

/// Bearer holder for hosts that rotate tokens themselves: the app calls
/// `update` whenever its auth layer mints a new token, and `refresh_now`
/// just re-reads the slot.
pub struct SharedTokenSession {
    token: Mutex<String>,
}

impl SharedTokenSession {
    pub fn new(initial_token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(initial_token.into()),
        }
    }

    pub fn update(&self, token: impl Into<String>) {
        *self.token.lock().unwrap() = token.into();
    }
}

#[async_trait]
impl AuthSession for SharedTokenSession {
    async fn current_token(&self) -> OkadaResult<String> {
        let token = self.token.lock().unwrap().clone();
        if token.is_empty() {
            return Err(OkadaError::AuthToken("no token available".to_string()));
        }
        Ok(token)
    }

    async fn refresh_now(&self) -> OkadaResult<String> {
        self.current_token().await
    }
}

/// Keeps the realtime channel's token fresh so a reconnect never presents an
/// expired credential. The caller owns the handle and aborts it on shutdown.
pub fn spawn_refresh_loop(
    auth: Arc<dyn AuthSession>,
    channel: Arc<dyn RealtimeChannel>,
    policy: AuthPolicy,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = interval(policy.token_refresh_interval);
        // the first tick fires immediately; the token is already fresh then
        ticks.tick().await;
        loop {
            ticks.tick().await;
            match auth.refresh_now().await {
                Ok(token) => {
                    channel.set_token(&token);
                    tracing::debug!("auth token refreshed");
                }
                Err(e) => tracing::warn!("token refresh failed: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::channel::InMemoryChannel;
    use std::time::Duration;

    #[tokio::test]
    async fn empty_token_is_an_error() {
        let session = SharedTokenSession::new("");
        assert!(session.current_token().await.is_err());

        session.update("bearer-abc");
        assert_eq!(session.current_token().await.unwrap(), "bearer-abc");
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_loop_pushes_tokens_into_channel() {
        let session = Arc::new(SharedTokenSession::new("first"));
        let channel = Arc::new(InMemoryChannel::new());
        let policy = AuthPolicy {
            token_refresh_interval: Duration::from_secs(60),
        };

        let handle = spawn_refresh_loop(session.clone(), channel.clone(), policy);

        session.update("second");
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(channel.current_token(), "second");

        handle.abort();
    }
}
