use log::debug;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use crate::error::ClientError;

/// Collapses concurrent credential refreshes into one.
///
/// Every refresh attempt, successful or not, advances the epoch. A caller
/// passes the epoch its failed request was authorized under; if the epoch
/// has moved on by the time it gets the lock, someone else already
/// refreshed and the caller receives that outcome instead of refreshing
/// again.
#[derive(Debug, Default)]
pub struct RefreshGate {
    epoch: AtomicU64,
    last_outcome: Mutex<Option<Result<(), String>>>,
}

impl RefreshGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub async fn run<F, Fut>(&self, stale_epoch: u64, refresh: F) -> Result<(), ClientError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), ClientError>>,
    {
        let mut last_outcome = self.last_outcome.lock().await;

        if self.epoch() != stale_epoch {
            debug!("Credentials were already refreshed by a concurrent call");
            return match last_outcome.as_ref() {
                Some(Err(msg)) => Err(ClientError::Auth(msg.clone())),
                _ => Ok(()),
            };
        }

        let outcome = refresh().await.map_err(|e| match e {
            ClientError::Auth(msg) => msg,
            other => other.to_string(),
        });
        *last_outcome = Some(outcome.clone());
        self.epoch.fetch_add(1, Ordering::AcqRel);

        outcome.map_err(ClientError::Auth)
    }
}
