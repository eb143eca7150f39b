// Shared HTTP client plumbing
// User agent, cancellable sleeps, retry pacing

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::errors::{Error, Result};

/// User agent sent by every outbound client.
pub fn user_agent() -> String {
    concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string()
}

/// Build the shared reqwest client.
pub fn client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(user_agent())
        .build()?)
}

/// Sleep that loses a race against cancellation.
pub async fn sleep(cancel: &CancellationToken, dur: Duration) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(dur) => Ok(()),
    }
}

/// Exponential back-off schedule: `initial` doubling up to `cap`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    next: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Backoff { next: initial, cap }
    }

    /// Wait out the current delay, then double it.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<()> {
        sleep(cancel, self.next).await?;
        self.next = (self.next * 2).min(self.cap);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn backoff_doubles_to_cap() {
        let b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let mut delays = Vec::new();
        let mut probe = b;
        for _ in 0..8 {
            delays.push(probe.next);
            probe.next = (probe.next * 2).min(probe.cap);
        }
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[5], Duration::from_secs(32));
        assert_eq!(delays[6], Duration::from_secs(60));
        assert_eq!(delays[7], Duration::from_secs(60));
    }

    #[tokio::test]
    async fn sleep_is_cancellation_aware() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = sleep(&cancel, Duration::from_secs(3600)).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
