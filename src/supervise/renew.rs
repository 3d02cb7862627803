use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;

/// The renewal operation the loop drives: one network round-trip that
/// extends the token lease and reports the new duration in seconds.
#[async_trait]
pub trait RenewLease: Send + Sync {
    async fn renew(&self) -> anyhow::Result<u64>;
}

/// Current knowledge of the credential's validity window, replaced wholesale
/// on every successful renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseState {
    duration: Duration,
}

impl LeaseState {
    pub fn from_secs(secs: u64) -> Self {
        Self {
            duration: Duration::from_secs(secs),
        }
    }

    pub fn as_secs(&self) -> u64 {
        self.duration.as_secs()
    }

    /// Renewing at half the lease lifetime leaves a half-lease margin before
    /// expiry if an attempt is delayed.
    pub fn renewal_interval(&self) -> Duration {
        self.duration / 2
    }
}

/// Background loop that keeps the token lease alive for long-running
/// children: renew immediately on start, then every half lease duration,
/// halting permanently on the first failure.
pub struct RenewalLoop {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RenewalLoop {
    pub fn spawn(renewer: Arc<dyn RenewLease>, initial: LeaseState) -> Self {
        tracing::debug!(lease_secs = initial.as_secs(), "starting lease renewal");

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut wait = Duration::ZERO;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = time::sleep(wait) => {}
                }

                let renewed = tokio::select! {
                    _ = stop_rx.changed() => break,
                    renewed = renewer.renew() => renewed,
                };
                match renewed {
                    Ok(secs) => {
                        let lease = LeaseState::from_secs(secs);
                        wait = lease.renewal_interval();
                        tracing::debug!(
                            lease_secs = lease.as_secs(),
                            next_attempt_secs = wait.as_secs(),
                            "token renewed"
                        );
                    }
                    Err(err) => {
                        tracing::warn!(
                            error = %err,
                            "token renewal failed, renewal disabled for the rest of the run"
                        );
                        break;
                    }
                }
            }
        });

        Self { stop_tx, task }
    }

    /// Cancel the loop and wait for it to finish, so no renewal network
    /// activity outlives the supervised child.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}
