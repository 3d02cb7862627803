//! Process supervision: launch the child with its secret environment, relay
//! OS signals to it, keep the token lease renewed in the background, and
//! report how the child ended.

pub mod child;
pub mod relay;
pub mod renew;

use std::sync::Arc;

use thiserror::Error;

use crate::supervise::child::{ChildHandle, ExitOutcome, ProcessSpec, StartError};
use crate::supervise::relay::SignalRelay;
use crate::supervise::renew::{LeaseState, RenewLease, RenewalLoop};

#[derive(Debug, Error)]
pub enum SuperviseError {
    #[error(transparent)]
    Start(#[from] StartError),
    #[error("failed to subscribe to signals: {0}")]
    Relay(#[source] std::io::Error),
    #[error("failed waiting for child: {0}")]
    Wait(#[source] std::io::Error),
}

/// Run the whole supervised lifecycle and return how the child ended.
///
/// Nothing else is started if the launch itself fails. Once the child exits,
/// the relay is stopped before anything can try to signal a reaped process,
/// and the renewal loop is cancelled so no renewal traffic outlives the run.
pub async fn run(
    spec: ProcessSpec,
    renewer: Arc<dyn RenewLease>,
    initial_lease: LeaseState,
) -> Result<ExitOutcome, SuperviseError> {
    let mut child = ChildHandle::launch(&spec)?;
    tracing::info!(pid = child.pid().as_raw(), command = %spec.argv[0], "child started");

    let relay = match SignalRelay::start(child.pid()) {
        Ok(relay) => relay,
        Err(err) => {
            // The child is already running; reap it before bailing out.
            let _ = child.kill().await;
            return Err(SuperviseError::Relay(err));
        }
    };
    let renewal = RenewalLoop::spawn(renewer, initial_lease);

    let waited = child.wait().await;

    relay.stop().await;
    renewal.stop().await;

    let outcome = waited.map_err(SuperviseError::Wait)?;
    tracing::info!(%outcome, "child exited");
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::signal::unix::{signal, SignalKind};

    struct CountingRenewer {
        calls: AtomicUsize,
    }

    impl CountingRenewer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RenewLease for CountingRenewer {
        async fn renew(&self) -> anyhow::Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(3600)
        }
    }

    fn spec(argv: &[&str]) -> ProcessSpec {
        ProcessSpec {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn start_failure_aborts_before_any_renewal() {
        let renewer = CountingRenewer::new();
        let result = run(
            spec(&["/nonexistent/definitely-not-a-binary"]),
            renewer.clone(),
            LeaseState::from_secs(3600),
        )
        .await;

        assert!(matches!(result, Err(SuperviseError::Start(_))));
        assert_eq!(renewer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn clean_child_exit_is_propagated() {
        let renewer = CountingRenewer::new();
        let outcome = run(
            spec(&["sh", "-c", "exit 3"]),
            renewer,
            LeaseState::from_secs(3600),
        )
        .await
        .unwrap();

        assert_eq!(outcome, ExitOutcome::Exited(3));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn external_interrupt_reaches_the_child() {
        // Replace the default SIGINT disposition up front so a racing signal
        // can never kill the test process itself.
        let _guard = signal(SignalKind::interrupt()).unwrap();

        let renewer = CountingRenewer::new();
        let supervision = tokio::spawn(run(
            spec(&["sleep", "30"]),
            renewer,
            LeaseState::from_secs(3600),
        ));

        // Keep raising SIGINT at ourselves until the relay has picked one up
        // and the child dies from it.
        let pid = Pid::this();
        let raiser = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let _ = kill(pid, Signal::SIGINT);
            }
        });

        let outcome = tokio::time::timeout(Duration::from_secs(20), supervision)
            .await
            .expect("child should die from the relayed interrupt")
            .unwrap()
            .unwrap();
        raiser.abort();

        assert_eq!(outcome, ExitOutcome::Signaled(Signal::SIGINT as i32));
        assert_eq!(outcome.code(), 130);
    }
}
