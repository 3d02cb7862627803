use futures::future::select_all;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::supervise::child::deliver_signal;

/// The fixed set of signals forwarded to the child. SIGKILL is listed for
/// completeness but the kernel refuses to trap it, so its registration is
/// skipped at runtime.
pub const RELAYED_SIGNALS: [Signal; 4] = [
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGKILL,
    Signal::SIGQUIT,
];

/// Forwards incoming OS signals to the child process until stopped.
///
/// Exactly one relay exists per supervision run; the process-wide signal
/// subscription lives behind it.
pub struct SignalRelay {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SignalRelay {
    /// Subscribe to the relayed signal set and start forwarding to `pid`.
    /// Returns an error only if no signal in the set could be registered.
    pub fn start(pid: Pid) -> std::io::Result<Self> {
        let mut streams = Vec::new();
        for sig in RELAYED_SIGNALS {
            match signal(SignalKind::from_raw(sig as i32)) {
                Ok(stream) => streams.push((sig, stream)),
                Err(err) => {
                    tracing::debug!(signal = %sig, error = %err, "cannot trap signal, skipping");
                }
            }
        }
        if streams.is_empty() {
            return Err(std::io::Error::other("no relayed signal could be registered"));
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = stop_rx.changed() => break,
                    received = next_signal(&mut streams) => received,
                };
                let Some(sig) = received else { break };

                tracing::info!(signal = %sig, "forwarding signal to child");
                if let Err(err) = deliver_signal(pid, sig) {
                    tracing::warn!(error = %err, "signal delivery failed");
                }
            }
        });

        Ok(Self { stop_tx, task })
    }

    /// Stop listening. After this returns, no further delivery attempt is
    /// made, even if the OS hands us more signals.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}

/// Wait for the next signal on any of the registered streams, preserving
/// arrival order across them.
async fn next_signal(streams: &mut [(Signal, tokio::signal::unix::Signal)]) -> Option<Signal> {
    let receivers = streams
        .iter_mut()
        .map(|(sig, stream)| {
            let sig = *sig;
            Box::pin(async move { stream.recv().await.map(|()| sig) })
        })
        .collect::<Vec<_>>();

    let (received, _, _) = select_all(receivers).await;
    received
}
