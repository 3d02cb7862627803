use std::collections::HashMap;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::{Child, Command};

/// The command to run and the secret environment to layer over our own.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Program followed by its arguments. Must be non-empty.
    pub argv: Vec<String>,
    /// Environment overlay. Entries overwrite same-named inherited variables.
    pub env: HashMap<String, String>,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("no command given")]
    EmptyCommand,
    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("child terminated before its pid could be observed")]
    PidUnavailable,
}

/// Signal forwarding failed, usually because the child already exited.
#[derive(Debug, Error)]
#[error("failed to deliver {signal} to pid {pid}: {source}")]
pub struct DeliveryError {
    pub pid: i32,
    pub signal: Signal,
    pub source: Errno,
}

/// How the child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(i32),
    Signaled(i32),
}

impl ExitOutcome {
    /// The exit code the whole program should terminate with. Signal deaths
    /// map to the shell convention of 128 + signal number.
    pub fn code(&self) -> i32 {
        match self {
            ExitOutcome::Exited(code) => *code,
            ExitOutcome::Signaled(signo) => 128 + signo,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Exited(code) => write!(f, "exit code {}", code),
            ExitOutcome::Signaled(signo) => write!(f, "terminated by signal {}", signo),
        }
    }
}

/// Owns the one spawned child of a supervision run.
pub struct ChildHandle {
    child: Child,
    pid: Pid,
}

impl ChildHandle {
    /// Spawn the command with stdout/stderr inherited, so the child's output
    /// interleaves directly with ours. The environment starts from our own
    /// and every overlay entry overwrites any inherited value for that key.
    pub fn launch(spec: &ProcessSpec) -> Result<Self, StartError> {
        let (program, args) = spec.argv.split_first().ok_or(StartError::EmptyCommand)?;

        let mut command = Command::new(program);
        command.args(args).envs(&spec.env);

        let child = command.spawn().map_err(|source| StartError::Spawn {
            command: program.clone(),
            source,
        })?;

        let pid = match child.id() {
            Some(raw) => Pid::from_raw(raw as i32),
            None => return Err(StartError::PidUnavailable),
        };

        Ok(Self { child, pid })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Block until the child terminates. This is the single authoritative
    /// signal that supervision is complete.
    pub async fn wait(&mut self) -> std::io::Result<ExitOutcome> {
        let status = self.child.wait().await?;
        Ok(outcome_from_status(status))
    }

    /// Force-kill and reap the child. Only used when supervision has to bail
    /// out after the child was already started.
    pub async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}

/// Send `signal` to the process. ESRCH here means the child already exited,
/// an expected race with the relay that callers report and move past.
pub fn deliver_signal(pid: Pid, signal: Signal) -> Result<(), DeliveryError> {
    kill(pid, signal).map_err(|source| DeliveryError {
        pid: pid.as_raw(),
        signal,
        source,
    })
}

fn outcome_from_status(status: ExitStatus) -> ExitOutcome {
    match status.signal() {
        Some(signo) => ExitOutcome::Signaled(signo),
        None => ExitOutcome::Exited(status.code().unwrap_or_default()),
    }
}
