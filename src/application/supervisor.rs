//! Keeps a fixed number of worker processes alive.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to wait for worker: {0}")]
    Wait(#[source] std::io::Error),
    #[error("cannot locate current executable: {0}")]
    CurrentExe(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// None when the worker was killed by a signal.
    pub code: Option<i32>,
}

/// Starts one worker and resolves when it exits. Dropping the future must
/// stop the worker.
#[async_trait]
pub trait WorkerLauncher: Send + Sync + 'static {
    async fn launch(&self, slot: usize) -> Result<WorkerExit, SupervisorError>;
}

/// Runs workers as child OS processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-execute this binary with `args`.
    pub fn current_exe(args: Vec<String>) -> Result<Self, SupervisorError> {
        let program = std::env::current_exe().map_err(SupervisorError::CurrentExe)?;
        Ok(Self::new(program, args))
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, slot: usize) -> Result<WorkerExit, SupervisorError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("WORKER_SLOT", slot.to_string())
            .kill_on_drop(true)
            .spawn()
            .map_err(SupervisorError::Spawn)?;
        info!(slot, pid = child.id(), "worker process started");

        let status = child.wait().await.map_err(SupervisorError::Wait)?;
        Ok(WorkerExit {
            code: status.code(),
        })
    }
}

pub struct Supervisor<L> {
    launcher: Arc<L>,
    slots: usize,
    restart_delay: Duration,
    restarts: Arc<AtomicUsize>,
}

impl<L: WorkerLauncher> Supervisor<L> {
    pub fn new(launcher: L, slots: usize, restart_delay: Duration) -> Self {
        Self {
            launcher: Arc::new(launcher),
            slots: slots.max(1),
            restart_delay,
            restarts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::Relaxed)
    }

    /// Run until `shutdown` turns true, then stop every worker.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!(slots = self.slots, "supervisor started");
        let mut set = JoinSet::new();
        for slot in 0..self.slots {
            set.spawn(keep_alive(
                slot,
                Arc::clone(&self.launcher),
                self.restart_delay,
                Arc::clone(&self.restarts),
                shutdown.clone(),
            ));
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker slot task ended abnormally");
            }
        }
        info!(restarts = self.restarts(), "supervisor stopped");
    }
}

async fn keep_alive<L: WorkerLauncher>(
    slot: usize,
    launcher: Arc<L>,
    restart_delay: Duration,
    restarts: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        let launcher_ref = Arc::clone(&launcher);
        // A separate task so a panicking launcher counts as a crash.
        let mut worker = tokio::spawn(async move { launcher_ref.launch(slot).await });

        tokio::select! {
            joined = &mut worker => match joined {
                Ok(Ok(exit)) => warn!(slot, code = ?exit.code, "worker exited"),
                Ok(Err(e)) => error!(slot, error = %e, "worker failed"),
                Err(e) => error!(slot, error = %e, "worker task crashed"),
            },
            _ = shutdown.changed() => {
                worker.abort();
                let _ = worker.await;
                return;
            }
        }

        restarts.fetch_add(1, Ordering::Relaxed);
        tokio::select! {
            _ = tokio::time::sleep(restart_delay) => {}
            _ = shutdown.changed() => return,
        }
        info!(slot, "restarting worker");
    }
}
