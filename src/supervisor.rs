//! Coordinator process: forks the workers, keeps them alive and decides
//! which one runs the scheduled jobs.
//!
//! The last worker forked holds the scheduler flag. When it exits, its
//! replacement inherits the flag. Only the coordinator's exit handler
//! touches the [`ElectionCell`].

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::presence::WorkerId;
use crate::worker::{SCHEDULER_ENV, WORKER_ID_ENV};

/// Pause before forking a replacement for a worker that exited.
const RESTART_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub enum SupervisorError {
    /// A worker process could not be started
    Spawn(std::io::Error),
    /// Workers kept exiting and the restart budget is used up
    RestartsExhausted { limit: u32 },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Spawn(e) => write!(f, "Failed to start worker: {}", e),
            SupervisorError::RestartsExhausted { limit } => {
                write!(f, "Workers restarted {} times, giving up", limit)
            }
        }
    }
}

impl std::error::Error for SupervisorError {}

/// A running worker process.
pub trait WorkerProcess: Send + 'static {
    fn pid(&self) -> Option<u32>;

    /// Wait for the process to exit. Resolves to its exit code, if any.
    fn wait(&mut self) -> impl Future<Output = Option<i32>> + Send;

    /// Terminate the process and reap it.
    fn kill(&mut self) -> impl Future<Output = ()> + Send;
}

/// Starts worker processes.
pub trait WorkerLauncher: Send + Sync {
    type Worker: WorkerProcess;

    fn launch(&self, worker_id: WorkerId, scheduler: bool) -> std::io::Result<Self::Worker>;
}

/// Launches workers by re-executing the current binary.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl ProcessLauncher {
    /// `args` are passed to every worker unchanged; `env` carries what the
    /// coordinator removed from its own environment (secrets).
    pub fn current_exe(args: Vec<String>, env: Vec<(String, String)>) -> std::io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args,
            env,
        })
    }
}

impl WorkerLauncher for ProcessLauncher {
    type Worker = tokio::process::Child;

    fn launch(&self, worker_id: WorkerId, scheduler: bool) -> std::io::Result<Self::Worker> {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .env(WORKER_ID_ENV, worker_id.to_string())
            .kill_on_drop(true);
        if scheduler {
            command.env(SCHEDULER_ENV, "1");
        } else {
            command.env_remove(SCHEDULER_ENV);
        }
        command.spawn()
    }
}

impl WorkerProcess for tokio::process::Child {
    fn pid(&self) -> Option<u32> {
        self.id()
    }

    async fn wait(&mut self) -> Option<i32> {
        match tokio::process::Child::wait(self).await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(error = %e, "Failed to wait for worker");
                None
            }
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = tokio::process::Child::kill(self).await {
            warn!(error = %e, "Failed to kill worker");
        }
    }
}

/// Which live worker holds the scheduler flag.
#[derive(Debug, Default)]
pub struct ElectionCell {
    scheduler: Option<(WorkerId, Option<u32>)>,
}

impl ElectionCell {
    pub fn elect(&mut self, worker_id: WorkerId, pid: Option<u32>) {
        self.scheduler = Some((worker_id, pid));
    }

    /// Called when a worker exits. Returns true if it held the flag, which
    /// is then vacant until the next `elect`.
    pub fn release(&mut self, worker_id: WorkerId, pid: Option<u32>) -> bool {
        if self.scheduler == Some((worker_id, pid)) {
            self.scheduler = None;
            true
        } else {
            false
        }
    }

    pub fn holder(&self) -> Option<WorkerId> {
        self.scheduler.map(|(id, _)| id)
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub workers: usize,
    pub auto_restart: bool,
    pub max_restarts: u32,
}

enum Outcome {
    Exited(Option<i32>),
    Stopped,
}

struct WorkerExit {
    worker_id: WorkerId,
    pid: Option<u32>,
    outcome: Outcome,
}

pub struct Supervisor<L: WorkerLauncher> {
    launcher: L,
    config: SupervisorConfig,
    election: ElectionCell,
    restarts: u32,
}

impl<L: WorkerLauncher> Supervisor<L> {
    pub fn new(launcher: L, config: SupervisorConfig) -> Self {
        Self {
            launcher,
            config,
            election: ElectionCell::default(),
            restarts: 0,
        }
    }

    fn spawn(
        &mut self,
        running: &mut JoinSet<WorkerExit>,
        stop: &watch::Receiver<bool>,
        worker_id: WorkerId,
        scheduler: bool,
    ) -> Result<(), SupervisorError> {
        let mut worker = self
            .launcher
            .launch(worker_id, scheduler)
            .map_err(SupervisorError::Spawn)?;
        let pid = worker.pid();
        if scheduler {
            self.election.elect(worker_id, pid);
        }
        info!(worker_id, pid, scheduler, "Worker started");

        let mut stop = stop.clone();
        running.spawn(async move {
            let outcome = tokio::select! {
                code = worker.wait() => Outcome::Exited(code),
                _ = stop.changed() => {
                    worker.kill().await;
                    Outcome::Stopped
                }
            };
            WorkerExit {
                worker_id,
                pid,
                outcome,
            }
        });
        Ok(())
    }

    /// Fork the workers and supervise them until `shutdown` resolves.
    ///
    /// Returns an error when the initial workers cannot be started or the
    /// restart budget runs out; every worker is stopped before returning.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<(), SupervisorError>
    where
        F: Future<Output = ()>,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut running = JoinSet::new();

        let count = self.config.workers.max(1);
        for index in 0..count {
            let worker_id = index as WorkerId + 1;
            let scheduler = index == count - 1;
            if let Err(e) = self.spawn(&mut running, &stop_rx, worker_id, scheduler) {
                stop_all(&stop_tx, &mut running).await;
                return Err(e);
            }
        }

        tokio::pin!(shutdown);
        loop {
            let exit = tokio::select! {
                _ = &mut shutdown => {
                    info!("Stopping workers");
                    stop_all(&stop_tx, &mut running).await;
                    return Ok(());
                }
                joined = running.join_next() => match joined {
                    Some(Ok(exit)) => exit,
                    Some(Err(e)) => {
                        error!(error = %e, "Worker monitor task failed");
                        continue;
                    }
                    None => return Ok(()),
                },
            };

            let Outcome::Exited(code) = exit.outcome else {
                continue;
            };
            let held_flag = self.election.release(exit.worker_id, exit.pid);
            warn!(
                worker_id = exit.worker_id,
                pid = exit.pid,
                code,
                scheduler = held_flag,
                "Worker exited"
            );

            if !self.config.auto_restart {
                if held_flag {
                    error!("Scheduler worker exited and auto-restart is disabled");
                }
                if running.is_empty() {
                    return Ok(());
                }
                continue;
            }

            // A failed fork counts against the budget like an exit does.
            loop {
                if self.restarts >= self.config.max_restarts {
                    error!(limit = self.config.max_restarts, "Restart budget exhausted");
                    stop_all(&stop_tx, &mut running).await;
                    return Err(SupervisorError::RestartsExhausted {
                        limit: self.config.max_restarts,
                    });
                }
                self.restarts += 1;

                tokio::select! {
                    _ = &mut shutdown => {
                        info!("Stopping workers");
                        stop_all(&stop_tx, &mut running).await;
                        return Ok(());
                    }
                    _ = tokio::time::sleep(RESTART_DELAY) => {}
                }
                match self.spawn(&mut running, &stop_rx, exit.worker_id, held_flag) {
                    Ok(()) => break,
                    Err(e) => warn!(
                        worker_id = exit.worker_id,
                        restarts = self.restarts,
                        error = %e,
                        "Failed to restart worker"
                    ),
                }
            }
        }
    }
}

async fn stop_all(stop: &watch::Sender<bool>, running: &mut JoinSet<WorkerExit>) {
    let _ = stop.send(true);
    while running.join_next().await.is_some() {}
}
