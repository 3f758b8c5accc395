//! Role of the current process, fixed at fork time.
//!
//! The coordinator passes the worker id and the scheduler flag through the
//! environment of each child. They are read once and never change.

use std::sync::OnceLock;

use crate::presence::WorkerId;

/// Environment variable carrying the worker id.
pub const WORKER_ID_ENV: &str = "SHAREGATE_WORKER_ID";

/// Environment variable set to `1` on the worker that runs scheduled jobs.
pub const SCHEDULER_ENV: &str = "SHAREGATE_SCHEDULER";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    /// Not forked by a coordinator: the single process does everything
    Standalone,
    /// Forked worker
    Worker { id: WorkerId, scheduler: bool },
}

impl WorkerRole {
    /// Parse the role from raw environment values.
    pub fn from_values(worker_id: Option<&str>, scheduler: Option<&str>) -> Self {
        match worker_id.and_then(|id| id.trim().parse().ok()) {
            Some(id) => WorkerRole::Worker {
                id,
                scheduler: scheduler.map(str::trim) == Some("1"),
            },
            None => WorkerRole::Standalone,
        }
    }

    fn from_env() -> Self {
        let worker_id = std::env::var(WORKER_ID_ENV).ok();
        let scheduler = std::env::var(SCHEDULER_ENV).ok();
        Self::from_values(worker_id.as_deref(), scheduler.as_deref())
    }

    /// Whether this process runs the background jobs.
    pub fn runs_scheduler(&self) -> bool {
        match self {
            WorkerRole::Standalone => true,
            WorkerRole::Worker { scheduler, .. } => *scheduler,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        match self {
            WorkerRole::Standalone => 0,
            WorkerRole::Worker { id, .. } => *id,
        }
    }

    pub fn is_worker(&self) -> bool {
        matches!(self, WorkerRole::Worker { .. })
    }
}

static ROLE: OnceLock<WorkerRole> = OnceLock::new();

/// The role of this process, read from the environment on first call.
pub fn current() -> WorkerRole {
    *ROLE.get_or_init(WorkerRole::from_env)
}
