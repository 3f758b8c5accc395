//! Background jobs. The presence report runs only on the worker holding
//! the scheduler flag.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::presence::{CachedWhitelist, OnlineStatus, PresenceService, VisibilityWhitelist};

/// Interval between presence reports.
const REPORT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Interval after which cached visibility is recomputed from the database.
const WHITELIST_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Counts of the cluster-wide online set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PresenceReport {
    pub online: usize,
    pub busy: usize,
    pub absent: usize,
    /// Connected but showing as offline
    pub hidden: usize,
    pub local_connections: usize,
}

/// Gather the cluster-wide online set once and log it.
pub async fn run_presence_report(presence: &PresenceService) -> PresenceReport {
    let mut report = PresenceReport {
        local_connections: presence.local_connection_count(),
        ..PresenceReport::default()
    };

    for status in presence.gather_online().await.into_values() {
        match status {
            OnlineStatus::Available => report.online += 1,
            OnlineStatus::Busy => report.busy += 1,
            OnlineStatus::Absent => report.absent += 1,
            OnlineStatus::Offline => report.hidden += 1,
        }
    }

    info!(
        worker_id = presence.worker_id(),
        online = report.online,
        busy = report.busy,
        absent = report.absent,
        hidden = report.hidden,
        local_connections = report.local_connections,
        "Presence report"
    );
    report
}

/// Spawn the scheduler loop. Returns a handle that can be used to abort it.
pub fn spawn_scheduler(presence: PresenceService) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REPORT_INTERVAL);

        loop {
            interval.tick().await;
            run_presence_report(&presence).await;
        }
    })
}

/// Drop the visibility cache periodically so membership changes made
/// outside this process are picked up. Runs on every worker.
pub fn spawn_whitelist_refresh<W>(whitelist: Arc<CachedWhitelist<W>>) -> tokio::task::JoinHandle<()>
where
    W: VisibilityWhitelist + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(WHITELIST_REFRESH_INTERVAL);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            whitelist.invalidate_all();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{InProcessHub, PresenceSettings, StaticWhitelist};
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_report_counts_the_whole_cluster() {
        let hub = InProcessHub::new();
        let start = |id| {
            crate::presence::PresenceService::start(
                Box::new(hub.join(id)),
                Arc::new(StaticWhitelist::default()),
                None,
                PresenceSettings::default(),
            )
        };
        let one = start(1);
        let two = start(2);

        let (tx, _rx1) = mpsc::channel(8);
        one.connect(10, OnlineStatus::Available, tx).await;
        let (tx, _rx2) = mpsc::channel(8);
        two.connect(20, OnlineStatus::Busy, tx).await;
        let (tx, _rx3) = mpsc::channel(8);
        two.connect(30, OnlineStatus::Offline, tx).await;

        let report = run_presence_report(&one).await;
        assert_eq!(
            report,
            PresenceReport {
                online: 1,
                busy: 1,
                absent: 0,
                hidden: 1,
                local_connections: 1,
            }
        );
    }
}
