//! Long-running driver: a periodic timer and an external trigger feed one
//! coalesced, edge-triggered signal; overlapping triggers collapse into a
//! single pass. A webhook receiver only ever nudges the trigger sooner; it
//! is not part of correctness.

use std::sync::Arc;
use std::time::Duration;

use calbridge_service::adapter::CalendarAdapter;
use calbridge_service::store::SyncStore;
use calbridge_service::sync::SyncEngine;
use tokio::sync::Notify;

/// Handle external components use to request an immediate pass
#[derive(Clone, Default)]
pub struct Trigger {
    notify: Arc<Notify>,
}

impl Trigger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a pass; repeated requests before the next pass coalesce
    pub fn fire(&self) {
        self.notify.notify_one();
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// ## Summary
/// Runs engine sessions until interrupted: one immediately, then whenever
/// the trigger fires or the poll interval elapses, whichever comes first.
/// Ctrl-C stops the loop; an in-flight pass finishes its current await
/// points and the next pass never starts.
///
/// ## Errors
/// Returns an error only for signal-handler installation failures; session
/// failures are logged and the loop continues.
pub async fn run_loop<G, C, S>(
    engine: &SyncEngine<G, C, S>,
    trigger: Trigger,
    poll_interval: Duration,
) -> anyhow::Result<()>
where
    G: CalendarAdapter,
    C: CalendarAdapter,
    S: SyncStore,
{
    tracing::info!(
        poll_interval_seconds = poll_interval.as_secs(),
        "Driver loop started"
    );
    loop {
        match engine.run_session().await {
            Ok(report) => {
                tracing::info!(
                    operations = report.total_operations(),
                    conflicts = report.conflicts.len(),
                    errors = report.errors.len(),
                    "Pass finished"
                );
            }
            Err(err) => {
                tracing::error!(error = %err, "Pass failed");
            }
        }

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("Interrupt received, stopping driver loop");
                return Ok(());
            }
            () = trigger.wait() => {
                tracing::debug!("Triggered pass");
            }
            () = tokio::time::sleep(poll_interval) => {
                tracing::debug!("Timer pass");
            }
        }
    }
}
