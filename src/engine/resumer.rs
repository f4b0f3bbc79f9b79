//! Delay resumption.
//!
//! WAITING executions are woken from durable `scheduled_wakeups` rows that
//! are written in the same transaction as the suspension. A background task
//! polls for due rows and hands each one to [`Scheduler::resume`].
//!
//! Delivery is at-least-once: a row is deleted only after its resume call
//! returns, so a crash in between redelivers it and the resume is a no-op.
//! An execution left RUNNING by a crash or a failed walk is stepped again
//! at startup, or when its wake-up is redelivered after a failed attempt.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::engine::Scheduler;
use crate::error::{Error, Result};
use crate::metrics;
use crate::storage::{ExecutionState, ExecutionStatus, ScheduledWakeup};

/// Poll interval for checking due wake-ups (in milliseconds).
const POLL_INTERVAL_MS: u64 = 1000;

/// Background processor for due wake-ups.
pub struct WakeupProcessor {
    scheduler: Scheduler,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    poll_interval_ms: u64,
    batch_size: usize,
    max_concurrent: usize,
    retry_after: chrono::Duration,
}

impl WakeupProcessor {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            shutdown_tx: None,
            handle: None,
            poll_interval_ms: POLL_INTERVAL_MS,
            batch_size: 100,
            max_concurrent: 8,
            retry_after: chrono::Duration::seconds(60),
        }
    }

    /// Apply the `[engine]` section of the configuration.
    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.poll_interval_ms = config.poll_interval_ms.max(1);
        self.batch_size = config.wakeup_batch_size.max(1);
        self.max_concurrent = config.max_concurrent_wakeups.max(1);
        self.retry_after = chrono::Duration::seconds(config.wakeup_retry_seconds as i64);
        self
    }

    /// Set custom poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms.max(1);
        self
    }

    /// Start the background polling task.
    ///
    /// WAITING executions without a wake-up row are re-armed first, and
    /// executions stranded in RUNNING are stepped to their next stable state.
    pub async fn start(&mut self) -> Result<()> {
        let rearmed = rearm_orphaned(&self.scheduler).await?;
        if rearmed > 0 {
            warn!("Re-armed {} waiting execution(s) without a wake-up", rearmed);
        }
        let recovered = recover_running(&self.scheduler).await?;
        if recovered > 0 {
            warn!("Recovered {} execution(s) left running", recovered);
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        let worker = Worker {
            scheduler: self.scheduler.clone(),
            batch_size: self.batch_size,
            max_concurrent: self.max_concurrent,
            retry_after: self.retry_after,
        };
        let poll_interval = self.poll_interval_ms;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(poll_interval));

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Wake-up processor received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = worker.process_due(Utc::now()).await {
                            error!("Error processing due wake-ups: {}", e);
                        }
                    }
                }
            }
        });

        self.handle = Some(handle);
        info!(
            "Wake-up processor started with {}ms poll interval",
            self.poll_interval_ms
        );
        Ok(())
    }

    /// Stop the background polling task.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
        }

        info!("Wake-up processor stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Process every wake-up due at `now` once. Returns how many rows were handled.
    pub async fn process_due_wakeups(&self, now: DateTime<Utc>) -> Result<usize> {
        Worker {
            scheduler: self.scheduler.clone(),
            batch_size: self.batch_size,
            max_concurrent: self.max_concurrent,
            retry_after: self.retry_after,
        }
        .process_due(now)
        .await
    }
}

/// State moved into the polling task.
struct Worker {
    scheduler: Scheduler,
    batch_size: usize,
    max_concurrent: usize,
    retry_after: chrono::Duration,
}

impl Worker {
    async fn process_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self
            .scheduler
            .storage()
            .get_due_wakeups(now, self.batch_size)
            .await?;

        if due.is_empty() {
            return Ok(0);
        }
        debug!("Processing {} due wake-up(s)", due.len());

        let permits = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();
        let count = due.len();

        for wakeup in due {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
            let scheduler = self.scheduler.clone();
            let retry_after = self.retry_after;

            tasks.spawn(async move {
                deliver(&scheduler, wakeup, now, retry_after).await;
                drop(permit);
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Wake-up task panicked: {}", e);
            }
        }

        Ok(count)
    }
}

async fn deliver(
    scheduler: &Scheduler,
    wakeup: ScheduledWakeup,
    now: DateTime<Utc>,
    retry_after: chrono::Duration,
) {
    let storage = scheduler.storage();
    let lag = (now - wakeup.wake_at).to_std().unwrap_or_default();
    metrics::record_wakeup_lag(lag);

    match resume_or_recover(scheduler, &wakeup, now).await {
        Ok(state) => {
            metrics::record_wakeup("delivered");
            debug!(
                workflow_id = %wakeup.workflow_id,
                lead_id = %wakeup.lead_id,
                status = %state.status,
                "Wake-up delivered"
            );
            if let Err(e) = storage.delete_wakeup(&wakeup.id).await {
                warn!("Failed to delete delivered wake-up '{}': {}", wakeup.id, e);
            }
        }
        Err(Error::NotFound(_)) => {
            metrics::record_wakeup("orphaned");
            debug!(wakeup_id = %wakeup.id, "Dropping wake-up for missing execution");
            if let Err(e) = storage.delete_wakeup(&wakeup.id).await {
                warn!("Failed to delete orphaned wake-up '{}': {}", wakeup.id, e);
            }
        }
        Err(e) => {
            metrics::record_wakeup("retried");
            let retry_at = now.max(wakeup.wake_at) + retry_after;
            warn!(
                workflow_id = %wakeup.workflow_id,
                lead_id = %wakeup.lead_id,
                attempts = wakeup.attempts + 1,
                %retry_at,
                "Resume failed, rescheduling wake-up: {}",
                e
            );
            if let Err(e) = storage.reschedule_wakeup(&wakeup.id, retry_at).await {
                error!("Failed to reschedule wake-up '{}': {}", wakeup.id, e);
            }
        }
    }
}

/// Resume the execution a wake-up points at.
///
/// A row that already failed once may find its run still RUNNING, left
/// there by the failed walk; that run is stepped instead of ignored.
async fn resume_or_recover(
    scheduler: &Scheduler,
    wakeup: &ScheduledWakeup,
    now: DateTime<Utc>,
) -> Result<ExecutionState> {
    let state = scheduler
        .resume_at(&wakeup.workflow_id, &wakeup.lead_id, Some(&wakeup.run_id), now)
        .await?;

    if wakeup.attempts > 0
        && state.status == ExecutionStatus::Running
        && state.run_id == wakeup.run_id
    {
        debug!(wakeup_id = %wakeup.id, "Stepping execution left running by a failed resume");
        return scheduler
            .step_at(&wakeup.workflow_id, &wakeup.lead_id, now)
            .await;
    }
    Ok(state)
}

/// Step every RUNNING execution once. Failures are logged and skipped.
async fn recover_running(scheduler: &Scheduler) -> Result<usize> {
    let running = scheduler.storage().list_running_executions().await?;
    let mut recovered = 0;

    for state in running {
        match scheduler.step(&state.workflow_id, &state.lead_id).await {
            Ok(after) => {
                recovered += 1;
                debug!(
                    workflow_id = %state.workflow_id,
                    lead_id = %state.lead_id,
                    status = %after.status,
                    "Recovered running execution"
                );
            }
            Err(e) => warn!(
                workflow_id = %state.workflow_id,
                lead_id = %state.lead_id,
                "Failed to recover running execution: {}",
                e
            ),
        }
    }
    Ok(recovered)
}

/// Schedule wake-ups for WAITING executions whose row went missing.
async fn rearm_orphaned(scheduler: &Scheduler) -> Result<usize> {
    let storage = scheduler.storage();
    let orphaned = storage.list_waiting_without_wakeup().await?;
    let mut rearmed = 0;

    for state in orphaned {
        let wake_at = state.next_wake_at.unwrap_or_else(Utc::now);
        storage
            .schedule_wakeup(&state.workflow_id, &state.lead_id, &state.run_id, wake_at)
            .await?;
        rearmed += 1;
    }
    Ok(rearmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::email::testing::RecordingEmailSender;
    use crate::storage::SqliteStorage;
    use crate::workflow::parse_workflow;
    use chrono::Duration as ChronoDuration;
    use serde_json::{json, Map};

    const DRIP: &str = r#"
id: drip
nodes:
  - { id: T, type: TRIGGER }
  - { id: D, type: DELAY, data: { delayValue: 2, delayType: hours } }
  - { id: E, type: ACTION_EMAIL, data: { subject: s, body: b } }
edges:
  - { id: e1, source: T, target: D }
  - { id: e2, source: D, target: E }
"#;

    async fn setup(leads: &[&str]) -> (Scheduler, Arc<RecordingEmailSender>, DateTime<Utc>) {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let def = storage
            .save_workflow(&parse_workflow(DRIP).unwrap())
            .await
            .unwrap()
            .definition;
        let email = Arc::new(RecordingEmailSender::new());
        let scheduler = Scheduler::new(storage, email.clone());
        let now = Utc::now();
        for lead in leads {
            let vars: Map<_, _> = json!({"email": format!("{}@x.io", lead)})
                .as_object()
                .cloned()
                .unwrap();
            scheduler
                .start_run_at(&def, lead, vars, "manual", now)
                .await
                .unwrap();
        }
        (scheduler, email, now)
    }

    #[tokio::test]
    async fn test_nothing_due_before_wake_time() {
        let (scheduler, email, now) = setup(&["L1"]).await;
        let processor = WakeupProcessor::new(scheduler.clone());

        let handled = processor
            .process_due_wakeups(now + ChronoDuration::hours(1))
            .await
            .unwrap();

        assert_eq!(handled, 0);
        assert!(email.sent().is_empty());
        assert_eq!(scheduler.storage().count_pending_wakeups().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_due_wakeups_resume_and_are_deleted() {
        let (scheduler, email, now) = setup(&["L1", "L2", "L3"]).await;
        let processor = WakeupProcessor::new(scheduler.clone()).with_config(&EngineConfig {
            max_concurrent_wakeups: 2,
            ..EngineConfig::default()
        });

        let handled = processor
            .process_due_wakeups(now + ChronoDuration::hours(2))
            .await
            .unwrap();

        assert_eq!(handled, 3);
        assert_eq!(email.sent().len(), 3);
        assert_eq!(scheduler.storage().count_pending_wakeups().await.unwrap(), 0);
        for lead in ["L1", "L2", "L3"] {
            let state = scheduler
                .storage()
                .get_execution("drip", lead)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(state.status, ExecutionStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_redelivery_is_noop() {
        let (scheduler, email, now) = setup(&["L1"]).await;
        let state = scheduler.storage().get_execution("drip", "L1").await.unwrap().unwrap();
        // Simulate a crash between resume and delete: a duplicate row exists.
        scheduler
            .storage()
            .schedule_wakeup("drip", "L1", &state.run_id, now + ChronoDuration::hours(2))
            .await
            .unwrap();

        let processor = WakeupProcessor::new(scheduler.clone()).with_config(&EngineConfig {
            max_concurrent_wakeups: 1,
            ..EngineConfig::default()
        });
        let handled = processor
            .process_due_wakeups(now + ChronoDuration::hours(3))
            .await
            .unwrap();

        assert_eq!(handled, 2);
        assert_eq!(email.sent().len(), 1);
        assert_eq!(scheduler.storage().count_pending_wakeups().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_execution_wakeup_is_consumed() {
        let (scheduler, email, now) = setup(&["L1"]).await;
        scheduler.cancel("drip", "L1").await.unwrap();

        let processor = WakeupProcessor::new(scheduler.clone());
        processor
            .process_due_wakeups(now + ChronoDuration::hours(2))
            .await
            .unwrap();

        let state = scheduler.storage().get_execution("drip", "L1").await.unwrap().unwrap();
        assert_eq!(state.status, ExecutionStatus::Cancelled);
        assert!(email.sent().is_empty());
        assert_eq!(scheduler.storage().count_pending_wakeups().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_start_rearms_orphaned_waiting_executions() {
        let (scheduler, _, _) = setup(&["L1"]).await;
        let due = scheduler
            .storage()
            .get_due_wakeups(Utc::now() + ChronoDuration::days(1), 10)
            .await
            .unwrap();
        scheduler.storage().delete_wakeup(&due[0].id).await.unwrap();
        assert_eq!(scheduler.storage().count_pending_wakeups().await.unwrap(), 0);

        let mut processor = WakeupProcessor::new(scheduler.clone()).with_poll_interval(60_000);
        processor.start().await.unwrap();
        assert!(processor.is_running());
        assert_eq!(scheduler.storage().count_pending_wakeups().await.unwrap(), 1);

        processor.stop().await.unwrap();
        assert!(!processor.is_running());
    }

    /// Leave L1 the way a crash after the resume commit does: RUNNING at
    /// `E`, with the wake-up row still present.
    async fn strand_running(scheduler: &Scheduler) -> ExecutionState {
        let mut state = scheduler.storage().get_execution("drip", "L1").await.unwrap().unwrap();
        let expected = state.revision;
        state.status = ExecutionStatus::Running;
        state.current_node = "E".to_string();
        state.next_wake_at = None;
        scheduler
            .storage()
            .update_execution(&state, expected)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_recovers_execution_left_running() {
        let (scheduler, email, now) = setup(&["L1"]).await;
        strand_running(&scheduler).await;

        let mut processor = WakeupProcessor::new(scheduler.clone()).with_poll_interval(60_000);
        processor.start().await.unwrap();
        processor.stop().await.unwrap();

        let state = scheduler.storage().get_execution("drip", "L1").await.unwrap().unwrap();
        assert_eq!(state.status, ExecutionStatus::Completed);
        assert_eq!(email.sent().len(), 1);

        // The stale wake-up is consumed without a second send.
        processor
            .process_due_wakeups(now + ChronoDuration::hours(3))
            .await
            .unwrap();
        assert_eq!(email.sent().len(), 1);
        assert_eq!(scheduler.storage().count_pending_wakeups().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retried_wakeup_steps_execution_left_running() {
        let (scheduler, email, now) = setup(&["L1"]).await;
        let stranded = strand_running(&scheduler).await;
        let due = scheduler
            .storage()
            .get_due_wakeups(now + ChronoDuration::hours(3), 10)
            .await
            .unwrap();
        assert_eq!(due[0].run_id, stranded.run_id);
        scheduler
            .storage()
            .reschedule_wakeup(&due[0].id, now + ChronoDuration::hours(2))
            .await
            .unwrap();

        let processor = WakeupProcessor::new(scheduler.clone());
        let handled = processor
            .process_due_wakeups(now + ChronoDuration::hours(3))
            .await
            .unwrap();

        assert_eq!(handled, 1);
        let state = scheduler.storage().get_execution("drip", "L1").await.unwrap().unwrap();
        assert_eq!(state.status, ExecutionStatus::Completed);
        assert_eq!(email.sent().len(), 1);
        assert_eq!(scheduler.storage().count_pending_wakeups().await.unwrap(), 0);
    }
}
