//! Periodic background maintenance.
//!
//! Storage upkeep (part merging, old-part cleanup) runs on timers off the
//! query path. A task implements [`MaintenanceTask`]; the scheduler runs
//! each registered task in its own loop, sleeping the task's period
//! between the end of one run and the start of the next, so a slow run
//! never piles up behind its own timer. Stopping is cooperative: the stop
//! signal is observed at the next sleep boundary and `stop` waits for
//! in-flight runs to finish.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// One unit of periodic storage upkeep.
#[async_trait::async_trait]
pub trait MaintenanceTask: Send + Sync {
    /// Short name used in log lines.
    fn name(&self) -> &'static str;

    /// Pause between the end of one run and the start of the next.
    fn period(&self) -> std::time::Duration;

    async fn run(&self) -> Result<()>;
}

/// Runs registered maintenance tasks until stopped. A failing run is
/// logged and the task keeps its slot. Dropping the scheduler lets the
/// loops wind down on their own; [`Scheduler::stop`] additionally waits
/// for in-flight runs to finish.
pub struct Scheduler {
    stop_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self { stop_tx, workers: Mutex::new(Vec::new()) }
    }

    /// Starts the task's loop. The first run happens one period after
    /// registration, not immediately.
    pub fn register(&self, task: Arc<dyn MaintenanceTask>) {
        let mut stop_rx = self.stop_tx.subscribe();
        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(task.period()) => {}
                    _ = stop_rx.changed() => {
                        tracing::debug!(task = task.name(), "maintenance loop stopping");
                        return;
                    }
                }
                let started = Instant::now();
                match task.run().await {
                    Ok(()) => tracing::debug!(
                        task = task.name(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "maintenance run finished"
                    ),
                    Err(e) => tracing::warn!(task = task.name(), error = %e, "maintenance run failed"),
                }
            }
        });
        match self.workers.lock() {
            Ok(mut workers) => workers.push(worker),
            Err(e) => e.into_inner().push(worker),
        }
    }

    /// Signals every loop to stop and waits for them to wind down.
    pub async fn stop(&self) -> Result<()> {
        // A send error only means no loop is listening anymore.
        let _ = self.stop_tx.send(true);
        let workers: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        for worker in workers {
            worker
                .await
                .map_err(|e| Error::Logical(format!("maintenance worker did not stop cleanly: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Reports every run over a channel so tests can watch the cadence.
    struct TickReporter {
        period: Duration,
        ticks: mpsc::UnboundedSender<Instant>,
    }

    #[async_trait::async_trait]
    impl MaintenanceTask for TickReporter {
        fn name(&self) -> &'static str {
            "tick-reporter"
        }

        fn period(&self) -> Duration {
            self.period
        }

        async fn run(&self) -> Result<()> {
            let _ = self.ticks.send(Instant::now());
            Ok(())
        }
    }

    /// Always fails; the scheduler must keep running it anyway.
    struct AlwaysFailing {
        ticks: mpsc::UnboundedSender<Instant>,
    }

    #[async_trait::async_trait]
    impl MaintenanceTask for AlwaysFailing {
        fn name(&self) -> &'static str {
            "always-failing"
        }

        fn period(&self) -> Duration {
            Duration::from_millis(5)
        }

        async fn run(&self) -> Result<()> {
            let _ = self.ticks.send(Instant::now());
            Err(Error::IO("synthetic failure".into()))
        }
    }

    #[tokio::test]
    async fn test_task_runs_repeatedly_until_stopped() -> Result<()> {
        let scheduler = Scheduler::new();
        let (ticks_tx, mut ticks_rx) = mpsc::unbounded_channel();
        scheduler.register(Arc::new(TickReporter {
            period: Duration::from_millis(5),
            ticks: ticks_tx,
        }));

        // At least two runs arrive on their own.
        for _ in 0..2 {
            let tick = tokio::time::timeout(Duration::from_secs(1), ticks_rx.recv()).await;
            assert!(tick.is_ok(), "maintenance task never ran");
        }

        scheduler.stop().await?;

        // After stop the channel drains and closes: the loop is gone.
        while ticks_rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(ticks_rx.try_recv().is_err(), "task still running after stop");
        Ok(())
    }

    #[tokio::test]
    async fn test_failing_task_keeps_its_slot() -> Result<()> {
        let scheduler = Scheduler::new();
        let (ticks_tx, mut ticks_rx) = mpsc::unbounded_channel();
        scheduler.register(Arc::new(AlwaysFailing { ticks: ticks_tx }));

        // Failures are logged, not fatal: the task runs again.
        for _ in 0..2 {
            let tick = tokio::time::timeout(Duration::from_secs(1), ticks_rx.recv()).await;
            assert!(tick.is_ok(), "failing task was unregistered");
        }
        scheduler.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_without_tasks_is_clean() -> Result<()> {
        let scheduler = Scheduler::new();
        scheduler.stop().await?;
        Ok(())
    }
}
