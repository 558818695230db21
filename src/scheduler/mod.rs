//! Periodic background jobs on a tokio runtime.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, Span};

use crate::error::{Error, Result};

/// Handed to each run of a task.
pub struct Context {
    pub task_name: &'static str,
    /// Starts at 1 and grows by one per run.
    pub run_id: u64,
    /// Fires when the scheduler stops; long runs may poll it to bail out.
    pub shutdown: broadcast::Receiver<()>,
}

#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    fn name(&self) -> &'static str;

    /// Time between runs. A run that overruns pushes the schedule back.
    fn interval(&self) -> Duration;

    /// A failed run is logged; the task keeps its schedule.
    async fn execute(&self, ctx: Context) -> Result<()>;
}

/// Owns the loops of registered tasks. Dropping the scheduler stops them.
pub struct Scheduler {
    runtime: Handle,
    loops: Mutex<Vec<JoinHandle<()>>>,
    stop_tx: broadcast::Sender<()>,
    span: Span,
}

impl Scheduler {
    pub fn new(runtime: Handle, span: Span) -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            runtime,
            loops: Mutex::new(Vec::new()),
            stop_tx,
            span,
        }
    }

    /// Runs `task` every `task.interval()`, first after one interval.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let mut stop_rx = self.stop_tx.subscribe();
        let span = self.span.clone();

        let handle = self.runtime.spawn(async move {
            let period = task.interval();
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            for run_id in 1.. {
                tokio::select! {
                    _ = ticks.tick() => {}
                    _ = stop_rx.recv() => break,
                }
                let ctx = Context {
                    task_name: task.name(),
                    run_id,
                    shutdown: stop_rx.resubscribe(),
                };
                if let Err(e) = task.execute(ctx).await {
                    error!(parent: &span, task = task.name(), run_id, error = %e, "Background task failed");
                }
            }
            debug!(parent: &span, task = task.name(), "Background task stopped");
        });

        self.loops.lock().push(handle);
        self
    }

    pub fn task_count(&self) -> usize {
        self.loops.lock().len()
    }

    /// Asks every loop to exit after its current run. Does not wait.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }

    /// Stops every loop and waits for them to exit.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop();
        let loops = std::mem::take(&mut *self.loops.lock());
        for handle in loops {
            handle
                .await
                .map_err(|e| Error::Task(format!("scheduler loop: {}", e)))?;
        }
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
