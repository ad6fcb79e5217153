//! Periodic Tasks
//!
//! The server's timer: the processor sweep, and any hook collaborators add
//! (data-node idle checks, heartbeats). Each task receives its context as an
//! explicit argument and runs on the timer runtime's blocking pool, so a
//! slow sweep never delays the next tick of another task.
//!
//! ```text
//! Timer ─┬─ "processor-check"  every 1s  ──> fn(&Vec<Arc<Processor>>)
//!        └─ "heartbeat"        every 10s ──> fn(&DataNodes)
//! ```
//!
//! A run that outlasts its period delays the next tick instead of
//! overlapping it.

use crate::net::connection::duration_millis;
use crate::net::{lock, panic_message};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Handle of one scheduled task. Dropping it stops the task.
#[derive(Debug)]
pub struct ScheduledTask {
    name: String,
    period: Duration,
    shutdown_tx: watch::Sender<bool>,
}

impl ScheduledTask {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs tasks at fixed periods on a dedicated runtime.
pub struct Timer {
    name: String,
    runtime: Option<Runtime>,
    tasks: Mutex<Vec<ScheduledTask>>,
}

impl Timer {
    pub fn new(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(4)
            .thread_name(name.clone())
            .enable_all()
            .build()?;
        Ok(Self {
            name,
            runtime: Some(runtime),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names of the scheduled tasks.
    pub fn tasks(&self) -> Vec<String> {
        lock(&self.tasks).iter().map(|t| t.name.clone()).collect()
    }

    /// Calls `task(&ctx)` every `period`, first after one period.
    pub fn schedule<C>(&self, name: impl Into<String>, period: Duration, ctx: Arc<C>, task: fn(&C))
    where
        C: Send + Sync + 'static,
    {
        let name = name.into();
        let period = period.max(Duration::from_millis(1));
        let runtime = match &self.runtime {
            Some(runtime) => runtime,
            None => return,
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        runtime.spawn(task_loop(name.clone(), period, ctx, task, shutdown_rx));
        info!(timer = %self.name, task = %name, period_ms = duration_millis(period), "Task scheduled");

        lock(&self.tasks).push(ScheduledTask {
            name,
            period,
            shutdown_tx,
        });
    }

    /// Stops every task called `name`. Returns whether any was found.
    pub fn cancel(&self, name: &str) -> bool {
        let mut tasks = lock(&self.tasks);
        let before = tasks.len();
        tasks.retain(|t| t.name != name);
        before != tasks.len()
    }

    /// Stops all tasks.
    pub fn stop(&self) {
        lock(&self.tasks).clear();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn task_loop<C>(
    name: String,
    period: Duration,
    ctx: Arc<C>,
    task: fn(&C),
    mut shutdown_rx: watch::Receiver<bool>,
) where
    C: Send + Sync + 'static,
{
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!(task = %name, "Task stopped");
                    return;
                }
            }
        }

        let ctx = Arc::clone(&ctx);
        if let Err(e) = tokio::task::spawn_blocking(move || task(&ctx)).await {
            if e.is_panic() {
                let payload = e.into_panic();
                warn!(task = %name, panic = panic_message(payload.as_ref()), "Scheduled task panicked");
            } else {
                warn!(task = %name, error = %e, "Scheduled task failed");
            }
        }
    }
}
