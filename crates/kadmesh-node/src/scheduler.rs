//! Owned periodic tasks.
//!
//! A [`Scheduler`] runs each registered task on its own tokio interval. A
//! task's next tick only starts once its previous run finished, so runs of
//! one task never overlap. All tasks stop on [`Scheduler::shutdown`] or when
//! the scheduler is dropped.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::{NodeError, Result};

pub struct Scheduler {
    runtime: Handle,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Scheduler {
    /// A scheduler spawning on the current tokio runtime.
    pub fn new() -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| NodeError::NoRuntime)?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            runtime,
            shutdown_tx,
            tasks: Vec::new(),
        })
    }

    /// Run `task` every `period`, the first time one period from now.
    pub fn every<F, Fut>(&mut self, name: &'static str, period: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => task().await,
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!(task = name, "scheduled task stopped");
        });
        debug!(task = name, ?period, "scheduled task started");
        self.tasks.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Stop every task and wait for them to finish their current run.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(());
        for (name, handle) in self.tasks.drain(..) {
            if let Err(err) = handle.await {
                warn!(task = name, error = %err, "scheduled task ended abnormally");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for (_, handle) in &self.tasks {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field(
                "tasks",
                &self.tasks.iter().map(|(name, _)| *name).collect::<Vec<_>>(),
            )
            .finish()
    }
}
