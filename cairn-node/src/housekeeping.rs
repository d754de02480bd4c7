//! Background log checkpointing and storage compaction for one node.
//!
//! Work arrives either from the periodic tick or from the node itself after
//! a transaction finishes. Requests beyond the queue capacity are dropped;
//! the next tick picks up whatever they would have done.

use std::sync::Weak;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use cairn_core::config::HousekeepingConfig;

use crate::node::ShardNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HousekeepingTask {
    /// Checkpoint and rotate the log if it grew, compact if dirty enough.
    CheckLog,
    /// Compact regardless of the dirty ratio.
    Compact,
}

pub struct Housekeeper {
    tasks: mpsc::Sender<HousekeepingTask>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Housekeeper {
    pub(crate) fn spawn(node: Weak<ShardNode>, config: &HousekeepingConfig) -> Self {
        let (tasks, mut queue) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let period = config.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick fires immediately
            ticker.tick().await;

            loop {
                let task = tokio::select! {
                    _ = ticker.tick() => HousekeepingTask::CheckLog,
                    Some(task) = queue.recv() => task,
                    _ = shutdown_rx.changed() => {
                        info!("Shutting down housekeeping task");
                        break;
                    }
                };

                let Some(node) = node.upgrade() else {
                    break;
                };
                let force = task == HousekeepingTask::Compact;
                let outcome = tokio::task::spawn_blocking(move || node.run_housekeeping(force)).await;
                match outcome {
                    Ok(Ok(Some(report))) => debug!(
                        "Compaction kept {} blocks, dropped {}",
                        report.blocks_kept, report.blocks_dropped
                    ),
                    Ok(Ok(None)) => {}
                    Ok(Err(e)) => error!("Housekeeping error: {}", e),
                    Err(e) => error!("Housekeeping task panicked: {}", e),
                }
            }
        });

        Self {
            tasks,
            shutdown,
            handle,
        }
    }

    /// Queue a task without waiting.
    pub fn request(&self, task: HousekeepingTask) {
        if let Err(mpsc::error::TrySendError::Full(task)) = self.tasks.try_send(task) {
            warn!("Housekeeping queue full, dropping {:?}", task);
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!("Housekeeping task ended abnormally: {}", e);
        }
    }
}
