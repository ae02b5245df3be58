//! Periodic driver: one independent loop per channel orchestrator.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info};

use postsync_common::Channel;

use crate::orchestrator::Orchestrator;
use crate::types::{ChannelStatus, RunReport};

pub struct ReconcileScheduler {
    orchestrators: Vec<Arc<Orchestrator>>,
    interval: std::time::Duration,
}

impl ReconcileScheduler {
    pub fn new(orchestrators: Vec<Arc<Orchestrator>>, interval: std::time::Duration) -> Self {
        Self {
            orchestrators,
            interval,
        }
    }

    pub fn status(&self) -> Vec<ChannelStatus> {
        self.orchestrators.iter().map(|o| o.status()).collect()
    }

    /// Manual trigger for one channel. `None` if the channel is not scheduled.
    pub async fn trigger_now(&self, channel: Channel) -> Option<RunReport> {
        let orchestrator = self.orchestrators.iter().find(|o| o.channel() == channel)?;
        Some(orchestrator.trigger_now().await)
    }

    /// Run every channel on the interval until `shutdown` flips to true.
    /// The first tick fires immediately. A run that overruns the interval
    /// swallows the missed ticks rather than queueing them.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        info!(
            channels = self.orchestrators.len(),
            interval_secs = self.interval.as_secs(),
            "Reconcile scheduler starting"
        );

        let loops = self.orchestrators.iter().map(|orchestrator| {
            let orchestrator = orchestrator.clone();
            let mut shutdown = shutdown.clone();
            let period = self.interval.max(std::time::Duration::from_secs(1));
            tokio::spawn(async move {
                let mut ticker = time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    tokio::select! {
                        _ = ticker.tick() => {
                            orchestrator.trigger_now().await;
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                info!(channel = %orchestrator.channel(), "Channel loop stopped");
            })
        });

        for result in join_all(loops).await {
            if let Err(e) = result {
                error!(error = %e, "Channel loop panicked");
            }
        }
        info!("Reconcile scheduler stopped");
    }
}
