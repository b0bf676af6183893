// Periodic housekeeping: idle connection reaping and access cache sweeps.

use std::{sync::Arc, time::Duration as StdDuration};

use chrono::{DateTime, Duration, Utc};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::cache::AccessCache;
use crate::gateway::Gateway;
use crate::registry::ConnectionId;

pub struct InactivityReaper {
    gateway: Gateway,
    threshold: Duration,
}

impl InactivityReaper {
    pub fn new(gateway: Gateway, threshold: Duration) -> Self {
        Self { gateway, threshold }
    }

    pub async fn sweep(&self) -> Vec<ConnectionId> {
        self.sweep_at(Utc::now()).await
    }

    /// Close and remove every connection idle for longer than the threshold.
    /// Each candidate is checked again at removal, so activity landing after
    /// the scan spares it. Returns the ids actually removed by this sweep.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Vec<ConnectionId> {
        let stale = self.gateway.registry().stale_connections(now, self.threshold).await;
        let mut reaped = Vec::with_capacity(stale.len());
        for (connection_id, _) in stale {
            if self.gateway.disconnect_if_idle(connection_id, now, self.threshold).await {
                info!(connection_id = %connection_id, "reaped inactive connection");
                reaped.push(connection_id);
            }
        }
        reaped
    }

    async fn run(self, period: StdDuration, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    let reaped = self.sweep().await;
                    debug!(reaped = reaped.len(), "inactivity sweep finished");
                }
            }
        }
        debug!("inactivity reaper stopped");
    }
}

async fn run_cache_sweeper(
    cache: Arc<AccessCache>,
    period: StdDuration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                let report = cache.sweep();
                debug!(
                    expired = report.expired,
                    evicted = report.evicted,
                    remaining = cache.len(),
                    "access cache sweep finished"
                );
            }
        }
    }
    debug!("access cache sweeper stopped");
}

/// Handle to the gateway's background timers. Dropping it stops them.
pub struct BackgroundTasks {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub(crate) fn spawn(
        reaper: InactivityReaper,
        reaper_interval: StdDuration,
        cache: Arc<AccessCache>,
        cache_sweep_interval: StdDuration,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        let tasks = vec![
            tokio::spawn(reaper.run(reaper_interval, shutdown_tx.subscribe())),
            tokio::spawn(run_cache_sweeper(cache, cache_sweep_interval, shutdown_tx.subscribe())),
        ];
        info!(
            reaper_interval_secs = reaper_interval.as_secs(),
            cache_sweep_interval_secs = cache_sweep_interval.as_secs(),
            "background tasks started"
        );
        Self { shutdown_tx, tasks }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub async fn wait(mut self) {
        self.shutdown();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.shutdown();
    }
}
