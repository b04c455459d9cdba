//! Background browser health monitor.
//!
//! Publishes a single boolean that readers see without blocking. Only state
//! transitions are logged.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::pool::ConnectionPool;

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Cheap liveness check bounded by `timeout`. Must not disturb open tabs.
    async fn probe(&self, timeout: Duration) -> bool;
}

#[async_trait]
impl HealthProbe for ConnectionPool {
    async fn probe(&self, timeout: Duration) -> bool {
        self.is_healthy(timeout).await
    }
}

pub struct HealthMonitor {
    probe: Arc<dyn HealthProbe>,
    interval: Duration,
    probe_timeout: Duration,
    healthy: AtomicBool,
}

impl HealthMonitor {
    pub fn new(probe: Arc<dyn HealthProbe>, interval: Duration, probe_timeout: Duration) -> Self {
        Self {
            probe,
            interval,
            probe_timeout,
            healthy: AtomicBool::new(false),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Run one probe and publish the result. Returns the new state.
    pub async fn probe_once(&self) -> bool {
        let now = self.probe.probe(self.probe_timeout).await;
        let before = self.healthy.swap(now, Ordering::SeqCst);
        match (before, now) {
            (false, true) => info!("Browser became healthy"),
            (true, false) => warn!("Browser became unhealthy"),
            _ => {}
        }
        now
    }

    pub async fn run_loop(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        info!(interval_secs = self.interval.as_secs(), "HealthMonitor started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.probe_once().await;
                }
                _ = shutdown.recv() => {
                    info!("HealthMonitor shutting down");
                    break;
                }
            }
        }
    }
}
