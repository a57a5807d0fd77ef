//! Background health monitoring.
//!
//! HealthMonitor polls every instance on a fixed interval:
//! - Running instances are probed; a failed probe moves them to Error
//! - Error instances are handed to `restart`, which applies the bounded
//!   cooldown policy
//!
//! The loop is independent of any session and survives panics in a cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

use super::lifecycle::LifecycleManager;
use super::types::ServerStatus;
use crate::recovery::guard_async;
use crate::types::Result;

/// Statistics from one health cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Running instances probed
    pub probed: usize,
    /// Probes that failed this cycle
    pub failed: usize,
    /// Restarts that brought an instance back
    pub restarted: usize,
    /// Restarts refused or failed
    pub restart_failures: usize,
    pub completed_at: Option<DateTime<Utc>>,
}

/// HealthMonitor handles background probing and restarts.
#[derive(Debug)]
pub struct HealthMonitor {
    manager: Arc<LifecycleManager>,
    interval: Duration,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn new(manager: Arc<LifecycleManager>, interval: Duration) -> Self {
        Self {
            manager,
            interval,
            stop_tx: None,
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Start the monitor loop in the background. Idempotent.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        let manager = Arc::clone(&self.manager);
        let period = self.interval;
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        self.stop_tx = Some(stop_tx);

        self.handle = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so a freshly
            // started server gets a full interval before its first probe.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match guard_async("health_cycle", Self::run_cycle(&manager)).await {
                            Ok(report) if report.failed + report.restart_failures > 0 => {
                                tracing::warn!(?report, "health_cycle_degraded");
                            }
                            Ok(report) => tracing::debug!(?report, "health_cycle_completed"),
                            Err(e) => tracing::error!("health_cycle_failed: {}", e),
                        }
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("health_monitor_stopped");
                        break;
                    }
                }
            }
        }));
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    /// Run a single probe-and-restart pass.
    pub async fn run_cycle(manager: &LifecycleManager) -> Result<HealthReport> {
        let mut report = HealthReport::default();

        // Phase 1: probe Running instances
        for info in manager.servers().await {
            if info.status == ServerStatus::Running {
                report.probed += 1;
                if !manager.check_health(&info.name).await {
                    report.failed += 1;
                }
            }
        }

        // Phase 2: restart Error instances under the bounded policy
        for info in manager.servers().await {
            if info.status == ServerStatus::Error {
                if manager.restart(&info.name).await {
                    report.restarted += 1;
                } else {
                    report.restart_failures += 1;
                }
            }
        }

        report.completed_at = Some(Utc::now());
        Ok(report)
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}
