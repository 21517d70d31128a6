//! Aggregate view over one monitor per node.

use super::{HealthMonitor, HealthStatus, Probe, StatusCallback};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

/// Watches a set of nodes and logs a fleet summary on every transition.
pub struct FleetWatch {
    monitors: Vec<HealthMonitor>,
    statuses: Arc<Mutex<BTreeMap<String, HealthStatus>>>,
}

impl FleetWatch {
    /// One monitor per distinct address. `on_change` also receives every transition.
    pub fn new<I, S>(
        targets: I,
        interval: Duration,
        probe: Arc<dyn Probe>,
        runtime: Handle,
        on_change: Option<StatusCallback>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let statuses: Arc<Mutex<BTreeMap<String, HealthStatus>>> = Arc::default();
        let mut monitors = Vec::new();

        for address in targets {
            let address = address.into();
            if statuses.lock().contains_key(&address) {
                continue;
            }
            statuses.lock().insert(address.clone(), HealthStatus::Unknown);

            let shared = Arc::clone(&statuses);
            let forward = on_change.clone();
            let callback: StatusCallback = Arc::new(move |monitor: &HealthMonitor| {
                let summary = {
                    let mut statuses = shared.lock();
                    statuses.insert(monitor.address().to_string(), monitor.status());
                    summarize(&statuses)
                };
                info!("node {} is now {}", monitor.address(), monitor.status());
                info!("fleet: {}", summary);
                if let Some(forward) = &forward {
                    forward(monitor);
                }
            });

            monitors.push(HealthMonitor::new(
                address,
                interval,
                Arc::clone(&probe),
                callback,
                runtime.clone(),
            ));
        }

        Self { monitors, statuses }
    }

    /// Probe every node now, then on the interval.
    pub fn start(&self) {
        for monitor in &self.monitors {
            monitor.start(true);
        }
    }

    pub fn stop(&self) {
        for monitor in &self.monitors {
            monitor.stop();
        }
    }

    pub fn monitors(&self) -> &[HealthMonitor] {
        &self.monitors
    }

    /// Last notified status per address.
    pub fn statuses(&self) -> BTreeMap<String, HealthStatus> {
        self.statuses.lock().clone()
    }

    /// `addr=STATUS, …` in address order.
    pub fn summary(&self) -> String {
        summarize(&self.statuses.lock())
    }
}

fn summarize(statuses: &BTreeMap<String, HealthStatus>) -> String {
    statuses
        .iter()
        .map(|(address, status)| format!("{}={}", address, status))
        .collect::<Vec<_>>()
        .join(", ")
}
