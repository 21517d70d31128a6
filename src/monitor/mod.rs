//! Remote node health monitor.
//!
//! One [`HealthMonitor`] watches one node: it probes on a fixed interval,
//! keeps the last known status and calls back only when the status changes.
//! The loop reschedules itself after every tick, whatever the outcome.
//!
//! At most one probe runs at a time. A `start()` issued while a probe is in
//! flight is deferred: the tick re-arms with the requested delay instead of
//! the interval once the probe completes.
//!
//! `stop()` cancels a pending timer only. A probe already in flight runs to
//! completion, may still invoke the callback and re-arms the timer. Dropping
//! every handle to a monitor ends the loop for good.

pub mod fleet;
pub mod probe;

pub use fleet::FleetWatch;
pub use probe::{PingProbe, Probe};

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Reachability of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// No probe has completed yet.
    Unknown,
    Ok,
    NotResponding,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Unknown => "UNKNOWN",
            HealthStatus::Ok => "OK",
            HealthStatus::NotResponding => "NOT_RESPONDING",
        })
    }
}

/// Called with the monitor after its status changed.
pub type StatusCallback = Arc<dyn Fn(&HealthMonitor) + Send + Sync>;

/// Periodic reachability watchdog for one node. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<Inner>,
}

struct Inner {
    address: String,
    interval: Duration,
    probe: Arc<dyn Probe>,
    callback: StatusCallback,
    runtime: Handle,
    state: Mutex<State>,
}

struct State {
    status: HealthStatus,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every arm; a tick whose generation is stale does nothing.
    generation: u64,
    in_flight: bool,
    /// Delay requested by `start()` while a probe was in flight.
    deferred: Option<Duration>,
}

impl HealthMonitor {
    pub fn new(
        address: impl Into<String>,
        interval: Duration,
        probe: Arc<dyn Probe>,
        callback: StatusCallback,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                address: address.into(),
                interval,
                probe,
                callback,
                runtime,
                state: Mutex::new(State {
                    status: HealthStatus::Unknown,
                    timer: None,
                    generation: 0,
                    in_flight: false,
                    deferred: None,
                }),
            }),
        }
    }

    /// Cancel any pending timer and arm a new one, firing now or after one
    /// interval. While a probe is running, the delay applies once it completes.
    pub fn start(&self, run_immediately: bool) {
        let delay = if run_immediately {
            Duration::ZERO
        } else {
            self.inner.interval
        };
        let mut state = self.inner.state.lock();
        if state.in_flight {
            debug!("monitor for {} busy, rearm in {:?} deferred", self.inner.address, delay);
            state.deferred = Some(delay);
            return;
        }
        debug!("monitor for {} armed in {:?}", self.inner.address, delay);
        Inner::arm(&self.inner, &mut state, delay);
    }

    /// Cancel a pending timer. Has no effect on a probe already running.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        state.deferred = None;
        if let Some(timer) = state.timer.take() {
            timer.abort();
            debug!("monitor for {} stopped", self.inner.address);
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.inner.state.lock().status
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("address", &self.inner.address)
            .field("interval", &self.inner.interval)
            .field("status", &self.status())
            .finish()
    }
}

impl Inner {
    fn arm(this: &Arc<Inner>, state: &mut State, delay: Duration) {
        let weak: Weak<Inner> = Arc::downgrade(this);
        if let Some(previous) = state.timer.take() {
            previous.abort();
        }
        state.generation = state.generation.wrapping_add(1);
        let generation = state.generation;

        state.timer = Some(this.runtime.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(inner) = weak.upgrade() {
                inner.tick(generation).await;
            }
        }));
    }

    async fn tick(self: Arc<Self>, generation: u64) {
        {
            let mut state = self.state.lock();
            if state.generation != generation || state.in_flight {
                return;
            }
            state.timer = None;
            state.in_flight = true;
        }

        let status = match self.probe.probe(&self.address).await {
            Ok(()) => HealthStatus::Ok,
            Err(failure) if failure.is_expected() => {
                debug!("{} did not respond: {}", self.address, failure);
                HealthStatus::NotResponding
            }
            Err(failure) => {
                warn!("probe of {} failed: {}", self.address, failure);
                HealthStatus::NotResponding
            }
        };

        let previous = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.status, status)
        };

        if previous != status {
            info!("{} changed from {} to {}", self.address, previous, status);
            let monitor = HealthMonitor {
                inner: Arc::clone(&self),
            };
            if catch_unwind(AssertUnwindSafe(|| (self.callback)(&monitor))).is_err() {
                warn!("status callback for {} panicked", self.address);
            }
        }

        let mut state = self.state.lock();
        state.in_flight = false;
        let delay = state.deferred.take().unwrap_or(self.interval);
        Inner::arm(&self, &mut state, delay);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}
