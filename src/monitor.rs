//! Idle lifecycle policy.
//!
//! Every control-channel read, write, subscription change and indication
//! ack touches the [`ActivityTracker`]. The [`IdleMonitor`] wakes on a
//! fixed period, compares the idle time against the configured limits and
//! either drops an idle peer or requests a power-down. It is a pure
//! policy evaluator over shared state, not a state machine of its own.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Duration, Instant, Ticker};

use crate::config::{defaults, ConfigStore};
use crate::lifecycle::{Lifecycle, RadioControl, ShutdownMode};
use crate::logging::LogRelay;

/// How often the idle limits are evaluated.
pub const DEFAULT_MONITOR_PERIOD: Duration = Duration::from_secs(30);

struct ActivityState {
    last: Instant,
    connected: bool,
}

/// Last-activity clock shared by the dispatch path and the monitor.
pub struct ActivityTracker {
    state: Mutex<CriticalSectionRawMutex, RefCell<ActivityState>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(ActivityState {
                last: Instant::now(),
                connected: false,
            })),
        }
    }

    /// Record peer traffic.
    pub fn touch(&self) {
        self.state.lock(|s| s.borrow_mut().last = Instant::now());
    }

    /// Record a peer connect or disconnect. Counts as activity, so a
    /// fresh idle window starts from the transition.
    pub fn set_connected(&self, connected: bool) {
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.connected = connected;
            s.last = Instant::now();
        });
    }

    pub fn connected(&self) -> bool {
        self.state.lock(|s| s.borrow().connected)
    }

    /// Current idle duration and peer presence, read atomically.
    pub fn snapshot(&self) -> (Duration, bool) {
        self.state.lock(|s| {
            let s = s.borrow();
            (s.last.elapsed(), s.connected)
        })
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdleAction {
    None,
    DisconnectPeer,
    PowerOff,
}

fn evaluate(connected: bool, idle: Duration, connected_limit: Duration, disconnected_limit: Duration) -> IdleAction {
    if connected {
        if idle >= connected_limit {
            IdleAction::DisconnectPeer
        } else {
            IdleAction::None
        }
    } else if idle >= disconnected_limit {
        IdleAction::PowerOff
    } else {
        IdleAction::None
    }
}

/// Periodic idle-limit enforcement.
pub struct IdleMonitor<'d, C: ConfigStore> {
    activity: &'d ActivityTracker,
    config: &'d C,
    lifecycle: &'d Lifecycle,
    relay: &'d LogRelay,
    period: Duration,
}

impl<'d, C: ConfigStore> IdleMonitor<'d, C> {
    pub fn new(activity: &'d ActivityTracker, config: &'d C, lifecycle: &'d Lifecycle, relay: &'d LogRelay) -> Self {
        Self {
            activity,
            config,
            lifecycle,
            relay,
            period: DEFAULT_MONITOR_PERIOD,
        }
    }

    /// Override the evaluation period.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Evaluate forever. An expired connected limit drops the peer via
    /// `radio` and restarts the idle window; an expired disconnected
    /// limit posts a deep-sleep request to the lifecycle.
    pub async fn run<R: RadioControl>(&self, radio: &R) -> ! {
        let mut ticker = Ticker::every(self.period);
        loop {
            ticker.next().await;
            self.tick(radio).await;
        }
    }

    async fn tick<R: RadioControl>(&self, radio: &R) {
        let (idle, connected) = self.activity.snapshot();
        let connected_limit = Duration::from_secs(
            self.config
                .connected_idle_secs()
                .await
                .unwrap_or(defaults::CONNECTED_IDLE_SECS) as u64,
        );
        let disconnected_limit = Duration::from_secs(
            self.config
                .disconnected_idle_secs()
                .await
                .unwrap_or(defaults::DISCONNECTED_IDLE_SECS) as u64,
        );

        // Forwarding pauses while the monitor speaks; its own diagnostics
        // must not reach the peer as debug-log traffic.
        let _quiet = self.relay.suspend();
        debug!("monitor: idle {}s (peer connected: {})", idle.as_secs(), connected);

        match evaluate(connected, idle, connected_limit, disconnected_limit) {
            IdleAction::None => {}
            IdleAction::DisconnectPeer => {
                warn!("monitor: peer idle for {}s, disconnecting", idle.as_secs());
                radio.disconnect_peer().await;
                self.activity.touch();
            }
            IdleAction::PowerOff => {
                warn!("monitor: no peer for {}s, powering down", idle.as_secs());
                self.lifecycle.request(ShutdownMode::DeepSleep);
            }
        }
    }
}
