//! Shutdown sequencing.
//!
//! Restart and sleep requests arrive from three places: the control
//! channel (Restart and Sleep characteristics), the update engine after a
//! verified image, and the idle monitor. [`Lifecycle`] funnels them into a
//! single drain sequence so the radios always come down in order before
//! the chip-level power action fires.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Timer};

use crate::classic::{ClassicDriver, ClassicLink};
use crate::config::ConfigStore;

/// Pause between radio teardown and the power action so in-flight peer
/// traffic (e.g. a final status notification) can flush.
const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Platform hooks for the control radio.
pub trait RadioControl {
    /// Drop the connected control peer, if any.
    async fn disconnect_peer(&self);
    /// Stop advertising and release the control radio.
    async fn shutdown(&self);
}

/// Chip-level power actions.
///
/// On hardware neither call returns. Test doubles record the call and
/// return so [`Lifecycle::run`] can be observed to completion.
pub trait PowerControl {
    fn restart(&self);
    fn deep_sleep(&self);
}

/// How the device goes down.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Reboot, optionally erasing persisted configuration first.
    Restart { erase_config: bool },
    /// Power down until an external wake condition.
    DeepSleep,
}

/// Funnel for shutdown requests. The first request wins; anything posted
/// while one is pending is dropped.
pub struct Lifecycle {
    requests: Channel<CriticalSectionRawMutex, ShutdownMode, 1>,
}

impl Lifecycle {
    pub const fn new() -> Self {
        Self { requests: Channel::new() }
    }

    /// Post a shutdown request.
    pub fn request(&self, mode: ShutdownMode) {
        if self.requests.try_send(mode).is_err() {
            debug!("lifecycle: shutdown already pending, request dropped");
        }
    }

    /// Wait for a request, then drain the stack in order: persisted
    /// configuration (when erasing), the classic link, the control radio,
    /// a settle pause, and finally the power hook.
    ///
    /// Returns the handled mode. On hardware the power hook does not
    /// return; the value is for test doubles and supervisors.
    pub async fn run<D, C, R, P>(
        &self,
        link: &ClassicLink<'_, D>,
        config: &C,
        radio: &R,
        power: &P,
    ) -> ShutdownMode
    where
        D: ClassicDriver,
        C: ConfigStore,
        R: RadioControl,
        P: PowerControl,
    {
        let mode = self.requests.receive().await;
        info!("lifecycle: shutting down ({:?})", mode);

        if let ShutdownMode::Restart { erase_config: true } = mode {
            info!("lifecycle: erasing persisted configuration");
            if config.reset().await.is_err() {
                warn!("lifecycle: configuration erase failed, continuing");
            }
        }

        link.shutdown().await;
        radio.shutdown().await;
        Timer::after(SETTLE_DELAY).await;

        match mode {
            ShutdownMode::Restart { .. } => power.restart(),
            ShutdownMode::DeepSleep => power.deep_sleep(),
        }
        mode
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_request_wins() {
        let lifecycle = Lifecycle::new();
        lifecycle.request(ShutdownMode::DeepSleep);
        lifecycle.request(ShutdownMode::Restart { erase_config: true });

        assert_eq!(lifecycle.requests.try_receive().ok(), Some(ShutdownMode::DeepSleep));
        assert!(lifecycle.requests.try_receive().is_err());
    }
}
