//! Relay between the firmware logger and the debug-log characteristic.

use core::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use heapless::String;

/// Longest forwarded log line, in bytes. Longer lines are truncated.
pub const LOG_LINE_MAX: usize = 120;

const LOG_QUEUE: usize = 4;

/// A line-oriented diagnostic sink.
pub trait LogSink {
    fn emit_line(&self, line: &str);
}

/// Fan-in point between the firmware logger and the control channel.
///
/// Lines are buffered in a small queue drained by the bridge server. The
/// relay never blocks the logging call site: while suspended or when the
/// queue is full, lines are dropped.
pub struct LogRelay {
    suspended: AtomicBool,
    lines: Channel<CriticalSectionRawMutex, String<LOG_LINE_MAX>, LOG_QUEUE>,
}

impl LogRelay {
    pub const fn new() -> Self {
        Self {
            suspended: AtomicBool::new(false),
            lines: Channel::new(),
        }
    }

    /// Stop forwarding lines until the returned guard is dropped.
    ///
    /// Guards do not nest; the idle monitor is the only suspender.
    pub fn suspend(&self) -> SuspendGuard<'_> {
        self.suspended.store(true, Ordering::Relaxed);
        SuspendGuard { relay: self }
    }

    /// Whether forwarding is currently suspended.
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Relaxed)
    }

    pub(crate) async fn next_line(&self) -> String<LOG_LINE_MAX> {
        self.lines.receive().await
    }

    #[cfg(test)]
    fn try_next_line(&self) -> Option<String<LOG_LINE_MAX>> {
        self.lines.try_receive().ok()
    }
}

impl Default for LogRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for LogRelay {
    fn emit_line(&self, line: &str) {
        if self.is_suspended() {
            return;
        }
        let mut owned: String<LOG_LINE_MAX> = String::new();
        for ch in line.chars() {
            if owned.push(ch).is_err() {
                break;
            }
        }
        let _ = self.lines.try_send(owned);
    }
}

/// Clears the suspension when dropped.
pub struct SuspendGuard<'a> {
    relay: &'a LogRelay,
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.relay.suspended.store(false, Ordering::Relaxed);
    }
}
