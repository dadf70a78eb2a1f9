//! Bluetooth Classic link engine.
//!
//! One worker future ([`ClassicLink::run`]) owns the radio: discovery,
//! connection attempts and the link-alive watch all execute there, fed by
//! a command queue. Public operations only update shared state and nudge
//! the worker, so they are cheap and callable from any task.
//!
//! Superseding an operation bumps a generation counter under the state
//! mutex and wakes the worker. The in-flight operation observes the stale
//! generation at its next poll point, emits its terminal event and returns
//! before the next command is picked up, which gives event consumers a
//! strict ordering: a canceled operation always finishes before the
//! superseding one becomes observable.

use core::cell::RefCell;
use core::convert::Infallible;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};
use heapless::Vec;

mod driver;

pub use driver::{ClassicDriver, DiscoveredDevice};

/// Inbound bytes are drained from the driver in chunks of this size.
pub const INBOUND_CHUNK: usize = 128;

const COMMAND_QUEUE: usize = 4;
const EVENT_QUEUE: usize = 8;

/// Timing knobs for discovery and the link-alive watch.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub struct LinkTiming {
    /// Length of one inquiry slice. The stack's result cache is cleared at
    /// every slice boundary so known devices are reported again.
    pub inquiry_slice: Duration,
    /// Number of slices in one scan.
    pub inquiry_slices: u32,
    /// Interval of the link-alive poll while connected. The stack has no
    /// disconnect event, so the worker polls.
    pub poll_interval: Duration,
    /// Upper bound on the shutdown drain.
    pub drain_timeout: Duration,
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            inquiry_slice: Duration::from_millis(1280),
            inquiry_slices: 48,
            poll_interval: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Coarse link state as seen by the engine.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    Disconnected,
    Scanning,
    Connecting,
    Connected,
}

/// Events emitted by the link worker, in order of occurrence.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A named device was reported during discovery.
    Discovered(DiscoveredDevice),
    /// Discovery ended. Exactly one per accepted scan.
    ScanFinished { canceled: bool },
    /// A connection attempt is about to start.
    ConnectAttempt { attempt: u8, count: u8 },
    /// The link came up or went down. At most one `up = true` and exactly
    /// one `up = false` per connection request.
    LinkChanged { up: bool },
    /// Bytes received from the peer.
    Inbound(Vec<u8, INBOUND_CHUNK>),
}

enum Command {
    Scan { epoch: u32 },
    Connect { epoch: u32, addr: crate::types::PeerAddress, retries: u8 },
    Disconnect { epoch: u32 },
}

struct Shared {
    phase: LinkPhase,
    can_scan: bool,
    epoch: u32,
}

/// Session management for the serial-side Bluetooth Classic link.
pub struct ClassicLink<'d, D: ClassicDriver> {
    driver: &'d D,
    state: Mutex<CriticalSectionRawMutex, RefCell<Shared>>,
    commands: Channel<CriticalSectionRawMutex, Command, COMMAND_QUEUE>,
    events: Channel<CriticalSectionRawMutex, LinkEvent, EVENT_QUEUE>,
    wake: Signal<CriticalSectionRawMutex, ()>,
    timing: LinkTiming,
}

impl<'d, D: ClassicDriver> ClassicLink<'d, D> {
    pub fn new(driver: &'d D) -> Self {
        Self {
            driver,
            state: Mutex::new(RefCell::new(Shared {
                phase: LinkPhase::Disconnected,
                can_scan: true,
                epoch: 0,
            })),
            commands: Channel::new(),
            events: Channel::new(),
            wake: Signal::new(),
            timing: LinkTiming::default(),
        }
    }

    pub fn with_timing(mut self, timing: LinkTiming) -> Self {
        self.timing = timing;
        self
    }

    fn with_state<F: FnOnce(&mut Shared) -> R, R>(&self, f: F) -> R {
        self.state.lock(|s| f(&mut s.borrow_mut()))
    }

    /// Whether discovery is still available. Cleared forever by the first
    /// connection request.
    pub fn can_scan(&self) -> bool {
        self.with_state(|s| s.can_scan)
    }

    pub fn is_scanning(&self) -> bool {
        self.with_state(|s| s.phase == LinkPhase::Scanning)
    }

    /// Start discovery. Returns `false` with no side effect when scanning
    /// is no longer available; otherwise any scan already in flight is
    /// superseded (its [`LinkEvent::ScanFinished`] fires first).
    pub fn scan(&self) -> bool {
        let epoch = self.with_state(|s| {
            if !s.can_scan {
                return None;
            }
            s.epoch = s.epoch.wrapping_add(1);
            s.phase = LinkPhase::Scanning;
            Some(s.epoch)
        });
        let Some(epoch) = epoch else {
            return false;
        };
        self.wake.signal(());
        if self.commands.try_send(Command::Scan { epoch }).is_err() {
            warn!("link: command queue full, scan dropped");
            self.finish_op(epoch, LinkPhase::Disconnected);
            return false;
        }
        true
    }

    /// Stop an active scan. No-op when none is active; otherwise the scan
    /// finishes with `canceled = true`.
    pub fn cancel_scan(&self) {
        let active = self.with_state(|s| {
            if s.phase != LinkPhase::Scanning {
                return false;
            }
            s.epoch = s.epoch.wrapping_add(1);
            s.phase = LinkPhase::Disconnected;
            true
        });
        if active {
            self.wake.signal(());
        }
    }

    /// Connect to `addr`, trying up to `retries` times. A zero budget
    /// exhausts before the first dial and only fires the down event.
    ///
    /// Permanently disables scanning and supersedes any scan or earlier
    /// connection request; the superseded operation's terminal event fires
    /// before this request's first [`LinkEvent::ConnectAttempt`].
    pub fn connect(&self, addr: crate::types::PeerAddress, retries: u8) {
        let epoch = self.with_state(|s| {
            s.can_scan = false;
            s.epoch = s.epoch.wrapping_add(1);
            s.phase = LinkPhase::Connecting;
            s.epoch
        });
        self.wake.signal(());
        let cmd = Command::Connect { epoch, addr, retries };
        if self.commands.try_send(cmd).is_err() {
            warn!("link: command queue full, connect dropped");
            self.finish_op(epoch, LinkPhase::Disconnected);
            if self.events.try_send(LinkEvent::LinkChanged { up: false }).is_err() {
                warn!("link: event queue full, down event lost");
            }
        }
    }

    /// Tear down an active or pending connection. The link watch observes
    /// the teardown and emits the one terminal [`LinkEvent::LinkChanged`].
    /// A running scan is left alone; only [`Self::cancel_scan`] and
    /// [`Self::connect`] end discovery early.
    pub fn disconnect(&self) {
        let epoch = self.with_state(|s| {
            if !matches!(s.phase, LinkPhase::Connecting | LinkPhase::Connected) {
                return None;
            }
            s.epoch = s.epoch.wrapping_add(1);
            Some(s.epoch)
        });
        let Some(epoch) = epoch else {
            debug!("link: disconnect without a link, ignored");
            return;
        };
        self.wake.signal(());
        if self.commands.try_send(Command::Disconnect { epoch }).is_err() {
            warn!("link: command queue full, disconnect dropped");
        }
    }

    /// Authoritative link check. When the stack disagrees with a stale
    /// `Connected` phase the worker is nudged so the pending down-event
    /// fires.
    pub fn is_connected(&self) -> bool {
        let up = self.driver.link_up();
        if !up && self.with_state(|s| s.phase == LinkPhase::Connected) {
            self.wake.signal(());
        }
        up
    }

    /// Write to the connected peer.
    pub async fn write(&self, data: &[u8]) -> Result<(), crate::Error<D::Error>> {
        if !self.is_connected() {
            debug!("link: write of {} bytes dropped, not connected", data.len());
            return Err(crate::Error::NotConnected);
        }
        self.driver.write(data).await.map_err(crate::Error::Driver)
    }

    /// Next link event. Events are ordered; terminal events of superseded
    /// operations arrive before the superseding operation's first event.
    pub async fn next_event(&self) -> LinkEvent {
        self.events.receive().await
    }

    /// Non-blocking variant of [`Self::next_event`].
    pub fn try_next_event(&self) -> Option<LinkEvent> {
        self.events.try_receive().ok()
    }

    /// Drop any link and wait for the stack to settle. Used by the
    /// shutdown sequence before a power transition.
    pub async fn shutdown(&self) {
        self.disconnect();
        let deadline = Instant::now() + self.timing.drain_timeout;
        while self.driver.link_up() && Instant::now() < deadline {
            Timer::after(Duration::from_millis(50)).await;
        }
        if self.driver.link_up() {
            warn!("link: shutdown drain timed out");
        }
    }

    /// The link worker. Runs forever; must be polled for any operation to
    /// make progress.
    pub async fn run(&self) -> Result<Infallible, crate::Error<D::Error>> {
        loop {
            match self.commands.receive().await {
                Command::Scan { epoch } => self.scan_op(epoch).await,
                Command::Connect { epoch, addr, retries } => self.connect_op(epoch, addr, retries).await,
                Command::Disconnect { epoch } => self.disconnect_op(epoch).await,
            }
        }
    }

    fn superseded(&self, epoch: u32) -> bool {
        self.with_state(|s| s.epoch != epoch)
    }

    fn finish_op(&self, epoch: u32, phase: LinkPhase) {
        self.with_state(|s| {
            if s.epoch == epoch {
                s.phase = phase;
            }
        });
    }

    async fn emit(&self, event: LinkEvent) {
        self.events.send(event).await;
    }

    async fn scan_op(&self, epoch: u32) {
        if self.superseded(epoch) {
            self.emit(LinkEvent::ScanFinished { canceled: true }).await;
            return;
        }
        if self.driver.start_inquiry().await.is_err() {
            warn!("link: inquiry failed to start");
            self.finish_op(epoch, LinkPhase::Disconnected);
            self.emit(LinkEvent::ScanFinished { canceled: false }).await;
            return;
        }
        info!("link: discovery started");
        let canceled = self.scan_watch(epoch).await;
        if self.driver.stop_inquiry().await.is_err() {
            warn!("link: inquiry stop failed");
        }
        self.finish_op(epoch, LinkPhase::Disconnected);
        self.emit(LinkEvent::ScanFinished { canceled }).await;
    }

    /// Forward named inquiry results while pacing out the slice timers.
    /// Returns whether the scan was canceled.
    async fn scan_watch(&self, epoch: u32) -> bool {
        let collector = async {
            loop {
                match self.driver.discovered().await {
                    Ok(device) => {
                        if device.name.is_none() {
                            trace!("link: unnamed device suppressed");
                            continue;
                        }
                        self.emit(LinkEvent::Discovered(device)).await;
                    }
                    Err(_) => {
                        warn!("link: inquiry result error");
                        break;
                    }
                }
            }
        };
        let slicer = async {
            for _ in 0..self.timing.inquiry_slices {
                if self.wait_or_superseded(epoch, self.timing.inquiry_slice).await {
                    return true;
                }
                if self.driver.clear_inquiry_cache().await.is_err() {
                    warn!("link: inquiry cache clear failed");
                }
            }
            false
        };
        match select(collector, slicer).await {
            // Result stream died; report the scan as complete.
            Either::First(()) => false,
            Either::Second(canceled) => canceled,
        }
    }

    async fn connect_op(&self, epoch: u32, addr: crate::types::PeerAddress, retries: u8) {
        if self.superseded(epoch) {
            self.emit(LinkEvent::LinkChanged { up: false }).await;
            return;
        }
        if self.driver.link_up() {
            // A fresh dial replaces whatever link is still standing.
            let _ = self.driver.disconnect().await;
        }
        info!("link: connecting to {:?}", addr);
        let mut connected = false;
        for attempt in 1..=retries {
            if self.superseded(epoch) {
                self.emit(LinkEvent::LinkChanged { up: false }).await;
                return;
            }
            self.emit(LinkEvent::ConnectAttempt { attempt, count: retries }).await;
            match self.driver.connect(addr).await {
                Ok(()) => {
                    connected = true;
                    break;
                }
                Err(_) => debug!("link: attempt {} of {} failed", attempt, retries),
            }
        }
        if !connected {
            info!("link: could not reach {:?}", addr);
            self.finish_op(epoch, LinkPhase::Disconnected);
            self.emit(LinkEvent::LinkChanged { up: false }).await;
            return;
        }
        info!("link: connected to {:?}", addr);
        self.finish_op(epoch, LinkPhase::Connected);
        self.emit(LinkEvent::LinkChanged { up: true }).await;
        self.watch_link(epoch).await;
        if self.driver.link_up() {
            // Superseded while the link was still standing.
            let _ = self.driver.disconnect().await;
        }
        self.finish_op(epoch, LinkPhase::Disconnected);
        self.emit(LinkEvent::LinkChanged { up: false }).await;
    }

    /// Pump inbound bytes and watch for the link going away. Returns when
    /// the operation is superseded or the link is down.
    async fn watch_link(&self, epoch: u32) {
        let reader = async {
            let mut buf = [0u8; INBOUND_CHUNK];
            loop {
                match self.driver.read(&mut buf).await {
                    Ok(0) => {
                        debug!("link: peer closed the stream");
                        break;
                    }
                    Ok(n) => {
                        if let Ok(chunk) = Vec::from_slice(&buf[..n]) {
                            self.emit(LinkEvent::Inbound(chunk)).await;
                        }
                    }
                    Err(_) => {
                        warn!("link: read error");
                        break;
                    }
                }
            }
        };
        let watchdog = async {
            loop {
                if self.superseded(epoch) {
                    return;
                }
                // A nudge from `is_connected` advances the check; otherwise
                // the link is polled once per interval.
                let deadline = Instant::now() + self.timing.poll_interval;
                let _ = select(self.wake.wait(), Timer::at(deadline)).await;
                if self.superseded(epoch) {
                    return;
                }
                if !self.driver.link_up() {
                    info!("link: peer lost");
                    return;
                }
            }
        };
        select(reader, watchdog).await;
    }

    /// Sleep for `period`, absorbing worker nudges. Returns `true` as soon
    /// as the operation is superseded.
    async fn wait_or_superseded(&self, epoch: u32, period: Duration) -> bool {
        let deadline = Instant::now() + period;
        loop {
            if self.superseded(epoch) {
                return true;
            }
            match select(self.wake.wait(), Timer::at(deadline)).await {
                Either::First(()) => continue,
                Either::Second(()) => return self.superseded(epoch),
            }
        }
    }

    async fn disconnect_op(&self, epoch: u32) {
        if self.driver.disconnect().await.is_err() {
            warn!("link: disconnect failed");
        }
        self.finish_op(epoch, LinkPhase::Disconnected);
    }
}
