#![allow(unused)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::Duration;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use x1_bridge::classic::{ClassicDriver, ClassicLink, DiscoveredDevice, LinkEvent, LinkTiming};
use x1_bridge::config::{ConfigStore, MAX_NAME_LEN};
use x1_bridge::lifecycle::{PowerControl, RadioControl};
use x1_bridge::ota::{UpdateFlash, FORMAT_FULL_IMAGE, MSG_CHUNK, MSG_FINISH, MSG_START};
use x1_bridge::types::PeerAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockError;

impl embedded_io_async::Error for MockError {
    fn kind(&self) -> embedded_io_async::ErrorKind {
        embedded_io_async::ErrorKind::Other
    }
}

/// Scriptable classic stack. Tests push inquiry results and inbound
/// bytes; the driver records everything the engine asks of it.
pub struct MockDriver {
    link: AtomicBool,
    connect_failures: AtomicUsize,
    inquiry_fails: AtomicBool,
    pub connect_attempts: AtomicUsize,
    pub inquiries: AtomicUsize,
    pub inquiry_stops: AtomicUsize,
    pub cache_clears: AtomicUsize,
    pub disconnects: AtomicUsize,
    results: Channel<CriticalSectionRawMutex, DiscoveredDevice, 8>,
    inbound: Channel<CriticalSectionRawMutex, Vec<u8>, 8>,
    written: Mutex<Vec<u8>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            link: AtomicBool::new(false),
            connect_failures: AtomicUsize::new(0),
            inquiry_fails: AtomicBool::new(false),
            connect_attempts: AtomicUsize::new(0),
            inquiries: AtomicUsize::new(0),
            inquiry_stops: AtomicUsize::new(0),
            cache_clears: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            results: Channel::new(),
            inbound: Channel::new(),
            written: Mutex::new(Vec::new()),
        }
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.connect_failures.store(count, Ordering::Relaxed);
    }

    pub fn fail_inquiry(&self) {
        self.inquiry_fails.store(true, Ordering::Relaxed);
    }

    pub fn push_result(&self, device: DiscoveredDevice) {
        self.results.try_send(device).expect("result queue full");
    }

    pub fn push_inbound(&self, data: &[u8]) {
        self.inbound.try_send(data.to_vec()).expect("inbound queue full");
    }

    /// The peer closes the stream; the next read returns zero bytes.
    pub fn close_stream(&self) {
        self.push_inbound(&[]);
    }

    /// The link dies without a stream close, as a radio drop does. Only
    /// the alive poll can notice.
    pub fn drop_link(&self) {
        self.link.store(false, Ordering::Relaxed);
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }
}

impl embedded_io_async::ErrorType for MockDriver {
    type Error = MockError;
}

impl ClassicDriver for MockDriver {
    async fn start_inquiry(&self) -> Result<(), Self::Error> {
        self.inquiries.fetch_add(1, Ordering::Relaxed);
        if self.inquiry_fails.load(Ordering::Relaxed) {
            return Err(MockError);
        }
        Ok(())
    }

    async fn stop_inquiry(&self) -> Result<(), Self::Error> {
        self.inquiry_stops.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn clear_inquiry_cache(&self) -> Result<(), Self::Error> {
        self.cache_clears.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn discovered(&self) -> Result<DiscoveredDevice, Self::Error> {
        Ok(self.results.receive().await)
    }

    async fn connect(&self, _addr: PeerAddress) -> Result<(), Self::Error> {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        let remaining = self.connect_failures.load(Ordering::Relaxed);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::Relaxed);
            return Err(MockError);
        }
        self.link.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
        self.link.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn link_up(&self) -> bool {
        self.link.load(Ordering::Relaxed)
    }

    async fn write(&self, data: &[u8]) -> Result<(), Self::Error> {
        self.written.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let chunk = self.inbound.receive().await;
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        Ok(n)
    }
}

#[derive(Default)]
struct ConfigState {
    name: Option<heapless::String<MAX_NAME_LEN>>,
    pin: Option<u32>,
    paired_address: Option<PeerAddress>,
    paired_name: Option<heapless::String<MAX_NAME_LEN>>,
    connected_idle: Option<u32>,
    disconnected_idle: Option<u32>,
    resets: usize,
}

/// In-memory settings store.
#[derive(Default)]
pub struct MockConfig {
    state: Mutex<ConfigState>,
}

impl MockConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a paired device, as provisioning would have.
    pub fn pair_with(&self, addr: PeerAddress) {
        self.state.lock().unwrap().paired_address = Some(addr);
    }

    pub fn set_idle_limits(&self, connected: u32, disconnected: u32) {
        let mut state = self.state.lock().unwrap();
        state.connected_idle = Some(connected);
        state.disconnected_idle = Some(disconnected);
    }

    pub fn resets(&self) -> usize {
        self.state.lock().unwrap().resets
    }

    pub fn stored_pin(&self) -> Option<u32> {
        self.state.lock().unwrap().pin
    }
}

fn bounded(value: &str) -> heapless::String<MAX_NAME_LEN> {
    let mut name = heapless::String::new();
    let _ = name.push_str(value);
    name
}

impl ConfigStore for MockConfig {
    type Error = core::convert::Infallible;

    async fn name(&self) -> Option<heapless::String<MAX_NAME_LEN>> {
        self.state.lock().unwrap().name.clone()
    }

    async fn set_name(&self, name: &str) -> Result<(), Self::Error> {
        self.state.lock().unwrap().name = Some(bounded(name));
        Ok(())
    }

    async fn pin_code(&self) -> Option<u32> {
        self.state.lock().unwrap().pin
    }

    async fn set_pin_code(&self, pin: u32) -> Result<(), Self::Error> {
        self.state.lock().unwrap().pin = Some(pin);
        Ok(())
    }

    async fn paired_address(&self) -> Option<PeerAddress> {
        self.state.lock().unwrap().paired_address
    }

    async fn set_paired_address(&self, addr: Option<PeerAddress>) -> Result<(), Self::Error> {
        self.state.lock().unwrap().paired_address = addr;
        Ok(())
    }

    async fn paired_name(&self) -> Option<heapless::String<MAX_NAME_LEN>> {
        self.state.lock().unwrap().paired_name.clone()
    }

    async fn set_paired_name(&self, name: Option<&str>) -> Result<(), Self::Error> {
        self.state.lock().unwrap().paired_name = name.map(bounded);
        Ok(())
    }

    async fn connected_idle_secs(&self) -> Option<u32> {
        self.state.lock().unwrap().connected_idle
    }

    async fn set_connected_idle_secs(&self, secs: u32) -> Result<(), Self::Error> {
        self.state.lock().unwrap().connected_idle = Some(secs);
        Ok(())
    }

    async fn disconnected_idle_secs(&self) -> Option<u32> {
        self.state.lock().unwrap().disconnected_idle
    }

    async fn set_disconnected_idle_secs(&self, secs: u32) -> Result<(), Self::Error> {
        self.state.lock().unwrap().disconnected_idle = Some(secs);
        Ok(())
    }

    async fn reset(&self) -> Result<(), Self::Error> {
        let mut state = self.state.lock().unwrap();
        *state = ConfigState {
            resets: state.resets + 1,
            ..ConfigState::default()
        };
        Ok(())
    }
}

#[derive(Default)]
pub struct FlashState {
    pub begun: Option<u32>,
    pub written: Vec<u8>,
    pub activated: bool,
    pub aborts: usize,
}

/// Update partition double. Clone it before handing it to the engine to
/// keep a window onto the partition state.
#[derive(Clone, Default)]
pub struct MockFlash {
    pub state: Arc<Mutex<FlashState>>,
}

impl MockFlash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activated(&self) -> bool {
        self.state.lock().unwrap().activated
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.lock().unwrap().written.clone()
    }
}

impl UpdateFlash for MockFlash {
    type Error = MockError;

    async fn begin(&mut self, total: u32) -> Result<(), Self::Error> {
        let mut state = self.state.lock().unwrap();
        state.begun = Some(total);
        state.written.clear();
        state.activated = false;
        Ok(())
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), Self::Error> {
        self.state.lock().unwrap().written.extend_from_slice(chunk);
        Ok(())
    }

    async fn activate(&mut self) -> Result<(), Self::Error> {
        self.state.lock().unwrap().activated = true;
        Ok(())
    }

    async fn abort(&mut self) {
        self.state.lock().unwrap().aborts += 1;
    }
}

#[derive(Default)]
pub struct MockRadio {
    pub peer_disconnects: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl MockRadio {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RadioControl for MockRadio {
    async fn disconnect_peer(&self) {
        self.peer_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct MockPower {
    pub restarts: AtomicUsize,
    pub deep_sleeps: AtomicUsize,
}

impl MockPower {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PowerControl for MockPower {
    fn restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    fn deep_sleep(&self) {
        self.deep_sleeps.fetch_add(1, Ordering::Relaxed);
    }
}

/// Timing shrunk so scans and polls complete in milliseconds.
pub fn test_timing() -> LinkTiming {
    LinkTiming {
        inquiry_slice: Duration::from_millis(50),
        inquiry_slices: 2,
        poll_interval: Duration::from_millis(10),
        drain_timeout: Duration::from_millis(200),
    }
}

pub fn peer(last: u8) -> PeerAddress {
    PeerAddress::new([0x10, 0x20, 0x30, 0x40, 0x50, last])
}

pub fn named(addr: PeerAddress, name: &str, rssi: i8) -> DiscoveredDevice {
    DiscoveredDevice {
        addr,
        name: Some(bounded(name)),
        rssi: Some(rssi),
    }
}

pub fn unnamed(addr: PeerAddress) -> DiscoveredDevice {
    DiscoveredDevice {
        addr,
        name: None,
        rssi: Some(-60),
    }
}

/// Wait for the next link event, failing loudly instead of hanging.
pub async fn expect_event(link: &ClassicLink<'_, MockDriver>) -> LinkEvent {
    tokio::time::timeout(std::time::Duration::from_secs(5), link.next_event())
        .await
        .expect("timed out waiting for a link event")
}

pub fn test_keys() -> (SigningKey, VerifyingKey) {
    let signing = SigningKey::from_slice(&[42u8; 32]).unwrap();
    let verifying = VerifyingKey::from(&signing);
    (signing, verifying)
}

pub fn start_msg(total: u32) -> Vec<u8> {
    let mut msg = vec![MSG_START, FORMAT_FULL_IMAGE];
    msg.extend_from_slice(&total.to_le_bytes());
    msg
}

pub fn chunk_msg(data: &[u8]) -> Vec<u8> {
    let mut msg = vec![MSG_CHUNK];
    msg.extend_from_slice(data);
    msg
}

pub fn finish_msg(signing: &SigningKey, image: &[u8]) -> Vec<u8> {
    let hash = Sha256::digest(image);
    let signature: Signature = signing.sign_prehash(hash.as_slice()).unwrap();
    let mut msg = vec![MSG_FINISH];
    msg.extend_from_slice(signature.to_der().as_bytes());
    msg
}
