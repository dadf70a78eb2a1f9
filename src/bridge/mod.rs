//! Control-channel bridge server.
//!
//! The server owns the protocol surface a connected phone sees: the
//! characteristic table, read/write dispatch into the engine components,
//! serial frame accumulation and the outbound notification queue. The
//! platform glue maps its radio stack onto this API: build the GATT table
//! from [`BridgeServer::characteristics`], forward peer reads, writes and
//! subscription changes, drain [`BridgeServer::next_notification`] into
//! actual radio notifications, and report peer connects and disconnects.

pub mod frame;
pub mod registry;

use core::cell::RefCell;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use heapless::Vec;

use crate::classic::{ClassicDriver, ClassicLink, LinkEvent};
use crate::config::{defaults, ConfigStore, MAX_NAME_LEN, PIN_CODE_MAX};
use crate::lifecycle::{Lifecycle, ShutdownMode};
use crate::logging::LogRelay;
use crate::monitor::ActivityTracker;
use crate::ota::{OtaEngine, OtaOutcome, UpdateFlash, STATUS_FAILED, STATUS_OK};
use crate::types::{PeerAddress, Uuid};
use crate::{Error, DEFAULT_CONNECT_RETRIES, PAYLOAD_MAX};

pub use frame::{FrameAccumulator, FRAME_DELIMITER, FRAME_MAX};
pub use registry::{
    CharacteristicDef, CharacteristicId, CharacteristicProp, CharacteristicProps, Cccd, ControlRegistry,
};

/// Slots in the control table.
pub const MAX_CHARACTERISTICS: usize = 16;

/// End-of-results marker notified on the discovery characteristic: an
/// all-zero address plus a zero signal byte.
pub const SCAN_SENTINEL: [u8; 7] = [0; 7];

const NOTIFY_QUEUE: usize = 8;

const fn bridge_uuid(short: u16) -> Uuid {
    let mut bytes = [
        0x00, 0x00, 0x00, 0x00, 0x78, 0x58, 0x48, 0xfb, 0xb7, 0x97, 0x86, 0x13, 0xe9, 0x60, 0xda, 0x6a,
    ];
    bytes[2] = (short >> 8) as u8;
    bytes[3] = (short & 0xff) as u8;
    Uuid::new_long(bytes)
}

/// UUID of the bridge control service.
pub const BRIDGE_SERVICE_UUID: Uuid = bridge_uuid(0x1000);
/// UUID of the standard battery service carrying the level characteristic.
pub const BATTERY_SERVICE_UUID: Uuid = Uuid::new_short(0x180f);

/// An outbound notification for the glue to push to the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: CharacteristicId,
    pub payload: Vec<u8, PAYLOAD_MAX>,
}

struct BridgeShared {
    frames: FrameAccumulator,
    battery_millivolts: u32,
    battery_level: u8,
    mtu: u32,
}

/// The control-channel front end over the engine components.
pub struct BridgeServer<'d, D: ClassicDriver, F: UpdateFlash, C: ConfigStore> {
    link: &'d ClassicLink<'d, D>,
    ota: &'d OtaEngine<F>,
    config: &'d C,
    relay: &'d LogRelay,
    lifecycle: &'d Lifecycle,
    activity: &'d ActivityTracker,
    registry: ControlRegistry<MAX_CHARACTERISTICS>,
    notifications: Channel<CriticalSectionRawMutex, Notification, NOTIFY_QUEUE>,
    shared: Mutex<CriticalSectionRawMutex, RefCell<BridgeShared>>,
    ready: bool,
}

impl<'d, D, F, C> BridgeServer<'d, D, F, C>
where
    D: ClassicDriver,
    F: UpdateFlash,
    C: ConfigStore,
{
    pub fn new(
        link: &'d ClassicLink<'d, D>,
        ota: &'d OtaEngine<F>,
        config: &'d C,
        relay: &'d LogRelay,
        lifecycle: &'d Lifecycle,
        activity: &'d ActivityTracker,
    ) -> Self {
        let registry = ControlRegistry::new();
        let mut ready = true;
        for def in Self::table() {
            if registry.register(def).is_err() {
                error!("bridge: control table full, control channel out of service");
                ready = false;
                break;
            }
        }
        Self {
            link,
            ota,
            config,
            relay,
            lifecycle,
            activity,
            registry,
            notifications: Channel::new(),
            shared: Mutex::new(RefCell::new(BridgeShared {
                frames: FrameAccumulator::new(),
                battery_millivolts: 0,
                battery_level: 0,
                mtu: 0,
            })),
            ready,
        }
    }

    fn table() -> [CharacteristicDef; 15] {
        use CharacteristicId::*;
        use CharacteristicProp::*;

        fn def(
            id: CharacteristicId,
            short: u16,
            props: &[CharacteristicProp],
            description: Option<&'static str>,
        ) -> CharacteristicDef {
            CharacteristicDef {
                id,
                uuid: bridge_uuid(short),
                props: props.into(),
                description,
            }
        }

        [
            def(BatteryVoltage, 0x2000, &[Read], Some("Battery Voltage (mV)")),
            def(SerialData, 0x2001, &[Write, WriteWithoutResponse, Notify], Some("Serial Data")),
            def(ScanControl, 0x2002, &[Read, Write, Notify], None),
            def(ConnectControl, 0x2003, &[Read, Write, Notify], None),
            def(DeviceName, 0x2004, &[Read, Write], None),
            def(PinCode, 0x2005, &[Write], None),
            def(PairedAddress, 0x2006, &[Read, Write], None),
            def(DebugLog, 0x2007, &[Notify], None),
            def(Restart, 0x2008, &[Write], None),
            def(FirmwareUpdate, 0x2009, &[Write, Notify], None),
            def(ConnectedIdleTimeout, 0x200a, &[Read, Write], None),
            def(DisconnectedIdleTimeout, 0x200b, &[Read, Write], None),
            def(Sleep, 0x200c, &[Write], None),
            def(MtuInfo, 0x200d, &[Read], None),
            CharacteristicDef {
                id: BatteryLevel,
                uuid: Uuid::new_short(0x2a19),
                props: (&[Read, Notify][..]).into(),
                description: None,
            },
        ]
    }

    /// Whether the control table registered fully.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Visit the characteristic definitions, e.g. to build the platform's
    /// GATT table.
    pub fn characteristics<V: FnMut(&CharacteristicDef)>(&self, visit: V) {
        self.registry.iterate(visit)
    }

    fn with_shared<R>(&self, f: impl FnOnce(&mut BridgeShared) -> R) -> R {
        self.shared.lock(|s| f(&mut s.borrow_mut()))
    }

    /// A peer connected to the control channel.
    pub fn peer_connected(&self) {
        info!("bridge: peer connected");
        self.activity.set_connected(true);
    }

    /// The peer went away. Every subscription resets to disabled before
    /// this returns; the glue resumes advertising afterwards.
    pub fn peer_disconnected(&self) {
        info!("bridge: peer disconnected");
        self.registry.reset_subscriptions();
        self.activity.set_connected(false);
    }

    /// Record a subscription change from the peer.
    pub fn set_subscription(&self, id: CharacteristicId, cccd: Cccd) {
        if !self.registry.set_cccd(id, cccd) {
            warn!("bridge: subscription change for {:?} ignored", id);
        }
        self.activity.touch();
    }

    pub fn subscription(&self, id: CharacteristicId) -> Cccd {
        self.registry.cccd(id)
    }

    /// The peer confirmed an indication.
    pub fn peer_ack(&self) {
        self.activity.touch();
    }

    /// Record the negotiated MTU for the info characteristic.
    pub fn set_mtu(&self, mtu: u32) {
        debug!("bridge: mtu {}", mtu);
        self.with_shared(|s| s.mtu = mtu);
    }

    /// Push a fresh battery sample. The level is notified to a subscribed
    /// peer; the millivolt reading backs the voltage characteristic.
    pub fn update_battery(&self, level: u8, millivolts: u32) {
        self.with_shared(|s| {
            s.battery_level = level;
            s.battery_millivolts = millivolts;
        });
        self.try_notify(CharacteristicId::BatteryLevel, &[level]);
    }

    fn subscribed(&self, id: CharacteristicId) -> bool {
        let cccd = self.registry.cccd(id);
        cccd.notifications_enabled() || cccd.indications_enabled()
    }

    async fn notify(&self, id: CharacteristicId, payload: &[u8]) {
        if !self.subscribed(id) {
            return;
        }
        let Ok(payload) = Vec::from_slice(payload) else {
            warn!("bridge: oversized notification for {:?} dropped", id);
            return;
        };
        self.notifications.send(Notification { id, payload }).await;
    }

    fn try_notify(&self, id: CharacteristicId, payload: &[u8]) {
        if !self.subscribed(id) {
            return;
        }
        let Ok(payload) = Vec::from_slice(payload) else {
            return;
        };
        let _ = self.notifications.try_send(Notification { id, payload });
    }

    /// Next outbound notification.
    pub async fn next_notification(&self) -> Notification {
        self.notifications.receive().await
    }

    /// Non-blocking variant of [`Self::next_notification`].
    pub fn try_next_notification(&self) -> Option<Notification> {
        self.notifications.try_receive().ok()
    }

    fn scan_state_byte(&self) -> u8 {
        if self.link.is_scanning() {
            1
        } else if self.link.can_scan() {
            0
        } else {
            0xff
        }
    }

    /// Serve a characteristic read. Returns the number of bytes written
    /// into `buf`.
    pub async fn handle_read(&self, id: CharacteristicId, buf: &mut [u8]) -> Result<usize, Error<D::Error>> {
        if !self.ready {
            return Err(Error::NotReady);
        }
        let props = self.registry.props(id).ok_or(Error::NotFound)?;
        if !props.readable() {
            return Err(Error::NotPermitted);
        }
        self.activity.touch();

        let mut value: Vec<u8, PAYLOAD_MAX> = Vec::new();
        match id {
            CharacteristicId::ScanControl => {
                let _ = value.push(self.scan_state_byte());
            }
            CharacteristicId::ConnectControl => {
                let byte = if self.link.is_connected() {
                    1
                } else if self.config.paired_address().await.is_none() {
                    0xff
                } else {
                    0
                };
                let _ = value.push(byte);
            }
            CharacteristicId::DeviceName => {
                let name = self.config.name().await.unwrap_or_else(crate::config::default_name);
                let _ = value.extend_from_slice(name.as_bytes());
            }
            CharacteristicId::PairedAddress => {
                if let Some(addr) = self.config.paired_address().await {
                    let _ = value.extend_from_slice(addr.as_ref());
                    if let Some(name) = self.config.paired_name().await {
                        let _ = value.extend_from_slice(name.as_bytes());
                    }
                }
            }
            CharacteristicId::ConnectedIdleTimeout => {
                let secs = self
                    .config
                    .connected_idle_secs()
                    .await
                    .unwrap_or(defaults::CONNECTED_IDLE_SECS);
                let _ = value.extend_from_slice(&secs.to_le_bytes());
            }
            CharacteristicId::DisconnectedIdleTimeout => {
                let secs = self
                    .config
                    .disconnected_idle_secs()
                    .await
                    .unwrap_or(defaults::DISCONNECTED_IDLE_SECS);
                let _ = value.extend_from_slice(&secs.to_le_bytes());
            }
            CharacteristicId::BatteryVoltage => {
                let millivolts = self.with_shared(|s| s.battery_millivolts);
                let _ = value.extend_from_slice(&millivolts.to_le_bytes());
            }
            CharacteristicId::BatteryLevel => {
                let _ = value.push(self.with_shared(|s| s.battery_level));
            }
            CharacteristicId::MtuInfo => {
                let mtu = self.with_shared(|s| s.mtu);
                let _ = value.extend_from_slice(&mtu.to_le_bytes());
            }
            _ => return Err(Error::NotPermitted),
        }

        if buf.len() < value.len() {
            return Err(Error::InvalidValue);
        }
        buf[..value.len()].copy_from_slice(&value);
        Ok(value.len())
    }

    /// Apply a characteristic write from the peer.
    pub async fn handle_write(&self, id: CharacteristicId, data: &[u8]) -> Result<(), Error<D::Error>> {
        if !self.ready {
            return Err(Error::NotReady);
        }
        let props = self.registry.props(id).ok_or(Error::NotFound)?;
        if !props.writable() {
            return Err(Error::NotPermitted);
        }
        self.activity.touch();

        match id {
            CharacteristicId::SerialData => {
                // The peer's write succeeds either way; a missing serial
                // link swallows the bytes.
                match self.link.write(data).await {
                    Ok(()) | Err(Error::NotConnected) => {}
                    Err(_) => warn!("bridge: serial write failed"),
                }
                Ok(())
            }
            CharacteristicId::ScanControl => {
                let first = *data.first().ok_or(Error::InvalidValue)?;
                if first == 0 {
                    self.link.cancel_scan();
                } else if !self.link.scan() {
                    // The peer must not wait on a scan that can never run.
                    warn!("bridge: discovery no longer available");
                    self.notify(CharacteristicId::ScanControl, &SCAN_SENTINEL).await;
                }
                Ok(())
            }
            CharacteristicId::ConnectControl => {
                let first = *data.first().ok_or(Error::InvalidValue)?;
                if first == 0 {
                    self.link.disconnect();
                } else {
                    match self.config.paired_address().await {
                        Some(addr) => self.link.connect(addr, DEFAULT_CONNECT_RETRIES),
                        None => warn!("bridge: connect requested without a paired address"),
                    }
                }
                Ok(())
            }
            CharacteristicId::DeviceName => {
                let name = core::str::from_utf8(data).map_err(|_| Error::InvalidValue)?;
                if name.is_empty() || name.len() > MAX_NAME_LEN {
                    return Err(Error::InvalidValue);
                }
                if self.config.set_name(name).await.is_err() {
                    warn!("bridge: device name not stored");
                } else {
                    info!("bridge: device name updated");
                }
                Ok(())
            }
            CharacteristicId::PinCode => {
                if data.len() != 4 {
                    return Err(Error::InvalidValue);
                }
                let pin = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                if pin > PIN_CODE_MAX {
                    return Err(Error::InvalidValue);
                }
                if self.config.set_pin_code(pin).await.is_err() {
                    warn!("bridge: pin code not stored");
                }
                Ok(())
            }
            CharacteristicId::PairedAddress => {
                if data.is_empty() {
                    info!("bridge: paired device cleared");
                    if self.config.set_paired_address(None).await.is_err()
                        || self.config.set_paired_name(None).await.is_err()
                    {
                        warn!("bridge: paired device not cleared");
                    }
                    return Ok(());
                }
                let addr = PeerAddress::from_slice(data).ok_or(Error::InvalidValue)?;
                let name = if data.len() > 6 {
                    let name = core::str::from_utf8(&data[6..]).map_err(|_| Error::InvalidValue)?;
                    if name.len() > MAX_NAME_LEN {
                        return Err(Error::InvalidValue);
                    }
                    Some(name)
                } else {
                    None
                };
                info!("bridge: paired device set to {:?}", addr);
                if self.config.set_paired_address(Some(addr)).await.is_err()
                    || self.config.set_paired_name(name).await.is_err()
                {
                    warn!("bridge: paired device not stored");
                }
                Ok(())
            }
            CharacteristicId::ConnectedIdleTimeout => {
                let secs = parse_u32(data)?;
                if self.config.set_connected_idle_secs(secs).await.is_err() {
                    warn!("bridge: idle timeout not stored");
                }
                Ok(())
            }
            CharacteristicId::DisconnectedIdleTimeout => {
                let secs = parse_u32(data)?;
                if self.config.set_disconnected_idle_secs(secs).await.is_err() {
                    warn!("bridge: idle timeout not stored");
                }
                Ok(())
            }
            CharacteristicId::Restart => {
                if data.len() != 1 {
                    return Err(Error::InvalidValue);
                }
                let erase_config = data[0] != 0;
                info!("bridge: restart requested (erase: {})", erase_config);
                self.lifecycle.request(ShutdownMode::Restart { erase_config });
                Ok(())
            }
            CharacteristicId::Sleep => {
                info!("bridge: sleep requested");
                self.lifecycle.request(ShutdownMode::DeepSleep);
                Ok(())
            }
            CharacteristicId::FirmwareUpdate => {
                let result = self.ota.handle_message(data).await;
                let status = if result.is_ok() { STATUS_OK } else { STATUS_FAILED };
                self.notify(CharacteristicId::FirmwareUpdate, &[status]).await;
                if let Ok(OtaOutcome::Complete) = result {
                    self.lifecycle.request(ShutdownMode::Restart { erase_config: false });
                }
                Ok(())
            }
            _ => Err(Error::NotPermitted),
        }
    }

    /// Pump link events and relayed log lines into notifications. Runs
    /// forever alongside the link worker.
    pub async fn run(&self) -> ! {
        loop {
            match select(self.link.next_event(), self.relay.next_line()).await {
                Either::First(event) => self.on_link_event(event).await,
                Either::Second(line) => {
                    // Log traffic deliberately never touches the activity
                    // clock; a chatty logger must not keep the bridge awake.
                    self.notify(CharacteristicId::DebugLog, line.as_bytes()).await;
                }
            }
        }
    }

    async fn on_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Discovered(device) => {
                let mut payload: Vec<u8, PAYLOAD_MAX> = Vec::new();
                let _ = payload.extend_from_slice(device.addr.as_ref());
                let _ = payload.push(device.rssi.unwrap_or(0) as u8);
                if let Some(name) = &device.name {
                    let _ = payload.extend_from_slice(name.as_bytes());
                }
                self.notify(CharacteristicId::ScanControl, &payload).await;
            }
            LinkEvent::ScanFinished { canceled } => {
                info!("bridge: discovery finished (canceled: {})", canceled);
                self.notify(CharacteristicId::ScanControl, &SCAN_SENTINEL).await;
            }
            LinkEvent::ConnectAttempt { attempt, count } => {
                info!("bridge: connect attempt {} of {}", attempt, count);
            }
            LinkEvent::LinkChanged { up } => {
                info!("bridge: serial link {}", if up { "up" } else { "down" });
                // A partial frame never crosses link sessions.
                self.with_shared(|s| s.frames.clear());
                self.notify(CharacteristicId::ConnectControl, &[up as u8]).await;
            }
            LinkEvent::Inbound(chunk) => {
                let mut rest: &[u8] = &chunk;
                loop {
                    let frame = self.with_shared(|s| s.frames.feed(&mut rest));
                    match frame {
                        Some(frame) => self.notify(CharacteristicId::SerialData, &frame).await,
                        None => break,
                    }
                }
            }
        }
    }
}

fn parse_u32<E>(data: &[u8]) -> Result<u32, Error<E>> {
    if data.len() != 4 {
        return Err(Error::InvalidValue);
    }
    Ok(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
}
