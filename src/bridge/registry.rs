//! Control-channel characteristic registry.
//!
//! The registry replaces per-characteristic callback objects with a flat,
//! capability-tagged table: identity, UUID, properties, optional user
//! description and the peer's subscription flags. Dispatch is a match over
//! [`CharacteristicId`]; the table answers what an identity is allowed to
//! do and whether the peer asked to be notified.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use heapless::Vec;

use crate::types::Uuid;

/// Identity of a control-channel characteristic.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacteristicId {
    BatteryVoltage,
    SerialData,
    ScanControl,
    ConnectControl,
    DeviceName,
    PinCode,
    PairedAddress,
    DebugLog,
    Restart,
    FirmwareUpdate,
    ConnectedIdleTimeout,
    DisconnectedIdleTimeout,
    Sleep,
    MtuInfo,
    BatteryLevel,
}

/// Characteristic properties.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub enum CharacteristicProp {
    Broadcast = 0x01,
    Read = 0x02,
    WriteWithoutResponse = 0x04,
    Write = 0x08,
    Notify = 0x10,
    Indicate = 0x20,
}

/// A bitfield of [`CharacteristicProp`].
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicProps(u8);

impl<'a> From<&'a [CharacteristicProp]> for CharacteristicProps {
    fn from(props: &'a [CharacteristicProp]) -> Self {
        let mut val: u8 = 0;
        for prop in props {
            val |= *prop as u8;
        }
        Self(val)
    }
}

impl CharacteristicProps {
    pub fn any(&self, props: &[CharacteristicProp]) -> bool {
        for p in props {
            if (*p as u8) & self.0 != 0 {
                return true;
            }
        }
        false
    }

    pub fn readable(&self) -> bool {
        self.any(&[CharacteristicProp::Read])
    }

    pub fn writable(&self) -> bool {
        self.any(&[CharacteristicProp::Write, CharacteristicProp::WriteWithoutResponse])
    }

    pub fn notifiable(&self) -> bool {
        self.any(&[CharacteristicProp::Notify, CharacteristicProp::Indicate])
    }

    pub fn raw(&self) -> u8 {
        self.0
    }
}

/// Per-characteristic client subscription flags, mirroring the standard
/// client configuration descriptor layout.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cccd(u16);

impl Cccd {
    const NOTIFY: u16 = 0x0001;
    const INDICATE: u16 = 0x0002;

    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn notifications() -> Self {
        Self(Self::NOTIFY)
    }

    pub fn raw(&self) -> u16 {
        self.0
    }

    pub fn notifications_enabled(&self) -> bool {
        self.0 & Self::NOTIFY != 0
    }

    pub fn indications_enabled(&self) -> bool {
        self.0 & Self::INDICATE != 0
    }

    pub fn disable(&mut self) {
        self.0 = 0;
    }
}

/// Static description of one characteristic.
#[derive(Debug, Clone)]
pub struct CharacteristicDef {
    pub id: CharacteristicId,
    pub uuid: Uuid,
    pub props: CharacteristicProps,
    /// Content for a user-description descriptor, when the original
    /// firmware shipped one.
    pub description: Option<&'static str>,
}

/// Registration failed: every slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableFull;

pub struct ControlRegistry<const MAX: usize> {
    entries: Mutex<CriticalSectionRawMutex, RefCell<Vec<Entry, MAX>>>,
}

struct Entry {
    def: CharacteristicDef,
    cccd: Cccd,
}

impl<const MAX: usize> ControlRegistry<MAX> {
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(RefCell::new(Vec::new())),
        }
    }

    pub fn register(&self, def: CharacteristicDef) -> Result<(), TableFull> {
        self.entries.lock(|entries| {
            entries
                .borrow_mut()
                .push(Entry {
                    def,
                    cccd: Cccd::default(),
                })
                .map(|_| ())
                .map_err(|_| TableFull)
        })
    }

    /// Visit every registered characteristic, in registration order.
    pub fn iterate<F: FnMut(&CharacteristicDef)>(&self, mut f: F) {
        self.entries.lock(|entries| {
            for entry in entries.borrow().iter() {
                f(&entry.def);
            }
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock(|entries| entries.borrow().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn props(&self, id: CharacteristicId) -> Option<CharacteristicProps> {
        self.entries.lock(|entries| {
            entries.borrow().iter().find(|e| e.def.id == id).map(|e| e.def.props)
        })
    }

    /// Record the peer's subscription flags. Returns whether the
    /// characteristic exists and supports them.
    pub fn set_cccd(&self, id: CharacteristicId, cccd: Cccd) -> bool {
        self.entries.lock(|entries| {
            let mut entries = entries.borrow_mut();
            match entries.iter_mut().find(|e| e.def.id == id) {
                Some(entry) if entry.def.props.notifiable() => {
                    entry.cccd = cccd;
                    true
                }
                _ => false,
            }
        })
    }

    pub fn cccd(&self, id: CharacteristicId) -> Cccd {
        self.entries.lock(|entries| {
            entries
                .borrow()
                .iter()
                .find(|e| e.def.id == id)
                .map(|e| e.cccd)
                .unwrap_or_default()
        })
    }

    /// Disable every subscription, as on a peer disconnect.
    pub fn reset_subscriptions(&self) {
        self.entries.lock(|entries| {
            for entry in entries.borrow_mut().iter_mut() {
                entry.cccd.disable();
            }
        })
    }
}
