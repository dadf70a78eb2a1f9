//! Persisted bridge configuration.
//!
//! The engine never talks to storage directly. The platform provides a
//! [`ConfigStore`] over whatever medium it has (NVS, flash pages, a file);
//! getters return `None` for keys that were never written and the engine
//! applies the factory [`defaults`].

use heapless::String;

use crate::types::PeerAddress;

/// Longest stored device or peer name, in bytes.
pub const MAX_NAME_LEN: usize = 32;

/// Largest value accepted for the pairing PIN.
pub const PIN_CODE_MAX: u32 = 999_999;

/// Factory defaults applied when a key has never been written.
pub mod defaults {
    pub const NAME: &str = "X1 Bridge";
    pub const PIN_CODE: u32 = 123_456;
    pub const CONNECTED_IDLE_SECS: u32 = 900;
    pub const DISCONNECTED_IDLE_SECS: u32 = 300;
}

/// The advertised name used when none was ever stored.
pub fn default_name() -> String<MAX_NAME_LEN> {
    let mut name = String::new();
    let _ = name.push_str(defaults::NAME);
    name
}

/// Key-value store for the bridge's persisted settings.
///
/// Implementations are internally synchronized; the engine calls `&self`
/// methods from the dispatch task and the workers.
pub trait ConfigStore {
    type Error: core::fmt::Debug;

    /// Advertised device name.
    async fn name(&self) -> Option<String<MAX_NAME_LEN>>;
    async fn set_name(&self, name: &str) -> Result<(), Self::Error>;

    /// Pairing PIN, at most [`PIN_CODE_MAX`].
    async fn pin_code(&self) -> Option<u32>;
    async fn set_pin_code(&self, pin: u32) -> Result<(), Self::Error>;

    /// Address of the paired serial device.
    async fn paired_address(&self) -> Option<PeerAddress>;
    /// Store or clear the paired device address.
    async fn set_paired_address(&self, addr: Option<PeerAddress>) -> Result<(), Self::Error>;

    /// Display name recorded alongside the paired address.
    async fn paired_name(&self) -> Option<String<MAX_NAME_LEN>>;
    async fn set_paired_name(&self, name: Option<&str>) -> Result<(), Self::Error>;

    /// Seconds a connected but idle client is tolerated.
    async fn connected_idle_secs(&self) -> Option<u32>;
    async fn set_connected_idle_secs(&self, secs: u32) -> Result<(), Self::Error>;

    /// Seconds without any client before the bridge powers down.
    async fn disconnected_idle_secs(&self) -> Option<u32>;
    async fn set_disconnected_idle_secs(&self, secs: u32) -> Result<(), Self::Error>;

    /// Erase every stored key, restoring factory defaults.
    async fn reset(&self) -> Result<(), Self::Error>;
}
