//! Classic radio driver interface.

use heapless::String;

use crate::config::MAX_NAME_LEN;
use crate::types::PeerAddress;

/// A device reported during discovery. Results are forwarded to the peer
/// and never stored.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub addr: PeerAddress,
    pub name: Option<String<MAX_NAME_LEN>>,
    pub rssi: Option<i8>,
}

/// Interface to the platform's Bluetooth Classic stack.
///
/// Implementations are internally synchronized: the engine calls `&self`
/// methods concurrently from the link worker and the dispatch task.
pub trait ClassicDriver: embedded_io_async::ErrorType {
    /// Start a device inquiry. Results are consumed via [`Self::discovered`].
    async fn start_inquiry(&self) -> Result<(), Self::Error>;

    /// Stop an ongoing inquiry. Idempotent.
    async fn stop_inquiry(&self) -> Result<(), Self::Error>;

    /// Drop the stack's inquiry result cache so already-seen devices are
    /// reported again.
    async fn clear_inquiry_cache(&self) -> Result<(), Self::Error>;

    /// Wait for the next inquiry result.
    async fn discovered(&self) -> Result<DiscoveredDevice, Self::Error>;

    /// One bounded connection attempt. An error is a failed attempt; the
    /// caller decides whether to retry.
    async fn connect(&self, addr: PeerAddress) -> Result<(), Self::Error>;

    /// Tear the link down. Idempotent.
    async fn disconnect(&self) -> Result<(), Self::Error>;

    /// Whether the stack currently reports a live link.
    fn link_up(&self) -> bool;

    /// Write bytes to the connected peer.
    async fn write(&self, data: &[u8]) -> Result<(), Self::Error>;

    /// Read up to `buf.len()` bytes from the peer. `Ok(0)` means the peer
    /// closed the stream.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, Self::Error>;
}
