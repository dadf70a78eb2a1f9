//! Small wire-level types shared across the engine.

pub mod uuid;

pub use uuid::Uuid;

/// A 6-byte Bluetooth Classic device address.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PeerAddress([u8; 6]);

impl PeerAddress {
    /// Create an address from raw bytes.
    pub const fn new(raw: [u8; 6]) -> Self {
        Self(raw)
    }

    /// The raw address bytes.
    pub const fn raw(&self) -> [u8; 6] {
        self.0
    }

    /// Parse an address from the start of a slice.
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        if data.len() < 6 {
            return None;
        }
        let mut raw = [0; 6];
        raw.copy_from_slice(&data[..6]);
        Some(Self(raw))
    }
}

impl From<[u8; 6]> for PeerAddress {
    fn from(raw: [u8; 6]) -> Self {
        Self(raw)
    }
}

impl AsRef<[u8]> for PeerAddress {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl core::fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_from_short_slice_is_rejected() {
        assert!(PeerAddress::from_slice(&[1, 2, 3]).is_none());
    }

    #[test]
    fn address_roundtrip() {
        let addr = PeerAddress::from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0x42]).unwrap();
        assert_eq!(addr.raw(), [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    }
}
