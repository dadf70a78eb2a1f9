#![cfg_attr(not(test), no_std)]
#![allow(async_fn_in_trait)]

pub(crate) const CONTROL_MTU: usize = 247;
/// Largest payload carried in a single control-channel notification.
pub const PAYLOAD_MAX: usize = CONTROL_MTU - 3;

/// Connect attempts made for one connection request.
pub const DEFAULT_CONNECT_RETRIES: u8 = 5;

mod fmt;

pub mod types;

pub mod bridge;
pub mod classic;
pub mod config;
pub mod lifecycle;
pub mod logging;
pub mod monitor;
pub mod ota;

/// Engine errors, generic over the classic driver error.
#[derive(Debug, PartialEq, Eq)]
pub enum Error<E> {
    /// The classic link is not up.
    NotConnected,
    /// The characteristic's properties forbid the access.
    NotPermitted,
    /// The control table failed to register; the channel is out of service.
    NotReady,
    /// Malformed or out-of-range value in a characteristic write.
    InvalidValue,
    /// No characteristic with the given identity.
    NotFound,
    Driver(E),
}

#[cfg(feature = "defmt")]
impl<E> defmt::Format for Error<E>
where
    E: defmt::Format,
{
    fn format(&self, fmt: defmt::Formatter) {
        match self {
            Error::NotConnected => {
                defmt::write!(fmt, "NotConnected")
            }
            Error::NotPermitted => {
                defmt::write!(fmt, "NotPermitted")
            }
            Error::NotReady => {
                defmt::write!(fmt, "NotReady")
            }
            Error::InvalidValue => {
                defmt::write!(fmt, "InvalidValue")
            }
            Error::NotFound => {
                defmt::write!(fmt, "NotFound")
            }
            Error::Driver(value) => {
                defmt::write!(fmt, "Driver({})", value)
            }
        }
    }
}
