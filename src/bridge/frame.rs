//! Serial frame accumulation.

use heapless::Vec;

use crate::PAYLOAD_MAX;

/// Frames end at this delimiter byte.
pub const FRAME_DELIMITER: u8 = 0x0A;

/// Largest frame forwarded to the peer, delimiter included. Equal to the
/// notification payload budget so a frame never splits across
/// notifications.
pub const FRAME_MAX: usize = PAYLOAD_MAX;

/// Accumulates serial bytes and yields one frame per delimiter.
///
/// The serial protocol is line-oriented, so the accumulator is bounded: a
/// frame that outgrows [`FRAME_MAX`] without a delimiter is dropped whole,
/// including its not-yet-seen tail.
#[derive(Default)]
pub struct FrameAccumulator {
    buf: Vec<u8, FRAME_MAX>,
    skipping: bool,
}

impl FrameAccumulator {
    pub const fn new() -> Self {
        Self {
            buf: Vec::new(),
            skipping: false,
        }
    }

    /// Consume bytes from the front of `*data` until a frame completes or
    /// the input runs dry. A returned frame includes the delimiter.
    pub fn feed(&mut self, data: &mut &[u8]) -> Option<Vec<u8, FRAME_MAX>> {
        while let Some((&byte, rest)) = data.split_first() {
            *data = rest;
            if self.skipping {
                if byte == FRAME_DELIMITER {
                    self.skipping = false;
                }
                continue;
            }
            if self.buf.push(byte).is_err() {
                warn!("bridge: serial frame over {} bytes dropped", FRAME_MAX);
                self.buf.clear();
                self.skipping = byte != FRAME_DELIMITER;
                continue;
            }
            if byte == FRAME_DELIMITER {
                let frame = self.buf.clone();
                self.buf.clear();
                return Some(frame);
            }
        }
        None
    }

    /// Bytes of the unfinished frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Drop any unfinished frame, e.g. when the serial link goes away.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.skipping = false;
    }
}
