//! Firmware update session.
//!
//! Updates arrive as Start/Chunk/Finish messages on the firmware-update
//! characteristic. Image bytes stream straight to the update partition
//! while a rolling SHA-256 digest accumulates; Finish carries a DER-encoded
//! ECDSA P-256 signature over that digest, checked against the release key
//! baked into the firmware. Only a fully-written, correctly-signed image is
//! activated. After [`OtaOutcome::Complete`] the caller is expected to
//! schedule a restart so the new image boots.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::Signature;
use sha2::{Digest, Sha256};

pub use p256::ecdsa::VerifyingKey;

/// Message types on the update characteristic.
pub const MSG_START: u8 = 1;
pub const MSG_CHUNK: u8 = 2;
pub const MSG_FINISH: u8 = 3;

/// The only image format tag understood by this build.
pub const FORMAT_FULL_IMAGE: u8 = 1;

/// Status byte notified after a message was applied.
pub const STATUS_OK: u8 = 1;
/// Status byte notified after a message was rejected or the session died.
pub const STATUS_FAILED: u8 = 0;

/// Interface to the update partition.
pub trait UpdateFlash {
    type Error: core::fmt::Debug;

    /// Open the partition for an image of `total` bytes.
    async fn begin(&mut self, total: u32) -> Result<(), Self::Error>;

    /// Append image bytes.
    async fn write(&mut self, chunk: &[u8]) -> Result<(), Self::Error>;

    /// Mark the fully-written image bootable.
    async fn activate(&mut self) -> Result<(), Self::Error>;

    /// Discard a partially-written image. Idempotent.
    async fn abort(&mut self);
}

/// Why a message was rejected or a session died.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaError {
    /// Empty message or unknown message type.
    BadMessage,
    /// Start carried a format tag this build does not understand.
    UnsupportedFormat,
    /// Start declared a zero-byte image.
    EmptyImage,
    /// Chunk or Finish without an active session.
    NoSession,
    /// More bytes arrived than the declared total.
    Overflow,
    /// Finish before all declared bytes arrived.
    SizeMismatch,
    /// Signature malformed or not matching the digest.
    Signature,
    /// The update partition rejected an operation.
    Storage,
}

/// Session phase, exposed for diagnostics and tests.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaPhase {
    Idle,
    Receiving,
    Verifying,
    Complete,
    Failed,
}

/// Outcome of an accepted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaOutcome {
    Accepted,
    /// The image is verified and activated; schedule the reboot.
    Complete,
}

enum SessionState {
    Idle,
    Receiving { total: u32, written: u32, digest: Sha256 },
    Verifying,
    Complete,
    Failed,
}

struct Inner<F: UpdateFlash> {
    flash: F,
    state: SessionState,
}

/// The firmware update engine. Messages are serialized behind an async
/// mutex, so racing writers cannot interleave a session.
pub struct OtaEngine<F: UpdateFlash> {
    inner: Mutex<CriticalSectionRawMutex, Inner<F>>,
    key: VerifyingKey,
}

impl<F: UpdateFlash> OtaEngine<F> {
    pub fn new(flash: F, key: VerifyingKey) -> Self {
        Self {
            inner: Mutex::new(Inner {
                flash,
                state: SessionState::Idle,
            }),
            key,
        }
    }

    /// Parse and apply one message from the peer. The caller notifies the
    /// mapped status byte ([`STATUS_OK`] / [`STATUS_FAILED`]).
    pub async fn handle_message(&self, msg: &[u8]) -> Result<OtaOutcome, OtaError> {
        let mut inner = self.inner.lock().await;
        let result = match msg.split_first() {
            Some((&MSG_START, body)) => self.start(&mut inner, body).await,
            Some((&MSG_CHUNK, body)) => self.chunk(&mut inner, body).await,
            Some((&MSG_FINISH, body)) => self.finish(&mut inner, body).await,
            _ => Err(OtaError::BadMessage),
        };
        if let Err(reason) = result {
            warn!("ota: message rejected: {:?}", reason);
        }
        result
    }

    pub async fn phase(&self) -> OtaPhase {
        match self.inner.lock().await.state {
            SessionState::Idle => OtaPhase::Idle,
            SessionState::Receiving { .. } => OtaPhase::Receiving,
            SessionState::Verifying => OtaPhase::Verifying,
            SessionState::Complete => OtaPhase::Complete,
            SessionState::Failed => OtaPhase::Failed,
        }
    }

    async fn start(&self, inner: &mut Inner<F>, body: &[u8]) -> Result<OtaOutcome, OtaError> {
        if body.len() < 5 {
            return Err(OtaError::BadMessage);
        }
        let format = body[0];
        let total = u32::from_le_bytes([body[1], body[2], body[3], body[4]]);
        if format != FORMAT_FULL_IMAGE {
            return Err(OtaError::UnsupportedFormat);
        }
        if total == 0 {
            return Err(OtaError::EmptyImage);
        }
        if matches!(inner.state, SessionState::Receiving { .. }) {
            // A restarted uploader gets a clean slate instead of a wedge.
            info!("ota: replacing an in-flight session");
            inner.flash.abort().await;
            inner.state = SessionState::Idle;
        }
        if inner.flash.begin(total).await.is_err() {
            warn!("ota: update partition unavailable");
            return Err(OtaError::Storage);
        }
        info!("ota: session started, {} bytes", total);
        inner.state = SessionState::Receiving {
            total,
            written: 0,
            digest: Sha256::new(),
        };
        Ok(OtaOutcome::Accepted)
    }

    async fn chunk(&self, inner: &mut Inner<F>, body: &[u8]) -> Result<OtaOutcome, OtaError> {
        let (total, written) = match &inner.state {
            SessionState::Receiving { total, written, .. } => (*total, *written),
            _ => return Err(OtaError::NoSession),
        };
        if body.is_empty() {
            return Err(OtaError::BadMessage);
        }
        if written as u64 + body.len() as u64 > total as u64 {
            warn!("ota: {} bytes past the declared {}, aborting", body.len(), total);
            inner.flash.abort().await;
            inner.state = SessionState::Failed;
            return Err(OtaError::Overflow);
        }
        if inner.flash.write(body).await.is_err() {
            error!("ota: flash write failed, aborting");
            inner.flash.abort().await;
            inner.state = SessionState::Failed;
            return Err(OtaError::Storage);
        }
        if let SessionState::Receiving { written, digest, .. } = &mut inner.state {
            digest.update(body);
            *written += body.len() as u32;
        }
        Ok(OtaOutcome::Accepted)
    }

    async fn finish(&self, inner: &mut Inner<F>, body: &[u8]) -> Result<OtaOutcome, OtaError> {
        match core::mem::replace(&mut inner.state, SessionState::Verifying) {
            SessionState::Receiving { total, written, digest } => {
                if written != total {
                    warn!("ota: finish at {} of {} bytes", written, total);
                    inner.flash.abort().await;
                    inner.state = SessionState::Failed;
                    return Err(OtaError::SizeMismatch);
                }
                let hash = digest.finalize();
                let Ok(signature) = Signature::from_der(body) else {
                    inner.flash.abort().await;
                    inner.state = SessionState::Failed;
                    return Err(OtaError::Signature);
                };
                if self.key.verify_prehash(hash.as_slice(), &signature).is_err() {
                    warn!("ota: signature rejected");
                    inner.flash.abort().await;
                    inner.state = SessionState::Failed;
                    return Err(OtaError::Signature);
                }
                if inner.flash.activate().await.is_err() {
                    error!("ota: image activation failed");
                    inner.flash.abort().await;
                    inner.state = SessionState::Failed;
                    return Err(OtaError::Storage);
                }
                info!("ota: image verified and activated");
                inner.state = SessionState::Complete;
                Ok(OtaOutcome::Complete)
            }
            other => {
                inner.state = other;
                Err(OtaError::NoSession)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use core::cell::RefCell;
    use std::rc::Rc;
    use std::vec::Vec;

    use embassy_futures::block_on;
    use p256::ecdsa::signature::hazmat::PrehashSigner;
    use p256::ecdsa::SigningKey;

    use super::*;

    #[derive(Default)]
    struct FlashState {
        begun: Option<u32>,
        written: Vec<u8>,
        activated: bool,
        aborts: u32,
        fail_begin: bool,
        fail_write: bool,
    }

    #[derive(Clone, Default)]
    struct MockFlash(Rc<RefCell<FlashState>>);

    impl UpdateFlash for MockFlash {
        type Error = ();

        async fn begin(&mut self, total: u32) -> Result<(), ()> {
            let mut st = self.0.borrow_mut();
            if st.fail_begin {
                return Err(());
            }
            st.begun = Some(total);
            st.written.clear();
            st.activated = false;
            Ok(())
        }

        async fn write(&mut self, chunk: &[u8]) -> Result<(), ()> {
            let mut st = self.0.borrow_mut();
            if st.fail_write {
                return Err(());
            }
            st.written.extend_from_slice(chunk);
            Ok(())
        }

        async fn activate(&mut self) -> Result<(), ()> {
            self.0.borrow_mut().activated = true;
            Ok(())
        }

        async fn abort(&mut self) {
            self.0.borrow_mut().aborts += 1;
        }
    }

    fn keys() -> (SigningKey, VerifyingKey) {
        let signing = SigningKey::from_slice(&[7u8; 32]).unwrap();
        let verifying = VerifyingKey::from(&signing);
        (signing, verifying)
    }

    fn engine() -> (OtaEngine<MockFlash>, MockFlash, SigningKey) {
        let (signing, verifying) = keys();
        let flash = MockFlash::default();
        (OtaEngine::new(flash.clone(), verifying), flash, signing)
    }

    fn start_msg(total: u32) -> Vec<u8> {
        let mut msg = vec![MSG_START, FORMAT_FULL_IMAGE];
        msg.extend_from_slice(&total.to_le_bytes());
        msg
    }

    fn chunk_msg(data: &[u8]) -> Vec<u8> {
        let mut msg = vec![MSG_CHUNK];
        msg.extend_from_slice(data);
        msg
    }

    fn finish_msg(signing: &SigningKey, image: &[u8]) -> Vec<u8> {
        let hash = Sha256::digest(image);
        let signature: Signature = signing.sign_prehash(hash.as_slice()).unwrap();
        let mut msg = vec![MSG_FINISH];
        msg.extend_from_slice(signature.to_der().as_bytes());
        msg
    }

    #[test]
    fn start_requires_known_format() {
        let (engine, flash, _) = engine();
        let mut msg = start_msg(64);
        msg[1] = 2;
        let err = block_on(engine.handle_message(&msg)).unwrap_err();
        assert_eq!(err, OtaError::UnsupportedFormat);
        assert_eq!(block_on(engine.phase()), OtaPhase::Idle);
        assert!(flash.0.borrow().begun.is_none());
    }

    #[test]
    fn start_rejects_empty_image() {
        let (engine, _, _) = engine();
        let err = block_on(engine.handle_message(&start_msg(0))).unwrap_err();
        assert_eq!(err, OtaError::EmptyImage);
        assert_eq!(block_on(engine.phase()), OtaPhase::Idle);
    }

    #[test]
    fn chunk_without_session_is_rejected() {
        let (engine, _, _) = engine();
        let err = block_on(engine.handle_message(&chunk_msg(b"data"))).unwrap_err();
        assert_eq!(err, OtaError::NoSession);
    }

    #[test]
    fn happy_path_multi_chunk() {
        let (engine, flash, signing) = engine();
        let image: Vec<u8> = (0..100u8).collect();
        assert_eq!(
            block_on(engine.handle_message(&start_msg(100))).unwrap(),
            OtaOutcome::Accepted
        );
        assert_eq!(
            block_on(engine.handle_message(&chunk_msg(&image[..60]))).unwrap(),
            OtaOutcome::Accepted
        );
        assert_eq!(
            block_on(engine.handle_message(&chunk_msg(&image[60..]))).unwrap(),
            OtaOutcome::Accepted
        );
        assert_eq!(
            block_on(engine.handle_message(&finish_msg(&signing, &image))).unwrap(),
            OtaOutcome::Complete
        );
        assert_eq!(block_on(engine.phase()), OtaPhase::Complete);
        let st = flash.0.borrow();
        assert_eq!(st.begun, Some(100));
        assert_eq!(st.written, image);
        assert!(st.activated);
        assert_eq!(st.aborts, 0);
    }

    #[test]
    fn overflow_fails_the_session() {
        let (engine, flash, _) = engine();
        block_on(engine.handle_message(&start_msg(100))).unwrap();
        let big: Vec<u8> = (0..110u8).collect();
        let err = block_on(engine.handle_message(&chunk_msg(&big))).unwrap_err();
        assert_eq!(err, OtaError::Overflow);
        assert_eq!(block_on(engine.phase()), OtaPhase::Failed);
        assert_eq!(flash.0.borrow().aborts, 1);
        // Everything but a fresh Start is now rejected.
        let err = block_on(engine.handle_message(&chunk_msg(b"x"))).unwrap_err();
        assert_eq!(err, OtaError::NoSession);
        let err = block_on(engine.handle_message(&[MSG_FINISH, 0])).unwrap_err();
        assert_eq!(err, OtaError::NoSession);
    }

    #[test]
    fn finish_with_missing_bytes_fails() {
        let (engine, _, signing) = engine();
        let image: Vec<u8> = (0..100u8).collect();
        block_on(engine.handle_message(&start_msg(100))).unwrap();
        block_on(engine.handle_message(&chunk_msg(&image[..60]))).unwrap();
        let err = block_on(engine.handle_message(&finish_msg(&signing, &image))).unwrap_err();
        assert_eq!(err, OtaError::SizeMismatch);
        assert_eq!(block_on(engine.phase()), OtaPhase::Failed);
    }

    #[test]
    fn wrong_key_is_rejected() {
        let (engine, flash, _) = engine();
        let rogue = SigningKey::from_slice(&[9u8; 32]).unwrap();
        let image = [0xabu8; 32];
        block_on(engine.handle_message(&start_msg(32))).unwrap();
        block_on(engine.handle_message(&chunk_msg(&image))).unwrap();
        let err = block_on(engine.handle_message(&finish_msg(&rogue, &image))).unwrap_err();
        assert_eq!(err, OtaError::Signature);
        assert_eq!(block_on(engine.phase()), OtaPhase::Failed);
        let st = flash.0.borrow();
        assert!(!st.activated);
        assert_eq!(st.aborts, 1);
    }

    #[test]
    fn garbage_signature_is_rejected() {
        let (engine, _, _) = engine();
        let image = [1u8; 8];
        block_on(engine.handle_message(&start_msg(8))).unwrap();
        block_on(engine.handle_message(&chunk_msg(&image))).unwrap();
        let err = block_on(engine.handle_message(&[MSG_FINISH, 1, 2, 3])).unwrap_err();
        assert_eq!(err, OtaError::Signature);
    }

    #[test]
    fn start_mid_session_begins_fresh() {
        let (engine, flash, signing) = engine();
        let image: Vec<u8> = (0..10u8).collect();
        block_on(engine.handle_message(&start_msg(10))).unwrap();
        block_on(engine.handle_message(&chunk_msg(&image[..4]))).unwrap();
        // The uploader restarts from scratch.
        block_on(engine.handle_message(&start_msg(10))).unwrap();
        assert_eq!(flash.0.borrow().aborts, 1);
        block_on(engine.handle_message(&chunk_msg(&image))).unwrap();
        let out = block_on(engine.handle_message(&finish_msg(&signing, &image))).unwrap();
        assert_eq!(out, OtaOutcome::Complete);
        assert_eq!(flash.0.borrow().written, image);
    }

    #[test]
    fn size_field_is_little_endian() {
        let (engine, _, signing) = engine();
        let image = [0x55u8; 100];
        block_on(engine.handle_message(&start_msg(100))).unwrap();
        block_on(engine.handle_message(&chunk_msg(&image))).unwrap();
        let out = block_on(engine.handle_message(&finish_msg(&signing, &image))).unwrap();
        assert_eq!(out, OtaOutcome::Complete);
    }

    #[test]
    fn big_endian_size_field_does_not_complete() {
        let (engine, _, signing) = engine();
        let image = [0x55u8; 100];
        let mut msg = vec![MSG_START, FORMAT_FULL_IMAGE];
        msg.extend_from_slice(&100u32.to_be_bytes());
        block_on(engine.handle_message(&msg)).unwrap();
        block_on(engine.handle_message(&chunk_msg(&image))).unwrap();
        // The declared total reads as 100 << 24, so the session cannot
        // finish after 100 bytes.
        let err = block_on(engine.handle_message(&finish_msg(&signing, &image))).unwrap_err();
        assert_eq!(err, OtaError::SizeMismatch);
    }

    #[test]
    fn begin_failure_leaves_idle() {
        let (engine, flash, _) = engine();
        flash.0.borrow_mut().fail_begin = true;
        let err = block_on(engine.handle_message(&start_msg(16))).unwrap_err();
        assert_eq!(err, OtaError::Storage);
        assert_eq!(block_on(engine.phase()), OtaPhase::Idle);
    }

    #[test]
    fn write_failure_fails_the_session() {
        let (engine, flash, _) = engine();
        block_on(engine.handle_message(&start_msg(16))).unwrap();
        flash.0.borrow_mut().fail_write = true;
        let err = block_on(engine.handle_message(&chunk_msg(&[0u8; 8]))).unwrap_err();
        assert_eq!(err, OtaError::Storage);
        assert_eq!(block_on(engine.phase()), OtaPhase::Failed);
        assert_eq!(flash.0.borrow().aborts, 1);
    }

    #[test]
    fn empty_chunk_does_not_touch_the_session() {
        let (engine, _, signing) = engine();
        let image = [3u8; 4];
        block_on(engine.handle_message(&start_msg(4))).unwrap();
        let err = block_on(engine.handle_message(&[MSG_CHUNK])).unwrap_err();
        assert_eq!(err, OtaError::BadMessage);
        block_on(engine.handle_message(&chunk_msg(&image))).unwrap();
        let out = block_on(engine.handle_message(&finish_msg(&signing, &image))).unwrap();
        assert_eq!(out, OtaOutcome::Complete);
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let (engine, _, _) = engine();
        assert_eq!(
            block_on(engine.handle_message(&[9, 9, 9])).unwrap_err(),
            OtaError::BadMessage
        );
        assert_eq!(block_on(engine.handle_message(&[])).unwrap_err(), OtaError::BadMessage);
        assert_eq!(block_on(engine.phase()), OtaPhase::Idle);
    }

    #[test]
    fn complete_session_allows_a_new_start() {
        let (engine, _, signing) = engine();
        let image = [8u8; 6];
        block_on(engine.handle_message(&start_msg(6))).unwrap();
        block_on(engine.handle_message(&chunk_msg(&image))).unwrap();
        block_on(engine.handle_message(&finish_msg(&signing, &image))).unwrap();
        assert_eq!(block_on(engine.phase()), OtaPhase::Complete);
        assert_eq!(
            block_on(engine.handle_message(&start_msg(6))).unwrap(),
            OtaOutcome::Accepted
        );
        assert_eq!(block_on(engine.phase()), OtaPhase::Receiving);
    }
}
