//! Cryptographic engine
//!
//! Provides:
//! - primitive layer (HKDF-SHA512, HMAC-SHA512, AES-256-GCM, RNG)
//! - curve capability trait with Curve25519 and optional Curve448
//! - X3DH (Extended Triple Diffie-Hellman) key agreement
//! - Double Ratchet session state

pub mod curve;
mod keys;
mod primitives;
pub(crate) mod ratchet;
pub(crate) mod x3dh;

#[cfg(feature = "c448")]
pub use curve::C448;
pub use curve::{Curve, CurveId, C25519};
pub use keys::{IdentityKeyPair, OneTimePreKey, PreKeyBundle, SignedPreKey};
pub use primitives::{
    aead_decrypt, aead_encrypt, hkdf_sha512, hmac_sha512, random_bytes, CryptoError, AEAD_IV_LEN,
    AEAD_KEY_LEN, AEAD_TAG_LEN, HKDF_MAX_OUTPUT,
};
pub use ratchet::{
    DrMessage, DrSession, MessageKey, RatchetError, SessionRole, SessionStatus, SkipLimits,
};
pub use x3dh::{X3dhError, X3dhOutput};
