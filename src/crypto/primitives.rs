//! Primitive layer: key derivation, message authentication, AEAD and RNG
//!
//! Every engine above this module goes through these functions; none of
//! them panics on bad input, they return a [`CryptoError`] instead.

use aes_gcm::aead::KeyInit;
use aes_gcm::{AeadInPlace, Aes256Gcm, Nonce, Tag};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha512;

/// AEAD key size (AES-256-GCM)
pub const AEAD_KEY_LEN: usize = 32;
/// AEAD IV size
pub const AEAD_IV_LEN: usize = 12;
/// AEAD authentication tag size
pub const AEAD_TAG_LEN: usize = 16;
/// Largest HKDF output any call site requests: one SHA-512 block.
pub const HKDF_MAX_OUTPUT: usize = 64;

/// Primitive-layer errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum CryptoError {
    #[error("requested HKDF output exceeds {HKDF_MAX_OUTPUT} bytes")]
    HkdfOutputTooLong,
    #[error("AEAD tag verification failed")]
    AeadTagMismatch,
    #[error("invalid key material")]
    InvalidKey,
    #[error("key is of an incompatible curve family")]
    IncompatibleKeyFamily,
}

/// Fill `buf` with bytes from the OS CSPRNG.
pub fn random_bytes(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// HKDF-SHA512 (RFC 5869). Output is capped at one expansion block,
/// which covers every use in the protocol.
pub fn hkdf_sha512(salt: &[u8], ikm: &[u8], info: &[u8], out: &mut [u8]) -> Result<(), CryptoError> {
    if out.len() > HKDF_MAX_OUTPUT {
        return Err(CryptoError::HkdfOutputTooLong);
    }
    let hk = Hkdf::<Sha512>::new(Some(salt), ikm);
    hk.expand(info, out)
        .map_err(|_| CryptoError::HkdfOutputTooLong)
}

/// HMAC-SHA512
pub fn hmac_sha512(key: &[u8], msg: &[u8]) -> [u8; 64] {
    let mut mac =
        <Hmac<Sha512> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg);
    let mut out = [0u8; 64];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// AES-256-GCM encryption with detached tag.
pub fn aead_encrypt(
    key: &[u8; AEAD_KEY_LEN],
    iv: &[u8; AEAD_IV_LEN],
    plain: &[u8],
    aad: &[u8],
) -> Result<(Vec<u8>, [u8; AEAD_TAG_LEN]), CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
    let mut buf = plain.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(iv), aad, &mut buf)
        .map_err(|_| CryptoError::InvalidKey)?;
    let mut tag_out = [0u8; AEAD_TAG_LEN];
    tag_out.copy_from_slice(&tag);
    Ok((buf, tag_out))
}

/// AES-256-GCM decryption with detached tag. Fails without yielding any
/// plaintext when the tag does not verify.
pub fn aead_decrypt(
    key: &[u8; AEAD_KEY_LEN],
    iv: &[u8; AEAD_IV_LEN],
    cipher_text: &[u8],
    aad: &[u8],
    tag: &[u8; AEAD_TAG_LEN],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
    let mut buf = cipher_text.to_vec();
    cipher
        .decrypt_in_place_detached(Nonce::from_slice(iv), aad, &mut buf, Tag::from_slice(tag))
        .map_err(|_| CryptoError::AeadTagMismatch)?;
    Ok(buf)
}
