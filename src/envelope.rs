//! Wire format of Double Ratchet messages
//!
//! Outer envelope, per recipient:
//!
//! ```text
//! byte 0    protocol version (0x01)
//! byte 1    curve tag
//! byte 2    message type (0x00 regular, 0x01 carries X3DH-init)
//! ...       X3DH-init block, only when type is 0x01
//! ...       DR header: DH public || PN (4 B BE) || N (4 B BE)
//! ...       AEAD ciphertext || tag (16 B)
//! ```
//!
//! Also implements the content packaging used by the cipherMessage
//! encryption policy: one random key encrypts the plaintext once, each
//! recipient's DR payload carries only that key.

use crate::crypto::curve::Curve;
use crate::crypto::ratchet::DrMessage;
use crate::crypto::{aead_decrypt, aead_encrypt, random_bytes, AEAD_IV_LEN, AEAD_TAG_LEN};

/// Current protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;
/// Size of the random content key of the cipherMessage policy
pub const CONTENT_KEY_LEN: usize = 32;

const TYPE_REGULAR: u8 = 0x00;
const TYPE_X3DH_INIT: u8 = 0x01;

/// Envelope codec errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum EnvelopeError {
    #[error("message truncated")]
    Truncated,
    #[error("unknown protocol version {0:#04x}")]
    UnknownVersion(u8),
    #[error("curve tag does not match this deployment")]
    CurveMismatch,
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),
    #[error("malformed content package")]
    MalformedContent,
}

/// Parsed X3DH-init block carried by the first messages of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X3dhInit {
    /// Initiator identity, DSA form.
    pub identity_key: Vec<u8>,
    /// Initiator ephemeral.
    pub ephemeral_key: Vec<u8>,
    /// Responder signed-prekey id used for the agreement.
    pub spk_id: u32,
    /// Consumed one-time prekey, if any.
    pub opk_id: Option<u32>,
}

impl X3dhInit {
    pub fn encode<C: Curve>(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(C::DSA_PUB_LEN + C::X_PUB_LEN + 9);
        out.extend_from_slice(&self.identity_key);
        out.extend_from_slice(&self.ephemeral_key);
        out.extend_from_slice(&self.spk_id.to_be_bytes());
        match self.opk_id {
            Some(id) => {
                out.push(1);
                out.extend_from_slice(&id.to_be_bytes());
            }
            None => out.push(0),
        }
        out
    }

    /// Decode one block from the front of `buf`, returning it together
    /// with the number of bytes consumed.
    pub fn decode<C: Curve>(buf: &[u8]) -> Result<(Self, usize), EnvelopeError> {
        let fixed = C::DSA_PUB_LEN + C::X_PUB_LEN + 5;
        if buf.len() < fixed {
            return Err(EnvelopeError::Truncated);
        }
        let mut at = 0;
        let identity_key = buf[at..at + C::DSA_PUB_LEN].to_vec();
        at += C::DSA_PUB_LEN;
        let ephemeral_key = buf[at..at + C::X_PUB_LEN].to_vec();
        at += C::X_PUB_LEN;
        let spk_id = u32::from_be_bytes(buf[at..at + 4].try_into().expect("4 bytes"));
        at += 4;
        let opk_present = buf[at];
        at += 1;
        let opk_id = match opk_present {
            0 => None,
            1 => {
                if buf.len() < at + 4 {
                    return Err(EnvelopeError::Truncated);
                }
                let id = u32::from_be_bytes(buf[at..at + 4].try_into().expect("4 bytes"));
                at += 4;
                Some(id)
            }
            _ => return Err(EnvelopeError::MalformedContent),
        };
        Ok((
            Self {
                identity_key,
                ephemeral_key,
                spk_id,
                opk_id,
            },
            at,
        ))
    }
}

/// Decoded DR message envelope.
pub struct ParsedMessage {
    /// Present when the message carries an X3DH-init block; the raw
    /// bytes are kept for byte-identical matching against sessions.
    pub init: Option<(X3dhInit, Vec<u8>)>,
    pub dh_pub: Vec<u8>,
    pub pn: u32,
    pub n: u32,
    /// Ciphertext || tag
    pub payload: Vec<u8>,
}

/// Assemble the outer envelope around one encrypted DR message.
pub fn build_message<C: Curve>(init: Option<&[u8]>, dr: &DrMessage) -> Vec<u8> {
    let init_len = init.map(|i| i.len()).unwrap_or(0);
    let mut out = Vec::with_capacity(3 + init_len + dr.header.len() + dr.payload.len());
    out.push(PROTOCOL_VERSION);
    out.push(C::ID.as_byte());
    match init {
        Some(init) => {
            out.push(TYPE_X3DH_INIT);
            out.extend_from_slice(init);
        }
        None => out.push(TYPE_REGULAR),
    }
    out.extend_from_slice(&dr.header);
    out.extend_from_slice(&dr.payload);
    out
}

/// Parse and validate one envelope for this deployment's curve.
pub fn parse_message<C: Curve>(buf: &[u8]) -> Result<ParsedMessage, EnvelopeError> {
    if buf.len() < 3 {
        return Err(EnvelopeError::Truncated);
    }
    if buf[0] != PROTOCOL_VERSION {
        return Err(EnvelopeError::UnknownVersion(buf[0]));
    }
    if buf[1] != C::ID.as_byte() {
        return Err(EnvelopeError::CurveMismatch);
    }

    let mut at = 3;
    let init = match buf[2] {
        TYPE_REGULAR => None,
        TYPE_X3DH_INIT => {
            let (block, used) = X3dhInit::decode::<C>(&buf[at..])?;
            let raw = buf[at..at + used].to_vec();
            at += used;
            Some((block, raw))
        }
        other => return Err(EnvelopeError::UnknownType(other)),
    };

    let header_len = C::X_PUB_LEN + 8;
    if buf.len() < at + header_len + AEAD_TAG_LEN {
        return Err(EnvelopeError::Truncated);
    }
    let dh_pub = buf[at..at + C::X_PUB_LEN].to_vec();
    at += C::X_PUB_LEN;
    let pn = u32::from_be_bytes(buf[at..at + 4].try_into().expect("4 bytes"));
    at += 4;
    let n = u32::from_be_bytes(buf[at..at + 4].try_into().expect("4 bytes"));
    at += 4;

    Ok(ParsedMessage {
        init,
        dh_pub,
        pn,
        n,
        payload: buf[at..].to_vec(),
    })
}

/// Encrypt the shared message body under a random content key:
/// version (1 B) || IV (12 B) || ciphertext || tag (16 B).
pub fn seal_content(key: &[u8; CONTENT_KEY_LEN], plain: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let mut iv = [0u8; AEAD_IV_LEN];
    random_bytes(&mut iv);
    let (cipher, tag) =
        aead_encrypt(key, &iv, plain, &[]).map_err(|_| EnvelopeError::MalformedContent)?;

    let mut out = Vec::with_capacity(1 + AEAD_IV_LEN + cipher.len() + AEAD_TAG_LEN);
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&cipher);
    out.extend_from_slice(&tag);
    Ok(out)
}

/// Decrypt a content package produced by [`seal_content`].
pub fn open_content(key: &[u8; CONTENT_KEY_LEN], buf: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    if buf.len() < 1 + AEAD_IV_LEN + AEAD_TAG_LEN {
        return Err(EnvelopeError::Truncated);
    }
    if buf[0] != PROTOCOL_VERSION {
        return Err(EnvelopeError::UnknownVersion(buf[0]));
    }
    let iv: [u8; AEAD_IV_LEN] = buf[1..1 + AEAD_IV_LEN].try_into().expect("12 bytes");
    let body = &buf[1 + AEAD_IV_LEN..];
    let (cipher, tag) = body.split_at(body.len() - AEAD_TAG_LEN);
    let tag: [u8; AEAD_TAG_LEN] = tag.try_into().expect("16 bytes");
    aead_decrypt(key, &iv, cipher, &[], &tag).map_err(|_| EnvelopeError::MalformedContent)
}
