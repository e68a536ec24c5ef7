//! Crate-level error type and FFI status-code mapping

use crate::PeerDeviceStatus;

/// Errors surfaced by the public Lime API.
///
/// Variants match the error kinds of the protocol: bad caller input,
/// cryptographic failure, malformed or replayed protocol data, local
/// storage failure, server dialog failure, identity-key conflicts and
/// prekey exhaustion.
#[derive(Debug, thiserror::Error)]
pub enum LimeError {
    #[error("invalid argument: {0}")]
    Argument(String),
    #[error("cryptographic failure: {0}")]
    Crypto(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("server dialog failure: {0}")]
    Network(String),
    #[error("peer {device_id} identity conflict, status is {status:?}")]
    PeerTrust {
        device_id: String,
        status: PeerDeviceStatus,
    },
    #[error("prekey material exhausted: {0}")]
    Exhausted(String),
}

impl LimeError {
    /// Numeric status code used at the foreign-function boundary.
    /// 0 is reserved for success.
    pub fn code(&self) -> u8 {
        match self {
            LimeError::Network(_) => 1,
            LimeError::Crypto(_) => 2,
            // Exhaustion is a protocol-level condition: the peer published
            // no usable prekey material.
            LimeError::Protocol(_) | LimeError::Exhausted(_) => 3,
            LimeError::Storage(_) => 4,
            LimeError::PeerTrust { .. } => 5,
            LimeError::Argument(_) => 6,
        }
    }
}

impl From<crate::crypto::CryptoError> for LimeError {
    fn from(e: crate::crypto::CryptoError) -> Self {
        LimeError::Crypto(e.to_string())
    }
}

impl From<crate::crypto::X3dhError> for LimeError {
    fn from(e: crate::crypto::X3dhError) -> Self {
        use crate::crypto::X3dhError;
        match e {
            X3dhError::InvalidSignature => LimeError::Crypto(e.to_string()),
            X3dhError::KeyDerivationFailed => LimeError::Crypto(e.to_string()),
        }
    }
}

impl From<crate::crypto::RatchetError> for LimeError {
    fn from(e: crate::crypto::RatchetError) -> Self {
        use crate::crypto::RatchetError;
        match e {
            RatchetError::DecryptionFailed | RatchetError::EncryptionFailed => {
                LimeError::Crypto(e.to_string())
            }
            RatchetError::Replay | RatchetError::SkipLimitExceeded | RatchetError::NotInitialized => {
                LimeError::Protocol(e.to_string())
            }
        }
    }
}

impl From<crate::envelope::EnvelopeError> for LimeError {
    fn from(e: crate::envelope::EnvelopeError) -> Self {
        LimeError::Protocol(e.to_string())
    }
}

impl From<crate::server::DialogError> for LimeError {
    fn from(e: crate::server::DialogError) -> Self {
        LimeError::Protocol(e.to_string())
    }
}
