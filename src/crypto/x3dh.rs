//! X3DH (Extended Triple Diffie-Hellman) key agreement
//!
//! The initiator half runs against a fetched peer key bundle; the
//! responder half recomputes the same secret from the X3DH-init data
//! attached to the first Double Ratchet message.

use zeroize::{Zeroize, Zeroizing};

use crate::crypto::curve::Curve;
use crate::crypto::keys::{IdentityKeyPair, OneTimePreKey, PreKeyBundle, SignedPreKey};
use crate::crypto::primitives::hkdf_sha512;

/// Info string for the shared-secret derivation
const X3DH_INFO: &[u8] = b"Lime";
/// Salt length: one SHA-512 output of zeros
const SALT_LEN: usize = 64;

/// X3DH errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum X3dhError {
    #[error("invalid signature on signed prekey")]
    InvalidSignature,
    #[error("key derivation failed")]
    KeyDerivationFailed,
}

/// Result of one X3DH half.
pub struct X3dhOutput<C: Curve> {
    shared_secret: Zeroizing<[u8; 32]>,
    /// Associated data bound to every message of the session.
    pub associated_data: Vec<u8>,
    /// Initiator ephemeral, sent to the responder.
    pub ephemeral_public: C::XPub,
    /// Which responder signed prekey was used.
    pub signed_prekey_id: u32,
    /// Which one-time prekey was consumed, if any.
    pub used_one_time_prekey_id: Option<u32>,
}

impl<C: Curve> X3dhOutput<C> {
    pub fn shared_secret(&self) -> &[u8; 32] {
        &self.shared_secret
    }
}

/// Initiator half: verify the bundle, generate an ephemeral key and
/// derive the root shared secret.
pub fn initiate<C: Curve>(
    local: &IdentityKeyPair<C>,
    bundle: &PreKeyBundle<C>,
) -> Result<X3dhOutput<C>, X3dhError> {
    if !bundle.verify() {
        return Err(X3dhError::InvalidSignature);
    }

    let (ephemeral_priv, ephemeral_public) = C::x_keypair();
    let peer_identity_x =
        C::dsa_to_x_pub(&bundle.identity_key).map_err(|_| X3dhError::KeyDerivationFailed)?;

    // DH1 = DH(IK_I, SPK_R)   DH2 = DH(EK_I, IK_R)
    // DH3 = DH(EK_I, SPK_R)   DH4 = DH(EK_I, OPK_R)
    let dh1 = C::dh(local.x_private(), &bundle.signed_prekey);
    let dh2 = C::dh(&ephemeral_priv, &peer_identity_x);
    let dh3 = C::dh(&ephemeral_priv, &bundle.signed_prekey);
    let dh4 = bundle
        .one_time_prekey
        .as_ref()
        .map(|(_, opk)| C::dh(&ephemeral_priv, opk));

    let shared_secret = derive_secret::<C>(&dh1, &dh2, &dh3, dh4.as_ref().map(|d| d.as_slice()))?;

    Ok(X3dhOutput {
        shared_secret,
        associated_data: associated_data::<C>(local.dsa_public(), &bundle.identity_key),
        ephemeral_public,
        signed_prekey_id: bundle.signed_prekey_id,
        used_one_time_prekey_id: bundle.one_time_prekey.as_ref().map(|(id, _)| *id),
    })
}

/// Responder half: recompute the shared secret from the initiator's
/// identity and ephemeral keys. The caller is responsible for consuming
/// the one-time prekey durably.
pub fn respond<C: Curve>(
    local: &IdentityKeyPair<C>,
    signed_prekey: &SignedPreKey<C>,
    one_time_prekey: Option<&OneTimePreKey<C>>,
    peer_identity: &C::DsaPub,
    peer_ephemeral: &C::XPub,
) -> Result<X3dhOutput<C>, X3dhError> {
    let peer_identity_x =
        C::dsa_to_x_pub(peer_identity).map_err(|_| X3dhError::KeyDerivationFailed)?;

    let dh1 = C::dh(signed_prekey.private_key(), &peer_identity_x);
    let dh2 = C::dh(local.x_private(), peer_ephemeral);
    let dh3 = C::dh(signed_prekey.private_key(), peer_ephemeral);
    let dh4 = one_time_prekey.map(|opk| C::dh(opk.private_key(), peer_ephemeral));

    let shared_secret = derive_secret::<C>(&dh1, &dh2, &dh3, dh4.as_ref().map(|d| d.as_slice()))?;

    Ok(X3dhOutput {
        shared_secret,
        associated_data: associated_data::<C>(peer_identity, local.dsa_public()),
        ephemeral_public: peer_ephemeral.clone(),
        signed_prekey_id: signed_prekey.id,
        used_one_time_prekey_id: one_time_prekey.map(|k| k.id),
    })
}

/// HKDF over F || DH1 || DH2 || DH3 [|| DH4], where F is the per-curve
/// domain-separation prefix (0xFF repeated over one public-key length).
fn derive_secret<C: Curve>(
    dh1: &[u8],
    dh2: &[u8],
    dh3: &[u8],
    dh4: Option<&[u8]>,
) -> Result<Zeroizing<[u8; 32]>, X3dhError> {
    let mut ikm = Vec::with_capacity(C::X_PUB_LEN + 4 * C::SHARED_LEN);
    ikm.extend(std::iter::repeat(0xFFu8).take(C::X_PUB_LEN));
    ikm.extend_from_slice(dh1);
    ikm.extend_from_slice(dh2);
    ikm.extend_from_slice(dh3);
    if let Some(dh4) = dh4 {
        ikm.extend_from_slice(dh4);
    }

    let salt = [0u8; SALT_LEN];
    let mut secret = Zeroizing::new([0u8; 32]);
    let result = hkdf_sha512(&salt, &ikm, X3DH_INFO, secret.as_mut());
    ikm.zeroize();
    result.map_err(|_| X3dhError::KeyDerivationFailed)?;
    Ok(secret)
}

/// AD = curve tag || Ik_initiator || Ik_responder, DSA form, fixed order.
fn associated_data<C: Curve>(initiator: &C::DsaPub, responder: &C::DsaPub) -> Vec<u8> {
    let mut ad = Vec::with_capacity(1 + 2 * C::DSA_PUB_LEN);
    ad.push(C::ID.as_byte());
    ad.extend_from_slice(&C::dsa_pub_bytes(initiator));
    ad.extend_from_slice(&C::dsa_pub_bytes(responder));
    ad
}
