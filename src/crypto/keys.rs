//! Key material types
//!
//! Provides the long-term device identity, signed prekeys, one-time
//! prekeys and the published key bundle, generic over the curve family.

use zeroize::Zeroizing;

use crate::crypto::curve::Curve;
use crate::crypto::primitives::CryptoError;

/// Long-term device identity: a DSA key pair for signing and its
/// converted key-exchange form used by X3DH.
#[derive(Clone)]
pub struct IdentityKeyPair<C: Curve> {
    dsa_priv: C::DsaPriv,
    dsa_pub: C::DsaPub,
    x_priv: C::XPriv,
    x_pub: C::XPub,
}

impl<C: Curve> IdentityKeyPair<C> {
    /// Generate a fresh identity.
    pub fn generate() -> Result<Self, CryptoError> {
        let (dsa_priv, dsa_pub) = C::dsa_keypair();
        Self::from_dsa(dsa_priv, dsa_pub)
    }

    fn from_dsa(dsa_priv: C::DsaPriv, dsa_pub: C::DsaPub) -> Result<Self, CryptoError> {
        let x_priv = C::dsa_to_x_priv(&dsa_priv);
        let x_pub = C::dsa_to_x_pub(&dsa_pub)?;
        Ok(Self {
            dsa_priv,
            dsa_pub,
            x_priv,
            x_pub,
        })
    }

    pub fn dsa_public(&self) -> &C::DsaPub {
        &self.dsa_pub
    }

    pub fn x_public(&self) -> &C::XPub {
        &self.x_pub
    }

    pub(crate) fn x_private(&self) -> &C::XPriv {
        &self.x_priv
    }

    pub fn sign(&self, msg: &[u8]) -> C::Sig {
        C::sign(&self.dsa_priv, msg)
    }

    /// Serialize the DSA secret for storage; the key-exchange form is
    /// re-derived on load.
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        C::dsa_priv_bytes(&self.dsa_priv)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let dsa_priv = C::dsa_priv_from_bytes(bytes)?;
        let dsa_pub = C::dsa_public(&dsa_priv);
        Self::from_dsa(dsa_priv, dsa_pub)
    }
}

/// Medium-term prekey, signed by the identity key and rotated on
/// schedule.
#[derive(Clone)]
pub struct SignedPreKey<C: Curve> {
    pub id: u32,
    x_priv: C::XPriv,
    x_pub: C::XPub,
    signature: C::Sig,
    /// Creation time, seconds since the epoch.
    pub created_at: u64,
}

impl<C: Curve> SignedPreKey<C> {
    pub fn generate(id: u32, identity: &IdentityKeyPair<C>, now: u64) -> Self {
        let (x_priv, x_pub) = C::x_keypair();
        let signature = identity.sign(&C::x_pub_bytes(&x_pub));
        Self {
            id,
            x_priv,
            x_pub,
            signature,
            created_at: now,
        }
    }

    pub fn public_key(&self) -> &C::XPub {
        &self.x_pub
    }

    pub fn signature(&self) -> &C::Sig {
        &self.signature
    }

    pub(crate) fn private_key(&self) -> &C::XPriv {
        &self.x_priv
    }

    pub fn verify(&self, identity_public: &C::DsaPub) -> bool {
        C::verify(identity_public, &C::x_pub_bytes(&self.x_pub), &self.signature)
    }

    pub(crate) fn from_parts(
        id: u32,
        priv_bytes: &[u8],
        sig_bytes: &[u8],
        created_at: u64,
    ) -> Result<Self, CryptoError> {
        let x_priv = C::x_priv_from_bytes(priv_bytes)?;
        let x_pub = C::x_public(&x_priv);
        Ok(Self {
            id,
            x_priv,
            x_pub,
            signature: C::sig_from_bytes(sig_bytes)?,
            created_at,
        })
    }
}

/// One-time prekey, consumed at most once as responder in X3DH.
#[derive(Clone)]
pub struct OneTimePreKey<C: Curve> {
    pub id: u32,
    x_priv: C::XPriv,
    x_pub: C::XPub,
}

impl<C: Curve> OneTimePreKey<C> {
    pub fn generate(id: u32) -> Self {
        let (x_priv, x_pub) = C::x_keypair();
        Self { id, x_priv, x_pub }
    }

    pub fn public_key(&self) -> &C::XPub {
        &self.x_pub
    }

    pub(crate) fn private_key(&self) -> &C::XPriv {
        &self.x_priv
    }

    pub(crate) fn from_parts(id: u32, priv_bytes: &[u8]) -> Result<Self, CryptoError> {
        let x_priv = C::x_priv_from_bytes(priv_bytes)?;
        let x_pub = C::x_public(&x_priv);
        Ok(Self { id, x_priv, x_pub })
    }
}

/// Public key bundle a peer fetches from the server to start X3DH.
#[derive(Clone)]
pub struct PreKeyBundle<C: Curve> {
    /// Peer identity, DSA form.
    pub identity_key: C::DsaPub,
    pub signed_prekey: C::XPub,
    pub signed_prekey_id: u32,
    pub signed_prekey_signature: C::Sig,
    /// At most one one-time prekey with its id.
    pub one_time_prekey: Option<(u32, C::XPub)>,
}

impl<C: Curve> PreKeyBundle<C> {
    pub fn new(
        identity: &IdentityKeyPair<C>,
        signed_prekey: &SignedPreKey<C>,
        one_time_prekey: Option<&OneTimePreKey<C>>,
    ) -> Self {
        Self {
            identity_key: identity.dsa_public().clone(),
            signed_prekey: signed_prekey.public_key().clone(),
            signed_prekey_id: signed_prekey.id,
            signed_prekey_signature: signed_prekey.signature().clone(),
            one_time_prekey: one_time_prekey.map(|k| (k.id, k.public_key().clone())),
        }
    }

    /// Verify the signature over the signed prekey.
    pub fn verify(&self) -> bool {
        C::verify(
            &self.identity_key,
            &C::x_pub_bytes(&self.signed_prekey),
            &self.signed_prekey_signature,
        )
    }
}
