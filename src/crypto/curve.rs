//! Curve capability layer
//!
//! The protocol engines are generic over [`Curve`], which exposes the
//! sizes and operations of one elliptic curve family: Diffie-Hellman on
//! the Montgomery form, EdDSA on the Edwards form, and the conversion
//! from a DSA identity key to its key-exchange form.
//!
//! Curve25519 is always available. Curve448 is compiled behind the
//! `c448` cargo feature, matching the upstream per-curve build options.

use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::crypto::primitives::CryptoError;

/// Wire tag of a curve family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveId {
    C25519,
    C448,
}

impl CurveId {
    pub fn as_byte(self) -> u8 {
        match self {
            CurveId::C25519 => 0x01,
            CurveId::C448 => 0x02,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(CurveId::C25519),
            0x02 => Some(CurveId::C448),
            _ => None,
        }
    }
}

/// Capabilities of one curve family.
///
/// Associated types keep key material strongly typed end to end; the
/// byte accessors exist for the wire formats and the store, which deal
/// in fixed-size buffers.
pub trait Curve: Sized + 'static {
    const ID: CurveId;
    const NAME: &'static str;

    /// Key-exchange public key size
    const X_PUB_LEN: usize;
    /// Key-exchange secret size
    const X_PRIV_LEN: usize;
    /// Shared-secret size
    const SHARED_LEN: usize;
    /// DSA public key size
    const DSA_PUB_LEN: usize;
    /// DSA secret size
    const DSA_PRIV_LEN: usize;
    /// Signature size
    const SIG_LEN: usize;

    type XPriv: Clone;
    type XPub: Clone + PartialEq;
    type DsaPriv: Clone;
    type DsaPub: Clone + PartialEq;
    type Sig: Clone;

    fn x_keypair() -> (Self::XPriv, Self::XPub);
    fn x_public(sk: &Self::XPriv) -> Self::XPub;
    fn dh(sk: &Self::XPriv, pk: &Self::XPub) -> Zeroizing<Vec<u8>>;

    fn dsa_keypair() -> (Self::DsaPriv, Self::DsaPub);
    fn dsa_public(sk: &Self::DsaPriv) -> Self::DsaPub;
    fn sign(sk: &Self::DsaPriv, msg: &[u8]) -> Self::Sig;
    fn verify(pk: &Self::DsaPub, msg: &[u8], sig: &Self::Sig) -> bool;

    /// Convert a DSA secret to its key-exchange form.
    fn dsa_to_x_priv(sk: &Self::DsaPriv) -> Self::XPriv;
    /// Convert a DSA public key to its key-exchange form.
    fn dsa_to_x_pub(pk: &Self::DsaPub) -> Result<Self::XPub, CryptoError>;

    fn x_pub_bytes(pk: &Self::XPub) -> Vec<u8>;
    fn x_pub_from_bytes(bytes: &[u8]) -> Result<Self::XPub, CryptoError>;
    fn x_priv_bytes(sk: &Self::XPriv) -> Zeroizing<Vec<u8>>;
    fn x_priv_from_bytes(bytes: &[u8]) -> Result<Self::XPriv, CryptoError>;
    fn dsa_pub_bytes(pk: &Self::DsaPub) -> Vec<u8>;
    fn dsa_pub_from_bytes(bytes: &[u8]) -> Result<Self::DsaPub, CryptoError>;
    fn dsa_priv_bytes(sk: &Self::DsaPriv) -> Zeroizing<Vec<u8>>;
    fn dsa_priv_from_bytes(bytes: &[u8]) -> Result<Self::DsaPriv, CryptoError>;
    fn sig_bytes(sig: &Self::Sig) -> Vec<u8>;
    fn sig_from_bytes(bytes: &[u8]) -> Result<Self::Sig, CryptoError>;
}

/// Curve25519: X25519 key exchange, Ed25519 signatures.
pub struct C25519;

impl Curve for C25519 {
    const ID: CurveId = CurveId::C25519;
    const NAME: &'static str = "CURVE25519";

    const X_PUB_LEN: usize = 32;
    const X_PRIV_LEN: usize = 32;
    const SHARED_LEN: usize = 32;
    const DSA_PUB_LEN: usize = 32;
    const DSA_PRIV_LEN: usize = 32;
    const SIG_LEN: usize = 64;

    type XPriv = x25519_dalek::StaticSecret;
    type XPub = x25519_dalek::PublicKey;
    type DsaPriv = ed25519_dalek::SigningKey;
    type DsaPub = ed25519_dalek::VerifyingKey;
    type Sig = ed25519_dalek::Signature;

    fn x_keypair() -> (Self::XPriv, Self::XPub) {
        let sk = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let pk = x25519_dalek::PublicKey::from(&sk);
        (sk, pk)
    }

    fn x_public(sk: &Self::XPriv) -> Self::XPub {
        x25519_dalek::PublicKey::from(sk)
    }

    fn dh(sk: &Self::XPriv, pk: &Self::XPub) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(sk.diffie_hellman(pk).as_bytes().to_vec())
    }

    fn dsa_keypair() -> (Self::DsaPriv, Self::DsaPub) {
        let sk = ed25519_dalek::SigningKey::generate(&mut OsRng);
        let pk = sk.verifying_key();
        (sk, pk)
    }

    fn dsa_public(sk: &Self::DsaPriv) -> Self::DsaPub {
        sk.verifying_key()
    }

    fn sign(sk: &Self::DsaPriv, msg: &[u8]) -> Self::Sig {
        use ed25519_dalek::Signer;
        sk.sign(msg)
    }

    fn verify(pk: &Self::DsaPub, msg: &[u8], sig: &Self::Sig) -> bool {
        use ed25519_dalek::Verifier;
        pk.verify(msg, sig).is_ok()
    }

    fn dsa_to_x_priv(sk: &Self::DsaPriv) -> Self::XPriv {
        // RFC 8032 secret expansion; the low half is the X25519 scalar,
        // clamped by the X25519 implementation.
        use sha2::Digest;
        let hash = sha2::Sha512::digest(sk.to_bytes());
        let mut scalar = Zeroizing::new([0u8; 32]);
        scalar.copy_from_slice(&hash[..32]);
        x25519_dalek::StaticSecret::from(*scalar)
    }

    fn dsa_to_x_pub(pk: &Self::DsaPub) -> Result<Self::XPub, CryptoError> {
        let montgomery = pk.to_montgomery();
        Ok(x25519_dalek::PublicKey::from(montgomery.to_bytes()))
    }

    fn x_pub_bytes(pk: &Self::XPub) -> Vec<u8> {
        pk.as_bytes().to_vec()
    }

    fn x_pub_from_bytes(bytes: &[u8]) -> Result<Self::XPub, CryptoError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(x25519_dalek::PublicKey::from(arr))
    }

    fn x_priv_bytes(sk: &Self::XPriv) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(sk.to_bytes().to_vec())
    }

    fn x_priv_from_bytes(bytes: &[u8]) -> Result<Self::XPriv, CryptoError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(x25519_dalek::StaticSecret::from(arr))
    }

    fn dsa_pub_bytes(pk: &Self::DsaPub) -> Vec<u8> {
        pk.as_bytes().to_vec()
    }

    fn dsa_pub_from_bytes(bytes: &[u8]) -> Result<Self::DsaPub, CryptoError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        ed25519_dalek::VerifyingKey::from_bytes(&arr).map_err(|_| CryptoError::InvalidKey)
    }

    fn dsa_priv_bytes(sk: &Self::DsaPriv) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(sk.to_bytes().to_vec())
    }

    fn dsa_priv_from_bytes(bytes: &[u8]) -> Result<Self::DsaPriv, CryptoError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(ed25519_dalek::SigningKey::from_bytes(&arr))
    }

    fn sig_bytes(sig: &Self::Sig) -> Vec<u8> {
        sig.to_bytes().to_vec()
    }

    fn sig_from_bytes(bytes: &[u8]) -> Result<Self::Sig, CryptoError> {
        let arr: [u8; 64] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(ed25519_dalek::Signature::from_bytes(&arr))
    }
}

/// Curve448: X448 key exchange, Ed448 signatures.
#[cfg(feature = "c448")]
pub struct C448;

/// X448 secret kept as clamp-on-use bytes so it stays cloneable and
/// zeroizes on drop.
#[cfg(feature = "c448")]
#[derive(Clone)]
pub struct X448Priv(Zeroizing<[u8; 56]>);

#[cfg(feature = "c448")]
#[derive(Clone, PartialEq)]
pub struct X448Pub([u8; 56]);

#[cfg(feature = "c448")]
impl Curve for C448 {
    const ID: CurveId = CurveId::C448;
    const NAME: &'static str = "CURVE448";

    const X_PUB_LEN: usize = 56;
    const X_PRIV_LEN: usize = 56;
    const SHARED_LEN: usize = 56;
    const DSA_PUB_LEN: usize = 57;
    const DSA_PRIV_LEN: usize = 57;
    const SIG_LEN: usize = 114;

    type XPriv = X448Priv;
    type XPub = X448Pub;
    type DsaPriv = ed448_goldilocks::SigningKey;
    type DsaPub = ed448_goldilocks::VerifyingKey;
    type Sig = ed448_goldilocks::Signature;

    fn x_keypair() -> (Self::XPriv, Self::XPub) {
        let mut bytes = Zeroizing::new([0u8; 56]);
        crate::crypto::primitives::random_bytes(bytes.as_mut());
        let sk = X448Priv(bytes);
        let pk = Self::x_public(&sk);
        (sk, pk)
    }

    fn x_public(sk: &Self::XPriv) -> Self::XPub {
        let secret = x448::Secret::from_bytes(sk.0.as_ref()).expect("56-byte secret");
        let public = x448::PublicKey::from(&secret);
        X448Pub(*public.as_bytes())
    }

    fn dh(sk: &Self::XPriv, pk: &Self::XPub) -> Zeroizing<Vec<u8>> {
        let secret = x448::Secret::from_bytes(sk.0.as_ref()).expect("56-byte secret");
        let public = x448::PublicKey::from_bytes(&pk.0).expect("56-byte public");
        let shared = secret
            .as_diffie_hellman(&public)
            .expect("non low-order point");
        Zeroizing::new(shared.as_bytes().to_vec())
    }

    fn dsa_keypair() -> (Self::DsaPriv, Self::DsaPub) {
        let sk = ed448_goldilocks::SigningKey::generate(&mut OsRng);
        let pk = sk.verifying_key();
        (sk, pk)
    }

    fn dsa_public(sk: &Self::DsaPriv) -> Self::DsaPub {
        sk.verifying_key()
    }

    fn sign(sk: &Self::DsaPriv, msg: &[u8]) -> Self::Sig {
        use signature::Signer;
        sk.sign(msg)
    }

    fn verify(pk: &Self::DsaPub, msg: &[u8], sig: &Self::Sig) -> bool {
        use signature::Verifier;
        pk.verify(msg, sig).is_ok()
    }

    fn dsa_to_x_priv(sk: &Self::DsaPriv) -> Self::XPriv {
        // RFC 8032 secret expansion, truncated to the X448 scalar size;
        // clamping happens inside the X448 implementation.
        use sha3::digest::{ExtendableOutput, Update, XofReader};
        let mut shake = sha3::Shake256::default();
        shake.update(sk.to_bytes().as_ref());
        let mut reader = shake.finalize_xof();
        let mut bytes = Zeroizing::new([0u8; 56]);
        reader.read(bytes.as_mut());
        X448Priv(bytes)
    }

    fn dsa_to_x_pub(pk: &Self::DsaPub) -> Result<Self::XPub, CryptoError> {
        let compressed = ed448_goldilocks::CompressedEdwardsY(pk.to_bytes());
        let point: Option<ed448_goldilocks::EdwardsPoint> = compressed.decompress().into();
        let point = point.ok_or(CryptoError::IncompatibleKeyFamily)?;
        Ok(X448Pub(point.to_montgomery().0))
    }

    fn x_pub_bytes(pk: &Self::XPub) -> Vec<u8> {
        pk.0.to_vec()
    }

    fn x_pub_from_bytes(bytes: &[u8]) -> Result<Self::XPub, CryptoError> {
        let arr: [u8; 56] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(X448Pub(arr))
    }

    fn x_priv_bytes(sk: &Self::XPriv) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(sk.0.to_vec())
    }

    fn x_priv_from_bytes(bytes: &[u8]) -> Result<Self::XPriv, CryptoError> {
        let arr: [u8; 56] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(X448Priv(Zeroizing::new(arr)))
    }

    fn dsa_pub_bytes(pk: &Self::DsaPub) -> Vec<u8> {
        pk.to_bytes().to_vec()
    }

    fn dsa_pub_from_bytes(bytes: &[u8]) -> Result<Self::DsaPub, CryptoError> {
        let arr: [u8; 57] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        ed448_goldilocks::VerifyingKey::from_bytes(&arr).map_err(|_| CryptoError::InvalidKey)
    }

    fn dsa_priv_bytes(sk: &Self::DsaPriv) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(sk.to_bytes().to_vec())
    }

    fn dsa_priv_from_bytes(bytes: &[u8]) -> Result<Self::DsaPriv, CryptoError> {
        let arr: [u8; 57] = bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(ed448_goldilocks::SigningKey::from_bytes(&arr.into()))
    }

    fn sig_bytes(sig: &Self::Sig) -> Vec<u8> {
        sig.to_bytes().to_vec()
    }

    fn sig_from_bytes(bytes: &[u8]) -> Result<Self::Sig, CryptoError> {
        ed448_goldilocks::Signature::try_from(bytes).map_err(|_| CryptoError::InvalidKey)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_exchange<C: Curve>() {
        let (alice_sk, alice_pk) = C::x_keypair();
        let (bob_sk, bob_pk) = C::x_keypair();

        let alice_shared = C::dh(&alice_sk, &bob_pk);
        let bob_shared = C::dh(&bob_sk, &alice_pk);

        assert_eq!(alice_shared.len(), C::SHARED_LEN);
        assert_eq!(*alice_shared, *bob_shared);
    }

    fn sign_and_verify<C: Curve>() {
        let (alice_sk, alice_pk) = C::dsa_keypair();
        let (bob_sk, bob_pk) = C::dsa_keypair();

        let alice_msg = b"Lluchiwn ein gwydrau achos Ni yw y byd";
        let bob_msg = b"Neidiwn i'r awyr achos ni yw y byd";

        let alice_sig = C::sign(&alice_sk, alice_msg);
        let bob_sig = C::sign(&bob_sk, bob_msg);
        assert_eq!(C::sig_bytes(&alice_sig).len(), C::SIG_LEN);

        assert!(C::verify(&alice_pk, alice_msg, &alice_sig));
        assert!(!C::verify(&alice_pk, bob_msg, &alice_sig));
        assert!(!C::verify(&bob_pk, alice_msg, &bob_sig));
        assert!(C::verify(&bob_pk, bob_msg, &bob_sig));
    }

    fn serialization_round_trip<C: Curve>() {
        let (x_sk, x_pk) = C::x_keypair();
        let restored_pk = C::x_pub_from_bytes(&C::x_pub_bytes(&x_pk)).unwrap();
        assert!(restored_pk == x_pk);
        let restored_sk = C::x_priv_from_bytes(&C::x_priv_bytes(&x_sk)).unwrap();
        assert!(C::x_public(&restored_sk) == x_pk);

        let (dsa_sk, dsa_pk) = C::dsa_keypair();
        let restored = C::dsa_pub_from_bytes(&C::dsa_pub_bytes(&dsa_pk)).unwrap();
        assert!(restored == dsa_pk);
        let restored = C::dsa_priv_from_bytes(&C::dsa_priv_bytes(&dsa_sk)).unwrap();
        let sig = C::sign(&restored, b"round trip");
        assert!(C::verify(&dsa_pk, b"round trip", &sig));
    }

    /// Alice and Bob convert their DSA identities to key-exchange form
    /// independently and still agree on the shared secret.
    fn dsa_conversion_agreement<C: Curve>() {
        let (alice_dsa_sk, alice_dsa_pk) = C::dsa_keypair();
        let (bob_dsa_sk, bob_dsa_pk) = C::dsa_keypair();

        let alice_x_sk = C::dsa_to_x_priv(&alice_dsa_sk);
        let bob_x_sk = C::dsa_to_x_priv(&bob_dsa_sk);
        let alice_x_pk = C::dsa_to_x_pub(&alice_dsa_pk).unwrap();
        let bob_x_pk = C::dsa_to_x_pub(&bob_dsa_pk).unwrap();

        // converted secret matches the derived public key
        assert!(C::x_public(&alice_x_sk) == alice_x_pk);

        let alice_shared = C::dh(&alice_x_sk, &bob_x_pk);
        let bob_shared = C::dh(&bob_x_sk, &alice_x_pk);
        assert_eq!(*alice_shared, *bob_shared);
    }

    #[test]
    fn test_key_exchange_c25519() {
        key_exchange::<C25519>();
    }

    #[test]
    fn test_sign_and_verify_c25519() {
        sign_and_verify::<C25519>();
    }

    #[test]
    fn test_serialization_c25519() {
        serialization_round_trip::<C25519>();
    }

    #[test]
    fn test_dsa_conversion_agreement_c25519() {
        dsa_conversion_agreement::<C25519>();
    }

    #[test]
    fn test_curve_id_round_trip() {
        assert_eq!(CurveId::from_byte(0x01), Some(CurveId::C25519));
        assert_eq!(CurveId::from_byte(0x02), Some(CurveId::C448));
        assert_eq!(CurveId::from_byte(0x03), None);
        assert_eq!(CurveId::C25519.as_byte(), 0x01);
    }

    #[cfg(feature = "c448")]
    #[test]
    fn test_key_exchange_c448() {
        key_exchange::<C448>();
    }

    #[cfg(feature = "c448")]
    #[test]
    fn test_sign_and_verify_c448() {
        sign_and_verify::<C448>();
    }

    #[cfg(feature = "c448")]
    #[test]
    fn test_serialization_c448() {
        serialization_round_trip::<C448>();
    }

    #[cfg(feature = "c448")]
    #[test]
    fn test_dsa_conversion_agreement_c448() {
        dsa_conversion_agreement::<C448>();
    }
}
