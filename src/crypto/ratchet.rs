//! Double Ratchet session state
//!
//! Follows the Signal Double Ratchet: a DH ratchet driving root-key
//! updates and independent symmetric chains for sending and receiving,
//! with a bounded cache of skipped message keys for out-of-order
//! delivery.
//!
//! Decryption is transactional: any failure leaves the session exactly
//! as it was, so a forged message cannot advance or corrupt the state.

use zeroize::{Zeroize, Zeroizing};

use crate::crypto::curve::Curve;
use crate::crypto::primitives::{
    aead_decrypt, aead_encrypt, hkdf_sha512, hmac_sha512, AEAD_TAG_LEN,
};

/// Info string for the root-key update
const RK_INFO: &[u8] = b"DR_RK";
/// Info string for the message-key expansion
const MK_INFO: &[u8] = b"DR Message Key";

/// Ratchet errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RatchetError {
    #[error("session has no usable chain")]
    NotInitialized,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("message replays an already-consumed index")]
    Replay,
    #[error("gap exceeds the skipped-message-key limit")]
    SkipLimitExceeded,
}

/// Lifecycle of a Double Ratchet session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Created, no message exchanged yet.
    Fresh,
    /// At least one message sent or received.
    Active,
    /// Superseded by a newer session with the same peer device.
    Stale,
}

impl SessionStatus {
    pub fn as_u8(self) -> u8 {
        match self {
            SessionStatus::Fresh => 0,
            SessionStatus::Active => 1,
            SessionStatus::Stale => 2,
        }
    }

    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(SessionStatus::Fresh),
            1 => Some(SessionStatus::Active),
            2 => Some(SessionStatus::Stale),
            _ => None,
        }
    }
}

/// Which X3DH half created the session. The initiator attaches its
/// X3DH-init blob to outbound messages until the peer's first reply;
/// the responder keeps the received blob to recognize retransmissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Initiator,
    Responder,
}

impl SessionRole {
    pub fn as_u8(self) -> u8 {
        match self {
            SessionRole::Initiator => 0,
            SessionRole::Responder => 1,
        }
    }

    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(SessionRole::Initiator),
            1 => Some(SessionRole::Responder),
            _ => None,
        }
    }
}

/// Caps on the skipped-message-key cache.
#[derive(Debug, Clone, Copy)]
pub struct SkipLimits {
    pub per_chain: usize,
    pub per_session: usize,
}

impl Default for SkipLimits {
    fn default() -> Self {
        Self {
            per_chain: 256,
            per_session: 1024,
        }
    }
}

/// Symmetric chain: CK advances with HMAC(CK, 0x02), the message key is
/// HMAC(CK, 0x01).
#[derive(Clone)]
struct ChainKey {
    key: Zeroizing<[u8; 32]>,
    index: u32,
}

impl ChainKey {
    fn new(key: [u8; 32], index: u32) -> Self {
        Self {
            key: Zeroizing::new(key),
            index,
        }
    }

    fn next(&mut self) -> MessageKey {
        let mut mk = hmac_sha512(self.key.as_ref(), &[0x01]);
        let mut ck = hmac_sha512(self.key.as_ref(), &[0x02]);
        self.key.copy_from_slice(&ck[..32]);
        self.index += 1;
        let message_key = MessageKey::expand(&mk);
        mk.zeroize();
        ck.zeroize();
        message_key
    }
}

/// Expanded per-message material: AEAD key and IV.
#[derive(Clone)]
pub struct MessageKey {
    key: Zeroizing<[u8; 32]>,
    iv: Zeroizing<[u8; 12]>,
}

impl MessageKey {
    /// Expand the 64-byte chain output into key || IV.
    fn expand(mk: &[u8; 64]) -> Self {
        let mut okm = Zeroizing::new([0u8; 44]);
        hkdf_sha512(&[], mk, MK_INFO, okm.as_mut()).expect("44 bytes is below the HKDF cap");
        let mut key = Zeroizing::new([0u8; 32]);
        let mut iv = Zeroizing::new([0u8; 12]);
        key.copy_from_slice(&okm[..32]);
        iv.copy_from_slice(&okm[32..]);
        Self { key, iv }
    }

    pub(crate) fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(vec![0u8; 44]);
        out[..32].copy_from_slice(self.key.as_ref());
        out[32..].copy_from_slice(self.iv.as_ref());
        out
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 44 {
            return None;
        }
        let mut key = Zeroizing::new([0u8; 32]);
        let mut iv = Zeroizing::new([0u8; 12]);
        key.copy_from_slice(&bytes[..32]);
        iv.copy_from_slice(&bytes[32..]);
        Some(Self { key, iv })
    }
}

#[derive(Clone)]
struct SkippedKey {
    dh_pub: Vec<u8>,
    n: u32,
    mk: MessageKey,
}

/// One encrypted Double Ratchet message: the cleartext header bytes
/// (authenticated as associated data) and ciphertext || tag.
pub struct DrMessage {
    pub header: Vec<u8>,
    pub payload: Vec<u8>,
}

/// A Double Ratchet session with one peer device.
pub struct DrSession<C: Curve> {
    /// Store rowid, 0 until first persisted.
    pub(crate) id: i64,
    root_key: Zeroizing<[u8; 32]>,
    dh_self_priv: C::XPriv,
    dh_self_pub: C::XPub,
    dh_remote: Option<C::XPub>,
    ck_send: Option<ChainKey>,
    ck_recv: Option<ChainKey>,
    /// Length of the previous sending chain, carried in headers.
    pn: u32,
    skipped: Vec<SkippedKey>,
    associated_data: Vec<u8>,
    status: SessionStatus,
    role: SessionRole,
    /// X3DH-init bytes: outbound blob for an initiator (cleared on the
    /// first inbound message), the creating blob for a responder.
    x3dh_init: Option<Vec<u8>>,
    /// Consecutive failed decryptions of init-carrying messages.
    pub(crate) init_failures: u32,
    limits: SkipLimits,
}

impl<C: Curve> Clone for DrSession<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            root_key: self.root_key.clone(),
            dh_self_priv: self.dh_self_priv.clone(),
            dh_self_pub: self.dh_self_pub.clone(),
            dh_remote: self.dh_remote.clone(),
            ck_send: self.ck_send.clone(),
            ck_recv: self.ck_recv.clone(),
            pn: self.pn,
            skipped: self.skipped.clone(),
            associated_data: self.associated_data.clone(),
            status: self.status.clone(),
            role: self.role.clone(),
            x3dh_init: self.x3dh_init.clone(),
            init_failures: self.init_failures,
            limits: self.limits.clone(),
        }
    }
}

impl<C: Curve> DrSession<C> {
    /// Initiator construction: the X3DH shared secret seeds the root,
    /// the responder's signed prekey is its first ratchet key.
    pub fn initiator(
        shared_secret: &[u8; 32],
        associated_data: Vec<u8>,
        remote_spk: &C::XPub,
        x3dh_init: Vec<u8>,
        limits: SkipLimits,
    ) -> Self {
        let (dh_self_priv, dh_self_pub) = C::x_keypair();
        let dh = C::dh(&dh_self_priv, remote_spk);
        let (root_key, ck) = kdf_rk(shared_secret, &dh);

        Self {
            id: 0,
            root_key,
            dh_self_priv,
            dh_self_pub,
            dh_remote: Some(remote_spk.clone()),
            ck_send: Some(ChainKey::new(ck, 0)),
            ck_recv: None,
            pn: 0,
            skipped: Vec::new(),
            associated_data,
            status: SessionStatus::Fresh,
            role: SessionRole::Initiator,
            x3dh_init: Some(x3dh_init),
            init_failures: 0,
            limits,
        }
    }

    /// Responder construction: the signed prekey pair is the first
    /// ratchet key, chains start on the initiator's first message.
    pub fn responder(
        shared_secret: &[u8; 32],
        associated_data: Vec<u8>,
        spk_priv: C::XPriv,
        received_init: Vec<u8>,
        limits: SkipLimits,
    ) -> Self {
        let dh_self_pub = C::x_public(&spk_priv);
        Self {
            id: 0,
            root_key: Zeroizing::new(*shared_secret),
            dh_self_priv: spk_priv,
            dh_self_pub,
            dh_remote: None,
            ck_send: None,
            ck_recv: None,
            pn: 0,
            skipped: Vec::new(),
            associated_data,
            status: SessionStatus::Fresh,
            role: SessionRole::Responder,
            x3dh_init: Some(received_init),
            init_failures: 0,
            limits,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn mark_stale(&mut self) {
        self.status = SessionStatus::Stale;
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Init blob to attach to outbound messages, if still pending.
    pub fn pending_init(&self) -> Option<&[u8]> {
        match self.role {
            SessionRole::Initiator => self.x3dh_init.as_deref(),
            SessionRole::Responder => None,
        }
    }

    /// Init blob that created this responder-side session.
    pub fn creating_init(&self) -> Option<&[u8]> {
        match self.role {
            SessionRole::Responder => self.x3dh_init.as_deref(),
            SessionRole::Initiator => None,
        }
    }

    /// Encrypt one payload, advancing the sending chain.
    pub fn encrypt(&mut self, payload: &[u8]) -> Result<DrMessage, RatchetError> {
        let ck = self.ck_send.as_mut().ok_or(RatchetError::NotInitialized)?;
        let n = ck.index;
        let mk = ck.next();

        let header = encode_header::<C>(&self.dh_self_pub, self.pn, n);
        let aad = self.aad_for(&header);
        let (mut cipher, tag) =
            aead_encrypt(&mk.key, &mk.iv, payload, &aad).map_err(|_| RatchetError::EncryptionFailed)?;
        cipher.extend_from_slice(&tag);

        if self.status == SessionStatus::Fresh {
            self.status = SessionStatus::Active;
        }

        Ok(DrMessage {
            header,
            payload: cipher,
        })
    }

    /// Decrypt one message given its parsed header fields and payload
    /// (ciphertext || tag). On any error the session state is unchanged.
    pub fn decrypt(
        &mut self,
        dh_pub: &[u8],
        pn: u32,
        n: u32,
        payload: &[u8],
    ) -> Result<Vec<u8>, RatchetError> {
        if payload.len() < AEAD_TAG_LEN {
            return Err(RatchetError::DecryptionFailed);
        }
        let (cipher, tag) = payload.split_at(payload.len() - AEAD_TAG_LEN);
        let tag: [u8; AEAD_TAG_LEN] = tag.try_into().expect("split at tag size");
        let header = rebuild_header(dh_pub, pn, n);
        let aad = self.aad_for(&header);

        // Out-of-order message whose key was cached earlier
        if let Some(pos) = self
            .skipped
            .iter()
            .position(|s| s.dh_pub == dh_pub && s.n == n)
        {
            let mk = self.skipped[pos].mk.clone();
            let plain = aead_decrypt(&mk.key, &mk.iv, cipher, &aad, &tag)
                .map_err(|_| RatchetError::DecryptionFailed)?;
            self.skipped.remove(pos);
            self.note_success();
            return Ok(plain);
        }

        let same_chain = self
            .dh_remote
            .as_ref()
            .map(|r| C::x_pub_bytes(r) == dh_pub)
            .unwrap_or(false);

        if same_chain {
            if let Some(ck) = &self.ck_recv {
                // Earlier index with no cached key: already consumed.
                if n < ck.index {
                    return Err(RatchetError::Replay);
                }
            }
        }

        // Work on a scratch copy so failures leave no trace.
        let mut work = self.clone();

        if !same_chain {
            let new_remote = C::x_pub_from_bytes(dh_pub).map_err(|_| RatchetError::DecryptionFailed)?;
            // cache the tail of the outgoing receiving chain
            work.skip_receiving_chain(pn)?;
            work.dh_ratchet(&new_remote);
        }

        work.skip_receiving_chain(n)?;
        let ck = work.ck_recv.as_mut().ok_or(RatchetError::NotInitialized)?;
        let mk = ck.next();
        let plain = aead_decrypt(&mk.key, &mk.iv, cipher, &aad, &tag)
            .map_err(|_| RatchetError::DecryptionFailed)?;

        work.evict_over_session_cap();
        work.note_success();
        *self = work;
        Ok(plain)
    }

    fn note_success(&mut self) {
        self.status = match self.status {
            SessionStatus::Stale => SessionStatus::Stale,
            _ => SessionStatus::Active,
        };
        self.init_failures = 0;
        if self.role == SessionRole::Initiator {
            // peer replied, the init blob was received
            self.x3dh_init = None;
        }
    }

    /// Derive and cache message keys up to (excluding) `until` on the
    /// current receiving chain.
    fn skip_receiving_chain(&mut self, until: u32) -> Result<(), RatchetError> {
        let Some(ck) = self.ck_recv.as_mut() else {
            return Ok(());
        };
        if until <= ck.index {
            return Ok(());
        }
        if (until - ck.index) as usize > self.limits.per_chain {
            return Err(RatchetError::SkipLimitExceeded);
        }
        let dh_pub = self
            .dh_remote
            .as_ref()
            .map(|r| C::x_pub_bytes(r))
            .unwrap_or_default();
        while ck.index < until {
            let n = ck.index;
            let mk = ck.next();
            self.skipped.push(SkippedKey {
                dh_pub: dh_pub.clone(),
                n,
                mk,
            });
        }
        Ok(())
    }

    /// DH ratchet step on receipt of a new remote ratchet key.
    fn dh_ratchet(&mut self, new_remote: &C::XPub) {
        self.pn = self.ck_send.as_ref().map(|c| c.index).unwrap_or(0);

        // receiving chain from the current self key
        let dh = C::dh(&self.dh_self_priv, new_remote);
        let (root, ck) = kdf_rk(&self.root_key, &dh);
        self.root_key = root;
        self.ck_recv = Some(ChainKey::new(ck, 0));
        self.dh_remote = Some(new_remote.clone());

        // fresh self key, then the sending chain
        let (new_priv, new_pub) = C::x_keypair();
        self.dh_self_priv = new_priv;
        self.dh_self_pub = new_pub;
        let dh = C::dh(&self.dh_self_priv, new_remote);
        let (root, ck) = kdf_rk(&self.root_key, &dh);
        self.root_key = root;
        self.ck_send = Some(ChainKey::new(ck, 0));
    }

    fn evict_over_session_cap(&mut self) {
        while self.skipped.len() > self.limits.per_session {
            self.skipped.remove(0);
        }
    }

    fn aad_for(&self, header: &[u8]) -> Vec<u8> {
        let mut aad = Vec::with_capacity(self.associated_data.len() + header.len());
        aad.extend_from_slice(&self.associated_data);
        aad.extend_from_slice(header);
        aad
    }
}

/// (RK', CK) = HKDF(salt = RK, ikm = DH output, "DR_RK")
fn kdf_rk(root: &[u8; 32], dh: &[u8]) -> (Zeroizing<[u8; 32]>, [u8; 32]) {
    let mut okm = Zeroizing::new([0u8; 64]);
    hkdf_sha512(root, dh, RK_INFO, okm.as_mut()).expect("64 bytes is the HKDF cap");
    let mut new_root = Zeroizing::new([0u8; 32]);
    let mut ck = [0u8; 32];
    new_root.copy_from_slice(&okm[..32]);
    ck.copy_from_slice(&okm[32..]);
    (new_root, ck)
}

/// Header layout: DH public || PN (4 B BE) || N (4 B BE)
fn encode_header<C: Curve>(dh_pub: &C::XPub, pn: u32, n: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(C::X_PUB_LEN + 8);
    header.extend_from_slice(&C::x_pub_bytes(dh_pub));
    header.extend_from_slice(&pn.to_be_bytes());
    header.extend_from_slice(&n.to_be_bytes());
    header
}

fn rebuild_header(dh_pub: &[u8], pn: u32, n: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(dh_pub.len() + 8);
    header.extend_from_slice(dh_pub);
    header.extend_from_slice(&pn.to_be_bytes());
    header.extend_from_slice(&n.to_be_bytes());
    header
}

/* Snapshot of a session for the store. Secret fields zeroize on drop. */

pub(crate) struct SessionSnapshot {
    pub id: i64,
    pub root_key: Zeroizing<Vec<u8>>,
    pub dh_self_priv: Zeroizing<Vec<u8>>,
    pub dh_remote: Option<Vec<u8>>,
    pub ck_send: Option<(Zeroizing<Vec<u8>>, u32)>,
    pub ck_recv: Option<(Zeroizing<Vec<u8>>, u32)>,
    pub pn: u32,
    pub associated_data: Vec<u8>,
    pub status: SessionStatus,
    pub role: SessionRole,
    pub x3dh_init: Option<Vec<u8>>,
    pub init_failures: u32,
    /// (chain DH public, message index, expanded key material)
    pub skipped: Vec<(Vec<u8>, u32, Zeroizing<Vec<u8>>)>,
}

impl<C: Curve> DrSession<C> {
    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            root_key: Zeroizing::new(self.root_key.to_vec()),
            dh_self_priv: C::x_priv_bytes(&self.dh_self_priv),
            dh_remote: self.dh_remote.as_ref().map(|r| C::x_pub_bytes(r)),
            ck_send: self
                .ck_send
                .as_ref()
                .map(|c| (Zeroizing::new(c.key.to_vec()), c.index)),
            ck_recv: self
                .ck_recv
                .as_ref()
                .map(|c| (Zeroizing::new(c.key.to_vec()), c.index)),
            pn: self.pn,
            associated_data: self.associated_data.clone(),
            status: self.status,
            role: self.role,
            x3dh_init: self.x3dh_init.clone(),
            init_failures: self.init_failures,
            skipped: self
                .skipped
                .iter()
                .map(|s| (s.dh_pub.clone(), s.n, s.mk.to_bytes()))
                .collect(),
        }
    }

    pub(crate) fn from_snapshot(
        snap: SessionSnapshot,
        limits: SkipLimits,
    ) -> Result<Self, RatchetError> {
        let chain = |parts: &Option<(Zeroizing<Vec<u8>>, u32)>| -> Result<Option<ChainKey>, RatchetError> {
            match parts {
                None => Ok(None),
                Some((key, index)) => {
                    let key: [u8; 32] = key
                        .as_slice()
                        .try_into()
                        .map_err(|_| RatchetError::NotInitialized)?;
                    Ok(Some(ChainKey::new(key, *index)))
                }
            }
        };

        let root_key: [u8; 32] = snap
            .root_key
            .as_slice()
            .try_into()
            .map_err(|_| RatchetError::NotInitialized)?;
        let dh_self_priv =
            C::x_priv_from_bytes(&snap.dh_self_priv).map_err(|_| RatchetError::NotInitialized)?;
        let dh_self_pub = C::x_public(&dh_self_priv);
        let dh_remote = match &snap.dh_remote {
            None => None,
            Some(bytes) => {
                Some(C::x_pub_from_bytes(bytes).map_err(|_| RatchetError::NotInitialized)?)
            }
        };
        let skipped = snap
            .skipped
            .iter()
            .map(|(dh_pub, n, mk)| {
                MessageKey::from_bytes(mk)
                    .map(|mk| SkippedKey {
                        dh_pub: dh_pub.clone(),
                        n: *n,
                        mk,
                    })
                    .ok_or(RatchetError::NotInitialized)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            id: snap.id,
            root_key: Zeroizing::new(root_key),
            dh_self_priv,
            dh_self_pub,
            dh_remote,
            ck_send: chain(&snap.ck_send)?,
            ck_recv: chain(&snap.ck_recv)?,
            pn: snap.pn,
            skipped,
            associated_data: snap.associated_data,
            status: snap.status,
            role: snap.role,
            x3dh_init: snap.x3dh_init,
            init_failures: snap.init_failures,
            limits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::curve::C25519;
    use crate::crypto::keys::{IdentityKeyPair, OneTimePreKey, PreKeyBundle, SignedPreKey};
    use crate::crypto::x3dh;

    type C = C25519;

    fn parse_header(header: &[u8]) -> (Vec<u8>, u32, u32) {
        let key_len = C::X_PUB_LEN;
        let dh = header[..key_len].to_vec();
        let pn = u32::from_be_bytes(header[key_len..key_len + 4].try_into().unwrap());
        let n = u32::from_be_bytes(header[key_len + 4..key_len + 8].try_into().unwrap());
        (dh, pn, n)
    }

    fn decrypt_msg(session: &mut DrSession<C>, msg: &DrMessage) -> Result<Vec<u8>, RatchetError> {
        let (dh, pn, n) = parse_header(&msg.header);
        session.decrypt(&dh, pn, n, &msg.payload)
    }

    fn session_pair() -> (DrSession<C>, DrSession<C>) {
        session_pair_with_limits(SkipLimits::default())
    }

    fn session_pair_with_limits(limits: SkipLimits) -> (DrSession<C>, DrSession<C>) {
        let alice = IdentityKeyPair::<C>::generate().unwrap();
        let bob = IdentityKeyPair::<C>::generate().unwrap();
        let bob_spk = SignedPreKey::generate(1, &bob, 0);
        let bob_opk = OneTimePreKey::generate(1);
        let bundle = PreKeyBundle::new(&bob, &bob_spk, Some(&bob_opk));

        let alice_out = x3dh::initiate(&alice, &bundle).unwrap();
        let bob_out = x3dh::respond(
            &bob,
            &bob_spk,
            Some(&bob_opk),
            alice.dsa_public(),
            &alice_out.ephemeral_public,
        )
        .unwrap();
        assert_eq!(alice_out.shared_secret(), bob_out.shared_secret());

        let alice_session = DrSession::initiator(
            alice_out.shared_secret(),
            alice_out.associated_data.clone(),
            &bundle.signed_prekey,
            vec![0xAA; 4],
            limits,
        );
        let bob_session = DrSession::responder(
            bob_out.shared_secret(),
            bob_out.associated_data.clone(),
            bob_spk.private_key().clone(),
            vec![0xAA; 4],
            limits,
        );
        (alice_session, bob_session)
    }

    #[test]
    fn test_chain_key_advances() {
        let mut chain = ChainKey::new([0u8; 32], 0);
        let k1 = chain.next();
        let k2 = chain.next();
        assert_eq!(chain.index, 2);
        assert_ne!(*k1.key, *k2.key);
    }

    #[test]
    fn test_in_order_round_trip() {
        let (mut alice, mut bob) = session_pair();
        for i in 0..5u32 {
            let text = format!("message {i}");
            let msg = alice.encrypt(text.as_bytes()).unwrap();
            assert_eq!(decrypt_msg(&mut bob, &msg).unwrap(), text.as_bytes());
        }
        assert_eq!(alice.status(), SessionStatus::Active);
        assert_eq!(bob.status(), SessionStatus::Active);
    }

    #[test]
    fn test_alternating_triggers_dh_ratchet() {
        let (mut alice, mut bob) = session_pair();

        let a1 = alice.encrypt(b"from alice").unwrap();
        assert_eq!(decrypt_msg(&mut bob, &a1).unwrap(), b"from alice");

        let b1 = bob.encrypt(b"from bob").unwrap();
        assert_eq!(decrypt_msg(&mut alice, &b1).unwrap(), b"from bob");

        let a2 = alice.encrypt(b"alice again").unwrap();
        assert_eq!(decrypt_msg(&mut bob, &a2).unwrap(), b"alice again");

        // ratchet keys rotated between alice's chains
        assert_ne!(a1.header[..32], a2.header[..32]);
    }

    #[test]
    fn test_out_of_order_within_chain() {
        let (mut alice, mut bob) = session_pair();
        let msgs: Vec<_> = (0..5)
            .map(|i| alice.encrypt(format!("m{i}").as_bytes()).unwrap())
            .collect();

        for i in [2usize, 0, 4, 1, 3] {
            assert_eq!(
                decrypt_msg(&mut bob, &msgs[i]).unwrap(),
                format!("m{i}").as_bytes()
            );
        }
    }

    #[test]
    fn test_replay_rejected() {
        let (mut alice, mut bob) = session_pair();
        let m0 = alice.encrypt(b"zero").unwrap();
        let m1 = alice.encrypt(b"one").unwrap();

        assert_eq!(decrypt_msg(&mut bob, &m1).unwrap(), b"one");
        assert_eq!(decrypt_msg(&mut bob, &m0).unwrap(), b"zero");
        // the cached key for m0 is gone, the index precedes the chain
        assert!(matches!(
            decrypt_msg(&mut bob, &m0),
            Err(RatchetError::Replay)
        ));
    }

    #[test]
    fn test_skipped_keys_survive_dh_ratchet() {
        let (mut alice, mut bob) = session_pair();

        let a0 = alice.encrypt(b"a0").unwrap();
        let a1 = alice.encrypt(b"a1").unwrap();
        // bob only sees a1, caching a0's key
        assert_eq!(decrypt_msg(&mut bob, &a1).unwrap(), b"a1");

        // a full round trip ratchets both sides
        let b0 = bob.encrypt(b"b0").unwrap();
        assert_eq!(decrypt_msg(&mut alice, &b0).unwrap(), b"b0");
        let a2 = alice.encrypt(b"a2").unwrap();
        assert_eq!(decrypt_msg(&mut bob, &a2).unwrap(), b"a2");

        // the old-chain message still decrypts from the cache
        assert_eq!(decrypt_msg(&mut bob, &a0).unwrap(), b"a0");
    }

    #[test]
    fn test_gap_beyond_chain_cap_rejected() {
        let limits = SkipLimits {
            per_chain: 4,
            per_session: 1024,
        };
        let (mut alice, mut bob) = session_pair_with_limits(limits);

        for _ in 0..6 {
            alice.encrypt(b"dropped").unwrap();
        }
        let late = alice.encrypt(b"late").unwrap();
        assert!(matches!(
            decrypt_msg(&mut bob, &late),
            Err(RatchetError::SkipLimitExceeded)
        ));
        // a fresh in-range message is still fine after the rejection
        let (mut alice2, mut bob2) = session_pair_with_limits(limits);
        let m = alice2.encrypt(b"ok").unwrap();
        assert_eq!(decrypt_msg(&mut bob2, &m).unwrap(), b"ok");
    }

    #[test]
    fn test_session_cap_evicts_oldest() {
        let limits = SkipLimits {
            per_chain: 256,
            per_session: 3,
        };
        let (mut alice, mut bob) = session_pair_with_limits(limits);

        let m0 = alice.encrypt(b"m0").unwrap();
        for _ in 1..5 {
            alice.encrypt(b"dropped").unwrap();
        }
        let m5 = alice.encrypt(b"m5").unwrap();
        // decrypting m5 caches keys 0..4, then evicts down to 3 entries
        assert_eq!(decrypt_msg(&mut bob, &m5).unwrap(), b"m5");
        // m0's key was the oldest and is gone
        assert!(decrypt_msg(&mut bob, &m0).is_err());
    }

    #[test]
    fn test_tamper_leaves_state_intact() {
        let (mut alice, mut bob) = session_pair();
        let m0 = alice.encrypt(b"first").unwrap();

        let mut forged = DrMessage {
            header: m0.header.clone(),
            payload: m0.payload.clone(),
        };
        *forged.payload.last_mut().unwrap() ^= 0xFF;
        assert!(matches!(
            decrypt_msg(&mut bob, &forged),
            Err(RatchetError::DecryptionFailed)
        ));

        // the untouched original still decrypts: nothing advanced
        assert_eq!(decrypt_msg(&mut bob, &m0).unwrap(), b"first");
    }

    #[test]
    fn test_initiator_drops_init_after_first_reply() {
        let (mut alice, mut bob) = session_pair();
        assert!(alice.pending_init().is_some());

        let a0 = alice.encrypt(b"hello").unwrap();
        decrypt_msg(&mut bob, &a0).unwrap();
        // still pending, nothing came back yet
        assert!(alice.pending_init().is_some());

        let b0 = bob.encrypt(b"reply").unwrap();
        decrypt_msg(&mut alice, &b0).unwrap();
        assert!(alice.pending_init().is_none());
        assert!(bob.creating_init().is_some());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let (mut alice, mut bob) = session_pair();
        let m0 = alice.encrypt(b"before snapshot").unwrap();
        let m1 = alice.encrypt(b"after snapshot").unwrap();
        decrypt_msg(&mut bob, &m1).unwrap();

        let snap = bob.snapshot();
        let mut restored = DrSession::<C>::from_snapshot(snap, SkipLimits::default()).unwrap();
        // skipped key for m0 survived persistence
        assert_eq!(decrypt_msg(&mut restored, &m0).unwrap(), b"before snapshot");

        // restored session keeps ratcheting
        let b0 = restored.encrypt(b"from restored bob").unwrap();
        assert_eq!(decrypt_msg(&mut alice, &b0).unwrap(), b"from restored bob");
    }
}
