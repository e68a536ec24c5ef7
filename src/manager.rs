//! Device manager
//!
//! Multiplexes local devices and their per-peer-device Double Ratchet
//! sessions, drives the key-server dialogs and exposes the public
//! encrypt, decrypt, trust and maintenance operations.
//!
//! One manager owns one database; operations on a single session are
//! serialized by construction (`&mut self`), operations on distinct
//! sessions may be dispatched from distinct managers.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::LimeConfig;
use crate::crypto::curve::Curve;
use crate::crypto::ratchet::{DrSession, SessionRole, SkipLimits};
use crate::crypto::x3dh;
use crate::crypto::{IdentityKeyPair, OneTimePreKey, PreKeyBundle, SignedPreKey};
use crate::envelope::{self, X3dhInit, CONTENT_KEY_LEN};
use crate::error::LimeError;
use crate::server::{self, OpkUpload, ServerResponse, ServerTransport, SpkUpload};
use crate::store::Store;
use crate::{EncryptionPolicy, PeerDeviceStatus};

/// Consecutive failed decryptions of init-carrying messages after which
/// a responder session is invalidated, forcing a fresh X3DH.
const MAX_INIT_FAILURES: u32 = 3;

/// Size cost a recipient pays for the content-key indirection, used by
/// the policy chooser.
const POLICY_OVERHEAD: usize = CONTENT_KEY_LEN
    + 1
    + crate::crypto::AEAD_IV_LEN
    + crate::crypto::AEAD_TAG_LEN;

/// One encryption target and, after the call, its result.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub device_id: String,
    /// Trust status after the call; `fail` means no message was
    /// produced for this device.
    pub status: PeerDeviceStatus,
    /// The per-recipient DR message, empty when the device was skipped.
    pub dr_message: Vec<u8>,
}

impl Recipient {
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            status: PeerDeviceStatus::Unknown,
            dr_message: Vec::new(),
        }
    }
}

type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// The Lime engine for one local database and one curve deployment.
pub struct LimeManager<C: Curve> {
    store: Store,
    transport: Box<dyn ServerTransport>,
    config: LimeConfig,
    clock: Clock,
    _curve: PhantomData<C>,
}

impl<C: Curve> LimeManager<C> {
    pub fn new(
        db_path: &str,
        transport: Box<dyn ServerTransport>,
        config: LimeConfig,
    ) -> Result<Self, LimeError> {
        Ok(Self {
            store: Store::open(db_path)?,
            transport,
            config,
            clock: Arc::new(|| {
                SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0)
            }),
            _curve: PhantomData,
        })
    }

    /// Replace the time source, mainly for prekey-lifetime tests.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> u64 {
        (self.clock)()
    }

    fn limits(&self) -> SkipLimits {
        SkipLimits {
            per_chain: self.config.max_skipped_per_chain,
            per_session: self.config.max_skipped_per_session,
        }
    }

    /* user lifecycle */

    /// Generate identity and prekey material for a new local device,
    /// publish it, then persist. Nothing is stored unless the server
    /// acknowledged the publication.
    pub fn create_user(
        &mut self,
        device_id: &str,
        server_url: &str,
        initial_opk_count: u16,
    ) -> Result<(), LimeError> {
        if device_id.is_empty() {
            return Err(LimeError::Argument("empty device id".into()));
        }
        if self.store.load_local_user::<C>(device_id)?.is_some() {
            return Err(LimeError::Argument(format!(
                "device {device_id} already exists"
            )));
        }

        let identity = IdentityKeyPair::<C>::generate()?;
        let now = self.now();
        let spk = SignedPreKey::generate(1, &identity, now);
        let opks: Vec<_> = (1..=u32::from(initial_opk_count))
            .map(OneTimePreKey::generate)
            .collect();

        let request = server::register_user(&identity, &spk_upload::<C>(&spk), &opk_uploads::<C>(&opks));
        let response = self.transport.post(device_id, &request)?;
        expect_ack::<C>(&response)?;

        self.store
            .create_local_user(device_id, server_url, &identity, &spk, &opks)?;
        info!(
            device_id,
            server_url,
            ik = %fingerprint(&C::dsa_pub_bytes(identity.dsa_public())),
            "user registered"
        );
        Ok(())
    }

    pub fn delete_user(&mut self, device_id: &str) -> Result<(), LimeError> {
        // make sure the device exists before talking to the server
        if self.store.load_local_user::<C>(device_id)?.is_none() {
            return Err(LimeError::Argument(format!("unknown device {device_id}")));
        }
        let response = self.transport.post(device_id, &server::delete_user::<C>())?;
        expect_ack::<C>(&response)?;
        self.store.delete_local_user(device_id)
    }

    pub fn get_self_identity_key(&self, device_id: &str) -> Result<Vec<u8>, LimeError> {
        let user = self
            .store
            .load_local_user::<C>(device_id)?
            .ok_or_else(|| LimeError::Argument(format!("unknown device {device_id}")))?;
        Ok(C::dsa_pub_bytes(user.identity.dsa_public()))
    }

    /* trust management */

    /// Establish or revoke trust in a peer device. A key conflicting
    /// with the stored one forces the durable `fail` status and errors.
    pub fn set_peer_device_status(
        &mut self,
        peer_device_id: &str,
        identity_key: &[u8],
        status: PeerDeviceStatus,
    ) -> Result<(), LimeError> {
        match status {
            PeerDeviceStatus::Trusted | PeerDeviceStatus::Untrusted | PeerDeviceStatus::Unsafe => {}
            PeerDeviceStatus::Unknown | PeerDeviceStatus::Fail => {
                return Err(LimeError::Argument(format!(
                    "status {status:?} cannot be set explicitly"
                )));
            }
        }
        self.store.set_peer(peer_device_id, "", identity_key, status)
    }

    pub fn get_peer_device_status(&self, peer_device_id: &str) -> Result<PeerDeviceStatus, LimeError> {
        Ok(self
            .store
            .peer_record(peer_device_id)?
            .map(|(_, status)| status)
            .unwrap_or(PeerDeviceStatus::Unknown))
    }

    /// Forget a peer device record entirely.
    pub fn delete_peer_device(&mut self, peer_device_id: &str) -> Result<(), LimeError> {
        self.store.delete_peer(peer_device_id)
    }

    /* encrypt */

    /// Encrypt `plaintext` to every recipient device, creating sessions
    /// through X3DH where none exist. Returns the shared cipher message
    /// (empty under the DRmessage policy); per-device results are
    /// written into `recipients`.
    pub fn encrypt(
        &mut self,
        local_device_id: &str,
        recipient_user_id: &str,
        recipients: &mut [Recipient],
        plaintext: &[u8],
        policy: EncryptionPolicy,
    ) -> Result<Vec<u8>, LimeError> {
        let user = self
            .store
            .load_local_user::<C>(local_device_id)?
            .ok_or_else(|| LimeError::Argument(format!("unknown device {local_device_id}")))?;
        if recipients.is_empty() {
            return Err(LimeError::Argument("no recipient devices".into()));
        }

        // establish a session per reachable recipient
        let mut prepared: Vec<(usize, DrSession<C>)> = Vec::new();
        for (index, recipient) in recipients.iter_mut().enumerate() {
            let record = self.store.peer_record(&recipient.device_id)?;
            let status = record.as_ref().map(|(_, s)| *s).unwrap_or(PeerDeviceStatus::Unknown);
            recipient.status = status;
            if status == PeerDeviceStatus::Fail {
                warn!(device_id = %recipient.device_id, "skipping failed peer device");
                continue;
            }

            let session = match self.store.load_active_session(user.uid, &recipient.device_id)? {
                Some(snap) => DrSession::from_snapshot(snap, self.limits())?,
                None => {
                    match self.start_session(&user.identity, local_device_id, recipient_user_id, &recipient.device_id, status) {
                        Ok(session) => session,
                        Err(LimeError::PeerTrust { device_id, status }) => {
                            recipient.status = status;
                            warn!(device_id = %device_id, "identity conflict, recipient skipped");
                            continue;
                        }
                        Err(other) => return Err(other),
                    }
                }
            };
            prepared.push((index, session));
        }

        // pick the packaging variant
        let use_cipher = use_cipher_message::<C>(policy, plaintext.len(), prepared.len());
        let mut content_key = Zeroizing::new([0u8; CONTENT_KEY_LEN]);
        let (cipher_message, payload): (Vec<u8>, &[u8]) = if use_cipher {
            crate::crypto::random_bytes(content_key.as_mut());
            (envelope::seal_content(&content_key, plaintext)?, content_key.as_ref())
        } else {
            (Vec::new(), plaintext)
        };

        let now = self.now();
        for (index, mut session) in prepared {
            let recipient = &mut recipients[index];
            let dr = session.encrypt(payload)?;
            recipient.dr_message = envelope::build_message::<C>(session.pending_init(), &dr);

            let mut snap = session.snapshot();
            self.store
                .commit_session(user.uid, &recipient.device_id, &mut snap, None, false, now)?;

            // a first successful encryption promotes an unknown device
            if recipient.status == PeerDeviceStatus::Unknown {
                if let Some((Some(ik), _)) = self.store.peer_record(&recipient.device_id)? {
                    self.store.set_peer(
                        &recipient.device_id,
                        recipient_user_id,
                        &ik,
                        PeerDeviceStatus::Untrusted,
                    )?;
                }
                recipient.status = PeerDeviceStatus::Untrusted;
            }
        }

        debug!(
            local_device_id,
            recipients = recipients.len(),
            cipher_message = use_cipher,
            "message encrypted"
        );
        Ok(cipher_message)
    }

    /// Fetch a bundle and run the X3DH initiator half.
    fn start_session(
        &mut self,
        identity: &IdentityKeyPair<C>,
        local_device_id: &str,
        peer_user_id: &str,
        peer_device_id: &str,
        current_status: PeerDeviceStatus,
    ) -> Result<DrSession<C>, LimeError> {
        let request = server::get_peer_bundle::<C>(peer_device_id);
        let response = self.transport.post(local_device_id, &request)?;
        let bundle: PreKeyBundle<C> = match server::parse_response::<C>(&response)? {
            ServerResponse::Bundle(bundle) => bundle,
            _ => return Err(LimeError::Protocol("expected a key bundle".into())),
        };

        // record the peer identity before using it; conflicts are sticky
        self.store.set_peer(
            peer_device_id,
            peer_user_id,
            &C::dsa_pub_bytes(&bundle.identity_key),
            current_status,
        )?;

        let out = x3dh::initiate(identity, &bundle)?;
        let init = X3dhInit {
            identity_key: C::dsa_pub_bytes(identity.dsa_public()),
            ephemeral_key: C::x_pub_bytes(&out.ephemeral_public),
            spk_id: out.signed_prekey_id,
            opk_id: out.used_one_time_prekey_id,
        }
        .encode::<C>();

        info!(
            peer_device_id,
            peer_ik = %fingerprint(&C::dsa_pub_bytes(&bundle.identity_key)),
            spk_id = out.signed_prekey_id,
            opk = out.used_one_time_prekey_id.is_some(),
            "initiator session established"
        );
        Ok(DrSession::initiator(
            out.shared_secret(),
            out.associated_data.clone(),
            &bundle.signed_prekey,
            init,
            self.limits(),
        ))
    }

    /* decrypt */

    /// Decrypt one inbound message from a peer device. Returns the peer
    /// trust status together with the plaintext; a device in `fail`
    /// status is refused outright.
    pub fn decrypt(
        &mut self,
        local_device_id: &str,
        sender_user_id: &str,
        sender_device_id: &str,
        dr_message: &[u8],
        cipher_message: &[u8],
    ) -> Result<(PeerDeviceStatus, Vec<u8>), LimeError> {
        let user = self
            .store
            .load_local_user::<C>(local_device_id)?
            .ok_or_else(|| LimeError::Argument(format!("unknown device {local_device_id}")))?;

        if let Some((_, PeerDeviceStatus::Fail)) = self.store.peer_record(sender_device_id)? {
            return Err(LimeError::PeerTrust {
                device_id: sender_device_id.to_string(),
                status: PeerDeviceStatus::Fail,
            });
        }

        let parsed = envelope::parse_message::<C>(dr_message)?;
        let now = self.now();

        let plain = match &parsed.init {
            Some((block, raw)) => self.decrypt_with_init(
                &user, sender_user_id, sender_device_id, block, raw, &parsed, now,
            )?,
            None => self.decrypt_regular(&user, sender_device_id, &parsed, now)?,
        };

        // unwrap the shared body under the cipherMessage policy
        let plain = if cipher_message.is_empty() {
            plain
        } else {
            if plain.len() != CONTENT_KEY_LEN {
                return Err(LimeError::Protocol(
                    "DR payload is not a content key".into(),
                ));
            }
            let mut key = Zeroizing::new([0u8; CONTENT_KEY_LEN]);
            key.copy_from_slice(&plain);
            envelope::open_content(&key, cipher_message)?
        };

        let status = self
            .store
            .peer_record(sender_device_id)?
            .map(|(_, s)| s)
            .unwrap_or(PeerDeviceStatus::Unknown);
        Ok((status, plain))
    }

    #[allow(clippy::too_many_arguments)]
    fn decrypt_with_init(
        &mut self,
        user: &crate::store::LocalUser<C>,
        sender_user_id: &str,
        sender_device_id: &str,
        block: &X3dhInit,
        raw_init: &[u8],
        parsed: &envelope::ParsedMessage,
        now: u64,
    ) -> Result<Vec<u8>, LimeError> {
        // the init carries the claimed sender identity; a conflict with
        // the stored key is sticky
        let status = self
            .store
            .peer_record(sender_device_id)?
            .map(|(_, s)| s)
            .unwrap_or(PeerDeviceStatus::Unknown);
        let status = if status == PeerDeviceStatus::Unknown {
            PeerDeviceStatus::Untrusted
        } else {
            status
        };
        self.store
            .set_peer(sender_device_id, sender_user_id, &block.identity_key, status)?;

        // byte-identical init routes to the session it created
        let sessions = self.store.load_sessions(user.uid, sender_device_id)?;
        let matching = sessions.into_iter().find(|snap| {
            snap.role == SessionRole::Responder && snap.x3dh_init.as_deref() == Some(raw_init)
        });

        if let Some(snap) = matching {
            let mut session = DrSession::<C>::from_snapshot(snap, self.limits())?;
            match session.decrypt(&parsed.dh_pub, parsed.pn, parsed.n, &parsed.payload) {
                Ok(plain) => {
                    let mut snap = session.snapshot();
                    self.store.commit_session(
                        user.uid,
                        sender_device_id,
                        &mut snap,
                        None,
                        false,
                        now,
                    )?;
                    Ok(plain)
                }
                Err(e) => {
                    // repeated failures on init-carrying traffic kill
                    // the session so the peer can re-run X3DH
                    session.init_failures += 1;
                    if session.init_failures >= MAX_INIT_FAILURES {
                        warn!(sender_device_id, "session invalidated after repeated init failures");
                        self.store.delete_session(session.id)?;
                    } else {
                        let mut snap = session.snapshot();
                        self.store.commit_session(
                            user.uid,
                            sender_device_id,
                            &mut snap,
                            None,
                            false,
                            now,
                        )?;
                    }
                    Err(e.into())
                }
            }
        } else {
            // fresh responder half; the referenced prekeys must exist
            let spk = self
                .store
                .spk_by_id::<C>(user.uid, block.spk_id)?
                .ok_or_else(|| {
                    LimeError::Protocol(format!("unknown signed prekey {}", block.spk_id))
                })?;
            let opk = match block.opk_id {
                None => None,
                Some(id) => Some(self.store.opk_by_id::<C>(user.uid, id)?.ok_or_else(|| {
                    LimeError::Protocol(format!("one-time prekey {id} already consumed"))
                })?),
            };

            let peer_identity = C::dsa_pub_from_bytes(&block.identity_key)?;
            let peer_ephemeral = C::x_pub_from_bytes(&block.ephemeral_key)?;
            let out = x3dh::respond(
                &user.identity,
                &spk,
                opk.as_ref(),
                &peer_identity,
                &peer_ephemeral,
            )?;

            let mut session: DrSession<C> = DrSession::responder(
                out.shared_secret(),
                out.associated_data.clone(),
                spk.private_key().clone(),
                raw_init.to_vec(),
                self.limits(),
            );

            let plain = session.decrypt(&parsed.dh_pub, parsed.pn, parsed.n, &parsed.payload)?;

            // the new session, the OPk consumption and the supersession
            // of older sessions commit together
            let mut snap = session.snapshot();
            self.store.commit_session(
                user.uid,
                sender_device_id,
                &mut snap,
                block.opk_id,
                true,
                now,
            )?;
            info!(
                sender_device_id,
                peer_ik = %fingerprint(&block.identity_key),
                "responder session established"
            );
            Ok(plain)
        }
    }

    fn decrypt_regular(
        &mut self,
        user: &crate::store::LocalUser<C>,
        sender_device_id: &str,
        parsed: &envelope::ParsedMessage,
        now: u64,
    ) -> Result<Vec<u8>, LimeError> {
        let sessions = self.store.load_sessions(user.uid, sender_device_id)?;
        if sessions.is_empty() {
            return Err(LimeError::Protocol(format!(
                "no session with {sender_device_id}"
            )));
        }

        // active session first; stale ones may still hold skipped keys
        // for late out-of-order messages
        let mut first_error: Option<LimeError> = None;
        for snap in sessions {
            let mut session = DrSession::<C>::from_snapshot(snap, self.limits())?;
            match session.decrypt(&parsed.dh_pub, parsed.pn, parsed.n, &parsed.payload) {
                Ok(plain) => {
                    let mut snap = session.snapshot();
                    self.store.commit_session(
                        user.uid,
                        sender_device_id,
                        &mut snap,
                        None,
                        false,
                        now,
                    )?;
                    return Ok(plain);
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e.into());
                    }
                }
            }
        }
        Err(first_error.expect("at least one session was tried"))
    }

    /* maintenance */

    /// Prekey maintenance: rotate the signed prekey past its lifetime,
    /// purge retired ones past the grace window, replenish one-time
    /// prekeys below the watermark and drop long-stale sessions.
    pub fn update(
        &mut self,
        local_device_id: &str,
        opk_low_watermark: u16,
        opk_batch: u16,
    ) -> Result<(), LimeError> {
        let user = self
            .store
            .load_local_user::<C>(local_device_id)?
            .ok_or_else(|| LimeError::Argument(format!("unknown device {local_device_id}")))?;
        let now = self.now();

        // signed prekey rotation
        let rotate = match self.store.active_spk::<C>(user.uid)? {
            Some(spk) => now.saturating_sub(spk.created_at) > self.config.spk_lifetime.as_secs(),
            None => true,
        };
        if rotate {
            let spk = SignedPreKey::generate(self.store.next_spk_id(user.uid)?, &user.identity, now);
            let response = self
                .transport
                .post(local_device_id, &server::post_spk::<C>(&spk_upload::<C>(&spk)))?;
            expect_ack::<C>(&response)?;
            self.store.rotate_spk(user.uid, &spk)?;
            info!(local_device_id, spk_id = spk.id, "signed prekey rotated");
        }
        let spk_cutoff = now
            .saturating_sub(self.config.spk_lifetime.as_secs())
            .saturating_sub(self.config.spk_grace.as_secs());
        self.store.purge_spks_before(user.uid, spk_cutoff)?;

        // one-time prekey replenishment
        let response = self
            .transport
            .post(local_device_id, &server::get_self_opk_count::<C>())?;
        let count = match server::parse_response::<C>(&response)? {
            ServerResponse::SelfOpkCount(count) => count,
            _ => return Err(LimeError::Protocol("expected an OPk count".into())),
        };
        if count < opk_low_watermark {
            let first_id = self.store.next_opk_id(user.uid)?;
            let opks: Vec<_> = (first_id..first_id + u32::from(opk_batch))
                .map(OneTimePreKey::generate)
                .collect();
            let response = self
                .transport
                .post(local_device_id, &server::post_opks::<C>(&opk_uploads::<C>(&opks)))?;
            expect_ack::<C>(&response)?;
            self.store.insert_opks(user.uid, &opks)?;
            info!(local_device_id, uploaded = opks.len(), "one-time prekeys replenished");
        }

        // stale-session retention
        let session_cutoff = now.saturating_sub(self.config.session_retention.as_secs());
        self.store.purge_stale_sessions(session_cutoff)?;
        Ok(())
    }
}

/// Packaging choice per the encryption policy.
fn use_cipher_message<C: Curve>(
    policy: EncryptionPolicy,
    plain_len: usize,
    recipients: usize,
) -> bool {
    match policy {
        EncryptionPolicy::DrMessage => false,
        EncryptionPolicy::CipherMessage => true,
        EncryptionPolicy::OptimizeUploadSize => {
            recipients > 1 && plain_len * recipients > plain_len + recipients * POLICY_OVERHEAD
        }
        EncryptionPolicy::OptimizeGlobalBandwidth => {
            let dr_overhead = 3 + C::X_PUB_LEN + 8 + crate::crypto::AEAD_TAG_LEN;
            let dr_only = recipients * (plain_len + dr_overhead);
            let with_content = (1 + crate::crypto::AEAD_IV_LEN + plain_len + crate::crypto::AEAD_TAG_LEN)
                + recipients * (CONTENT_KEY_LEN + dr_overhead);
            with_content < dr_only
        }
    }
}

fn spk_upload<C: Curve>(spk: &SignedPreKey<C>) -> SpkUpload {
    SpkUpload {
        id: spk.id,
        public_key: C::x_pub_bytes(spk.public_key()),
        signature: C::sig_bytes(spk.signature()),
    }
}

fn opk_uploads<C: Curve>(opks: &[OneTimePreKey<C>]) -> Vec<OpkUpload> {
    opks.iter()
        .map(|opk| OpkUpload {
            id: opk.id,
            public_key: C::x_pub_bytes(opk.public_key()),
        })
        .collect()
}

fn expect_ack<C: Curve>(response: &[u8]) -> Result<(), LimeError> {
    match server::parse_response::<C>(response)? {
        ServerResponse::Ack => Ok(()),
        _ => Err(LimeError::Protocol("expected an acknowledgement".into())),
    }
}

/// Short hex fingerprint of a public key for log lines.
fn fingerprint(key: &[u8]) -> String {
    hex::encode(&key[..key.len().min(8)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::curve::C25519;

    type C = C25519;

    #[test]
    fn test_policy_chooser() {
        use EncryptionPolicy::*;
        // fixed policies
        assert!(!use_cipher_message::<C>(DrMessage, 10_240, 5));
        assert!(use_cipher_message::<C>(CipherMessage, 4, 1));
        // upload-size optimization: single recipient stays direct
        assert!(!use_cipher_message::<C>(OptimizeUploadSize, 10_240, 1));
        assert!(use_cipher_message::<C>(OptimizeUploadSize, 10_240, 5));
        // tiny payloads are cheaper inline even for a group
        assert!(!use_cipher_message::<C>(OptimizeUploadSize, 16, 5));
        // global bandwidth: large fan-out of a large payload shares one body
        assert!(use_cipher_message::<C>(OptimizeGlobalBandwidth, 10_240, 5));
        assert!(!use_cipher_message::<C>(OptimizeGlobalBandwidth, 16, 2));
    }

    #[test]
    fn test_recipient_starts_unknown() {
        let recipient = Recipient::new("bob.abc456");
        assert_eq!(recipient.status, PeerDeviceStatus::Unknown);
        assert!(recipient.dr_message.is_empty());
    }
}
