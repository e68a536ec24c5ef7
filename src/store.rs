//! Durable local storage
//!
//! One SQLite database per manager holds the device identities, peer
//! trust records, prekey material and Double Ratchet sessions. The
//! store exclusively owns persisted key material; engines check out a
//! session snapshot, mutate it in memory and commit it back in one
//! transaction together with whatever prekey consumption the operation
//! implies.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::crypto::curve::Curve;
use crate::crypto::ratchet::{SessionRole, SessionSnapshot, SessionStatus};
use crate::crypto::{IdentityKeyPair, OneTimePreKey, SignedPreKey};
use crate::error::LimeError;
use crate::PeerDeviceStatus;

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS lime_LocalUsers (
    UserId     INTEGER PRIMARY KEY AUTOINCREMENT,
    DeviceId   TEXT NOT NULL UNIQUE,
    ServerUrl  TEXT NOT NULL,
    CurveId    INTEGER NOT NULL,
    Ik         BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS lime_PeerDevices (
    DeviceId   TEXT PRIMARY KEY,
    UserId     TEXT NOT NULL DEFAULT '',
    Ik         BLOB,
    Status     INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS lime_X3DH_SPk (
    UserId     INTEGER NOT NULL REFERENCES lime_LocalUsers(UserId) ON DELETE CASCADE,
    SPkId      INTEGER NOT NULL,
    SPk        BLOB NOT NULL,
    Sig        BLOB NOT NULL,
    Timestamp  INTEGER NOT NULL,
    Active     INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (UserId, SPkId)
);

CREATE TABLE IF NOT EXISTS lime_X3DH_OPk (
    UserId     INTEGER NOT NULL REFERENCES lime_LocalUsers(UserId) ON DELETE CASCADE,
    OPkId      INTEGER NOT NULL,
    OPk        BLOB NOT NULL,
    PRIMARY KEY (UserId, OPkId)
);

CREATE TABLE IF NOT EXISTS lime_DR_sessions (
    SessionId    INTEGER PRIMARY KEY AUTOINCREMENT,
    UserId       INTEGER NOT NULL REFERENCES lime_LocalUsers(UserId) ON DELETE CASCADE,
    PeerDeviceId TEXT NOT NULL,
    RK           BLOB NOT NULL,
    DHs          BLOB NOT NULL,
    DHr          BLOB,
    CKs          BLOB,
    CKsIndex     INTEGER NOT NULL DEFAULT 0,
    CKr          BLOB,
    CKrIndex     INTEGER NOT NULL DEFAULT 0,
    PN           INTEGER NOT NULL DEFAULT 0,
    AD           BLOB NOT NULL,
    Status       INTEGER NOT NULL,
    Role         INTEGER NOT NULL,
    X3DHInit     BLOB,
    InitFailures INTEGER NOT NULL DEFAULT 0,
    Timestamp    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS lime_DR_MSk_DHr (
    DHid       INTEGER PRIMARY KEY AUTOINCREMENT,
    SessionId  INTEGER NOT NULL REFERENCES lime_DR_sessions(SessionId) ON DELETE CASCADE,
    DHr        BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS lime_DR_MSk_Mk (
    DHid       INTEGER NOT NULL REFERENCES lime_DR_MSk_DHr(DHid) ON DELETE CASCADE,
    Nr         INTEGER NOT NULL,
    Mk         BLOB NOT NULL,
    SeqId      INTEGER NOT NULL,
    PRIMARY KEY (DHid, Nr)
);
";

/// A local device identity checked out of the store.
pub(crate) struct LocalUser<C: Curve> {
    pub uid: i64,
    pub device_id: String,
    pub server_url: String,
    pub identity: IdentityKeyPair<C>,
}

/// SQLite-backed store. Open exactly one per database file; the
/// connection takes an exclusive lock on first write.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if needed) the database at `path`. `":memory:"`
    /// yields a private in-memory database.
    pub fn open(path: &str) -> Result<Self, LimeError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "locking_mode", "EXCLUSIVE")?;
        conn.execute_batch(SCHEMA)?;
        info!(path, "local storage ready");
        Ok(Self { conn })
    }

    /* local users */

    pub(crate) fn create_local_user<C: Curve>(
        &mut self,
        device_id: &str,
        server_url: &str,
        identity: &IdentityKeyPair<C>,
        spk: &SignedPreKey<C>,
        opks: &[OneTimePreKey<C>],
    ) -> Result<i64, LimeError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO lime_LocalUsers (DeviceId, ServerUrl, CurveId, Ik) VALUES (?1, ?2, ?3, ?4)",
            params![
                device_id,
                server_url,
                C::ID.as_byte(),
                identity.to_bytes().as_slice()
            ],
        )?;
        let uid = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO lime_X3DH_SPk (UserId, SPkId, SPk, Sig, Timestamp, Active)
             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
            params![
                uid,
                spk.id,
                C::x_priv_bytes(spk.private_key()).as_slice(),
                C::sig_bytes(spk.signature()),
                spk.created_at
            ],
        )?;
        for opk in opks {
            tx.execute(
                "INSERT INTO lime_X3DH_OPk (UserId, OPkId, OPk) VALUES (?1, ?2, ?3)",
                params![uid, opk.id, C::x_priv_bytes(opk.private_key()).as_slice()],
            )?;
        }
        tx.commit()?;
        info!(device_id, uid, "local user created");
        Ok(uid)
    }

    pub(crate) fn load_local_user<C: Curve>(
        &self,
        device_id: &str,
    ) -> Result<Option<LocalUser<C>>, LimeError> {
        let row = self
            .conn
            .query_row(
                "SELECT UserId, ServerUrl, CurveId, Ik FROM lime_LocalUsers WHERE DeviceId = ?1",
                params![device_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u8>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((uid, server_url, curve, ik)) = row else {
            return Ok(None);
        };
        let ik = Zeroizing::new(ik);
        if curve != C::ID.as_byte() {
            return Err(LimeError::Argument(format!(
                "device {device_id} was created on another curve"
            )));
        }
        let identity = IdentityKeyPair::<C>::from_bytes(&ik)?;
        Ok(Some(LocalUser {
            uid,
            device_id: device_id.to_string(),
            server_url,
            identity,
        }))
    }

    pub(crate) fn delete_local_user(&mut self, device_id: &str) -> Result<(), LimeError> {
        let removed = self.conn.execute(
            "DELETE FROM lime_LocalUsers WHERE DeviceId = ?1",
            params![device_id],
        )?;
        if removed == 0 {
            return Err(LimeError::Argument(format!("unknown device {device_id}")));
        }
        info!(device_id, "local user deleted");
        Ok(())
    }

    /* signed prekeys */

    pub(crate) fn active_spk<C: Curve>(
        &self,
        uid: i64,
    ) -> Result<Option<SignedPreKey<C>>, LimeError> {
        self.spk_query::<C>(
            "SELECT SPkId, SPk, Sig, Timestamp FROM lime_X3DH_SPk
             WHERE UserId = ?1 AND Active = 1",
            params![uid],
        )
    }

    pub(crate) fn spk_by_id<C: Curve>(
        &self,
        uid: i64,
        spk_id: u32,
    ) -> Result<Option<SignedPreKey<C>>, LimeError> {
        self.spk_query::<C>(
            "SELECT SPkId, SPk, Sig, Timestamp FROM lime_X3DH_SPk
             WHERE UserId = ?1 AND SPkId = ?2",
            params![uid, spk_id],
        )
    }

    fn spk_query<C: Curve>(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<Option<SignedPreKey<C>>, LimeError> {
        let row = self
            .conn
            .query_row(sql, args, |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, u64>(3)?,
                ))
            })
            .optional()?;
        match row {
            None => Ok(None),
            Some((id, priv_bytes, sig, created_at)) => {
                let priv_bytes = Zeroizing::new(priv_bytes);
                Ok(Some(SignedPreKey::from_parts(
                    id,
                    &priv_bytes,
                    &sig,
                    created_at,
                )?))
            }
        }
    }

    /// Install a new active SPk, retiring the previous one. The retired
    /// key stays available for in-flight sessions until purge.
    pub(crate) fn rotate_spk<C: Curve>(
        &mut self,
        uid: i64,
        spk: &SignedPreKey<C>,
    ) -> Result<(), LimeError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE lime_X3DH_SPk SET Active = 0 WHERE UserId = ?1",
            params![uid],
        )?;
        tx.execute(
            "INSERT INTO lime_X3DH_SPk (UserId, SPkId, SPk, Sig, Timestamp, Active)
             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
            params![
                uid,
                spk.id,
                C::x_priv_bytes(spk.private_key()).as_slice(),
                C::sig_bytes(spk.signature()),
                spk.created_at
            ],
        )?;
        tx.commit()?;
        debug!(uid, spk_id = spk.id, "signed prekey rotated");
        Ok(())
    }

    pub(crate) fn next_spk_id(&self, uid: i64) -> Result<u32, LimeError> {
        let max: Option<u32> = self.conn.query_row(
            "SELECT MAX(SPkId) FROM lime_X3DH_SPk WHERE UserId = ?1",
            params![uid],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0) + 1)
    }

    /// Purge retired SPks created before `cutoff`.
    pub(crate) fn purge_spks_before(&mut self, uid: i64, cutoff: u64) -> Result<usize, LimeError> {
        let purged = self.conn.execute(
            "DELETE FROM lime_X3DH_SPk WHERE UserId = ?1 AND Active = 0 AND Timestamp < ?2",
            params![uid, cutoff],
        )?;
        if purged > 0 {
            debug!(uid, purged, "retired signed prekeys purged");
        }
        Ok(purged)
    }

    /* one-time prekeys */

    pub(crate) fn insert_opks<C: Curve>(
        &mut self,
        uid: i64,
        opks: &[OneTimePreKey<C>],
    ) -> Result<(), LimeError> {
        let tx = self.conn.transaction()?;
        for opk in opks {
            tx.execute(
                "INSERT INTO lime_X3DH_OPk (UserId, OPkId, OPk) VALUES (?1, ?2, ?3)",
                params![uid, opk.id, C::x_priv_bytes(opk.private_key()).as_slice()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub(crate) fn opk_by_id<C: Curve>(
        &self,
        uid: i64,
        opk_id: u32,
    ) -> Result<Option<OneTimePreKey<C>>, LimeError> {
        let row = self
            .conn
            .query_row(
                "SELECT OPk FROM lime_X3DH_OPk WHERE UserId = ?1 AND OPkId = ?2",
                params![uid, opk_id],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some(priv_bytes) => {
                let priv_bytes = Zeroizing::new(priv_bytes);
                Ok(Some(OneTimePreKey::from_parts(opk_id, &priv_bytes)?))
            }
        }
    }

    pub(crate) fn next_opk_id(&self, uid: i64) -> Result<u32, LimeError> {
        let max: Option<u32> = self.conn.query_row(
            "SELECT MAX(OPkId) FROM lime_X3DH_OPk WHERE UserId = ?1",
            params![uid],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0) + 1)
    }

    /* peer devices */

    pub(crate) fn peer_record(
        &self,
        device_id: &str,
    ) -> Result<Option<(Option<Vec<u8>>, PeerDeviceStatus)>, LimeError> {
        let row = self
            .conn
            .query_row(
                "SELECT Ik, Status FROM lime_PeerDevices WHERE DeviceId = ?1",
                params![device_id],
                |row| Ok((row.get::<_, Option<Vec<u8>>>(0)?, row.get::<_, u8>(1)?)),
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((ik, status)) => {
                let status = PeerDeviceStatus::from_u8(status)
                    .ok_or_else(|| LimeError::Argument("corrupt peer status".into()))?;
                Ok(Some((ik, status)))
            }
        }
    }

    /// Store or update a peer identity and trust status.
    ///
    /// A conflicting identity key is never overwritten: the record is
    /// forced to `fail` durably and the call errors.
    pub(crate) fn set_peer(
        &mut self,
        device_id: &str,
        user_id: &str,
        identity_key: &[u8],
        status: PeerDeviceStatus,
    ) -> Result<(), LimeError> {
        if let Some((Some(stored), _)) = self.peer_record(device_id)? {
            if stored != identity_key {
                warn!(
                    device_id,
                    stored = %hex::encode(&stored),
                    offered = %hex::encode(identity_key),
                    "peer identity key conflict, status forced to fail"
                );
                self.conn.execute(
                    "UPDATE lime_PeerDevices SET Status = ?2 WHERE DeviceId = ?1",
                    params![device_id, PeerDeviceStatus::Fail.as_u8()],
                )?;
                return Err(LimeError::PeerTrust {
                    device_id: device_id.to_string(),
                    status: PeerDeviceStatus::Fail,
                });
            }
        }
        self.conn.execute(
            "INSERT INTO lime_PeerDevices (DeviceId, UserId, Ik, Status) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(DeviceId) DO UPDATE SET
                 UserId = CASE WHEN excluded.UserId != '' THEN excluded.UserId ELSE UserId END,
                 Ik = excluded.Ik,
                 Status = excluded.Status",
            params![device_id, user_id, identity_key, status.as_u8()],
        )?;
        Ok(())
    }

    pub(crate) fn delete_peer(&mut self, device_id: &str) -> Result<(), LimeError> {
        self.conn.execute(
            "DELETE FROM lime_PeerDevices WHERE DeviceId = ?1",
            params![device_id],
        )?;
        Ok(())
    }

    /* Double Ratchet sessions */

    pub(crate) fn load_active_session(
        &self,
        uid: i64,
        peer_device_id: &str,
    ) -> Result<Option<SessionSnapshot>, LimeError> {
        let mut sessions = self.load_sessions(uid, peer_device_id)?;
        sessions.retain(|s| s.status != SessionStatus::Stale);
        Ok(sessions.into_iter().next())
    }

    /// All sessions with one peer device, active ones first, newest
    /// first within a status.
    pub(crate) fn load_sessions(
        &self,
        uid: i64,
        peer_device_id: &str,
    ) -> Result<Vec<SessionSnapshot>, LimeError> {
        let mut stmt = self.conn.prepare(
            "SELECT SessionId, RK, DHs, DHr, CKs, CKsIndex, CKr, CKrIndex, PN, AD, Status, Role,
                    X3DHInit, InitFailures
             FROM lime_DR_sessions
             WHERE UserId = ?1 AND PeerDeviceId = ?2
             ORDER BY (Status = 2), SessionId DESC",
        )?;
        let rows = stmt.query_map(params![uid, peer_device_id], |row| {
            Ok(RawSessionRow {
                id: row.get(0)?,
                rk: row.get(1)?,
                dhs: row.get(2)?,
                dhr: row.get(3)?,
                cks: row.get(4)?,
                cks_index: row.get(5)?,
                ckr: row.get(6)?,
                ckr_index: row.get(7)?,
                pn: row.get(8)?,
                ad: row.get(9)?,
                status: row.get(10)?,
                role: row.get(11)?,
                x3dh_init: row.get(12)?,
                init_failures: row.get(13)?,
            })
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            let row = row?;
            let skipped = self.load_skipped(row.id)?;
            sessions.push(row.into_snapshot(skipped)?);
        }
        Ok(sessions)
    }

    fn load_skipped(
        &self,
        session_id: i64,
    ) -> Result<Vec<(Vec<u8>, u32, Zeroizing<Vec<u8>>)>, LimeError> {
        let mut stmt = self.conn.prepare(
            "SELECT c.DHr, k.Nr, k.Mk
             FROM lime_DR_MSk_Mk k JOIN lime_DR_MSk_DHr c ON k.DHid = c.DHid
             WHERE c.SessionId = ?1
             ORDER BY k.SeqId",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;
        let mut skipped = Vec::new();
        for row in rows {
            let (dh, n, mk) = row?;
            skipped.push((dh, n, Zeroizing::new(mk)));
        }
        Ok(skipped)
    }

    /// Persist a session and, atomically with it, consume the one-time
    /// prekey the decryption depended on and stale any superseded
    /// sessions. Either everything commits or nothing does.
    pub(crate) fn commit_session(
        &mut self,
        uid: i64,
        peer_device_id: &str,
        snap: &mut SessionSnapshot,
        consumed_opk: Option<u32>,
        supersedes_others: bool,
        now: u64,
    ) -> Result<(), LimeError> {
        let tx = self.conn.transaction()?;

        if snap.id == 0 {
            tx.execute(
                "INSERT INTO lime_DR_sessions
                     (UserId, PeerDeviceId, RK, DHs, DHr, CKs, CKsIndex, CKr, CKrIndex, PN, AD,
                      Status, Role, X3DHInit, InitFailures, Timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    uid,
                    peer_device_id,
                    snap.root_key.as_slice(),
                    snap.dh_self_priv.as_slice(),
                    snap.dh_remote,
                    snap.ck_send.as_ref().map(|(k, _)| k.as_slice()),
                    snap.ck_send.as_ref().map(|(_, i)| *i).unwrap_or(0),
                    snap.ck_recv.as_ref().map(|(k, _)| k.as_slice()),
                    snap.ck_recv.as_ref().map(|(_, i)| *i).unwrap_or(0),
                    snap.pn,
                    snap.associated_data,
                    snap.status.as_u8(),
                    snap.role.as_u8(),
                    snap.x3dh_init,
                    snap.init_failures,
                    now
                ],
            )?;
            snap.id = tx.last_insert_rowid();
        } else {
            tx.execute(
                "UPDATE lime_DR_sessions SET
                     RK = ?2, DHs = ?3, DHr = ?4, CKs = ?5, CKsIndex = ?6, CKr = ?7,
                     CKrIndex = ?8, PN = ?9, Status = ?10, X3DHInit = ?11, InitFailures = ?12,
                     Timestamp = ?13
                 WHERE SessionId = ?1",
                params![
                    snap.id,
                    snap.root_key.as_slice(),
                    snap.dh_self_priv.as_slice(),
                    snap.dh_remote,
                    snap.ck_send.as_ref().map(|(k, _)| k.as_slice()),
                    snap.ck_send.as_ref().map(|(_, i)| *i).unwrap_or(0),
                    snap.ck_recv.as_ref().map(|(k, _)| k.as_slice()),
                    snap.ck_recv.as_ref().map(|(_, i)| *i).unwrap_or(0),
                    snap.pn,
                    snap.status.as_u8(),
                    snap.x3dh_init,
                    snap.init_failures,
                    now
                ],
            )?;
        }

        // replace the skipped-key rows with the snapshot's view
        tx.execute(
            "DELETE FROM lime_DR_MSk_DHr WHERE SessionId = ?1",
            params![snap.id],
        )?;
        let mut chain_ids: Vec<(Vec<u8>, i64)> = Vec::new();
        for (seq, (dh, n, mk)) in snap.skipped.iter().enumerate() {
            let dh_id = match chain_ids.iter().find(|(d, _)| d == dh) {
                Some((_, id)) => *id,
                None => {
                    tx.execute(
                        "INSERT INTO lime_DR_MSk_DHr (SessionId, DHr) VALUES (?1, ?2)",
                        params![snap.id, dh],
                    )?;
                    let id = tx.last_insert_rowid();
                    chain_ids.push((dh.clone(), id));
                    id
                }
            };
            tx.execute(
                "INSERT INTO lime_DR_MSk_Mk (DHid, Nr, Mk, SeqId) VALUES (?1, ?2, ?3, ?4)",
                params![dh_id, n, mk.as_slice(), seq as i64],
            )?;
        }

        if supersedes_others {
            tx.execute(
                "UPDATE lime_DR_sessions SET Status = ?4, Timestamp = ?3
                 WHERE UserId = ?1 AND PeerDeviceId = ?2 AND SessionId != ?5 AND Status != ?4",
                params![
                    uid,
                    peer_device_id,
                    now,
                    SessionStatus::Stale.as_u8(),
                    snap.id
                ],
            )?;
        }

        if let Some(opk_id) = consumed_opk {
            tx.execute(
                "DELETE FROM lime_X3DH_OPk WHERE UserId = ?1 AND OPkId = ?2",
                params![uid, opk_id],
            )?;
            debug!(uid, opk_id, "one-time prekey consumed");
        }

        tx.commit()?;
        Ok(())
    }

    pub(crate) fn delete_session(&mut self, session_id: i64) -> Result<(), LimeError> {
        self.conn.execute(
            "DELETE FROM lime_DR_sessions WHERE SessionId = ?1",
            params![session_id],
        )?;
        Ok(())
    }

    /// Drop stale sessions whose last activity is older than `cutoff`.
    pub(crate) fn purge_stale_sessions(&mut self, cutoff: u64) -> Result<usize, LimeError> {
        let purged = self.conn.execute(
            "DELETE FROM lime_DR_sessions WHERE Status = ?1 AND Timestamp < ?2",
            params![SessionStatus::Stale.as_u8(), cutoff],
        )?;
        if purged > 0 {
            info!(purged, "stale sessions purged");
        }
        Ok(purged)
    }
}

struct RawSessionRow {
    id: i64,
    rk: Vec<u8>,
    dhs: Vec<u8>,
    dhr: Option<Vec<u8>>,
    cks: Option<Vec<u8>>,
    cks_index: u32,
    ckr: Option<Vec<u8>>,
    ckr_index: u32,
    pn: u32,
    ad: Vec<u8>,
    status: u8,
    role: u8,
    x3dh_init: Option<Vec<u8>>,
    init_failures: u32,
}

impl RawSessionRow {
    fn into_snapshot(
        self,
        skipped: Vec<(Vec<u8>, u32, Zeroizing<Vec<u8>>)>,
    ) -> Result<SessionSnapshot, LimeError> {
        let corrupt = || LimeError::Argument("corrupt session row".into());
        Ok(SessionSnapshot {
            id: self.id,
            root_key: Zeroizing::new(self.rk),
            dh_self_priv: Zeroizing::new(self.dhs),
            dh_remote: self.dhr,
            ck_send: self.cks.map(|k| (Zeroizing::new(k), self.cks_index)),
            ck_recv: self.ckr.map(|k| (Zeroizing::new(k), self.ckr_index)),
            pn: self.pn,
            associated_data: self.ad,
            status: SessionStatus::from_u8(self.status).ok_or_else(corrupt)?,
            role: SessionRole::from_u8(self.role).ok_or_else(corrupt)?,
            x3dh_init: self.x3dh_init,
            init_failures: self.init_failures,
            skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::curve::C25519;
    use crate::crypto::ratchet::{DrSession, SkipLimits};
    use crate::crypto::{x3dh, PreKeyBundle};

    type C = C25519;

    fn store() -> Store {
        Store::open(":memory:").unwrap()
    }

    fn seed_user(store: &mut Store, device_id: &str) -> (i64, IdentityKeyPair<C>) {
        let identity = IdentityKeyPair::<C>::generate().unwrap();
        let spk = SignedPreKey::generate(1, &identity, 1000);
        let opks: Vec<_> = (1..=3).map(OneTimePreKey::generate).collect();
        let uid = store
            .create_local_user(device_id, "https://x3dh.example", &identity, &spk, &opks)
            .unwrap();
        (uid, identity)
    }

    #[test]
    fn test_local_user_round_trip() {
        let mut store = store();
        let (uid, identity) = seed_user(&mut store, "alice.xyz123");

        let user = store
            .load_local_user::<C>("alice.xyz123")
            .unwrap()
            .unwrap();
        assert_eq!(user.uid, uid);
        assert_eq!(user.server_url, "https://x3dh.example");
        assert!(user.identity.dsa_public() == identity.dsa_public());

        assert!(store.load_local_user::<C>("nobody").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let mut store = store();
        seed_user(&mut store, "alice.xyz123");
        let identity = IdentityKeyPair::<C>::generate().unwrap();
        let spk = SignedPreKey::generate(1, &identity, 0);
        assert!(store
            .create_local_user("alice.xyz123", "url", &identity, &spk, &[])
            .is_err());
    }

    #[test]
    fn test_spk_rotation_and_purge() {
        let mut store = store();
        let (uid, identity) = seed_user(&mut store, "alice.xyz123");

        assert_eq!(store.active_spk::<C>(uid).unwrap().unwrap().id, 1);
        assert_eq!(store.next_spk_id(uid).unwrap(), 2);

        let new_spk = SignedPreKey::generate(2, &identity, 2000);
        store.rotate_spk(uid, &new_spk).unwrap();
        assert_eq!(store.active_spk::<C>(uid).unwrap().unwrap().id, 2);
        // the retired key remains loadable through the grace window
        assert!(store.spk_by_id::<C>(uid, 1).unwrap().is_some());

        store.purge_spks_before(uid, 1500).unwrap();
        assert!(store.spk_by_id::<C>(uid, 1).unwrap().is_none());
        assert!(store.spk_by_id::<C>(uid, 2).unwrap().is_some());
    }

    #[test]
    fn test_opk_lifecycle() {
        let mut store = store();
        let (uid, _) = seed_user(&mut store, "bob.abc456");

        assert!(store.opk_by_id::<C>(uid, 2).unwrap().is_some());
        assert_eq!(store.next_opk_id(uid).unwrap(), 4);

        // consumption rides a session commit
        let mut snap = sample_session().snapshot();
        store
            .commit_session(uid, "peer.dev", &mut snap, Some(2), false, 10)
            .unwrap();
        assert!(store.opk_by_id::<C>(uid, 2).unwrap().is_none());
    }

    #[test]
    fn test_peer_trust_sticky_fail() {
        let mut store = store();
        store
            .set_peer("bob.abc456", "bob", &[1u8; 32], PeerDeviceStatus::Trusted)
            .unwrap();

        let err = store
            .set_peer("bob.abc456", "bob", &[2u8; 32], PeerDeviceStatus::Trusted)
            .unwrap_err();
        assert!(matches!(err, LimeError::PeerTrust { .. }));

        let (ik, status) = store.peer_record("bob.abc456").unwrap().unwrap();
        assert_eq!(status, PeerDeviceStatus::Fail);
        // the original key was never overwritten
        assert_eq!(ik.unwrap(), vec![1u8; 32]);
    }

    fn sample_session() -> DrSession<C> {
        let alice = IdentityKeyPair::<C>::generate().unwrap();
        let bob = IdentityKeyPair::<C>::generate().unwrap();
        let bob_spk = SignedPreKey::generate(1, &bob, 0);
        let bundle = PreKeyBundle::new(&bob, &bob_spk, None);
        let out = x3dh::initiate(&alice, &bundle).unwrap();
        DrSession::initiator(
            out.shared_secret(),
            out.associated_data.clone(),
            &bundle.signed_prekey,
            vec![1, 2, 3],
            SkipLimits::default(),
        )
    }

    #[test]
    fn test_session_commit_and_reload() {
        let mut store = store();
        let (uid, _) = seed_user(&mut store, "alice.xyz123");
        let mut session = sample_session();
        session.encrypt(b"advance the chain").unwrap();

        let mut snap = session.snapshot();
        store
            .commit_session(uid, "bob.abc456", &mut snap, None, false, 100)
            .unwrap();
        assert!(snap.id > 0);

        let loaded = store
            .load_active_session(uid, "bob.abc456")
            .unwrap()
            .unwrap();
        assert_eq!(loaded.id, snap.id);
        assert_eq!(loaded.ck_send.as_ref().unwrap().1, 1);
        assert_eq!(loaded.x3dh_init, Some(vec![1, 2, 3]));

        // restored session still encrypts
        let mut restored =
            DrSession::<C>::from_snapshot(loaded, SkipLimits::default()).unwrap();
        restored.encrypt(b"still alive").unwrap();
    }

    #[test]
    fn test_supersede_marks_stale() {
        let mut store = store();
        let (uid, _) = seed_user(&mut store, "alice.xyz123");

        let mut first = sample_session().snapshot();
        store
            .commit_session(uid, "bob.abc456", &mut first, None, false, 100)
            .unwrap();
        let mut second = sample_session().snapshot();
        store
            .commit_session(uid, "bob.abc456", &mut second, None, true, 200)
            .unwrap();

        let active = store
            .load_active_session(uid, "bob.abc456")
            .unwrap()
            .unwrap();
        assert_eq!(active.id, second.id);

        let all = store.load_sessions(uid, "bob.abc456").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].status, SessionStatus::Stale);

        // purge drops only sufficiently old stale sessions
        assert_eq!(store.purge_stale_sessions(150).unwrap(), 0);
        assert_eq!(store.purge_stale_sessions(250).unwrap(), 1);
    }

    #[test]
    fn test_cascade_delete_with_user() {
        let mut store = store();
        let (uid, _) = seed_user(&mut store, "alice.xyz123");
        let mut snap = sample_session().snapshot();
        store
            .commit_session(uid, "bob.abc456", &mut snap, None, false, 1)
            .unwrap();

        store.delete_local_user("alice.xyz123").unwrap();
        assert!(store.load_local_user::<C>("alice.xyz123").unwrap().is_none());
        assert!(store
            .load_sessions(uid, "bob.abc456")
            .unwrap()
            .is_empty());
        assert!(store.active_spk::<C>(uid).unwrap().is_none());
    }
}
