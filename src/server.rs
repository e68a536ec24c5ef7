//! Key-distribution server dialog
//!
//! Requests and responses share one framing:
//!
//! ```text
//! byte 0   protocol version (0x01)
//! byte 1   curve tag
//! byte 2   message type
//! byte 3   status code, responses only (0 = ok)
//! byte 4+  type-specific payload, fields length-prefixed (2 B BE)
//! ```
//!
//! The transport is injected: the core builds request buffers, posts
//! them through [`ServerTransport`] and parses the response. Timeouts
//! and retries are the transport implementer's concern.

use crate::crypto::curve::Curve;
use crate::crypto::{IdentityKeyPair, PreKeyBundle};
use crate::envelope::PROTOCOL_VERSION;
use crate::error::LimeError;

pub const TYPE_REGISTER_USER: u8 = 0x01;
pub const TYPE_DELETE_USER: u8 = 0x02;
pub const TYPE_POST_SPK: u8 = 0x03;
pub const TYPE_POST_OPKS: u8 = 0x04;
pub const TYPE_GET_PEER_BUNDLE: u8 = 0x05;
pub const TYPE_GET_SELF_OPKS: u8 = 0x06;
pub const TYPE_BUNDLE: u8 = 0x81;
pub const TYPE_SELF_OPKS: u8 = 0x82;
pub const TYPE_ERROR: u8 = 0xFF;

/// One request/response round trip with the key server. The device id
/// travels in the `From` header of the bearer.
pub trait ServerTransport {
    fn post(&mut self, from_device_id: &str, request: &[u8]) -> Result<Vec<u8>, LimeError>;
}

/// Dialog codec errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum DialogError {
    #[error("server message truncated")]
    Truncated,
    #[error("unknown protocol version {0:#04x}")]
    UnknownVersion(u8),
    #[error("curve tag does not match this deployment")]
    CurveMismatch,
    #[error("unexpected message type {0:#04x}")]
    UnexpectedType(u8),
    #[error("server refused the request, status {0}")]
    ServerError(u8),
    #[error("malformed server payload")]
    Malformed,
}

/// Signed prekey as uploaded: id || public || signature.
#[derive(Debug, Clone)]
pub struct SpkUpload {
    pub id: u32,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

/// One-time prekey as uploaded: id || public.
#[derive(Debug, Clone)]
pub struct OpkUpload {
    pub id: u32,
    pub public_key: Vec<u8>,
}

/// Decoded request, used by server implementations (the in-memory test
/// server speaks the same codec).
pub enum ServerRequest {
    RegisterUser {
        identity_key: Vec<u8>,
        spk: SpkUpload,
        opks: Vec<OpkUpload>,
    },
    DeleteUser,
    PostSpk(SpkUpload),
    PostOpks(Vec<OpkUpload>),
    GetPeerBundle(String),
    GetSelfOpkCount,
}

/// Decoded response, client side.
pub enum ServerResponse<C: Curve> {
    Ack,
    Bundle(PreKeyBundle<C>),
    SelfOpkCount(u16),
}

fn header<C: Curve>(msg_type: u8) -> Vec<u8> {
    vec![PROTOCOL_VERSION, C::ID.as_byte(), msg_type]
}

fn push_field(buf: &mut Vec<u8>, field: &[u8]) {
    let len = u16::try_from(field.len()).expect("field fits 16-bit length");
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(field);
}

fn spk_field(spk: &SpkUpload) -> Vec<u8> {
    let mut field = Vec::with_capacity(4 + spk.public_key.len() + spk.signature.len());
    field.extend_from_slice(&spk.id.to_be_bytes());
    field.extend_from_slice(&spk.public_key);
    field.extend_from_slice(&spk.signature);
    field
}

fn opk_field(opk: &OpkUpload) -> Vec<u8> {
    let mut field = Vec::with_capacity(4 + opk.public_key.len());
    field.extend_from_slice(&opk.id.to_be_bytes());
    field.extend_from_slice(&opk.public_key);
    field
}

/* request builders */

pub fn register_user<C: Curve>(
    identity: &IdentityKeyPair<C>,
    spk: &SpkUpload,
    opks: &[OpkUpload],
) -> Vec<u8> {
    let mut buf = header::<C>(TYPE_REGISTER_USER);
    push_field(&mut buf, &C::dsa_pub_bytes(identity.dsa_public()));
    push_field(&mut buf, &spk_field(spk));
    for opk in opks {
        push_field(&mut buf, &opk_field(opk));
    }
    buf
}

pub fn delete_user<C: Curve>() -> Vec<u8> {
    header::<C>(TYPE_DELETE_USER)
}

pub fn post_spk<C: Curve>(spk: &SpkUpload) -> Vec<u8> {
    let mut buf = header::<C>(TYPE_POST_SPK);
    push_field(&mut buf, &spk_field(spk));
    buf
}

pub fn post_opks<C: Curve>(opks: &[OpkUpload]) -> Vec<u8> {
    let mut buf = header::<C>(TYPE_POST_OPKS);
    for opk in opks {
        push_field(&mut buf, &opk_field(opk));
    }
    buf
}

pub fn get_peer_bundle<C: Curve>(peer_device_id: &str) -> Vec<u8> {
    let mut buf = header::<C>(TYPE_GET_PEER_BUNDLE);
    push_field(&mut buf, peer_device_id.as_bytes());
    buf
}

pub fn get_self_opk_count<C: Curve>() -> Vec<u8> {
    header::<C>(TYPE_GET_SELF_OPKS)
}

/* response builders, server side */

pub fn ack_response<C: Curve>(request_type: u8) -> Vec<u8> {
    vec![PROTOCOL_VERSION, C::ID.as_byte(), request_type, 0]
}

pub fn bundle_response<C: Curve>(
    identity_key: &[u8],
    spk: &SpkUpload,
    opk: Option<&OpkUpload>,
) -> Vec<u8> {
    let mut buf = vec![PROTOCOL_VERSION, C::ID.as_byte(), TYPE_BUNDLE, 0];
    push_field(&mut buf, identity_key);
    push_field(&mut buf, &spk_field(spk));
    if let Some(opk) = opk {
        push_field(&mut buf, &opk_field(opk));
    }
    buf
}

pub fn self_opk_count_response<C: Curve>(count: u16) -> Vec<u8> {
    let mut buf = vec![PROTOCOL_VERSION, C::ID.as_byte(), TYPE_SELF_OPKS, 0];
    push_field(&mut buf, &count.to_be_bytes());
    buf
}

pub fn error_response<C: Curve>(status: u8) -> Vec<u8> {
    vec![PROTOCOL_VERSION, C::ID.as_byte(), TYPE_ERROR, status]
}

/* parsers */

struct FieldReader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, at: 0 }
    }

    fn next(&mut self) -> Result<Option<&'a [u8]>, DialogError> {
        if self.at == self.buf.len() {
            return Ok(None);
        }
        if self.at + 2 > self.buf.len() {
            return Err(DialogError::Truncated);
        }
        let len =
            u16::from_be_bytes(self.buf[self.at..self.at + 2].try_into().expect("2 bytes")) as usize;
        self.at += 2;
        if self.at + len > self.buf.len() {
            return Err(DialogError::Truncated);
        }
        let field = &self.buf[self.at..self.at + len];
        self.at += len;
        Ok(Some(field))
    }

    fn expect(&mut self) -> Result<&'a [u8], DialogError> {
        self.next()?.ok_or(DialogError::Truncated)
    }
}

fn parse_spk_field<C: Curve>(field: &[u8]) -> Result<SpkUpload, DialogError> {
    if field.len() != 4 + C::X_PUB_LEN + C::SIG_LEN {
        return Err(DialogError::Malformed);
    }
    Ok(SpkUpload {
        id: u32::from_be_bytes(field[..4].try_into().expect("4 bytes")),
        public_key: field[4..4 + C::X_PUB_LEN].to_vec(),
        signature: field[4 + C::X_PUB_LEN..].to_vec(),
    })
}

fn parse_opk_field<C: Curve>(field: &[u8]) -> Result<OpkUpload, DialogError> {
    if field.len() != 4 + C::X_PUB_LEN {
        return Err(DialogError::Malformed);
    }
    Ok(OpkUpload {
        id: u32::from_be_bytes(field[..4].try_into().expect("4 bytes")),
        public_key: field[4..].to_vec(),
    })
}

fn check_prefix<C: Curve>(buf: &[u8], min: usize) -> Result<(), DialogError> {
    if buf.len() < min {
        return Err(DialogError::Truncated);
    }
    if buf[0] != PROTOCOL_VERSION {
        return Err(DialogError::UnknownVersion(buf[0]));
    }
    if buf[1] != C::ID.as_byte() {
        return Err(DialogError::CurveMismatch);
    }
    Ok(())
}

/// Parse a request buffer, server side.
pub fn parse_request<C: Curve>(buf: &[u8]) -> Result<ServerRequest, DialogError> {
    check_prefix::<C>(buf, 3)?;
    let mut fields = FieldReader::new(&buf[3..]);
    match buf[2] {
        TYPE_REGISTER_USER => {
            let identity_key = fields.expect()?.to_vec();
            let spk = parse_spk_field::<C>(fields.expect()?)?;
            let mut opks = Vec::new();
            while let Some(field) = fields.next()? {
                opks.push(parse_opk_field::<C>(field)?);
            }
            Ok(ServerRequest::RegisterUser {
                identity_key,
                spk,
                opks,
            })
        }
        TYPE_DELETE_USER => Ok(ServerRequest::DeleteUser),
        TYPE_POST_SPK => Ok(ServerRequest::PostSpk(parse_spk_field::<C>(
            fields.expect()?,
        )?)),
        TYPE_POST_OPKS => {
            let mut opks = Vec::new();
            while let Some(field) = fields.next()? {
                opks.push(parse_opk_field::<C>(field)?);
            }
            Ok(ServerRequest::PostOpks(opks))
        }
        TYPE_GET_PEER_BUNDLE => {
            let device_id = String::from_utf8(fields.expect()?.to_vec())
                .map_err(|_| DialogError::Malformed)?;
            Ok(ServerRequest::GetPeerBundle(device_id))
        }
        TYPE_GET_SELF_OPKS => Ok(ServerRequest::GetSelfOpkCount),
        other => Err(DialogError::UnexpectedType(other)),
    }
}

/// Parse a response buffer, client side.
pub fn parse_response<C: Curve>(buf: &[u8]) -> Result<ServerResponse<C>, DialogError> {
    check_prefix::<C>(buf, 4)?;
    let status = buf[3];
    if buf[2] == TYPE_ERROR || status != 0 {
        return Err(DialogError::ServerError(if status == 0 { 1 } else { status }));
    }

    let mut fields = FieldReader::new(&buf[4..]);
    match buf[2] {
        TYPE_BUNDLE => {
            let identity_key = C::dsa_pub_from_bytes(fields.expect()?)
                .map_err(|_| DialogError::Malformed)?;
            let spk = parse_spk_field::<C>(fields.expect()?)?;
            let opk = match fields.next()? {
                Some(field) => Some(parse_opk_field::<C>(field)?),
                None => None,
            };

            let signed_prekey =
                C::x_pub_from_bytes(&spk.public_key).map_err(|_| DialogError::Malformed)?;
            let signed_prekey_signature =
                C::sig_from_bytes(&spk.signature).map_err(|_| DialogError::Malformed)?;
            let one_time_prekey = match opk {
                None => None,
                Some(opk) => Some((
                    opk.id,
                    C::x_pub_from_bytes(&opk.public_key).map_err(|_| DialogError::Malformed)?,
                )),
            };

            Ok(ServerResponse::Bundle(PreKeyBundle {
                identity_key,
                signed_prekey,
                signed_prekey_id: spk.id,
                signed_prekey_signature,
                one_time_prekey,
            }))
        }
        TYPE_SELF_OPKS => {
            let field = fields.expect()?;
            if field.len() != 2 {
                return Err(DialogError::Malformed);
            }
            Ok(ServerResponse::SelfOpkCount(u16::from_be_bytes(
                field.try_into().expect("2 bytes"),
            )))
        }
        _ => Ok(ServerResponse::Ack),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::curve::C25519;
    use crate::crypto::{OneTimePreKey, SignedPreKey};

    type C = C25519;

    fn sample_spk() -> (IdentityKeyPair<C>, SpkUpload) {
        let identity = IdentityKeyPair::<C>::generate().unwrap();
        let spk = SignedPreKey::generate(3, &identity, 0);
        let upload = SpkUpload {
            id: spk.id,
            public_key: C::x_pub_bytes(spk.public_key()),
            signature: C::sig_bytes(spk.signature()),
        };
        (identity, upload)
    }

    #[test]
    fn test_register_user_round_trip() {
        let (identity, spk) = sample_spk();
        let opks: Vec<_> = (1..=4)
            .map(|id| {
                let opk = OneTimePreKey::<C>::generate(id);
                OpkUpload {
                    id: opk.id,
                    public_key: C::x_pub_bytes(opk.public_key()),
                }
            })
            .collect();

        let wire = register_user(&identity, &spk, &opks);
        match parse_request::<C>(&wire).unwrap() {
            ServerRequest::RegisterUser {
                identity_key,
                spk: got_spk,
                opks: got_opks,
            } => {
                assert_eq!(identity_key, C::dsa_pub_bytes(identity.dsa_public()));
                assert_eq!(got_spk.id, 3);
                assert_eq!(got_spk.public_key, spk.public_key);
                assert_eq!(got_opks.len(), 4);
                assert_eq!(got_opks[2].id, 3);
            }
            _ => panic!("wrong request type"),
        }
    }

    #[test]
    fn test_get_peer_bundle_round_trip() {
        let wire = get_peer_bundle::<C>("bob.abc456");
        match parse_request::<C>(&wire).unwrap() {
            ServerRequest::GetPeerBundle(id) => assert_eq!(id, "bob.abc456"),
            _ => panic!("wrong request type"),
        }
    }

    #[test]
    fn test_bundle_response_verifies() {
        let identity = IdentityKeyPair::<C>::generate().unwrap();
        let spk = SignedPreKey::generate(1, &identity, 0);
        let opk = OneTimePreKey::<C>::generate(9);

        let wire = bundle_response::<C>(
            &C::dsa_pub_bytes(identity.dsa_public()),
            &SpkUpload {
                id: spk.id,
                public_key: C::x_pub_bytes(spk.public_key()),
                signature: C::sig_bytes(spk.signature()),
            },
            Some(&OpkUpload {
                id: opk.id,
                public_key: C::x_pub_bytes(opk.public_key()),
            }),
        );

        match parse_response::<C>(&wire).unwrap() {
            ServerResponse::Bundle(bundle) => {
                assert!(bundle.verify());
                assert_eq!(bundle.signed_prekey_id, 1);
                assert_eq!(bundle.one_time_prekey.unwrap().0, 9);
            }
            _ => panic!("wrong response type"),
        }
    }

    #[test]
    fn test_self_opk_count_round_trip() {
        let wire = self_opk_count_response::<C>(42);
        match parse_response::<C>(&wire).unwrap() {
            ServerResponse::SelfOpkCount(n) => assert_eq!(n, 42),
            _ => panic!("wrong response type"),
        }
    }

    #[test]
    fn test_error_response_surfaces_status() {
        let wire = error_response::<C>(7);
        assert!(matches!(
            parse_response::<C>(&wire),
            Err(DialogError::ServerError(7))
        ));
    }

    #[test]
    fn test_ack_and_prefix_checks() {
        let wire = ack_response::<C>(TYPE_DELETE_USER);
        assert!(matches!(
            parse_response::<C>(&wire),
            Ok(ServerResponse::Ack)
        ));

        let mut bad = wire.clone();
        bad[1] = 0x02;
        assert!(matches!(
            parse_response::<C>(&bad),
            Err(DialogError::CurveMismatch)
        ));

        assert!(matches!(
            parse_request::<C>(&[PROTOCOL_VERSION]),
            Err(DialogError::Truncated)
        ));
    }
}
