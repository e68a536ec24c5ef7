//! Test fixtures: an in-memory key-distribution server speaking the
//! byte protocol, shared by every manager of a scenario.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lime::server::{self, OpkUpload, ServerRequest, ServerTransport, SpkUpload};
use lime::{C25519, LimeConfig, LimeError, LimeManager};

type C = C25519;

struct UserRecord {
    identity_key: Vec<u8>,
    spk: SpkUpload,
    opks: Vec<OpkUpload>,
}

/// Shared server state; each manager posts through its own transport
/// handle.
#[derive(Clone, Default)]
pub struct KeyServer {
    users: Arc<Mutex<HashMap<String, UserRecord>>>,
}

impl KeyServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> Box<dyn ServerTransport> {
        Box::new(Transport {
            users: self.users.clone(),
        })
    }

    pub fn remaining_opks(&self, device_id: &str) -> usize {
        self.users
            .lock()
            .unwrap()
            .get(device_id)
            .map(|u| u.opks.len())
            .unwrap_or(0)
    }
}

struct Transport {
    users: Arc<Mutex<HashMap<String, UserRecord>>>,
}

impl ServerTransport for Transport {
    fn post(&mut self, from_device_id: &str, request: &[u8]) -> Result<Vec<u8>, LimeError> {
        let request = server::parse_request::<C>(request)
            .map_err(|e| LimeError::Network(e.to_string()))?;
        let mut users = self.users.lock().unwrap();

        let reply = match request {
            ServerRequest::RegisterUser {
                identity_key,
                spk,
                opks,
            } => {
                if users.contains_key(from_device_id) {
                    server::error_response::<C>(2)
                } else {
                    users.insert(
                        from_device_id.to_string(),
                        UserRecord {
                            identity_key,
                            spk,
                            opks,
                        },
                    );
                    server::ack_response::<C>(server::TYPE_REGISTER_USER)
                }
            }
            ServerRequest::DeleteUser => {
                users.remove(from_device_id);
                server::ack_response::<C>(server::TYPE_DELETE_USER)
            }
            ServerRequest::PostSpk(spk) => match users.get_mut(from_device_id) {
                Some(user) => {
                    user.spk = spk;
                    server::ack_response::<C>(server::TYPE_POST_SPK)
                }
                None => server::error_response::<C>(1),
            },
            ServerRequest::PostOpks(opks) => match users.get_mut(from_device_id) {
                Some(user) => {
                    user.opks.extend(opks);
                    server::ack_response::<C>(server::TYPE_POST_OPKS)
                }
                None => server::error_response::<C>(1),
            },
            ServerRequest::GetPeerBundle(device_id) => match users.get_mut(&device_id) {
                Some(user) => {
                    // a one-time prekey leaves the server with the bundle
                    let opk = if user.opks.is_empty() {
                        None
                    } else {
                        Some(user.opks.remove(0))
                    };
                    server::bundle_response::<C>(&user.identity_key, &user.spk, opk.as_ref())
                }
                None => server::error_response::<C>(1),
            },
            ServerRequest::GetSelfOpkCount => match users.get(from_device_id) {
                Some(user) => server::self_opk_count_response::<C>(user.opks.len() as u16),
                None => server::error_response::<C>(1),
            },
        };
        Ok(reply)
    }
}

pub fn manager(server: &KeyServer) -> LimeManager<C> {
    LimeManager::new(":memory:", server.transport(), LimeConfig::default()).unwrap()
}
