// TURN client session (RFC 5766 / RFC 6062), independent of any socket
//
// The session builds requests, remembers which transactions are outstanding,
// and turns responses and indications into events. The transport owns the
// connection and decides what each event means for the allocation state.

use super::stun::{long_term_key, Attribute, Class, Method, StunError, StunMessage, TransactionId};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use zeroize::Zeroizing;

const SOFTWARE: &str = concat!("swarmlink ", env!("CARGO_PKG_VERSION"));

/// Stale-nonce retries allowed per request before giving up
const MAX_STALE_NONCE_RETRIES: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Allocate,
    Refresh,
    CreatePermission,
}

#[derive(Debug, Clone)]
enum Request {
    Allocate,
    Refresh { lifetime: u32 },
    CreatePermission { peers: Vec<IpAddr> },
}

impl Request {
    fn kind(&self) -> RequestKind {
        match self {
            Request::Allocate => RequestKind::Allocate,
            Request::Refresh { .. } => RequestKind::Refresh,
            Request::CreatePermission { .. } => RequestKind::CreatePermission,
        }
    }
}

#[derive(Debug)]
struct Pending {
    request: Request,
    sent_at: Instant,
    stale_retries: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Bytes to write on the control connection
    Transmit(Bytes),
    /// The server asked for credentials; the request was re-sent with them
    Challenged,
    Allocated {
        relayed: SocketAddr,
        mapped: Option<SocketAddr>,
        lifetime: Duration,
    },
    Refreshed {
        lifetime: Duration,
    },
    Deallocated,
    PermissionsInstalled(Vec<IpAddr>),
    /// A request was rejected by the server
    Failed {
        request: RequestKind,
        code: u16,
        reason: String,
    },
    /// Data relayed from a peer (UDP allocations)
    Data {
        peer: SocketAddr,
        payload: Vec<u8>,
    },
    /// A peer opened a TCP connection to our relayed address (RFC 6062)
    ConnectionAttempt {
        connection_id: u32,
        peer: SocketAddr,
    },
}

pub struct TurnSession {
    username: String,
    password: Zeroizing<String>,
    realm: String,
    nonce: Option<String>,
    key: Option<Zeroizing<[u8; 16]>>,
    requested_transport: u8,
    pending: HashMap<TransactionId, Pending>,
}

impl TurnSession {
    pub fn new(username: &str, password: &str, realm: &str, requested_transport: u8) -> Self {
        Self {
            username: username.to_string(),
            password: Zeroizing::new(password.to_string()),
            realm: realm.to_string(),
            nonce: None,
            key: None,
            requested_transport,
            pending: HashMap::new(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.key.is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn allocate(&mut self, now: Instant) -> Result<Bytes, StunError> {
        self.send_request(Request::Allocate, now, 0)
    }

    /// Refresh the allocation; a lifetime of zero releases it
    pub fn refresh(&mut self, lifetime: u32, now: Instant) -> Result<Bytes, StunError> {
        self.send_request(Request::Refresh { lifetime }, now, 0)
    }

    pub fn create_permission(&mut self, peers: Vec<IpAddr>, now: Instant) -> Result<Bytes, StunError> {
        self.send_request(Request::CreatePermission { peers }, now, 0)
    }

    /// Send indication carrying `data` to `peer`. Indications are not
    /// authenticated and get no response.
    pub fn send_indication(&self, peer: SocketAddr, data: &[u8]) -> Result<Bytes, StunError> {
        let message = StunMessage::indication(Method::Send)
            .with(Attribute::XorPeerAddress(peer))
            .with(Attribute::Data(data.to_vec()));
        Ok(Bytes::from(message.encode(None, true)?))
    }

    /// ConnectionBind request for a data connection. The response arrives
    /// on that data connection, so it is not tracked here.
    pub fn connection_bind(&self, connection_id: u32) -> Result<(TransactionId, Bytes), StunError> {
        let mut message =
            StunMessage::request(Method::ConnectionBind).with(Attribute::ConnectionId(connection_id));
        self.add_credentials(&mut message);
        let bytes = message.encode(self.key.as_ref().map(|k| &k[..]), true)?;
        Ok((message.transaction_id, Bytes::from(bytes)))
    }

    fn add_credentials(&self, message: &mut StunMessage) {
        if let (Some(nonce), Some(_)) = (&self.nonce, &self.key) {
            message.push(Attribute::Username(self.username.clone()));
            message.push(Attribute::Realm(self.realm.clone()));
            message.push(Attribute::Nonce(nonce.clone()));
        }
    }

    fn build(&self, request: &Request) -> StunMessage {
        let mut message = match request {
            Request::Allocate => StunMessage::request(Method::Allocate)
                .with(Attribute::RequestedTransport(self.requested_transport)),
            Request::Refresh { lifetime } => {
                StunMessage::request(Method::Refresh).with(Attribute::Lifetime(*lifetime))
            }
            Request::CreatePermission { peers } => {
                let mut message = StunMessage::request(Method::CreatePermission);
                for ip in peers {
                    message.push(Attribute::XorPeerAddress(SocketAddr::new(*ip, 0)));
                }
                message
            }
        };
        message.push(Attribute::Software(SOFTWARE.to_string()));
        self.add_credentials(&mut message);
        message
    }

    fn send_request(
        &mut self,
        request: Request,
        now: Instant,
        stale_retries: u8,
    ) -> Result<Bytes, StunError> {
        let message = self.build(&request);
        let bytes = message.encode(self.key.as_ref().map(|k| &k[..]), true)?;
        self.pending.insert(
            message.transaction_id,
            Pending {
                request,
                sent_at: now,
                stale_retries,
            },
        );
        Ok(Bytes::from(bytes))
    }

    /// Adopt realm/nonce from a challenge and derive the long-term key
    fn adopt_challenge(&mut self, message: &StunMessage) -> bool {
        let Some(nonce) = message.nonce() else {
            return false;
        };
        if let Some(realm) = message.realm() {
            self.realm = realm.to_string();
        }
        self.nonce = Some(nonce.to_string());
        self.key = Some(Zeroizing::new(long_term_key(
            &self.username,
            &self.realm,
            &self.password,
        )));
        true
    }

    /// Process one message received on the control connection
    pub fn handle(&mut self, message: &StunMessage, raw: &[u8], now: Instant) -> Vec<SessionEvent> {
        match message.class {
            Class::Indication => self.handle_indication(message),
            Class::Success | Class::Error => {
                let Some(pending) = self.pending.remove(&message.transaction_id) else {
                    debug!(method = ?message.method, "Ignoring response to unknown transaction");
                    return Vec::new();
                };
                if message.class == Class::Success {
                    self.handle_success(pending, message, raw)
                } else {
                    self.handle_error(pending, message, now)
                }
            }
            Class::Request => {
                debug!(method = ?message.method, "Ignoring request from server");
                Vec::new()
            }
        }
    }

    fn handle_indication(&self, message: &StunMessage) -> Vec<SessionEvent> {
        match message.method {
            Method::Data => match (message.xor_peer_address(), message.data()) {
                (Some(peer), Some(data)) => vec![SessionEvent::Data {
                    peer,
                    payload: data.to_vec(),
                }],
                _ => {
                    warn!("Data indication without peer address or payload");
                    Vec::new()
                }
            },
            Method::ConnectionAttempt => match (message.connection_id(), message.xor_peer_address()) {
                (Some(connection_id), Some(peer)) => {
                    vec![SessionEvent::ConnectionAttempt {
                        connection_id,
                        peer,
                    }]
                }
                _ => {
                    warn!("ConnectionAttempt without connection id or peer address");
                    Vec::new()
                }
            },
            other => {
                debug!(method = ?other, "Ignoring indication");
                Vec::new()
            }
        }
    }

    fn handle_success(&mut self, pending: Pending, message: &StunMessage, raw: &[u8]) -> Vec<SessionEvent> {
        if let Some(key) = &self.key {
            if message.has_integrity() && !super::stun::verify_integrity(raw, &key[..]) {
                warn!(method = ?message.method, "Response failed integrity check, dropping");
                // Put the transaction back; the genuine response may still come
                self.pending.insert(message.transaction_id, pending);
                return Vec::new();
            }
        }

        match pending.request {
            Request::Allocate => match message.xor_relayed_address() {
                Some(relayed) => vec![SessionEvent::Allocated {
                    relayed,
                    mapped: message.xor_mapped_address(),
                    lifetime: Duration::from_secs(u64::from(message.lifetime().unwrap_or(600))),
                }],
                None => vec![SessionEvent::Failed {
                    request: RequestKind::Allocate,
                    code: 0,
                    reason: "missing XOR-RELAYED-ADDRESS".to_string(),
                }],
            },
            Request::Refresh { lifetime: 0 } => vec![SessionEvent::Deallocated],
            Request::Refresh { lifetime } => {
                let granted = message.lifetime().unwrap_or(lifetime);
                vec![SessionEvent::Refreshed {
                    lifetime: Duration::from_secs(u64::from(granted)),
                }]
            }
            Request::CreatePermission { peers } => vec![SessionEvent::PermissionsInstalled(peers)],
        }
    }

    fn handle_error(&mut self, pending: Pending, message: &StunMessage, now: Instant) -> Vec<SessionEvent> {
        let (code, reason) = message
            .error_code()
            .map(|(c, r)| (c, r.to_string()))
            .unwrap_or((0, String::new()));
        let kind = pending.request.kind();

        // A first 401 is the credential challenge; 438 means our nonce expired
        let retry = if code == 401 && !self.is_authenticated() && self.adopt_challenge(message) {
            Some((true, 0))
        } else if code == 438
            && pending.stale_retries < MAX_STALE_NONCE_RETRIES
            && self.adopt_challenge(message)
        {
            Some((false, pending.stale_retries + 1))
        } else {
            None
        };

        match retry {
            Some((challenged, stale_retries)) => {
                debug!(request = ?kind, code, "Retrying request with fresh credentials");
                match self.send_request(pending.request, now, stale_retries) {
                    Ok(bytes) => {
                        let mut events = Vec::with_capacity(2);
                        if challenged {
                            events.push(SessionEvent::Challenged);
                        }
                        events.push(SessionEvent::Transmit(bytes));
                        events
                    }
                    Err(e) => vec![SessionEvent::Failed {
                        request: kind,
                        code,
                        reason: e.to_string(),
                    }],
                }
            }
            None => {
                // A refresh of a dead allocation is fine during teardown
                if let Request::Refresh { lifetime: 0 } = pending.request {
                    if code == 437 {
                        return vec![SessionEvent::Deallocated];
                    }
                }
                vec![SessionEvent::Failed {
                    request: kind,
                    code,
                    reason,
                }]
            }
        }
    }

    /// Drop requests that got no answer within `timeout`
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<RequestKind> {
        let expired: Vec<TransactionId> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.sent_at) >= timeout)
            .map(|(tid, _)| *tid)
            .collect();
        expired
            .into_iter()
            .filter_map(|tid| self.pending.remove(&tid))
            .map(|p| p.request.kind())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::stun::verify_integrity;

    fn decode(bytes: &[u8]) -> StunMessage {
        StunMessage::decode(bytes).unwrap()
    }

    fn challenge(request: &StunMessage, code: u16) -> StunMessage {
        StunMessage::response_to(request, Class::Error)
            .with(Attribute::ErrorCode {
                code,
                reason: "Unauthorized".to_string(),
            })
            .with(Attribute::Realm("example.org".to_string()))
            .with(Attribute::Nonce(format!("nonce-{code}")))
    }

    fn deliver(session: &mut TurnSession, message: &StunMessage, key: Option<&[u8]>) -> Vec<SessionEvent> {
        let raw = message.encode(key, true).unwrap();
        session.handle(&decode(&raw), &raw, Instant::now())
    }

    #[test]
    fn test_allocate_with_challenge() {
        let mut session = TurnSession::new("alice", "secret", "", 17);
        let now = Instant::now();

        let first = decode(&session.allocate(now).unwrap());
        assert_eq!(first.requested_transport(), Some(17));
        assert!(!first.has_integrity());

        let events = deliver(&mut session, &challenge(&first, 401), None);
        assert_eq!(events[0], SessionEvent::Challenged);
        let SessionEvent::Transmit(retry) = &events[1] else {
            panic!("expected retransmission");
        };
        let key = long_term_key("alice", "example.org", "secret");
        assert!(verify_integrity(retry, &key));
        let retry = decode(retry);
        assert_eq!(retry.username(), Some("alice"));
        assert_eq!(retry.nonce(), Some("nonce-401"));

        let relayed: SocketAddr = "203.0.113.5:49152".parse().unwrap();
        let mapped: SocketAddr = "198.51.100.7:40000".parse().unwrap();
        let success = StunMessage::response_to(&retry, Class::Success)
            .with(Attribute::XorRelayedAddress(relayed))
            .with(Attribute::XorMappedAddress(mapped))
            .with(Attribute::Lifetime(300));
        let events = deliver(&mut session, &success, Some(&key));
        assert_eq!(
            events,
            vec![SessionEvent::Allocated {
                relayed,
                mapped: Some(mapped),
                lifetime: Duration::from_secs(300),
            }]
        );
        assert_eq!(session.pending_len(), 0);
    }

    #[test]
    fn test_second_401_fails() {
        let mut session = TurnSession::new("alice", "wrong", "", 17);
        let first = decode(&session.allocate(Instant::now()).unwrap());
        let events = deliver(&mut session, &challenge(&first, 401), None);
        let SessionEvent::Transmit(retry) = &events[1] else {
            panic!("expected retransmission");
        };
        let events = deliver(&mut session, &challenge(&decode(retry), 401), None);
        assert!(matches!(
            events.as_slice(),
            [SessionEvent::Failed {
                request: RequestKind::Allocate,
                code: 401,
                ..
            }]
        ));
    }

    #[test]
    fn test_stale_nonce_is_retried() {
        let mut session = TurnSession::new("alice", "secret", "", 17);
        let first = decode(&session.allocate(Instant::now()).unwrap());
        deliver(&mut session, &challenge(&first, 401), None);

        let refresh = decode(&session.refresh(600, Instant::now()).unwrap());
        let events = deliver(&mut session, &challenge(&refresh, 438), None);
        let [SessionEvent::Transmit(retry)] = events.as_slice() else {
            panic!("expected a single retransmission, got {events:?}");
        };
        assert_eq!(decode(retry).nonce(), Some("nonce-438"));
    }

    #[test]
    fn test_data_and_connection_attempt_indications() {
        let mut session = TurnSession::new("u", "p", "r", 6);
        let peer: SocketAddr = "192.0.2.10:7000".parse().unwrap();

        let data = StunMessage::indication(Method::Data)
            .with(Attribute::XorPeerAddress(peer))
            .with(Attribute::Data(b"ping".to_vec()));
        assert_eq!(
            deliver(&mut session, &data, None),
            vec![SessionEvent::Data {
                peer,
                payload: b"ping".to_vec()
            }]
        );

        let attempt = StunMessage::indication(Method::ConnectionAttempt)
            .with(Attribute::ConnectionId(42))
            .with(Attribute::XorPeerAddress(peer));
        assert_eq!(
            deliver(&mut session, &attempt, None),
            vec![SessionEvent::ConnectionAttempt {
                connection_id: 42,
                peer
            }]
        );
    }

    #[test]
    fn test_permission_request_lists_peers() {
        let mut session = TurnSession::new("u", "p", "r", 17);
        let peers: Vec<IpAddr> = vec!["192.0.2.1".parse().unwrap(), "192.0.2.2".parse().unwrap()];
        let request = decode(&session.create_permission(peers.clone(), Instant::now()).unwrap());
        let listed: Vec<IpAddr> = request.xor_peer_addresses().map(|a| a.ip()).collect();
        assert_eq!(listed, peers);

        let ok = StunMessage::response_to(&request, Class::Success);
        assert_eq!(
            deliver(&mut session, &ok, None),
            vec![SessionEvent::PermissionsInstalled(peers)]
        );
    }

    #[test]
    fn test_unknown_transaction_is_ignored() {
        let mut session = TurnSession::new("u", "p", "r", 17);
        let stray = StunMessage::response_to(&StunMessage::request(Method::Allocate), Class::Success);
        assert!(deliver(&mut session, &stray, None).is_empty());
    }

    #[test]
    fn test_expire() {
        let mut session = TurnSession::new("u", "p", "r", 17);
        let start = Instant::now();
        session.allocate(start).unwrap();
        assert!(session.expire(start, Duration::from_secs(10)).is_empty());
        assert_eq!(
            session.expire(start + Duration::from_secs(10), Duration::from_secs(10)),
            vec![RequestKind::Allocate]
        );
        assert_eq!(session.pending_len(), 0);
    }

    #[test]
    fn test_deallocate_of_missing_allocation() {
        let mut session = TurnSession::new("u", "p", "r", 17);
        let request = decode(&session.refresh(0, Instant::now()).unwrap());
        let mismatch = StunMessage::response_to(&request, Class::Error).with(Attribute::ErrorCode {
            code: 437,
            reason: "Allocation Mismatch".to_string(),
        });
        assert_eq!(deliver(&mut session, &mismatch, None), vec![SessionEvent::Deallocated]);
    }
}
