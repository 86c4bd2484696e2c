//! STUN message codec (RFC 5389) with the TURN extensions used by the relay
//! client (RFC 5766, RFC 6062).
//!
//! Messages are a 20-byte header followed by TLV attributes padded to four
//! bytes. Address attributes are XOR-ed with the magic cookie (and, for IPv6,
//! the transaction id). MESSAGE-INTEGRITY is an HMAC-SHA1 over the message up
//! to that attribute; FINGERPRINT is a CRC-32 over the message up to itself.

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
pub const HEADER_LEN: usize = 20;
const FINGERPRINT_XOR: u32 = 0x5354_554e;
const INTEGRITY_LEN: usize = 20;

pub type TransactionId = [u8; 12];

type HmacSha1 = Hmac<Sha1>;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum StunError {
    #[error("Message truncated")]
    Truncated,
    #[error("Not a STUN message")]
    NotStun,
    #[error("Invalid magic cookie: {0:#010x}")]
    BadMagicCookie(u32),
    #[error("Invalid message length: {0}")]
    InvalidLength(usize),
    #[error("Unknown method: {0:#05x}")]
    UnknownMethod(u16),
    #[error("Malformed attribute {0:#06x}")]
    InvalidAttribute(u16),
    #[error("Unsupported address family: {0}")]
    AddressFamily(u8),
    #[error("Fingerprint mismatch")]
    FingerprintMismatch,
    #[error("Message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("Invalid integrity key")]
    InvalidKey,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// MESSAGE TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Binding,
    Allocate,
    Refresh,
    Send,
    Data,
    CreatePermission,
    Connect,
    ConnectionBind,
    ConnectionAttempt,
}

impl Method {
    pub fn code(self) -> u16 {
        match self {
            Method::Binding => 0x001,
            Method::Allocate => 0x003,
            Method::Refresh => 0x004,
            Method::Send => 0x006,
            Method::Data => 0x007,
            Method::CreatePermission => 0x008,
            Method::Connect => 0x00a,
            Method::ConnectionBind => 0x00b,
            Method::ConnectionAttempt => 0x00c,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0x001 => Method::Binding,
            0x003 => Method::Allocate,
            0x004 => Method::Refresh,
            0x006 => Method::Send,
            0x007 => Method::Data,
            0x008 => Method::CreatePermission,
            0x00a => Method::Connect,
            0x00b => Method::ConnectionBind,
            0x00c => Method::ConnectionAttempt,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Class {
    Request,
    Indication,
    Success,
    Error,
}

impl Class {
    fn bits(self) -> u16 {
        match self {
            Class::Request => 0b00,
            Class::Indication => 0b01,
            Class::Success => 0b10,
            Class::Error => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => Class::Request,
            0b01 => Class::Indication,
            0b10 => Class::Success,
            _ => Class::Error,
        }
    }
}

/// Interleave method and class bits into the 14-bit message type
pub fn message_type(method: Method, class: Class) -> u16 {
    let m = method.code();
    let c = class.bits();
    (m & 0x000f) | ((m & 0x0070) << 1) | ((m & 0x0f80) << 2) | ((c & 0b01) << 4) | ((c & 0b10) << 7)
}

fn split_message_type(t: u16) -> (u16, Class) {
    let m = (t & 0x000f) | ((t & 0x00e0) >> 1) | ((t & 0x3e00) >> 2);
    let c = ((t >> 4) & 0b01) | ((t >> 7) & 0b10);
    (m, Class::from_bits(c))
}

// ============================================================================
// ATTRIBUTES
// ============================================================================

mod attr {
    pub const USERNAME: u16 = 0x0006;
    pub const MESSAGE_INTEGRITY: u16 = 0x0008;
    pub const ERROR_CODE: u16 = 0x0009;
    pub const LIFETIME: u16 = 0x000d;
    pub const XOR_PEER_ADDRESS: u16 = 0x0012;
    pub const DATA: u16 = 0x0013;
    pub const REALM: u16 = 0x0014;
    pub const NONCE: u16 = 0x0015;
    pub const XOR_RELAYED_ADDRESS: u16 = 0x0016;
    pub const REQUESTED_TRANSPORT: u16 = 0x0019;
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    pub const CONNECTION_ID: u16 = 0x002a;
    pub const SOFTWARE: u16 = 0x8022;
    pub const FINGERPRINT: u16 = 0x8028;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    Username(String),
    Realm(String),
    Nonce(String),
    Software(String),
    ErrorCode { code: u16, reason: String },
    Lifetime(u32),
    RequestedTransport(u8),
    XorMappedAddress(SocketAddr),
    XorRelayedAddress(SocketAddr),
    XorPeerAddress(SocketAddr),
    Data(Vec<u8>),
    ConnectionId(u32),
    MessageIntegrity([u8; INTEGRITY_LEN]),
    Fingerprint(u32),
    Unknown { kind: u16, value: Vec<u8> },
}

impl Attribute {
    fn kind(&self) -> u16 {
        match self {
            Attribute::Username(_) => attr::USERNAME,
            Attribute::Realm(_) => attr::REALM,
            Attribute::Nonce(_) => attr::NONCE,
            Attribute::Software(_) => attr::SOFTWARE,
            Attribute::ErrorCode { .. } => attr::ERROR_CODE,
            Attribute::Lifetime(_) => attr::LIFETIME,
            Attribute::RequestedTransport(_) => attr::REQUESTED_TRANSPORT,
            Attribute::XorMappedAddress(_) => attr::XOR_MAPPED_ADDRESS,
            Attribute::XorRelayedAddress(_) => attr::XOR_RELAYED_ADDRESS,
            Attribute::XorPeerAddress(_) => attr::XOR_PEER_ADDRESS,
            Attribute::Data(_) => attr::DATA,
            Attribute::ConnectionId(_) => attr::CONNECTION_ID,
            Attribute::MessageIntegrity(_) => attr::MESSAGE_INTEGRITY,
            Attribute::Fingerprint(_) => attr::FINGERPRINT,
            Attribute::Unknown { kind, .. } => *kind,
        }
    }

    fn value(&self, tid: &TransactionId) -> Vec<u8> {
        match self {
            Attribute::Username(s)
            | Attribute::Realm(s)
            | Attribute::Nonce(s)
            | Attribute::Software(s) => s.as_bytes().to_vec(),
            Attribute::ErrorCode { code, reason } => {
                let mut v = vec![0, 0, ((code / 100) & 0x07) as u8, (code % 100) as u8];
                v.extend_from_slice(reason.as_bytes());
                v
            }
            Attribute::Lifetime(secs) => secs.to_be_bytes().to_vec(),
            Attribute::RequestedTransport(proto) => vec![*proto, 0, 0, 0],
            Attribute::XorMappedAddress(a)
            | Attribute::XorRelayedAddress(a)
            | Attribute::XorPeerAddress(a) => encode_xor_address(a, tid),
            Attribute::Data(d) => d.clone(),
            Attribute::ConnectionId(id) => id.to_be_bytes().to_vec(),
            Attribute::MessageIntegrity(mac) => mac.to_vec(),
            Attribute::Fingerprint(crc) => crc.to_be_bytes().to_vec(),
            Attribute::Unknown { value, .. } => value.clone(),
        }
    }

    fn decode(kind: u16, value: &[u8], tid: &TransactionId) -> Result<Self, StunError> {
        let text = || String::from_utf8(value.to_vec()).map_err(|_| StunError::InvalidAttribute(kind));
        let word = || -> Result<u32, StunError> {
            let bytes: [u8; 4] = value
                .get(..4)
                .and_then(|b| b.try_into().ok())
                .ok_or(StunError::InvalidAttribute(kind))?;
            Ok(u32::from_be_bytes(bytes))
        };

        Ok(match kind {
            attr::USERNAME => Attribute::Username(text()?),
            attr::REALM => Attribute::Realm(text()?),
            attr::NONCE => Attribute::Nonce(text()?),
            attr::SOFTWARE => Attribute::Software(text()?),
            attr::ERROR_CODE => {
                if value.len() < 4 {
                    return Err(StunError::InvalidAttribute(kind));
                }
                let code = u16::from(value[2] & 0x07) * 100 + u16::from(value[3]);
                let reason = String::from_utf8_lossy(&value[4..]).into_owned();
                Attribute::ErrorCode { code, reason }
            }
            attr::LIFETIME => Attribute::Lifetime(word()?),
            attr::REQUESTED_TRANSPORT => Attribute::RequestedTransport(
                *value.first().ok_or(StunError::InvalidAttribute(kind))?,
            ),
            attr::XOR_MAPPED_ADDRESS => Attribute::XorMappedAddress(decode_xor_address(kind, value, tid)?),
            attr::XOR_RELAYED_ADDRESS => Attribute::XorRelayedAddress(decode_xor_address(kind, value, tid)?),
            attr::XOR_PEER_ADDRESS => Attribute::XorPeerAddress(decode_xor_address(kind, value, tid)?),
            attr::DATA => Attribute::Data(value.to_vec()),
            attr::CONNECTION_ID => Attribute::ConnectionId(word()?),
            attr::MESSAGE_INTEGRITY => Attribute::MessageIntegrity(
                value.try_into().map_err(|_| StunError::InvalidAttribute(kind))?,
            ),
            attr::FINGERPRINT => Attribute::Fingerprint(word()?),
            _ => Attribute::Unknown {
                kind,
                value: value.to_vec(),
            },
        })
    }
}

fn encode_xor_address(addr: &SocketAddr, tid: &TransactionId) -> Vec<u8> {
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let mut v = Vec::with_capacity(20);
    match addr.ip() {
        IpAddr::V4(ip) => {
            v.extend_from_slice(&[0, 0x01]);
            v.extend_from_slice(&port.to_be_bytes());
            v.extend_from_slice(&(u32::from(ip) ^ MAGIC_COOKIE).to_be_bytes());
        }
        IpAddr::V6(ip) => {
            v.extend_from_slice(&[0, 0x02]);
            v.extend_from_slice(&port.to_be_bytes());
            let mask = xor_mask(tid);
            v.extend(ip.octets().iter().zip(mask.iter()).map(|(a, b)| a ^ b));
        }
    }
    v
}

fn decode_xor_address(kind: u16, value: &[u8], tid: &TransactionId) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::InvalidAttribute(kind));
    }
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
    match value[1] {
        0x01 => {
            let raw: [u8; 4] = value
                .get(4..8)
                .and_then(|b| b.try_into().ok())
                .ok_or(StunError::InvalidAttribute(kind))?;
            let ip = Ipv4Addr::from(u32::from_be_bytes(raw) ^ MAGIC_COOKIE);
            Ok(SocketAddr::new(IpAddr::V4(ip), port))
        }
        0x02 => {
            let raw = value.get(4..20).ok_or(StunError::InvalidAttribute(kind))?;
            let mask = xor_mask(tid);
            let mut octets = [0u8; 16];
            for (i, byte) in octets.iter_mut().enumerate() {
                *byte = raw[i] ^ mask[i];
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        family => Err(StunError::AddressFamily(family)),
    }
}

fn xor_mask(tid: &TransactionId) -> [u8; 16] {
    let mut mask = [0u8; 16];
    mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    mask[4..].copy_from_slice(tid);
    mask
}

// ============================================================================
// MESSAGE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    pub method: Method,
    pub class: Class,
    pub transaction_id: TransactionId,
    pub attributes: Vec<Attribute>,
}

impl StunMessage {
    /// New message with a random transaction id
    pub fn new(method: Method, class: Class) -> Self {
        Self {
            method,
            class,
            transaction_id: rand::random(),
            attributes: Vec::new(),
        }
    }

    pub fn request(method: Method) -> Self {
        Self::new(method, Class::Request)
    }

    pub fn indication(method: Method) -> Self {
        Self::new(method, Class::Indication)
    }

    /// Response sharing the transaction id of `request`
    pub fn response_to(request: &StunMessage, class: Class) -> Self {
        Self {
            method: request.method,
            class,
            transaction_id: request.transaction_id,
            attributes: Vec::new(),
        }
    }

    pub fn with(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn push(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::XorMappedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn xor_relayed_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::XorRelayedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn xor_peer_addresses(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.attributes.iter().filter_map(|a| match a {
            Attribute::XorPeerAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn xor_peer_address(&self) -> Option<SocketAddr> {
        self.xor_peer_addresses().next()
    }

    pub fn error_code(&self) -> Option<(u16, &str)> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::ErrorCode { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        })
    }

    pub fn lifetime(&self) -> Option<u32> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Lifetime(secs) => Some(*secs),
            _ => None,
        })
    }

    pub fn realm(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Realm(r) => Some(r.as_str()),
            _ => None,
        })
    }

    pub fn nonce(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Nonce(n) => Some(n.as_str()),
            _ => None,
        })
    }

    pub fn username(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Username(u) => Some(u.as_str()),
            _ => None,
        })
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Data(d) => Some(d.as_slice()),
            _ => None,
        })
    }

    pub fn connection_id(&self) -> Option<u32> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::ConnectionId(id) => Some(*id),
            _ => None,
        })
    }

    pub fn requested_transport(&self) -> Option<u8> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::RequestedTransport(p) => Some(*p),
            _ => None,
        })
    }

    pub fn has_integrity(&self) -> bool {
        self.attributes
            .iter()
            .any(|a| matches!(a, Attribute::MessageIntegrity(_)))
    }

    /// Serialize, appending MESSAGE-INTEGRITY when a key is given and
    /// FINGERPRINT when requested. Integrity and fingerprint attributes
    /// already present in `attributes` are recomputed, not copied.
    pub fn encode(&self, integrity_key: Option<&[u8]>, fingerprint: bool) -> Result<Vec<u8>, StunError> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 64);
        buf.extend_from_slice(&message_type(self.method, self.class).to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(&self.transaction_id);

        for attribute in &self.attributes {
            if matches!(
                attribute,
                Attribute::MessageIntegrity(_) | Attribute::Fingerprint(_)
            ) {
                continue;
            }
            write_attribute(&mut buf, attribute.kind(), &attribute.value(&self.transaction_id));
        }

        if let Some(key) = integrity_key {
            let length = buf.len() - HEADER_LEN + 4 + INTEGRITY_LEN;
            set_length(&mut buf, length)?;
            let mac = hmac_sha1(key, &buf)?;
            write_attribute(&mut buf, attr::MESSAGE_INTEGRITY, &mac);
        }

        if fingerprint {
            let length = buf.len() - HEADER_LEN + 8;
            set_length(&mut buf, length)?;
            let crc = crc32fast::hash(&buf) ^ FINGERPRINT_XOR;
            write_attribute(&mut buf, attr::FINGERPRINT, &crc.to_be_bytes());
        }

        let length = buf.len() - HEADER_LEN;
        set_length(&mut buf, length)?;
        Ok(buf)
    }

    /// Parse one complete message. A FINGERPRINT attribute, if present, is
    /// verified; MESSAGE-INTEGRITY is only extracted, see [`verify_integrity`].
    pub fn decode(buf: &[u8]) -> Result<Self, StunError> {
        if buf.len() < HEADER_LEN {
            return Err(StunError::Truncated);
        }
        let raw_type = u16::from_be_bytes([buf[0], buf[1]]);
        if raw_type & 0xc000 != 0 {
            return Err(StunError::NotStun);
        }
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if length % 4 != 0 || buf.len() != HEADER_LEN + length {
            return Err(StunError::InvalidLength(length));
        }
        let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(StunError::BadMagicCookie(cookie));
        }
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&buf[8..HEADER_LEN]);

        let (method_code, class) = split_message_type(raw_type);
        let method = Method::from_code(method_code).ok_or(StunError::UnknownMethod(method_code))?;

        let mut attributes = Vec::new();
        for (offset, kind, value) in AttributeIter::new(buf) {
            let value = value?;
            if kind == attr::FINGERPRINT {
                let expected = crc32fast::hash(&buf[..offset]) ^ FINGERPRINT_XOR;
                let attribute = Attribute::decode(kind, value, &transaction_id)?;
                if attribute != Attribute::Fingerprint(expected) {
                    return Err(StunError::FingerprintMismatch);
                }
                attributes.push(attribute);
                break;
            }
            attributes.push(Attribute::decode(kind, value, &transaction_id)?);
        }

        Ok(Self {
            method,
            class,
            transaction_id,
            attributes,
        })
    }
}

/// Walks `(offset, kind, value)` over the attributes of a raw message
struct AttributeIter<'a> {
    buf: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> AttributeIter<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: HEADER_LEN,
            done: false,
        }
    }
}

impl<'a> Iterator for AttributeIter<'a> {
    type Item = (usize, u16, Result<&'a [u8], StunError>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.buf.len() {
            return None;
        }
        let start = self.offset;
        let Some(header) = self.buf.get(start..start + 4) else {
            self.done = true;
            return Some((start, 0, Err(StunError::Truncated)));
        };
        let kind = u16::from_be_bytes([header[0], header[1]]);
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let Some(value) = self.buf.get(start + 4..start + 4 + len) else {
            self.done = true;
            return Some((start, kind, Err(StunError::Truncated)));
        };
        self.offset = start + 4 + ((len + 3) & !3);
        Some((start, kind, Ok(value)))
    }
}

fn write_attribute(buf: &mut Vec<u8>, kind: u16, value: &[u8]) {
    buf.extend_from_slice(&kind.to_be_bytes());
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value);
    let padding = (4 - value.len() % 4) % 4;
    buf.extend(std::iter::repeat(0u8).take(padding));
}

fn set_length(buf: &mut [u8], length: usize) -> Result<(), StunError> {
    let length = u16::try_from(length).map_err(|_| StunError::TooLarge {
        size: length,
        max: u16::MAX as usize,
    })?;
    buf[2..4].copy_from_slice(&length.to_be_bytes());
    Ok(())
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Result<[u8; INTEGRITY_LEN], StunError> {
    let mut mac = HmacSha1::new_from_slice(key).map_err(|_| StunError::InvalidKey)?;
    mac.update(data);
    let mut out = [0u8; INTEGRITY_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Check the MESSAGE-INTEGRITY attribute of a raw message against `key`.
/// Returns `false` when the attribute is missing or does not match.
pub fn verify_integrity(raw: &[u8], key: &[u8]) -> bool {
    let Some((offset, mac)) = AttributeIter::new(raw).find_map(|(offset, kind, value)| {
        match (kind, value) {
            (attr::MESSAGE_INTEGRITY, Ok(v)) if v.len() == INTEGRITY_LEN => Some((offset, v)),
            _ => None,
        }
    }) else {
        return false;
    };

    let mut covered = raw[..offset].to_vec();
    if set_length(&mut covered, offset - HEADER_LEN + 4 + INTEGRITY_LEN).is_err() {
        return false;
    }
    let Ok(mut hmac) = HmacSha1::new_from_slice(key) else {
        return false;
    };
    hmac.update(&covered);
    hmac.verify_slice(mac).is_ok()
}

/// Long-term credential key: MD5(username ":" realm ":" password)
pub fn long_term_key(username: &str, realm: &str, password: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(realm.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    let mut key = [0u8; 16];
    key.copy_from_slice(&hasher.finalize());
    key
}

/// Total length of the message starting at `header`, if the header is
/// plausible STUN
pub fn frame_len(header: &[u8]) -> Result<Option<usize>, StunError> {
    if header.len() < 4 {
        return Ok(None);
    }
    if header[0] & 0xc0 != 0 {
        return Err(StunError::NotStun);
    }
    let length = u16::from_be_bytes([header[2], header[3]]) as usize;
    if length % 4 != 0 {
        return Err(StunError::InvalidLength(length));
    }
    Ok(Some(HEADER_LEN + length))
}
