//! On-the-wire frame codec — one magic byte followed by zero-or-more
//! payload bytes. See spec §4.2.
//!
//! DATA frames are asymmetric by design: on interior hops the codec never
//! touches the payload (the already-framed bytes are forwarded verbatim),
//! so there is no `decode`/`encode` pair for the interior case — only
//! [`encode_data`] / [`DataPayload`] for the terminal boundary.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

pub const CONNECT: u8 = 0;
pub const CLOSE: u8 = 1;
pub const DATA: u8 = 2;
pub const ACK: u8 = 3;
pub const ERROR: u8 = 4;

const NONCE_CHARSET: &[u8] = b"ABCDEF1234567890";
const NONCE_LEN: usize = 32;

/// Magic byte of a framed message, or `None` for an empty buffer.
pub fn magic_of(bytes: &[u8]) -> Option<u8> {
    bytes.first().copied()
}

/// Payload bytes following the magic byte. Panics if `bytes` is empty —
/// callers must check [`magic_of`] first.
pub fn payload_of(bytes: &[u8]) -> &[u8] {
    &bytes[1..]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetAddr {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectPayload {
    pub hops: Vec<String>,
    pub target: TargetAddr,
    pub nonce: String,
    #[serde(default, with = "hex_bytes")]
    pub signature: Vec<u8>,
}

impl ConnectPayload {
    pub fn new(hops: Vec<String>, target: TargetAddr) -> Self {
        Self {
            hops,
            target,
            nonce: String::new(),
            signature: Vec::new(),
        }
    }

    /// Draw a fresh nonce and, if `key` is non-empty, sign it.
    pub fn dice_and_sign(&mut self, key: &[u8]) {
        self.nonce = generate_nonce();
        if !key.is_empty() {
            self.signature = sign(&self.nonce, key);
        }
    }

    /// Verify the CONNECT signature against `key`. A missing signature
    /// never validates, even against an empty key.
    pub fn valid(&self, key: &[u8]) -> bool {
        if self.signature.is_empty() {
            return false;
        }
        constant_time_eq(&self.signature, &sign(&self.nonce, key))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPayload {
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub reason: String,
}

pub fn encode_connect(payload: &ConnectPayload) -> Vec<u8> {
    encode(CONNECT, payload)
}

pub fn encode_close() -> Vec<u8> {
    vec![CLOSE]
}

pub fn encode_ack() -> Vec<u8> {
    vec![ACK]
}

pub fn encode_error(reason: impl Into<String>) -> Vec<u8> {
    encode(ERROR, &ErrorPayload { reason: reason.into() })
}

pub fn encode_data(data: Vec<u8>) -> Vec<u8> {
    encode(DATA, &DataPayload { data })
}

fn encode<T: Serialize>(magic: u8, payload: &T) -> Vec<u8> {
    let mut buf = serde_json::to_vec(payload).expect("frame payload serialization is infallible");
    buf.insert(0, magic);
    buf
}

pub fn decode_connect(bytes: &[u8]) -> serde_json::Result<ConnectPayload> {
    serde_json::from_slice(payload_of(bytes))
}

pub fn decode_data(bytes: &[u8]) -> serde_json::Result<DataPayload> {
    serde_json::from_slice(payload_of(bytes))
}

pub fn decode_error(bytes: &[u8]) -> serde_json::Result<ErrorPayload> {
    serde_json::from_slice(payload_of(bytes))
}

/// Draw a 32-character nonce uniformly from the hex alphabet.
pub fn generate_nonce() -> String {
    let mut rng = rand::thread_rng();
    (0..NONCE_LEN)
        .map(|_| NONCE_CHARSET[rng.gen_range(0..NONCE_CHARSET.len())] as char)
        .collect()
}

/// `SHA1(nonce || '.' || key)`.
pub fn sign(nonce: &str, key: &[u8]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(nonce.as_bytes());
    hasher.update(b".");
    hasher.update(key);
    hasher.finalize().to_vec()
}

/// Constant-time byte comparison — avoids leaking a timing oracle on the
/// CONNECT signature check.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Hex encoding for the `signature`/`data` byte fields — CONNECT and DATA
/// payloads are JSON, and JSON has no native byte-string type.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_is_32_hex_chars() {
        let nonce = generate_nonce();
        assert_eq!(nonce.len(), NONCE_LEN);
        assert!(nonce.bytes().all(|b| NONCE_CHARSET.contains(&b)));
    }

    #[test]
    fn signature_round_trips_through_connect_payload() {
        let mut payload = ConnectPayload::new(vec![], TargetAddr { ip: "127.0.0.1".into(), port: 80 });
        payload.dice_and_sign(b"sekret");
        let encoded = encode_connect(&payload);
        let decoded = decode_connect(&encoded).unwrap();
        assert!(decoded.valid(b"sekret"));
        assert!(!decoded.valid(b"wrong-key"));
    }

    #[test]
    fn missing_signature_never_validates() {
        let payload = ConnectPayload::new(vec![], TargetAddr { ip: "127.0.0.1".into(), port: 80 });
        assert!(!payload.valid(b""));
        assert!(!payload.valid(b"anything"));
    }

    #[test]
    fn data_payload_round_trips_arbitrary_bytes() {
        let bytes = vec![0u8, 1, 2, 255, 254, 10, 13];
        let encoded = encode_data(bytes.clone());
        assert_eq!(magic_of(&encoded), Some(DATA));
        let decoded = decode_data(&encoded).unwrap();
        assert_eq!(decoded.data, bytes);
    }

    #[test]
    fn error_payload_round_trips() {
        let encoded = encode_error("cannot connect: refused");
        assert_eq!(magic_of(&encoded), Some(ERROR));
        let decoded = decode_error(&encoded).unwrap();
        assert_eq!(decoded.reason, "cannot connect: refused");
    }
}
