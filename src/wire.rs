//! Wire framing between sensor and master.
//!
//! Every frame is a msgpack array `[opcode, payload]`: self-delimiting, no
//! outer length prefix. The decoder is a streaming feeder: bytes arrive in
//! arbitrary chunks, complete frames come out one at a time and a truncated
//! frame stays buffered until more bytes arrive.
//!
//! Payload maps are encoded with a fixed key order so frames are
//! byte-identical to what earlier sensor generations produced.

use crate::types::MsgType;
use bytes::{Buf, BytesMut};
use rmpv::Value;
use std::io::Cursor;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("frame is not an (opcode, payload) pair")]
    Frame,

    #[error("bad {0} payload")]
    Payload(&'static str),
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// A password authentication attempt as captured by the sensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPayload {
    /// Dotted-quad IPv4 of the attacker.
    pub client: String,
    /// Remote SSH banner.
    pub version: String,
    pub user: String,
    /// Always present on the sensor side; absent in pubkey attempts.
    pub passwd: Option<String>,
    /// Seconds since epoch.
    pub time: u64,
}

/// A public key authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublickeyPayload {
    pub client: String,
    pub version: String,
    pub user: String,
    pub time: u64,
    /// Base64 body of the offered key.
    pub k64: String,
    /// Key size in bits.
    pub ksize: u64,
    /// Hex fingerprint, unique key identity in the store.
    pub kfp: String,
    /// Key type name, e.g. "ssh-rsa".
    pub ktype: String,
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello(String),
    ClientName(String),
    SshCredential(CredentialPayload),
    SshPublickey(PublickeyPayload),
    Ping,
    Pong,
    Goodbye,
}

impl Message {
    pub fn msgtype(&self) -> MsgType {
        match self {
            Message::Hello(_) => MsgType::Hello,
            Message::ClientName(_) => MsgType::ClientName,
            Message::SshCredential(_) => MsgType::SshCredential,
            Message::SshPublickey(_) => MsgType::SshPublickey,
            Message::Ping => MsgType::Ping,
            Message::Pong => MsgType::Pong,
            Message::Goodbye => MsgType::Goodbye,
        }
    }

    fn payload_value(&self) -> Value {
        match self {
            Message::Hello(s) | Message::ClientName(s) => Value::from(s.as_str()),
            Message::SshCredential(p) => {
                let mut map = vec![
                    (Value::from("client"), Value::from(p.client.as_str())),
                    (Value::from("version"), Value::from(p.version.as_str())),
                    (Value::from("user"), Value::from(p.user.as_str())),
                    (Value::from("time"), Value::from(p.time)),
                ];
                if let Some(passwd) = &p.passwd {
                    map.push((Value::from("passwd"), Value::from(passwd.as_str())));
                }
                Value::Map(map)
            }
            Message::SshPublickey(p) => Value::Map(vec![
                (Value::from("client"), Value::from(p.client.as_str())),
                (Value::from("version"), Value::from(p.version.as_str())),
                (Value::from("user"), Value::from(p.user.as_str())),
                (Value::from("time"), Value::from(p.time)),
                (Value::from("k64"), Value::from(p.k64.as_str())),
                (Value::from("ksize"), Value::from(p.ksize)),
                (Value::from("kfp"), Value::from(p.kfp.as_str())),
                (Value::from("ktype"), Value::from(p.ktype.as_str())),
            ]),
            Message::Ping | Message::Pong | Message::Goodbye => Value::Nil,
        }
    }

    /// Serialize to a complete wire frame.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        encode_frame(self.msgtype().code(), &self.payload_value())
    }

    /// Build a typed message from a raw decoded frame.
    ///
    /// A payload with the wrong shape is a protocol violation, not a decode
    /// error: the bytes were valid msgpack, the sender is just lying about
    /// the contract. PING/PONG/GOODBYE tolerate (and discard) junk payloads.
    pub fn from_wire(msgtype: MsgType, payload: &Value) -> Result<Message, WireError> {
        match msgtype {
            MsgType::Hello => match payload.as_str() {
                Some(s) => Ok(Message::Hello(s.to_owned())),
                None => Err(WireError::Payload("hello")),
            },
            MsgType::ClientName => match payload.as_str() {
                Some(s) => Ok(Message::ClientName(s.to_owned())),
                None => Err(WireError::Payload("client_name")),
            },
            MsgType::SshCredential => decode_credential(payload),
            MsgType::SshPublickey => decode_publickey(payload),
            MsgType::Ping => Ok(Message::Ping),
            MsgType::Pong => Ok(Message::Pong),
            MsgType::Goodbye => Ok(Message::Goodbye),
        }
    }
}

/// Serialize an `[opcode, payload]` pair.
pub fn encode_frame(code: u64, payload: &Value) -> Result<Vec<u8>, WireError> {
    let frame = Value::Array(vec![Value::from(code), payload.clone()]);
    let mut buf = Vec::with_capacity(64);
    rmpv::encode::write_value(&mut buf, &frame).map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(buf)
}

fn map_get<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

fn map_str(map: &[(Value, Value)], key: &str) -> Option<String> {
    map_get(map, key)?.as_str().map(str::to_owned)
}

fn decode_credential(payload: &Value) -> Result<Message, WireError> {
    let map = payload.as_map().ok_or(WireError::Payload("ssh_credential"))?;
    let credential = CredentialPayload {
        client: map_str(map, "client").ok_or(WireError::Payload("ssh_credential"))?,
        version: map_str(map, "version").ok_or(WireError::Payload("ssh_credential"))?,
        user: map_str(map, "user").ok_or(WireError::Payload("ssh_credential"))?,
        passwd: map_str(map, "passwd"),
        time: map_get(map, "time")
            .and_then(Value::as_u64)
            .ok_or(WireError::Payload("ssh_credential"))?,
    };
    Ok(Message::SshCredential(credential))
}

fn decode_publickey(payload: &Value) -> Result<Message, WireError> {
    let map = payload.as_map().ok_or(WireError::Payload("ssh_publickey"))?;
    let pubkey = PublickeyPayload {
        client: map_str(map, "client").ok_or(WireError::Payload("ssh_publickey"))?,
        version: map_str(map, "version").ok_or(WireError::Payload("ssh_publickey"))?,
        user: map_str(map, "user").ok_or(WireError::Payload("ssh_publickey"))?,
        time: map_get(map, "time")
            .and_then(Value::as_u64)
            .ok_or(WireError::Payload("ssh_publickey"))?,
        k64: map_str(map, "k64").ok_or(WireError::Payload("ssh_publickey"))?,
        ksize: map_get(map, "ksize")
            .and_then(Value::as_u64)
            .ok_or(WireError::Payload("ssh_publickey"))?,
        kfp: map_str(map, "kfp").ok_or(WireError::Payload("ssh_publickey"))?,
        ktype: map_str(map, "ktype").ok_or(WireError::Payload("ssh_publickey"))?,
    };
    Ok(Message::SshPublickey(pubkey))
}

// =============================================================================
// STREAMING DECODER
// =============================================================================

/// Streaming frame decoder.
///
/// Feed socket chunks in, pull complete `(opcode, payload)` tuples out.
/// msgpack frames are length-determined by their tag bytes, so an
/// incomplete value simply reads past the buffer end and stays queued.
#[derive(Default)]
pub struct Unpacker {
    buf: BytesMut,
}

impl Unpacker {
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Decode the next complete frame, or `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<(u64, Value)>, WireError> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&self.buf[..]);
        match rmpv::decode::read_value(&mut cursor) {
            Ok(value) => {
                let consumed = cursor.position() as usize;
                self.buf.advance(consumed);
                split_frame(value).map(Some)
            }
            Err(err) if is_incomplete(&err) => Ok(None),
            Err(err) => Err(WireError::Decode(err.to_string())),
        }
    }
}

fn split_frame(value: Value) -> Result<(u64, Value), WireError> {
    match value {
        Value::Array(mut items) if items.len() == 2 => {
            let payload = items.pop().unwrap_or(Value::Nil);
            let code = items
                .pop()
                .and_then(|v| v.as_u64())
                .ok_or(WireError::Frame)?;
            Ok((code, payload))
        }
        _ => Err(WireError::Frame),
    }
}

fn is_incomplete(err: &rmpv::decode::Error) -> bool {
    match err {
        rmpv::decode::Error::InvalidMarkerRead(e) | rmpv::decode::Error::InvalidDataRead(e) => {
            e.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential() -> Message {
        Message::SshCredential(CredentialPayload {
            client: "1.2.3.4".into(),
            version: "SSH-2.0-x".into(),
            user: "root".into(),
            passwd: Some("toor".into()),
            time: 1700000000,
        })
    }

    #[test]
    fn test_roundtrip_credential() {
        let msg = credential();
        let bytes = msg.encode().unwrap();

        let mut unpacker = Unpacker::new();
        unpacker.feed(&bytes);
        let (code, payload) = unpacker.next_frame().unwrap().unwrap();
        let msgtype = MsgType::from_code(code).unwrap();
        assert_eq!(Message::from_wire(msgtype, &payload).unwrap(), msg);
        assert!(unpacker.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_roundtrip_non_ascii() {
        let msg = Message::SshCredential(CredentialPayload {
            client: "1.2.3.4".into(),
            version: "SSH-2.0-Üñî".into(),
            user: "rôot".into(),
            passwd: Some("pässwörd".into()),
            time: 1700000000,
        });
        let bytes = msg.encode().unwrap();
        let mut unpacker = Unpacker::new();
        unpacker.feed(&bytes);
        let (code, payload) = unpacker.next_frame().unwrap().unwrap();
        let decoded = Message::from_wire(MsgType::from_code(code).unwrap(), &payload).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_streaming_single_byte_feeds() {
        let bytes = credential().encode().unwrap();
        let mut unpacker = Unpacker::new();

        for &byte in &bytes[..bytes.len() - 1] {
            unpacker.feed(&[byte]);
            assert!(unpacker.next_frame().unwrap().is_none());
        }
        unpacker.feed(&bytes[bytes.len() - 1..]);
        assert!(unpacker.next_frame().unwrap().is_some());
    }

    #[test]
    fn test_two_frames_one_chunk() {
        let mut bytes = Message::Ping.encode().unwrap();
        bytes.extend(Message::Goodbye.encode().unwrap());

        let mut unpacker = Unpacker::new();
        unpacker.feed(&bytes);
        assert_eq!(unpacker.next_frame().unwrap().unwrap().0, 10);
        assert_eq!(unpacker.next_frame().unwrap().unwrap().0, 16);
        assert!(unpacker.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_hello_byte_layout() {
        // fixarray(2), positive fixint 0, fixstr(10) "CPE1704TKS"
        let bytes = Message::Hello("CPE1704TKS".into()).encode().unwrap();
        let mut expected = vec![0x92, 0x00, 0xaa];
        expected.extend_from_slice(b"CPE1704TKS");
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_ping_byte_layout() {
        // fixarray(2), positive fixint 10, nil
        assert_eq!(Message::Ping.encode().unwrap(), vec![0x92, 0x0a, 0xc0]);
    }

    #[test]
    fn test_credential_byte_layout() {
        let bytes = credential().encode().unwrap();
        // fixarray(2), opcode 2, fixmap(5)
        assert_eq!(&bytes[..3], &[0x92, 0x02, 0x85]);
        // time encodes as uint32 1700000000
        let needle = [0xce, 0x65, 0x53, 0xf1, 0x00];
        assert!(bytes.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn test_goodbye_tolerates_junk_payload() {
        let bytes = encode_frame(16, &Value::from(42)).unwrap();
        let mut unpacker = Unpacker::new();
        unpacker.feed(&bytes);
        let (code, payload) = unpacker.next_frame().unwrap().unwrap();
        let msg = Message::from_wire(MsgType::from_code(code).unwrap(), &payload).unwrap();
        assert_eq!(msg, Message::Goodbye);
    }

    #[test]
    fn test_hello_rejects_non_string() {
        let err = Message::from_wire(MsgType::Hello, &Value::from(7)).unwrap_err();
        assert!(matches!(err, WireError::Payload("hello")));
    }

    #[test]
    fn test_frame_must_be_pair() {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &Value::Array(vec![Value::from(1)])).unwrap();
        let mut unpacker = Unpacker::new();
        unpacker.feed(&buf);
        assert!(unpacker.next_frame().is_err());
    }
}
