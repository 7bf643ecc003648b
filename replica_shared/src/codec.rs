//! Replication wire codec.
//!
//! Every message has the same fixed layout, little-endian throughout:
//!
//! ```text
//! [secret: 32 bytes][opcode: u8][payload]
//! ```
//!
//! The secret field is a u16 length, the secret bytes, and zero padding.
//! Decoding checks the whole field before looking at anything else, so a
//! peer without the secret never gets past the first 32 bytes.
//!
//! Add is the only opcode whose payload depends on direction: a client does
//! not know the identifier yet, so the client→server form omits it. That is
//! why there are separate message enums and decode functions per direction.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{
    math::{Quat, Vec3},
    object::{ObjectId, SpawnDescriptor, Transform, MAX_DESCRIPTOR_LEN},
};

/// Size of the secret field on the wire.
pub const SECRET_FIELD_LEN: usize = 32;

/// Longest secret that fits in the field after its length prefix.
pub const MAX_SECRET_LEN: usize = SECRET_FIELD_LEN - 2;

const TRANSFORM_LEN: usize = 8 * 4;

/// Codec failures. Only `SecretTooLong` can come out of construction; the
/// rest are decode outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("secret does not match")]
    SecretMismatch,
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("message truncated")]
    Truncated,
    #[error("spawn descriptor is not valid UTF-8 or exceeds 4094 bytes")]
    InvalidDescriptor,
    #[error("secret is {0} bytes, at most 30 allowed")]
    SecretTooLong(usize),
}

/// Opcode byte following the secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Pinging = 1,
    Present = 2,
    Acknowledged = 3,
    Add = 4,
    Modify = 5,
    Delete = 6,
}

impl Opcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Opcode::Pinging),
            2 => Some(Opcode::Present),
            3 => Some(Opcode::Acknowledged),
            4 => Some(Opcode::Add),
            5 => Some(Opcode::Modify),
            6 => Some(Opcode::Delete),
            _ => None,
        }
    }
}

/// Shared secret gating every message.
///
/// Held in its encoded form so comparison is a plain byte compare of the
/// whole field.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    field: [u8; SECRET_FIELD_LEN],
}

impl Secret {
    pub fn new(secret: &str) -> Result<Self, CodecError> {
        let bytes = secret.as_bytes();
        if bytes.len() > MAX_SECRET_LEN {
            return Err(CodecError::SecretTooLong(bytes.len()));
        }
        let mut field = [0u8; SECRET_FIELD_LEN];
        field[..2].copy_from_slice(&(bytes.len() as u16).to_le_bytes());
        field[2..2 + bytes.len()].copy_from_slice(bytes);
        Ok(Self { field })
    }

    pub fn as_str(&self) -> &str {
        let len = u16::from_le_bytes([self.field[0], self.field[1]]) as usize;
        // Constructed from a &str, so this cannot fail.
        std::str::from_utf8(&self.field[2..2 + len]).unwrap_or_default()
    }

    fn matches(&self, field: &[u8]) -> bool {
        field == self.field
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(..)")
    }
}

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Pinging,
    Present,
    Add {
        transform: Transform,
        descriptor: SpawnDescriptor,
    },
    Modify {
        id: ObjectId,
        transform: Transform,
    },
    Delete {
        id: ObjectId,
    },
}

impl ClientMessage {
    pub fn opcode(&self) -> Opcode {
        match self {
            ClientMessage::Pinging => Opcode::Pinging,
            ClientMessage::Present => Opcode::Present,
            ClientMessage::Add { .. } => Opcode::Add,
            ClientMessage::Modify { .. } => Opcode::Modify,
            ClientMessage::Delete { .. } => Opcode::Delete,
        }
    }
}

/// Messages the server sends to clients.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Acknowledged,
    Add {
        id: ObjectId,
        transform: Transform,
        descriptor: SpawnDescriptor,
    },
    Modify {
        id: ObjectId,
        transform: Transform,
    },
    Delete {
        id: ObjectId,
    },
}

impl ServerMessage {
    pub fn opcode(&self) -> Opcode {
        match self {
            ServerMessage::Acknowledged => Opcode::Acknowledged,
            ServerMessage::Add { .. } => Opcode::Add,
            ServerMessage::Modify { .. } => Opcode::Modify,
            ServerMessage::Delete { .. } => Opcode::Delete,
        }
    }
}

pub fn encode_client(secret: &Secret, msg: &ClientMessage) -> Bytes {
    let mut buf = header(secret, msg.opcode());
    match msg {
        ClientMessage::Pinging | ClientMessage::Present => {}
        ClientMessage::Add {
            transform,
            descriptor,
        } => {
            put_transform(&mut buf, transform);
            put_descriptor(&mut buf, descriptor);
        }
        ClientMessage::Modify { id, transform } => {
            buf.put_u32_le(id.0);
            put_transform(&mut buf, transform);
        }
        ClientMessage::Delete { id } => buf.put_u32_le(id.0),
    }
    buf.freeze()
}

pub fn encode_server(secret: &Secret, msg: &ServerMessage) -> Bytes {
    let mut buf = header(secret, msg.opcode());
    match msg {
        ServerMessage::Acknowledged => {}
        ServerMessage::Add {
            id,
            transform,
            descriptor,
        } => {
            buf.put_u32_le(id.0);
            put_transform(&mut buf, transform);
            put_descriptor(&mut buf, descriptor);
        }
        ServerMessage::Modify { id, transform } => {
            buf.put_u32_le(id.0);
            put_transform(&mut buf, transform);
        }
        ServerMessage::Delete { id } => buf.put_u32_le(id.0),
    }
    buf.freeze()
}

/// Decodes a client→server message. Used by the server.
pub fn decode_client(secret: &Secret, bytes: &[u8]) -> Result<ClientMessage, CodecError> {
    let mut r = Reader::open(secret, bytes)?;
    let code = r.u8()?;
    match Opcode::from_u8(code) {
        Some(Opcode::Pinging) => Ok(ClientMessage::Pinging),
        Some(Opcode::Present) => Ok(ClientMessage::Present),
        Some(Opcode::Add) => Ok(ClientMessage::Add {
            transform: r.transform()?,
            descriptor: r.descriptor()?,
        }),
        Some(Opcode::Modify) => Ok(ClientMessage::Modify {
            id: r.id()?,
            transform: r.transform()?,
        }),
        Some(Opcode::Delete) => Ok(ClientMessage::Delete { id: r.id()? }),
        Some(Opcode::Acknowledged) | None => Err(CodecError::UnknownOpcode(code)),
    }
}

/// Decodes a server→client message. Used by the client.
pub fn decode_server(secret: &Secret, bytes: &[u8]) -> Result<ServerMessage, CodecError> {
    let mut r = Reader::open(secret, bytes)?;
    let code = r.u8()?;
    match Opcode::from_u8(code) {
        Some(Opcode::Acknowledged) => Ok(ServerMessage::Acknowledged),
        Some(Opcode::Add) => Ok(ServerMessage::Add {
            id: r.id()?,
            transform: r.transform()?,
            descriptor: r.descriptor()?,
        }),
        Some(Opcode::Modify) => Ok(ServerMessage::Modify {
            id: r.id()?,
            transform: r.transform()?,
        }),
        Some(Opcode::Delete) => Ok(ServerMessage::Delete { id: r.id()? }),
        Some(Opcode::Pinging) | Some(Opcode::Present) | None => {
            Err(CodecError::UnknownOpcode(code))
        }
    }
}

fn header(secret: &Secret, opcode: Opcode) -> BytesMut {
    let mut buf = BytesMut::with_capacity(SECRET_FIELD_LEN + 1 + 4 + TRANSFORM_LEN);
    buf.put_slice(&secret.field);
    buf.put_u8(opcode as u8);
    buf
}

fn put_transform(buf: &mut BytesMut, t: &Transform) {
    buf.put_f32_le(t.position.x);
    buf.put_f32_le(t.position.y);
    buf.put_f32_le(t.position.z);
    buf.put_f32_le(t.rotation.x);
    buf.put_f32_le(t.rotation.y);
    buf.put_f32_le(t.rotation.z);
    buf.put_f32_le(t.rotation.w);
    buf.put_f32_le(t.scale);
}

fn put_descriptor(buf: &mut BytesMut, d: &SpawnDescriptor) {
    buf.put_u16_le(d.len() as u16);
    buf.put_slice(d.as_str().as_bytes());
}

/// Bounds-checked cursor; `bytes::Buf` getters panic on short input.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn open(secret: &Secret, bytes: &'a [u8]) -> Result<Self, CodecError> {
        let mut r = Self { buf: bytes };
        // A message too short to hold the field cannot carry the secret.
        if r.buf.len() < SECRET_FIELD_LEN || !secret.matches(&r.buf[..SECRET_FIELD_LEN]) {
            return Err(CodecError::SecretMismatch);
        }
        r.buf.advance(SECRET_FIELD_LEN);
        Ok(r)
    }

    fn need(&self, n: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < n {
            return Err(CodecError::Truncated);
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn id(&mut self) -> Result<ObjectId, CodecError> {
        self.need(4)?;
        Ok(ObjectId(self.buf.get_u32_le()))
    }

    fn transform(&mut self) -> Result<Transform, CodecError> {
        self.need(TRANSFORM_LEN)?;
        let position = Vec3::new(
            self.buf.get_f32_le(),
            self.buf.get_f32_le(),
            self.buf.get_f32_le(),
        );
        let rotation = Quat::new(
            self.buf.get_f32_le(),
            self.buf.get_f32_le(),
            self.buf.get_f32_le(),
            self.buf.get_f32_le(),
        );
        let scale = self.buf.get_f32_le();
        Ok(Transform::new(position, rotation, scale))
    }

    fn descriptor(&mut self) -> Result<SpawnDescriptor, CodecError> {
        self.need(2)?;
        let len = self.buf.get_u16_le() as usize;
        if len > MAX_DESCRIPTOR_LEN {
            return Err(CodecError::InvalidDescriptor);
        }
        self.need(len)?;
        let text = std::str::from_utf8(&self.buf[..len])
            .map_err(|_| CodecError::InvalidDescriptor)?
            .to_owned();
        self.buf.advance(len);
        SpawnDescriptor::new(text).ok_or(CodecError::InvalidDescriptor)
    }
}
