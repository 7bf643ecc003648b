//! Replicated object state.
//!
//! The server never stores these; they only exist in messages in flight and
//! in whatever the host keeps on the client side.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::math::{Quat, Vec3};

/// Largest spawn descriptor in bytes. The field is bounded to 4096 bytes on
/// the wire, two of which carry the length.
pub const MAX_DESCRIPTOR_LEN: usize = 4094;

/// Server-assigned object identifier.
///
/// Unique among live objects at any instant, but reused after deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Position, orientation and uniform scale of an object.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: f32,
}

impl Transform {
    pub const fn new(position: Vec3, rotation: Quat, scale: f32) -> Self {
        Self {
            position,
            rotation,
            scale,
        }
    }

    /// Identity rotation, unit scale.
    pub const fn at(position: Vec3) -> Self {
        Self::new(position, Quat::IDENTITY, 1.0)
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::at(Vec3::ZERO)
    }
}

/// Describes what the host should spawn for a new object (a prefab or mod
/// name, typically). Only sent with Add.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SpawnDescriptor(String);

impl SpawnDescriptor {
    /// Returns `None` when the descriptor is longer than [`MAX_DESCRIPTOR_LEN`].
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        (value.len() <= MAX_DESCRIPTOR_LEN).then_some(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SpawnDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_length_is_bounded() {
        assert!(SpawnDescriptor::new("x".repeat(MAX_DESCRIPTOR_LEN)).is_some());
        assert!(SpawnDescriptor::new("x".repeat(MAX_DESCRIPTOR_LEN + 1)).is_none());
    }
}
