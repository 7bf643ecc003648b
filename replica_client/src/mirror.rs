//! Client-side object mirror.
//!
//! A ready-made [`ReplicaHandler`] keeping the latest known state of every
//! replicated object. Hosts with their own scene graph can ignore it and map
//! identifiers themselves.

use std::collections::HashMap;

use replica_shared::{
    object::{ObjectId, SpawnDescriptor, Transform},
    transport::DisconnectReason,
};
use tracing::debug;

use crate::events::ReplicaHandler;

/// Last known state of one object.
#[derive(Debug, Clone, PartialEq)]
pub struct MirroredObject {
    pub descriptor: SpawnDescriptor,
    pub transform: Transform,
}

#[derive(Debug, Default)]
pub struct ObjectMirror {
    objects: HashMap<ObjectId, MirroredObject>,
}

impl ObjectMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ObjectId) -> Option<&MirroredObject> {
        self.objects.get(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Forgets every object. Use after ending a session locally.
    pub fn clear(&mut self) {
        self.objects.clear();
    }

    /// Objects sorted by identifier.
    pub fn sorted(&self) -> Vec<(ObjectId, &MirroredObject)> {
        let mut all: Vec<_> = self.objects.iter().map(|(id, o)| (*id, o)).collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }
}

impl ReplicaHandler for ObjectMirror {
    fn on_add(&mut self, id: ObjectId, transform: Transform, descriptor: SpawnDescriptor) {
        self.objects.insert(
            id,
            MirroredObject {
                descriptor,
                transform,
            },
        );
    }

    fn on_modify(&mut self, id: ObjectId, transform: Transform) {
        match self.objects.get_mut(&id) {
            Some(object) => object.transform = transform,
            None => debug!(%id, "modify for unknown object"),
        }
    }

    fn on_delete(&mut self, id: ObjectId) {
        self.objects.remove(&id);
    }

    fn on_disconnected(&mut self, _reason: DisconnectReason) {
        self.clear();
    }
}
