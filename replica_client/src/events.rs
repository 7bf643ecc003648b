//! Host-facing replication events.
//!
//! The client session queues one [`ReplicaEvent`] per change originated
//! elsewhere. Hosts either drain the queue themselves or hand a
//! [`ReplicaHandler`] to `ClientSession::dispatch`.

use replica_shared::{
    object::{ObjectId, SpawnDescriptor, Transform},
    transport::DisconnectReason,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaEvent {
    /// An object was created. Also delivered for the client's own adds,
    /// carrying the identifier the server assigned.
    Added {
        id: ObjectId,
        transform: Transform,
        descriptor: SpawnDescriptor,
    },
    Modified {
        id: ObjectId,
        transform: Transform,
    },
    Deleted {
        id: ObjectId,
    },
    /// The transport dropped the session. Call `connect` again to recover.
    Disconnected(DisconnectReason),
}

impl ReplicaEvent {
    pub fn dispatch<H: ReplicaHandler + ?Sized>(self, handler: &mut H) {
        match self {
            ReplicaEvent::Added {
                id,
                transform,
                descriptor,
            } => handler.on_add(id, transform, descriptor),
            ReplicaEvent::Modified { id, transform } => handler.on_modify(id, transform),
            ReplicaEvent::Deleted { id } => handler.on_delete(id),
            ReplicaEvent::Disconnected(reason) => handler.on_disconnected(reason),
        }
    }
}

/// Receives replication events. Every method defaults to doing nothing.
pub trait ReplicaHandler {
    fn on_add(&mut self, _id: ObjectId, _transform: Transform, _descriptor: SpawnDescriptor) {}

    fn on_modify(&mut self, _id: ObjectId, _transform: Transform) {}

    fn on_delete(&mut self, _id: ObjectId) {}

    fn on_disconnected(&mut self, _reason: DisconnectReason) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Deletes(Vec<ObjectId>);

    impl ReplicaHandler for Deletes {
        fn on_delete(&mut self, id: ObjectId) {
            self.0.push(id);
        }
    }

    #[test]
    fn unhandled_events_fall_through_to_defaults() {
        let mut handler = Deletes::default();
        ReplicaEvent::Modified {
            id: ObjectId(1),
            transform: Transform::default(),
        }
        .dispatch(&mut handler);
        ReplicaEvent::Deleted { id: ObjectId(1) }.dispatch(&mut handler);
        assert_eq!(handler.0, vec![ObjectId(1)]);
    }
}
