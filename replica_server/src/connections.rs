//! Live-connection registry.
//!
//! Slots are invalidated in place while a tick is dispatching (so indices
//! stay valid for the rest of the tick) and physically removed by the next
//! [`ConnectionTable::prune`], which swap-removes. Slot order is therefore
//! not stable across ticks.

use replica_shared::transport::Connection;

#[derive(Debug, Default)]
pub struct ConnectionTable {
    slots: Vec<Option<Connection>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes invalidated slots and slots the transport reports dead.
    /// Returns how many were removed.
    pub fn prune(&mut self, mut is_live: impl FnMut(Connection) -> bool) -> usize {
        let before = self.slots.len();
        let mut i = 0;
        while i < self.slots.len() {
            match self.slots[i] {
                Some(conn) if is_live(conn) => i += 1,
                // The last slot moves into `i`; look at it before advancing.
                _ => {
                    self.slots.swap_remove(i);
                }
            }
        }
        before - self.slots.len()
    }

    /// Appends newly accepted peers until `accept` runs dry.
    pub fn accept_pending(&mut self, mut accept: impl FnMut() -> Option<Connection>) -> usize {
        let mut accepted = 0;
        while let Some(conn) = accept() {
            self.slots.push(Some(conn));
            accepted += 1;
        }
        accepted
    }

    /// Marks a slot dead for the rest of the tick.
    pub fn invalidate(&mut self, slot: usize) {
        if let Some(entry) = self.slots.get_mut(slot) {
            *entry = None;
        }
    }

    pub fn get(&self, slot: usize) -> Option<Connection> {
        self.slots.get(slot).copied().flatten()
    }

    /// Number of slots, including ones invalidated this tick.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Valid slots with their connections, in slot order.
    pub fn live(&self) -> impl Iterator<Item = (usize, Connection)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, conn)| conn.map(|c| (slot, c)))
    }

    pub fn live_count(&self) -> usize {
        self.live().count()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn conn(raw: u32) -> Connection {
        Connection::from_raw(raw)
    }

    fn table_of(conns: &[u32]) -> ConnectionTable {
        let mut table = ConnectionTable::new();
        let mut pending = conns.iter().map(|raw| conn(*raw));
        table.accept_pending(|| pending.next());
        table
    }

    fn live_set(table: &ConnectionTable) -> HashSet<Connection> {
        table.live().map(|(_, c)| c).collect()
    }

    #[test]
    fn prune_keeps_exactly_the_live_set() {
        let (a, b, c) = (conn(0), conn(1), conn(2));
        let mut table = table_of(&[0, 1, 2]);

        let removed = table.prune(|x| x != a);
        assert_eq!(removed, 1);
        assert_eq!(table.len(), 2);
        assert_eq!(live_set(&table), HashSet::from([b, c]));
    }

    #[test]
    fn prune_handles_consecutive_dead_slots_at_the_end() {
        let mut table = table_of(&[0, 1, 2, 3, 4]);
        let dead = HashSet::from([conn(0), conn(3), conn(4)]);
        table.prune(|x| !dead.contains(&x));
        assert_eq!(live_set(&table), HashSet::from([conn(1), conn(2)]));
    }

    #[test]
    fn invalidated_slot_is_skipped_then_pruned() {
        let mut table = table_of(&[0, 1, 2]);
        table.invalidate(1);
        assert_eq!(table.len(), 3);
        assert_eq!(table.get(1), None);
        assert_eq!(table.live_count(), 2);

        table.prune(|_| true);
        assert_eq!(table.len(), 2);
        assert_eq!(live_set(&table), HashSet::from([conn(0), conn(2)]));
    }

    #[test]
    fn accept_drains_until_empty() {
        let mut table = ConnectionTable::new();
        let mut queue = vec![conn(7), conn(8)];
        let accepted = table.accept_pending(|| queue.pop());
        assert_eq!(accepted, 2);
        assert!(queue.is_empty());
        assert_eq!(table.accept_pending(|| None), 0);
        assert_eq!(table.len(), 2);
    }
}
