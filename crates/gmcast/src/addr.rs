//! Address bookkeeping for the reconnect policy.
//!
//! Two disjoint ordered maps keyed by canonical address string: `pending`
//! holds addresses we know of but have never established, `remote` holds
//! addresses that reached the established state at least once. The node's
//! own listen address is never allowed into either map.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::time::Instant;

use gmcast_core::NodeId;

use crate::error::Error;

/// Book half an address lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrSet {
    Pending,
    Remote,
}

/// Reconnect state for one known address.
///
/// `retry_cnt` is signed: negative values mean "established or declared
/// stable, plenty of budget left"; once it exceeds the configured maximum
/// the entry is dropped by the next reconnect sweep.
#[derive(Debug, Clone)]
pub struct AddrEntry {
    pub uuid: NodeId,
    pub retry_cnt: i32,
    pub next_reconnect: Instant,
}

impl AddrEntry {
    fn new(uuid: NodeId, now: Instant) -> Self {
        Self {
            uuid,
            retry_cnt: 0,
            next_reconnect: now,
        }
    }
}

#[derive(Debug)]
pub struct AddressBook {
    listen_addr: String,
    pending: BTreeMap<String, AddrEntry>,
    remote: BTreeMap<String, AddrEntry>,
}

impl AddressBook {
    pub fn new(listen_addr: String) -> Self {
        Self {
            listen_addr,
            pending: BTreeMap::new(),
            remote: BTreeMap::new(),
        }
    }

    pub fn pending(&self) -> &BTreeMap<String, AddrEntry> {
        &self.pending
    }

    pub fn remote(&self) -> &BTreeMap<String, AddrEntry> {
        &self.remote
    }

    fn map(&self, set: AddrSet) -> &BTreeMap<String, AddrEntry> {
        match set {
            AddrSet::Pending => &self.pending,
            AddrSet::Remote => &self.remote,
        }
    }

    fn map_mut(&mut self, set: AddrSet) -> &mut BTreeMap<String, AddrEntry> {
        match set {
            AddrSet::Pending => &mut self.pending,
            AddrSet::Remote => &mut self.remote,
        }
    }

    /// Insert a new entry. Adding the node's own listen address is an
    /// invariant violation; adding an address the book already holds is a
    /// logged no-op.
    pub fn insert(
        &mut self,
        set: AddrSet,
        addr: &str,
        uuid: NodeId,
        now: Instant,
    ) -> Result<(), Error> {
        if addr == self.listen_addr {
            return Err(Error::Invariant(format!(
                "trying to add own listen address {addr} to address list"
            )));
        }
        let other = match set {
            AddrSet::Pending => AddrSet::Remote,
            AddrSet::Remote => AddrSet::Pending,
        };
        if self.map(other).contains_key(addr) {
            tracing::warn!(addr, ?set, "address already tracked in the other list");
            return Ok(());
        }
        match self.map_mut(set).entry(addr.to_string()) {
            Entry::Occupied(_) => {
                tracing::warn!(addr, ?set, "duplicate address entry");
            }
            Entry::Vacant(slot) => {
                tracing::debug!(addr, uuid = %uuid, ?set, "new address entry");
                slot.insert(AddrEntry::new(uuid, now));
            }
        }
        Ok(())
    }

    pub fn get(&self, set: AddrSet, addr: &str) -> Option<&AddrEntry> {
        self.map(set).get(addr)
    }

    pub fn get_mut(&mut self, set: AddrSet, addr: &str) -> Option<&mut AddrEntry> {
        self.map_mut(set).get_mut(addr)
    }

    pub fn remove(&mut self, set: AddrSet, addr: &str) -> Option<AddrEntry> {
        self.map_mut(set).remove(addr)
    }

    /// Find an address in either map, pending first.
    pub fn find_mut(&mut self, addr: &str) -> Option<(AddrSet, &mut AddrEntry)> {
        if let Some(entry) = self.pending.get_mut(addr) {
            return Some((AddrSet::Pending, entry));
        }
        self.remote
            .get_mut(addr)
            .map(|entry| (AddrSet::Remote, entry))
    }

    /// Push every entry carrying `uuid` over the retry budget so the next
    /// reconnect sweep evicts it.
    pub fn penalize(&mut self, uuid: NodeId, retry_cnt: i32, next_reconnect: Instant) {
        for entry in self
            .pending
            .values_mut()
            .chain(self.remote.values_mut())
            .filter(|e| e.uuid == uuid)
        {
            entry.retry_cnt = retry_cnt;
            entry.next_reconnect = next_reconnect;
        }
    }

    /// Reset the failure budget of every remote entry carrying `uuid`.
    /// Returns whether any entry matched.
    pub fn declare_stable(&mut self, uuid: NodeId) -> bool {
        let mut found = false;
        for entry in self.remote.values_mut().filter(|e| e.uuid == uuid) {
            entry.retry_cnt = -1;
            found = true;
        }
        found
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.remote.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn book() -> (AddressBook, NodeId, Instant) {
        let mut rng = StdRng::seed_from_u64(11);
        (
            AddressBook::new("tcp://10.0.0.1:4567".into()),
            NodeId::random(&mut rng),
            Instant::now(),
        )
    }

    #[test]
    fn own_listen_address_is_rejected() {
        let (mut book, uuid, now) = book();
        let err = book
            .insert(AddrSet::Pending, "tcp://10.0.0.1:4567", uuid, now)
            .unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
        assert!(book.pending().is_empty());
    }

    #[test]
    fn maps_stay_disjoint() {
        let (mut book, uuid, now) = book();
        let addr = "tcp://10.0.0.2:4567";
        book.insert(AddrSet::Remote, addr, uuid, now).unwrap();
        // A later pending insert for the same address must not take.
        book.insert(AddrSet::Pending, addr, uuid, now).unwrap();
        assert!(book.get(AddrSet::Pending, addr).is_none());
        assert!(book.get(AddrSet::Remote, addr).is_some());
    }

    #[test]
    fn duplicate_insert_keeps_first_entry() {
        let (mut book, uuid, now) = book();
        let addr = "tcp://10.0.0.2:4567";
        book.insert(AddrSet::Pending, addr, uuid, now).unwrap();
        book.get_mut(AddrSet::Pending, addr).unwrap().retry_cnt = 5;
        book.insert(AddrSet::Pending, addr, NodeId::nil(), now)
            .unwrap();
        let entry = book.get(AddrSet::Pending, addr).unwrap();
        assert_eq!(entry.retry_cnt, 5);
        assert_eq!(entry.uuid, uuid);
    }

    #[test]
    fn pending_to_remote_promotion() {
        let (mut book, uuid, now) = book();
        let addr = "tcp://10.0.0.2:4567";
        book.insert(AddrSet::Pending, addr, NodeId::nil(), now)
            .unwrap();
        book.remove(AddrSet::Pending, addr).unwrap();
        book.insert(AddrSet::Remote, addr, uuid, now).unwrap();
        assert!(book.get(AddrSet::Pending, addr).is_none());
        assert_eq!(book.get(AddrSet::Remote, addr).unwrap().uuid, uuid);
    }

    #[test]
    fn penalize_touches_every_entry_with_uuid() {
        let (mut book, uuid, now) = book();
        book.insert(AddrSet::Remote, "tcp://10.0.0.2:4567", uuid, now)
            .unwrap();
        book.insert(AddrSet::Pending, "tcp://10.0.0.3:4567", uuid, now)
            .unwrap();
        book.insert(AddrSet::Pending, "tcp://10.0.0.4:4567", NodeId::nil(), now)
            .unwrap();

        let later = now + std::time::Duration::from_secs(5);
        book.penalize(uuid, 31, later);
        assert_eq!(
            book.get(AddrSet::Remote, "tcp://10.0.0.2:4567")
                .unwrap()
                .retry_cnt,
            31
        );
        assert_eq!(
            book.get(AddrSet::Pending, "tcp://10.0.0.3:4567")
                .unwrap()
                .retry_cnt,
            31
        );
        assert_eq!(
            book.get(AddrSet::Pending, "tcp://10.0.0.4:4567")
                .unwrap()
                .retry_cnt,
            0
        );
    }

    #[test]
    fn declare_stable_resets_remote_budget() {
        let (mut book, uuid, now) = book();
        book.insert(AddrSet::Remote, "tcp://10.0.0.2:4567", uuid, now)
            .unwrap();
        book.get_mut(AddrSet::Remote, "tcp://10.0.0.2:4567")
            .unwrap()
            .retry_cnt = 12;
        assert!(book.declare_stable(uuid));
        assert_eq!(
            book.get(AddrSet::Remote, "tcp://10.0.0.2:4567")
                .unwrap()
                .retry_cnt,
            -1
        );
        assert!(!book.declare_stable(NodeId::nil()));
    }
}
