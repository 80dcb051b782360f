use std::collections::BTreeMap;

use crate::buffer::BufferId;

/// Reverse lookup from device address to buffer identity.
///
/// Entries are added when a buffer is created and stay for the pool's
/// lifetime, free or not.
#[derive(Debug, Default)]
pub(crate) struct AddressIndex {
    by_addr: BTreeMap<u64, BufferId>,
}

impl AddressIndex {
    /// False if `addr` is already mapped; the existing entry is kept.
    pub fn insert(&mut self, addr: u64, id: BufferId) -> bool {
        match self.by_addr.entry(addr) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(id);
                true
            }
        }
    }

    pub fn get(&self, addr: u64) -> Option<BufferId> {
        self.by_addr.get(&addr).copied()
    }

    pub fn clear(&mut self) {
        self.by_addr.clear();
    }
}
