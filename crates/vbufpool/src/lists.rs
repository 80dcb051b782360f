use std::collections::VecDeque;

use crate::buffer::BufferId;

/// Disjoint free and in-use membership over a pool's buffers.
///
/// Free buffers are handed out oldest-freed first. Mutated only under the
/// pool lock.
#[derive(Debug, Default)]
pub(crate) struct BufferLists {
    free: VecDeque<BufferId>,
    in_use: VecDeque<BufferId>,
}

impl BufferLists {
    /// Seed a newly created buffer at the free tail.
    pub fn push_new(&mut self, id: BufferId) {
        debug_assert!(!self.free.contains(&id) && !self.in_use.contains(&id));
        self.free.push_back(id);
    }

    /// Move the free head to the in-use tail.
    pub fn take_free(&mut self) -> Option<BufferId> {
        let id = self.free.pop_front()?;
        self.in_use.push_back(id);
        Some(id)
    }

    /// Move `id` from in-use back to the free tail. False if it wasn't in use.
    pub fn give_back(&mut self, id: BufferId) -> bool {
        let Some(pos) = self.in_use.iter().position(|b| *b == id) else {
            return false;
        };
        self.in_use.remove(pos);
        self.free.push_back(id);
        true
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn in_use_len(&self) -> usize {
        self.in_use.len()
    }

    /// Every one of `total` buffers is free.
    pub fn is_quiescent(&self, total: usize) -> bool {
        self.in_use.is_empty() && self.free.len() == total
    }

    pub fn clear(&mut self) {
        self.free.clear();
        self.in_use.clear();
    }
}
