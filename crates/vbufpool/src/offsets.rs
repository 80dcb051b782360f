use crate::error::{PoolError, Result};

/// Per-pool byte offsets (one per image plane, typically), shared by every
/// buffer in the pool.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OffsetTable {
    offsets: Vec<u32>,
}

impl OffsetTable {
    /// Append `offsets`; repeated calls grow the table.
    pub fn extend_from_slice(&mut self, offsets: &[u32]) {
        self.offsets.extend_from_slice(offsets);
    }

    pub fn get(&self, index: u32) -> Result<u32> {
        self.offsets
            .get(index as usize)
            .copied()
            .ok_or(PoolError::OffsetOutOfRange {
                index,
                len: self.offsets.len(),
            })
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.offsets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_lookup() {
        let mut table = OffsetTable::default();
        assert!(table.is_empty());

        // NV12: luma plane, then interleaved chroma.
        table.extend_from_slice(&[0, 1920 * 1080]);
        table.extend_from_slice(&[4096]);
        assert_eq!(table.as_slice(), &[0, 1920 * 1080, 4096]);
        assert_eq!(table.get(1).unwrap(), 1920 * 1080);
        assert_eq!(table.get(2).unwrap(), 4096);
    }

    #[test]
    fn out_of_range_index() {
        let mut table = OffsetTable::default();
        table.extend_from_slice(&[0, 64]);
        assert!(matches!(
            table.get(2),
            Err(PoolError::OffsetOutOfRange { index: 2, len: 2 })
        ));
    }
}
