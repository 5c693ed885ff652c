use crate::error::{Ext0Error, Result};
use crate::types::{GroupIndex, INODE_BITMAP_BYTES, ROOT_GROUP};

/// Occupancy map of the inode slots, one bit per group, bit `i` lives in byte `i / 8` at
/// position `i % 8` (little-endian bit order, as stored in the superblock).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    bits: [u8; INODE_BITMAP_BYTES],
}

impl Default for Bitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl Bitmap {
    /// Every slot free.
    pub fn new() -> Self {
        Self {
            bits: [0; INODE_BITMAP_BYTES],
        }
    }

    /// Every slot free except the root's.
    pub fn with_root() -> Self {
        let mut bitmap = Self::new();
        bitmap.mark(ROOT_GROUP.as_usize());
        bitmap
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let bits: [u8; INODE_BITMAP_BYTES] = raw
            .get(..INODE_BITMAP_BYTES)
            .and_then(|slice| slice.try_into().ok())
            .ok_or_else(|| Ext0Error::corruption(0, "inode bitmap truncated"))?;
        Ok(Self { bits })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn capacity(&self) -> usize {
        INODE_BITMAP_BYTES * 8
    }

    /// Finds the first clear bit at or after `start_hint`, marks it and returns it.
    ///
    /// The root slot is never handed out and indices at or past `groups_count` mean the volume
    /// is full. Callers hold the bitmap lock across the whole call, which is what makes the
    /// scan and the mark one step.
    pub fn allocate_next(&mut self, start_hint: usize, groups_count: usize) -> Result<GroupIndex> {
        let limit = groups_count.min(self.capacity());
        let mut index = start_hint;
        while index < limit {
            if index == ROOT_GROUP.as_usize() {
                index += 1;
                continue;
            }
            if !self.is_set(index) {
                self.mark(index);
                return Ok(GroupIndex::new(index as u32));
            }
            index += 1;
        }
        Err(Ext0Error::NoSpace("no free inode slot"))
    }

    /// Marks a slot as used (e.g. the root at mkfs time).
    pub fn mark(&mut self, index: usize) {
        if index >= self.capacity() {
            return;
        }
        self.bits[index / 8] |= 1 << (index % 8);
    }

    pub fn clear(&mut self, index: usize) {
        if index >= self.capacity() {
            return;
        }
        self.bits[index / 8] &= !(1 << (index % 8));
    }

    pub fn is_set(&self, index: usize) -> bool {
        if index >= self.capacity() {
            return false;
        }
        self.bits[index / 8] & (1 << (index % 8)) != 0
    }

    /// Number of used slots below `groups_count`.
    pub fn count_set(&self, groups_count: usize) -> usize {
        (0..groups_count.min(self.capacity()))
            .filter(|i| self.is_set(*i))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_allocation() {
        let mut bitmap = Bitmap::with_root();

        // the root starts out taken
        assert!(bitmap.is_set(0));
        assert!(!bitmap.is_set(1));

        let first = bitmap.allocate_next(0, 16).unwrap();
        assert_eq!(first.get(), 1);
        assert!(bitmap.is_set(1));

        // allocate_next skips slots that were marked by hand
        bitmap.mark(2);
        let second = bitmap.allocate_next(0, 16).unwrap();
        assert_eq!(second.get(), 3);
    }

    #[test]
    fn test_root_slot_is_never_returned() {
        // even a bitmap where the root bit got lost must not hand it out
        let mut bitmap = Bitmap::new();
        let got = bitmap.allocate_next(0, 4).unwrap();
        assert_eq!(got.get(), 1);
        assert!(!bitmap.is_set(0));
    }

    #[test]
    fn test_exhaust_then_reuse_freed_slot() {
        let groups = 8;
        let mut bitmap = Bitmap::with_root();
        for expected in 1..groups {
            assert_eq!(bitmap.allocate_next(0, groups).unwrap().as_usize(), expected);
        }
        assert!(matches!(
            bitmap.allocate_next(0, groups),
            Err(Ext0Error::NoSpace(_))
        ));

        bitmap.clear(5);
        assert_eq!(bitmap.allocate_next(0, groups).unwrap().as_usize(), 5);
        assert!(bitmap.allocate_next(0, groups).is_err());
    }

    #[test]
    fn test_start_hint_and_limit() {
        let mut bitmap = Bitmap::with_root();
        assert_eq!(bitmap.allocate_next(6, 10).unwrap().get(), 6);
        // hint past the group count fails straight away
        assert!(bitmap.allocate_next(10, 10).is_err());
        assert_eq!(bitmap.count_set(10), 2);
    }

    #[test]
    fn test_byte_layout() {
        let mut bitmap = Bitmap::new();
        bitmap.mark(0);
        bitmap.mark(9);
        let raw = bitmap.as_bytes();
        assert_eq!(raw[0], 0b0000_0001);
        assert_eq!(raw[1], 0b0000_0010);
        assert_eq!(Bitmap::from_bytes(raw).unwrap(), bitmap);
        assert!(Bitmap::from_bytes(&raw[..10]).is_err());
    }
}
