//! Where everything lives on the device.
//!
//! ```text
//! |boot|group 0                                  |group 1 ...
//!      |super|desc|inode|bitmap|data 0 .. data N-1|super|desc|...
//! ```
//!
//! The format counts blocks from 1 ("logical" block numbers); the device counts from 0. The
//! conversion happens here and nowhere else.

use crate::error::{Ext0Error, Result};
use crate::types::{
    DIRECT_BLOCKS, FS_OVERHEAD_BLOCKS, GROUP_OVERHEAD_BLOCKS, GroupIndex, INODE_BITMAP_BITS,
    MAX_BLOCK_SIZE, MIN_BLOCK_SIZE,
};

// Position of each metadata block inside a group.
const SUPERBLOCK_SLOT: u64 = 0;
const DESCRIPTOR_SLOT: u64 = 1;
const INODE_SLOT: u64 = 2;
const BITMAP_SLOT: u64 = 3;

/// 1-based block number -> 0-based device block.
pub const fn logical_to_physical(block: u64) -> u64 {
    block - 1
}

/// 0-based device block -> 1-based block number.
pub const fn physical_to_logical(block: u64) -> u64 {
    block + 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: usize,
    pub direct_blocks: usize,
    pub group_overhead: usize,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            block_size: MIN_BLOCK_SIZE,
            direct_blocks: DIRECT_BLOCKS,
            group_overhead: GROUP_OVERHEAD_BLOCKS,
        }
    }
}

impl Geometry {
    pub fn with_block_size(block_size: usize) -> Result<Self> {
        let geometry = Self {
            block_size,
            ..Self::default()
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Rebuilds the geometry recorded in a superblock (`block_size = 1024 << log`).
    pub fn from_log_block_size(log: u32) -> Result<Self> {
        let block_size = MIN_BLOCK_SIZE
            .checked_shl(log)
            .filter(|size| *size <= MAX_BLOCK_SIZE)
            .ok_or_else(|| Ext0Error::InvalidGeometry(format!("log block size {log}")))?;
        Self::with_block_size(block_size)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size)
        {
            return Err(Ext0Error::InvalidGeometry(format!(
                "block size {} is not a power of two between {MIN_BLOCK_SIZE} and {MAX_BLOCK_SIZE}",
                self.block_size
            )));
        }
        if self.direct_blocks != DIRECT_BLOCKS || self.group_overhead != GROUP_OVERHEAD_BLOCKS {
            return Err(Ext0Error::InvalidGeometry(format!(
                "unsupported group shape: {} direct blocks, {} overhead blocks",
                self.direct_blocks, self.group_overhead
            )));
        }
        Ok(())
    }

    pub fn log_block_size(&self) -> u32 {
        (self.block_size / MIN_BLOCK_SIZE).trailing_zeros()
    }

    pub fn blocks_per_group(&self) -> u64 {
        (self.direct_blocks + self.group_overhead) as u64
    }

    /// 1-based number of the inode block of group 0.
    pub fn overhead_offset(&self) -> u64 {
        FS_OVERHEAD_BLOCKS as u64 + INODE_SLOT + 1
    }

    /// Largest byte size a single entity can reach.
    pub fn max_file_size(&self) -> u64 {
        (self.direct_blocks * self.block_size) as u64
    }

    /// Number of whole groups that fit on a device of `device_bytes`, ignoring the bitmap cap.
    pub fn group_count(&self, device_bytes: u64) -> u64 {
        let block_size = self.block_size as u64;
        let usable = device_bytes.saturating_sub(FS_OVERHEAD_BLOCKS as u64 * block_size);
        usable / (block_size * self.blocks_per_group())
    }

    /// Group count clamped to what the inode bitmap can track.
    pub fn capped_group_count(&self, device_bytes: u64) -> u32 {
        self.group_count(device_bytes).min(INODE_BITMAP_BITS as u64) as u32
    }

    /// 1-based number of the last block used by `groups` groups.
    pub fn last_block(&self, groups: u32) -> u64 {
        FS_OVERHEAD_BLOCKS as u64 + u64::from(groups) * self.blocks_per_group()
    }

    fn group_logical(&self, group: GroupIndex, slot: u64) -> u64 {
        u64::from(group.get()) * self.blocks_per_group() + FS_OVERHEAD_BLOCKS as u64 + slot + 1
    }

    pub fn superblock_block(&self, group: GroupIndex) -> u64 {
        logical_to_physical(self.group_logical(group, SUPERBLOCK_SLOT))
    }

    pub fn descriptor_block(&self, group: GroupIndex) -> u64 {
        logical_to_physical(self.group_logical(group, DESCRIPTOR_SLOT))
    }

    /// Device block of the group's inode record:
    /// `g * blocks_per_group + overhead_offset - 1`.
    pub fn inode_block(&self, group: GroupIndex) -> u64 {
        logical_to_physical(
            u64::from(group.get()) * self.blocks_per_group() + self.overhead_offset(),
        )
    }

    /// 1-based number of the group's block bitmap, as stored in its descriptor.
    pub fn bitmap_logical(&self, group: GroupIndex) -> u64 {
        self.group_logical(group, BITMAP_SLOT)
    }

    /// 1-based number of the group's first data block, as stored in its descriptor.
    pub fn first_data_logical(&self, group: GroupIndex) -> u64 {
        self.group_logical(group, self.group_overhead as u64)
    }

    /// The group that owns a device block, with the block's position inside the group.
    pub fn locate(&self, physical: u64) -> Option<(GroupIndex, u64)> {
        let rel = physical.checked_sub(FS_OVERHEAD_BLOCKS as u64)?;
        let group = u32::try_from(rel / self.blocks_per_group()).ok()?;
        Some((GroupIndex::new(group), rel % self.blocks_per_group()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_group_layout() {
        let geo = Geometry::default();
        let g0 = GroupIndex::new(0);
        assert_eq!(geo.blocks_per_group(), 16);
        assert_eq!(geo.superblock_block(g0), 1);
        assert_eq!(geo.descriptor_block(g0), 2);
        assert_eq!(geo.inode_block(g0), 3);
        assert_eq!(logical_to_physical(geo.bitmap_logical(g0)), 4);
        assert_eq!(logical_to_physical(geo.first_data_logical(g0)), 5);

        let g2 = GroupIndex::new(2);
        assert_eq!(geo.superblock_block(g2), 33);
        assert_eq!(geo.inode_block(g2), 35);
    }

    #[test]
    fn test_inode_blocks_strictly_increase_and_never_overlap_data() {
        let geo = Geometry::default();
        let mut previous = None;
        for g in 0..200 {
            let group = GroupIndex::new(g);
            let inode = geo.inode_block(group);
            if let Some(prev) = previous {
                assert!(inode > prev);
            }
            previous = Some(inode);

            let data_start = logical_to_physical(geo.first_data_logical(group));
            let data_end = data_start + geo.direct_blocks as u64;
            // all metadata of this group sits before its data
            assert!(geo.superblock_block(group) < data_start);
            assert!(logical_to_physical(geo.bitmap_logical(group)) < data_start);
            // the next group starts where this one's data ends
            assert_eq!(data_end, geo.superblock_block(GroupIndex::new(g + 1)));
        }
    }

    #[test]
    fn test_group_count_for_five_groups() {
        let geo = Geometry::default();
        let size = (1 + 5 * 16) * 1024;
        assert_eq!(geo.group_count(size), 5);
        assert_eq!(geo.group_count(size + 1023), 5);
        assert_eq!(geo.group_count(size - 1), 4);
        assert_eq!(geo.group_count(512), 0);
        assert_eq!(geo.last_block(5), 81);
    }

    #[test]
    fn test_group_count_is_capped_by_bitmap() {
        let geo = Geometry::default();
        let huge = 1u64 << 40;
        assert_eq!(geo.capped_group_count(huge), INODE_BITMAP_BITS as u32);
    }

    #[test]
    fn test_block_size_validation() {
        assert!(Geometry::with_block_size(4096).is_ok());
        assert!(Geometry::with_block_size(3000).is_err());
        assert!(Geometry::with_block_size(512).is_err());
        assert_eq!(Geometry::from_log_block_size(2).unwrap().block_size, 4096);
        assert!(Geometry::from_log_block_size(9).is_err());
    }

    #[test]
    fn test_locate() {
        let geo = Geometry::default();
        assert_eq!(geo.locate(0), None);
        assert_eq!(geo.locate(3), Some((GroupIndex::new(0), 2)));
        assert_eq!(geo.locate(17 + 5), Some((GroupIndex::new(1), 5)));
    }
}
