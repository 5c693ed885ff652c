use std::sync::{Mutex, MutexGuard};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::device::BlockDevice;
use crate::error::{Ext0Error, Result};
use crate::layout::{Geometry, logical_to_physical};
use crate::lock;
use crate::types::GroupIndex;

pub const DESCRIPTOR_SIZE: usize = 10;

/// Per-group bookkeeping, stored in the block after the group's superblock replica.
/// Block numbers are 1-based.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupDescriptor {
    pub block_bitmap: u32,
    pub first_block: u32,
    pub free_blocks_count: u16,
}

impl GroupDescriptor {
    /// Descriptor of an empty group laid out by `geometry`.
    pub fn for_group(geometry: &Geometry, group: GroupIndex) -> Self {
        Self {
            block_bitmap: geometry.bitmap_logical(group) as u32,
            first_block: geometry.first_data_logical(group) as u32,
            free_blocks_count: geometry.direct_blocks as u16,
        }
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < DESCRIPTOR_SIZE {
            return Err(Ext0Error::corruption(0, "group descriptor truncated"));
        }
        Ok(bincode::deserialize(&raw[..DESCRIPTOR_SIZE])?)
    }

    pub fn encode_into(&self, block: &mut [u8]) -> Result<()> {
        bincode::serialize_into(&mut block[..DESCRIPTOR_SIZE], self)?;
        Ok(())
    }

    /// Device block holding the group's block bitmap.
    pub fn bitmap_block(&self) -> u64 {
        logical_to_physical(u64::from(self.block_bitmap))
    }

    /// The descriptor points where the layout says it should.
    pub fn matches_layout(&self, geometry: &Geometry, group: GroupIndex) -> bool {
        u64::from(self.block_bitmap) == geometry.bitmap_logical(group)
            && u64::from(self.first_block) == geometry.first_data_logical(group)
            && usize::from(self.free_blocks_count) <= geometry.direct_blocks
    }
}

/// Every group's descriptor, read once at mount and written back on sync.
///
/// Each descriptor has its own lock so translations in different groups do not contend.
#[derive(Debug)]
pub struct DescriptorTable {
    groups: Vec<Mutex<GroupDescriptor>>,
}

impl DescriptorTable {
    pub fn load(device: &dyn BlockDevice, geometry: &Geometry, groups_count: u32) -> Result<Self> {
        let mut groups = Vec::with_capacity(groups_count as usize);
        let mut buf = vec![0u8; geometry.block_size];
        for g in 0..groups_count {
            let group = GroupIndex::new(g);
            let block = geometry.descriptor_block(group);
            device.read_block(block, &mut buf)?;
            let desc = GroupDescriptor::decode(&buf).map_err(|err| err.at_block(block))?;
            if !desc.matches_layout(geometry, group) {
                return Err(Ext0Error::corruption(
                    block,
                    format!("descriptor of {group} does not match the layout: {desc:?}"),
                ));
            }
            groups.push(Mutex::new(desc));
        }
        debug!("loaded {} group descriptors", groups.len());
        Ok(Self { groups })
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, group: GroupIndex) -> Result<MutexGuard<'_, GroupDescriptor>> {
        self.groups
            .get(group.as_usize())
            .map(lock)
            .ok_or_else(|| {
                Ext0Error::InvalidGeometry(format!("{group} is past the last group"))
            })
    }

    /// Copy of one descriptor.
    pub fn snapshot(&self, group: GroupIndex) -> Result<GroupDescriptor> {
        Ok(*self.get(group)?)
    }

    pub fn free_blocks(&self) -> u64 {
        self.groups
            .iter()
            .map(|desc| u64::from(lock(desc).free_blocks_count))
            .sum()
    }

    /// Writes one descriptor to its block. The lock is held across the write so an older
    /// copy can never land after a newer one.
    pub fn store(&self, device: &dyn BlockDevice, geometry: &Geometry, group: GroupIndex) -> Result<()> {
        let desc = self.get(group)?;
        write_descriptor(device, geometry, group, &desc)
    }

    pub fn store_all(&self, device: &dyn BlockDevice, geometry: &Geometry) -> Result<()> {
        for g in 0..self.groups.len() as u32 {
            self.store(device, geometry, GroupIndex::new(g))?;
        }
        Ok(())
    }
}

/// Writes `desc` as the only content of the group's descriptor block.
pub fn write_descriptor(
    device: &dyn BlockDevice,
    geometry: &Geometry,
    group: GroupIndex,
    desc: &GroupDescriptor,
) -> Result<()> {
    let mut block = vec![0u8; geometry.block_size];
    desc.encode_into(&mut block)?;
    device.write_block(geometry.descriptor_block(group), &block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    #[test]
    fn test_descriptor_bytes() {
        let geo = Geometry::default();
        let desc = GroupDescriptor::for_group(&geo, GroupIndex::new(1));
        let bytes = bincode::serialize(&desc).unwrap();
        assert_eq!(bytes.len(), DESCRIPTOR_SIZE);
        assert_eq!(&bytes[0..4], &21u32.to_le_bytes()); // bitmap of group 1
        assert_eq!(&bytes[4..8], &22u32.to_le_bytes()); // first data block of group 1
        assert_eq!(&bytes[8..10], &12u16.to_le_bytes());
        assert_eq!(GroupDescriptor::decode(&bytes).unwrap(), desc);
    }

    #[test]
    fn test_first_block_follows_group_metadata() {
        let geo = Geometry::default();
        for g in 0..50 {
            let group = GroupIndex::new(g);
            let desc = GroupDescriptor::for_group(&geo, group);
            assert!(u64::from(desc.first_block) > u64::from(desc.block_bitmap));
            assert!(desc.bitmap_block() > geo.inode_block(group));
        }
    }

    #[test]
    fn test_load_and_store_table() {
        let geo = Geometry::default();
        let device = MemDevice::new(1024, 1 + 3 * 16);
        for g in 0..3 {
            let group = GroupIndex::new(g);
            write_descriptor(&device, &geo, group, &GroupDescriptor::for_group(&geo, group)).unwrap();
        }

        let table = DescriptorTable::load(&device, &geo, 3).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.free_blocks(), 36);

        table.get(GroupIndex::new(2)).unwrap().free_blocks_count = 4;
        table.store(&device, &geo, GroupIndex::new(2)).unwrap();
        let reloaded = DescriptorTable::load(&device, &geo, 3).unwrap();
        assert_eq!(reloaded.snapshot(GroupIndex::new(2)).unwrap().free_blocks_count, 4);
        assert!(reloaded.get(GroupIndex::new(3)).is_err());
    }

    #[test]
    fn test_load_rejects_misplaced_descriptor() {
        let geo = Geometry::default();
        let device = MemDevice::new(1024, 1 + 16);
        let mut desc = GroupDescriptor::for_group(&geo, GroupIndex::new(0));
        desc.first_block = 2;
        write_descriptor(&device, &geo, GroupIndex::new(0), &desc).unwrap();
        assert!(matches!(
            DescriptorTable::load(&device, &geo, 1),
            Err(Ext0Error::Corruption { block: 2, .. })
        ));
    }
}
