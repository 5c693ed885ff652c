//! A mounted ext0 volume.
//!
//! Lock order, outermost first: entity locks (ascending group index), the inode bitmap, the
//! superblock, group descriptors. Descriptors are taken one at a time and nothing that holds
//! one waits for another lock, so the free block sum can be read under the superblock lock.
//! Nothing takes a lock further up this list while holding one further down.

use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info, warn};

use crate::bitmap::Bitmap;
use crate::descriptor::{DescriptorTable, GroupDescriptor, write_descriptor};
use crate::device::BlockDevice;
use crate::error::{Ext0Error, Result};
use crate::inode::{self, Inode};
use crate::layout::Geometry;
use crate::node::{DirNode, Node};
use crate::superblock::SuperBlock;
use crate::translate::{self, Mapping, write_block_bitmap};
use crate::types::{GroupIndex, MAX_NAME_LEN, ROOT_GROUP, STATE_CLEAN, STATE_MOUNTED, now_secs};
use crate::{lock, read_lock, write_lock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub block_size: u32,
    /// Data blocks only; metadata blocks are not counted.
    pub blocks: u64,
    pub free_blocks: u64,
    pub files: u64,
    pub free_files: u64,
    pub name_len: u32,
}

pub struct Volume {
    device: Arc<dyn BlockDevice>,
    geometry: Geometry,
    superblock: Mutex<SuperBlock>,
    bitmap: Mutex<Bitmap>,
    descriptors: DescriptorTable,
    entities: Vec<RwLock<()>>,
}

impl Volume {
    /// Mounts the volume on `device`.
    ///
    /// Reads the primary superblock, rejects anything that is not ext0 or does not fit the
    /// device, loads every group descriptor and marks the volume as mounted.
    pub fn open(device: Arc<dyn BlockDevice>) -> Result<Self> {
        let initial = Geometry::with_block_size(device.block_size())?;
        let primary = initial.superblock_block(ROOT_GROUP);
        let raw = device.read_block_vec(primary)?;
        let (mut sb, bitmap) = SuperBlock::decode(&raw).map_err(|err| err.at_block(primary))?;
        sb.check_magic()?;

        let geometry = sb.geometry()?;
        if geometry.block_size != device.block_size() {
            return Err(Ext0Error::InvalidGeometry(format!(
                "volume uses {} byte blocks, device was opened with {}",
                geometry.block_size,
                device.block_size()
            )));
        }
        let groups = sb.groups_count;
        if groups == 0 || groups as usize > bitmap.capacity() {
            return Err(Ext0Error::InvalidGeometry(format!(
                "{groups} groups recorded, the inode bitmap tracks at most {}",
                bitmap.capacity()
            )));
        }
        if geometry.last_block(groups) > device.block_count() {
            return Err(Ext0Error::InvalidGeometry(format!(
                "{groups} groups need {} blocks, the device has {}",
                geometry.last_block(groups),
                device.block_count()
            )));
        }
        if !bitmap.is_set(ROOT_GROUP.as_usize()) {
            return Err(Ext0Error::corruption(primary, "root slot is not allocated"));
        }

        let descriptors = DescriptorTable::load(device.as_ref(), &geometry, groups)?;
        if sb.state == STATE_MOUNTED {
            warn!("volume was not cleanly unmounted, run ext0_fsck");
        }
        sb.mtime = now_secs();
        sb.state = STATE_MOUNTED;

        let volume = Self {
            device,
            geometry,
            superblock: Mutex::new(sb),
            bitmap: Mutex::new(bitmap),
            descriptors,
            entities: (0..groups).map(|_| RwLock::new(())).collect(),
        };
        volume.persist_primary()?;
        info!(
            "mounted ext0 volume '{}': {} groups of {} blocks, block size {}",
            volume.volume_name(),
            groups,
            geometry.blocks_per_group(),
            geometry.block_size
        );
        Ok(volume)
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn device(&self) -> &dyn BlockDevice {
        self.device.as_ref()
    }

    pub fn groups_count(&self) -> u32 {
        self.entities.len() as u32
    }

    pub fn volume_name(&self) -> String {
        lock(&self.superblock).volume_name()
    }

    /// Copy of the in-memory superblock.
    pub fn superblock(&self) -> SuperBlock {
        lock(&self.superblock).clone()
    }

    /// Copy of the inode bitmap.
    pub fn bitmap(&self) -> Bitmap {
        lock(&self.bitmap).clone()
    }

    pub fn descriptor(&self, group: GroupIndex) -> Result<GroupDescriptor> {
        self.descriptors.snapshot(group)
    }

    /// Group behind an inode number. Anything outside the volume is `NotFound`.
    pub fn group_of(&self, ino: u64) -> Result<GroupIndex> {
        GroupIndex::from_ino(ino)
            .filter(|group| group.get() < self.groups_count())
            .ok_or(Ext0Error::NotFound)
    }

    pub fn read_inode(&self, group: GroupIndex) -> Result<Inode> {
        inode::read_inode(self.device(), &self.geometry, group)
    }

    pub fn write_inode(&self, group: GroupIndex, inode: &Inode) -> Result<()> {
        inode::write_inode(self.device(), &self.geometry, group, inode)
    }

    /// The live entity behind `ino`, typed by what it is.
    pub fn node(&self, ino: u64) -> Result<Node<'_>> {
        let group = self.group_of(ino)?;
        if !lock(&self.bitmap).is_set(group.as_usize()) {
            return Err(Ext0Error::NotFound);
        }
        let inode = {
            let _guard = self.read_entity(group)?;
            self.read_inode(group)?
        };
        if !inode.is_live() {
            return Err(Ext0Error::NotFound);
        }
        Ok(Node::new(self, group, inode.kind()))
    }

    pub fn root(&self) -> Result<DirNode<'_>> {
        match self.node(ROOT_GROUP.ino())? {
            Node::Directory(dir) => Ok(dir),
            _ => Err(Ext0Error::corruption(
                self.geometry.inode_block(ROOT_GROUP),
                "root is not a directory",
            )),
        }
    }

    /// Claims a free group for a new entity and writes its fresh inode.
    ///
    /// The inode starts with no blocks, no links and every timestamp set to now. Finding and
    /// marking the slot is one step under the bitmap lock, so concurrent callers never get
    /// the same group.
    pub fn allocate_entity(&self, mode: u16) -> Result<(GroupIndex, Inode)> {
        let group = lock(&self.bitmap)
            .allocate_next(ROOT_GROUP.as_usize() + 1, self.groups_count() as usize)?;
        match self.init_entity(group, mode) {
            Ok(inode) => {
                debug!("allocated {group} (inode {}) with mode {mode:o}", group.ino());
                Ok((group, inode))
            }
            Err(err) => {
                lock(&self.bitmap).clear(group.as_usize());
                Err(err)
            }
        }
    }

    fn init_entity(&self, group: GroupIndex, mode: u16) -> Result<Inode> {
        let _guard = self.write_entity(group)?;
        let inode = Inode::new(mode, now_secs());
        self.write_inode(group, &inode)?;
        self.reset_group(group)?;
        {
            let mut sb = lock(&self.superblock);
            sb.free_inodes_count = sb.free_inodes_count.saturating_sub(1);
        }
        self.persist_primary()?;
        Ok(inode)
    }

    /// Frees the entity behind `ino` whatever its link count.
    pub fn release_entity(&self, ino: u64) -> Result<()> {
        let group = self.group_of(ino)?;
        let _guard = self.write_entity(group)?;
        let inode = self.read_inode(group)?;
        self.reclaim(group, inode)
    }

    /// Returns a group to the free pool. The caller holds the entity's write lock.
    ///
    /// The dead inode is written and flushed before its bit is cleared: a crash in between
    /// leaks the slot instead of handing out one whose record still looks alive.
    pub(crate) fn reclaim(&self, group: GroupIndex, mut inode: Inode) -> Result<()> {
        if group.is_root() {
            return Err(Ext0Error::InvalidArgument("the root cannot be released"));
        }
        inode.release(now_secs());
        self.write_inode(group, &inode)?;
        self.device.flush()?;

        lock(&self.bitmap).clear(group.as_usize());
        self.reset_group(group)?;
        {
            let mut sb = lock(&self.superblock);
            sb.free_inodes_count = (sb.free_inodes_count + 1).min(self.groups_count() - 1);
        }
        self.persist_primary()?;
        debug!("released {group}");
        Ok(())
    }

    /// Every data block of the group back to free.
    fn reset_group(&self, group: GroupIndex) -> Result<()> {
        let mut desc = self.descriptors.get(group)?;
        *desc = GroupDescriptor::for_group(&self.geometry, group);
        write_descriptor(self.device(), &self.geometry, group, &desc)?;
        write_block_bitmap(self.device(), &self.geometry, &desc, 0)
    }

    /// Device block holding logical block `logical`, without mapping anything.
    pub(crate) fn lookup_block(&self, group: GroupIndex, inode: &Inode, logical: u64) -> Result<u64> {
        let desc = self.descriptors.snapshot(group)?;
        translate::lookup(&desc, inode, logical)
    }

    /// Device block holding logical block `logical` of the entity, mapping it first when
    /// `create` is set. The caller holds the entity's write lock when creating and persists
    /// the inode afterwards.
    pub(crate) fn map_block(
        &self,
        group: GroupIndex,
        inode: &mut Inode,
        logical: u64,
        create: bool,
    ) -> Result<Mapping> {
        let mut desc = self.descriptors.get(group)?;
        let mapping = translate::map_block(&self.geometry, &mut desc, inode, logical, create)?;
        if !mapping.fresh.is_empty() {
            write_descriptor(self.device(), &self.geometry, group, &desc)?;
            write_block_bitmap(self.device(), &self.geometry, &desc, inode.blocks)?;
        }
        Ok(mapping)
    }

    /// Drops every mapped block from `keep` on.
    pub(crate) fn unmap_from(&self, group: GroupIndex, inode: &mut Inode, keep: u32) -> Result<()> {
        if keep >= inode.blocks {
            return Ok(());
        }
        let mut desc = self.descriptors.get(group)?;
        let freed = (inode.blocks - keep) as u16;
        desc.free_blocks_count =
            (desc.free_blocks_count + freed).min(self.geometry.direct_blocks as u16);
        for pointer in &mut inode.block[keep as usize..inode.blocks as usize] {
            *pointer = 0;
        }
        inode.blocks = keep;
        write_descriptor(self.device(), &self.geometry, group, &desc)?;
        write_block_bitmap(self.device(), &self.geometry, &desc, keep)
    }

    fn entity(&self, group: GroupIndex) -> Result<&RwLock<()>> {
        self.entities.get(group.as_usize()).ok_or(Ext0Error::NotFound)
    }

    pub(crate) fn read_entity(&self, group: GroupIndex) -> Result<RwLockReadGuard<'_, ()>> {
        self.entity(group).map(read_lock)
    }

    pub(crate) fn write_entity(&self, group: GroupIndex) -> Result<RwLockWriteGuard<'_, ()>> {
        self.entity(group).map(write_lock)
    }

    /// Write locks on several entities, taken in ascending group order. Duplicates are
    /// locked once.
    pub(crate) fn write_entities(
        &self,
        groups: &[GroupIndex],
    ) -> Result<Vec<RwLockWriteGuard<'_, ()>>> {
        let mut ordered = groups.to_vec();
        ordered.sort_unstable();
        ordered.dedup();
        ordered.into_iter().map(|group| self.write_entity(group)).collect()
    }

    fn write_replica(&self, sb: &SuperBlock, bitmap: &Bitmap, group: GroupIndex) -> Result<()> {
        let mut copy = sb.clone();
        copy.block_group_nr = group.get() as u16;
        let mut block = vec![0u8; self.geometry.block_size];
        copy.encode_into(bitmap, &mut block)?;
        self.device
            .write_block(self.geometry.superblock_block(group), &block)
    }

    /// Writes the primary superblock (with the bitmap) as it is in memory.
    fn persist_primary(&self) -> Result<()> {
        let bitmap = lock(&self.bitmap);
        let mut sb = lock(&self.superblock);
        sb.free_blocks_count = self.descriptors.free_blocks() as u32;
        self.write_replica(&sb, &bitmap, ROOT_GROUP)
    }

    fn sync_with_state(&self, state: u16) -> Result<()> {
        {
            let bitmap = lock(&self.bitmap);
            let mut sb = lock(&self.superblock);
            let groups = self.groups_count();
            sb.free_blocks_count = self.descriptors.free_blocks() as u32;
            sb.free_inodes_count = groups - bitmap.count_set(groups as usize) as u32;
            sb.wtime = now_secs();
            sb.state = state;
            for g in 0..groups {
                self.write_replica(&sb, &bitmap, GroupIndex::new(g))?;
            }
        }
        self.descriptors.store_all(self.device(), &self.geometry)?;
        self.device.flush()
    }

    /// Writes every superblock replica and every descriptor, then flushes the device.
    pub fn sync(&self) -> Result<()> {
        self.sync_with_state(STATE_MOUNTED)?;
        debug!("volume synced");
        Ok(())
    }

    /// Final sync that marks the volume clean.
    pub fn close(&self) -> Result<()> {
        self.sync_with_state(STATE_CLEAN)?;
        info!("volume '{}' closed cleanly", self.volume_name());
        Ok(())
    }

    pub fn statfs(&self) -> StatFs {
        let groups = u64::from(self.groups_count());
        let used = lock(&self.bitmap).count_set(groups as usize) as u64;
        StatFs {
            block_size: self.geometry.block_size as u32,
            blocks: groups * self.geometry.direct_blocks as u64,
            free_blocks: self.descriptors.free_blocks(),
            files: groups,
            free_files: groups - used,
            name_len: MAX_NAME_LEN as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::mkfs::{MkfsOptions, build_image};
    use crate::types::EXT0_MAGIC;
    use std::collections::HashSet;
    use std::thread;

    fn fresh(groups: u64) -> (Arc<MemDevice>, Volume) {
        let device = Arc::new(MemDevice::new(1024, 1 + 16 * groups));
        build_image(device.as_ref(), &MkfsOptions::default()).unwrap();
        let volume = Volume::open(device.clone()).unwrap();
        (device, volume)
    }

    const FILE_MODE: u16 = libc::S_IFREG as u16 | 0o644;

    #[test]
    fn test_open_fresh_volume() {
        let (device, volume) = fresh(5);
        assert_eq!(volume.groups_count(), 5);
        assert_eq!(volume.volume_name(), "ext0");
        let sb = volume.superblock();
        assert_eq!(sb.state, STATE_MOUNTED);
        assert!(sb.mtime > 0);

        // the mount stamp is on disk
        let (on_disk, _) = SuperBlock::decode(&device.read_block_vec(1).unwrap()).unwrap();
        assert_eq!(on_disk.state, STATE_MOUNTED);

        let stat = volume.statfs();
        assert_eq!(stat.blocks, 60);
        assert_eq!(stat.free_blocks, 59);
        assert_eq!(stat.free_files, 4);
        assert!(volume.root().is_ok());
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let device = Arc::new(MemDevice::new(1024, 1 + 16 * 2));
        build_image(device.as_ref(), &MkfsOptions::default()).unwrap();
        let mut block = device.read_block_vec(1).unwrap();
        block[52..54].copy_from_slice(&0x1234u16.to_le_bytes());
        device.write_block(1, &block).unwrap();

        assert!(matches!(
            Volume::open(device.clone()),
            Err(Ext0Error::BadMagic { found: 0x1234 })
        ));
        // nothing was written back
        let (sb, _) = SuperBlock::decode(&device.read_block_vec(1).unwrap()).unwrap();
        assert_ne!(sb.magic, EXT0_MAGIC);
        assert_eq!(sb.state, STATE_CLEAN);
    }

    #[test]
    fn test_blank_device_is_not_ext0() {
        let device = Arc::new(MemDevice::new(1024, 64));
        assert!(matches!(
            Volume::open(device),
            Err(Ext0Error::BadMagic { found: 0 })
        ));
    }

    #[test]
    fn test_group_count_past_device_is_rejected() {
        let device = Arc::new(MemDevice::new(1024, 1 + 16 * 3));
        build_image(device.as_ref(), &MkfsOptions::default()).unwrap();
        let mut block = device.read_block_vec(1).unwrap();
        block[32..36].copy_from_slice(&4u32.to_le_bytes());
        device.write_block(1, &block).unwrap();
        assert!(matches!(
            Volume::open(device),
            Err(Ext0Error::InvalidGeometry(_))
        ));
    }

    #[test]
    fn test_block_size_mismatch_is_rejected() {
        let device = Arc::new(MemDevice::new(1024, 1 + 16 * 3));
        build_image(device.as_ref(), &MkfsOptions::default()).unwrap();
        let mut block = device.read_block_vec(1).unwrap();
        // claims 2048 byte blocks on a device read in 1024 byte blocks
        block[44..48].copy_from_slice(&1u32.to_le_bytes());
        device.write_block(1, &block).unwrap();
        assert!(matches!(
            Volume::open(device),
            Err(Ext0Error::InvalidGeometry(_))
        ));
    }

    #[test]
    fn test_allocate_skips_root_and_is_first_fit() {
        let (_, volume) = fresh(4);
        let (a, inode) = volume.allocate_entity(FILE_MODE).unwrap();
        assert_eq!(a, GroupIndex::new(1));
        assert_eq!(inode.dtime, 0);
        assert_eq!(inode.blocks, 0);
        let (b, _) = volume.allocate_entity(FILE_MODE).unwrap();
        assert_eq!(b, GroupIndex::new(2));
        assert_eq!(volume.superblock().free_inodes_count, 1);
    }

    #[test]
    fn test_exhaust_free_and_reallocate_same_slot() {
        let (_, volume) = fresh(4);
        for _ in 0..3 {
            volume.allocate_entity(FILE_MODE).unwrap();
        }
        assert!(matches!(
            volume.allocate_entity(FILE_MODE),
            Err(Ext0Error::NoSpace(_))
        ));

        volume.release_entity(GroupIndex::new(2).ino()).unwrap();
        let (again, inode) = volume.allocate_entity(FILE_MODE).unwrap();
        assert_eq!(again, GroupIndex::new(2));
        assert_eq!(inode.dtime, 0);
        assert_eq!(volume.read_inode(again).unwrap().dtime, 0);
    }

    #[test]
    fn test_concurrent_allocation_never_hands_out_a_group_twice() {
        let (_, volume) = fresh(64);
        let volume = Arc::new(volume);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let volume = Arc::clone(&volume);
                thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Ok((group, _)) = volume.allocate_entity(FILE_MODE) {
                        got.push(group);
                    }
                    got
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for group in handle.join().unwrap() {
                assert!(seen.insert(group), "{group} handed out twice");
            }
        }
        assert_eq!(seen.len(), 63);
        assert!(!seen.contains(&ROOT_GROUP));
        assert_eq!(volume.statfs().free_files, 0);
    }

    #[test]
    fn test_primary_free_blocks_match_descriptors_after_concurrent_churn() {
        let (device, volume) = fresh(16);
        thread::scope(|scope| {
            for t in 0..6u64 {
                let volume = &volume;
                scope.spawn(move || {
                    for round in 0..20u64 {
                        let (group, mut inode) = volume.allocate_entity(FILE_MODE).unwrap();
                        let last = (t + round) % 12;
                        volume.map_block(group, &mut inode, last, true).unwrap();
                        volume.write_inode(group, &inode).unwrap();
                        volume.release_entity(group.ino()).unwrap();
                    }
                });
            }
        });

        let (on_disk, _) = SuperBlock::decode(&device.read_block_vec(1).unwrap()).unwrap();
        assert_eq!(u64::from(on_disk.free_blocks_count), volume.statfs().free_blocks);
        assert_eq!(volume.statfs().free_blocks, 16 * 12 - 1);
    }

    #[test]
    fn test_reclaim_writes_dead_inode_and_frees_blocks() {
        let (device, volume) = fresh(3);
        let (group, mut inode) = volume.allocate_entity(FILE_MODE).unwrap();
        volume.map_block(group, &mut inode, 4, true).unwrap();
        volume.write_inode(group, &inode).unwrap();
        assert_eq!(volume.descriptor(group).unwrap().free_blocks_count, 7);

        volume.release_entity(group.ino()).unwrap();
        let dead = volume.read_inode(group).unwrap();
        assert_ne!(dead.dtime, 0);
        assert_eq!(dead.blocks, 0);
        assert_eq!(dead.block, [0; 12]);
        assert!(!volume.bitmap().is_set(group.as_usize()));
        assert_eq!(volume.descriptor(group).unwrap().free_blocks_count, 12);

        let desc = volume.descriptor(group).unwrap();
        assert!(device
            .read_block_vec(desc.bitmap_block())
            .unwrap()
            .iter()
            .all(|b| *b == 0));
        assert!(matches!(volume.node(group.ino()), Err(Ext0Error::NotFound)));
    }

    #[test]
    fn test_root_cannot_be_released() {
        let (_, volume) = fresh(2);
        assert!(volume.release_entity(1).is_err());
        assert!(volume.root().is_ok());
    }

    #[test]
    fn test_node_lookup_bounds() {
        let (_, volume) = fresh(2);
        assert!(matches!(volume.node(0), Err(Ext0Error::NotFound)));
        assert!(matches!(volume.node(3), Err(Ext0Error::NotFound)));
        // allocated nowhere yet
        assert!(matches!(volume.node(2), Err(Ext0Error::NotFound)));
    }

    #[test]
    fn test_close_writes_every_replica_clean() {
        let (device, volume) = fresh(3);
        volume.allocate_entity(FILE_MODE).unwrap();
        volume.close().unwrap();

        let geo = Geometry::default();
        let primary = volume.superblock();
        for g in 0..3 {
            let group = GroupIndex::new(g);
            let raw = device.read_block_vec(geo.superblock_block(group)).unwrap();
            let (sb, bitmap) = SuperBlock::decode(&raw).unwrap();
            assert_eq!(sb.state, STATE_CLEAN);
            assert_eq!(sb.block_group_nr, g as u16);
            assert_eq!(sb.free_inodes_count, 1);
            assert!(sb.same_globals(&primary));
            assert!(bitmap.is_set(1));
        }

        let reopened = Volume::open(device.clone()).unwrap();
        assert_eq!(reopened.superblock().free_inodes_count, 1);
        assert!(reopened.bitmap().is_set(1));
    }

    #[test]
    fn test_failed_inode_write_returns_the_slot() {
        let (device, volume) = fresh(3);
        device.fail_after_writes(0);
        assert!(matches!(
            volume.allocate_entity(FILE_MODE),
            Err(Ext0Error::Io(_))
        ));
        assert!(!volume.bitmap().is_set(1));
    }
}
