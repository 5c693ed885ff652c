use serde::{Deserialize, Serialize};

use crate::device::BlockDevice;
use crate::error::{Ext0Error, Result};
use crate::layout::Geometry;
use crate::types::{DIRECT_BLOCKS, FileKind, GroupIndex, INODE_SIZE};

/// The on-disk inode record, 80 bytes at the start of its group's inode block.
///
/// The struct is also the in-memory form: bincode converts each field between native and
/// little-endian order in both directions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Inode {
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    /// Deletion time; non-zero only for a released slot.
    pub dtime: u32,
    /// Number of mapped data blocks. Pointers at or past this index are not used.
    pub blocks: u32,
    pub flags: u32,
    pub mode: u16,
    pub links_count: u16,
    pub block: [u32; DIRECT_BLOCKS],
}

impl Inode {
    /// A freshly allocated inode. Nothing is inherited from whatever held the slot before,
    /// in particular the deletion time starts at zero.
    pub fn new(mode: u16, now: u32) -> Self {
        Self {
            mode,
            atime: now,
            ctime: now,
            mtime: now,
            ..Self::default()
        }
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < INODE_SIZE {
            return Err(Ext0Error::corruption(0, "inode record truncated"));
        }
        Ok(bincode::deserialize(&raw[..INODE_SIZE])?)
    }

    pub fn encode(&self) -> Result<[u8; INODE_SIZE]> {
        let mut raw = [0u8; INODE_SIZE];
        bincode::serialize_into(&mut raw[..], self)?;
        Ok(raw)
    }

    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == FileKind::Directory
    }

    /// Holds an entity (allocated and not released).
    pub fn is_live(&self) -> bool {
        self.dtime == 0 && self.mode != 0
    }

    /// Permission bits only.
    pub fn permissions(&self) -> u16 {
        self.mode & 0o7777
    }

    pub fn touch(&mut self, now: u32) {
        self.mtime = now;
        self.ctime = now;
    }

    /// Turns the record into a tombstone: deletion time set, every pointer cleared.
    pub fn release(&mut self, now: u32) {
        self.dtime = now;
        self.size = 0;
        self.blocks = 0;
        self.links_count = 0;
        self.block = [0; DIRECT_BLOCKS];
    }

    /// Direct pointers that are in use.
    pub fn mapped_blocks(&self) -> &[u32] {
        let used = (self.blocks as usize).min(DIRECT_BLOCKS);
        &self.block[..used]
    }
}

/// Reads the inode of `group`. A failed read is an I/O error, never a default inode.
pub fn read_inode(device: &dyn BlockDevice, geometry: &Geometry, group: GroupIndex) -> Result<Inode> {
    let block = geometry.inode_block(group);
    let buf = device.read_block_vec(block)?;
    Inode::decode(&buf).map_err(|err| err.at_block(block))
}

/// Writes the inode of `group`; the remainder of the inode block is zeroed.
pub fn write_inode(
    device: &dyn BlockDevice,
    geometry: &Geometry,
    group: GroupIndex,
    inode: &Inode,
) -> Result<()> {
    let mut buf = vec![0u8; geometry.block_size];
    buf[..INODE_SIZE].copy_from_slice(&inode.encode()?);
    device.write_block(geometry.inode_block(group), &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn busy_inode() -> Inode {
        Inode {
            size: 0xDEAD_BEEF,
            atime: 1,
            ctime: u32::MAX,
            mtime: 1_700_000_123,
            dtime: 0,
            blocks: 7,
            flags: 0x8000_0001,
            mode: libc::S_IFREG as u16 | 0o640,
            links_count: 3,
            block: [5, 6, 7, 8, 9, 10, 11, 0, 0, 0, 0, u32::MAX],
        }
    }

    #[test]
    fn test_encode_decode_keeps_every_field() {
        let inode = busy_inode();
        let raw = inode.encode().unwrap();
        assert_eq!(Inode::decode(&raw).unwrap(), inode);

        let dir = Inode::new(libc::S_IFDIR as u16 | 0o755, 42);
        assert_eq!(Inode::decode(&dir.encode().unwrap()).unwrap(), dir);
    }

    #[test]
    fn test_on_disk_offsets_are_little_endian() {
        let raw = busy_inode().encode().unwrap();
        assert_eq!(&raw[0..4], &[0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(&raw[20..24], &7u32.to_le_bytes()); // blocks
        assert_eq!(&raw[28..30], &(libc::S_IFREG as u16 | 0o640).to_le_bytes());
        assert_eq!(&raw[30..32], &3u16.to_le_bytes()); // links
        assert_eq!(&raw[32..36], &5u32.to_le_bytes()); // block[0]
        assert_eq!(&raw[76..80], &u32::MAX.to_le_bytes()); // block[11]
    }

    #[test]
    fn test_truncated_record_is_corruption() {
        assert!(matches!(
            Inode::decode(&[0u8; 40]),
            Err(Ext0Error::Corruption { .. })
        ));
    }

    #[test]
    fn test_release_clears_pointers() {
        let mut inode = busy_inode();
        inode.release(99);
        assert_eq!(inode.dtime, 99);
        assert!(inode.mapped_blocks().is_empty());
        assert_eq!(inode.block, [0; DIRECT_BLOCKS]);
        assert!(!inode.is_live());
    }

    #[test]
    fn test_fresh_inode_starts_without_deletion_time() {
        // a slot that held a deleted inode...
        let geo = Geometry::default();
        let device = MemDevice::new(1024, 1 + 2 * 16);
        let group = GroupIndex::new(1);
        let mut old = busy_inode();
        old.release(1234);
        write_inode(&device, &geo, group, &old).unwrap();
        assert_eq!(read_inode(&device, &geo, group).unwrap().dtime, 1234);

        // ...gets a new occupant, which must not inherit the stale dtime
        let fresh = Inode::new(libc::S_IFREG as u16 | 0o600, 2000);
        write_inode(&device, &geo, group, &fresh).unwrap();
        let back = read_inode(&device, &geo, group).unwrap();
        assert_eq!(back.dtime, 0);
        assert!(back.is_live());
    }

    #[test]
    fn test_read_error_is_surfaced() {
        let geo = Geometry::default();
        // device too small to hold group 3's inode block
        let device = MemDevice::new(1024, 8);
        assert!(matches!(
            read_inode(&device, &geo, GroupIndex::new(3)),
            Err(Ext0Error::Io(_))
        ));
    }
}
