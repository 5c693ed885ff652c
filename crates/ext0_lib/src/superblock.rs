use serde::{Deserialize, Serialize};

use crate::bitmap::Bitmap;
use crate::error::{Ext0Error, Result};
use crate::layout::Geometry;
use crate::types::{EXT0_MAGIC, INODE_BITMAP_BYTES, INODE_SIZE, ROOT_GROUP, STATE_CLEAN};

/// Bytes taken by the fixed fields; the inode bitmap follows immediately.
pub const SUPERBLOCK_HEADER_SIZE: usize = 89;
pub const SUPERBLOCK_SIZE: usize = SUPERBLOCK_HEADER_SIZE + INODE_BITMAP_BYTES;

/// Global filesystem metadata, one copy at the start of every group.
///
/// Field order is the on-disk order. bincode's default (fixint, little-endian) encoding puts
/// every field at the documented offset with no padding.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SuperBlock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub blocks_per_group: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub inodes_per_group: u32,
    pub last_block: u32,
    pub groups_count: u32,
    pub mtime: u32,
    pub wtime: u32,
    pub log_block_size: u32,
    pub inode_size: u16,
    pub block_group_nr: u16,
    pub magic: u16,
    pub state: u16,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
    pub prealloc_blocks: u8,
}

impl SuperBlock {
    /// Superblock of a freshly formatted volume where only the root exists.
    pub fn new(
        geometry: &Geometry,
        groups_count: u32,
        device_blocks: u64,
        uuid: [u8; 16],
        volume_name: &str,
        now: u32,
    ) -> Self {
        let direct = geometry.direct_blocks as u32;
        let data_blocks = groups_count * direct;
        let mut name = [0u8; 16];
        let bytes = volume_name.as_bytes();
        let len = bytes.len().min(name.len());
        name[..len].copy_from_slice(&bytes[..len]);

        Self {
            inodes_count: groups_count,
            blocks_count: u32::try_from(device_blocks).unwrap_or(u32::MAX),
            blocks_per_group: geometry.blocks_per_group() as u32,
            // the root directory holds one block
            free_blocks_count: data_blocks.saturating_sub(1),
            free_inodes_count: groups_count.saturating_sub(1),
            first_data_block: geometry.first_data_logical(ROOT_GROUP) as u32,
            inodes_per_group: 1,
            last_block: geometry.last_block(groups_count) as u32,
            groups_count,
            mtime: 0,
            wtime: now,
            log_block_size: geometry.log_block_size(),
            inode_size: INODE_SIZE as u16,
            block_group_nr: 0,
            magic: EXT0_MAGIC,
            state: STATE_CLEAN,
            uuid,
            volume_name: name,
            prealloc_blocks: 0,
        }
    }

    /// Parses the superblock and the bitmap embedded behind it. Magic is not checked here, see
    /// [`SuperBlock::check_magic`].
    pub fn decode(block: &[u8]) -> Result<(Self, Bitmap)> {
        if block.len() < SUPERBLOCK_SIZE {
            return Err(Ext0Error::corruption(0, "superblock truncated"));
        }
        let sb: SuperBlock = bincode::deserialize(&block[..SUPERBLOCK_HEADER_SIZE])?;
        let bitmap = Bitmap::from_bytes(&block[SUPERBLOCK_HEADER_SIZE..SUPERBLOCK_SIZE])?;
        Ok((sb, bitmap))
    }

    /// Writes the superblock and bitmap to the front of `block`, leaving the rest untouched.
    pub fn encode_into(&self, bitmap: &Bitmap, block: &mut [u8]) -> Result<()> {
        if block.len() < SUPERBLOCK_SIZE {
            return Err(Ext0Error::InvalidGeometry(format!(
                "a {} byte block cannot hold the superblock",
                block.len()
            )));
        }
        bincode::serialize_into(&mut block[..SUPERBLOCK_HEADER_SIZE], self)?;
        block[SUPERBLOCK_HEADER_SIZE..SUPERBLOCK_SIZE].copy_from_slice(bitmap.as_bytes());
        Ok(())
    }

    pub fn check_magic(&self) -> Result<()> {
        if self.magic != EXT0_MAGIC {
            return Err(Ext0Error::BadMagic { found: self.magic });
        }
        Ok(())
    }

    pub fn geometry(&self) -> Result<Geometry> {
        let geometry = Geometry::from_log_block_size(self.log_block_size)?;
        if geometry.blocks_per_group() != u64::from(self.blocks_per_group) {
            return Err(Ext0Error::InvalidGeometry(format!(
                "{} blocks per group recorded, {} expected",
                self.blocks_per_group,
                geometry.blocks_per_group()
            )));
        }
        Ok(geometry)
    }

    pub fn volume_name(&self) -> String {
        let end = self
            .volume_name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.volume_name.len());
        String::from_utf8_lossy(&self.volume_name[..end]).into_owned()
    }

    /// True when two copies agree on everything but the per-replica and per-sync fields.
    pub fn same_globals(&self, other: &SuperBlock) -> bool {
        let strip = |sb: &SuperBlock| SuperBlock {
            block_group_nr: 0,
            wtime: 0,
            mtime: 0,
            state: 0,
            free_blocks_count: 0,
            free_inodes_count: 0,
            ..sb.clone()
        };
        strip(self) == strip(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SuperBlock {
        SuperBlock::new(&Geometry::default(), 5, 81, [7; 16], "scratch", 1_700_000_000)
    }

    #[test]
    fn test_header_is_byte_exact() {
        let sb = sample();
        let bytes = bincode::serialize(&sb).unwrap();
        assert_eq!(bytes.len(), SUPERBLOCK_HEADER_SIZE);
        // groups_count at offset 32
        assert_eq!(&bytes[32..36], &5u32.to_le_bytes());
        // magic at offset 52
        assert_eq!(&bytes[52..54], &EXT0_MAGIC.to_le_bytes());
        // uuid at 56, volume name at 72
        assert_eq!(bytes[56], 7);
        assert_eq!(&bytes[72..79], b"scratch");
    }

    #[test]
    fn test_encode_decode_with_bitmap() {
        let sb = sample();
        let mut bitmap = Bitmap::with_root();
        bitmap.mark(3);
        let mut block = vec![0u8; 1024];
        sb.encode_into(&bitmap, &mut block).unwrap();
        // the root bit sits right behind the header
        assert_eq!(block[SUPERBLOCK_HEADER_SIZE], 0b0000_1001);

        let (decoded, decoded_bitmap) = SuperBlock::decode(&block).unwrap();
        assert_eq!(decoded, sb);
        assert_eq!(decoded_bitmap, bitmap);
        assert!(decoded.check_magic().is_ok());
        assert_eq!(decoded.volume_name(), "scratch");
        assert_eq!(decoded.geometry().unwrap(), Geometry::default());
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let mut sb = sample();
        sb.magic = 0x1234;
        assert!(matches!(
            sb.check_magic(),
            Err(Ext0Error::BadMagic { found: 0x1234 })
        ));
    }

    #[test]
    fn test_fresh_counters() {
        let sb = sample();
        assert_eq!(sb.inodes_count, 5);
        assert_eq!(sb.free_inodes_count, 4);
        assert_eq!(sb.free_blocks_count, 5 * 12 - 1);
        assert_eq!(sb.first_data_block, 6);
        assert_eq!(sb.last_block, 81);
    }

    #[test]
    fn test_replicas_compare_on_globals() {
        let sb = sample();
        let mut replica = sb.clone();
        replica.block_group_nr = 3;
        replica.wtime += 10;
        assert!(sb.same_globals(&replica));
        replica.groups_count = 4;
        assert!(!sb.same_globals(&replica));
    }
}
