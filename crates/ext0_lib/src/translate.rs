//! Logical block of an entity -> device block.
//!
//! An entity owns the data blocks of its group outright, so translation is arithmetic on the
//! group descriptor: `first_block + logical - 1`. What has to be tracked is how many of those
//! blocks are in use (`Inode::blocks`); that count only ever covers a prefix of the group's
//! data blocks.

use std::ops::Range;

use log::debug;

use crate::descriptor::GroupDescriptor;
use crate::device::BlockDevice;
use crate::error::{Ext0Error, Result};
use crate::inode::Inode;
use crate::layout::{Geometry, logical_to_physical};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    /// Device block number.
    pub physical: u64,
    /// Logical blocks that became mapped by this call. Their contents are stale until written.
    pub fresh: Range<u32>,
}

/// Device block for `logical` without changing anything.
pub fn lookup(desc: &GroupDescriptor, inode: &Inode, logical: u64) -> Result<u64> {
    if logical >= u64::from(inode.blocks) {
        return Err(Ext0Error::NotMapped(logical));
    }
    Ok(logical_to_physical(u64::from(desc.first_block) + logical))
}

/// Translates `logical`, mapping it (and every unmapped block before it) when `create` is set.
///
/// Without `create` an unmapped block is `NotMapped`: reads never grow an entity. With
/// `create`, anything at or past the direct block capacity is `NoSpace`. Newly mapped blocks
/// are recorded in the inode's pointers and taken off the descriptor's free count; the caller
/// holds the descriptor lock and persists both afterwards.
pub fn map_block(
    geometry: &Geometry,
    desc: &mut GroupDescriptor,
    inode: &mut Inode,
    logical: u64,
    create: bool,
) -> Result<Mapping> {
    let mapped = inode.blocks;
    if !create || logical < u64::from(mapped) {
        return lookup(desc, inode, logical).map(|physical| Mapping {
            physical,
            fresh: mapped..mapped,
        });
    }
    if logical >= geometry.direct_blocks as u64 {
        return Err(Ext0Error::NoSpace("entity is past its direct blocks"));
    }

    let wanted = logical as u32 + 1;
    let grow = wanted - mapped;
    desc.free_blocks_count = desc
        .free_blocks_count
        .checked_sub(grow as u16)
        .ok_or_else(|| {
            Ext0Error::corruption(
                u64::from(desc.block_bitmap),
                format!(
                    "group claims {} free blocks but {} are still unmapped",
                    desc.free_blocks_count, grow
                ),
            )
        })?;
    for k in mapped..wanted {
        // pointers hold device block numbers
        inode.block[k as usize] = logical_to_physical(u64::from(desc.first_block + k)) as u32;
    }
    inode.blocks = wanted;
    debug!("mapped logical blocks {mapped}..{wanted} at first block {}", desc.first_block);

    Ok(Mapping {
        physical: logical_to_physical(u64::from(desc.first_block) + logical),
        fresh: mapped..wanted,
    })
}

/// Writes the group's block bitmap with the first `used` bits set, which is always the exact
/// usage pattern of a group.
pub fn write_block_bitmap(
    device: &dyn BlockDevice,
    geometry: &Geometry,
    desc: &GroupDescriptor,
    used: u32,
) -> Result<()> {
    let mut block = vec![0u8; geometry.block_size];
    for bit in 0..used as usize {
        block[bit / 8] |= 1 << (bit % 8);
    }
    device.write_block(desc.bitmap_block(), &block)
}

/// Number of leading set bits in a block bitmap and whether anything is set after them.
pub fn read_block_bitmap(
    device: &dyn BlockDevice,
    desc: &GroupDescriptor,
    direct_blocks: usize,
) -> Result<(u32, bool)> {
    let block = device.read_block_vec(desc.bitmap_block())?;
    let is_set = |bit: usize| block[bit / 8] & (1 << (bit % 8)) != 0;
    let prefix = (0..direct_blocks).take_while(|bit| is_set(*bit)).count();
    let stray = (prefix..direct_blocks).any(is_set);
    Ok((prefix as u32, stray))
}
