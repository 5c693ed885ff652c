//! Builds a fresh ext0 image: the boot block, then per group the superblock replica, the
//! descriptor, the inode block and the block bitmap, plus the root directory in group 0.

use log::{debug, info};

use crate::bitmap::Bitmap;
use crate::descriptor::{GroupDescriptor, write_descriptor};
use crate::device::BlockDevice;
use crate::dir;
use crate::error::{Ext0Error, Result};
use crate::inode::{Inode, write_inode};
use crate::layout::{Geometry, logical_to_physical};
use crate::superblock::SuperBlock;
use crate::translate::write_block_bitmap;
use crate::types::{FileKind, GroupIndex, ROOT_GROUP, ROOT_INO, now_secs};

pub const DEFAULT_VOLUME_NAME: &str = "ext0";
const VOLUME_NAME_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct MkfsOptions {
    pub geometry: Geometry,
    pub volume_name: String,
    pub uuid: [u8; 16],
}

impl Default for MkfsOptions {
    fn default() -> Self {
        Self {
            geometry: Geometry::default(),
            volume_name: DEFAULT_VOLUME_NAME.to_string(),
            uuid: *uuid::Uuid::new_v4().as_bytes(),
        }
    }
}

/// What the builder computed for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    pub fs_size: u64,
    pub groups_count: u32,
    pub blocks_per_group: u64,
    pub block_size: usize,
    /// 1-based number of the last block in use.
    pub last_block: u64,
}

/// Works out the layout for a device of `device_bytes` without writing anything.
pub fn plan(geometry: &Geometry, device_bytes: u64) -> Result<ImageLayout> {
    geometry.validate()?;
    let groups_count = geometry.capped_group_count(device_bytes);
    if groups_count == 0 {
        return Err(Ext0Error::InvalidGeometry(format!(
            "{device_bytes} bytes is too small for a single group of {} blocks",
            geometry.blocks_per_group()
        )));
    }
    Ok(ImageLayout {
        fs_size: device_bytes,
        groups_count,
        blocks_per_group: geometry.blocks_per_group(),
        block_size: geometry.block_size,
        last_block: geometry.last_block(groups_count),
    })
}

/// The root directory's inode: one mapped block holding `.` and `..`.
fn root_inode(geometry: &Geometry, used: usize, now: u32) -> Inode {
    let mut inode = Inode::new(FileKind::Directory.mode_bits() | 0o755, now);
    inode.links_count = 2;
    inode.blocks = 1;
    inode.size = used as u32;
    inode.block[0] = logical_to_physical(geometry.first_data_logical(ROOT_GROUP)) as u32;
    inode
}

/// Writes the whole image. The first failing write or flush aborts with its error; what was
/// written before stays on the device.
pub fn build_image(device: &dyn BlockDevice, options: &MkfsOptions) -> Result<ImageLayout> {
    let geometry = options.geometry;
    if geometry.block_size != device.block_size() {
        return Err(Ext0Error::InvalidGeometry(format!(
            "{} byte blocks requested on a device of {} byte blocks",
            geometry.block_size,
            device.block_size()
        )));
    }
    if options.volume_name.len() > VOLUME_NAME_LEN {
        return Err(Ext0Error::InvalidName);
    }
    let layout = plan(&geometry, device.size_bytes())?;
    info!(
        "formatting {} bytes: {} groups of {} blocks",
        layout.fs_size, layout.groups_count, layout.blocks_per_group
    );

    let now = now_secs();
    let zero = vec![0u8; geometry.block_size];
    let mut sb = SuperBlock::new(
        &geometry,
        layout.groups_count,
        device.block_count(),
        options.uuid,
        &options.volume_name,
        now,
    );
    let bitmap = Bitmap::with_root();

    let mut root_dir = vec![0u8; geometry.block_size];
    let used = dir::init_block(&mut root_dir, ROOT_INO as u32, ROOT_INO as u32);
    let root = root_inode(&geometry, used, now);

    // 1. boot block
    device.write_block(0, &zero)?;

    let mut block = vec![0u8; geometry.block_size];
    for g in 0..layout.groups_count {
        let group = GroupIndex::new(g);

        // 2. superblock replica
        sb.block_group_nr = g as u16;
        block.fill(0);
        sb.encode_into(&bitmap, &mut block)?;
        device.write_block(geometry.superblock_block(group), &block)?;

        // 3. descriptor
        let mut desc = GroupDescriptor::for_group(&geometry, group);
        if group.is_root() {
            desc.free_blocks_count -= 1;
        }
        write_descriptor(device, &geometry, group, &desc)?;

        // 4. inode and block bitmap
        if group.is_root() {
            write_inode(device, &geometry, group, &root)?;
            write_block_bitmap(device, &geometry, &desc, 1)?;
            device.write_block(logical_to_physical(u64::from(desc.first_block)), &root_dir)?;
        } else {
            device.write_block(geometry.inode_block(group), &zero)?;
            write_block_bitmap(device, &geometry, &desc, 0)?;
        }
        debug!("wrote metadata of {group}");
    }

    device.flush()?;
    info!("image complete, last block {}", layout.last_block);
    Ok(layout)
}
