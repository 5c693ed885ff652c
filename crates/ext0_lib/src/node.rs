//! Typed handles on live entities.
//!
//! A [`Node`] says up front what an entity can do: only a [`DirNode`] has directory
//! operations, only a [`FileNode`] reads and writes bytes. Every handle is a group index and a
//! borrow of the [`Volume`]; nothing is cached, each call reads the inode under the entity
//! lock.

use std::sync::RwLockWriteGuard;

use log::{debug, warn};

use crate::dir::{self, DirEntry, Record, Records};
use crate::error::{Ext0Error, Result};
use crate::inode::Inode;
use crate::types::{FileKind, GroupIndex, now_secs};
use crate::volume::Volume;

/// Attribute changes requested by the switch layer. `None` leaves a field alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetAttr {
    /// Permission bits; the file type is kept.
    pub mode: Option<u16>,
    pub size: Option<u64>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
}

#[derive(Clone, Copy)]
struct Entity<'a> {
    volume: &'a Volume,
    group: GroupIndex,
}

impl<'a> Entity<'a> {
    fn ino(&self) -> u64 {
        self.group.ino()
    }

    fn block_size(&self) -> u64 {
        self.volume.geometry().block_size as u64
    }

    fn inode(&self) -> Result<Inode> {
        let _guard = self.volume.read_entity(self.group)?;
        self.volume.read_inode(self.group)
    }

    fn write_inode(&self, inode: &Inode) -> Result<()> {
        self.volume.write_inode(self.group, inode)
    }

    /// Bytes `offset..offset + len`, clipped to the entity size. Holes read as zeros.
    fn read_content(&self, inode: &Inode, offset: u64, len: usize) -> Result<Vec<u8>> {
        let size = u64::from(inode.size);
        if offset >= size {
            return Ok(Vec::new());
        }
        let end = offset.saturating_add(len as u64).min(size);
        let bs = self.block_size();
        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut pos = offset;
        while pos < end {
            let within = (pos % bs) as usize;
            let take = (bs - within as u64).min(end - pos) as usize;
            match self.volume.lookup_block(self.group, inode, pos / bs) {
                Ok(physical) => {
                    let block = self.volume.device().read_block_vec(physical)?;
                    out.extend_from_slice(&block[within..within + take]);
                }
                Err(Ext0Error::NotMapped(_)) => out.resize(out.len() + take, 0),
                Err(err) => return Err(err),
            }
            pos += take as u64;
        }
        Ok(out)
    }

    /// Writes `data` at `offset`, mapping blocks as needed. The caller holds the entity's write
    /// lock and persists `inode` afterwards.
    fn write_content(&self, inode: &mut Inode, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= self.volume.geometry().max_file_size())
            .ok_or(Ext0Error::NoSpace("write runs past the direct blocks"))?;
        let bs = self.block_size();
        let device = self.volume.device();
        let mut pos = offset;
        let mut written = 0;
        while pos < end {
            let logical = pos / bs;
            let within = (pos % bs) as usize;
            let take = (bs - within as u64).min(end - pos) as usize;

            let mapping = self.volume.map_block(self.group, inode, logical, true)?;
            let zero = vec![0u8; bs as usize];
            for fresh in mapping.fresh.clone() {
                if u64::from(fresh) != logical {
                    device.write_block(u64::from(inode.block[fresh as usize]), &zero)?;
                }
            }
            let mut block = if mapping.fresh.contains(&(logical as u32)) || take == bs as usize {
                zero
            } else {
                device.read_block_vec(mapping.physical)?
            };
            block[within..within + take].copy_from_slice(&data[written..written + take]);
            device.write_block(mapping.physical, &block)?;

            pos += take as u64;
            written += take;
        }
        if end > u64::from(inode.size) {
            inode.size = end as u32;
        }
        inode.touch(now_secs());
        Ok(())
    }

    /// Sets the size, dropping blocks past the new end. Growing leaves a hole.
    fn truncate_content(&self, inode: &mut Inode, size: u64) -> Result<()> {
        if size > self.volume.geometry().max_file_size() {
            return Err(Ext0Error::NoSpace("size is past the direct blocks"));
        }
        let bs = self.block_size();
        self.volume
            .unmap_from(self.group, inode, size.div_ceil(bs) as u32)?;

        // bytes after the new end must read back as zeros if the file grows again
        let tail = (size % bs) as usize;
        if size < u64::from(inode.size) && tail != 0 && size / bs < u64::from(inode.blocks) {
            let physical = self.volume.lookup_block(self.group, inode, size / bs)?;
            let mut block = self.volume.device().read_block_vec(physical)?;
            block[tail..].fill(0);
            self.volume.device().write_block(physical, &block)?;
        }
        inode.size = size as u32;
        inode.touch(now_secs());
        Ok(())
    }
}

/// A live entity, typed by what it is.
pub enum Node<'a> {
    RegularFile(FileNode<'a>),
    Directory(DirNode<'a>),
    SymbolicLink(SymlinkNode<'a>),
    Other(SpecialNode<'a>),
}

impl<'a> Node<'a> {
    pub(crate) fn new(volume: &'a Volume, group: GroupIndex, kind: FileKind) -> Self {
        let entity = Entity { volume, group };
        match kind {
            FileKind::RegularFile => Node::RegularFile(FileNode { entity }),
            FileKind::Directory => Node::Directory(DirNode { entity }),
            FileKind::SymbolicLink => Node::SymbolicLink(SymlinkNode { entity }),
            _ => Node::Other(SpecialNode { entity }),
        }
    }

    fn entity(&self) -> Entity<'a> {
        match self {
            Node::RegularFile(node) => node.entity,
            Node::Directory(node) => node.entity,
            Node::SymbolicLink(node) => node.entity,
            Node::Other(node) => node.entity,
        }
    }

    pub fn ino(&self) -> u64 {
        self.entity().ino()
    }

    pub fn group(&self) -> GroupIndex {
        self.entity().group
    }

    pub fn inode(&self) -> Result<Inode> {
        self.entity().inode()
    }

    pub fn kind(&self) -> Result<FileKind> {
        Ok(self.inode()?.kind())
    }

    pub fn into_dir(self) -> Result<DirNode<'a>> {
        match self {
            Node::Directory(dir) => Ok(dir),
            _ => Err(Ext0Error::NotDirectory),
        }
    }

    /// Applies `attr` and returns the updated inode. Only regular files can change size.
    pub fn set_attr(&self, attr: &SetAttr) -> Result<Inode> {
        let entity = self.entity();
        let _guard = entity.volume.write_entity(entity.group)?;
        let mut inode = entity.volume.read_inode(entity.group)?;
        if let Some(size) = attr.size {
            match self {
                Node::RegularFile(_) => entity.truncate_content(&mut inode, size)?,
                Node::Directory(_) => return Err(Ext0Error::IsDirectory),
                _ => return Err(Ext0Error::InvalidArgument("size of a non-regular file")),
            }
        }
        if let Some(mode) = attr.mode {
            inode.mode = inode.kind().mode_bits() | (mode & 0o7777);
        }
        if let Some(atime) = attr.atime {
            inode.atime = atime;
        }
        if let Some(mtime) = attr.mtime {
            inode.mtime = mtime;
        }
        inode.ctime = now_secs();
        entity.write_inode(&inode)?;
        Ok(inode)
    }
}

pub struct FileNode<'a> {
    entity: Entity<'a>,
}

impl FileNode<'_> {
    pub fn ino(&self) -> u64 {
        self.entity.ino()
    }

    pub fn inode(&self) -> Result<Inode> {
        self.entity.inode()
    }

    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let _guard = self.entity.volume.read_entity(self.entity.group)?;
        let inode = self.entity.volume.read_inode(self.entity.group)?;
        self.entity.read_content(&inode, offset, len)
    }

    /// Writes all of `data` or nothing past what the direct blocks can hold.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let _guard = self.entity.volume.write_entity(self.entity.group)?;
        let mut inode = self.entity.volume.read_inode(self.entity.group)?;
        self.entity.write_content(&mut inode, offset, data)?;
        self.entity.write_inode(&inode)?;
        Ok(data.len())
    }

    pub fn truncate(&self, size: u64) -> Result<()> {
        let _guard = self.entity.volume.write_entity(self.entity.group)?;
        let mut inode = self.entity.volume.read_inode(self.entity.group)?;
        self.entity.truncate_content(&mut inode, size)?;
        self.entity.write_inode(&inode)
    }
}

pub struct SymlinkNode<'a> {
    entity: Entity<'a>,
}

impl SymlinkNode<'_> {
    pub fn ino(&self) -> u64 {
        self.entity.ino()
    }

    pub fn target(&self) -> Result<Vec<u8>> {
        let _guard = self.entity.volume.read_entity(self.entity.group)?;
        let inode = self.entity.volume.read_inode(self.entity.group)?;
        self.entity.read_content(&inode, 0, inode.size as usize)
    }
}

/// Device nodes, FIFOs and sockets: nothing but attributes.
pub struct SpecialNode<'a> {
    entity: Entity<'a>,
}

impl SpecialNode<'_> {
    pub fn ino(&self) -> u64 {
        self.entity.ino()
    }

    /// Device number, kept in the first pointer slot (never mapped for these kinds).
    pub fn rdev(&self) -> Result<u32> {
        Ok(self.entity.inode()?.block[0])
    }
}

/// A directory entry found under the locks that make it safe to change.
struct Located<'a> {
    _guards: Vec<RwLockWriteGuard<'a, ()>>,
    physical: u64,
    record: Record,
    child: GroupIndex,
}

pub struct DirNode<'a> {
    entity: Entity<'a>,
}

impl<'a> DirNode<'a> {
    pub fn ino(&self) -> u64 {
        self.entity.ino()
    }

    pub fn inode(&self) -> Result<Inode> {
        self.entity.inode()
    }

    fn volume(&self) -> &'a Volume {
        self.entity.volume
    }

    fn group(&self) -> GroupIndex {
        self.entity.group
    }

    /// Linear scan of every mapped block for `name`.
    fn find(&self, inode: &Inode, name: &[u8]) -> Result<Option<(u64, Record)>> {
        for logical in 0..u64::from(inode.blocks) {
            let physical = self.volume().lookup_block(self.group(), inode, logical)?;
            let block = self.volume().device().read_block_vec(physical)?;
            if let Some(record) = dir::lookup(&block, physical, name)? {
                return Ok(Some((physical, record)));
            }
        }
        Ok(None)
    }

    /// Puts a record in the first block with room for it. `NoSpace` when no mapped block has
    /// room; blocks are never added here.
    fn append(&self, inode: &mut Inode, name: &[u8], ino: u32, file_type: u8) -> Result<()> {
        let need = dir::required_rec_len(name.len());
        let bs = self.entity.block_size();
        for logical in 0..u64::from(inode.blocks) {
            let physical = self.volume().lookup_block(self.group(), inode, logical)?;
            let mut block = self.volume().device().read_block_vec(physical)?;
            if let Some(slot) = dir::find_slot(&block, physical, need)? {
                dir::write_record(&mut block, slot, ino, file_type, name)?;
                self.volume().device().write_block(physical, &block)?;
                let end = logical * bs + (slot.offset + slot.rec_len) as u64;
                if end > u64::from(inode.size) {
                    inode.size = end as u32;
                }
                inode.touch(now_secs());
                return Ok(());
            }
        }
        Err(Ext0Error::NoSpace("directory blocks are full"))
    }

    /// [`Self::append`], growing the directory by one zeroed block if every block is full.
    fn insert(&self, inode: &mut Inode, name: &[u8], ino: u32, file_type: u8) -> Result<()> {
        match self.append(inode, name, ino, file_type) {
            Err(Ext0Error::NoSpace(_)) => {
                let next = u64::from(inode.blocks);
                let mapping = self.volume().map_block(self.group(), inode, next, true)?;
                let zero = vec![0u8; self.entity.block_size() as usize];
                self.volume().device().write_block(mapping.physical, &zero)?;
                debug!("directory {} grew to {} blocks", self.ino(), inode.blocks);
                self.append(inode, name, ino, file_type)
            }
            other => other,
        }
    }

    fn remove_record(&self, inode: &mut Inode, physical: u64, offset: usize) -> Result<()> {
        let mut block = self.volume().device().read_block_vec(physical)?;
        dir::clear_record(&mut block, offset);
        self.volume().device().write_block(physical, &block)?;
        inode.touch(now_secs());
        Ok(())
    }

    /// Takes one link off an entity whose write lock is held, freeing it at zero.
    fn drop_link(&self, group: GroupIndex, mut inode: Inode) -> Result<()> {
        inode.links_count = inode.links_count.saturating_sub(1);
        if inode.links_count == 0 {
            return self.volume().reclaim(group, inode);
        }
        inode.ctime = now_secs();
        self.volume().write_inode(group, &inode)
    }

    /// Locks this directory and whatever `name` points at, in group order, and checks the
    /// name still points there once both are held.
    fn locate(&self, name: &[u8]) -> Result<Located<'a>> {
        loop {
            let ino = self.lookup(name)?;
            let child = self.volume().group_of(ino).map_err(|_| {
                Ext0Error::corruption(
                    self.volume().geometry().inode_block(self.group()),
                    format!("entry points at inode {ino}, outside the volume"),
                )
            })?;
            let guards = self.volume().write_entities(&[self.group(), child])?;
            let inode = self.volume().read_inode(self.group())?;
            if let Some((physical, record)) = self.find(&inode, name)? {
                if u64::from(record.entry.inode) == ino {
                    return Ok(Located {
                        _guards: guards,
                        physical,
                        record,
                        child,
                    });
                }
            }
        }
    }

    /// Inode number of the entry called `name`.
    pub fn lookup(&self, name: &[u8]) -> Result<u64> {
        dir::validate_name(name)?;
        let _guard = self.volume().read_entity(self.group())?;
        let inode = self.volume().read_inode(self.group())?;
        self.find(&inode, name)?
            .map(|(_, record)| u64::from(record.entry.inode))
            .ok_or(Ext0Error::NotFound)
    }

    /// Allocates an entity, lets `init` fill it in and links it here as `name`.
    ///
    /// The slot is taken before any lock on this directory is held. Parent and child are then
    /// locked together in group order, and the name is checked again under those locks.
    fn new_child<F>(&self, name: &[u8], mode: u16, init: F) -> Result<Node<'a>>
    where
        F: FnOnce(&Entity<'a>, &mut Inode) -> Result<()>,
    {
        dir::validate_name(name)?;
        {
            let _guard = self.volume().read_entity(self.group())?;
            let parent = self.volume().read_inode(self.group())?;
            if self.find(&parent, name)?.is_some() {
                return Err(Ext0Error::Exists);
            }
        }

        let (group, inode) = self.volume().allocate_entity(mode)?;
        let child = Entity {
            volume: self.volume(),
            group,
        };
        let kind = inode.kind();
        let attached = self
            .volume()
            .write_entities(&[self.group(), group])
            .and_then(|_guards| self.attach(&child, inode, name, init));
        if let Err(err) = attached {
            if let Err(undo) = self.volume().release_entity(child.ino()) {
                warn!("could not release {group} after a failed create: {undo}");
            }
            return Err(err);
        }
        Ok(Node::new(self.volume(), group, kind))
    }

    /// Fills in `child` and links it as `name`. The caller holds both write locks.
    fn attach<F>(&self, child: &Entity<'a>, mut inode: Inode, name: &[u8], init: F) -> Result<()>
    where
        F: FnOnce(&Entity<'a>, &mut Inode) -> Result<()>,
    {
        let mut parent = self.volume().read_inode(self.group())?;
        if self.find(&parent, name)?.is_some() {
            return Err(Ext0Error::Exists);
        }
        inode.links_count = 1;
        init(child, &mut inode)?;
        child.write_inode(&inode)?;

        self.insert(&mut parent, name, child.ino() as u32, inode.kind().dir_entry_type())?;
        if inode.is_dir() {
            parent.links_count += 1;
        }
        self.entity.write_inode(&parent)
    }

    /// New empty regular file with permission bits `perm`.
    pub fn create(&self, name: &[u8], perm: u16) -> Result<FileNode<'a>> {
        let mode = FileKind::RegularFile.mode_bits() | (perm & 0o7777);
        match self.new_child(name, mode, |_, _| Ok(()))? {
            Node::RegularFile(file) => Ok(file),
            _ => Err(Ext0Error::InvalidArgument("created entity is not a regular file")),
        }
    }

    pub fn mkdir(&self, name: &[u8], perm: u16) -> Result<DirNode<'a>> {
        let mode = FileKind::Directory.mode_bits() | (perm & 0o7777);
        let parent_ino = self.ino() as u32;
        let node = self.new_child(name, mode, |child, inode| {
            inode.links_count = 2;
            let mapping = child.volume.map_block(child.group, inode, 0, true)?;
            let mut block = vec![0u8; child.block_size() as usize];
            let used = dir::init_block(&mut block, child.ino() as u32, parent_ino);
            child.volume.device().write_block(mapping.physical, &block)?;
            inode.size = used as u32;
            Ok(())
        })?;
        node.into_dir()
    }

    pub fn symlink(&self, name: &[u8], target: &[u8]) -> Result<SymlinkNode<'a>> {
        if target.is_empty() {
            return Err(Ext0Error::InvalidArgument("empty symlink target"));
        }
        let mode = FileKind::SymbolicLink.mode_bits() | 0o777;
        match self.new_child(name, mode, |child, inode| {
            child.write_content(inode, 0, target)
        })? {
            Node::SymbolicLink(link) => Ok(link),
            _ => Err(Ext0Error::InvalidArgument("created entity is not a symlink")),
        }
    }

    /// Regular files, device nodes, FIFOs and sockets. `rdev` only matters for devices.
    pub fn mknod(&self, name: &[u8], mode: u16, rdev: u32) -> Result<Node<'a>> {
        let kind = FileKind::from_mode(mode);
        match kind {
            FileKind::RegularFile | FileKind::NamedPipe | FileKind::Socket => {
                self.new_child(name, mode, |_, _| Ok(()))
            }
            FileKind::CharDevice | FileKind::BlockDevice => {
                self.new_child(name, mode, |_, inode| {
                    inode.block[0] = rdev;
                    Ok(())
                })
            }
            _ => Err(Ext0Error::InvalidArgument("mknod of a directory or symlink")),
        }
    }

    /// Hard link: `name` here becomes another name of `ino`.
    pub fn link(&self, name: &[u8], ino: u64) -> Result<Node<'a>> {
        dir::validate_name(name)?;
        let target = self.volume().group_of(ino)?;
        let _guards = self.volume().write_entities(&[self.group(), target])?;
        let mut inode = self.volume().read_inode(target)?;
        // no links yet: the entity is still being created under another name
        if !inode.is_live() || inode.links_count == 0 {
            return Err(Ext0Error::NotFound);
        }
        if inode.is_dir() {
            return Err(Ext0Error::IsDirectory);
        }
        let mut parent = self.volume().read_inode(self.group())?;
        if self.find(&parent, name)?.is_some() {
            return Err(Ext0Error::Exists);
        }
        let links = inode
            .links_count
            .checked_add(1)
            .ok_or(Ext0Error::NoSpace("link count"))?;

        self.insert(&mut parent, name, ino as u32, inode.kind().dir_entry_type())?;
        self.entity.write_inode(&parent)?;
        inode.links_count = links;
        inode.ctime = now_secs();
        self.volume().write_inode(target, &inode)?;
        Ok(Node::new(self.volume(), target, inode.kind()))
    }

    /// Removes a non-directory name. The entity goes when its last link does.
    pub fn unlink(&self, name: &[u8]) -> Result<()> {
        dir::validate_name(name)?;
        let found = self.locate(name)?;
        let child = self.volume().read_inode(found.child)?;
        if child.is_dir() {
            return Err(Ext0Error::IsDirectory);
        }
        let mut parent = self.volume().read_inode(self.group())?;
        self.remove_record(&mut parent, found.physical, found.record.offset)?;
        self.entity.write_inode(&parent)?;
        self.drop_link(found.child, child)
    }

    pub fn rmdir(&self, name: &[u8]) -> Result<()> {
        match name {
            b"." => return Err(Ext0Error::InvalidArgument("cannot remove '.'")),
            b".." => return Err(Ext0Error::NotEmpty),
            _ => dir::validate_name(name)?,
        }
        let found = self.locate(name)?;
        let child = self.volume().read_inode(found.child)?;
        if !child.is_dir() {
            return Err(Ext0Error::NotDirectory);
        }
        let child_dir = DirNode {
            entity: Entity {
                volume: self.volume(),
                group: found.child,
            },
        };
        if !child_dir.is_empty_locked(&child)? {
            return Err(Ext0Error::NotEmpty);
        }
        let mut parent = self.volume().read_inode(self.group())?;
        self.remove_record(&mut parent, found.physical, found.record.offset)?;
        parent.links_count = parent.links_count.saturating_sub(1);
        self.entity.write_inode(&parent)?;
        self.volume().reclaim(found.child, child)
    }

    /// Moves `name` to `new_name` in `new_parent`, replacing an existing non-directory there.
    pub fn rename(&self, name: &[u8], new_parent: &DirNode<'a>, new_name: &[u8]) -> Result<()> {
        for n in [name, new_name] {
            if n == b"." || n == b".." {
                return Err(Ext0Error::InvalidArgument("cannot rename '.' or '..'"));
            }
            dir::validate_name(n)?;
        }
        loop {
            let ino = self.lookup(name)?;
            let child = self.volume().group_of(ino)?;
            let existing = match new_parent.lookup(new_name) {
                Ok(target) => Some(self.volume().group_of(target)?),
                Err(Ext0Error::NotFound) => None,
                Err(err) => return Err(err),
            };
            let mut groups = vec![self.group(), new_parent.group(), child];
            groups.extend(existing);
            let _guards = self.volume().write_entities(&groups)?;

            let src = self.volume().read_inode(self.group())?;
            let Some((src_physical, src_record)) = self.find(&src, name)? else {
                continue;
            };
            let mut dst = self.volume().read_inode(new_parent.group())?;
            let dst_found = new_parent.find(&dst, new_name)?;
            let dst_group = dst_found
                .as_ref()
                .map(|(_, record)| GroupIndex::from_ino(u64::from(record.entry.inode)));
            if u64::from(src_record.entry.inode) != ino || dst_group != existing.map(Some) {
                continue;
            }
            if existing == Some(child) {
                return Ok(());
            }

            let mut moved = self.volume().read_inode(child)?;
            let reparent = moved.is_dir() && self.group() != new_parent.group();
            if reparent && self.is_ancestor(child, new_parent.group())? {
                return Err(Ext0Error::InvalidArgument("cannot move a directory into itself"));
            }
            let replaced = match existing {
                Some(target) => {
                    let replaced = self.volume().read_inode(target)?;
                    if replaced.is_dir() {
                        return Err(Ext0Error::IsDirectory);
                    }
                    if moved.is_dir() {
                        return Err(Ext0Error::NotDirectory);
                    }
                    Some((target, replaced))
                }
                None => None,
            };

            if let (Some((target, replaced)), Some((dst_physical, dst_record))) = (replaced, dst_found) {
                new_parent.remove_record(&mut dst, dst_physical, dst_record.offset)?;
                self.drop_link(target, replaced)?;
            }

            new_parent.insert(&mut dst, new_name, ino as u32, moved.kind().dir_entry_type())?;
            if reparent {
                dst.links_count += 1;
            }
            new_parent.entity.write_inode(&dst)?;

            // re-read: when both names live in one directory this is the inode just written
            let mut src = self.volume().read_inode(self.group())?;
            self.remove_record(&mut src, src_physical, src_record.offset)?;
            if reparent {
                src.links_count = src.links_count.saturating_sub(1);
                let physical = self.volume().lookup_block(child, &moved, 0)?;
                let mut block = self.volume().device().read_block_vec(physical)?;
                dir::set_parent(&mut block, physical, new_parent.ino() as u32)?;
                self.volume().device().write_block(physical, &block)?;
            }
            self.entity.write_inode(&src)?;

            moved.ctime = now_secs();
            self.volume().write_inode(child, &moved)?;
            debug!("renamed inode {ino} into directory {}", new_parent.ino());
            return Ok(());
        }
    }

    /// Whether `ancestor` is `dir` or one of the directories above it.
    fn is_ancestor(&self, ancestor: GroupIndex, dir: GroupIndex) -> Result<bool> {
        let mut current = dir;
        for _ in 0..=self.volume().groups_count() {
            if current == ancestor {
                return Ok(true);
            }
            if current.is_root() {
                return Ok(false);
            }
            let inode = self.volume().read_inode(current)?;
            let physical = self.volume().lookup_block(current, &inode, 0)?;
            let block = self.volume().device().read_block_vec(physical)?;
            let parent = dir::lookup(&block, physical, b"..")?
                .ok_or_else(|| Ext0Error::corruption(physical, "directory has no '..' entry"))?;
            current = GroupIndex::from_ino(u64::from(parent.entry.inode))
                .ok_or_else(|| Ext0Error::corruption(physical, "'..' points at inode 0"))?;
        }
        Err(Ext0Error::corruption(
            self.volume().geometry().inode_block(dir),
            "directory parents form a cycle",
        ))
    }

    /// Emits live entries from byte position `cursor` on, in block and offset order.
    ///
    /// `emit` receives each entry and the cursor just past it, and returns `false` to stop.
    /// The returned cursor is where the next call should resume: the entry `emit` refused, or
    /// the end of the directory.
    pub fn iterate<F>(&self, cursor: u64, mut emit: F) -> Result<u64>
    where
        F: FnMut(&DirEntry, u64) -> bool,
    {
        let _guard = self.volume().read_entity(self.group())?;
        let inode = self.volume().read_inode(self.group())?;
        let bs = self.entity.block_size();
        for logical in cursor / bs..u64::from(inode.blocks) {
            let physical = self.volume().lookup_block(self.group(), &inode, logical)?;
            let block = self.volume().device().read_block_vec(physical)?;
            for record in Records::new(&block, physical) {
                let record = record?;
                let pos = logical * bs + record.offset as u64;
                if pos < cursor || record.entry.is_tombstone() {
                    continue;
                }
                if !emit(&record.entry, pos + record.rec_len as u64) {
                    return Ok(pos);
                }
            }
        }
        Ok(u64::from(inode.blocks) * bs)
    }

    /// Every live entry, `.` and `..` included.
    pub fn entries(&self) -> Result<Vec<DirEntry>> {
        let mut out = Vec::new();
        self.iterate(0, |entry, _| {
            out.push(entry.clone());
            true
        })?;
        Ok(out)
    }

    pub fn is_empty(&self) -> Result<bool> {
        let _guard = self.volume().read_entity(self.group())?;
        let inode = self.volume().read_inode(self.group())?;
        self.is_empty_locked(&inode)
    }

    fn is_empty_locked(&self, inode: &Inode) -> Result<bool> {
        for logical in 0..u64::from(inode.blocks) {
            let physical = self.volume().lookup_block(self.group(), inode, logical)?;
            let block = self.volume().device().read_block_vec(physical)?;
            for record in Records::new(&block, physical) {
                let entry = record?.entry;
                if !entry.is_tombstone() && entry.name != b"." && entry.name != b".." {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}
