use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libc::{EINVAL, EISDIR, ENOTDIR};
use log::{debug, error, info};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ext0_lib::inode::Inode;
use ext0_lib::types::{FileKind, now_secs};
use ext0_lib::{Ext0Error, Node, Result, SetAttr, Volume};

const TTL: Duration = Duration::from_secs(1);

/// The kernel's root inode number is 1, which is also the ext0 root, so inode numbers pass
/// through unchanged.
pub struct Ext0Fs {
    volume: Volume,
    uid: u32,
    gid: u32,
}

fn file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::RegularFile | FileKind::Unknown => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
        FileKind::SymbolicLink => FileType::Symlink,
        FileKind::CharDevice => FileType::CharDevice,
        FileKind::BlockDevice => FileType::BlockDevice,
        FileKind::NamedPipe => FileType::NamedPipe,
        FileKind::Socket => FileType::Socket,
    }
}

fn system_time(secs: u32) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(u64::from(secs))
}

fn on_disk_time(time: TimeOrNow) -> u32 {
    match time {
        TimeOrNow::Now => now_secs(),
        TimeOrNow::SpecificTime(at) => at
            .duration_since(UNIX_EPOCH)
            .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
            .unwrap_or(0),
    }
}

/// Applies the umask to the permission bits and keeps the type bits.
fn masked_mode(mode: u32, umask: u32) -> u16 {
    (mode & !(umask & 0o7777)) as u16
}

fn errno(err: &Ext0Error) -> i32 {
    let code = err.to_errno();
    match err {
        Ext0Error::Io(_) | Ext0Error::Corruption { .. } | Ext0Error::NotMapped(_) => {
            error!("{err}")
        }
        _ => debug!("replying errno {code}: {err}"),
    }
    code
}

impl Ext0Fs {
    /// Files are shown as owned by `uid`/`gid`, the inodes carry no owner.
    pub fn new(volume: Volume, uid: u32, gid: u32) -> Self {
        Self { volume, uid, gid }
    }

    fn attr(&self, ino: u64, inode: &Inode) -> FileAttr {
        let block_size = self.volume.geometry().block_size as u32;
        let kind = inode.kind();
        let rdev = match kind {
            FileKind::CharDevice | FileKind::BlockDevice => inode.block[0],
            _ => 0,
        };
        FileAttr {
            ino,
            size: u64::from(inode.size),
            // st_blocks counts 512 byte units
            blocks: u64::from(inode.blocks) * u64::from(block_size / 512),
            atime: system_time(inode.atime),
            mtime: system_time(inode.mtime),
            ctime: system_time(inode.ctime),
            crtime: system_time(inode.ctime),
            kind: file_type(kind),
            perm: inode.permissions(),
            nlink: u32::from(inode.links_count),
            uid: self.uid,
            gid: self.gid,
            rdev,
            blksize: block_size,
            flags: 0,
        }
    }

    fn node_attr(&self, node: &Node<'_>) -> Result<FileAttr> {
        Ok(self.attr(node.ino(), &node.inode()?))
    }

    fn lookup_attr(&self, parent: u64, name: &[u8]) -> Result<FileAttr> {
        let ino = self.volume.node(parent)?.into_dir()?.lookup(name)?;
        self.node_attr(&self.volume.node(ino)?)
    }

    fn mkdir_attr(&self, parent: u64, name: &[u8], perm: u16) -> Result<FileAttr> {
        let dir = self.volume.node(parent)?.into_dir()?.mkdir(name, perm)?;
        Ok(self.attr(dir.ino(), &dir.inode()?))
    }

    fn create_attr(&self, parent: u64, name: &[u8], perm: u16) -> Result<FileAttr> {
        let file = self.volume.node(parent)?.into_dir()?.create(name, perm)?;
        Ok(self.attr(file.ino(), &file.inode()?))
    }

    fn mknod_attr(&self, parent: u64, name: &[u8], mode: u16, rdev: u32) -> Result<FileAttr> {
        let node = self
            .volume
            .node(parent)?
            .into_dir()?
            .mknod(name, mode, rdev)?;
        self.node_attr(&node)
    }

    fn symlink_attr(&self, parent: u64, name: &[u8], target: &[u8]) -> Result<FileAttr> {
        let link = self
            .volume
            .node(parent)?
            .into_dir()?
            .symlink(name, target)?;
        self.node_attr(&self.volume.node(link.ino())?)
    }

    fn link_attr(&self, ino: u64, new_parent: u64, new_name: &[u8]) -> Result<FileAttr> {
        let node = self
            .volume
            .node(new_parent)?
            .into_dir()?
            .link(new_name, ino)?;
        self.node_attr(&node)
    }

    fn set_attr(&self, ino: u64, attr: &SetAttr) -> Result<FileAttr> {
        let inode = self.volume.node(ino)?.set_attr(attr)?;
        Ok(self.attr(ino, &inode))
    }

    fn read_file(&self, ino: u64, offset: u64, len: usize) -> Result<Vec<u8>> {
        match self.volume.node(ino)? {
            Node::RegularFile(file) => file.read(offset, len),
            Node::Directory(_) => Err(Ext0Error::IsDirectory),
            _ => Err(Ext0Error::InvalidArgument("read of a non-regular file")),
        }
    }

    fn write_file(&self, ino: u64, offset: u64, data: &[u8]) -> Result<usize> {
        match self.volume.node(ino)? {
            Node::RegularFile(file) => file.write(offset, data),
            Node::Directory(_) => Err(Ext0Error::IsDirectory),
            _ => Err(Ext0Error::InvalidArgument("write to a non-regular file")),
        }
    }

    fn read_link(&self, ino: u64) -> Result<Vec<u8>> {
        match self.volume.node(ino)? {
            Node::SymbolicLink(link) => link.target(),
            _ => Err(Ext0Error::InvalidArgument("not a symlink")),
        }
    }

    fn unlink_name(&self, parent: u64, name: &[u8]) -> Result<()> {
        self.volume.node(parent)?.into_dir()?.unlink(name)
    }

    fn rmdir_name(&self, parent: u64, name: &[u8]) -> Result<()> {
        self.volume.node(parent)?.into_dir()?.rmdir(name)
    }

    fn rename_name(
        &self,
        parent: u64,
        name: &[u8],
        new_parent: u64,
        new_name: &[u8],
    ) -> Result<()> {
        let from = self.volume.node(parent)?.into_dir()?;
        let to = self.volume.node(new_parent)?.into_dir()?;
        from.rename(name, &to, new_name)
    }

    fn kind_of(&self, ino: u64) -> Result<FileKind> {
        self.volume.node(ino)?.kind()
    }
}

impl Filesystem for Ext0Fs {
    // 1. LOOKUP
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.lookup_attr(parent, name.as_bytes()) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(errno(&err)),
        }
    }

    // 2. GETATTR
    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        match self.volume.node(ino).and_then(|node| self.node_attr(&node)) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(err) => reply.error(errno(&err)),
        }
    }

    // 3. SETATTR: chmod, truncate, touch
    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let attr = SetAttr {
            mode: mode.map(|m| (m & 0o7777) as u16),
            size,
            atime: atime.map(on_disk_time),
            mtime: mtime.map(on_disk_time),
        };
        match self.set_attr(ino, &attr) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(err) => reply.error(errno(&err)),
        }
    }

    // 4. READDIR: the offset is the directory byte position of the next entry
    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let dir = match self.volume.node(ino).and_then(Node::into_dir) {
            Ok(dir) => dir,
            Err(err) => {
                reply.error(errno(&err));
                return;
            }
        };
        let result = dir.iterate(offset.max(0) as u64, |entry, next| {
            let kind = file_type(FileKind::from_dir_entry_type(entry.file_type));
            // add() returns true once the reply buffer is full
            !reply.add(
                u64::from(entry.inode),
                next as i64,
                kind,
                OsStr::from_bytes(&entry.name),
            )
        });
        match result {
            Ok(_) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    // 5. CREATE
    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        match self.create_attr(parent, name.as_bytes(), masked_mode(mode, umask)) {
            Ok(attr) => reply.created(&TTL, &attr, 0, 0, 0),
            Err(err) => reply.error(errno(&err)),
        }
    }

    // 6. MKDIR
    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        match self.mkdir_attr(parent, name.as_bytes(), masked_mode(mode, umask)) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(errno(&err)),
        }
    }

    // 7. MKNOD: devices, FIFOs, sockets and plain files
    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        match self.mknod_attr(parent, name.as_bytes(), masked_mode(mode, umask), rdev) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(errno(&err)),
        }
    }

    // 8. SYMLINK / READLINK
    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        match self.symlink_attr(parent, name.as_bytes(), link.as_os_str().as_bytes()) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        match self.read_link(ino) {
            Ok(target) => reply.data(&target),
            Err(err) => reply.error(errno(&err)),
        }
    }

    // 9. LINK
    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        match self.link_attr(ino, newparent, newname.as_bytes()) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(err) => reply.error(errno(&err)),
        }
    }

    // 10. OPEN / OPENDIR
    fn open(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.kind_of(ino) {
            Ok(FileKind::Directory) => reply.error(EISDIR),
            Ok(_) => reply.opened(0, 0),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.kind_of(ino) {
            Ok(FileKind::Directory) => reply.opened(0, 0),
            Ok(_) => reply.error(ENOTDIR),
            Err(err) => reply.error(errno(&err)),
        }
    }

    // 11. READ
    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        match self.read_file(ino, offset as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(errno(&err)),
        }
    }

    // 12. WRITE
    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        match self.write_file(ino, offset as u64, data) {
            Ok(written) => reply.written(written as u32),
            Err(err) => reply.error(errno(&err)),
        }
    }

    // 13. UNLINK / RMDIR
    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.unlink_name(parent, name.as_bytes()) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.rmdir_name(parent, name.as_bytes()) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    // 14. RENAME: RENAME_NOREPLACE and RENAME_EXCHANGE are not supported
    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            reply.error(EINVAL);
            return;
        }
        match self.rename_name(parent, name.as_bytes(), newparent, newname.as_bytes()) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    // 15. STATFS
    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        let stat = self.volume.statfs();
        reply.statfs(
            stat.blocks,
            stat.free_blocks,
            stat.free_blocks,
            stat.files,
            stat.free_files,
            stat.block_size,
            stat.name_len,
            stat.block_size,
        );
    }

    // 16. FSYNC: data is already on the device, this pushes the replicas out too
    fn fsync(&mut self, _req: &Request, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.volume.sync() {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn destroy(&mut self) {
        match self.volume.close() {
            Ok(()) => info!("unmounted"),
            Err(err) => error!("final sync failed, run ext0_fsck: {err}"),
        }
    }
}
