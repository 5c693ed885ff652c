use std::fmt;

// --- FORMAT CONSTANTS ---
pub const EXT0_MAGIC: u16 = 0xEF53;
pub const MIN_BLOCK_SIZE: usize = 1024;
pub const MAX_BLOCK_SIZE: usize = MIN_BLOCK_SIZE << 3;
pub const DIRECT_BLOCKS: usize = 12;
/// superblock -> block descriptor -> inode -> block bitmap
pub const GROUP_OVERHEAD_BLOCKS: usize = 4;
/// Block 0 is left alone for a boot loader.
pub const FS_OVERHEAD_BLOCKS: usize = 1;
pub const ALIGNMENT: usize = 4;
pub const MAX_NAME_LEN: usize = 128;
/// One bit per group, so this also caps the number of groups.
pub const INODE_BITMAP_BYTES: usize = 800;
pub const INODE_BITMAP_BITS: usize = INODE_BITMAP_BYTES * 8;
pub const INODE_SIZE: usize = 80;
pub const ROOT_GROUP: GroupIndex = GroupIndex(0);
pub const ROOT_INO: u64 = 1;

pub const STATE_CLEAN: u16 = 0;
pub const STATE_MOUNTED: u16 = 1;

/// Rounds `n` up to the directory record alignment.
pub const fn align_to(n: usize) -> usize {
    (n + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

pub const fn is_aligned(n: usize) -> bool {
    n & (ALIGNMENT - 1) == 0
}

/// Index of a block group.
///
/// Every group holds exactly one inode, so the group index *is* the inode slot. The externally
/// visible inode number is the index plus one, which keeps 0 free as the "no inode" sentinel
/// used by directory tombstones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupIndex(u32);

impl GroupIndex {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Inode number -> group. `None` for the 0 sentinel or numbers that overflow a group index.
    pub fn from_ino(ino: u64) -> Option<Self> {
        let index = ino.checked_sub(1)?;
        u32::try_from(index).ok().map(Self)
    }

    pub const fn ino(self) -> u64 {
        self.0 as u64 + 1
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub const fn is_root(self) -> bool {
        self.0 == ROOT_GROUP.0
    }
}

impl fmt::Display for GroupIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group {}", self.0)
    }
}

// Directory entry type tags (DT_* values).
pub const DT_UNKNOWN: u8 = 0;
pub const DT_FIFO: u8 = 1;
pub const DT_CHR: u8 = 2;
pub const DT_DIR: u8 = 4;
pub const DT_BLK: u8 = 6;
pub const DT_REG: u8 = 8;
pub const DT_LNK: u8 = 10;
pub const DT_SOCK: u8 = 12;

const S_IFMT: u16 = libc::S_IFMT as u16;

/// What kind of entity an inode describes, derived from the `S_IFMT` bits of its mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    RegularFile,
    Directory,
    SymbolicLink,
    CharDevice,
    BlockDevice,
    NamedPipe,
    Socket,
    Unknown,
}

impl FileKind {
    pub fn from_mode(mode: u16) -> Self {
        match u32::from(mode & S_IFMT) {
            libc::S_IFREG => FileKind::RegularFile,
            libc::S_IFDIR => FileKind::Directory,
            libc::S_IFLNK => FileKind::SymbolicLink,
            libc::S_IFCHR => FileKind::CharDevice,
            libc::S_IFBLK => FileKind::BlockDevice,
            libc::S_IFIFO => FileKind::NamedPipe,
            libc::S_IFSOCK => FileKind::Socket,
            _ => FileKind::Unknown,
        }
    }

    /// Mode bits for this kind, to be or-ed with the permission bits.
    pub fn mode_bits(self) -> u16 {
        let bits = match self {
            FileKind::RegularFile | FileKind::Unknown => libc::S_IFREG,
            FileKind::Directory => libc::S_IFDIR,
            FileKind::SymbolicLink => libc::S_IFLNK,
            FileKind::CharDevice => libc::S_IFCHR,
            FileKind::BlockDevice => libc::S_IFBLK,
            FileKind::NamedPipe => libc::S_IFIFO,
            FileKind::Socket => libc::S_IFSOCK,
        };
        bits as u16
    }

    pub fn dir_entry_type(self) -> u8 {
        match self {
            FileKind::RegularFile => DT_REG,
            FileKind::Directory => DT_DIR,
            FileKind::SymbolicLink => DT_LNK,
            FileKind::CharDevice => DT_CHR,
            FileKind::BlockDevice => DT_BLK,
            FileKind::NamedPipe => DT_FIFO,
            FileKind::Socket => DT_SOCK,
            FileKind::Unknown => DT_UNKNOWN,
        }
    }

    pub fn from_dir_entry_type(tag: u8) -> Self {
        match tag {
            DT_REG => FileKind::RegularFile,
            DT_DIR => FileKind::Directory,
            DT_LNK => FileKind::SymbolicLink,
            DT_CHR => FileKind::CharDevice,
            DT_BLK => FileKind::BlockDevice,
            DT_FIFO => FileKind::NamedPipe,
            DT_SOCK => FileKind::Socket,
            _ => FileKind::Unknown,
        }
    }
}

/// Current wall clock time in the on-disk u32 seconds format.
pub fn now_secs() -> u32 {
    u32::try_from(chrono::Utc::now().timestamp()).unwrap_or(u32::MAX)
}
