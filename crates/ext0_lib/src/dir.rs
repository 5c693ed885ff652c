//! Directory block codec.
//!
//! A directory is a sequence of blocks, each packed with variable-length records:
//!
//! ```text
//! | inode u32 | rec_len u16 | name_len u8 | file_type u8 | name ... | padding |
//! ```
//!
//! `rec_len` is the full span of the record and a multiple of 4. A record whose `inode` is 0 is
//! a tombstone left by a delete; a `rec_len` of 0 is unused space that scans step over 4 bytes
//! at a time. Records are appended, never moved and never merged.
//!
//! Everything here works on one block in memory. Reading and writing blocks, and growing the
//! directory, is the job of [`crate::node::DirNode`].

use crate::error::{Ext0Error, Result};
use crate::types::{ALIGNMENT, FileKind, MAX_NAME_LEN, align_to};

pub const DIR_ENTRY_HEADER_LEN: usize = 8;

/// Bytes a record for a name of `name_len` bytes occupies.
pub const fn required_rec_len(name_len: usize) -> usize {
    align_to(DIR_ENTRY_HEADER_LEN + name_len)
}

/// Rejects names that can never be stored. Runs before any scan or allocation.
pub fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || name.contains(&b'/') || name.contains(&0) {
        return Err(Ext0Error::InvalidName);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Ext0Error::NameTooLong(name.len()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: u32,
    pub file_type: u8,
    pub name: Vec<u8>,
}

impl DirEntry {
    pub fn kind(&self) -> FileKind {
        FileKind::from_dir_entry_type(self.file_type)
    }

    pub fn is_tombstone(&self) -> bool {
        self.inode == 0
    }

    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// A record and where it sits in its block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: usize,
    pub rec_len: usize,
    pub entry: DirEntry,
}

fn read_u16_le(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn read_u32_le(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Walks the records of one block, tombstones included, skipping unused space.
pub struct Records<'a> {
    block: &'a [u8],
    block_no: u64,
    offset: usize,
}

impl<'a> Records<'a> {
    /// `block_no` only labels corruption errors.
    pub fn new(block: &'a [u8], block_no: u64) -> Self {
        Self {
            block,
            block_no,
            offset: 0,
        }
    }

    fn parse(&self, off: usize, rec_len: usize) -> Result<Record> {
        let name_len = usize::from(self.block[off + 6]);
        if rec_len % ALIGNMENT != 0
            || rec_len < DIR_ENTRY_HEADER_LEN
            || off + rec_len > self.block.len()
            || required_rec_len(name_len) > rec_len
        {
            return Err(Ext0Error::corruption(
                self.block_no,
                format!("directory record at offset {off}: rec_len {rec_len}, name_len {name_len}"),
            ));
        }
        let name_start = off + DIR_ENTRY_HEADER_LEN;
        Ok(Record {
            offset: off,
            rec_len,
            entry: DirEntry {
                inode: read_u32_le(self.block, off),
                file_type: self.block[off + 7],
                name: self.block[name_start..name_start + name_len].to_vec(),
            },
        })
    }
}

impl Iterator for Records<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.offset + DIR_ENTRY_HEADER_LEN <= self.block.len() {
            let off = self.offset;
            let rec_len = usize::from(read_u16_le(self.block, off + 4));
            if rec_len == 0 {
                self.offset += ALIGNMENT;
                continue;
            }
            return Some(match self.parse(off, rec_len) {
                Ok(record) => {
                    self.offset += rec_len;
                    Ok(record)
                }
                Err(err) => {
                    // nothing after a broken record can be trusted
                    self.offset = self.block.len();
                    Err(err)
                }
            });
        }
        None
    }
}

/// Where a new record of a given size can go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub offset: usize,
    pub rec_len: usize,
}

/// First place in the block a record of `need` bytes fits: a tombstone at least that large
/// (reused whole, slack included) or a stretch of never-written space (sized to `need`).
pub fn find_slot(block: &[u8], block_no: u64, need: usize) -> Result<Option<Slot>> {
    let mut off = 0;
    while off + DIR_ENTRY_HEADER_LEN <= block.len() {
        let rec_len = usize::from(read_u16_le(block, off + 4));
        if rec_len == 0 {
            if block.len() - off >= need && block[off..off + need].iter().all(|b| *b == 0) {
                return Ok(Some(Slot {
                    offset: off,
                    rec_len: need,
                }));
            }
            off += ALIGNMENT;
            continue;
        }
        let record = Records::new(block, block_no).parse(off, rec_len)?;
        if record.entry.is_tombstone() && rec_len >= need {
            return Ok(Some(Slot {
                offset: off,
                rec_len,
            }));
        }
        off += rec_len;
    }
    Ok(None)
}

/// Writes a record into `slot`. Bytes of the slot past the name are zeroed.
pub fn write_record(block: &mut [u8], slot: Slot, inode: u32, file_type: u8, name: &[u8]) -> Result<()> {
    validate_name(name)?;
    if required_rec_len(name.len()) > slot.rec_len || slot.offset + slot.rec_len > block.len() {
        return Err(Ext0Error::NoSpace("directory record does not fit its slot"));
    }
    let rec_len = u16::try_from(slot.rec_len)
        .map_err(|_| Ext0Error::InvalidGeometry(format!("rec_len {}", slot.rec_len)))?;
    let off = slot.offset;
    block[off..off + 4].copy_from_slice(&inode.to_le_bytes());
    block[off + 4..off + 6].copy_from_slice(&rec_len.to_le_bytes());
    block[off + 6] = name.len() as u8;
    block[off + 7] = file_type;
    let name_start = off + DIR_ENTRY_HEADER_LEN;
    block[name_start..name_start + name.len()].copy_from_slice(name);
    block[name_start + name.len()..off + slot.rec_len].fill(0);
    Ok(())
}

/// Turns the record at `offset` into a tombstone. Its span stays as it is.
pub fn clear_record(block: &mut [u8], offset: usize) {
    block[offset..offset + 4].fill(0);
}

/// First live record named exactly `name`.
pub fn lookup(block: &[u8], block_no: u64, name: &[u8]) -> Result<Option<Record>> {
    for record in Records::new(block, block_no) {
        let record = record?;
        if !record.entry.is_tombstone() && record.entry.name == name {
            return Ok(Some(record));
        }
    }
    Ok(None)
}

/// A directory's first block: `.` pointing at itself and `..` at its parent.
/// Returns the bytes used.
pub fn init_block(block: &mut [u8], self_ino: u32, parent_ino: u32) -> usize {
    let dot = required_rec_len(1);
    let dotdot = required_rec_len(2);
    block.fill(0);
    write_entry_unchecked(block, 0, dot, self_ino, b".");
    write_entry_unchecked(block, dot, dotdot, parent_ino, b"..");
    dot + dotdot
}

fn write_entry_unchecked(block: &mut [u8], off: usize, rec_len: usize, inode: u32, name: &[u8]) {
    block[off..off + 4].copy_from_slice(&inode.to_le_bytes());
    block[off + 4..off + 6].copy_from_slice(&(rec_len as u16).to_le_bytes());
    block[off + 6] = name.len() as u8;
    block[off + 7] = FileKind::Directory.dir_entry_type();
    block[off + DIR_ENTRY_HEADER_LEN..off + DIR_ENTRY_HEADER_LEN + name.len()].copy_from_slice(name);
}

/// Points the `..` record of a directory's first block at `parent_ino`.
pub fn set_parent(block: &mut [u8], block_no: u64, parent_ino: u32) -> Result<()> {
    let record = lookup(block, block_no, b"..")?
        .ok_or_else(|| Ext0Error::corruption(block_no, "directory has no '..' entry"))?;
    block[record.offset..record.offset + 4].copy_from_slice(&parent_ino.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DT_DIR, DT_REG};

    fn live(block: &[u8]) -> Vec<(u32, String)> {
        Records::new(block, 0)
            .map(|r| r.unwrap())
            .filter(|r| !r.entry.is_tombstone())
            .map(|r| (r.entry.inode, r.entry.name_lossy()))
            .collect()
    }

    fn append(block: &mut [u8], inode: u32, name: &str) -> Slot {
        let slot = find_slot(block, 0, required_rec_len(name.len()))
            .unwrap()
            .expect("room for the entry");
        write_record(block, slot, inode, DT_REG, name.as_bytes()).unwrap();
        slot
    }

    #[test]
    fn test_rec_len_is_aligned() {
        assert_eq!(required_rec_len(1), 12);
        assert_eq!(required_rec_len(4), 12);
        assert_eq!(required_rec_len(5), 16);
        assert_eq!(required_rec_len(MAX_NAME_LEN), 136);
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name(b"hello.txt").is_ok());
        assert!(validate_name(&[b'a'; MAX_NAME_LEN]).is_ok());
        assert!(matches!(validate_name(b""), Err(Ext0Error::InvalidName)));
        assert!(matches!(validate_name(b"a/b"), Err(Ext0Error::InvalidName)));
        assert!(matches!(
            validate_name(&[b'a'; MAX_NAME_LEN + 1]),
            Err(Ext0Error::NameTooLong(129))
        ));
    }

    #[test]
    fn test_init_block_has_dot_entries() {
        let mut block = vec![0xAAu8; 1024];
        assert_eq!(init_block(&mut block, 7, 1), 24);
        assert_eq!(live(&block), vec![(7, ".".to_string()), (1, "..".to_string())]);
        let first = Records::new(&block, 0).next().unwrap().unwrap();
        assert_eq!(first.entry.file_type, DT_DIR);
        assert!(block[24..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_append_then_lookup() {
        let mut block = vec![0u8; 1024];
        init_block(&mut block, 1, 1);
        let slot = append(&mut block, 5, "notes");
        assert_eq!(slot, Slot { offset: 24, rec_len: 16 });

        let found = lookup(&block, 0, b"notes").unwrap().unwrap();
        assert_eq!(found.entry.inode, 5);
        assert_eq!(found.offset, 24);
        assert!(lookup(&block, 0, b"note").unwrap().is_none());
        assert!(lookup(&block, 0, b"notes2").unwrap().is_none());
    }

    #[test]
    fn test_delete_leaves_tombstone() {
        let mut block = vec![0u8; 1024];
        init_block(&mut block, 1, 1);
        append(&mut block, 5, "a");
        append(&mut block, 6, "b");
        let a = lookup(&block, 0, b"a").unwrap().unwrap();
        clear_record(&mut block, a.offset);

        assert!(lookup(&block, 0, b"a").unwrap().is_none());
        // "b" is still reachable behind the tombstone
        assert_eq!(lookup(&block, 0, b"b").unwrap().unwrap().entry.inode, 6);
        assert!(live(&block).iter().all(|(ino, _)| *ino != 0));
    }

    #[test]
    fn test_tombstone_reused_with_its_rec_len() {
        let mut block = vec![0u8; 1024];
        append(&mut block, 5, "a_long_name_here");
        append(&mut block, 6, "b");
        let old = lookup(&block, 0, b"a_long_name_here").unwrap().unwrap();
        clear_record(&mut block, old.offset);

        let slot = append(&mut block, 9, "c");
        assert_eq!(slot, Slot { offset: 0, rec_len: old.rec_len });
        // slack is absorbed, the next record is untouched
        assert_eq!(
            live(&block),
            vec![(9, "c".to_string()), (6, "b".to_string())]
        );
    }

    #[test]
    fn test_tombstone_too_small_is_skipped() {
        let mut block = vec![0u8; 1024];
        append(&mut block, 5, "a");
        append(&mut block, 6, "b");
        clear_record(&mut block, 0);
        let slot = append(&mut block, 7, "longer_name");
        assert_eq!(slot.offset, 24);
    }

    #[test]
    fn test_full_block_has_no_slot() {
        let mut block = vec![0u8; 48];
        append(&mut block, 1, "a");
        append(&mut block, 2, "b");
        append(&mut block, 3, "c");
        append(&mut block, 4, "d");
        assert_eq!(find_slot(&block, 0, required_rec_len(1)).unwrap(), None);
    }

    #[test]
    fn test_unused_tail_is_skipped() {
        let mut block = vec![0u8; 64];
        append(&mut block, 3, "x");
        assert_eq!(live(&block), vec![(3, "x".to_string())]);
        assert!(lookup(&block, 0, b"y").unwrap().is_none());
        // 52 bytes left behind the record
        assert_eq!(find_slot(&block, 0, 52).unwrap(), Some(Slot { offset: 12, rec_len: 52 }));
        assert_eq!(find_slot(&block, 0, 56).unwrap(), None);
        assert_eq!(Records::new(&[0u8; 1024], 0).count(), 0);
    }

    #[test]
    fn test_bad_rec_len_is_corruption() {
        let mut block = vec![0u8; 1024];
        append(&mut block, 5, "abc");
        block[4..6].copy_from_slice(&6u16.to_le_bytes());
        assert!(matches!(
            lookup(&block, 17, b"abc"),
            Err(Ext0Error::Corruption { block: 17, .. })
        ));

        block[4..6].copy_from_slice(&2000u16.to_le_bytes());
        assert!(matches!(
            find_slot(&block, 17, 12),
            Err(Ext0Error::Corruption { block: 17, .. })
        ));
    }

    #[test]
    fn test_set_parent() {
        let mut block = vec![0u8; 1024];
        init_block(&mut block, 4, 1);
        set_parent(&mut block, 0, 9).unwrap();
        assert_eq!(lookup(&block, 0, b"..").unwrap().unwrap().entry.inode, 9);
    }
}
