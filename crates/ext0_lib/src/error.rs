//! Errors surfaced by the ext0 core.
//!
//! Capacity (`NoSpace`) and lookup misses (`NotFound`, `NotMapped`) are
//! ordinary outcomes for the caller to handle. I/O and validation failures abort the current
//! operation and are passed up unchanged; nothing here retries or substitutes defaults.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Ext0Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad magic number {found:#06x}, not an ext0 volume")]
    BadMagic { found: u16 },

    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("no space left: {0}")]
    NoSpace(&'static str),

    #[error("logical block {0} is not mapped")]
    NotMapped(u64),

    #[error("entry not found")]
    NotFound,

    #[error("name is {0} bytes long (limit {})", crate::types::MAX_NAME_LEN)]
    NameTooLong(usize),

    #[error("invalid name")]
    InvalidName,

    #[error("entry already exists")]
    Exists,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

pub type Result<T> = std::result::Result<T, Ext0Error>;

impl Ext0Error {
    pub fn corruption(block: u64, detail: impl Into<String>) -> Self {
        Ext0Error::Corruption {
            block,
            detail: detail.into(),
        }
    }

    /// Points a corruption found while decoding at the block it was read from. Other errors
    /// pass through.
    pub fn at_block(self, block: u64) -> Self {
        match self {
            Ext0Error::Corruption { detail, .. } => Ext0Error::Corruption { block, detail },
            other => other,
        }
    }

    /// errno handed back to the switch layer. No wildcard arm, so a new variant does not
    /// compile until it gets one.
    pub fn to_errno(&self) -> i32 {
        match self {
            Ext0Error::Io(_) => libc::EIO,
            Ext0Error::BadMagic { .. } => libc::EINVAL,
            Ext0Error::Corruption { .. } => libc::EIO,
            Ext0Error::InvalidGeometry(_) => libc::EINVAL,
            Ext0Error::NoSpace(_) => libc::ENOSPC,
            Ext0Error::NotMapped(_) => libc::EIO,
            Ext0Error::NotFound => libc::ENOENT,
            Ext0Error::NameTooLong(_) => libc::ENAMETOOLONG,
            Ext0Error::InvalidName => libc::EINVAL,
            Ext0Error::Exists => libc::EEXIST,
            Ext0Error::NotDirectory => libc::ENOTDIR,
            Ext0Error::IsDirectory => libc::EISDIR,
            Ext0Error::NotEmpty => libc::ENOTEMPTY,
            Ext0Error::InvalidArgument(_) => libc::EINVAL,
        }
    }

    /// Capacity errors and misses are expected; everything else means the operation broke.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Ext0Error::NoSpace(_)
                | Ext0Error::NotFound
                | Ext0Error::NotMapped(_)
                | Ext0Error::Exists
        )
    }
}

impl From<bincode::Error> for Ext0Error {
    fn from(err: bincode::Error) -> Self {
        match *err {
            bincode::ErrorKind::Io(io) => Ext0Error::Io(io),
            other => Ext0Error::corruption(0, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Ext0Error::NotFound.to_errno(), libc::ENOENT);
        assert_eq!(Ext0Error::NoSpace("inode bitmap").to_errno(), libc::ENOSPC);
        assert_eq!(Ext0Error::NameTooLong(200).to_errno(), libc::ENAMETOOLONG);
        assert_eq!(Ext0Error::corruption(3, "x").to_errno(), libc::EIO);
    }

    #[test]
    fn test_decode_failure_is_relabelled_with_its_block() {
        let err: Ext0Error = bincode::deserialize::<u32>(&[1u8]).unwrap_err().into();
        assert!(matches!(err, Ext0Error::Corruption { block: 0, .. }));
        assert!(matches!(err.at_block(17), Ext0Error::Corruption { block: 17, .. }));
        assert!(matches!(Ext0Error::NotFound.at_block(17), Ext0Error::NotFound));
    }

    #[test]
    fn test_expected_outcomes() {
        assert!(Ext0Error::NotFound.is_expected());
        assert!(Ext0Error::NoSpace("directory").is_expected());
        assert!(!Ext0Error::BadMagic { found: 0 }.is_expected());
        assert!(!Ext0Error::Io(std::io::Error::other("boom")).is_expected());
    }
}
