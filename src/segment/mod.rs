//! Segments hold the store's data at its three stages.
//!
//! ```text
//!  writes ──► MutableSegment ──freeze──► ReadOnlySegment ──merge──► DiskSegment
//!             (B+tree + WAL)             (same tree, WAL sealed)    (compressed blocks)
//! ```
//!
//! In memory a value is `Option<Vec<u8>>`, `None` being a tombstone. In the
//! write-ahead log the value is prefixed with a one-byte tag so deletes
//! survive replay. Disk segments never contain tombstones: a merge folds every
//! older source, so a deleted key can simply be left out.

pub mod block;
pub mod disk;
pub mod mutable;
pub mod read_only;

pub use disk::{DiskSegment, DiskSegmentIter, DiskSegmentWriter};
pub use mutable::MutableSegment;
pub use read_only::ReadOnlySegment;

use crate::btree::{BTree, Cursor};
use crate::error::{Error, Result};

pub type Tree = BTree<Vec<u8>, Option<Vec<u8>>>;

/// A key with its value or tombstone.
pub type Entry = (Vec<u8>, Option<Vec<u8>>);

const TAG_TOMBSTONE: u8 = 0;
const TAG_VALUE: u8 = 1;

pub fn encode_value(value: Option<&[u8]>) -> Vec<u8> {
    match value {
        Some(v) => {
            let mut buf = Vec::with_capacity(v.len() + 1);
            buf.push(TAG_VALUE);
            buf.extend_from_slice(v);
            buf
        }
        None => vec![TAG_TOMBSTONE],
    }
}

pub fn decode_value(bytes: &[u8]) -> Result<Option<Vec<u8>>> {
    match bytes.split_first() {
        Some((&TAG_VALUE, value)) => Ok(Some(value.to_vec())),
        Some((&TAG_TOMBSTONE, [])) => Ok(None),
        Some((tag, _)) => Err(Error::InvalidState(format!("unknown value tag {}", tag))),
        None => Err(Error::InvalidState("empty logged value".into())),
    }
}

/// In-memory entries from `start` onward, as fallible items for merging.
pub(crate) fn tree_entries(
    mut cursor: Cursor<Vec<u8>, Option<Vec<u8>>>,
    start: Option<&Vec<u8>>,
) -> impl Iterator<Item = Result<Entry>> + Send {
    if let Some(start) = start {
        cursor.seek(start);
    }
    cursor.map(Ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_tags() {
        assert_eq!(decode_value(&encode_value(Some(&b"abc"[..]))).unwrap(), Some(b"abc".to_vec()));
        assert_eq!(decode_value(&encode_value(Some(&b""[..]))).unwrap(), Some(Vec::new()));
        assert_eq!(decode_value(&encode_value(None)).unwrap(), None);
        assert!(decode_value(&[]).is_err());
        assert!(decode_value(&[7, 1]).is_err());
        assert!(decode_value(&[TAG_TOMBSTONE, 1]).is_err());
    }
}
