//! The key-value interface and its LSM implementation.

pub mod lsm;

use crate::error::Result;
use std::ops::{Bound, RangeBounds};

/// An ordered byte-string map.
pub trait Store: Send + Sync {
    /// Iterator over live `(key, value)` pairs in ascending key order.
    type ScanIterator<'a>: ScanIterator + 'a
    where
        Self: Sized + 'a;

    fn set(&self, key: &[u8], value: Vec<u8>) -> Result<()>;

    /// Removes a key. Deleting a missing key is not an error.
    fn delete(&self, key: &[u8]) -> Result<()>;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn scan<'a>(
        &'a self,
        range: impl RangeBounds<Vec<u8>> + Clone + Send + Sync + 'a,
    ) -> Self::ScanIterator<'a>
    where
        Self: Sized;

    /// Every pair whose key starts with `prefix`.
    fn scan_prefix<'a>(&'a self, prefix: &'a [u8]) -> Self::ScanIterator<'a>
    where
        Self: Sized,
    {
        self.scan(prefix_range(prefix))
    }

    /// Flushes the active write-ahead log. With the compressed strategies a
    /// write is not guaranteed to survive a crash until this returns.
    fn sync(&self) -> Result<()>;
}

pub trait ScanIterator: Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> {}

impl<I> ScanIterator for I where I: Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> {}

/// The key range holding exactly the keys that start with `prefix`.
///
/// The upper bound is the prefix with its last non-`0xff` byte incremented
/// and the rest dropped; a prefix of only `0xff` bytes has no upper bound.
pub fn prefix_range(prefix: &[u8]) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let end = match prefix.iter().rposition(|b| *b != 0xff) {
        Some(i) => {
            let mut end = prefix[..=i].to_vec();
            end[i] += 1;
            Bound::Excluded(end)
        }
        None => Bound::Unbounded,
    };
    (Bound::Included(prefix.to_vec()), end)
}
