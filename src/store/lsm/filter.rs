//! Key-range filtering for merged scans.

use crate::error::Result;
use std::ops::{Bound, RangeBounds};

/// Passes through the items of a sorted source whose key lies in `range`.
///
/// Keys before the start are skipped. The first key past the end stops the
/// filter for good, so a source is never read further than the range needs.
/// Errors are passed through. The value type is left open so the filter
/// works on tombstone-carrying entries as well as on live values.
pub struct RangeFilter<I, R, V>
where
    I: Iterator<Item = Result<(Vec<u8>, V)>>,
    R: RangeBounds<Vec<u8>>,
{
    inner: I,
    range: R,
    done: bool,
}

impl<I, R, V> RangeFilter<I, R, V>
where
    I: Iterator<Item = Result<(Vec<u8>, V)>>,
    R: RangeBounds<Vec<u8>>,
{
    pub fn new(inner: I, range: R) -> Self {
        Self {
            inner,
            range,
            done: false,
        }
    }

    fn before_start(&self, key: &[u8]) -> bool {
        match self.range.start_bound() {
            Bound::Included(start) => key < start.as_slice(),
            Bound::Excluded(start) => key <= start.as_slice(),
            Bound::Unbounded => false,
        }
    }

    fn past_end(&self, key: &[u8]) -> bool {
        match self.range.end_bound() {
            Bound::Included(end) => key > end.as_slice(),
            Bound::Excluded(end) => key >= end.as_slice(),
            Bound::Unbounded => false,
        }
    }
}

impl<I, R, V> Iterator for RangeFilter<I, R, V>
where
    I: Iterator<Item = Result<(Vec<u8>, V)>>,
    R: RangeBounds<Vec<u8>>,
{
    type Item = Result<(Vec<u8>, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let (key, value) = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };
            if self.past_end(&key) {
                self.done = true;
            } else if !self.before_start(&key) {
                return Some(Ok((key, value)));
            }
        }
        None
    }
}
