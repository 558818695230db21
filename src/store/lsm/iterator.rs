use crate::error::{Error, Result};
use crate::segment::Entry;
use std::{cmp::Ordering, collections::BinaryHeap};

/// A source of entries for a merge, tombstones included.
pub type EntryIterator<'a> = Box<dyn Iterator<Item = Result<Entry>> + Send + 'a>;

pub struct HeapEntry<'a> {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub source: usize,
    pub iterator: EntryIterator<'a>,
}

impl std::fmt::Debug for HeapEntry<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapEntry")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("source", &self.source)
            .finish()
    }
}

impl PartialEq for HeapEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapEntry<'_> {}

impl PartialOrd for HeapEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry<'_> {
    // BinaryHeap is a max-heap: the smallest key, then the lowest source,
    // must compare greatest.
    fn cmp(&self, other: &Self) -> Ordering {
        match self.key.cmp(&other.key) {
            Ordering::Equal => other.source.cmp(&self.source),
            other => other.reverse(),
        }
    }
}

/// K-way merge of sorted sources.
///
/// Sources are given newest first. When several sources hold the same key
/// only the entry from the newest one is yielded, tombstone or not. The
/// first error of any source ends the merge.
#[derive(Debug)]
pub struct MergeIterator<'a> {
    heap: BinaryHeap<HeapEntry<'a>>,
    latest_key: Option<Vec<u8>>,
    error: Option<Error>,
}

impl<'a> MergeIterator<'a> {
    pub fn new(iterators: Vec<EntryIterator<'a>>) -> Self {
        let mut merge = Self {
            heap: BinaryHeap::new(),
            latest_key: None,
            error: None,
        };
        for (source, iterator) in iterators.into_iter().enumerate() {
            merge.advance(source, iterator);
        }
        merge
    }

    fn advance(&mut self, source: usize, mut iterator: EntryIterator<'a>) {
        match iterator.next() {
            Some(Ok((key, value))) => self.heap.push(HeapEntry {
                key,
                value,
                source,
                iterator,
            }),
            Some(Err(e)) => {
                self.error.get_or_insert(e);
            }
            None => {}
        }
    }
}

impl Iterator for MergeIterator<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(e) = self.error.take() {
                self.heap.clear();
                return Some(Err(e));
            }
            let entry = self.heap.pop()?;
            let HeapEntry {
                key,
                value,
                source,
                iterator,
            } = entry;
            self.advance(source, iterator);

            if self.latest_key.as_ref() == Some(&key) {
                continue;
            }
            self.latest_key = Some(key.clone());
            return Some(Ok((key, value)));
        }
    }
}

/// Drops tombstones from a merged stream.
pub fn live_entries<'a>(
    entries: impl Iterator<Item = Result<Entry>> + Send + 'a,
) -> impl Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + Send + 'a {
    entries.filter_map(|entry| match entry {
        Ok((key, Some(value))) => Some(Ok((key, value))),
        Ok((_, None)) => None,
        Err(e) => Some(Err(e)),
    })
}
