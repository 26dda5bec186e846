//! Lazy stream plumbing shared by the row merge and the merge-report source.
//!
//! - [`tee`] fans one lazily-produced stream out to several consumers,
//!   buffering only the items some live consumer has not yet read.
//! - [`KMerge`] performs the sorted k-way merge over keyed streams with a
//!   deterministic tie-break on stream index.

use std::cell::RefCell;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::rc::Rc;

use crate::error::ReportResult;
use crate::row::Key;

/// A boxed, fallible stream of keyed items.
pub type KeyedStream<'a, T> = Box<dyn Iterator<Item = ReportResult<(Key, T)>> + 'a>;

// ============================================================================
// Tee
// ============================================================================

struct TeeShared<I: Iterator> {
    source: I,
    buffer: VecDeque<I::Item>,
    /// Absolute position of `buffer[0]`.
    base: usize,
    /// Next absolute position per consumer; `None` once dropped.
    cursors: Vec<Option<usize>>,
}

impl<I: Iterator> TeeShared<I> {
    fn trim(&mut self) {
        let low = self.cursors.iter().flatten().copied().min();
        let Some(low) = low else {
            self.base += self.buffer.len();
            self.buffer.clear();
            return;
        };
        while self.base < low && self.buffer.pop_front().is_some() {
            self.base += 1;
        }
    }
}

/// One consumer of a [`tee`]d stream.
pub struct Tee<I: Iterator> {
    shared: Rc<RefCell<TeeShared<I>>>,
    id: usize,
}

/// Splits `source` into `n` independent lazy consumers.
pub fn tee<I>(source: I, n: usize) -> Vec<Tee<I>>
where
    I: Iterator,
    I::Item: Clone,
{
    let shared = Rc::new(RefCell::new(TeeShared {
        source,
        buffer: VecDeque::new(),
        base: 0,
        cursors: vec![Some(0); n],
    }));
    (0..n)
        .map(|id| Tee {
            shared: Rc::clone(&shared),
            id,
        })
        .collect()
}

impl<I> Iterator for Tee<I>
where
    I: Iterator,
    I::Item: Clone,
{
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        let mut shared = self.shared.borrow_mut();
        let pos = shared.cursors[self.id]?;
        let offset = pos - shared.base;
        let item = if offset < shared.buffer.len() {
            shared.buffer[offset].clone()
        } else {
            let item = shared.source.next()?;
            shared.buffer.push_back(item.clone());
            item
        };
        shared.cursors[self.id] = Some(pos + 1);
        shared.trim();
        Some(item)
    }
}

impl<I: Iterator> Drop for Tee<I> {
    fn drop(&mut self) {
        if let Ok(mut shared) = self.shared.try_borrow_mut() {
            shared.cursors[self.id] = None;
            shared.trim();
        }
    }
}

// ============================================================================
// K-way merge
// ============================================================================

struct HeapEntry<T> {
    key: Key,
    stream: usize,
    item: T,
}

impl<T> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.stream == other.stream
    }
}

impl<T> Eq for HeapEntry<T> {}

impl<T> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Ties on key break by stream index, so lower-indexed streams are merged first.
impl<T> Ord for HeapEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.stream.cmp(&other.stream))
    }
}

/// Sorted k-way merge over keyed streams.
///
/// Yields `(key, stream_index, item)` in non-decreasing key order. Items that
/// share a key come out in ascending stream index, which is what makes
/// "later stream wins" overwrites deterministic. Every input must itself be
/// sorted by key; the merge does not re-verify this. The first error from
/// any stream ends the merge.
pub struct KMerge<'a, T> {
    streams: Vec<KeyedStream<'a, T>>,
    heap: BinaryHeap<Reverse<HeapEntry<T>>>,
    primed: bool,
    done: bool,
}

impl<'a, T> KMerge<'a, T> {
    pub fn new(streams: Vec<KeyedStream<'a, T>>) -> Self {
        let capacity = streams.len();
        Self {
            streams,
            heap: BinaryHeap::with_capacity(capacity),
            primed: false,
            done: false,
        }
    }

    fn pull(&mut self, stream: usize) -> ReportResult<()> {
        if let Some(next) = self.streams[stream].next() {
            let (key, item) = next?;
            self.heap.push(Reverse(HeapEntry { key, stream, item }));
        }
        Ok(())
    }

    fn step(&mut self) -> ReportResult<Option<(Key, usize, T)>> {
        if !self.primed {
            self.primed = true;
            for stream in 0..self.streams.len() {
                self.pull(stream)?;
            }
        }
        let Some(Reverse(entry)) = self.heap.pop() else {
            return Ok(None);
        };
        self.pull(entry.stream)?;
        Ok(Some((entry.key, entry.stream, entry.item)))
    }
}

impl<T> Iterator for KMerge<'_, T> {
    type Item = ReportResult<(Key, usize, T)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReportError;

    fn keyed(items: Vec<(i64, &'static str)>) -> KeyedStream<'static, &'static str> {
        Box::new(items.into_iter().map(|(k, v)| Ok((Key::single(k), v))))
    }

    #[test]
    fn test_tee_consumers_see_every_item() {
        let mut tees = tee(1..=3, 2);
        let second = tees.pop().unwrap();
        let first = tees.pop().unwrap();
        assert_eq!(first.collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(second.collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_tee_dropped_consumer_releases_buffer() {
        let mut tees = tee(0..100, 2);
        let mut reader = tees.pop().unwrap();
        drop(tees);
        for _ in 0..50 {
            reader.next();
        }
        assert_eq!(reader.shared.borrow().buffer.len(), 0);
    }

    #[test]
    fn test_tee_interleaved_reads() {
        let mut tees = tee(vec!['a', 'b', 'c'].into_iter(), 2);
        let mut b = tees.pop().unwrap();
        let mut a = tees.pop().unwrap();
        assert_eq!(a.next(), Some('a'));
        assert_eq!(a.next(), Some('b'));
        assert_eq!(b.next(), Some('a'));
        assert_eq!(a.next(), Some('c'));
        assert_eq!(a.next(), None);
        assert_eq!(b.next(), Some('b'));
        assert_eq!(b.next(), Some('c'));
        assert_eq!(b.next(), None);
    }

    #[test]
    fn test_kmerge_orders_by_key_then_stream() {
        let merged: Vec<_> = KMerge::new(vec![
            keyed(vec![(1, "a1"), (3, "a3")]),
            keyed(vec![(1, "b1"), (2, "b2")]),
            keyed(vec![]),
        ])
        .map(Result::unwrap)
        .map(|(k, s, v)| (k, s, v))
        .collect();

        let labels: Vec<_> = merged.iter().map(|(_, s, v)| (*s, *v)).collect();
        assert_eq!(labels, vec![(0, "a1"), (1, "b1"), (1, "b2"), (0, "a3")]);
        assert_eq!(merged[3].0, Key::single(3));
    }

    #[test]
    fn test_kmerge_stops_at_first_error() {
        let failing: KeyedStream<'static, &'static str> = Box::new(
            vec![
                Ok((Key::single(2), "x")),
                Err(ReportError::MissingInput("start".into())),
            ]
            .into_iter(),
        );
        let mut merge = KMerge::new(vec![keyed(vec![(1, "a")]), failing]);
        assert!(merge.next().unwrap().is_ok());
        assert!(matches!(
            merge.next(),
            Some(Err(ReportError::MissingInput(_)))
        ));
        assert!(merge.next().is_none());
    }
}
