//! Lazy k-way merge of duration-sorted sample sources.
//!
//! Each source is already ordered ascending by its `duration_key`; the
//! merge repeatedly takes the smallest (largest, in reverse mode) head key
//! across all sources, so a combined multi-million-sample corpus streams
//! in global duration order without ever being materialized or re-sorted.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::error::{Result, SdbError};
use crate::samples::{LabeledSample, SampleSource, SourceIter};

/// Several duration-sorted sources, viewed as one globally ordered
/// collection. The total length is known up front without iterating.
pub struct Interleaved {
    sources: Vec<Arc<dyn SampleSource>>,
    reverse: bool,
    len: usize,
}

impl Interleaved {
    pub fn new(sources: Vec<Arc<dyn SampleSource>>, reverse: bool) -> Self {
        let len = sources.iter().map(|s| s.len()).sum();
        Self {
            sources,
            reverse,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Start a fresh merged pass over all sources. The iterator owns
    /// shared handles, so it is `Send + 'static` and restartable.
    pub fn iter(&self) -> InterleavedIter {
        if self.sources.len() == 1 {
            // Single source: its own order is already the global order.
            return InterleavedIter {
                sources: self.sources.clone(),
                heap: BinaryHeap::new(),
                reverse: self.reverse,
                single: Some(SourceIter::new(Arc::clone(&self.sources[0]))),
                pending_error: None,
            };
        }
        let mut iter = InterleavedIter {
            sources: self.sources.clone(),
            heap: BinaryHeap::with_capacity(self.sources.len()),
            reverse: self.reverse,
            single: None,
            pending_error: None,
        };
        for source_index in 0..iter.sources.len() {
            iter.push_head(source_index, 0);
        }
        iter
    }
}

struct Head {
    key: f64,
    source: usize,
    index: usize,
    reverse: bool,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops its maximum; ascending mode inverts the key
        // ordering so the smallest head wins. Source index breaks ties
        // deterministically.
        let ord = self
            .key
            .total_cmp(&other.key)
            .then_with(|| self.source.cmp(&other.source));
        if self.reverse {
            ord
        } else {
            ord.reverse()
        }
    }
}

/// Iterator over the merged sequence. Yields per-sample errors in place;
/// a source whose duration probe fails stops contributing after its error
/// is surfaced.
pub struct InterleavedIter {
    sources: Vec<Arc<dyn SampleSource>>,
    heap: BinaryHeap<Head>,
    reverse: bool,
    single: Option<SourceIter>,
    pending_error: Option<SdbError>,
}

impl InterleavedIter {
    fn push_head(&mut self, source: usize, index: usize) {
        if index >= self.sources[source].len() {
            return;
        }
        match self.sources[source].duration_key(index) {
            Ok(key) => self.heap.push(Head {
                key,
                source,
                index,
                reverse: self.reverse,
            }),
            Err(e) => self.pending_error = Some(e),
        }
    }
}

impl Iterator for InterleavedIter {
    type Item = Result<LabeledSample>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending_error.take() {
            return Some(Err(e));
        }
        if let Some(single) = &mut self.single {
            return single.next();
        }
        let head = self.heap.pop()?;
        let item = self.sources[head.source].get(head.index);
        self.push_head(head.source, head.index + 1);
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioBuffer, AudioFormat};

    /// In-memory source whose samples are silence of the keyed duration.
    struct MemSource {
        name: &'static str,
        keys: Vec<f64>,
    }

    impl SampleSource for MemSource {
        fn len(&self) -> usize {
            self.keys.len()
        }

        fn duration_key(&self, index: usize) -> Result<f64> {
            Ok(self.keys[index])
        }

        fn get(&self, index: usize) -> Result<LabeledSample> {
            let format = AudioFormat::default();
            let n = (self.keys[index] * format.rate as f64) as usize;
            Ok(LabeledSample::new(
                format!("{}:{}", self.name, index),
                AudioBuffer::from_samples(vec![0.0; n], format),
                Some(format!("{}", self.keys[index])),
            ))
        }
    }

    fn durations(iter: InterleavedIter) -> Vec<f64> {
        iter.map(|s| s.unwrap().audio.duration()).collect()
    }

    #[test]
    fn merges_in_ascending_duration_order() {
        let merged = Interleaved::new(
            vec![
                Arc::new(MemSource {
                    name: "odd",
                    keys: vec![1.0, 3.0, 5.0],
                }),
                Arc::new(MemSource {
                    name: "even",
                    keys: vec![2.0, 4.0, 6.0],
                }),
            ],
            false,
        );
        assert_eq!(merged.len(), 6);
        assert_eq!(durations(merged.iter()), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn reverse_merges_in_descending_order() {
        let merged = Interleaved::new(
            vec![
                Arc::new(MemSource {
                    name: "odd",
                    keys: vec![5.0, 3.0, 1.0],
                }),
                Arc::new(MemSource {
                    name: "even",
                    keys: vec![6.0, 4.0, 2.0],
                }),
            ],
            true,
        );
        assert_eq!(durations(merged.iter()), vec![6.0, 5.0, 4.0, 3.0, 2.0, 1.0]);
    }

    #[test]
    fn single_source_passes_through_unchanged() {
        let merged = Interleaved::new(
            vec![Arc::new(MemSource {
                name: "only",
                keys: vec![2.0, 1.0, 3.0],
            })],
            false,
        );
        // Order is the source's own, whatever it is; no re-sorting happens.
        assert_eq!(durations(merged.iter()), vec![2.0, 1.0, 3.0]);
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn iteration_is_restartable() {
        let merged = Interleaved::new(
            vec![
                Arc::new(MemSource {
                    name: "a",
                    keys: vec![1.0],
                }),
                Arc::new(MemSource {
                    name: "b",
                    keys: vec![2.0],
                }),
            ],
            false,
        );
        assert_eq!(durations(merged.iter()), vec![1.0, 2.0]);
        assert_eq!(durations(merged.iter()), vec![1.0, 2.0]);
    }

    #[test]
    fn empty_sources_merge_to_empty() {
        let merged = Interleaved::new(
            vec![Arc::new(MemSource {
                name: "empty",
                keys: vec![],
            })],
            false,
        );
        assert_eq!(merged.len(), 0);
        assert_eq!(merged.iter().count(), 0);
    }
}
