//! Size-bounded chunking of ordered record sequences.
//!
//! Splits a slice of records into contiguous groups whose summed size stays
//! under a character budget. Each record costs its text length plus a fixed
//! per-record overhead (room for the author/timestamp header the record is
//! rendered with). A record that alone exceeds the budget becomes its own
//! over-budget chunk; records are never dropped, split or reordered.
//!
//! # Example
//!
//! ```rust
//! use muse_memory::chunker::{chunk, ChunkBudget};
//! use muse_types::TimestampedRecord;
//!
//! let post = |id: &str, len: usize| TimestampedRecord {
//!     id: id.to_string(),
//!     owner: "naoki".into(),
//!     channel: "midnight-sun".into(),
//!     author: "naoki".into(),
//!     text: "x".repeat(len),
//!     unix_time: 0,
//! };
//! let posts = vec![post("r1", 600), post("r2", 300)];
//!
//! // 600 + 64 fits in 800, adding r2 (300 + 64) does not.
//! let chunks = chunk(&posts, ChunkBudget::new(800));
//! assert_eq!(chunks.len(), 2);
//! ```

use muse_types::TimestampedRecord;

/// Default overhead charged per record on top of its text length.
pub const DEFAULT_RECORD_OVERHEAD: usize = 64;

/// Anything with a measurable text body can be chunked.
pub trait Chunkable {
    /// Length of the record's text in characters.
    fn text_len(&self) -> usize;
}

impl Chunkable for TimestampedRecord {
    fn text_len(&self) -> usize {
        self.text.chars().count()
    }
}

impl Chunkable for crate::archive::ForumPost {
    fn text_len(&self) -> usize {
        self.message.chars().count()
    }
}

/// Size budget for one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkBudget {
    /// Maximum summed cost of a chunk, in characters.
    pub max_chars: usize,
    /// Fixed cost added to every record's text length.
    pub record_overhead: usize,
}

impl ChunkBudget {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars,
            record_overhead: DEFAULT_RECORD_OVERHEAD,
        }
    }

    pub fn with_overhead(mut self, record_overhead: usize) -> Self {
        self.record_overhead = record_overhead;
        self
    }

    fn cost<T: Chunkable>(&self, item: &T) -> usize {
        item.text_len().saturating_add(self.record_overhead)
    }
}

/// Partition `items` into ordered, contiguous chunks that fit `budget`.
///
/// Pure and deterministic. Empty input yields no chunks, and no returned
/// chunk is ever empty.
pub fn chunk<'a, T: Chunkable>(items: &'a [T], budget: ChunkBudget) -> Vec<&'a [T]> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut current = 0usize;

    for (i, item) in items.iter().enumerate() {
        let cost = budget.cost(item);
        if i > start && current.saturating_add(cost) > budget.max_chars {
            chunks.push(&items[start..i]);
            start = i;
            current = 0;
        }
        current = current.saturating_add(cost);
    }
    if start < items.len() {
        chunks.push(&items[start..]);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: &str, len: usize) -> TimestampedRecord {
        TimestampedRecord {
            id: id.to_string(),
            owner: "naoki".into(),
            channel: "thread".into(),
            author: "naoki".into(),
            text: "x".repeat(len),
            unix_time: 0,
        }
    }

    fn ids(chunks: &[&[TimestampedRecord]]) -> Vec<Vec<String>> {
        chunks
            .iter()
            .map(|c| c.iter().map(|r| r.id.clone()).collect())
            .collect()
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        let items: Vec<TimestampedRecord> = vec![];
        assert!(chunk(&items, ChunkBudget::new(800)).is_empty());
    }

    #[test]
    fn overhead_forces_split() {
        let items = vec![rec("r1", 600), rec("r2", 300)];
        let chunks = chunk(&items, ChunkBudget::new(800).with_overhead(64));
        assert_eq!(ids(&chunks), vec![vec!["r1"], vec!["r2"]]);
    }

    #[test]
    fn small_records_share_a_chunk() {
        let items = vec![rec("a", 100), rec("b", 100), rec("c", 100)];
        // 3 * (100 + 64) = 492
        let chunks = chunk(&items, ChunkBudget::new(500));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 3);
    }

    #[test]
    fn exact_fit_stays_in_chunk() {
        let items = vec![rec("a", 336), rec("b", 336)];
        // 2 * (336 + 64) = 800, not over budget
        let chunks = chunk(&items, ChunkBudget::new(800));
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn oversized_record_gets_its_own_chunk() {
        let items = vec![rec("a", 10), rec("huge", 5_000), rec("b", 10)];
        let chunks = chunk(&items, ChunkBudget::new(200));
        assert_eq!(ids(&chunks), vec![vec!["a"], vec!["huge"], vec!["b"]]);
    }

    #[test]
    fn oversized_first_record_is_not_dropped() {
        let items = vec![rec("huge", 5_000)];
        let chunks = chunk(&items, ChunkBudget::new(100));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0][0].id, "huge");
    }

    #[test]
    fn concatenation_reproduces_input_for_many_budgets() {
        let items: Vec<TimestampedRecord> = (0..40)
            .map(|i| rec(&format!("r{i}"), (i * 37) % 450 + 1))
            .collect();
        for budget in [1usize, 64, 65, 200, 513, 1_000, 10_000] {
            let chunks = chunk(&items, ChunkBudget::new(budget));
            assert!(chunks.iter().all(|c| !c.is_empty()));
            let flat: Vec<&TimestampedRecord> = chunks.iter().flat_map(|c| c.iter()).collect();
            assert_eq!(flat.len(), items.len());
            for (a, b) in flat.iter().zip(items.iter()) {
                assert_eq!(a.id, b.id);
            }
            for c in &chunks {
                let cost: usize = c.iter().map(|r| r.text.len() + 64).sum();
                assert!(c.len() == 1 || cost <= budget, "chunk over budget at {budget}");
            }
        }
    }

    #[test]
    fn chunking_is_deterministic() {
        let items: Vec<TimestampedRecord> = (0..10).map(|i| rec(&i.to_string(), 150)).collect();
        let a = ids(&chunk(&items, ChunkBudget::new(500)));
        let b = ids(&chunk(&items, ChunkBudget::new(500)));
        assert_eq!(a, b);
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        let mut r = rec("u", 0);
        r.text = "ééé".to_string();
        assert_eq!(r.text_len(), 3);
    }
}
