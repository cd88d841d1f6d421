use ulid::Ulid;

use crate::engine::compute_saturated_spans;
use crate::model::{Ms, Span};

/// One active booking's claim on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub span: Span,
    pub booking_id: Ulid,
}

#[derive(Debug, PartialEq, Eq)]
pub enum IndexError {
    /// Inserting would push concurrent claims past capacity; carries the
    /// first overlapping booking.
    IntervalConflict(Ulid),
}

/// Per-resource ordered set of active booking intervals.
///
/// Entries are sorted by `span.start`. `max_len` is the longest span ever
/// inserted; it never shrinks, so it stays a valid (if loose) bound after
/// removals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalIndex {
    entries: Vec<IndexEntry>,
    max_len: Ms,
}

impl IntervalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Entries whose span intersects `query`, in start order.
    ///
    /// Anything starting at or before `query.start - max_len` has already
    /// ended, and anything starting at or after `query.end` has not begun,
    /// so two binary searches bound the scan.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &IndexEntry> {
        let floor = query.start.saturating_sub(self.max_len);
        let lo = self.entries.partition_point(|e| e.span.start <= floor);
        let hi = self.entries.partition_point(|e| e.span.start < query.end);
        let query_start = query.start;
        self.entries[lo..hi.max(lo)]
            .iter()
            .filter(move |e| e.span.end > query_start)
    }

    pub fn overlaps(&self, query: &Span) -> Vec<Ulid> {
        self.overlapping(query).map(|e| e.booking_id).collect()
    }

    /// Whether one more claim on `span` fits within `capacity`, pretending
    /// the entries in `leaving` are already gone.
    pub fn check(&self, span: &Span, capacity: u32, leaving: &[Ulid]) -> Result<(), IndexError> {
        let hits: Vec<IndexEntry> = self
            .overlapping(span)
            .filter(|e| !leaving.contains(&e.booking_id))
            .copied()
            .collect();
        if let Some(first) = hits.first() {
            let spans: Vec<Span> = hits.iter().map(|e| e.span).collect();
            let saturated = compute_saturated_spans(&spans, capacity);
            if saturated.iter().any(|s| s.overlaps(span)) {
                return Err(IndexError::IntervalConflict(first.booking_id));
            }
        }
        Ok(())
    }

    /// Insert without a capacity check. Callers run `check` before the
    /// ledger append; replayed records were checked when first written.
    pub(crate) fn insert_unchecked(&mut self, span: Span, booking_id: Ulid) {
        let pos = self.entries.partition_point(|e| e.span.start <= span.start);
        self.entries.insert(pos, IndexEntry { span, booking_id });
        self.max_len = self.max_len.max(span.duration_ms());
    }

    pub fn remove(&mut self, booking_id: &Ulid) -> Option<IndexEntry> {
        let pos = self.entries.iter().position(|e| e.booking_id == *booking_id)?;
        Some(self.entries.remove(pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with(spans: &[(Ms, Ms)]) -> (IntervalIndex, Vec<Ulid>) {
        let mut idx = IntervalIndex::new();
        let mut ids = Vec::new();
        for &(s, e) in spans {
            let id = Ulid::new();
            idx.insert_unchecked(Span::new(s, e), id);
            ids.push(id);
        }
        (idx, ids)
    }

    #[test]
    fn entries_stay_sorted() {
        let (idx, _) = index_with(&[(300, 400), (100, 200), (200, 300)]);
        let starts: Vec<Ms> = idx.entries().iter().map(|e| e.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let (idx, ids) = index_with(&[(100, 200), (450, 600), (1000, 1100)]);
        let hits = idx.overlaps(&Span::new(500, 800));
        assert_eq!(hits, vec![ids[1]]);
    }

    #[test]
    fn adjacent_is_not_overlapping() {
        let (idx, _) = index_with(&[(100, 200)]);
        assert!(idx.overlaps(&Span::new(200, 300)).is_empty());
        assert!(idx.overlaps(&Span::new(0, 100)).is_empty());
    }

    #[test]
    fn single_ms_overlap_counts() {
        let (idx, _) = index_with(&[(100, 201)]);
        assert_eq!(idx.overlaps(&Span::new(200, 300)).len(), 1);
    }

    #[test]
    fn long_entry_spanning_query_is_found() {
        // A long stay starting well before many short ones.
        let (idx, ids) = index_with(&[(0, 10_000), (100, 150), (200, 250), (300, 350)]);
        let hits = idx.overlaps(&Span::new(5_000, 5_100));
        assert_eq!(hits, vec![ids[0]]);
    }

    #[test]
    fn empty_index_has_no_overlaps() {
        let idx = IntervalIndex::new();
        assert!(idx.overlaps(&Span::new(0, 1000)).is_empty());
    }

    #[test]
    fn check_rejects_overlap_at_capacity_one() {
        let (idx, ids) = index_with(&[(100, 200)]);
        let err = idx.check(&Span::new(150, 250), 1, &[]).unwrap_err();
        assert_eq!(err, IndexError::IntervalConflict(ids[0]));
        // back-to-back is fine
        assert!(idx.check(&Span::new(200, 300), 1, &[]).is_ok());
    }

    #[test]
    fn check_respects_capacity() {
        let (idx, _) = index_with(&[(0, 100), (50, 150)]);
        assert!(idx.check(&Span::new(60, 70), 2, &[]).is_err());
        // Only one claim at [100, 150), so a second fits there.
        assert!(idx.check(&Span::new(100, 150), 2, &[]).is_ok());
    }

    #[test]
    fn check_ignores_leaving_entries() {
        let (idx, ids) = index_with(&[(100, 200)]);
        assert!(idx.check(&Span::new(150, 250), 1, &[]).is_err());
        assert!(idx.check(&Span::new(150, 250), 1, &ids).is_ok());
    }

    #[test]
    fn remove_middle_preserves_order() {
        let (mut idx, ids) = index_with(&[(0, 50), (100, 150), (200, 250)]);
        let removed = idx.remove(&ids[1]).unwrap();
        assert_eq!(removed.span, Span::new(100, 150));
        let left: Vec<Ulid> = idx.entries().iter().map(|e| e.booking_id).collect();
        assert_eq!(left, vec![ids[0], ids[2]]);
        assert!(idx.remove(&ids[1]).is_none());
    }
}
