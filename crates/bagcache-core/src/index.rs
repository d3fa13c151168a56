//! Per-series timestamp index
//!
//! Built once from a full scan of one series and never mutated afterwards.
//! Point and range lookups are binary searches over the sorted timestamps, so
//! a caller can find the record nearest to a time, or the records inside a
//! window, without reading the bag again.

use std::ops::Range;

/// Fixed overhead added to the per-timestamp cost in [`TopicTimeIndex::size_bytes`]
const INDEX_OVERHEAD_BYTES: u64 = 56;

/// Sorted nanosecond timestamps of one series
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicTimeIndex {
    series_id: String,
    timestamps: Vec<i64>,
}

impl TopicTimeIndex {
    /// Build an index from timestamps already in non-decreasing order
    ///
    /// The input is not re-sorted. Queries on unsorted input return
    /// unspecified results.
    pub fn build(series_id: impl Into<String>, timestamps: Vec<i64>) -> Self {
        debug_assert!(
            timestamps.is_sorted(),
            "timestamps must be in non-decreasing order"
        );
        Self {
            series_id: series_id.into(),
            timestamps,
        }
    }

    /// Series this index was built for
    pub fn series_id(&self) -> &str {
        &self.series_id
    }

    /// Indexed timestamps
    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    /// Number of indexed timestamps
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Check if the index is empty
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Earliest timestamp
    pub fn first(&self) -> Option<i64> {
        self.timestamps.first().copied()
    }

    /// Latest timestamp
    pub fn last(&self) -> Option<i64> {
        self.timestamps.last().copied()
    }

    /// Estimated memory footprint
    pub fn size_bytes(&self) -> u64 {
        self.timestamps.len() as u64 * 8 + INDEX_OVERHEAD_BYTES
    }

    /// Index of the timestamp closest to `target`, if within `tolerance`
    ///
    /// When two neighbours are equally close the earlier index wins. A
    /// negative tolerance never matches.
    pub fn find_nearest(&self, target: i64, tolerance: i64) -> Option<usize> {
        let tolerance = u64::try_from(tolerance).ok()?;
        let ts = &self.timestamps;
        let insert_at = ts.partition_point(|&t| t < target);

        let before = insert_at
            .checked_sub(1)
            .map(|i| (i, ts[i].abs_diff(target)));
        let after = ts.get(insert_at).map(|&t| (insert_at, t.abs_diff(target)));

        let (index, distance) = match (before, after) {
            (Some(b), Some(a)) => {
                if a.1 < b.1 {
                    a
                } else {
                    b
                }
            }
            (Some(only), None) | (None, Some(only)) => only,
            (None, None) => return None,
        };
        (distance <= tolerance).then_some(index)
    }

    /// Half-open index range of timestamps inside `[start, end]`
    ///
    /// Empty (`lo == hi`) when `start > end` or no timestamp falls inside.
    pub fn find_range(&self, start: i64, end: i64) -> Range<usize> {
        let lo = self.timestamps.partition_point(|&t| t < start);
        if start > end {
            return lo..lo;
        }
        let hi = self.timestamps.partition_point(|&t| t <= end);
        lo..hi.max(lo)
    }

    /// Timestamps inside `[start, end]`
    pub fn slice_range(&self, start: i64, end: i64) -> &[i64] {
        &self.timestamps[self.find_range(start, end)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const SEC: i64 = 1_000_000_000;

    fn seconds_index() -> TopicTimeIndex {
        TopicTimeIndex::build("/odom", vec![SEC, 2 * SEC, 3 * SEC, 4 * SEC, 5 * SEC])
    }

    #[test]
    fn test_find_nearest_exact_match() {
        assert_eq!(seconds_index().find_nearest(3 * SEC, SEC / 10), Some(2));
    }

    #[test]
    fn test_find_nearest_within_tolerance() {
        assert_eq!(
            seconds_index().find_nearest(3 * SEC + SEC / 20, SEC / 10),
            Some(2)
        );
    }

    #[test]
    fn test_find_nearest_out_of_tolerance() {
        assert_eq!(seconds_index().find_nearest(3 * SEC + SEC / 2, SEC / 10), None);
    }

    #[test]
    fn test_find_nearest_small_series() {
        let index = TopicTimeIndex::build("s", vec![10, 20, 30, 40]);
        assert_eq!(index.find_nearest(21, 5), Some(1));
        assert_eq!(index.find_nearest(21, 0), None);
        assert_eq!(index.find_nearest(39, 1), Some(3));
    }

    #[test]
    fn test_find_nearest_tie_prefers_earlier() {
        let index = TopicTimeIndex::build("s", vec![10, 20]);
        assert_eq!(index.find_nearest(15, 5), Some(0));
    }

    #[test]
    fn test_find_nearest_before_and_after_data() {
        let index = TopicTimeIndex::build("s", vec![10, 20]);
        assert_eq!(index.find_nearest(7, 3), Some(0));
        assert_eq!(index.find_nearest(24, 4), Some(1));
        assert_eq!(index.find_nearest(25, 4), None);
    }

    #[test]
    fn test_find_nearest_with_duplicates() {
        let index = TopicTimeIndex::build("s", vec![10, 20, 20, 20, 30]);
        assert_eq!(index.find_nearest(20, 0), Some(1));
        assert_eq!(index.find_nearest(24, 5), Some(3));
    }

    #[test]
    fn test_find_nearest_edge_values() {
        let empty = TopicTimeIndex::build("s", Vec::new());
        assert_eq!(empty.find_nearest(0, i64::MAX), None);

        let index = TopicTimeIndex::build("s", vec![i64::MIN, i64::MAX]);
        assert_eq!(index.find_nearest(-1, i64::MAX), Some(0));
        assert_eq!(index.find_nearest(0, i64::MAX), Some(1));
        assert_eq!(index.find_nearest(i64::MAX, -1), None);
    }

    #[test]
    fn test_find_range_normal() {
        assert_eq!(seconds_index().find_range(2 * SEC, 4 * SEC), 1..4);

        let index = TopicTimeIndex::build("s", vec![10, 20, 30, 40]);
        assert_eq!(index.find_range(15, 35), 1..3);
        assert_eq!(index.slice_range(15, 35), &[20, 30]);
    }

    #[test]
    fn test_find_range_outside_data() {
        let index = seconds_index();
        assert_eq!(index.find_range(0, SEC / 2), 0..0);
        assert_eq!(index.find_range(10 * SEC, 20 * SEC), 5..5);
    }

    #[test]
    fn test_find_range_inverted_is_empty() {
        let range = seconds_index().find_range(4 * SEC, 2 * SEC);
        assert!(range.is_empty());
        assert_eq!(range.start, range.end);
    }

    #[test]
    fn test_find_range_includes_duplicates_at_bounds() {
        let index = TopicTimeIndex::build("s", vec![10, 20, 20, 30, 30, 40]);
        assert_eq!(index.find_range(20, 30), 1..5);
    }

    #[test]
    fn test_find_nearest_matches_linear_scan() {
        let mut rng = StdRng::seed_from_u64(11);

        for _ in 0..500 {
            let len = rng.gen_range(0..12);
            let mut timestamps: Vec<i64> = (0..len).map(|_| rng.gen_range(-50..50)).collect();
            timestamps.sort_unstable();
            let index = TopicTimeIndex::build("s", timestamps.clone());

            let target = rng.gen_range(-70..70);
            let tolerance = rng.gen_range(-2..20);

            let closest = timestamps.iter().map(|t| t.abs_diff(target)).min();
            let in_window = tolerance >= 0 && closest.is_some_and(|d| d <= tolerance as u64);
            let context = format!("timestamps {timestamps:?} target {target} tolerance {tolerance}");

            match index.find_nearest(target, tolerance) {
                Some(i) => {
                    assert!(in_window, "{context}");
                    let distance = timestamps[i].abs_diff(target);
                    assert_eq!(Some(distance), closest, "{context}");
                    // Equidistant neighbours resolve to the earlier one.
                    if timestamps.contains(&(target - distance as i64)) {
                        assert!(timestamps[i] <= target, "{context}");
                    }
                }
                None => assert!(!in_window, "{context}"),
            }

            let (start, end) = (rng.gen_range(-60..60), rng.gen_range(-60..60));
            let range = index.find_range(start, end);
            let inside: Vec<usize> = (0..timestamps.len())
                .filter(|&i| (start..=end).contains(&timestamps[i]))
                .collect();
            assert_eq!(range.clone().collect::<Vec<_>>(), inside);
        }
    }

    #[test]
    fn test_metadata() {
        let index = seconds_index();
        assert_eq!(index.series_id(), "/odom");
        assert_eq!(index.len(), 5);
        assert_eq!(index.first(), Some(SEC));
        assert_eq!(index.last(), Some(5 * SEC));
        assert_eq!(index.size_bytes(), 5 * 8 + 56);
    }
}
