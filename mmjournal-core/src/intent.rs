//! Write intents.

use mmjournal_storage::ViewAddress;

/// A byte range of the private view space that may differ from the shared
/// view and has to be captured by the next commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WriteIntent {
    start: u64,
    end: u64,
}

impl WriteIntent {
    /// Creates an intent for `[start, start + len)`.
    ///
    /// # Panics
    ///
    /// Panics on a zero-length range or a null address.
    pub fn new(start: ViewAddress, len: u32) -> Self {
        assert!(len > 0, "write intent at {} has zero length", start);
        assert!(start.0 != 0, "write intent at a null address");
        Self {
            start: start.0,
            end: start.0 + len as u64,
        }
    }

    pub fn start(&self) -> ViewAddress {
        ViewAddress(self.start)
    }

    pub fn end(&self) -> ViewAddress {
        ViewAddress(self.end)
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Whether the two ranges overlap or touch.
    fn joins(&self, other: &WriteIntent) -> bool {
        other.start <= self.end && self.start <= other.end
    }
}

/// Sorts intents and merges the ones that overlap or touch.
pub fn coalesce(mut intents: Vec<WriteIntent>) -> Vec<WriteIntent> {
    intents.sort_unstable();
    let mut merged: Vec<WriteIntent> = Vec::with_capacity(intents.len());
    for intent in intents {
        match merged.last_mut() {
            Some(last) if last.joins(&intent) => {
                last.end = last.end.max(intent.end);
            }
            _ => merged.push(intent),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn wi(start: u64, len: u32) -> WriteIntent {
        WriteIntent::new(ViewAddress(start), len)
    }

    #[test]
    fn test_coalesce_adjacent_and_overlapping() {
        let merged = coalesce(vec![wi(200, 60), wi(100, 50), wi(150, 10), wi(120, 5)]);
        assert_eq!(merged, vec![wi(100, 60), wi(200, 60)]);
    }

    #[test]
    fn test_coalesce_keeps_gaps() {
        let merged = coalesce(vec![wi(100, 50), wi(151, 9)]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_coalesce_duplicates() {
        let merged = coalesce(vec![wi(100, 8), wi(100, 8), wi(100, 4)]);
        assert_eq!(merged, vec![wi(100, 8)]);
    }

    #[test]
    #[should_panic(expected = "zero length")]
    fn test_zero_length_intent_panics() {
        wi(100, 0);
    }

    #[test]
    #[should_panic(expected = "null address")]
    fn test_null_intent_panics() {
        wi(0, 8);
    }

    fn covered(intents: &[WriteIntent]) -> BTreeSet<u64> {
        intents
            .iter()
            .flat_map(|i| i.start().0..i.end().0)
            .collect()
    }

    proptest! {
        #[test]
        fn prop_coalesce_preserves_coverage(
            raw in prop::collection::vec((1u64..500, 1u32..40), 0..50)
        ) {
            let intents: Vec<WriteIntent> = raw.iter().map(|&(s, l)| wi(s, l)).collect();
            let merged = coalesce(intents.clone());

            prop_assert_eq!(covered(&merged), covered(&intents));
            for pair in merged.windows(2) {
                // Sorted, and separated by at least one byte.
                prop_assert!(pair[0].end() < pair[1].start());
            }
        }
    }
}
