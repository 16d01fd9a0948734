use std::fmt::{Display, Formatter};

use anyhow::bail;

/// An inclusive range `[lower, upper]` of message numbers. Message numbers start at 1.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SequenceRange {
    lower: i64,
    upper: i64,
}

impl Display for SequenceRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}-{}]", self.lower, self.upper)
    }
}

impl SequenceRange {
    pub fn new(lower: i64, upper: i64) -> anyhow::Result<SequenceRange> {
        if lower < 1 {
            bail!("range lower bound must be positive, was {}", lower);
        }
        if upper < lower {
            bail!("range upper bound {} is below lower bound {}", upper, lower);
        }
        Ok(SequenceRange { lower, upper })
    }

    pub fn single(number: i64) -> anyhow::Result<SequenceRange> {
        SequenceRange::new(number, number)
    }

    pub fn lower(&self) -> i64 {
        self.lower
    }

    pub fn upper(&self) -> i64 {
        self.upper
    }

    pub fn contains(&self, number: i64) -> bool {
        self.lower <= number && number <= self.upper
    }

    fn touches(&self, other: &SequenceRange) -> bool {
        self.lower <= other.upper.saturating_add(1) && other.lower <= self.upper.saturating_add(1)
    }
}

/// Everything that was received (or acknowledged) so far, as an ordered list of disjoint and
///  non-adjacent ranges.
///
/// Merging coalesces touching ranges, so `[1-2]` and `[3-3]` become `[1-3]`. Merging a number
///  that is already covered does not change the collection.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SequenceRangeCollection {
    ranges: Vec<SequenceRange>,
}

impl Display for SequenceRangeCollection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for r in &self.ranges {
            write!(f, "{}", r)?;
        }
        Ok(())
    }
}

impl SequenceRangeCollection {
    pub fn empty() -> SequenceRangeCollection {
        SequenceRangeCollection::default()
    }

    /// Builds a collection from ranges as they arrive on the wire. Ranges may come in any order
    ///  and adjacent ranges are coalesced, but overlapping ranges are rejected.
    pub fn from_wire(mut ranges: Vec<SequenceRange>) -> anyhow::Result<SequenceRangeCollection> {
        ranges.sort_by_key(|r| r.lower);
        for w in ranges.windows(2) {
            if w[1].lower <= w[0].upper {
                bail!("acknowledgement ranges {} and {} overlap", w[0], w[1]);
            }
        }

        let mut result = SequenceRangeCollection::empty();
        for r in ranges {
            result.merge_range(r);
        }
        Ok(result)
    }

    pub fn ranges(&self) -> &[SequenceRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn contains(&self, number: i64) -> bool {
        self.position_of(number).is_ok()
    }

    /// the highest number in the collection, or 0 if it is empty
    pub fn highest(&self) -> i64 {
        self.ranges.last()
            .map(|r| r.upper)
            .unwrap_or(0)
    }

    /// true if the collection is exactly `[1, last]`, or empty for `last == 0`
    pub fn is_complete_up_to(&self, last: i64) -> bool {
        if last == 0 {
            return self.ranges.is_empty();
        }
        self.ranges.len() == 1 && self.ranges[0].lower == 1 && self.ranges[0].upper == last
    }

    pub fn merge(&mut self, number: i64) -> anyhow::Result<()> {
        self.merge_range(SequenceRange::single(number)?);
        Ok(())
    }

    pub fn merge_range(&mut self, range: SequenceRange) {
        let first = self.ranges.partition_point(|r| r.upper.saturating_add(1) < range.lower);

        let mut merged = range;
        let mut end = first;
        while end < self.ranges.len() && self.ranges[end].touches(&merged) {
            merged.lower = merged.lower.min(self.ranges[end].lower);
            merged.upper = merged.upper.max(self.ranges[end].upper);
            end += 1;
        }

        self.ranges.splice(first..end, [merged]);
    }

    /// true if merging the number would leave at most `max_ranges` ranges
    pub fn can_merge(&self, number: i64, max_ranges: usize) -> bool {
        if self.ranges.len() < max_ranges {
            return true;
        }
        match self.position_of(number) {
            Ok(_) => true,
            Err(idx) => {
                let joins_below = idx > 0 && self.ranges[idx - 1].upper + 1 == number;
                let joins_above = idx < self.ranges.len() && self.ranges[idx].lower - 1 == number;
                joins_below || joins_above
            }
        }
    }

    /// true if every number in `other` is also in this collection
    pub fn covers(&self, other: &SequenceRangeCollection) -> bool {
        other.ranges.iter().all(|r| {
            match self.position_of(r.lower) {
                Ok(idx) => self.ranges[idx].upper >= r.upper,
                Err(_) => false,
            }
        })
    }

    /// index of the range containing the number, or the insertion point if none does
    fn position_of(&self, number: i64) -> Result<usize, usize> {
        let idx = self.ranges.partition_point(|r| r.upper < number);
        if idx < self.ranges.len() && self.ranges[idx].contains(number) {
            Ok(idx)
        }
        else {
            Err(idx)
        }
    }
}
