//! UID interval sets and the per-network sub-priority map.
//!
//! A [`UidRanges`] value is sorted and pairwise disjoint, but ranges are
//! kept exactly as they were given: `100-199` and `200-299` stay two
//! ranges. Each range maps to one kernel rule, and a rule can only be
//! deleted with the exact bounds it was installed with.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::error::NetworkError;

/// Highest routing preference a UID policy may request.
pub const SUB_PRIORITY_HIGHEST: i32 = 0;
/// Lowest routing preference a UID policy may request.
pub const SUB_PRIORITY_LOWEST: i32 = 998;
/// Sentinel: the policy takes part in explicit and implicit routing but
/// contributes no per-UID default-network rule.
pub const SUB_PRIORITY_NO_DEFAULT: i32 = 999;

pub fn is_valid_sub_priority(sub_priority: i32) -> bool {
    (SUB_PRIORITY_HIGHEST..=SUB_PRIORITY_LOWEST).contains(&sub_priority)
        || sub_priority == SUB_PRIORITY_NO_DEFAULT
}

/// Inclusive interval of UIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UidRange {
    start: u32,
    stop: u32,
}

impl UidRange {
    pub fn new(start: u32, stop: u32) -> Result<Self, NetworkError> {
        if start > stop {
            return Err(NetworkError::invalid_uid_ranges(format!(
                "uid range start {start} is greater than stop {stop}"
            )));
        }
        Ok(Self { start, stop })
    }

    pub fn single(uid: u32) -> Self {
        Self {
            start: uid,
            stop: uid,
        }
    }

    pub fn start(self) -> u32 {
        self.start
    }

    pub fn stop(self) -> u32 {
        self.stop
    }

    pub fn contains(self, uid: u32) -> bool {
        (self.start..=self.stop).contains(&uid)
    }

    pub fn overlaps(self, other: Self) -> bool {
        self.start <= other.stop && other.start <= self.stop
    }

    /// Number of UIDs covered.
    pub fn len(self) -> u64 {
        u64::from(self.stop - self.start) + 1
    }
}

impl fmt::Display for UidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.stop {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.stop)
        }
    }
}

impl FromStr for UidRange {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim().parse::<u32>().map_err(|_| {
                NetworkError::invalid_uid_ranges(format!("invalid uid '{part}' in range '{s}'"))
            })
        };
        match s.split_once('-') {
            Some((start, stop)) => Self::new(parse(start)?, parse(stop)?),
            None => Ok(Self::single(parse(s)?)),
        }
    }
}

/// Sorted, disjoint UID intervals, each kept as given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct UidRanges {
    ranges: Vec<UidRange>,
}

impl UidRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from raw ranges. Ranges that overlap one another are
    /// rejected; adjacent ranges are kept apart.
    pub fn from_ranges(ranges: impl IntoIterator<Item = UidRange>) -> Result<Self, NetworkError> {
        let mut raw: Vec<UidRange> = ranges.into_iter().collect();
        raw.sort_unstable();
        if let Some(pair) = raw.windows(2).find(|w| w[0].overlaps(w[1])) {
            return Err(NetworkError::invalid_uid_ranges(format!(
                "uid range {} overlaps {}",
                pair[0], pair[1]
            )));
        }
        Ok(Self { ranges: raw })
    }

    /// Parse a comma-separated list such as `"10000-10999,20000"`.
    pub fn parse(s: &str) -> Result<Self, NetworkError> {
        let ranges = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<UidRange>, _>>()?;
        Self::from_ranges(ranges)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of ranges.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = UidRange> + '_ {
        self.ranges.iter().copied()
    }

    pub fn has_uid(&self, uid: u32) -> bool {
        self.ranges
            .binary_search_by(|r| {
                if r.stop < uid {
                    std::cmp::Ordering::Less
                } else if r.start > uid {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let (a, b) = (self.ranges[i], other.ranges[j]);
            if a.overlaps(b) {
                return true;
            }
            if a.stop < b.stop {
                i += 1;
            } else {
                j += 1;
            }
        }
        false
    }

    /// Whether `range` is held with exactly these bounds.
    pub fn contains_range(&self, range: UidRange) -> bool {
        self.ranges.binary_search(&range).is_ok()
    }

    /// Whether every range of `other` is held here with the same bounds.
    pub fn contains_all(&self, other: &Self) -> bool {
        other.iter().all(|range| self.contains_range(range))
    }

    /// Ranges of `self` that `other` does not hold with the same bounds.
    /// Unlike [`difference`](Self::difference) no range is ever split.
    #[must_use]
    pub fn without(&self, other: &Self) -> Self {
        Self {
            ranges: self
                .iter()
                .filter(|range| !other.contains_range(*range))
                .collect(),
        }
    }

    /// UIDs in either set. Overlapping ranges are coalesced; disjoint
    /// ranges, adjacent ones included, are kept as they are.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let mut all = Vec::with_capacity(self.ranges.len() + other.ranges.len());
        all.extend_from_slice(&self.ranges);
        all.extend_from_slice(&other.ranges);
        all.sort_unstable();
        Self {
            ranges: normalize(all),
        }
    }

    /// UIDs in `self` that are not in `other`. Ranges are split where
    /// `other` cuts into them.
    #[must_use]
    pub fn difference(&self, other: &Self) -> Self {
        let mut out = Vec::with_capacity(self.ranges.len());
        for range in &self.ranges {
            let mut rest = Some((range.start, range.stop));
            for cut in &other.ranges {
                let Some((start, stop)) = rest else { break };
                if cut.stop < start {
                    continue;
                }
                if cut.start > stop {
                    break;
                }
                if cut.start > start {
                    out.push(UidRange {
                        start,
                        stop: cut.start - 1,
                    });
                }
                rest = (cut.stop < stop).then(|| (cut.stop + 1, stop));
            }
            if let Some((start, stop)) = rest {
                out.push(UidRange { start, stop });
            }
        }
        Self { ranges: out }
    }
}

/// Coalesce overlapping ranges of a sorted list.
fn normalize(sorted: Vec<UidRange>) -> Vec<UidRange> {
    let mut out: Vec<UidRange> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match out.last_mut() {
            Some(last) if range.start <= last.stop => {
                last.stop = last.stop.max(range.stop);
            }
            _ => out.push(range),
        }
    }
    out
}

impl fmt::Display for UidRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{range}")?;
        }
        Ok(())
    }
}

impl FromStr for UidRanges {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// UID routing policies of one network, keyed by sub-priority.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UidRangeMap(BTreeMap<i32, UidRanges>);

impl UidRangeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// A map holding exactly one policy.
    pub fn single(sub_priority: i32, ranges: UidRanges) -> Self {
        let mut map = Self::new();
        map.add(&ranges, sub_priority);
        map
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, sub_priority: i32) -> Option<&UidRanges> {
        self.0.get(&sub_priority)
    }

    /// Policies in ascending sub-priority order.
    pub fn iter(&self) -> impl Iterator<Item = (i32, &UidRanges)> + '_ {
        self.0.iter().map(|(p, r)| (*p, r))
    }

    /// Record `ranges` under `sub_priority`. Callers make sure they do not
    /// overlap what is already held there. Empty sets are not stored.
    pub fn add(&mut self, ranges: &UidRanges, sub_priority: i32) {
        if ranges.is_empty() {
            return;
        }
        self.0
            .entry(sub_priority)
            .and_modify(|existing| *existing = existing.union(ranges))
            .or_insert_with(|| ranges.clone());
    }

    /// Whether every range of `ranges` is held at `sub_priority` with the
    /// same bounds.
    pub fn holds(&self, ranges: &UidRanges, sub_priority: i32) -> bool {
        self.0
            .get(&sub_priority)
            .is_some_and(|held| held.contains_all(ranges))
    }

    /// Drop the ranges of `ranges` held at `sub_priority` with the same
    /// bounds, dropping the entry once it is empty.
    pub fn remove(&mut self, ranges: &UidRanges, sub_priority: i32) {
        let Some(existing) = self.0.get_mut(&sub_priority) else {
            return;
        };
        *existing = existing.without(ranges);
        if existing.is_empty() {
            self.0.remove(&sub_priority);
        }
    }

    /// Smallest (most preferred) sub-priority whose ranges contain `uid`.
    pub fn applies_to_uid(&self, uid: u32) -> Option<i32> {
        self.0
            .iter()
            .find(|(_, ranges)| ranges.has_uid(uid))
            .map(|(p, _)| *p)
    }
}
