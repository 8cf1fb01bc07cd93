//! Byte-range sets over heap objects, used for memory footprints.

use std::collections::BTreeMap;

use smallvec::SmallVec;

/// A set of half-open byte ranges `[start, end)` per object identifier.
/// Overlapping and adjacent ranges of the same object are merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemMap {
    ranges: BTreeMap<u32, SmallVec<[(u32, u32); 4]>>,
}

impl MemMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn insert(&mut self, obj: u32, start: u32, end: u32) {
        if start >= end {
            return;
        }
        let list = self.ranges.entry(obj).or_default();
        let (mut lo, mut hi) = (start, end);
        list.retain(|&mut (s, e)| {
            if s <= hi && lo <= e {
                lo = lo.min(s);
                hi = hi.max(e);
                false
            } else {
                true
            }
        });
        let at = list.partition_point(|&(s, _)| s < lo);
        list.insert(at, (lo, hi));
    }

    /// Whether `[start, end)` of `obj` overlaps any range in the map.
    pub fn intersect(&self, obj: u32, start: u32, end: u32) -> bool {
        self.ranges
            .get(&obj)
            .is_some_and(|list| list.iter().any(|&(s, e)| s < end && start < e))
    }

    /// Whether any range of `other` overlaps this map.
    pub fn overlaps(&self, other: &MemMap) -> bool {
        other.iter().any(|(obj, s, e)| self.intersect(obj, s, e))
    }

    /// All ranges as `(object, start, end)`, ordered by object then start.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32, u32)> + '_ {
        self.ranges
            .iter()
            .flat_map(|(&obj, list)| list.iter().map(move |&(s, e)| (obj, s, e)))
    }
}

/// Memory one thread loaded from and stored to during a set of runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Footprint {
    pub loads: MemMap,
    pub stores: MemMap,
}

impl Footprint {
    pub fn is_empty(&self) -> bool {
        self.loads.is_empty() && self.stores.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_ranges() {
        let mut m = MemMap::new();
        m.insert(1, 0, 4);
        m.insert(1, 8, 12);
        m.insert(1, 4, 8);
        m.insert(2, 0, 1);
        assert_eq!(m.iter().collect::<Vec<_>>(), vec![(1, 0, 12), (2, 0, 1)]);
    }

    #[test]
    fn test_intersect_is_half_open() {
        let mut m = MemMap::new();
        m.insert(7, 4, 8);
        assert!(m.intersect(7, 7, 9));
        assert!(!m.intersect(7, 8, 12));
        assert!(!m.intersect(7, 0, 4));
        assert!(!m.intersect(8, 4, 8));
        m.insert(7, 10, 10);
        assert_eq!(m.iter().count(), 1);
    }

    #[test]
    fn test_overlaps() {
        let mut a = MemMap::new();
        let mut b = MemMap::new();
        a.insert(1, 0, 4);
        b.insert(1, 4, 8);
        assert!(!a.overlaps(&b));
        b.insert(1, 2, 3);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
    }
}
