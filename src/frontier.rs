use smallvec::SmallVec;

use crate::LV;

/// A frontier names the set of local versions which aren't dominated by any
/// other known version - the tips of the causal graph. The empty frontier is
/// the root (no operations known).
///
/// Frontiers are always stored sorted, smallest to largest, with no
/// duplicates. Items in a frontier are mutually concurrent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frontier(pub SmallVec<[LV; 2]>);

impl Frontier {
    pub fn root() -> Self {
        Self(SmallVec::new())
    }

    pub fn new_1(v: LV) -> Self {
        let mut result = SmallVec::new();
        result.push(v);
        Self(result)
    }

    /// Builds a frontier from versions in any order.
    pub fn from_unsorted(items: &[LV]) -> Self {
        let mut items: SmallVec<[LV; 2]> = items.into();
        items.sort_unstable();
        items.dedup();
        Self(items)
    }

    pub fn as_ref(&self) -> &[LV] {
        self.0.as_slice()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, v: LV) -> bool {
        self.0.contains(&v)
    }

    pub(crate) fn is_sorted(&self) -> bool {
        self.0.windows(2).all(|w| w[0] < w[1])
    }

    /// Inserts a version, keeping the frontier sorted.
    pub(crate) fn insert(&mut self, v: LV) {
        if let Err(idx) = self.0.binary_search(&v) {
            self.0.insert(idx, v);
        }
    }

    /// Advance this frontier by a newly assigned version whose parents are
    /// `parents`. Any current tip the new op descends from must be one of its
    /// parents, so removing the parents and inserting the new version is
    /// exact.
    pub(crate) fn advance_by_known_run(&mut self, parents: &[LV], v: LV) {
        self.0.retain(|o| !parents.contains(o));
        self.insert(v);
        debug_assert!(self.is_sorted());
    }
}

impl From<&[LV]> for Frontier {
    fn from(items: &[LV]) -> Self {
        Self::from_unsorted(items)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn advance_movement_smoke_test() {
        let mut f = Frontier::root();
        f.advance_by_known_run(&[], 0);
        assert_eq!(f.as_ref(), &[0]);

        f.advance_by_known_run(&[0], 1);
        assert_eq!(f.as_ref(), &[1]);

        // A concurrent branch: 2 doesn't descend from 1.
        f.advance_by_known_run(&[0], 2);
        assert_eq!(f.as_ref(), &[1, 2]);

        // And a merge.
        f.advance_by_known_run(&[1, 2], 3);
        assert_eq!(f.as_ref(), &[3]);
    }

    #[test]
    fn from_unsorted_sorts_and_dedups() {
        let f = Frontier::from_unsorted(&[5, 1, 5, 3]);
        assert_eq!(f.as_ref(), &[1, 3, 5]);
        assert!(f.is_sorted());
        assert_eq!(Frontier::new_1(2).as_ref(), &[2]);
        assert!(Frontier::root().is_root());
    }
}
