use std::fmt::{self, Display};

use crate::Result;

/// Operating system identifier of a logical processor.
pub type ProcessorId = u32;

/// An ordered set of unique logical processors.
///
/// Iteration order is the order in which processors were first added, which for sets obtained
/// from a [`Topology`][crate::Topology] is its enumeration order. The position of a processor in
/// that order is its dense index, used to address rows of a
/// [`ResultMatrix`][crate::ResultMatrix] and the executors of a [`Runner`][crate::Runner].
///
/// ```
/// use lockstep::CpuSet;
///
/// let set: CpuSet = [4, 5, 6, 0].into_iter().collect();
///
/// assert_eq!(set.index_of(0), Some(3));
/// assert_eq!(set.to_string(), "0,4-6");
/// assert_eq!(CpuSet::parse("4-6,0")?.index_of(0), Some(0));
/// # Ok::<(), lockstep::Error>(())
/// ```
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct CpuSet {
    processors: Vec<ProcessorId>,
}

impl CpuSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a set in the Linux cpulist format, such as `0-3,8,10-14:2`.
    ///
    /// Processors are ordered by ascending identifier. Repeated processors are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCpuSet`][crate::Error::InvalidCpuSet] if the list is malformed.
    pub fn parse(cpulist: &str) -> Result<Self> {
        Ok(cpulist::parse(cpulist.trim())?.into_iter().collect())
    }

    /// Number of processors in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.processors.len()
    }

    /// Whether the set has no processors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Whether the processor is a member.
    #[must_use]
    pub fn contains(&self, processor: ProcessorId) -> bool {
        self.processors.contains(&processor)
    }

    /// Dense index of the processor in iteration order, if it is a member.
    #[must_use]
    pub fn index_of(&self, processor: ProcessorId) -> Option<usize> {
        self.processors.iter().position(|&p| p == processor)
    }

    /// The processor at a dense index.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<ProcessorId> {
        self.processors.get(index).copied()
    }

    /// Processors in iteration order.
    pub fn iter(&self) -> impl Iterator<Item = ProcessorId> + '_ {
        self.processors.iter().copied()
    }

    /// Members of either set: the members of `self` in their order, followed by the members of
    /// `other` that are not in `self`.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        self.iter().chain(other.iter()).collect()
    }

    /// Members of both sets, in the order of `self`.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Self {
        self.iter().filter(|&p| other.contains(p)).collect()
    }

    /// Whether every member of `self` is a member of `other`.
    #[must_use]
    pub fn is_subset(&self, other: &Self) -> bool {
        self.iter().all(|p| other.contains(p))
    }

    /// Whether the sets have no member in common.
    #[must_use]
    pub fn is_disjoint(&self, other: &Self) -> bool {
        !self.iter().any(|p| other.contains(p))
    }
}

impl FromIterator<ProcessorId> for CpuSet {
    fn from_iter<I: IntoIterator<Item = ProcessorId>>(iter: I) -> Self {
        let mut processors = Vec::new();

        for processor in iter {
            if !processors.contains(&processor) {
                processors.push(processor);
            }
        }

        Self { processors }
    }
}

impl<'a> IntoIterator for &'a CpuSet {
    type Item = ProcessorId;
    type IntoIter = std::iter::Copied<std::slice::Iter<'a, ProcessorId>>;

    fn into_iter(self) -> Self::IntoIter {
        self.processors.iter().copied()
    }
}

/// Formats the set in the cpulist format, in ascending processor order.
impl Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sorted = self.processors.clone();
        sorted.sort_unstable();

        let mut ranges = sorted.into_iter().peekable();
        let mut first = true;

        while let Some(start) = ranges.next() {
            let mut end = start;

            while let Some(&next) = ranges.peek() {
                if end.checked_add(1) != Some(next) {
                    break;
                }

                end = next;
                ranges.next();
            }

            if !first {
                f.write_str(",")?;
            }
            first = false;

            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::Error;

    assert_impl_all!(CpuSet: Send, Sync);

    #[test]
    fn duplicates_are_ignored() {
        let set: CpuSet = [3, 1, 3, 2, 1].into_iter().collect();

        assert_eq!(set.iter().collect::<Vec<_>>(), [3, 1, 2]);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn dense_indexes_follow_iteration_order() {
        let set: CpuSet = [8, 2, 5].into_iter().collect();

        assert_eq!(set.index_of(8), Some(0));
        assert_eq!(set.index_of(5), Some(2));
        assert_eq!(set.index_of(3), None);
        assert_eq!(set.get(1), Some(2));
        assert_eq!(set.get(3), None);
        assert_eq!(
            CpuSet::parse("8,2,5").unwrap().iter().collect::<Vec<_>>(),
            [2, 5, 8]
        );
    }

    #[test]
    fn set_algebra() {
        let a = CpuSet::parse("0-3").unwrap();
        let b = CpuSet::parse("2-5").unwrap();
        let c = CpuSet::parse("6,7").unwrap();

        assert_eq!(a.union(&b), CpuSet::parse("0-5").unwrap());
        assert_eq!(b.union(&a).iter().collect::<Vec<_>>(), [2, 3, 4, 5, 0, 1]);
        assert_eq!(a.intersection(&b), CpuSet::parse("2,3").unwrap());
        assert!(a.is_disjoint(&c));
        assert!(!a.is_disjoint(&b));
        assert!(CpuSet::parse("1,2").unwrap().is_subset(&a));
        assert!(!b.is_subset(&a));
        assert!(CpuSet::new().is_subset(&c));
    }

    #[test]
    fn displays_as_cpulist() {
        let set = CpuSet::parse("7,0,1,2,5").unwrap();

        assert_eq!(set.to_string(), "0-2,5,7");
        assert_eq!(CpuSet::new().to_string(), "");
    }

    #[test]
    fn malformed_list_is_error() {
        assert!(matches!(
            CpuSet::parse("0-x"),
            Err(Error::InvalidCpuSet(_))
        ));
    }

    #[test]
    fn empty_list_is_empty_set() {
        assert!(CpuSet::parse("").unwrap().is_empty());
    }
}
