/// A logical request translated into physical (newest-first) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalRange {
    /// First physical line to read.
    pub start: u64,
    /// One past the last physical line to read.
    pub end: u64,
    /// Clamped logical start (oldest requested record).
    pub first_idx: u64,
    /// Clamped logical end (newest requested record).
    pub last_idx: u64,
}

impl PhysicalRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Maps the 1-based inclusive ascending range `start_idx..=end_idx` over `total` records onto
/// storage that holds the newest record at physical 0. Both ends are clamped into `1..=total`
/// first. Returns `None` for an empty dataset or an inverted range.
pub fn physical_range(total: u64, start_idx: u64, end_idx: u64) -> Option<PhysicalRange> {
    if total == 0 || start_idx > end_idx {
        return None;
    }
    let first_idx = start_idx.clamp(1, total);
    let last_idx = end_idx.clamp(1, total);
    Some(PhysicalRange { start: total - last_idx, end: total - first_idx + 1, first_idx, last_idx })
}

/// Logical index of the record at physical position `physical`.
pub fn logical_idx(total: u64, physical: u64) -> u64 {
    total - physical
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(10, 1, 10, Some((0, 10)))]
    #[case(10, 1, 1, Some((9, 10)))]
    #[case(10, 10, 10, Some((0, 1)))]
    #[case(10, 3, 5, Some((5, 8)))]
    #[case(10, 0, 3, Some((7, 10)))]
    #[case(10, 8, 99, Some((0, 3)))]
    #[case(10, 5, 4, None)]
    #[case(0, 1, 5, None)]
    fn translates_and_clamps(
        #[case] total: u64,
        #[case] start: u64,
        #[case] end: u64,
        #[case] expected: Option<(u64, u64)>,
    ) {
        let range = physical_range(total, start, end).map(|range| (range.start, range.end));
        assert_eq!(range, expected);
    }

    #[test]
    fn every_valid_range_has_requested_length() {
        let total = 37;
        for start in 1..=total {
            for end in start..=total {
                let range = physical_range(total, start, end).expect("range");
                assert_eq!(range.len(), end - start + 1);
                assert_eq!(logical_idx(total, range.start), end);
                assert_eq!(logical_idx(total, range.end - 1), start);
            }
        }
    }
}
