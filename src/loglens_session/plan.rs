use serde::Serialize;

use crate::loglens_merge::EstimatedTotal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePlan {
    /// Persist the warm sample as the dataset.
    SkipFullMerge,
    FullMerge,
}

/// The only place allowed to skip the full merge. The warmup's coverage flag is a hint; it
/// counts only when the estimate is exact, agrees with the sample, and the sample is small.
pub fn decide_merge_plan(
    fully_covered: bool,
    sample_len: u64,
    estimate: Option<EstimatedTotal>,
    skip_merge_max_lines: u64,
) -> MergePlan {
    let Some(estimate) = estimate else {
        return MergePlan::FullMerge;
    };
    if fully_covered && estimate.exact && estimate.lines == sample_len && sample_len <= skip_merge_max_lines {
        MergePlan::SkipFullMerge
    } else {
        MergePlan::FullMerge
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn exact(lines: u64) -> Option<EstimatedTotal> {
        Some(EstimatedTotal { lines, exact: true })
    }

    #[rstest]
    #[case(true, 100, exact(100), 1_000, MergePlan::SkipFullMerge)]
    #[case(true, 0, exact(0), 1_000, MergePlan::SkipFullMerge)]
    #[case(false, 100, exact(100), 1_000, MergePlan::FullMerge)]
    #[case(true, 100, exact(120), 1_000, MergePlan::FullMerge)]
    #[case(true, 100, Some(EstimatedTotal { lines: 100, exact: false }), 1_000, MergePlan::FullMerge)]
    #[case(true, 100, None, 1_000, MergePlan::FullMerge)]
    #[case(true, 100, exact(100), 99, MergePlan::FullMerge)]
    fn skips_only_with_full_agreement(
        #[case] fully_covered: bool,
        #[case] sample_len: u64,
        #[case] estimate: Option<EstimatedTotal>,
        #[case] threshold: u64,
        #[case] expected: MergePlan,
    ) {
        assert_eq!(decide_merge_plan(fully_covered, sample_len, estimate, threshold), expected);
    }
}
