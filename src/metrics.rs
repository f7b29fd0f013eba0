// SPDX-License-Identifier: Apache-2.0

//! Build presets: the allowed interleave settings for the associative
//! imprint index, and default section capacities per tree size.

use crate::MAXTRANSFORM;

/// How the stored/probed transform sets of an interleave row are chosen.
///
/// The lexicographic transform enumeration puts the stabiliser of the
/// leading input slots at the low tids: every tid below `m!` leaves the
/// first `9 - m` slots untouched. Each allowed interleave pairs that
/// stabiliser subgroup with a system of its coset representatives (the
/// tids that are multiples of the subgroup size); which of the two sides
/// is stored decides the flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterleaveFlavor {
    /// `interleaveStep` is the factorial: store at the representative tids
    /// `{0, step, 2*step, ...}`, probe the subgroup `{0 .. step-1}`.
    TransversalStored,
    /// `numStored` is the factorial: store the subgroup
    /// `{0 .. numStored-1}`, probe the inverses of the representatives.
    SubgroupStored,
}

/// One allowed interleave setting. `num_stored * interleave_step = 9!`
/// always holds.
#[derive(Debug, Clone, Copy)]
pub struct InterleaveMetrics {
    /// Imprints stored per signature; this is the user-facing
    /// `--interleave` value.
    pub num_stored: u32,
    /// Probes needed per associative lookup.
    pub interleave_step: u32,
    pub flavor: InterleaveFlavor,
}

/// The fixed set of valid interleave settings, ascending by storage cost.
pub const INTERLEAVE_METRICS: &[InterleaveMetrics] = &[
    InterleaveMetrics { num_stored: 1, interleave_step: 362_880, flavor: InterleaveFlavor::TransversalStored },
    InterleaveMetrics { num_stored: 120, interleave_step: 3_024, flavor: InterleaveFlavor::SubgroupStored },
    InterleaveMetrics { num_stored: 504, interleave_step: 720, flavor: InterleaveFlavor::TransversalStored },
    InterleaveMetrics { num_stored: 720, interleave_step: 504, flavor: InterleaveFlavor::SubgroupStored },
    InterleaveMetrics { num_stored: 3_024, interleave_step: 120, flavor: InterleaveFlavor::TransversalStored },
    InterleaveMetrics { num_stored: 5_040, interleave_step: 72, flavor: InterleaveFlavor::SubgroupStored },
    InterleaveMetrics { num_stored: 15_120, interleave_step: 24, flavor: InterleaveFlavor::TransversalStored },
    InterleaveMetrics { num_stored: 40_320, interleave_step: 9, flavor: InterleaveFlavor::SubgroupStored },
    InterleaveMetrics { num_stored: 60_480, interleave_step: 6, flavor: InterleaveFlavor::TransversalStored },
];

/// Default interleave for fresh databases. 504 keeps lookups at 720 probes
/// while storing half a thousand imprints per signature; measured to be
/// the best speed/storage balance for collection runs.
pub const DEFAULT_INTERLEAVE: u32 = 504;

/// Default index/data size ratio.
pub const DEFAULT_RATIO: f64 = 5.0;

/// Number of hint slots per signature; one per interleave row with room
/// to spare so the on-disk record stays stable when rows are added.
pub const HINT_SLOTS: usize = 16;

/// Looks up the metrics row for a user-supplied `--interleave` value.
pub fn interleave_metrics(num_stored: u32) -> Option<&'static InterleaveMetrics> {
    INTERLEAVE_METRICS.iter().find(|m| m.num_stored == num_stored)
}

/// Index of an interleave row within [`INTERLEAVE_METRICS`]; this is the
/// hint slot the row's imprint tally lives in.
pub fn interleave_row_index(num_stored: u32) -> Option<usize> {
    INTERLEAVE_METRICS.iter().position(|m| m.num_stored == num_stored)
}

/// Comma-separated list of the valid `--interleave` values for error
/// messages.
pub fn allowed_interleaves() -> String {
    let values: Vec<String> = INTERLEAVE_METRICS.iter().map(|m| m.num_stored.to_string()).collect();
    values.join(",")
}

/// Default section capacities for a build of `num_nodes`-node trees.
///
/// These presets seed the planner when the user gives no explicit
/// `--max*` override. They are calibration data, deliberately generous:
/// the planner raises them by a further 5% margin.
#[derive(Debug, Clone, Copy)]
pub struct GeneratorMetrics {
    pub num_nodes: u32,
    pub pure: bool,
    pub num_signature: u32,
    pub num_member: u32,
    pub num_pair: u32,
    pub num_hint: u32,
    /// Candidate count the generator walks for this size; drives task
    /// partitioning and progress estimates.
    pub num_progress: u64,
}

pub const GENERATOR_METRICS: &[GeneratorMetrics] = &[
    GeneratorMetrics { num_nodes: 0, pure: false, num_signature: 3, num_member: 3, num_pair: 8, num_hint: 3, num_progress: 2 },
    GeneratorMetrics { num_nodes: 1, pure: false, num_signature: 8, num_member: 8, num_pair: 24, num_hint: 8, num_progress: 8 },
    GeneratorMetrics { num_nodes: 2, pure: false, num_signature: 58, num_member: 120, num_pair: 480, num_hint: 58, num_progress: 424 },
    GeneratorMetrics { num_nodes: 3, pure: false, num_signature: 5_824, num_member: 18_000, num_pair: 72_000, num_hint: 5_824, num_progress: 80_816 },
    GeneratorMetrics { num_nodes: 4, pure: false, num_signature: 791_646, num_member: 3_200_000, num_pair: 12_800_000, num_hint: 791_646, num_progress: 26_672_752 },
    GeneratorMetrics { num_nodes: 5, pure: false, num_signature: 791_646, num_member: 24_000_000, num_pair: 96_000_000, num_hint: 791_646, num_progress: 12_273_111_056 },
    GeneratorMetrics { num_nodes: 0, pure: true, num_signature: 3, num_member: 3, num_pair: 8, num_hint: 3, num_progress: 2 },
    GeneratorMetrics { num_nodes: 1, pure: true, num_signature: 7, num_member: 7, num_pair: 21, num_hint: 7, num_progress: 6 },
    GeneratorMetrics { num_nodes: 2, pure: true, num_signature: 38, num_member: 88, num_pair: 350, num_hint: 38, num_progress: 154 },
    GeneratorMetrics { num_nodes: 3, pure: true, num_signature: 1_310, num_member: 5_200, num_pair: 21_000, num_hint: 1_310, num_progress: 15_862 },
    GeneratorMetrics { num_nodes: 4, pure: true, num_signature: 96_355, num_member: 780_000, num_pair: 3_100_000, num_hint: 96_355, num_progress: 2_777_678 },
    GeneratorMetrics { num_nodes: 5, pure: true, num_signature: 791_646, num_member: 9_000_000, num_pair: 36_000_000, num_hint: 791_646, num_progress: 622_666_054 },
];

pub fn generator_metrics(pure: bool, num_nodes: u32) -> Option<&'static GeneratorMetrics> {
    GENERATOR_METRICS
        .iter()
        .find(|m| m.pure == pure && m.num_nodes == num_nodes)
}

/// Imprint capacity preset: the per-signature stored count bounds the
/// imprint total; footprint collisions across permutations only shrink it.
pub fn imprint_metrics(pure: bool, interleave: u32, num_nodes: u32) -> Option<u64> {
    let generator = generator_metrics(pure, num_nodes)?;
    let row = interleave_metrics(interleave)?;
    Some(generator.num_signature as u64 * row.num_stored as u64 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleave_product_is_group_order() {
        for m in INTERLEAVE_METRICS {
            assert_eq!(m.num_stored as u64 * m.interleave_step as u64, MAXTRANSFORM as u64);
        }
    }

    #[test]
    fn test_flavor_matches_factorial_side() {
        fn is_factorial(mut n: u32) -> bool {
            let mut k = 1;
            while n > 1 {
                k += 1;
                if n % k != 0 {
                    return false;
                }
                n /= k;
            }
            true
        }
        for m in INTERLEAVE_METRICS {
            match m.flavor {
                InterleaveFlavor::TransversalStored => assert!(is_factorial(m.interleave_step), "step {}", m.interleave_step),
                InterleaveFlavor::SubgroupStored => assert!(is_factorial(m.num_stored), "stored {}", m.num_stored),
            }
        }
    }

    #[test]
    fn test_default_interleave_is_allowed() {
        assert!(interleave_metrics(DEFAULT_INTERLEAVE).is_some());
        assert!(interleave_metrics(123).is_none());
    }

    #[test]
    fn test_hint_slots_cover_rows() {
        assert!(INTERLEAVE_METRICS.len() <= HINT_SLOTS);
    }
}
