// SPDX-License-Identifier: Apache-2.0

//! Hint collection: per-signature imprint tallies for every interleave
//! preset.
//!
//! Imprint counts are non-linear in the interleave setting and expensive
//! to predict; running a build out of imprint storage hours in is the
//! worst failure mode there is. A hint records, for one signature, the
//! exact number of imprints it produces at each allowed interleave. The
//! planner and the `--unsafe` rebuild use them to fill the imprint
//! section with the cheapest signatures first.

use crate::db::index::VersionedIndex;
use crate::db::layout::SectionId;
use crate::db::records::{Hint, SIGMASK_SAFE};
use crate::db::Database;
use crate::imprint::{self, ImprintError, RebuildCounts};
use crate::metrics::{interleave_row_index, INTERLEAVE_METRICS};
use crate::primes::next_prime;
use crate::tree::{MicroTree, DEFAULT_SKIN};
use crate::BuildFlags;

/// Scratch sized for the densest interleave row.
pub fn tally_scratch() -> VersionedIndex {
    let densest = INTERLEAVE_METRICS
        .iter()
        .map(|m| m.num_stored)
        .max()
        .unwrap_or(1);
    VersionedIndex::new(next_prime(densest as u64 * 3) as usize)
}

/// Computes the full tally vector of one canonical tree.
pub fn hint_of_tree(
    db: &Database,
    tree: &MicroTree,
    scratch: &mut VersionedIndex,
) -> Result<Hint, ImprintError> {
    let mut hint = Hint { num_stored: [0; crate::metrics::HINT_SLOTS] };
    for (row_index, row) in INTERLEAVE_METRICS.iter().enumerate() {
        hint.num_stored[row_index] = imprint::tally(db, tree, row, scratch)?;
    }
    Ok(hint)
}

/// Collection statistics of a hint sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct HintStats {
    pub num_processed: u32,
    pub skip_duplicate: u32,
}

/// Tallies every signature in the window and links the interned hints.
/// This is the slow sweep; a full catalogue takes hours, which is why
/// the window and task partitioning exist.
pub fn collect_hints(
    db: &mut Database,
    sid_window: (u32, u32),
) -> Result<HintStats, ImprintError> {
    let flags = BuildFlags::from_bits(db.creation_flags);
    let mut tree = MicroTree::new(flags);
    let mut scratch = tally_scratch();
    let mut stats = HintStats::default();

    let (sid_lo, sid_hi) = sid_window;
    for sid in 1..db.num(SectionId::Signature) {
        if (sid_lo != 0 && sid < sid_lo) || (sid_hi != 0 && sid >= sid_hi) {
            continue;
        }
        let mut signature = db.signature(sid);
        tree.parse_fast(signature.name_str(), DEFAULT_SKIN)
            .map_err(|e| {
                ImprintError::Db(crate::db::DbError::Corrupt(format!(
                    "signature {} name unparseable: {}",
                    sid, e
                )))
            })?;

        let hint = hint_of_tree(db, &tree, &mut scratch)?;

        let (slot, existing) = db.lookup_hint(&hint)?;
        let hid = if existing != 0 {
            stats.skip_duplicate += 1;
            existing
        } else {
            let hid = db.add_hint(&hint)?;
            db.index_set(SectionId::HintIndex, slot, hid);
            hid
        };
        signature.hint_id = hid;
        db.set_signature(sid, signature);
        stats.num_processed += 1;
    }

    log::info!(
        "collected hints: numHint={} processed={} duplicates={}",
        db.num(SectionId::Hint),
        stats.num_processed,
        stats.skip_duplicate
    );
    Ok(stats)
}

/// Rebuilds imprints for the empty/unsafe signature groups, cheapest
/// first according to their hints, stopping cleanly when the imprint
/// section is about to fill.
pub fn rebuild_imprints_with_hints(db: &mut Database) -> Result<RebuildCounts, ImprintError> {
    assert!(db.num(SectionId::Hint) >= 2, "hint section required");

    db.index_clear(SectionId::ImprintIndex);
    db.set_num(SectionId::Imprint, 1);

    let mut counts = RebuildCounts::default();
    let num_signature = db.num(SectionId::Signature);
    if num_signature < 2 {
        return Ok(counts);
    }

    log::info!("rebuilding imprints with hints");

    let active_row = interleave_row_index(db.interleave).unwrap_or(0);

    // Unsafe groups, cheapest active-row tally first; ties broken by the
    // densest inactive tallies so partial fills favour flexibility.
    let mut order: Vec<u32> = (1..num_signature)
        .filter(|&sid| db.signature(sid).flags & SIGMASK_SAFE == 0)
        .collect();
    order.sort_by(|&lhs, &rhs| {
        let hint_l = db.hint(db.signature(lhs).hint_id);
        let hint_r = db.hint(db.signature(rhs).hint_id);
        hint_l.num_stored[active_row]
            .cmp(&hint_r.num_stored[active_row])
            .then_with(|| {
                for row in 0..INTERLEAVE_METRICS.len() {
                    if row != active_row {
                        let order = hint_r.num_stored[row].cmp(&hint_l.num_stored[row]);
                        if order != std::cmp::Ordering::Equal {
                            return order;
                        }
                    }
                }
                std::cmp::Ordering::Equal
            })
    });

    let flags = BuildFlags::from_bits(db.creation_flags);
    let mut tree = MicroTree::new(flags);

    for &sid in &order {
        if db.max(SectionId::Imprint) - db.num(SectionId::Imprint) <= db.interleave {
            counts.truncated_at = sid;
            log::warn!(
                "imprint storage full, truncating at sid={} \"{}\"",
                sid,
                db.signature(sid).name_str()
            );
            break;
        }

        let signature = db.signature(sid);
        tree.parse_fast(signature.name_str(), DEFAULT_SKIN)
            .map_err(|e| {
                ImprintError::Db(crate::db::DbError::Corrupt(format!(
                    "signature {} name unparseable: {}",
                    sid, e
                )))
            })?;
        if imprint::lookup(db, &tree)?.is_none() {
            imprint::add_imprints(db, &tree, sid)?;
        }

        if signature.first_member == 0 {
            counts.num_empty += 1;
        }
        counts.num_unsafe += 1;
    }

    log::info!(
        "created imprints with hints: numImprint={} numEmpty={} numUnsafe={}",
        db.num(SectionId::Imprint),
        counts.num_empty,
        counts.num_unsafe
    );
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::interleave_metrics;

    fn hint_db(signatures: &[&str]) -> Database {
        let mut db = Database::new();
        db.create_transforms().unwrap();
        db.interleave = 504;
        db.interleave_step = 720;
        db.alloc_section(SectionId::Signature, 16);
        db.alloc_section(SectionId::SignatureIndex, next_prime(16 * 5) as u32);
        db.alloc_section(SectionId::Hint, 16);
        db.alloc_section(SectionId::HintIndex, next_prime(16 * 5) as u32);
        db.alloc_section(SectionId::Imprint, 16 * 504 + 1);
        db.alloc_section(SectionId::ImprintIndex, next_prime((16 * 504 + 1) as u64 * 5) as u32);
        for name in signatures {
            let (slot, _) = db.lookup_signature(name).unwrap();
            let sid = db.add_signature(name).unwrap();
            db.index_set(SectionId::SignatureIndex, slot, sid);
        }
        db
    }

    #[test]
    fn test_tally_counts_symmetries() {
        let db = hint_db(&[]);
        let mut scratch = tally_scratch();
        let mut tree = MicroTree::new(BuildFlags::default());

        // The naked variable has 9 distinct footprints across all
        // transforms, fewer at sparse interleaves.
        tree.parse_fast("a", DEFAULT_SKIN).unwrap();
        let row = interleave_metrics(504).unwrap();
        let count = imprint::tally(&db, &tree, row, &mut scratch).unwrap();
        assert!(count <= 9, "at most one imprint per variable, got {}", count);
        assert!(count >= 1);

        // An asymmetric two-variable function stores one imprint per
        // ordered variable pair reachable from the stored set.
        tree.parse_fast("ab>", DEFAULT_SKIN).unwrap();
        let count_gt = imprint::tally(&db, &tree, row, &mut scratch).unwrap();
        assert!(count_gt <= 72, "at most 9*8 ordered pairs, got {}", count_gt);
        // The symmetric OR collapses each unordered pair.
        tree.parse_fast("ab+", DEFAULT_SKIN).unwrap();
        let count_or = imprint::tally(&db, &tree, row, &mut scratch).unwrap();
        assert!(count_or <= count_gt);
    }

    #[test]
    fn test_hint_vector_is_bounded_per_row() {
        let db = hint_db(&[]);
        let mut scratch = tally_scratch();
        let mut tree = MicroTree::new(BuildFlags::default());
        tree.parse_fast("ab+cd^^", DEFAULT_SKIN).unwrap();
        let hint = hint_of_tree(&db, &tree, &mut scratch).unwrap();

        for (i, row) in INTERLEAVE_METRICS.iter().enumerate() {
            let tally = hint.num_stored[i];
            assert!(tally >= 1, "row {} empty", row.num_stored);
            assert!(tally <= row.num_stored, "row {} overflows: {}", row.num_stored, tally);
        }
        // Unused slots stay zero.
        for slot in INTERLEAVE_METRICS.len()..crate::metrics::HINT_SLOTS {
            assert_eq!(hint.num_stored[slot], 0);
        }
    }

    #[test]
    fn test_collect_hints_interns_and_links() {
        let mut db = hint_db(&["ab+", "ab&", "ab^"]);
        let stats = collect_hints(&mut db, (0, 0)).unwrap();
        assert_eq!(stats.num_processed, 3);

        for sid in 1..db.num(SectionId::Signature) {
            let signature = db.signature(sid);
            assert_ne!(signature.hint_id, 0, "sid {} unlinked", sid);
        }
        // OR and AND share a tally vector (same symmetry class), XOR may
        // differ; interning keeps the section deduplicated either way.
        assert!(db.num(SectionId::Hint) <= 1 + 3);
        assert!(stats.skip_duplicate >= 1);
    }

    #[test]
    fn test_rebuild_with_hints_prefers_cheap_groups() {
        let mut db = hint_db(&["ab+cd^^", "ab+"]);
        collect_hints(&mut db, (0, 0)).unwrap();
        let counts = rebuild_imprints_with_hints(&mut db).unwrap();
        assert_eq!(counts.truncated_at, 0);
        assert_eq!(counts.num_unsafe, 2);

        // Both groups resolve associatively afterwards.
        let mut tree = MicroTree::new(BuildFlags::default());
        tree.parse_fast("ab+", DEFAULT_SKIN).unwrap();
        assert!(imprint::lookup(&db, &tree).unwrap().is_some());
        tree.parse_fast("ab+cd^^", DEFAULT_SKIN).unwrap();
        assert!(imprint::lookup(&db, &tree).unwrap().is_some());
    }
}
