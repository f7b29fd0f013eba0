// SPDX-License-Identifier: Apache-2.0

//! The associative imprint index.
//!
//! Given a query tree `R`, the index returns the `(sid, tid)` pair such
//! that `R` equals the canonical tree of signature `sid` relabelled
//! through transform `tid`, or reports absent.
//!
//! The interleave setting `(numStored, interleaveStep)` trades storage
//! for probes: per signature exactly `numStored` imprints are stored and
//! a lookup evaluates at most `interleaveStep` probes. Exactly one probe
//! is guaranteed to hit for an in-catalogue tree because the stored and
//! probed transform sets factor the full permutation group: every
//! transform decomposes uniquely as `compose(stored, probed)`.
//!
//! Which sets those are depends on the interleave flavor (see
//! [`crate::metrics::InterleaveFlavor`]): one side is always the
//! stabiliser subgroup of the leading input slots, the other a system of
//! its coset representatives.

use std::fmt;

use crate::db::records::SIGMASK_SAFE;
use crate::db::{Database, DbError};
use crate::db::layout::SectionId;
use crate::footprint::Footprint;
use crate::metrics::{interleave_metrics, InterleaveFlavor, InterleaveMetrics};
use crate::tree::MicroTree;
use crate::{IBIT, NEND};

#[derive(Debug)]
pub enum ImprintError {
    Db(DbError),
    /// Two different signatures produced the same footprint; the imprint
    /// section can no longer answer lookups unambiguously.
    DuplicateSid { existing_sid: u32, new_sid: u32, tid: u32 },
    /// The database carries an interleave outside the allowed set.
    BadInterleave(u32),
}

impl fmt::Display for ImprintError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImprintError::Db(e) => write!(f, "{}", e),
            ImprintError::DuplicateSid { existing_sid, new_sid, tid } => write!(
                f,
                "imprint collision: sid {} and sid {} share a footprint at tid {}",
                existing_sid, new_sid, tid
            ),
            ImprintError::BadInterleave(n) => write!(f, "interleave {} is not an allowed setting", n),
        }
    }
}

impl std::error::Error for ImprintError {}

impl From<DbError> for ImprintError {
    fn from(e: DbError) -> Self {
        ImprintError::Db(e)
    }
}

fn metrics_for(db: &Database) -> Result<&'static InterleaveMetrics, ImprintError> {
    interleave_metrics(db.interleave).ok_or(ImprintError::BadInterleave(db.interleave))
}

/// The transform ids imprints are stored at for this interleave.
///
/// A hit at probe `u` with stored transform `t` answers
/// `compose(u, t)`, so the stored and probed sets must factor the group
/// as `{probe} * {stored}`. The subgroup side always pairs with the
/// inverses-or-representatives of the other.
fn stored_tids<'a>(db: &'a Database, row: &'a InterleaveMetrics) -> impl Iterator<Item = u32> + 'a {
    let step = row.interleave_step;
    let flavor = row.flavor;
    (0..row.num_stored).map(move |k| match flavor {
        // Inverses of the coset representatives; the subgroup is probed.
        InterleaveFlavor::TransversalStored => db.transform_rev_id(k * step),
        // The subgroup itself; the representatives are probed.
        InterleaveFlavor::SubgroupStored => k,
    })
}

/// The transform ids a lookup probes, in probe order. The identity comes
/// first in both flavors, so canonical-layout queries hit on the first
/// probe.
fn probe_tids(row: &InterleaveMetrics) -> impl Iterator<Item = u32> + '_ {
    let num_stored = row.num_stored;
    let flavor = row.flavor;
    (0..row.interleave_step).map(move |k| match flavor {
        InterleaveFlavor::TransversalStored => k,
        InterleaveFlavor::SubgroupStored => k * num_stored,
    })
}

/// Stores the imprints of signature `sid` whose canonical tree is
/// `tree`. The first footprint insertion wins; a later collision within
/// the same signature is the expected symmetry case, a collision across
/// signatures fails loudly.
pub fn add_imprints(db: &mut Database, tree: &MicroTree, sid: u32) -> Result<(), ImprintError> {
    debug_assert_eq!(tree.root & IBIT, 0, "canonical trees carry no root inverter");
    let row = metrics_for(db)?;
    let mut v = [Footprint::ZERO; NEND as usize];

    let stored: Vec<u32> = stored_tids(db, row).collect();
    for tid in stored {
        let enc = db.transform_enc_fwd(tid);
        db.load_eval_base(enc, &mut v);
        let footprint = tree.eval_root(&mut v);

        let (slot, id) = db.lookup_imprint(&footprint)?;
        if id == 0 {
            let iid = db.add_imprint(footprint, sid, tid)?;
            db.index_set(SectionId::ImprintIndex, slot, iid);
        } else {
            let existing = db.imprint(id);
            if existing.sid != sid {
                return Err(ImprintError::DuplicateSid {
                    existing_sid: existing.sid,
                    new_sid: sid,
                    tid,
                });
            }
        }
    }
    Ok(())
}

/// Associative lookup: finds the signature group of `tree` under any of
/// the 9! input permutations. At most `interleaveStep` probes.
pub fn lookup(db: &Database, tree: &MicroTree) -> Result<Option<(u32, u32)>, ImprintError> {
    if db.num(SectionId::Imprint) <= 1 {
        return Ok(None);
    }
    let row = metrics_for(db)?;
    let mut v = [Footprint::ZERO; NEND as usize];

    for probe in probe_tids(row) {
        let enc = db.transform_enc_rev(probe);
        db.load_eval_base(enc, &mut v);
        let footprint = tree.eval_root(&mut v);

        let (_, id) = db.lookup_imprint(&footprint)?;
        if id != 0 {
            let imprint = db.imprint(id);
            let tid = db.compose_transforms(probe, imprint.tid);
            return Ok(Some((imprint.sid, tid)));
        }
    }
    Ok(None)
}

/// Add-if-not-found bulk insertion: probes only the first candidate
/// transform before inserting, which admits false positives across skins
/// of the same function. Only sound for bulk preloads that are followed
/// by a full rescan at a finer interleave.
pub fn add_if_not_found(db: &mut Database, tree: &MicroTree, sid: u32) -> Result<u32, ImprintError> {
    let row = metrics_for(db)?;
    let mut v = [Footprint::ZERO; NEND as usize];

    let first = probe_tids(row).next().expect("interleave rows are non-empty");
    let enc = db.transform_enc_rev(first);
    db.load_eval_base(enc, &mut v);
    let footprint = tree.eval_root(&mut v);
    let (_, id) = db.lookup_imprint(&footprint)?;
    if id != 0 {
        return Ok(db.imprint(id).sid);
    }

    let stored: Vec<u32> = stored_tids(db, row).collect();
    for tid in stored {
        let enc = db.transform_enc_fwd(tid);
        db.load_eval_base(enc, &mut v);
        let footprint = tree.eval_root(&mut v);
        let (slot, id) = db.lookup_imprint(&footprint)?;
        if id == 0 {
            let iid = db.add_imprint(footprint, sid, tid)?;
            db.index_set(SectionId::ImprintIndex, slot, iid);
        }
    }
    Ok(sid)
}

/// Counts the distinct imprints `tree` would store at interleave `row`.
///
/// Footprint collisions across the stored transforms (layout symmetry)
/// shrink the count below `numStored`; the exact number is what the hint
/// section records for storage planning. The versioned `scratch` index is
/// logically cleared per call, so sweeping a whole signature section
/// costs no memsets.
pub fn tally(
    db: &Database,
    tree: &MicroTree,
    row: &InterleaveMetrics,
    scratch: &mut crate::db::index::VersionedIndex,
) -> Result<u32, ImprintError> {
    scratch.bump();
    let mut seen: Vec<Footprint> = Vec::new();
    let mut v = [Footprint::ZERO; NEND as usize];

    let stored: Vec<u32> = stored_tids(db, row).collect();
    for tid in stored {
        db.load_eval_base(db.transform_enc_fwd(tid), &mut v);
        let footprint = tree.eval_root(&mut v);
        let slot = scratch
            .probe(footprint.hash(), "tally", |id| seen[(id - 1) as usize] == footprint)
            .map_err(DbError::IndexFull)?;
        if scratch.get(slot) == 0 {
            seen.push(footprint);
            scratch.set(slot, seen.len() as u32);
        }
    }
    Ok(seen.len() as u32)
}

/// Outcome counters of an imprint rebuild pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct RebuildCounts {
    pub num_empty: u32,
    pub num_unsafe: u32,
    /// Sid the pass stopped at when the section filled under
    /// `--truncate`; 0 when the pass completed.
    pub truncated_at: u32,
}

/// Regenerates the imprint section from the signature section.
///
/// `unsafe_only` restricts the rebuild to empty/unsafe signature groups
/// (the `--unsafe` workflow); `sid_window` further restricts to a
/// `lo..hi` range, 0 meaning unbounded. With `truncate` the pass stops
/// cleanly when free capacity drops below one interleave of imprints.
pub fn rebuild(
    db: &mut Database,
    unsafe_only: bool,
    sid_window: (u32, u32),
    truncate: bool,
) -> Result<RebuildCounts, ImprintError> {
    db.index_clear(SectionId::ImprintIndex);
    db.set_num(SectionId::Imprint, 1);

    let num_signature = db.num(SectionId::Signature);
    let mut counts = RebuildCounts::default();
    if num_signature < 2 {
        return Ok(counts);
    }

    log::info!(
        "rebuilding imprints{}",
        if unsafe_only { " for empty/unsafe signatures" } else { "" }
    );

    let flags = crate::BuildFlags::from_bits(db.creation_flags);
    let mut tree = MicroTree::new(flags);
    let (sid_lo, sid_hi) = sid_window;

    for sid in 1..num_signature {
        if (sid_lo != 0 && sid < sid_lo) || (sid_hi != 0 && sid >= sid_hi) {
            continue;
        }

        let signature = db.signature(sid);
        if !unsafe_only || signature.flags & SIGMASK_SAFE == 0 {
            if truncate
                && db.max(SectionId::Imprint) - db.num(SectionId::Imprint) <= db.interleave
            {
                counts.truncated_at = sid;
                log::warn!(
                    "imprint storage full, truncating at sid={} \"{}\"",
                    sid,
                    signature.name_str()
                );
                break;
            }

            tree.parse_fast(signature.name_str(), crate::tree::DEFAULT_SKIN)
                .map_err(|e| ImprintError::Db(DbError::Corrupt(format!(
                    "signature {} name unparseable: {}",
                    sid, e
                ))))?;

            if lookup(db, &tree)?.is_none() {
                add_imprints(db, &tree, sid)?;
            }
        }

        if signature.first_member == 0 {
            counts.num_empty += 1;
        }
        if signature.flags & SIGMASK_SAFE == 0 {
            counts.num_unsafe += 1;
        }
    }

    log::info!(
        "created imprints: numImprint={} numEmpty={} numUnsafe={}",
        db.num(SectionId::Imprint),
        counts.num_empty,
        counts.num_unsafe
    );
    Ok(counts)
}
