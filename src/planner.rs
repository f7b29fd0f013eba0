// SPDX-License-Identifier: Apache-2.0

//! Section planner and populator.
//!
//! The planner runs once per build against an `(input, output)` database
//! pair. For each section it decides the output capacity and index size,
//! and one of three placements relative to the input:
//!
//! - **inherit** — point at the input's mapped bytes; read-only from then
//!   on;
//! - **rebuild** — allocate empty and regenerate from other sections
//!   after population;
//! - **copy** — allocate writable and copy the input's contents.
//!
//! Capacity rules, per section and in priority order: explicit user
//! override, inherited pass-through, metrics preset raised by 5%,
//! non-empty input pass-through, minimal reserved-entry section. A
//! section that must grow can never stay inherited; a change of
//! interleave invalidates the whole imprint section.

use std::fmt;

use crate::db::layout::{mask_to_text, SectionId, TRANSFORM_MASK};
use crate::db::records::Hint;
use crate::db::{Database, DbError};
use crate::metrics::{
    generator_metrics, imprint_metrics, interleave_metrics, DEFAULT_INTERLEAVE,
};
use crate::primes::{next_prime, raise_percent};
use crate::MAXTRANSFORM;

/// Margin added on top of metrics presets.
const PRESET_MARGIN_PERCENT: u32 = 5;

/// User-supplied capacity overrides; 0 means "let the planner decide".
#[derive(Debug, Clone, Copy, Default)]
pub struct Overrides {
    pub max_signature: u32,
    pub max_hint: u32,
    pub max_imprint: u32,
    pub max_member: u32,
    pub max_pair: u32,
    pub signature_index_size: u32,
    pub hint_index_size: u32,
    pub imprint_index_size: u32,
    pub member_index_size: u32,
    pub pair_index_size: u32,
    pub interleave: u32,
}

/// Build-wide planner inputs.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub overrides: Overrides,
    /// Index/data sizing ratio.
    pub ratio: f64,
    /// No output database: size everything as pass-through.
    pub read_only: bool,
    /// Sections that fit may alias the input instead of copying.
    pub copy_on_write: bool,
    /// QnTF-only normalisation, for metrics preset selection.
    pub pure: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            overrides: Overrides::default(),
            ratio: crate::metrics::DEFAULT_RATIO,
            read_only: false,
            copy_on_write: false,
            pure: false,
        }
    }
}

/// The planner's decision record.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Target capacity per section (index sections: table size).
    pub max: [u32; crate::db::layout::SECTION_COUNT],
    pub interleave: u32,
    pub interleave_step: u32,
    /// Sections taken from the input by pointer.
    pub inherit_mask: u32,
    /// Sections to regenerate after population.
    pub rebuild_mask: u32,
}

#[derive(Debug)]
pub enum PlannerError {
    /// No metrics preset and no user override for a section size.
    NoPreset { option: &'static str },
    /// Output capacity below input occupancy would drop records.
    WouldLoseData { section: &'static str, max: u32, need: u32 },
    BadInterleave(u32),
    Db(DbError),
}

impl fmt::Display for PlannerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlannerError::NoPreset { option } => write!(f, "no preset for {}", option),
            PlannerError::WouldLoseData { section, max, need } => {
                write!(f, "--max{}={} needs to be at least {}", section, max, need)
            }
            PlannerError::BadInterleave(n) => {
                write!(f, "--interleave={} must be one of [{}]", n, crate::metrics::allowed_interleaves())
            }
            PlannerError::Db(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for PlannerError {}

impl From<DbError> for PlannerError {
    fn from(e: DbError) -> Self {
        PlannerError::Db(e)
    }
}

struct DataSectionRule {
    data: SectionId,
    index: SectionId,
    option: &'static str,
    override_max: u32,
    override_index: u32,
    preset: Option<u32>,
}

/// Decides capacities and placements. `inherit_mask`/`rebuild_mask` seed
/// the planner with the tool's requirements (sections it must own,
/// sections it already knows need a rebuild).
pub fn size_sections(
    input: &Database,
    settings: &Settings,
    num_nodes: u32,
    mut inherit_mask: u32,
    mut rebuild_mask: u32,
) -> Result<Plan, PlannerError> {
    inherit_mask &= !rebuild_mask;

    let mut plan = Plan {
        max: [0; crate::db::layout::SECTION_COUNT],
        interleave: 0,
        interleave_step: 0,
        inherit_mask,
        rebuild_mask,
    };

    // Interleave is a setting, not a section: user override wins, else
    // inherit, else default. Any change invalidates the imprints.
    let interleave = if settings.overrides.interleave != 0 {
        settings.overrides.interleave
    } else if input.interleave != 0 {
        input.interleave
    } else {
        DEFAULT_INTERLEAVE
    };
    let row = interleave_metrics(interleave).ok_or(PlannerError::BadInterleave(interleave))?;
    plan.interleave = row.num_stored;
    plan.interleave_step = row.interleave_step;
    if plan.interleave != input.interleave || input.num(SectionId::Imprint) <= 1 {
        // Changed interleave or missing input imprints: the section is
        // unusable as-is and must be regenerated from the signatures.
        plan.rebuild_mask |= SectionId::Imprint.mask() | SectionId::ImprintIndex.mask();
        plan.inherit_mask &= !plan.rebuild_mask;
    }

    let generator_preset = generator_metrics(settings.pure, num_nodes);
    let rules = [
        DataSectionRule {
            data: SectionId::Signature,
            index: SectionId::SignatureIndex,
            option: "signature",
            override_max: settings.overrides.max_signature,
            override_index: settings.overrides.signature_index_size,
            preset: generator_preset.map(|m| m.num_signature),
        },
        DataSectionRule {
            data: SectionId::Hint,
            index: SectionId::HintIndex,
            option: "hint",
            override_max: settings.overrides.max_hint,
            override_index: settings.overrides.hint_index_size,
            preset: generator_preset.map(|m| m.num_hint),
        },
        DataSectionRule {
            data: SectionId::Imprint,
            index: SectionId::ImprintIndex,
            option: "imprint",
            override_max: settings.overrides.max_imprint,
            override_index: settings.overrides.imprint_index_size,
            preset: imprint_metrics(settings.pure, plan.interleave, num_nodes)
                .map(|n| u32::try_from(n).unwrap_or(u32::MAX)),
        },
        DataSectionRule {
            data: SectionId::Member,
            index: SectionId::MemberIndex,
            option: "member",
            override_max: settings.overrides.max_member,
            override_index: settings.overrides.member_index_size,
            preset: generator_preset.map(|m| m.num_member),
        },
        DataSectionRule {
            data: SectionId::Pair,
            index: SectionId::PairIndex,
            option: "pair",
            override_max: settings.overrides.max_pair,
            override_index: settings.overrides.pair_index_size,
            preset: generator_preset.map(|m| m.num_pair),
        },
    ];

    for rule in &rules {
        size_one_section(input, settings, rule, &mut plan)?;
    }

    // Transforms are never resized or invalidated.
    for id in crate::db::layout::ALL_SECTIONS {
        if TRANSFORM_MASK & id.mask() != 0 {
            plan.max[id as usize] = input.max(id);
        }
    }
    if input.has_transforms() {
        plan.inherit_mask |= TRANSFORM_MASK;
    } else {
        // Genesis build: the populator creates the table from scratch.
        plan.rebuild_mask |= TRANSFORM_MASK;
    }

    plan.inherit_mask &= !plan.rebuild_mask;

    log::debug!(
        "planned sections: interleave={} inherit={} rebuild={}",
        plan.interleave,
        mask_to_text(plan.inherit_mask),
        mask_to_text(plan.rebuild_mask),
    );

    // Output data must be large enough to fit input data.
    for rule in &rules {
        let need = input.num(rule.data);
        let max = plan.max[rule.data as usize];
        if max < need {
            return Err(PlannerError::WouldLoseData { section: rule.option, max, need });
        }
    }

    Ok(plan)
}

fn size_one_section(
    input: &Database,
    settings: &Settings,
    rule: &DataSectionRule,
    plan: &mut Plan,
) -> Result<(), PlannerError> {
    let data = rule.data;
    let index = rule.index;
    let input_num = input.num(data);

    // Data capacity.
    let max = if rule.override_max != 0 {
        rule.override_max
    } else if plan.inherit_mask & data.mask() != 0 {
        input_num
    } else if !settings.read_only {
        let preset = rule.preset.ok_or(PlannerError::NoPreset { option: rule.option })?;
        raise_percent(preset, PRESET_MARGIN_PERCENT)
    } else if input_num != 0 {
        input_num
    } else {
        1
    };
    plan.max[data as usize] = max;

    if max > input_num {
        // The section wants to grow; an inherited pointer cannot.
        plan.inherit_mask &= !data.mask();
    } else if settings.copy_on_write {
        plan.inherit_mask |= data.mask();
    }

    // Index size.
    let input_index = input.max(index);
    let index_size = if max == 0 {
        0
    } else if rule.override_index != 0 {
        rule.override_index
    } else if plan.inherit_mask & index.mask() != 0 {
        input_index
    } else if !settings.read_only {
        u32::try_from(next_prime((max as f64 * settings.ratio) as u64)).unwrap_or(u32::MAX)
    } else if input_index != 0 {
        input_index
    } else {
        1
    };
    plan.max[index as usize] = index_size;

    if index_size != input_index {
        plan.rebuild_mask |= index.mask();
        plan.inherit_mask &= !plan.rebuild_mask;
    } else if settings.copy_on_write {
        plan.inherit_mask |= index.mask();
    }

    Ok(())
}

/// Executes a plan: allocates owned sections, then inherits, clears or
/// copies each section from the input.
pub fn populate(
    output: &mut Database,
    input: &Database,
    plan: &Plan,
    settings: &Settings,
) -> Result<(), PlannerError> {
    log::debug!(
        "populating: copyOnWrite={} inherit={} rebuild={}",
        settings.copy_on_write,
        mask_to_text(plan.inherit_mask),
        mask_to_text(plan.rebuild_mask),
    );

    output.interleave = plan.interleave;
    output.interleave_step = plan.interleave_step;

    // Transforms first: inherited wholesale or generated for a genesis
    // build; they are never copied piecemeal. An input that owns its
    // table (in-memory genesis) cannot be aliased, so regenerate.
    if plan.rebuild_mask & TRANSFORM_MASK != 0 || input.alloc_mask & TRANSFORM_MASK != 0 {
        output.create_transforms()?;
    } else {
        assert!(input.has_transforms(), "input database lacks a transform section");
        assert_eq!(input.num(SectionId::TransformNameFwd), MAXTRANSFORM);
        for id in crate::db::layout::ALL_SECTIONS {
            if TRANSFORM_MASK & id.mask() != 0 {
                output.inherit_section(id, input);
            }
        }
    }

    let data_sections = [
        (SectionId::Signature, SectionId::SignatureIndex),
        (SectionId::Hint, SectionId::HintIndex),
        (SectionId::Imprint, SectionId::ImprintIndex),
        (SectionId::Member, SectionId::MemberIndex),
        (SectionId::Pair, SectionId::PairIndex),
    ];

    for (data, index) in data_sections {
        let max = plan.max[data as usize];
        if max == 0 {
            continue;
        }

        if plan.inherit_mask & data.mask() != 0 {
            output.inherit_section(data, input);
        } else if plan.rebuild_mask & data.mask() != 0 {
            // Allocated empty; regenerated by the post-population pass.
            output.alloc_section(data, max);
        } else if input.num(data) == 0 {
            output.alloc_section(data, max); // reserved entry only
        } else if max <= input.num(data) && settings.copy_on_write {
            output.inherit_section(data, input);
        } else {
            log::info!("copying {} section", data.name());
            output.alloc_section(data, max);
            output.copy_section(data, input);
        }

        let index_size = plan.max[index as usize];
        if index_size == 0 {
            continue;
        }
        if plan.inherit_mask & index.mask() != 0 {
            output.inherit_section(index, input);
        } else if plan.rebuild_mask & index.mask() != 0 {
            output.alloc_section(index, index_size);
        } else if input.max(index) == 0 {
            output.alloc_section(index, index_size);
        } else if settings.copy_on_write {
            output.inherit_section(index, input);
        } else {
            output.alloc_section(index, index_size);
            output.copy_section(index, input);
        }
    }

    Ok(())
}

/// Regenerates the level-1 hash indices named in `mask` from their data
/// sections. The imprint section has its own rebuild in [`crate::imprint`].
pub fn rebuild_indices(db: &mut Database, mask: u32) -> Result<(), DbError> {
    if mask & SectionId::SignatureIndex.mask() != 0 {
        db.index_clear(SectionId::SignatureIndex);
        for sid in 1..db.num(SectionId::Signature) {
            let name = db.signature(sid);
            let (slot, existing) = db.lookup_signature(name.name_str())?;
            debug_assert_eq!(existing, 0, "duplicate signature name");
            db.index_set(SectionId::SignatureIndex, slot, sid);
        }
    }
    if mask & SectionId::MemberIndex.mask() != 0 {
        db.index_clear(SectionId::MemberIndex);
        for mid in 1..db.num(SectionId::Member) {
            let member = db.member(mid);
            if member.sid == 0 {
                continue; // freed slot
            }
            let (slot, existing) = db.lookup_member(member.name_str())?;
            debug_assert_eq!(existing, 0, "duplicate member name");
            db.index_set(SectionId::MemberIndex, slot, mid);
        }
    }
    if mask & SectionId::PairIndex.mask() != 0 {
        db.index_clear(SectionId::PairIndex);
        for pid in 1..db.num(SectionId::Pair) {
            let pair = db.pair(pid);
            let (slot, existing) = db.lookup_pair(pair.mid, pair.tid)?;
            debug_assert_eq!(existing, 0, "duplicate pair");
            db.index_set(SectionId::PairIndex, slot, pid);
        }
    }
    if mask & SectionId::HintIndex.mask() != 0 {
        db.index_clear(SectionId::HintIndex);
        for hid in 1..db.num(SectionId::Hint) {
            let hint: Hint = db.hint(hid);
            let (slot, existing) = db.lookup_hint(&hint)?;
            if existing == 0 {
                db.index_set(SectionId::HintIndex, slot, hid);
            }
        }
    }
    if mask & SectionId::ImprintIndex.mask() != 0 {
        db.index_clear(SectionId::ImprintIndex);
        for iid in 1..db.num(SectionId::Imprint) {
            let imprint = db.imprint(iid);
            let (slot, existing) = db.lookup_imprint(&imprint.footprint)?;
            if existing == 0 {
                db.index_set(SectionId::ImprintIndex, slot, iid);
            }
        }
    }
    Ok(())
}

/// Checks an index still has a free slot after a build; a full table can
/// no longer answer misses.
pub fn index_has_free_slot(db: &Database, index: SectionId) -> bool {
    db.index(index).iter().any(|&slot| slot == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::layout::SectionId;

    fn empty_input() -> Database {
        let mut db = Database::new();
        db.create_transforms().unwrap();
        db
    }

    fn settings() -> Settings {
        Settings::default()
    }

    #[test]
    fn test_plan_from_presets() {
        let input = empty_input();
        let plan = size_sections(&input, &settings(), 1, 0, 0).unwrap();

        // numSignature preset 8 raised by 5%: ceil(8.4) = 9.
        assert_eq!(plan.max[SectionId::Signature as usize], 9);
        // Index is the next prime >= max * ratio.
        let expect = next_prime((9.0 * 5.0) as u64) as u32;
        assert_eq!(plan.max[SectionId::SignatureIndex as usize], expect);
        assert_eq!(plan.interleave, 504);
        assert_eq!(plan.interleave_step, 720);
        // Fresh imprints always rebuild.
        assert!(plan.rebuild_mask & SectionId::Imprint.mask() != 0);
    }

    #[test]
    fn test_user_override_wins() {
        let input = empty_input();
        let mut s = settings();
        s.overrides.max_member = 1000;
        s.overrides.member_index_size = 2003;
        let plan = size_sections(&input, &s, 1, 0, 0).unwrap();
        assert_eq!(plan.max[SectionId::Member as usize], 1000);
        assert_eq!(plan.max[SectionId::MemberIndex as usize], 2003);
    }

    #[test]
    fn test_bad_interleave_rejected() {
        let input = empty_input();
        let mut s = settings();
        s.overrides.interleave = 123;
        match size_sections(&input, &s, 1, 0, 0) {
            Err(PlannerError::BadInterleave(123)) => {}
            other => panic!("expected BadInterleave, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_no_preset_is_fatal() {
        let input = empty_input();
        // No metrics row for 7-node builds; no override given.
        match size_sections(&input, &settings(), 7, 0, 0) {
            Err(PlannerError::NoPreset { .. }) => {}
            other => panic!("expected NoPreset, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_growing_section_not_inherited() {
        let mut input = Database::new();
        input.create_transforms().unwrap();
        input.alloc_section(SectionId::Signature, 4);
        input.alloc_section(SectionId::SignatureIndex, 7);
        input.add_signature("ab+").unwrap();

        // Seed the planner with everything inheritable.
        let all = SectionId::Signature.mask() | SectionId::SignatureIndex.mask();
        let plan = size_sections(&input, &settings(), 1, all, 0).unwrap();
        // Inherited pass-through keeps input.num, which never grows.
        assert_eq!(plan.max[SectionId::Signature as usize], input.num(SectionId::Signature));
        assert!(plan.inherit_mask & SectionId::Signature.mask() != 0);

        // Without the inherit seed the preset grows the section, which
        // must clear it from the inherit set.
        let plan = size_sections(&input, &settings(), 1, 0, 0).unwrap();
        assert!(plan.max[SectionId::Signature as usize] > input.num(SectionId::Signature));
        assert!(plan.inherit_mask & SectionId::Signature.mask() == 0);
    }

    #[test]
    fn test_monotonic_capacity() {
        // Property: output.max >= input.num for every data section, or
        // the planner refuses.
        let mut input = Database::new();
        input.create_transforms().unwrap();
        input.alloc_section(SectionId::Member, 64);
        input.alloc_section(SectionId::MemberIndex, 331);
        for i in 0..40 {
            input.add_member(&format!("m{}", i)).unwrap();
        }
        // 4-node presets dwarf the input; capacity must still cover it.
        let plan = size_sections(&input, &settings(), 4, 0, 0).unwrap();
        assert!(plan.max[SectionId::Member as usize] >= input.num(SectionId::Member));

        // 1-node presets are smaller than the input and would drop
        // records; that is refused, never silently truncated.
        match size_sections(&input, &settings(), 1, 0, 0) {
            Err(PlannerError::WouldLoseData { section: "member", .. }) => {}
            other => panic!("expected WouldLoseData, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_undersize_override_would_lose_data() {
        let mut input = Database::new();
        input.create_transforms().unwrap();
        input.alloc_section(SectionId::Member, 64);
        input.alloc_section(SectionId::MemberIndex, 331);
        for i in 0..40 {
            input.add_member(&format!("m{}", i)).unwrap();
        }
        let mut s = settings();
        s.overrides.max_member = 10;
        match size_sections(&input, &s, 1, 0, 0) {
            Err(PlannerError::WouldLoseData { section: "member", max: 10, need: 41 }) => {}
            other => panic!("expected WouldLoseData, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_interleave_change_rebuilds_imprints() {
        let mut input = Database::new();
        input.create_transforms().unwrap();
        input.interleave = 504;
        input.interleave_step = 720;
        let mut s = settings();
        s.overrides.interleave = 120;
        let plan = size_sections(&input, &s, 1, 0, 0).unwrap();
        assert_eq!(plan.interleave, 120);
        assert!(plan.rebuild_mask & SectionId::Imprint.mask() != 0);

        // Same interleave: imprints stay valid.
        s.overrides.interleave = 504;
        let plan = size_sections(&input, &s, 1, 0, 0).unwrap();
        assert_eq!(plan.interleave, 504);
    }

    #[test]
    fn test_populate_copies_and_allocates() {
        let mut input = Database::new();
        input.create_transforms().unwrap();
        input.interleave = 504;
        input.interleave_step = 720;
        input.alloc_section(SectionId::Signature, 8);
        input.alloc_section(SectionId::SignatureIndex, 43);
        let (slot, _) = input.lookup_signature("ab+").unwrap();
        let sid = input.add_signature("ab+").unwrap();
        input.index_set(SectionId::SignatureIndex, slot, sid);

        let s = settings();
        let plan = size_sections(&input, &s, 1, 0, 0).unwrap();
        let mut output = Database::new();
        output.creation_flags = input.creation_flags;
        populate(&mut output, &input, &plan, &s).unwrap();

        assert_eq!(output.num(SectionId::Signature), 2);
        assert_eq!(output.signature(sid).name_str(), "ab+");
        assert!(output.alloc_mask & SectionId::Signature.mask() != 0);
        // An in-memory input cannot be aliased; the table regenerates.
        assert!(output.has_transforms());
        assert_eq!(output.transform_name_fwd(0), "abcdefghi");

        // The signature index changed size (prime of the grown max), so
        // it was scheduled for rebuild and left empty.
        assert!(plan.rebuild_mask & SectionId::SignatureIndex.mask() != 0);
        rebuild_indices(&mut output, plan.rebuild_mask).unwrap();
        let (_, found) = output.lookup_signature("ab+").unwrap();
        assert_eq!(found, sid);
    }
}
