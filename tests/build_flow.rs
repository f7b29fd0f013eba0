// SPDX-License-Identifier: Apache-2.0

//! End-to-end build scenarios: genesis builds, collection over a saved
//! database, truncation, and associative lookups through the mapped
//! file.

use std::path::Path;

use microfractal::db::layout::SectionId;
use microfractal::db::records::{MEMMASK_SAFE, SIGMASK_SAFE};
use microfractal::db::Database;
use microfractal::generator::{self, CandidateSink, Window};
use microfractal::imprint;
use microfractal::members::{seed_signatures, MemberEngine};
use microfractal::planner::{self, Settings};
use microfractal::tree::{MicroTree, DEFAULT_SKIN};
use microfractal::BuildFlags;

/// Drives a member engine from a candidate stream.
struct EngineSink<'e, 'db> {
    engine: &'e mut MemberEngine<'db>,
}

impl CandidateSink for EngineSink<'_, '_> {
    fn found_tree(
        &mut self,
        tree: &MicroTree,
        name: &str,
        num_placeholder: u32,
        num_endpoint: u32,
        num_back_ref: u32,
    ) -> anyhow::Result<bool> {
        let (keep_going, _) = self
            .engine
            .found_tree(tree, name, num_placeholder, num_endpoint, num_back_ref)?;
        self.engine.progress += 1;
        Ok(keep_going)
    }
}

/// A genesis build: transforms, the reserved signature groups, their
/// imprints and the two seed members, finalised and saved.
fn build_genesis(path: &Path) {
    let flags = BuildFlags::default();
    let input = Database::new();
    let settings = Settings::default();

    let plan = planner::size_sections(&input, &settings, 0, 0, 0).unwrap();
    let mut store = Database::new();
    store.creation_flags = flags.to_bits();
    planner::populate(&mut store, &input, &plan, &settings).unwrap();

    seed_signatures(&mut store).unwrap();
    imprint::rebuild(&mut store, false, (0, 0), false).unwrap();

    {
        let mut engine = MemberEngine::new(&mut store, flags, false);
        let mut sink = EngineSink { engine: &mut engine };
        let stats = generator::seed_candidates(flags, &mut sink).unwrap();
        assert_eq!(stats.num_read, 2);
        assert!(!stats.stopped);
        engine.finalise().unwrap();

        // The 0-node dataset: exactly the two reserved members, both
        // safe, both groups safe, nothing empty.
        assert_eq!(engine.counts.num_empty, 0);
        assert_eq!(engine.counts.num_unsafe, 0);
    }

    assert_eq!(store.num(SectionId::Member), 3); // reserved + "0" + "a"
    let zero = store.member(1);
    let variable = store.member(2);
    assert_eq!(zero.name_str(), "0");
    assert_eq!(zero.sid, 1);
    assert_eq!(variable.name_str(), "a");
    assert_eq!(variable.sid, 2);
    assert!(zero.flags & MEMMASK_SAFE != 0);
    assert!(variable.flags & MEMMASK_SAFE != 0);
    assert!(store.signature(1).flags & SIGMASK_SAFE != 0);
    assert!(store.signature(2).flags & SIGMASK_SAFE != 0);

    store.save(path).unwrap();
}

#[test]
fn test_genesis_build_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("0n9.db");
    build_genesis(&path);

    let db = Database::open(&path).unwrap();
    assert!(db.has_transforms());
    assert_eq!(db.interleave, 504);
    assert_eq!(db.num(SectionId::Signature), 3);
    assert_eq!(db.num(SectionId::Member), 3);

    // Lookups resolve through the mapped, borrowed sections.
    let (_, sid) = db.lookup_signature("a").unwrap();
    assert_eq!(sid, 2);
    let (_, mid) = db.lookup_member("0").unwrap();
    assert_eq!(mid, 1);

    // The associative index answers for any relabelling of a seeded
    // group.
    let mut query = MicroTree::new(BuildFlags::default());
    query.parse_fast("a", "fbcdeaghi").unwrap();
    let (sid, _tid) = imprint::lookup(&db, &query).unwrap().unwrap();
    assert_eq!(sid, 2);
}

/// Grows a saved genesis database with 1-node groups and collects their
/// members from a candidate list.
#[test]
fn test_collect_members_over_reopened_database() {
    let dir = tempfile::tempdir().unwrap();
    let genesis = dir.path().join("0n9.db");
    build_genesis(&genesis);

    let input = Database::open(&genesis).unwrap();
    let flags = BuildFlags::default();
    let mut settings = Settings::default();
    // The 1-node groups are added below; size for them.
    settings.overrides.max_signature = 16;

    let inherit = SectionId::Hint.mask() | SectionId::HintIndex.mask();
    let plan = planner::size_sections(&input, &settings, 1, inherit, 0).unwrap();
    let mut store = Database::new();
    store.creation_flags = input.creation_flags;
    planner::populate(&mut store, &input, &plan, &settings).unwrap();
    planner::rebuild_indices(
        &mut store,
        plan.rebuild_mask
            & (SectionId::SignatureIndex.mask()
                | SectionId::MemberIndex.mask()
                | SectionId::PairIndex.mask()),
    )
    .unwrap();

    // Register the 1-node signature groups the collection run targets.
    let mut tree = MicroTree::new(flags);
    for name in ["ab+", "ab>", "ab^", "ab&", "abc!", "abc?"] {
        let (slot, existing) = store.lookup_signature(name).unwrap();
        assert_eq!(existing, 0);
        let sid = store.add_signature(name).unwrap();
        tree.parse_fast(name, DEFAULT_SKIN).unwrap();
        let mut signature = store.signature(sid);
        signature.size = tree.node_count() as u8;
        let (nph, nep, nbr) = microfractal::tree::count_name_features(name);
        signature.num_placeholder = nph as u8;
        signature.num_endpoint = nep as u8;
        signature.num_back_ref = nbr as u8;
        store.set_signature(sid, signature);
        store.index_set(SectionId::SignatureIndex, slot, sid);
    }
    imprint::rebuild(&mut store, false, (0, 0), false).unwrap();

    // Candidate list: seeds first (components must exist before their
    // parents), then the 1-node structures, then noise.
    let list = dir.path().join("candidates.lst");
    std::fs::write(
        &list,
        "0\na\nab+\nab>\nab^\nab&\nabc!\nab+\n",
    )
    .unwrap();

    let counts = {
        let mut engine = MemberEngine::new(&mut store, flags, false);
        let mut sink = EngineSink { engine: &mut engine };
        let stats =
            generator::load_candidates(&list, Window::default(), flags, &mut sink).unwrap();
        assert_eq!(stats.num_read, 8);
        assert!(!stats.stopped);
        // "0" and "a" already arrived with the input database, and
        // "ab+" repeats within the list.
        assert_eq!(engine.counts.skip_duplicate, 3);
        engine.finalise().unwrap();
        engine.counts
    };

    // Every fed structure became a safe member of a safe group.
    for name in ["0", "a", "ab+", "ab>", "ab^", "ab&", "abc!"] {
        let (_, mid) = store.lookup_member(name).unwrap();
        assert_ne!(mid, 0, "{} missing", name);
        let member = store.member(mid);
        assert!(member.flags & MEMMASK_SAFE != 0, "{} unsafe", name);
        assert!(
            store.signature(member.sid).flags & SIGMASK_SAFE != 0,
            "group of {} unsafe",
            name
        );
    }
    // "abc?" received no candidate and stays empty and unsafe.
    assert_eq!(counts.num_empty, 1);
    assert_eq!(counts.num_unsafe, 1);

    // Every index keeps at least one empty slot after a build.
    for index in [
        SectionId::SignatureIndex,
        SectionId::MemberIndex,
        SectionId::PairIndex,
        SectionId::ImprintIndex,
    ] {
        assert!(planner::index_has_free_slot(&store, index), "{:?} full", index);
    }

    // Survives a save/open cycle with chains intact.
    let output = dir.path().join("1n9.db");
    store.save(&output).unwrap();
    let reread = Database::open(&output).unwrap();
    let (_, sid) = reread.lookup_signature("ab^").unwrap();
    let first = reread.signature(sid).first_member;
    assert_ne!(first, 0);
    assert_eq!(reread.member(first).sid, sid);
}

#[test]
fn test_truncation_saves_partial_database() {
    let dir = tempfile::tempdir().unwrap();
    let genesis = dir.path().join("0n9.db");
    build_genesis(&genesis);

    let input = Database::open(&genesis).unwrap();
    let flags = BuildFlags::default();
    let mut settings = Settings::default();
    settings.overrides.max_signature = 16;
    // Deliberately small imprint section.
    settings.overrides.max_imprint = 60;

    let plan = planner::size_sections(&input, &settings, 1, 0, 0).unwrap();
    let mut store = Database::new();
    store.creation_flags = input.creation_flags;
    planner::populate(&mut store, &input, &plan, &settings).unwrap();
    planner::rebuild_indices(
        &mut store,
        plan.rebuild_mask
            & (SectionId::SignatureIndex.mask()
                | SectionId::MemberIndex.mask()
                | SectionId::PairIndex.mask()),
    )
    .unwrap();

    let mut tree = MicroTree::new(flags);
    for name in ["ab+"] {
        let (slot, _) = store.lookup_signature(name).unwrap();
        let sid = store.add_signature(name).unwrap();
        tree.parse_fast(name, DEFAULT_SKIN).unwrap();
        let mut signature = store.signature(sid);
        signature.size = tree.node_count() as u8;
        store.set_signature(sid, signature);
        store.index_set(SectionId::SignatureIndex, slot, sid);
    }
    // The three groups fit in 60 imprints; the engine's guard is what
    // trips, not the rebuild's.
    imprint::rebuild(&mut store, false, (0, 0), false).unwrap();

    let list = dir.path().join("candidates.lst");
    std::fs::write(&list, "0\na\nab+\n").unwrap();

    let truncated = {
        let mut engine = MemberEngine::new(&mut store, flags, false);
        engine.truncate = true;
        let mut sink = EngineSink { engine: &mut engine };
        let stats =
            generator::load_candidates(&list, Window::default(), flags, &mut sink).unwrap();
        // "0" and "a" dedupe against the input; the first fresh
        // candidate trips the guard and stops the stream.
        assert!(stats.stopped);
        engine.truncated.clone()
    };
    let (_, name) = truncated.expect("stream must truncate");
    assert_eq!(name, "ab+");

    // The partial database still saves and reopens cleanly.
    let output = dir.path().join("partial.db");
    store.save(&output).unwrap();
    let reread = Database::open(&output).unwrap();
    assert_eq!(reread.num(SectionId::Signature), store.num(SectionId::Signature));
}

#[test]
fn test_imprint_completeness_through_saved_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("0n9.db");
    build_genesis(&path);
    let db = Database::open(&path).unwrap();

    // Associative lookup of the canonical tree relabelled through a
    // sample of transforms; every one must resolve (§interleave
    // coverage), including coset boundaries of the 504/720 row.
    let mut query = MicroTree::new(BuildFlags::default());
    for relabel in [0u32, 1, 719, 720, 721, 5039, 5040, 100_003, 362_879] {
        let skin = microfractal::transform::name_of(&microfractal::transform::perm_from_tid(relabel));
        query.parse_fast("a", &skin).unwrap();
        let hit = imprint::lookup(&db, &query).unwrap();
        let (sid, tid) = hit.unwrap_or_else(|| panic!("tid {} missed", relabel));
        assert_eq!(sid, 2);
        // The answer reconstructs the query's footprint.
        let mut v = [microfractal::footprint::Footprint::ZERO; microfractal::NEND as usize];
        let mut canonical = MicroTree::new(BuildFlags::default());
        canonical.parse_fast("a", DEFAULT_SKIN).unwrap();
        db.load_eval_base(db.transform_enc_fwd(tid), &mut v);
        let via_answer = canonical.eval_root(&mut v);
        db.load_eval_base(db.transform_enc_fwd(0), &mut v);
        let direct = query.eval_root(&mut v);
        assert_eq!(via_answer, direct, "tid {}", relabel);
    }
}
