// SPDX-License-Identifier: Apache-2.0

//! The member engine: admits candidate trees into signature groups, and
//! the finaliser that compacts, sorts and re-indexes the member section
//! at the end of a writable build.
//!
//! Group semantics: a member is *safe* when its three component subtrees
//! (tails) and all of its head structures resolve to safe members; a
//! signature group is safe when it holds at least one safe member. An
//! unsafe group collects every size-bounded candidate; the first safe
//! candidate flushes the collected unsafe members and locks the group to
//! safe candidates from then on.
//!
//! Freed member slots are chained on an intrusive free-list through
//! `next_member` and reused, so member ids stay dense until the
//! finaliser renumbers them.

use std::cmp::Ordering;
use std::fmt;

use zerocopy::FromZeros;

use crate::db::layout::SectionId;
use crate::db::records::{
    Member, MAXHEAD, MEMMASK_COMP, MEMMASK_DEPR, MEMMASK_SAFE, SIGMASK_SAFE,
};
use crate::db::{Database, DbError};
use crate::imprint::{self, ImprintError};
use crate::tree::{score_name, MicroTree, TreeError, DEFAULT_SKIN};
use crate::{BuildFlags, IBIT, KSTART, NEND, NSTART};

#[derive(Debug)]
pub enum EngineError {
    Db(DbError),
    Imprint(ImprintError),
    Tree(TreeError),
    Corrupt(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Db(e) => write!(f, "{}", e),
            EngineError::Imprint(e) => write!(f, "{}", e),
            EngineError::Tree(e) => write!(f, "{}", e),
            EngineError::Corrupt(what) => write!(f, "member engine: {}", what),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<DbError> for EngineError {
    fn from(e: DbError) -> Self {
        EngineError::Db(e)
    }
}

impl From<ImprintError> for EngineError {
    fn from(e: ImprintError) -> Self {
        EngineError::Imprint(e)
    }
}

impl From<TreeError> for EngineError {
    fn from(e: TreeError) -> Self {
        EngineError::Tree(e)
    }
}

/// What happened to one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Name already in the member index.
    Duplicate,
    /// Storage guard tripped; the generator is asked to stop.
    Truncated,
    /// No signature group matches under any permutation.
    NotInCatalogue,
    /// Larger than the group allows; `cmp` is `'*'`.
    SkipSize { sid: u32 },
    /// Unsafe candidate against a safe group.
    SkipUnsafe { sid: u32 },
    /// Admitted. `cmp` is one of `'+' '=' '>' '!'`.
    Accepted { sid: u32, mid: u32, cmp: char },
}

impl Decision {
    /// The comparison glyph of the candidate-vs-group outcome.
    pub fn cmp_char(&self) -> char {
        match self {
            Decision::Duplicate => 'd',
            Decision::Truncated => 't',
            Decision::NotInCatalogue => ' ',
            Decision::SkipSize { .. } => '*',
            Decision::SkipUnsafe { .. } => '<',
            Decision::Accepted { cmp, .. } => *cmp,
        }
    }
}

/// Collection-run statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct EngineCounts {
    pub num_empty: u32,
    pub num_unsafe: u32,
    pub skip_duplicate: u64,
    pub skip_size: u64,
    pub skip_unsafe: u64,
}

pub struct MemberEngine<'a> {
    pub db: &'a mut Database,
    pub flags: BuildFlags,
    /// No mutations: groups get a fake single member so accounting works.
    pub read_only: bool,
    /// Stop the generator cleanly when storage is nearly full.
    pub truncate: bool,
    /// Group by scalar name score instead of node count.
    pub use_score: bool,
    /// Per-signature admission bound: node count or score of the group's
    /// current best member.
    safe_scores: Vec<u32>,
    free_member_root: u32,
    pub counts: EngineCounts,
    /// Progress of the candidate stream, for truncation reporting.
    pub progress: u64,
    /// Where the stream was truncated, with the candidate name.
    pub truncated: Option<(u64, String)>,
    scratch: MicroTree,
    scratch2: MicroTree,
}

impl<'a> MemberEngine<'a> {
    pub fn new(db: &'a mut Database, flags: BuildFlags, read_only: bool) -> Self {
        let max_signature = db.max(SectionId::Signature) as usize;
        let mut engine = Self {
            db,
            flags,
            read_only,
            truncate: false,
            use_score: false,
            safe_scores: vec![0; max_signature.max(1)],
            free_member_root: 0,
            counts: EngineCounts::default(),
            progress: 0,
            truncated: None,
            scratch: MicroTree::new(flags),
            scratch2: MicroTree::new(flags),
        };
        engine.init_safe_scores();
        engine.recount_groups();
        engine
    }

    fn metric_of(&self, tree_size: u32, name: &str) -> u32 {
        if self.use_score {
            score_name(name)
        } else {
            tree_size
        }
    }

    /// Seeds the admission bounds from the current group-best members.
    fn init_safe_scores(&mut self) {
        for sid in 1..self.db.num(SectionId::Signature) {
            let signature = self.db.signature(sid);
            if signature.flags & SIGMASK_SAFE == 0 || signature.first_member == 0 {
                continue;
            }
            let best = self.db.member(signature.first_member);
            let name = best.name_str().to_string();
            if self.scratch.parse_fast(&name, DEFAULT_SKIN).is_ok() {
                self.safe_scores[sid as usize] =
                    self.metric_of(self.scratch.node_count(), &name);
            }
        }
    }

    /// Recounts empty and unsafe groups from the signature section.
    pub fn recount_groups(&mut self) {
        self.counts.num_empty = 0;
        self.counts.num_unsafe = 0;
        for sid in 1..self.db.num(SectionId::Signature) {
            let signature = self.db.signature(sid);
            if signature.first_member == 0 {
                self.counts.num_empty += 1;
            }
            if signature.flags & SIGMASK_SAFE == 0 {
                self.counts.num_unsafe += 1;
            }
        }
    }

    /// Tests whether a candidate can join a signature group and admits it
    /// when possible. Returns `false` when the generator should stop.
    pub fn found_tree(
        &mut self,
        tree: &MicroTree,
        name: &str,
        num_placeholder: u32,
        num_endpoint: u32,
        num_back_ref: u32,
    ) -> Result<(bool, Decision), EngineError> {
        if self.truncated.is_some() {
            return Ok((false, Decision::Truncated));
        }

        // Duplicate by name.
        let (_, existing) = self.db.lookup_member(name)?;
        if existing != 0 {
            self.counts.skip_duplicate += 1;
            return Ok((true, Decision::Duplicate));
        }

        // Storage guard: stop cleanly before an overflow would abort.
        if self.truncate {
            let imprint_free =
                self.db.max(SectionId::Imprint) - self.db.num(SectionId::Imprint);
            let signature_free =
                self.db.max(SectionId::Signature) - self.db.num(SectionId::Signature);
            if imprint_free <= self.db.interleave || signature_free <= 1 {
                self.truncated = Some((self.progress, name.to_string()));
                return Ok((false, Decision::Truncated));
            }
        }

        // Classify: which group does this tree inhabit?
        let (sid, tid) = if self.flags.ainf && !self.read_only {
            // Bulk mode: insert-if-absent against the candidate stream.
            // Newly inserted footprints come back with the sentinel sid.
            let mark_sid = self.db.num(SectionId::Signature);
            let sid = imprint::add_if_not_found(self.db, tree, mark_sid)?;
            if sid >= mark_sid {
                return Ok((true, Decision::NotInCatalogue));
            }
            (sid, 0)
        } else {
            match imprint::lookup(self.db, tree)? {
                Some(hit) => hit,
                None => return Ok((true, Decision::NotInCatalogue)),
            }
        };

        let signature = self.db.signature(sid);
        let size = tree.node_count();
        let metric = self.metric_of(size, name);

        // Early size reject: larger candidates can never win.
        let oversize = if signature.flags & SIGMASK_SAFE != 0 {
            metric > self.safe_scores[sid as usize]
        } else {
            size > signature.size as u32 + 1
        };
        if oversize {
            self.counts.skip_size += 1;
            return Ok((true, Decision::SkipSize { sid }));
        }

        // Head/tail analysis on a detached record; the member section may
        // be read-only.
        let mut candidate = Member {
            name: crate::db::records::pack_name(name),
            sid,
            tid,
            size: size as u8,
            num_placeholder: num_placeholder as u8,
            num_endpoint: num_endpoint as u8,
            num_back_ref: num_back_ref as u8,
            flags: 0,
            qmt: 0,
            tmt: 0,
            fmt: 0,
            heads: [0; MAXHEAD],
            next_member: 0,
        };
        let future_mid = if self.free_member_root != 0 {
            self.free_member_root
        } else {
            self.db.num(SectionId::Member)
        };
        self.find_head_tail(&mut candidate, tree, future_mid)?;

        // Decide. Safety of the candidate is all that matters here; an
        // unsafe group collects unsafe candidates regardless of which
        // component failed to resolve.
        let group_safe = signature.flags & SIGMASK_SAFE != 0;
        let candidate_safe = candidate.flags & MEMMASK_SAFE != 0;
        let cmp = match (group_safe, candidate_safe) {
            (true, false) => {
                self.counts.skip_unsafe += 1;
                return Ok((true, Decision::SkipUnsafe { sid }));
            }
            (true, true) => {
                if self.use_score && metric < self.safe_scores[sid as usize] {
                    '!' // scoring prefers the candidate over the group-best
                } else {
                    '+'
                }
            }
            (false, true) => '>',
            (false, false) => '=',
        };

        // Promotion flushes the collected members.
        if cmp == '>' || cmp == '!' {
            self.flush_group(sid)?;
        }

        let mut signature = self.db.signature(sid);
        if cmp == '>' {
            signature.flags |= SIGMASK_SAFE;
            self.counts.num_unsafe -= 1;
        }
        if signature.first_member == 0 {
            self.counts.num_empty -= 1;
        }

        // Admit.
        let mid = if self.read_only {
            // Fake link so empty-group accounting behaves.
            signature.first_member = 1;
            self.db.set_signature(sid, signature);
            1
        } else {
            let mid = self.member_alloc(name)?;
            candidate.next_member = signature.first_member;
            signature.first_member = mid;
            self.db.set_member(mid, candidate);
            self.db.set_signature(sid, signature);
            let (slot, _) = self.db.lookup_member(name)?;
            self.db.index_set(SectionId::MemberIndex, slot, mid);
            mid
        };

        self.safe_scores[sid as usize] = metric;
        Ok((true, Decision::Accepted { sid, mid, cmp }))
    }

    /// Allocates a member, reusing the free-list before growing the
    /// section.
    fn member_alloc(&mut self, name: &str) -> Result<u32, EngineError> {
        let mid = self.free_member_root;
        if mid != 0 {
            let member = self.db.member(mid);
            self.free_member_root = member.next_member;
            let mut fresh = Member::new_zeroed();
            fresh.name = crate::db::records::pack_name(name);
            self.db.set_member(mid, fresh);
            Ok(mid)
        } else {
            Ok(self.db.add_member(name)?)
        }
    }

    /// Pushes a member onto the free-list, zeroed so name lookups no
    /// longer find it.
    fn member_free(&mut self, mid: u32) {
        let mut member = Member::new_zeroed();
        member.next_member = self.free_member_root;
        self.db.set_member(mid, member);
        self.free_member_root = mid;
    }

    /// Empties a group's member chain prior to promotion, clearing any
    /// component pointer in other members that referenced a freed one.
    fn flush_group(&mut self, sid: u32) -> Result<(), EngineError> {
        let mut signature = self.db.signature(sid);
        if signature.first_member == 0 {
            return Ok(());
        }

        if self.read_only {
            signature.first_member = 0;
            self.db.set_signature(sid, signature);
            self.counts.num_empty += 1;
            return Ok(());
        }

        while signature.first_member != 0 {
            let freed = signature.first_member;
            // Unlink references to the freed member everywhere.
            for mid in 1..self.db.num(SectionId::Member) {
                let mut member = self.db.member(mid);
                let mut touched = false;
                for pair_ref in [&mut member.qmt, &mut member.tmt, &mut member.fmt] {
                    if *pair_ref != 0 && self.db.pair(*pair_ref).mid == freed {
                        debug_assert_eq!(member.flags & MEMMASK_SAFE, 0);
                        *pair_ref = 0;
                        touched = true;
                    }
                }
                if touched {
                    self.db.set_member(mid, member);
                }
            }

            let head = self.db.member(freed);
            signature.first_member = head.next_member;
            self.member_free(freed);
        }

        self.db.set_signature(sid, signature);
        self.counts.num_empty += 1;
        Ok(())
    }

    /// Resolves a subtree to its member id: the literal skin-notation
    /// first, then a normalising reparse for subtrees whose dyadic
    /// ordering was locked by their context.
    fn resolve_component(
        &mut self,
        tree: &MicroTree,
        id: u32,
    ) -> Result<Option<(u32, u32)>, EngineError> {
        let (name, skin) = tree.encode_with_skin(id);
        let (_, mut mid) = self.db.lookup_member(&name)?;
        let mut skin = skin;
        if mid == 0 {
            // The literal form may be unnormalised in isolation.
            let literal = tree.encode(id);
            self.scratch2.parse_safe(&literal, DEFAULT_SKIN)?;
            let (renamed, reskinned) = self.scratch2.encode_with_skin(self.scratch2.root);
            let (_, found) = self.db.lookup_member(&renamed)?;
            mid = found;
            skin = reskinned;
        }
        if mid == 0 {
            return Ok(None);
        }
        let perm = crate::transform::perm_from_name(&skin).ok_or_else(|| {
            EngineError::Corrupt(format!("component skin \"{}\" is not a permutation", skin))
        })?;
        let tid = crate::transform::tid_from_perm(&perm);
        Ok(Some((mid, tid)))
    }

    /// Determines tails and heads of a candidate, resolves them to
    /// member ids and fills the pair references on `member`. Returns
    /// whether the candidate is safe.
    ///
    /// A missing or unsafe component — tail or head — does not reject:
    /// it clears the candidate's SAFE flag and the caller's safety
    /// matrix decides. Unsafe groups need to keep collecting exactly
    /// this material.
    fn find_head_tail(
        &mut self,
        member: &mut Member,
        tree: &MicroTree,
        mid: u32,
    ) -> Result<bool, EngineError> {
        debug_assert_eq!(tree.root & IBIT, 0);

        // Safe until proven otherwise.
        member.flags |= MEMMASK_SAFE;

        // Reserved roots: constant zero and the naked variable.
        if tree.root == 0 || tree.root == KSTART {
            debug_assert!(member.name_str() == "0" || member.name_str() == "a");
            member.tid = 0;
            // Self-referential pair.
            let pid = if self.read_only { 0 } else { self.db.intern_pair(mid, 0)? };
            member.qmt = pid;
            member.tmt = pid;
            member.fmt = pid;
            return Ok(true);
        }

        debug_assert!(tree.root >= NSTART);

        // Tails: the three component subtrees.
        let node = *tree.node(tree.root);
        let tu = node.t & !IBIT;

        for (which, component) in [(0u8, node.q), (1, tu), (2, node.f)] {
            if which == 2 && node.f == tu {
                member.fmt = 0; // T/F dedup
                continue;
            }
            match self.resolve_component(tree, component)? {
                None => {
                    member.flags &= !MEMMASK_SAFE;
                    return Ok(false);
                }
                Some((mid, tid)) => {
                    if self.db.member(mid).flags & MEMMASK_SAFE == 0 {
                        member.flags &= !MEMMASK_SAFE;
                        return Ok(false);
                    }
                    let pid = self.db.intern_pair(mid, tid)?;
                    match which {
                        0 => member.qmt = pid,
                        1 => member.tmt = pid,
                        _ => member.fmt = pid,
                    }
                }
            }
        }

        member.heads = [0; MAXHEAD];

        // Heads: delete each interior node in turn and rewire its uses
        // through a fresh placeholder.
        let mut num_head = 0usize;
        for hot in NSTART..tree.root {
            let head_mid = self.extract_head(tree, hot)?;
            let head_mid = match head_mid {
                None => {
                    member.flags &= !MEMMASK_SAFE;
                    return Ok(false);
                }
                Some(mid) => mid,
            };
            if self.db.member(head_mid).flags & MEMMASK_SAFE == 0 {
                member.flags &= !MEMMASK_SAFE;
                return Ok(false);
            }

            if member.heads[..num_head].contains(&head_mid) {
                continue;
            }
            if num_head >= MAXHEAD {
                return Err(EngineError::Corrupt(format!(
                    "member {} has more than {} heads",
                    member.name_str(),
                    MAXHEAD
                )));
            }
            member.heads[num_head] = head_mid;
            num_head += 1;
        }

        Ok(member.flags & MEMMASK_SAFE != 0)
    }

    /// Builds the head obtained by deleting node `hot` from `tree` and
    /// resolves it to a member id.
    fn extract_head(&mut self, tree: &MicroTree, hot: u32) -> Result<Option<u32>, EngineError> {
        // Select the nodes still reachable when `hot` is cut out.
        let root = tree.root;
        let mut select: u32 = (1 << root) | 1;
        for k in (NSTART..=root).rev() {
            if k != hot && select & (1 << k) != 0 {
                let node = tree.node(k);
                for child in [node.q, node.t & !IBIT, node.f] {
                    if child >= NSTART {
                        select |= 1 << child;
                    }
                }
            }
        }
        select &= !(1 << hot);

        // Rebuild bottom-up, assigning placeholders to endpoints and to
        // the cut node, re-ordering dyadics whose operand order changed.
        let mut head = MicroTree::new(self.flags);
        let mut what = [0u32; NEND as usize];
        let mut next_placeholder = KSTART;

        for k in NSTART..=root {
            if k == hot || select & (1 << k) == 0 {
                continue;
            }
            let node = tree.node(k);
            let (q, tu, ti, f) = (node.q, node.t & !IBIT, node.t & IBIT, node.f);

            for operand in [q, tu, f] {
                if select & (1 << operand) == 0 {
                    what[operand as usize] = next_placeholder;
                    next_placeholder += 1;
                    select |= 1 << operand;
                }
            }

            let (wq, wt, wf) = (what[q as usize], what[tu as usize], what[f as usize]);
            let nid = if tu == 0 && ti != 0 && head.compare(wq, &head, wf) == Ordering::Greater {
                // re-order OR
                head.push_raw(wf, IBIT, wq)?
            } else if tu == f && head.compare(wq, &head, wf) == Ordering::Greater {
                // re-order XOR
                head.push_raw(wf, wq ^ IBIT, wq)?
            } else if f == 0 && ti == 0 && head.compare(wq, &head, wt) == Ordering::Greater {
                // re-order AND
                head.push_raw(wt, wq, 0)?
            } else {
                head.push_raw(wq, wt ^ ti, wf)?
            };
            what[k as usize] = nid;
            select |= 1 << k;
        }

        head.root = head.count - 1;

        let (name, _) = head.encode_with_skin(head.root);
        let (_, mut mid) = self.db.lookup_member(&name)?;
        if mid == 0 {
            // The extraction may leave unnormalised dyadic ordering; the
            // endpoints were locked by the removed node.
            let literal = head.encode(head.root);
            self.scratch2.parse_safe(&literal, DEFAULT_SKIN)?;
            let (renamed, _) = self.scratch2.encode_with_skin(self.scratch2.root);
            let (_, found) = self.db.lookup_member(&renamed)?;
            mid = found;
        }
        Ok(if mid == 0 { None } else { Some(mid) })
    }

    /// Sort order of the finaliser: non-empty first, safe first,
    /// non-deprecated first, components first, ascending score, then
    /// structural tree order.
    fn compare_members(
        scratch_l: &mut MicroTree,
        scratch_r: &mut MicroTree,
        lhs: &Member,
        rhs: &Member,
    ) -> Ordering {
        // Empties gather at the end.
        match (lhs.sid == 0, rhs.sid == 0) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            (false, false) => {}
        }

        // Safe first, deprecated last, components first, low score first.
        let rank = |m: &Member| {
            (
                m.flags & MEMMASK_SAFE == 0,
                m.flags & MEMMASK_DEPR != 0,
                m.flags & MEMMASK_COMP == 0,
                score_name(m.name_str()),
            )
        };
        let order = rank(lhs).cmp(&rank(rhs));
        if order != Ordering::Equal {
            return order;
        }

        if scratch_l.parse_fast(lhs.name_str(), DEFAULT_SKIN).is_err()
            || scratch_r.parse_fast(rhs.name_str(), DEFAULT_SKIN).is_err()
        {
            return lhs.name_str().cmp(rhs.name_str());
        }
        scratch_l.compare(scratch_l.root, scratch_r, scratch_r.root)
    }

    /// Compacts, sorts and re-indexes the member section, recomputes
    /// heads/tails (repopulating the pair section) and re-chains every
    /// group with its best member first.
    pub fn finalise(&mut self) -> Result<(), EngineError> {
        log::info!("sorting members");

        // Pairs are regenerated from scratch by the head/tail pass.
        self.db.set_num(SectionId::Pair, 1);
        self.db.index_clear(SectionId::PairIndex);

        // Everything re-derives: index, chains, safety.
        self.db.index_clear(SectionId::MemberIndex);
        for sid in 0..self.db.num(SectionId::Signature) {
            let mut signature = self.db.signature(sid);
            signature.first_member = 0;
            signature.flags &= !SIGMASK_SAFE;
            self.db.set_signature(sid, signature);
        }
        self.free_member_root = 0;
        self.counts.skip_unsafe = 0;

        // Sort entries, skipping the reserved entry 0.
        let num_member = self.db.num(SectionId::Member);
        let mut sorted: Vec<Member> =
            (1..num_member).map(|mid| self.db.member(mid)).collect();
        {
            let mut scratch_l = MicroTree::new(self.flags);
            let mut scratch_r = MicroTree::new(self.flags);
            sorted.sort_by(|a, b| Self::compare_members(&mut scratch_l, &mut scratch_r, a, b));
        }
        // Drop trailing freed slots.
        while sorted.last().is_some_and(|m| m.sid == 0) {
            sorted.pop();
        }
        for (i, member) in sorted.iter().enumerate() {
            self.db.set_member(i as u32 + 1, *member);
        }
        let num_member = sorted.len() as u32 + 1;
        self.db.set_num(SectionId::Member, num_member);

        log::info!("indexing members");

        let mut tree = MicroTree::new(self.flags);
        for mid in 1..num_member {
            let mut member = self.db.member(mid);
            debug_assert_ne!(member.sid, 0);

            let name = member.name_str().to_string();
            let was_safe = member.flags & MEMMASK_SAFE != 0;
            tree.parse_fast(&name, DEFAULT_SKIN)?;
            let is_safe = self.find_head_tail(&mut member, &tree, mid)?;

            // A member sorted as safe must re-derive as safe.
            if was_safe && !is_safe {
                return Err(EngineError::Corrupt(format!(
                    "safe member {} lost its components during finalise",
                    name
                )));
            }

            let mut signature = self.db.signature(member.sid);
            let member_safe = member.flags & MEMMASK_SAFE != 0;
            let group_safe = signature.flags & SIGMASK_SAFE != 0;
            if signature.first_member == 0 {
                // First member decides the group's safety.
                if member_safe {
                    signature.flags |= SIGMASK_SAFE;
                }
                // Mark non-empty for the consistency checks below; the
                // chains are rebuilt afterwards.
                signature.first_member = mid;
            } else if member_safe && !group_safe {
                log::warn!(
                    "adding safe member {}:{} to unsafe signature {}:{}",
                    mid,
                    name,
                    member.sid,
                    signature.name_str()
                );
                signature.flags |= SIGMASK_SAFE;
            } else if !member_safe && group_safe {
                // Unsafe member into a safe group: drop it.
                self.counts.skip_unsafe += 1;
                self.db.set_member(mid, Member::new_zeroed());
                continue;
            }
            self.db.set_signature(member.sid, signature);
            self.db.set_member(mid, member);

            let (slot, existing) = self.db.lookup_member(&name)?;
            if existing != 0 {
                return Err(EngineError::Corrupt(format!("duplicate member name {}", name)));
            }
            self.db.index_set(SectionId::MemberIndex, slot, mid);
        }

        // Re-chain back-to-front so the best member heads each group.
        for sid in 0..self.db.num(SectionId::Signature) {
            let mut signature = self.db.signature(sid);
            signature.first_member = 0;
            self.db.set_signature(sid, signature);
        }
        for mid in (1..num_member).rev() {
            let mut member = self.db.member(mid);
            if member.sid == 0 {
                continue;
            }
            let mut signature = self.db.signature(member.sid);
            member.next_member = signature.first_member;
            signature.first_member = mid;
            self.db.set_member(mid, member);
            self.db.set_signature(member.sid, signature);
        }

        // Flag the members that safe members are built from.
        for mid in 1..num_member {
            let mut member = self.db.member(mid);
            member.flags &= !MEMMASK_COMP;
            self.db.set_member(mid, member);
        }
        for mid in 1..num_member {
            let member = self.db.member(mid);
            if member.flags & MEMMASK_SAFE == 0 {
                continue;
            }
            for pair_ref in [member.qmt, member.tmt, member.fmt] {
                if pair_ref != 0 {
                    let component = self.db.pair(pair_ref).mid;
                    let mut referee = self.db.member(component);
                    referee.flags |= MEMMASK_COMP;
                    self.db.set_member(component, referee);
                }
            }
            for head in member.heads {
                if head != 0 {
                    let mut referee = self.db.member(head);
                    referee.flags |= MEMMASK_COMP;
                    self.db.set_member(head, referee);
                }
            }
        }

        self.recount_groups();
        log::info!(
            "indexed members: numMember={} numEmpty={} numUnsafe={} skipUnsafe={}",
            num_member,
            self.counts.num_empty,
            self.counts.num_unsafe,
            self.counts.skip_unsafe
        );
        Ok(())
    }
}

/// Seeds an empty signature section with the two reserved groups: the
/// constant zero and the naked variable.
pub fn seed_signatures(db: &mut Database) -> Result<(), DbError> {
    debug_assert!(db.num(SectionId::Signature) <= 1);
    for (name, nph, nep) in [("0", 0u8, 0u8), ("a", 1, 1)] {
        let (slot, existing) = db.lookup_signature(name)?;
        debug_assert_eq!(existing, 0);
        let sid = db.add_signature(name)?;
        let mut signature = db.signature(sid);
        signature.size = 0;
        signature.num_placeholder = nph;
        signature.num_endpoint = nep;
        db.set_signature(sid, signature);
        db.index_set(SectionId::SignatureIndex, slot, sid);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primes::next_prime;

    /// A small but complete writable database: transforms, the seed
    /// signatures plus a few known groups, imprints at interleave 504.
    fn engine_db(signatures: &[&str]) -> Database {
        engine_db_sized(signatures, 32 * 504 + 1)
    }

    fn engine_db_sized(signatures: &[&str], max_imprint: u32) -> Database {
        let mut db = Database::new();
        db.create_transforms().unwrap();
        db.interleave = 504;
        db.interleave_step = 720;

        let max_signature = 32u32;
        db.alloc_section(SectionId::Signature, max_signature);
        db.alloc_section(SectionId::SignatureIndex, next_prime(max_signature as u64 * 5) as u32);
        db.alloc_section(SectionId::Imprint, max_imprint);
        db.alloc_section(SectionId::ImprintIndex, next_prime(max_imprint as u64 * 5) as u32);
        db.alloc_section(SectionId::Member, 64);
        db.alloc_section(SectionId::MemberIndex, next_prime(64 * 5) as u32);
        db.alloc_section(SectionId::Pair, 256);
        db.alloc_section(SectionId::PairIndex, next_prime(256 * 5) as u32);
        db.alloc_section(SectionId::Hint, 1);
        db.alloc_section(SectionId::HintIndex, 1);

        seed_signatures(&mut db).unwrap();
        let mut tree = MicroTree::new(BuildFlags::default());
        for name in signatures {
            let (slot, _) = db.lookup_signature(name).unwrap();
            let sid = db.add_signature(name).unwrap();
            tree.parse_fast(name, DEFAULT_SKIN).unwrap();
            let mut signature = db.signature(sid);
            signature.size = tree.node_count() as u8;
            let (nph, nep, nbr) = crate::tree::count_name_features(name);
            signature.num_placeholder = nph as u8;
            signature.num_endpoint = nep as u8;
            signature.num_back_ref = nbr as u8;
            db.set_signature(sid, signature);
            db.index_set(SectionId::SignatureIndex, slot, sid);
        }
        imprint::rebuild(&mut db, false, (0, 0), false).unwrap();
        db
    }

    fn feed(engine: &mut MemberEngine<'_>, name: &str) -> Decision {
        let mut tree = MicroTree::new(engine.flags);
        tree.parse_fast(name, DEFAULT_SKIN).unwrap();
        let (nph, nep, nbr) = crate::tree::count_name_features(name);
        let (_, decision) = engine.found_tree(&tree, name, nph, nep, nbr).unwrap();
        engine.progress += 1;
        decision
    }

    #[test]
    fn test_seed_members_are_safe() {
        let mut db = engine_db(&[]);
        let mut engine = MemberEngine::new(&mut db, BuildFlags::default(), false);

        let mut tree = MicroTree::new(BuildFlags::default());
        tree.parse_fast("0", DEFAULT_SKIN).unwrap();
        let (_, d) = engine.found_tree(&tree, "0", 0, 0, 0).unwrap();
        assert!(matches!(d, Decision::Accepted { sid: 1, cmp: '>', .. }), "{:?}", d);

        tree.parse_fast("a", DEFAULT_SKIN).unwrap();
        let (_, d) = engine.found_tree(&tree, "a", 1, 1, 0).unwrap();
        assert!(matches!(d, Decision::Accepted { sid: 2, cmp: '>', .. }), "{:?}", d);

        engine.finalise().unwrap();
        assert_eq!(engine.counts.num_empty, 0);
        assert_eq!(engine.counts.num_unsafe, 0);

        let m1 = engine.db.member(1);
        let m2 = engine.db.member(2);
        assert_eq!(m1.name_str(), "0");
        assert_eq!(m2.name_str(), "a");
        assert!(m1.flags & MEMMASK_SAFE != 0);
        assert!(m2.flags & MEMMASK_SAFE != 0);
        assert!(engine.db.signature(1).flags & SIGMASK_SAFE != 0);
        assert!(engine.db.signature(2).flags & SIGMASK_SAFE != 0);
    }

    #[test]
    fn test_duplicate_candidate_skipped() {
        let mut db = engine_db(&["ab+"]);
        let mut engine = MemberEngine::new(&mut db, BuildFlags::default(), false);
        feed(&mut engine, "0");
        feed(&mut engine, "a");

        let first = feed(&mut engine, "ab+");
        assert!(matches!(first, Decision::Accepted { .. }), "{:?}", first);
        let before = engine.db.num(SectionId::Member);

        let second = feed(&mut engine, "ab+");
        assert_eq!(second, Decision::Duplicate);
        assert_eq!(engine.counts.skip_duplicate, 1);
        assert_eq!(engine.db.num(SectionId::Member), before);
    }

    #[test]
    fn test_candidate_outside_catalogue_ignored() {
        let mut db = engine_db(&["ab+"]);
        let mut engine = MemberEngine::new(&mut db, BuildFlags::default(), false);
        let d = feed(&mut engine, "ab^");
        assert_eq!(d, Decision::NotInCatalogue);
    }

    #[test]
    fn test_safe_member_admission_chain() {
        // "ab+" is constructible once "0" and "a" exist: tails are the
        // endpoints, the only head is the naked variable.
        let mut db = engine_db(&["ab+", "ab>"]);
        let mut engine = MemberEngine::new(&mut db, BuildFlags::default(), false);
        feed(&mut engine, "0");
        feed(&mut engine, "a");

        let d = feed(&mut engine, "ab+");
        let (sid_or, mid_or) = match d {
            Decision::Accepted { sid, mid, cmp: '>' } => (sid, mid),
            other => panic!("expected safe admission, got {:?}", other),
        };
        let member = engine.db.member(mid_or);
        assert!(member.flags & MEMMASK_SAFE != 0);
        assert!(engine.db.signature(sid_or).flags & SIGMASK_SAFE != 0);
        // Components resolve through pairs to the seed members.
        assert_ne!(member.qmt, 0);
        let q_pair = engine.db.pair(member.qmt);
        assert_eq!(engine.db.member(q_pair.mid).name_str(), "a");
    }

    #[test]
    fn test_unresolved_tails_collect_into_unsafe_group() {
        // Without the seed members, the endpoints of "ab+" resolve to
        // nothing; the candidate is still collected into its unsafe
        // group, flagged unsafe, with the failed component left clear.
        let mut db = engine_db(&["ab+"]);
        let mut engine = MemberEngine::new(&mut db, BuildFlags::default(), false);
        let d = feed(&mut engine, "ab+");
        let mid = match d {
            Decision::Accepted { mid, cmp: '=', .. } => mid,
            other => panic!("expected unsafe collection, got {:?}", other),
        };
        let member = engine.db.member(mid);
        assert_eq!(member.flags & MEMMASK_SAFE, 0);
        assert_eq!(member.qmt, 0);
        assert_eq!(engine.db.signature(member.sid).flags & SIGMASK_SAFE, 0);
        assert_eq!(engine.counts.skip_unsafe, 0);
    }

    #[test]
    fn test_oversize_candidate_rejected() {
        let mut db = engine_db(&["ab+"]);
        let mut engine = MemberEngine::new(&mut db, BuildFlags::default(), false);
        feed(&mut engine, "0");
        feed(&mut engine, "a");
        let d = feed(&mut engine, "ab+");
        assert!(matches!(d, Decision::Accepted { cmp: '>', .. }), "{:?}", d);

        // "aab++" is a|(a|b): two nodes, same function, same group; it
        // can never beat the 1-node safe member.
        let d = feed(&mut engine, "aab++");
        assert!(matches!(d, Decision::SkipSize { .. }), "{:?}", d);
        assert_eq!(engine.counts.skip_size, 1);
    }

    #[test]
    fn test_truncation_stops_generator() {
        // Imprint capacity barely fits the seeded signatures, leaving
        // free space below one interleave of imprints.
        let mut db = engine_db_sized(&["ab+"], 50);
        let mut engine = MemberEngine::new(&mut db, BuildFlags::default(), false);
        engine.truncate = true;
        engine.progress = 41;

        let d = feed(&mut engine, "ab&");
        assert_eq!(d, Decision::Truncated);
        let (progress, name) = engine.truncated.clone().unwrap();
        assert_eq!(progress, 41);
        assert_eq!(name, "ab&");

        // Subsequent candidates bounce immediately.
        let d = feed(&mut engine, "ab>");
        assert_eq!(d, Decision::Truncated);
    }

    #[test]
    fn test_finalise_orders_best_first() {
        let mut db = engine_db(&["ab+", "ab>"]);
        let mut engine = MemberEngine::new(&mut db, BuildFlags::default(), false);
        feed(&mut engine, "0");
        feed(&mut engine, "a");
        feed(&mut engine, "ab+");
        feed(&mut engine, "ab>");
        engine.finalise().unwrap();

        // Chains exist, terminate, and visit each member once.
        let num_member = engine.db.num(SectionId::Member);
        for sid in 1..engine.db.num(SectionId::Signature) {
            let signature = engine.db.signature(sid);
            let mut seen = 0u32;
            let mut mid = signature.first_member;
            while mid != 0 {
                assert!(mid < num_member);
                seen += 1;
                assert!(seen < 64, "cycle in member chain of sid {}", sid);
                mid = engine.db.member(mid).next_member;
            }
        }
        // The member index resolves every surviving member.
        for mid in 1..num_member {
            let member = engine.db.member(mid);
            if member.sid == 0 {
                continue;
            }
            let (_, found) = engine.db.lookup_member(member.name_str()).unwrap();
            assert_eq!(found, mid);
        }
        // Seeds are components of the safe members above them.
        assert!(engine.db.member(1).flags & MEMMASK_COMP != 0 || engine.db.member(2).flags & MEMMASK_COMP != 0);
    }

    #[test]
    fn test_read_only_mode_mutates_nothing() {
        let mut db = engine_db(&[]);
        let num_member_before = db.num(SectionId::Member);
        let num_pair_before = db.num(SectionId::Pair);
        let mut engine = MemberEngine::new(&mut db, BuildFlags::default(), true);
        let d = feed(&mut engine, "0");
        assert!(matches!(d, Decision::Accepted { .. }), "{:?}", d);
        assert_eq!(engine.db.num(SectionId::Member), num_member_before);
        assert_eq!(engine.db.num(SectionId::Pair), num_pair_before);
        // The group is pretended non-empty so accounting stays balanced.
        assert_eq!(engine.db.signature(1).first_member, 1);
    }
}
