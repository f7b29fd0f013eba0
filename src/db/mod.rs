// SPDX-License-Identifier: Apache-2.0

//! The database container: typed, sized, append-only sections over one
//! file, with hash indices and a section-level owned/borrowed split.
//!
//! A database is opened by memory-mapping the file once; every section is
//! then a *borrowed* byte range of the map. A writable output database
//! allocates *owned* sections instead. The `alloc_mask` bitmask records
//! which sections are owned; writing through a borrowed section is a
//! programming invariant violation and panics, because a borrowed section
//! may be shared copy-on-write with any number of reader processes.

pub mod index;
pub mod layout;
pub mod records;

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::db::index::{hash_bytes, IndexFullError};
use crate::db::layout::{
    page_align, Header, LayoutError, SectionId, ALL_SECTIONS, FORMAT_VERSION, HEADER_SIZE,
    SECTION_COUNT,
};
use crate::db::records::{pack_name, Hint, Imprint, Member, Pair, Signature};
use crate::footprint::Footprint;
use crate::transform::{
    self, Perm, TRANSFORM_NAME_LEN,
};
use crate::{MAXSLOTS, MAXTRANSFORM};

#[derive(Debug)]
pub enum DbError {
    Layout(LayoutError),
    Io(std::io::Error),
    /// A data section ran out of capacity.
    SectionFull { section: &'static str, max: u32 },
    IndexFull(IndexFullError),
    Corrupt(String),
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbError::Layout(e) => write!(f, "{}", e),
            DbError::Io(e) => write!(f, "i/o: {}", e),
            DbError::SectionFull { section, max } => {
                write!(f, "{} section full at {} entries", section, max)
            }
            DbError::IndexFull(e) => write!(f, "{}", e),
            DbError::Corrupt(what) => write!(f, "database corrupt: {}", what),
        }
    }
}

impl std::error::Error for DbError {}

impl From<LayoutError> for DbError {
    fn from(e: LayoutError) -> Self {
        DbError::Layout(e)
    }
}

impl From<std::io::Error> for DbError {
    fn from(e: std::io::Error) -> Self {
        DbError::Io(e)
    }
}

impl From<IndexFullError> for DbError {
    fn from(e: IndexFullError) -> Self {
        DbError::IndexFull(e)
    }
}

enum SectionBytes {
    Empty,
    /// Writable, allocated by this database. Backed by `u64` storage so
    /// typed record views stay aligned.
    Owned { buf: Vec<u64>, len: usize },
    /// Read-only range of the input file's map.
    Borrowed { map: Arc<Mmap>, offset: usize, len: usize },
}

struct Section {
    num: u32,
    max: u32,
    bytes: SectionBytes,
}

impl Section {
    const fn empty() -> Self {
        Section { num: 0, max: 0, bytes: SectionBytes::Empty }
    }
}

/// One catalogue database, input or output.
pub struct Database {
    pub creation_flags: u32,
    pub interleave: u32,
    pub interleave_step: u32,
    sections: [Section; SECTION_COUNT],
    /// Sections this database owns (and may write).
    pub alloc_mask: u32,
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Database {
    pub fn new() -> Self {
        Self {
            creation_flags: 0,
            interleave: 0,
            interleave_step: 0,
            sections: [const { Section::empty() }; SECTION_COUNT],
            alloc_mask: 0,
        }
    }

    /// Opens and maps an existing database read-only; every non-empty
    /// section is borrowed from the map.
    pub fn open(path: &Path) -> Result<Database, DbError> {
        let file = File::open(path)?;
        let map = Arc::new(unsafe { Mmap::map(&file) }?);

        let header = Header::read_from(&map[..])?;
        if (map.len() as u64) < header.file_size {
            return Err(DbError::Layout(LayoutError::Truncated {
                need: header.file_size,
                have: map.len() as u64,
            }));
        }

        let mut db = Database::new();
        db.creation_flags = header.creation_flags;
        db.interleave = header.interleave;
        db.interleave_step = header.interleave_step;

        for (i, &id) in ALL_SECTIONS.iter().enumerate() {
            let (num, max) = header.counts[i];
            let offset = header.offsets[i] as usize;
            let len = max as usize * id.record_size();
            if len == 0 {
                continue;
            }
            if offset + len > map.len() {
                return Err(DbError::Corrupt(format!(
                    "section {} extends past end of file",
                    id.name()
                )));
            }
            db.sections[id as usize] = Section {
                num,
                max,
                bytes: SectionBytes::Borrowed { map: Arc::clone(&map), offset, len },
            };
        }
        Ok(db)
    }

    /// Writes the database to `path`. Section order and page alignment
    /// follow the layout contract; the recorded file size is byte-exact.
    pub fn save(&self, path: &Path) -> Result<(), DbError> {
        let mut offsets = [0u64; SECTION_COUNT];
        let mut counts = [(0u32, 0u32); SECTION_COUNT];
        let mut cursor = page_align(HEADER_SIZE as u64);
        for (i, &id) in ALL_SECTIONS.iter().enumerate() {
            let section = &self.sections[id as usize];
            counts[i] = (section.num, section.max);
            let len = section.max as u64 * id.record_size() as u64;
            if len > 0 {
                offsets[i] = cursor;
                cursor = page_align(cursor + len);
            }
        }
        // Exact size: strip the trailing page padding.
        let file_size = ALL_SECTIONS
            .iter()
            .enumerate()
            .filter(|(_, id)| self.sections[id.index()].max > 0)
            .map(|(i, id)| offsets[i] + self.sections[id.index()].max as u64 * id.record_size() as u64)
            .max()
            .unwrap_or(HEADER_SIZE as u64);

        let header = Header {
            version: FORMAT_VERSION,
            creation_flags: self.creation_flags,
            interleave: self.interleave,
            interleave_step: self.interleave_step,
            file_size,
            counts,
            offsets,
        };

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        header.write_to(&mut writer)?;
        for (i, &id) in ALL_SECTIONS.iter().enumerate() {
            let section = &self.sections[id as usize];
            if section.max == 0 {
                continue;
            }
            let pos = writer.seek(SeekFrom::Current(0))?;
            debug_assert!(pos <= offsets[i]);
            for _ in pos..offsets[i] {
                writer.write_all(&[0])?;
            }
            // A borrowed section's mapped range may exceed its recorded
            // capacity; write exactly what the header promises.
            let len = section.max as usize * id.record_size();
            writer.write_all(&self.bytes(id)[..len])?;
        }
        writer.flush()?;
        Ok(())
    }

    // --- section plumbing ---------------------------------------------

    pub fn num(&self, id: SectionId) -> u32 {
        self.sections[id as usize].num
    }

    pub fn max(&self, id: SectionId) -> u32 {
        self.sections[id as usize].max
    }

    pub fn set_num(&mut self, id: SectionId, num: u32) {
        debug_assert!(num <= self.sections[id as usize].max);
        self.sections[id as usize].num = num;
    }

    /// Allocates an owned, zeroed section of `max` records. Data sections
    /// start with the reserved entry 0 in place; index sections count as
    /// fully occupied.
    pub fn alloc_section(&mut self, id: SectionId, max: u32) {
        let len = max as usize * id.record_size();
        let buf = vec![0u64; len.div_ceil(8)];
        self.sections[id as usize] = Section {
            num: if max == 0 {
                0
            } else if id.is_index() {
                max
            } else {
                1
            },
            max,
            bytes: if len == 0 { SectionBytes::Empty } else { SectionBytes::Owned { buf, len } },
        };
        if max > 0 {
            self.alloc_mask |= id.mask();
        } else {
            self.alloc_mask &= !id.mask();
        }
    }

    /// Points a section at the input database's map without copying. The
    /// section becomes borrowed read-only.
    pub fn inherit_section(&mut self, id: SectionId, from: &Database) {
        assert!(
            self.alloc_mask & id.mask() == 0,
            "inheriting {} over an owner allocation",
            id.name()
        );
        let source = &from.sections[id as usize];
        let bytes = match &source.bytes {
            SectionBytes::Borrowed { map, offset, len } => {
                SectionBytes::Borrowed { map: Arc::clone(map), offset: *offset, len: *len }
            }
            SectionBytes::Empty => SectionBytes::Empty,
            SectionBytes::Owned { .. } => {
                panic!("cannot inherit owned section {}", id.name())
            }
        };
        // Capacity of an inherited data section is its occupancy; it can
        // never grow through this database.
        let max = if id.is_index() { source.max } else { source.num };
        self.sections[id as usize] = Section { num: source.num, max, bytes };
    }

    /// Copies a section's contents from the input database into this
    /// database's owned allocation.
    pub fn copy_section(&mut self, id: SectionId, from: &Database) {
        assert!(self.alloc_mask & id.mask() != 0, "copy into unallocated {}", id.name());
        let src_num = from.num(id);
        let src_len = if id.is_index() {
            from.max(id) as usize * id.record_size()
        } else {
            src_num as usize * id.record_size()
        };
        if src_len == 0 {
            return;
        }
        assert!(
            src_len <= self.max(id) as usize * id.record_size(),
            "{}: output smaller than input",
            id.name()
        );
        let src: Vec<u8> = from.bytes(id)[..src_len].to_vec();
        self.bytes_mut(id)[..src_len].copy_from_slice(&src);
        self.sections[id as usize].num = src_num;
    }

    pub fn bytes(&self, id: SectionId) -> &[u8] {
        match &self.sections[id as usize].bytes {
            SectionBytes::Empty => &[],
            SectionBytes::Owned { buf, len } => &buf.as_bytes()[..*len],
            SectionBytes::Borrowed { map, offset, len } => &map[*offset..*offset + *len],
        }
    }

    fn bytes_mut(&mut self, id: SectionId) -> &mut [u8] {
        match &mut self.sections[id as usize].bytes {
            SectionBytes::Owned { buf, len } => &mut buf.as_mut_bytes()[..*len],
            SectionBytes::Empty => panic!("write to empty section {}", id.name()),
            SectionBytes::Borrowed { .. } => {
                panic!("write through borrowed section {}", id.name())
            }
        }
    }

    fn records<T: FromBytes + Immutable + KnownLayout>(&self, id: SectionId) -> &[T] {
        <[T]>::ref_from_bytes(self.bytes(id)).expect("section bytes misaligned for record type")
    }

    fn records_mut<T: FromBytes + IntoBytes + Immutable + KnownLayout>(
        &mut self,
        id: SectionId,
    ) -> &mut [T] {
        <[T]>::mut_from_bytes(self.bytes_mut(id)).expect("section bytes misaligned for record type")
    }

    pub fn index(&self, id: SectionId) -> &[u32] {
        debug_assert!(id.is_index());
        self.records::<u32>(id)
    }

    pub fn index_set(&mut self, id: SectionId, slot: usize, value: u32) {
        self.records_mut::<u32>(id)[slot] = value;
    }

    pub fn index_clear(&mut self, id: SectionId) {
        self.bytes_mut(id).fill(0);
    }

    // --- signatures ----------------------------------------------------

    pub fn signature(&self, sid: u32) -> Signature {
        self.records::<Signature>(SectionId::Signature)[sid as usize]
    }

    pub fn set_signature(&mut self, sid: u32, signature: Signature) {
        self.records_mut::<Signature>(SectionId::Signature)[sid as usize] = signature;
    }

    /// Probes the signature index; returns `(slot, id)` with id 0 on miss.
    pub fn lookup_signature(&self, name: &str) -> Result<(usize, u32), DbError> {
        let sigs = self.records::<Signature>(SectionId::Signature);
        let slot = index::probe(
            self.index(SectionId::SignatureIndex),
            hash_bytes(name.as_bytes()),
            "signature",
            |id| sigs[id as usize].name_str() == name,
        )?;
        Ok((slot, self.index(SectionId::SignatureIndex)[slot]))
    }

    pub fn add_signature(&mut self, name: &str) -> Result<u32, DbError> {
        let section = SectionId::Signature;
        let (num, max) = (self.num(section), self.max(section));
        if num >= max {
            return Err(DbError::SectionFull { section: "signature", max });
        }
        let mut signature = Signature::new_zeroed();
        signature.name = pack_name(name);
        self.records_mut::<Signature>(section)[num as usize] = signature;
        self.set_num(section, num + 1);
        Ok(num)
    }

    // --- members -------------------------------------------------------

    pub fn member(&self, mid: u32) -> Member {
        self.records::<Member>(SectionId::Member)[mid as usize]
    }

    pub fn set_member(&mut self, mid: u32, member: Member) {
        self.records_mut::<Member>(SectionId::Member)[mid as usize] = member;
    }

    pub fn members(&self) -> &[Member] {
        self.records::<Member>(SectionId::Member)
    }

    pub fn members_mut(&mut self) -> &mut [Member] {
        self.records_mut::<Member>(SectionId::Member)
    }

    pub fn lookup_member(&self, name: &str) -> Result<(usize, u32), DbError> {
        let members = self.records::<Member>(SectionId::Member);
        let slot = index::probe(
            self.index(SectionId::MemberIndex),
            hash_bytes(name.as_bytes()),
            "member",
            |id| members[id as usize].name_str() == name,
        )?;
        Ok((slot, self.index(SectionId::MemberIndex)[slot]))
    }

    pub fn add_member(&mut self, name: &str) -> Result<u32, DbError> {
        let section = SectionId::Member;
        let (num, max) = (self.num(section), self.max(section));
        if num >= max {
            return Err(DbError::SectionFull { section: "member", max });
        }
        let mut member = Member::new_zeroed();
        member.name = pack_name(name);
        self.records_mut::<Member>(section)[num as usize] = member;
        self.set_num(section, num + 1);
        Ok(num)
    }

    // --- pairs ---------------------------------------------------------

    pub fn pair(&self, pid: u32) -> Pair {
        self.records::<Pair>(SectionId::Pair)[pid as usize]
    }

    pub fn lookup_pair(&self, mid: u32, tid: u32) -> Result<(usize, u32), DbError> {
        let key = Pair { mid, tid };
        let pairs = self.records::<Pair>(SectionId::Pair);
        let slot = index::probe(
            self.index(SectionId::PairIndex),
            hash_bytes(key.as_bytes()),
            "pair",
            |id| pairs[id as usize] == key,
        )?;
        Ok((slot, self.index(SectionId::PairIndex)[slot]))
    }

    pub fn add_pair(&mut self, mid: u32, tid: u32) -> Result<u32, DbError> {
        let section = SectionId::Pair;
        let (num, max) = (self.num(section), self.max(section));
        if num >= max {
            return Err(DbError::SectionFull { section: "pair", max });
        }
        self.records_mut::<Pair>(section)[num as usize] = Pair { mid, tid };
        self.set_num(section, num + 1);
        Ok(num)
    }

    /// Resolves a `(mid, tid)` pair to its interned id, creating it on
    /// first use.
    pub fn intern_pair(&mut self, mid: u32, tid: u32) -> Result<u32, DbError> {
        let (slot, id) = self.lookup_pair(mid, tid)?;
        if id != 0 {
            return Ok(id);
        }
        let id = self.add_pair(mid, tid)?;
        self.index_set(SectionId::PairIndex, slot, id);
        Ok(id)
    }

    // --- hints ---------------------------------------------------------

    pub fn hint(&self, hid: u32) -> Hint {
        self.records::<Hint>(SectionId::Hint)[hid as usize]
    }

    pub fn lookup_hint(&self, hint: &Hint) -> Result<(usize, u32), DbError> {
        let hints = self.records::<Hint>(SectionId::Hint);
        let slot = index::probe(
            self.index(SectionId::HintIndex),
            hash_bytes(hint.as_bytes()),
            "hint",
            |id| hints[id as usize].as_bytes() == hint.as_bytes(),
        )?;
        Ok((slot, self.index(SectionId::HintIndex)[slot]))
    }

    pub fn add_hint(&mut self, hint: &Hint) -> Result<u32, DbError> {
        let section = SectionId::Hint;
        let (num, max) = (self.num(section), self.max(section));
        if num >= max {
            return Err(DbError::SectionFull { section: "hint", max });
        }
        self.records_mut::<Hint>(section)[num as usize] = *hint;
        self.set_num(section, num + 1);
        Ok(num)
    }

    // --- imprints ------------------------------------------------------

    pub fn imprint(&self, iid: u32) -> Imprint {
        self.records::<Imprint>(SectionId::Imprint)[iid as usize]
    }

    pub fn lookup_imprint(&self, footprint: &Footprint) -> Result<(usize, u32), DbError> {
        let imprints = self.records::<Imprint>(SectionId::Imprint);
        let slot = index::probe(
            self.index(SectionId::ImprintIndex),
            footprint.hash(),
            "imprint",
            |id| imprints[id as usize].footprint == *footprint,
        )?;
        Ok((slot, self.index(SectionId::ImprintIndex)[slot]))
    }

    pub fn add_imprint(&mut self, footprint: Footprint, sid: u32, tid: u32) -> Result<u32, DbError> {
        let section = SectionId::Imprint;
        let (num, max) = (self.num(section), self.max(section));
        if num >= max {
            return Err(DbError::SectionFull { section: "imprint", max });
        }
        self.records_mut::<Imprint>(section)[num as usize] = Imprint { footprint, sid, tid };
        self.set_num(section, num + 1);
        Ok(num)
    }

    // --- transforms ----------------------------------------------------

    /// Generates the complete, immutable transform block: forward and
    /// reverse names, nibble encodings, inverse ids and both name
    /// indices. Every database shares this table.
    pub fn create_transforms(&mut self) -> Result<(), DbError> {
        let index_size = crate::primes::next_prime(MAXTRANSFORM as u64 * 2 + 1) as u32;

        self.alloc_section(SectionId::TransformNameFwd, MAXTRANSFORM);
        self.alloc_section(SectionId::TransformNameRev, MAXTRANSFORM);
        self.alloc_section(SectionId::TransformEncFwd, MAXTRANSFORM);
        self.alloc_section(SectionId::TransformEncRev, MAXTRANSFORM);
        self.alloc_section(SectionId::TransformRevId, MAXTRANSFORM);
        self.alloc_section(SectionId::TransformIndexFwd, index_size);
        self.alloc_section(SectionId::TransformIndexRev, index_size);

        for section in [
            SectionId::TransformNameFwd,
            SectionId::TransformNameRev,
            SectionId::TransformEncFwd,
            SectionId::TransformEncRev,
            SectionId::TransformRevId,
        ] {
            self.set_num(section, MAXTRANSFORM);
        }

        let mut perm = transform::identity();
        for tid in 0..MAXTRANSFORM {
            if tid > 0 {
                next_permutation(&mut perm);
            }
            let inverse = transform::inverse(&perm);

            let name_offset = tid as usize * TRANSFORM_NAME_LEN;
            for (k, &slot) in perm.iter().enumerate() {
                self.bytes_mut(SectionId::TransformNameFwd)[name_offset + k] = b'a' + slot;
            }
            for (k, &slot) in inverse.iter().enumerate() {
                self.bytes_mut(SectionId::TransformNameRev)[name_offset + k] = b'a' + slot;
            }
            self.records_mut::<u64>(SectionId::TransformEncFwd)[tid as usize] =
                transform::encoding(&perm);
            self.records_mut::<u64>(SectionId::TransformEncRev)[tid as usize] =
                transform::encoding(&inverse);
            self.records_mut::<u32>(SectionId::TransformRevId)[tid as usize] =
                transform::tid_from_perm(&inverse);

            // Indices store tid + 1 so the identity transform is
            // distinguishable from an empty slot.
            let fwd_name = &self.bytes(SectionId::TransformNameFwd)
                [name_offset..name_offset + TRANSFORM_NAME_LEN];
            let hash = hash_bytes(fwd_name);
            let slot = index::probe(self.index(SectionId::TransformIndexFwd), hash, "transform", |_| false)?;
            self.index_set(SectionId::TransformIndexFwd, slot, tid + 1);

            let rev_name = &self.bytes(SectionId::TransformNameRev)
                [name_offset..name_offset + TRANSFORM_NAME_LEN];
            let hash = hash_bytes(rev_name);
            let slot = index::probe(self.index(SectionId::TransformIndexRev), hash, "transform", |_| false)?;
            self.index_set(SectionId::TransformIndexRev, slot, tid + 1);
        }
        Ok(())
    }

    pub fn has_transforms(&self) -> bool {
        self.num(SectionId::TransformNameFwd) == MAXTRANSFORM
    }

    pub fn transform_name_fwd(&self, tid: u32) -> &str {
        let offset = tid as usize * TRANSFORM_NAME_LEN;
        std::str::from_utf8(&self.bytes(SectionId::TransformNameFwd)[offset..offset + TRANSFORM_NAME_LEN])
            .expect("transform names are ascii")
    }

    pub fn transform_name_rev(&self, tid: u32) -> &str {
        let offset = tid as usize * TRANSFORM_NAME_LEN;
        std::str::from_utf8(&self.bytes(SectionId::TransformNameRev)[offset..offset + TRANSFORM_NAME_LEN])
            .expect("transform names are ascii")
    }

    pub fn transform_enc_fwd(&self, tid: u32) -> u64 {
        self.records::<u64>(SectionId::TransformEncFwd)[tid as usize]
    }

    pub fn transform_enc_rev(&self, tid: u32) -> u64 {
        self.records::<u64>(SectionId::TransformEncRev)[tid as usize]
    }

    pub fn transform_rev_id(&self, tid: u32) -> u32 {
        self.records::<u32>(SectionId::TransformRevId)[tid as usize]
    }

    fn lookup_transform(&self, name: &str, index_id: SectionId, names_id: SectionId) -> Option<u32> {
        if name.len() != TRANSFORM_NAME_LEN {
            return None;
        }
        let slot = index::probe(self.index(index_id), hash_bytes(name.as_bytes()), "transform", |id| {
            let tid = (id - 1) as usize;
            let offset = tid * TRANSFORM_NAME_LEN;
            &self.bytes(names_id)[offset..offset + TRANSFORM_NAME_LEN] == name.as_bytes()
        })
        .ok()?;
        let id = self.index(index_id)[slot];
        if id == 0 {
            None
        } else {
            Some(id - 1)
        }
    }

    /// Resolves a forward transform name to its tid.
    pub fn lookup_fwd_transform(&self, name: &str) -> Option<u32> {
        self.lookup_transform(name, SectionId::TransformIndexFwd, SectionId::TransformNameFwd)
    }

    /// Resolves a name against the reverse table: the returned tid is the
    /// transform whose inverse carries `name`.
    pub fn lookup_rev_transform(&self, name: &str) -> Option<u32> {
        self.lookup_transform(name, SectionId::TransformIndexRev, SectionId::TransformNameRev)
    }

    /// Group composition: the transform that applies `b` first and `a`
    /// second. Composed by indexing `a`'s encoding through `b`'s nibbles,
    /// then resolving the name through the forward index.
    pub fn compose_transforms(&self, a: u32, b: u32) -> u32 {
        let enc_a = self.transform_enc_fwd(a);
        let enc_b = self.transform_enc_fwd(b);
        let mut name = [0u8; TRANSFORM_NAME_LEN];
        for (k, ch) in name.iter_mut().enumerate() {
            let slot_b = (enc_b >> (4 * k)) & 0xF;
            let slot = (enc_a >> (4 * slot_b)) & 0xF;
            *ch = b'a' + slot as u8;
        }
        let name = std::str::from_utf8(&name).expect("composed name is ascii");
        self.lookup_fwd_transform(name)
            .expect("transform table closed under composition")
    }

    /// Per-transform evaluator base: the footprints of the nine input
    /// slots after the permutation, plus constant zero at entry 0.
    pub fn load_eval_base(&self, enc: u64, v: &mut [Footprint; crate::NEND as usize]) {
        let bases = variable_bases_shared();
        v[0] = Footprint::ZERO;
        for k in 0..MAXSLOTS {
            let slot = ((enc >> (4 * k)) & 0xF) as usize;
            v[crate::KSTART as usize + k] = bases[slot];
        }
    }

    /// JSON summary of the database, mirrored into the end-of-run report.
    pub fn json_info(&self) -> serde_json::Value {
        serde_json::json!({
            "flags": self.creation_flags,
            "interleave": self.interleave,
            "numTransform": self.num(SectionId::TransformNameFwd),
            "numSignature": self.num(SectionId::Signature),
            "numHint": self.num(SectionId::Hint),
            "numImprint": self.num(SectionId::Imprint),
            "numMember": self.num(SectionId::Member),
            "numPair": self.num(SectionId::Pair),
        })
    }

    /// Drops the level-1 indices and the imprint section before saving;
    /// readers rebuild them on demand.
    pub fn drop_level1_indices(&mut self) {
        for id in [
            SectionId::SignatureIndex,
            SectionId::HintIndex,
            SectionId::ImprintIndex,
            SectionId::MemberIndex,
            SectionId::PairIndex,
            SectionId::Imprint,
        ] {
            self.sections[id as usize] = Section::empty();
            self.alloc_mask &= !id.mask();
        }
        self.interleave = 0;
        self.interleave_step = 0;
    }
}

impl SectionId {
    fn index(self) -> usize {
        self as usize
    }
}

/// Lexicographic next-permutation step; the enumeration order defines the
/// tid space.
fn next_permutation(perm: &mut Perm) {
    let n = perm.len();
    let mut i = n - 1;
    while i > 0 && perm[i - 1] >= perm[i] {
        i -= 1;
    }
    if i == 0 {
        return; // already the last permutation
    }
    let mut j = n - 1;
    while perm[j] <= perm[i - 1] {
        j -= 1;
    }
    perm.swap(i - 1, j);
    perm[i..].reverse();
}

/// The nine variable footprints, shared process-wide.
pub fn variable_bases_shared() -> &'static [Footprint; MAXSLOTS] {
    use once_cell::sync::Lazy;
    static BASES: Lazy<[Footprint; MAXSLOTS]> = Lazy::new(crate::footprint::variable_bases);
    &BASES
}
