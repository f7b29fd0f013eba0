// SPDX-License-Identifier: Apache-2.0

//! On-disk file layout: `[header][section0][section1]...`.
//!
//! All integers are little-endian; sections start on page boundaries and
//! padding bytes are zero. The header records, for every section, the
//! occupancy/capacity pair and the absolute byte offset; the recorded
//! file size is byte-exact.

use std::io::{self, Read, Write};

use crate::footprint::Footprint;
use crate::metrics::HINT_SLOTS;
use crate::transform::TRANSFORM_NAME_LEN;

pub const MAGIC: u32 = 0xd5f6_f3d0;
pub const FORMAT_VERSION: u32 = 1;
pub const PAGE_SIZE: usize = 4096;

/// Every section of a database, in file order. The transform block is
/// split into its constituent arrays so each can be mapped and sized
/// independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SectionId {
    TransformNameFwd,
    TransformNameRev,
    TransformEncFwd,
    TransformEncRev,
    TransformRevId,
    TransformIndexFwd,
    TransformIndexRev,
    Signature,
    SignatureIndex,
    Hint,
    HintIndex,
    Imprint,
    ImprintIndex,
    Member,
    MemberIndex,
    Pair,
    PairIndex,
}

pub const SECTION_COUNT: usize = 17;

pub const ALL_SECTIONS: [SectionId; SECTION_COUNT] = [
    SectionId::TransformNameFwd,
    SectionId::TransformNameRev,
    SectionId::TransformEncFwd,
    SectionId::TransformEncRev,
    SectionId::TransformRevId,
    SectionId::TransformIndexFwd,
    SectionId::TransformIndexRev,
    SectionId::Signature,
    SectionId::SignatureIndex,
    SectionId::Hint,
    SectionId::HintIndex,
    SectionId::Imprint,
    SectionId::ImprintIndex,
    SectionId::Member,
    SectionId::MemberIndex,
    SectionId::Pair,
    SectionId::PairIndex,
];

/// All transform sections; they travel as one unit.
pub const TRANSFORM_MASK: u32 = (1 << SectionId::TransformNameFwd as u32)
    | (1 << SectionId::TransformNameRev as u32)
    | (1 << SectionId::TransformEncFwd as u32)
    | (1 << SectionId::TransformEncRev as u32)
    | (1 << SectionId::TransformRevId as u32)
    | (1 << SectionId::TransformIndexFwd as u32)
    | (1 << SectionId::TransformIndexRev as u32);

impl SectionId {
    #[inline]
    pub fn mask(self) -> u32 {
        1 << self as u32
    }

    /// Bytes per record of this section.
    pub fn record_size(self) -> usize {
        match self {
            SectionId::TransformNameFwd | SectionId::TransformNameRev => TRANSFORM_NAME_LEN,
            SectionId::TransformEncFwd | SectionId::TransformEncRev => 8,
            SectionId::TransformRevId => 4,
            SectionId::TransformIndexFwd | SectionId::TransformIndexRev => 4,
            SectionId::Signature => 48,
            SectionId::Hint => 4 * HINT_SLOTS,
            SectionId::Imprint => std::mem::size_of::<Footprint>() + 8,
            SectionId::Member => 88,
            SectionId::Pair => 8,
            SectionId::SignatureIndex
            | SectionId::HintIndex
            | SectionId::ImprintIndex
            | SectionId::MemberIndex
            | SectionId::PairIndex => 4,
        }
    }

    /// True for the hash-table sections, whose capacity is a prime and
    /// whose entry 0 is an ordinary slot rather than a reserved record.
    pub fn is_index(self) -> bool {
        matches!(
            self,
            SectionId::TransformIndexFwd
                | SectionId::TransformIndexRev
                | SectionId::SignatureIndex
                | SectionId::HintIndex
                | SectionId::ImprintIndex
                | SectionId::MemberIndex
                | SectionId::PairIndex
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            SectionId::TransformNameFwd => "transformNameFwd",
            SectionId::TransformNameRev => "transformNameRev",
            SectionId::TransformEncFwd => "transformEncFwd",
            SectionId::TransformEncRev => "transformEncRev",
            SectionId::TransformRevId => "transformRevId",
            SectionId::TransformIndexFwd => "transformIndexFwd",
            SectionId::TransformIndexRev => "transformIndexRev",
            SectionId::Signature => "signature",
            SectionId::SignatureIndex => "signatureIndex",
            SectionId::Hint => "hint",
            SectionId::HintIndex => "hintIndex",
            SectionId::Imprint => "imprint",
            SectionId::ImprintIndex => "imprintIndex",
            SectionId::Member => "member",
            SectionId::MemberIndex => "memberIndex",
            SectionId::Pair => "pair",
            SectionId::PairIndex => "pairIndex",
        }
    }
}

/// Renders a section bitmask for diagnostics, e.g. `[signature,member]`.
pub fn mask_to_text(mask: u32) -> String {
    let names: Vec<&str> = ALL_SECTIONS
        .iter()
        .filter(|s| mask & s.mask() != 0)
        .map(|s| s.name())
        .collect();
    format!("[{}]", names.join(","))
}

/// Parsed file header.
#[derive(Debug, Clone)]
pub struct Header {
    pub version: u32,
    pub creation_flags: u32,
    pub interleave: u32,
    pub interleave_step: u32,
    pub file_size: u64,
    /// `(num, max)` per section, file order.
    pub counts: [(u32, u32); SECTION_COUNT],
    /// Absolute byte offset per section.
    pub offsets: [u64; SECTION_COUNT],
}

pub const HEADER_SIZE: usize = 4 * 6 + 8 + SECTION_COUNT * 8 + SECTION_COUNT * 8;

#[derive(Debug)]
pub enum LayoutError {
    Io(io::Error),
    BadMagic(u32),
    BadVersion(u32),
    Truncated { need: u64, have: u64 },
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayoutError::Io(e) => write!(f, "i/o: {}", e),
            LayoutError::BadMagic(m) => write!(f, "bad magic 0x{:08x}, not a catalogue database", m),
            LayoutError::BadVersion(v) => write!(f, "unsupported format version {}", v),
            LayoutError::Truncated { need, have } => {
                write!(f, "file truncated: header describes {} bytes, file has {}", need, have)
            }
        }
    }
}

impl std::error::Error for LayoutError {}

impl From<io::Error> for LayoutError {
    fn from(e: io::Error) -> Self {
        LayoutError::Io(e)
    }
}

impl Header {
    pub fn write_to(&self, mut w: impl Write) -> io::Result<()> {
        w.write_all(&MAGIC.to_le_bytes())?;
        w.write_all(&self.version.to_le_bytes())?;
        w.write_all(&self.creation_flags.to_le_bytes())?;
        w.write_all(&self.interleave.to_le_bytes())?;
        w.write_all(&self.interleave_step.to_le_bytes())?;
        w.write_all(&0u32.to_le_bytes())?; // pad to 8-byte alignment
        w.write_all(&self.file_size.to_le_bytes())?;
        for (num, max) in &self.counts {
            w.write_all(&num.to_le_bytes())?;
            w.write_all(&max.to_le_bytes())?;
        }
        for offset in &self.offsets {
            w.write_all(&offset.to_le_bytes())?;
        }
        Ok(())
    }

    pub fn read_from(mut r: impl Read) -> Result<Header, LayoutError> {
        let mut u32buf = [0u8; 4];
        let mut u64buf = [0u8; 8];
        let mut next_u32 = |r: &mut dyn Read| -> io::Result<u32> {
            r.read_exact(&mut u32buf)?;
            Ok(u32::from_le_bytes(u32buf))
        };

        let magic = next_u32(&mut r)?;
        if magic != MAGIC {
            return Err(LayoutError::BadMagic(magic));
        }
        let version = next_u32(&mut r)?;
        if version != FORMAT_VERSION {
            return Err(LayoutError::BadVersion(version));
        }
        let creation_flags = next_u32(&mut r)?;
        let interleave = next_u32(&mut r)?;
        let interleave_step = next_u32(&mut r)?;
        let _pad = next_u32(&mut r)?;
        r.read_exact(&mut u64buf)?;
        let file_size = u64::from_le_bytes(u64buf);

        let mut counts = [(0u32, 0u32); SECTION_COUNT];
        for entry in counts.iter_mut() {
            entry.0 = next_u32(&mut r)?;
            entry.1 = next_u32(&mut r)?;
        }
        let mut offsets = [0u64; SECTION_COUNT];
        for offset in offsets.iter_mut() {
            r.read_exact(&mut u64buf)?;
            *offset = u64::from_le_bytes(u64buf);
        }

        Ok(Header {
            version,
            creation_flags,
            interleave,
            interleave_step,
            file_size,
            counts,
            offsets,
        })
    }
}

/// Rounds an offset up to the next page boundary.
pub fn page_align(offset: u64) -> u64 {
    offset.div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64
}
