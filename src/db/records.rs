// SPDX-License-Identifier: Apache-2.0

//! On-disk record layouts.
//!
//! Every record is `#[repr(C)]`, padding-free and little-endian-on-disk;
//! the zerocopy derives give typed views straight into the mapped file.
//! Field order is stable: readers of older databases depend on it.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::footprint::Footprint;
use crate::metrics::HINT_SLOTS;

/// Fixed capacity of a signature or member name, terminator included.
pub const NAME_LEN: usize = 32;

/// Signature flag: the group holds at least one safe member.
pub const SIGMASK_SAFE: u32 = 1;

/// Member flags.
pub const MEMMASK_SAFE: u32 = 1;
pub const MEMMASK_COMP: u32 = 2;
pub const MEMMASK_LOCKED: u32 = 4;
pub const MEMMASK_DEPR: u32 = 8;
pub const MEMMASK_DELETE: u32 = 16;

/// Maximum head references per member.
pub const MAXHEAD: usize = 6;

/// Canonical representative of an equivalence class under input
/// relabelling and endpoint negation.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Signature {
    /// Placeholder-normalised notation, NUL padded.
    pub name: [u8; NAME_LEN],
    /// Operator node count of the canonical tree.
    pub size: u8,
    pub num_placeholder: u8,
    pub num_endpoint: u8,
    pub num_back_ref: u8,
    pub flags: u32,
    /// Id into the hint section, 0 when absent.
    pub hint_id: u32,
    /// Head of the member chain, 0 when the group is empty.
    pub first_member: u32,
}

/// A concrete tree inhabiting a signature group.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Member {
    pub name: [u8; NAME_LEN],
    pub sid: u32,
    /// Transform relating this member's layout to the group canonical.
    pub tid: u32,
    pub size: u8,
    pub num_placeholder: u8,
    pub num_endpoint: u8,
    pub num_back_ref: u8,
    pub flags: u32,
    /// Component references as interned (member, transform) pair ids.
    pub qmt: u32,
    pub tmt: u32,
    pub fmt: u32,
    /// Member ids of the head structures; 0 terminates the list.
    pub heads: [u32; MAXHEAD],
    /// Next member in the signature group chain; 0 terminates.
    pub next_member: u32,
}

/// One stored entry of the associative index: the footprint keys the hash
/// table, `(sid, tid)` is the payload.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Imprint {
    pub footprint: Footprint,
    pub sid: u32,
    pub tid: u32,
}

/// Per-signature imprint tallies, one per interleave preset row.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Hint {
    pub num_stored: [u32; HINT_SLOTS],
}

/// Interned (member, transform) tuple used as a component reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Pair {
    pub mid: u32,
    pub tid: u32,
}

/// Copies `name` into a fixed NUL-padded buffer. Oversize names are a
/// caller bug; canonical notations always fit.
pub fn pack_name(name: &str) -> [u8; NAME_LEN] {
    debug_assert!(name.len() < NAME_LEN, "name too long: {}", name);
    let mut buf = [0u8; NAME_LEN];
    buf[..name.len()].copy_from_slice(name.as_bytes());
    buf
}

/// Borrows the notation out of a fixed name buffer.
pub fn unpack_name(buf: &[u8; NAME_LEN]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    std::str::from_utf8(&buf[..end]).unwrap_or("")
}

impl Signature {
    pub fn name_str(&self) -> &str {
        unpack_name(&self.name)
    }
}

impl Member {
    pub fn name_str(&self) -> &str {
        unpack_name(&self.name)
    }
}
