// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::clock::DateTime;

/// Access-mode flag set for an open file, the parsed form of an
/// `fopen`-style mode string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeFlags {
    bits: u8,
}

impl ModeFlags {
    pub const RD: u8 = 0x01;
    pub const WR: u8 = 0x02;
    pub const CREATE: u8 = 0x04;
    pub const TRUNCATE: u8 = 0x08;
    pub const APPEND: u8 = 0x10;
    pub const EXCL: u8 = 0x20;
    /// Cached metadata: the directory entry is rewritten at close and
    /// explicit flush only, not at every write.
    pub const CACHED: u8 = 0x40;

    pub fn from_bits(bits: u8) -> Self {
        Self { bits }
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn contains(&self, bits: u8) -> bool {
        self.bits & bits == bits
    }

    pub fn rd(&self) -> bool {
        self.contains(Self::RD)
    }

    pub fn wr(&self) -> bool {
        self.contains(Self::WR)
    }

    /// Parses a mode string: a base of `r`, `w` or `a`, then the modifiers
    /// `+` (read and write), `b` (accepted, meaningless), `x`
    /// (exclusive-create, base `w` only) and `c` (cached metadata), each at
    /// most once.
    pub fn parse(mode: &str) -> Option<Self> {
        let mut chars = mode.chars();
        let mut bits = match chars.next()? {
            'r' => Self::RD,
            'w' => Self::WR | Self::CREATE | Self::TRUNCATE,
            'a' => Self::WR | Self::CREATE | Self::APPEND,
            _ => return None,
        };
        let base = bits;
        let (mut plus, mut binary, mut excl, mut cached) = (false, false, false, false);
        for c in chars {
            match c {
                '+' if !plus => plus = true,
                'b' if !binary => binary = true,
                'x' if !excl => excl = true,
                'c' if !cached => cached = true,
                _ => return None,
            }
        }
        if plus {
            bits |= Self::RD | Self::WR;
        }
        if excl {
            if base & Self::TRUNCATE == 0 {
                return None;
            }
            bits |= Self::EXCL;
        }
        if cached {
            bits |= Self::CACHED;
        }
        Some(Self { bits })
    }
}

/// Seek origin; the discriminants are the wire values of the public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Origin {
    Start = 0,
    Current = 1,
    End = 2,
}

/// Where an entry's directory slots live: the directory (by first cluster,
/// 0 for the fixed FAT12/16 root region), the index of the short-name slot
/// and the number of long-name slots chained before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySlotRef {
    pub dir_first_cluster: u32,
    pub slot: u32,
    pub lfn_count: u8,
}

impl EntrySlotRef {
    /// Index of the first slot of the run (first long-name slot, or the
    /// short-name slot itself).
    pub fn run_first(&self) -> u32 {
        self.slot - self.lfn_count as u32
    }

    pub fn run_len(&self) -> u32 {
        self.lfn_count as u32 + 1
    }
}

/// Last known chain position of a file handle: the `index`-th cluster of the
/// chain is `cluster`. Avoids re-walking the chain from its head on
/// sequential access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainPos {
    pub index: u32,
    pub cluster: u32,
}

/// Per-open-file state operated on by the mounted volume.
#[derive(Debug, Clone)]
pub struct FileNode {
    pub entry: EntrySlotRef,
    pub attrib: u8,
    pub first_cluster: u32,
    pub size: u32,
    pub pos: u64,
    pub flags: ModeFlags,
    pub chain_pos: Option<ChainPos>,
    /// Size or timestamps changed since the directory entry was last
    /// rewritten.
    pub meta_dirty: bool,
    pub write_time: DateTime,
}

/// Identity of an open file: slot index plus a monotonic generation so stale
/// handles are detected instead of aliasing a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle {
    pub(crate) slot: u32,
    pub(crate) gen: u32,
}

/// Snapshot of an open file's state.
#[derive(Debug, Clone, Copy)]
pub struct FileInfo {
    pub size: u32,
    pub pos: u64,
    pub eof: bool,
    pub err: bool,
    pub attrib: u8,
    pub write_time: DateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_strings() {
        assert_eq!(ModeFlags::parse("r").unwrap().bits(), ModeFlags::RD);
        assert_eq!(ModeFlags::parse("rb").unwrap().bits(), ModeFlags::RD);
        assert_eq!(
            ModeFlags::parse("r+").unwrap().bits(),
            ModeFlags::RD | ModeFlags::WR
        );
        assert_eq!(
            ModeFlags::parse("w").unwrap().bits(),
            ModeFlags::WR | ModeFlags::CREATE | ModeFlags::TRUNCATE
        );
        assert_eq!(
            ModeFlags::parse("wx").unwrap().bits(),
            ModeFlags::WR | ModeFlags::CREATE | ModeFlags::TRUNCATE | ModeFlags::EXCL
        );
        assert_eq!(
            ModeFlags::parse("a+").unwrap().bits(),
            ModeFlags::RD | ModeFlags::WR | ModeFlags::CREATE | ModeFlags::APPEND
        );
        assert!(ModeFlags::parse("").is_none());
        assert!(ModeFlags::parse("q").is_none());
        assert!(ModeFlags::parse("rx").is_none());
        assert!(ModeFlags::parse("r++").is_none());
    }
}
