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

/// Entry attribute bits as stored in the on-disk attribute byte.
pub mod attrib {
    pub const READ_ONLY: u8 = 0x01;
    pub const HIDDEN: u8 = 0x02;
    pub const SYSTEM: u8 = 0x04;
    pub const VOLUME_ID: u8 = 0x08;
    pub const DIRECTORY: u8 = 0x10;
    pub const ARCHIVE: u8 = 0x20;
    pub const LONG_NAME: u8 = READ_ONLY | HIDDEN | SYSTEM | VOLUME_ID;

    /// Bits a caller may change through `entry_attrib_set`.
    pub const SETTABLE: u8 = READ_ONLY | HIDDEN | SYSTEM | ARCHIVE;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// Entry-type filter for delete operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeMask {
    File,
    Dir,
    Any,
}

impl TypeMask {
    pub fn accepts(&self, kind: EntryKind) -> bool {
        match self {
            TypeMask::File => kind == EntryKind::File,
            TypeMask::Dir => kind == EntryKind::Dir,
            TypeMask::Any => true,
        }
    }
}

/// Which timestamp(s) `entry_time_set` rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeKind {
    Create,
    Modify,
    Access,
    All,
}

#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub name: String,
    pub kind: EntryKind,
    pub attrib: u8,
    pub size: u32,
    pub first_cluster: u32,
    pub create: DateTime,
    pub write: DateTime,
    pub access: DateTime,
}

impl EntryInfo {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}
