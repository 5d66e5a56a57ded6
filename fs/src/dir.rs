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

/// Per-open-directory state: a resumable scan position.
///
/// The cursor survives unrelated mutations of the same directory; entries
/// created or deleted behind the cursor simply do not appear in the
/// remainder of the scan.
#[derive(Debug, Clone, Copy)]
pub struct DirNode {
    /// First cluster of the directory, 0 for the fixed FAT12/16 root region.
    pub first_cluster: u32,
    /// Slot index the next read resumes at.
    pub offset: u32,
}

/// Identity of an open directory; see `FileHandle` for the slot/generation
/// scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirHandle {
    pub(crate) slot: u32,
    pub(crate) gen: u32,
}
