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

use tapir_err::{Error, NameError, Result};

/// Characters that may not appear in an entry name.
const RESERVED: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// A canonical volume-relative path: validated components, `.` and `..`
/// already reduced. An empty component list addresses the root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VPath {
    comps: Vec<String>,
}

impl VPath {
    pub fn root() -> Self {
        Self { comps: Vec::new() }
    }

    pub fn components(&self) -> &[String] {
        &self.comps
    }

    pub fn is_root(&self) -> bool {
        self.comps.is_empty()
    }

    /// The final component, `None` for the root.
    pub fn base(&self) -> Option<&str> {
        self.comps.last().map(String::as_str)
    }

    /// Everything up to the final component.
    pub fn parent(&self) -> Option<VPath> {
        if self.comps.is_empty() {
            return None;
        }
        Some(VPath { comps: self.comps[..self.comps.len() - 1].to_vec() })
    }

    pub fn join(&self) -> String {
        let mut out = String::from("/");
        out.push_str(&self.comps.join("/"));
        out
    }
}

/// A fully resolved path: the volume it addresses plus the path on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullPath {
    pub vol: String,
    pub path: VPath,
}

impl FullPath {
    pub fn join(&self) -> String {
        format!("{}{}", self.vol, self.path.join())
    }
}

/// Splits a leading `driver:unit:` volume prefix off `path`.
pub fn split_volume(path: &str) -> Result<(Option<&str>, &str)> {
    let Some(first) = path.find(':') else {
        return Ok((None, path));
    };
    let rest = &path[first + 1..];
    let second = rest.find(':').ok_or(Error::Name(NameError::Invalid))?;
    let (driver, unit) = (&path[..first], &rest[..second]);
    if driver.is_empty()
        || !driver.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        || unit.is_empty()
        || !unit.chars().all(|c| c.is_ascii_digit())
    {
        return Err(Error::Name(NameError::Invalid));
    }
    let prefix_len = first + 1 + second + 1;
    Ok((Some(&path[..prefix_len]), &path[prefix_len..]))
}

/// Validates one entry name against the name grammar: no reserved characters,
/// no control characters, non-empty, no trailing space or dot, and at most
/// `max_name` UCS-2 code units.
pub fn validate_component(comp: &str, max_name: usize) -> Result<()> {
    if comp.is_empty() {
        return Err(Error::Name(NameError::Invalid));
    }
    if comp.chars().any(|c| RESERVED.contains(&c) || (c as u32) < 0x20) {
        return Err(Error::Name(NameError::Invalid));
    }
    if comp.ends_with(' ') || comp.ends_with('.') {
        return Err(Error::Name(NameError::Invalid));
    }
    if comp.encode_utf16().count() > max_name {
        return Err(Error::Name(NameError::BaseTooLong));
    }
    Ok(())
}

/// Resolves `path` to a volume plus canonical path.
///
/// A leading volume prefix makes the path absolute on that volume. Otherwise
/// the task working directory `cwd` (itself absolute) supplies the volume
/// and, for relative paths, the leading components; without a working
/// directory the `default_vol` is used and only absolute paths resolve.
pub fn resolve(
    path: &str,
    cwd: Option<&FullPath>,
    default_vol: Option<&str>,
    max_name: usize,
    max_path: usize,
) -> Result<FullPath> {
    let (vol, rest) = split_volume(path)?;
    let (vol, mut comps, rest) = match vol {
        Some(vol) => (vol.to_string(), Vec::new(), rest),
        None if rest.starts_with(['/', '\\']) => {
            let vol = cwd
                .map(|cwd| cwd.vol.clone())
                .or_else(|| default_vol.map(str::to_string))
                .ok_or(Error::Name(NameError::Invalid))?;
            (vol, Vec::new(), rest)
        }
        None => {
            let cwd = cwd.ok_or(Error::Name(NameError::Invalid))?;
            (cwd.vol.clone(), cwd.path.components().to_vec(), rest)
        }
    };

    for comp in rest.split(['/', '\\']) {
        match comp {
            // Leading separator and separator runs yield empty components;
            // only a fully empty path is an error.
            "" => continue,
            "." => continue,
            ".." => {
                // Dot-dot above the root stays at the root.
                comps.pop();
            }
            _ => {
                validate_component(comp, max_name)?;
                comps.push(comp.to_string());
            }
        }
    }

    let path = VPath { comps };
    if path.join().encode_utf16().count() > max_path {
        return Err(Error::Name(NameError::TooLong));
    }
    Ok(FullPath { vol, path })
}
