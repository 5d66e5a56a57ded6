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

/// Characters legal in a short name besides letters and digits.
const SFN_SPECIALS: &[u8] = b"$%'-_@~`!(){}^#&";

/// Maximum characters one long-name slot carries.
pub const LFN_CHARS: usize = 13;

/// The short-name checksum carried by every long-name slot of a set:
/// a rotate-right-and-add over the 11 name bytes.
pub fn checksum(sfn: &[u8; 11]) -> u8 {
    sfn.iter()
        .fold(0u8, |sum, &byte| (sum >> 1 | sum << 7).wrapping_add(byte))
}

/// A 16-bit hash of the long name, for uniquifying short names past `~4`.
pub fn name_hash(name: &str) -> u16 {
    name.encode_utf16()
        .fold(0u16, |hash, unit| (hash >> 1 | hash << 15).wrapping_add(unit))
}

/// The UCS-2 units of a name as stored in long-name slots.
pub fn ucs2(name: &str) -> Vec<u16> {
    name.encode_utf16().collect()
}

pub fn lfn_slot_count(ucs2_len: usize) -> usize {
    ucs2_len.div_ceil(LFN_CHARS)
}

/// Case-insensitive name comparison in UCS-2 space.
pub fn name_eq(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

/// Derives the 8.3 basis of `name`: uppercased, illegal characters replaced
/// by `_`, embedded periods and spaces removed, truncated to 8+3.
///
/// Returns `(basis, needs_tilde, needs_lfn)`: a `~N` tail is required when
/// the basis lost characters; a long-name chain is required whenever the
/// basis does not reproduce the name exactly (including loss of case).
pub fn sfn_basis(name: &str) -> ([u8; 11], bool, bool) {
    let mut basis = [b' '; 11];
    let mut lossy = false;

    let (base, ext) = match name.rfind('.') {
        // A leading dot does not start an extension.
        Some(dot) if dot != 0 => (&name[..dot], &name[dot + 1..]),
        _ => (name, ""),
    };

    let mut put = |src: &str, range: std::ops::Range<usize>, basis: &mut [u8; 11]| {
        let mut at = range.start;
        for c in src.chars() {
            if c == '.' || c == ' ' {
                lossy = true;
                continue;
            }
            if at >= range.end {
                lossy = true;
                break;
            }
            let upper = c.to_ascii_uppercase();
            basis[at] = if upper.is_ascii_uppercase()
                || upper.is_ascii_digit()
                || SFN_SPECIALS.contains(&(upper as u8))
            {
                upper as u8
            } else {
                lossy = true;
                b'_'
            };
            at += 1;
        }
    };
    put(base, 0..8, &mut basis);
    put(ext, 8..11, &mut basis);

    let needs_lfn = lossy || !name_eq(&sfn_display(&basis), name);
    (basis, lossy, needs_lfn)
}

/// Applies a `~N` tail to a basis, optionally with a 4-digit hash of the
/// long name before it (the form used once `~1`..`~4` are all taken).
pub fn sfn_with_tail(basis: &[u8; 11], n: u32, hash: Option<u16>) -> [u8; 11] {
    let mut out = *basis;
    let tail = match hash {
        Some(hash) => format!("{hash:04X}~{n}"),
        None => format!("~{n}"),
    };
    let base_len = basis[..8].iter().rposition(|&byte| byte != b' ').map_or(0, |at| at + 1);
    let keep = base_len.min(8 - tail.len());
    out[keep..8].fill(b' ');
    out[keep..keep + tail.len()].copy_from_slice(tail.as_bytes());
    out
}

/// Formats raw 8.3 name bytes for display (`"FOO.TXT"`). The 0x05 lead-byte
/// substitute for 0xE5 is folded back.
pub fn sfn_display(sfn: &[u8; 11]) -> String {
    let mut first = sfn[0];
    if first == 0x05 {
        first = 0xE5;
    }
    let base: Vec<u8> = std::iter::once(first)
        .chain(sfn[1..8].iter().copied())
        .collect();
    let base = String::from_utf8_lossy(&base).trim_end().to_string();
    let ext = String::from_utf8_lossy(&sfn[8..11]).trim_end().to_string();
    if ext.is_empty() {
        base
    } else {
        format!("{base}.{ext}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_known_value() {
        // "FILENAMEEXT"
        let sfn = *b"FILENAMEEXT";
        let mut sum = 0u8;
        for &byte in sfn.iter() {
            sum = (sum >> 1 | sum << 7).wrapping_add(byte);
        }
        assert_eq!(checksum(&sfn), sum);
    }

    #[test]
    fn basis_clean() {
        let (basis, tilde, lfn) = sfn_basis("HELLO.TXT");
        assert_eq!(&basis, b"HELLO   TXT");
        assert!(!tilde);
        assert!(!lfn);
    }

    #[test]
    fn basis_lowercase_needs_lfn_only() {
        let (basis, tilde, lfn) = sfn_basis("hello.txt");
        assert_eq!(&basis, b"HELLO   TXT");
        assert!(!tilde);
        assert!(lfn);
    }

    #[test]
    fn basis_spaces_and_length() {
        let (basis, tilde, lfn) = sfn_basis("document with spaces.bin");
        assert_eq!(&basis, b"DOCUMENTBIN");
        assert!(tilde);
        assert!(lfn);
    }

    #[test]
    fn basis_embedded_dots() {
        let (basis, tilde, _) = sfn_basis("a.b.c");
        assert_eq!(&basis, b"AB      C  ");
        assert!(tilde);
    }

    #[test]
    fn tilde_tail() {
        let (basis, ..) = sfn_basis("document with spaces.bin");
        assert_eq!(&sfn_with_tail(&basis, 1, None), b"DOCUME~1BIN");
        let short = sfn_with_tail(b"AB      C  ", 2, None);
        assert_eq!(&short, b"AB~2    C  ");
    }

    #[test]
    fn hashed_tail() {
        let tailed = sfn_with_tail(b"DOCUMENTBIN", 1, Some(0xBEEF));
        assert_eq!(&tailed[..8], b"DOBEEF~1".as_slice());
        assert_eq!(&tailed[8..], b"BIN".as_slice());
    }

    #[test]
    fn display_roundtrip() {
        assert_eq!(sfn_display(b"HELLO   TXT"), "HELLO.TXT");
        assert_eq!(sfn_display(b"NOEXT      "), "NOEXT");
    }
}
