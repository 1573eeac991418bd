//! 8.3 short names and VFAT long file name entries.

use std::collections::HashSet;

pub(crate) const DIR_ENTRY_LEN: usize = 32;
pub(crate) const ATTR_LFN: u8 = 0x0f;
const LFN_CHARS_PER_ENTRY: usize = 13;
const LAST_LFN_FLAG: u8 = 0x40;
/// Byte offsets of the UTF-16 code units within an LFN entry.
const LFN_CHAR_OFFSETS: [usize; LFN_CHARS_PER_ENTRY] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

/// A space padded `NAME    EXT` short name.
pub(crate) type ShortName = [u8; 11];

fn is_short_char(c: char) -> bool {
    c.is_ascii_uppercase()
        || c.is_ascii_digit()
        || matches!(
            c,
            '!' | '#' | '$' | '%' | '&' | '\'' | '(' | ')' | '-' | '@' | '^' | '_' | '`' | '{'
                | '}' | '~'
        )
}

fn pad(s: &str, buf: &mut [u8]) {
    buf.fill(b' ');
    for (d, s) in buf.iter_mut().zip(s.bytes()) {
        *d = s;
    }
}

/// If `name` is already a valid upper case 8.3 name, return it in short
/// form. Such names need no long name entries.
pub(crate) fn exact_short_name(name: &str) -> Option<ShortName> {
    let (base, ext) = match name.rsplit_once('.') {
        Some((b, e)) => (b, e),
        None => (name, ""),
    };
    let valid = |s: &str, max: usize| s.len() <= max && s.chars().all(is_short_char);
    if base.is_empty() || !valid(base, 8) || !valid(ext, 3) || (name.ends_with('.')) {
        return None;
    }
    let mut out = [b' '; 11];
    pad(base, &mut out[..8]);
    pad(ext, &mut out[8..]);
    Some(out)
}

fn squash(s: &str) -> String {
    s.chars()
        .filter(|c| *c != ' ' && *c != '.')
        .map(|c| {
            let c = c.to_ascii_uppercase();
            if is_short_char(c) {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Derive a unique `BASE~N.EXT` short name for a long name.
pub(crate) fn generated_short_name(name: &str, used: &HashSet<ShortName>) -> ShortName {
    let (base, ext) = match name.rsplit_once('.') {
        Some((b, e)) if !b.is_empty() => (squash(b), squash(e)),
        _ => (squash(name), String::new()),
    };
    let ext: String = ext.chars().take(3).collect();
    let mut out = [b' '; 11];
    pad(&ext, &mut out[8..]);
    for n in 1u32.. {
        let tail = format!("~{n}");
        let keep = 8usize.saturating_sub(tail.len());
        let base: String = base.chars().take(keep).collect();
        pad(&format!("{base}{tail}"), &mut out[..8]);
        if !used.contains(&out) {
            break;
        }
    }
    out
}

/// The checksum of a short name which every LFN entry carries.
pub(crate) fn lfn_checksum(short: &ShortName) -> u8 {
    short
        .iter()
        .fold(0u8, |sum, &b| (sum >> 1).wrapping_add(sum << 7).wrapping_add(b))
}

/// How many LFN entries `name` occupies.
pub(crate) fn lfn_entries_needed(name: &str) -> usize {
    name.encode_utf16().count().div_ceil(LFN_CHARS_PER_ENTRY)
}

/// Render the long name entries for `name`, in on-disk order (the
/// highest sequence number first).
pub(crate) fn lfn_entries(name: &str, short: &ShortName) -> Vec<[u8; DIR_ENTRY_LEN]> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let checksum = lfn_checksum(short);
    let count = lfn_entries_needed(name);
    let mut entries = Vec::with_capacity(count);
    for seq in (0..count).rev() {
        let mut e = [0u8; DIR_ENTRY_LEN];
        e[0] = (seq + 1) as u8;
        if seq + 1 == count {
            e[0] |= LAST_LFN_FLAG;
        }
        e[11] = ATTR_LFN;
        e[13] = checksum;
        for (i, off) in LFN_CHAR_OFFSETS.iter().enumerate() {
            let idx = seq * LFN_CHARS_PER_ENTRY + i;
            let unit = match idx.cmp(&units.len()) {
                std::cmp::Ordering::Less => units[idx],
                std::cmp::Ordering::Equal => 0x0000,
                std::cmp::Ordering::Greater => 0xffff,
            };
            e[*off..*off + 2].copy_from_slice(&unit.to_le_bytes());
        }
        entries.push(e);
    }
    entries
}

/// Extract the UTF-16 code units of one LFN entry, without padding.
pub(crate) fn lfn_units(entry: &[u8]) -> impl Iterator<Item = u16> + '_ {
    LFN_CHAR_OFFSETS
        .iter()
        .map(move |&off| u16::from_le_bytes([entry[off], entry[off + 1]]))
        .take_while(|&u| u != 0x0000 && u != 0xffff)
}

/// Render a short name as `NAME.EXT`.
pub(crate) fn short_name_display(short: &[u8]) -> String {
    let base = String::from_utf8_lossy(&short[..8]).trim_end().to_string();
    let ext = String::from_utf8_lossy(&short[8..11]).trim_end().to_string();
    if ext.is_empty() {
        base
    } else {
        format!("{base}.{ext}")
    }
}
