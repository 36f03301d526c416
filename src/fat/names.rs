//! 8.3 short names and long-file-name assembly.

use byteorder::{ByteOrder, LittleEndian};

use crate::config::{MAX_LFN_SLOTS, MAX_NAME};
use crate::error::Error;

/// Stored first byte for a name that really starts with 0xE5 (which on
/// disk would mean "free slot").
const KANJI_ESCAPE: u8 = 0x05;
const FREE_SLOT: u8 = 0xE5;

/// Byte offsets of the 13 UTF-16 code units inside one LFN fragment.
const LFN_UNIT_OFFSETS: [usize; 13] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

/// Short-name checksum carried by every LFN fragment: a right-rotate and
/// add over all eleven stored bytes.
pub(super) fn short_name_checksum(short: &[u8; 11]) -> u8 {
    let mut sum = 0u8;
    for &byte in short.iter() {
        sum = ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(byte);
    }
    sum
}

/// Render a raw 8.3 name for display: trim the space padding, insert the
/// dot, translate the 0x05 escape back and lower-case the result.
pub(super) fn short_name_to_display(raw: &[u8; 11], out: &mut [u8]) -> usize {
    let mut len = 0usize;

    for (i, &b) in raw[..8].iter().enumerate() {
        if b == b' ' {
            break;
        }
        if len >= out.len() {
            return len;
        }
        out[len] = if i == 0 && b == KANJI_ESCAPE {
            FREE_SLOT
        } else {
            b.to_ascii_lowercase()
        };
        len += 1;
    }

    if raw[8] != b' ' {
        if len >= out.len() {
            return len;
        }
        out[len] = b'.';
        len += 1;
        for &b in &raw[8..11] {
            if b == b' ' {
                break;
            }
            if len >= out.len() {
                return len;
            }
            out[len] = b.to_ascii_lowercase();
            len += 1;
        }
    }

    len
}

/// Convert a path basename into an 11-byte 8.3 name: leading dots and
/// spaces stripped, letters upper-cased, the extension taken from after
/// the last dot, anything outside the FAT-legal set replaced.
pub(super) fn basename_to_short(name: &[u8]) -> Result<[u8; 11], Error> {
    let mut start = 0;
    while start < name.len() && (name[start] == b' ' || name[start] == b'.') {
        start += 1;
    }
    let name = &name[start..];
    if name.is_empty() {
        return Err(Error::InvalidName);
    }

    let dot = name.iter().rposition(|&b| b == b'.');
    let (base, ext) = match dot {
        Some(idx) => (&name[..idx], &name[idx + 1..]),
        None => (name, &[][..]),
    };

    let mut out = [b' '; 11];
    let mut len = 0usize;
    for &b in base {
        if len >= 8 {
            break;
        }
        if b == b' ' || b == b'.' {
            continue;
        }
        out[len] = short_char(b);
        len += 1;
    }
    if len == 0 {
        return Err(Error::InvalidName);
    }
    let mut ext_len = 0usize;
    for &b in ext {
        if ext_len >= 3 {
            break;
        }
        if b == b' ' {
            continue;
        }
        out[8 + ext_len] = short_char(b);
        ext_len += 1;
    }

    if out[0] == FREE_SLOT {
        out[0] = KANJI_ESCAPE;
    }
    Ok(out)
}

/// Upper-case and restrict to the character set a short name may carry.
fn short_char(byte: u8) -> u8 {
    let up = byte.to_ascii_uppercase();
    if up.is_ascii_alphanumeric()
        || matches!(
            up,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'('
                | b')'
                | b'-'
                | b'@'
                | b'^'
                | b'_'
                | b'`'
                | b'{'
                | b'}'
                | b'~'
        )
        || up >= 0x80
    {
        up
    } else {
        b'_'
    }
}

/// Accumulates LFN fragments while iterating a directory. Fragments are
/// stored on disk last-first; a complete, checksum-matched run replaces
/// the 8.3 name of the entry that follows it.
pub(super) struct LfnState {
    expected_slots: u8,
    checksum: u8,
    seen_mask: u32,
    units: [u16; MAX_LFN_SLOTS * 13],
}

impl LfnState {
    pub(super) fn new() -> Self {
        Self {
            expected_slots: 0,
            checksum: 0,
            seen_mask: 0,
            units: [0xFFFF; MAX_LFN_SLOTS * 13],
        }
    }

    pub(super) fn clear(&mut self) {
        self.expected_slots = 0;
        self.checksum = 0;
        self.seen_mask = 0;
        self.units = [0xFFFF; MAX_LFN_SLOTS * 13];
    }

    /// Feed one 32-byte LFN fragment. Out-of-sequence or oversized runs
    /// reset the state so a later 8.3 entry falls back to its short name.
    pub(super) fn consume(&mut self, entry: &[u8]) {
        let order = entry[0];
        let seq = order & 0x1F;
        if seq == 0 || seq as usize > MAX_LFN_SLOTS {
            self.clear();
            return;
        }

        let checksum = entry[13];
        if order & 0x40 != 0 {
            // Last fragment comes first on disk and starts a fresh run.
            self.clear();
            self.expected_slots = seq;
            self.checksum = checksum;
        }
        if self.expected_slots == 0 || seq > self.expected_slots || checksum != self.checksum {
            self.clear();
            return;
        }

        let base = (seq as usize - 1) * 13;
        for (i, &off) in LFN_UNIT_OFFSETS.iter().enumerate() {
            self.units[base + i] = LittleEndian::read_u16(&entry[off..off + 2]);
        }
        self.seen_mask |= 1 << (seq - 1);
    }

    fn complete(&self, short: &[u8; 11]) -> bool {
        self.expected_slots > 0
            && self.seen_mask == (1u32 << self.expected_slots) - 1
            && self.checksum == short_name_checksum(short)
    }

    /// Produce the display name for the 8.3 entry that terminated this
    /// run: the assembled long name when the run is complete and unbroken,
    /// the rendered short name otherwise.
    pub(super) fn take_name(&self, short: &[u8; 11], out: &mut [u8; MAX_NAME]) -> usize {
        if self.complete(short) {
            let mut len = 0usize;
            let total = self.expected_slots as usize * 13;
            for &unit in &self.units[..total] {
                if unit == 0x0000 || unit == 0xFFFF {
                    break;
                }
                if let Some(ch) = char::from_u32(u32::from(unit)) {
                    let mut utf8 = [0u8; 4];
                    let encoded = ch.encode_utf8(&mut utf8).as_bytes();
                    if len + encoded.len() > out.len() {
                        break;
                    }
                    out[len..len + encoded.len()].copy_from_slice(encoded);
                    len += encoded.len();
                }
            }
            if len > 0 {
                return len;
            }
        }
        short_name_to_display(short, out)
    }
}
