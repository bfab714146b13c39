//! Name-encoding converters: UTF-8 ↔ decomposed Unicode ↔ legacy Mac encodings.
//!
//! The MacRoman converter is resident; additional encodings register through
//! the process-wide table. HFS-standard names on disk are Str31 pascal
//! strings in a legacy Mac encoding; HFS+ stores decomposed UTF-16 but keeps
//! an encoding hint per record so wrappers and old clients can round-trip.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::error::{HfsError, Result};
use crate::unicode;

/// Mac text encoding indexes (subset; others arrive via `add_converter`)
pub const ENCODING_MACROMAN: u32 = 0;
pub const ENCODING_MACJAPANESE: u32 = 1;

/// Pascal string with at most 31 payload bytes (HFS-standard name)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Str31 {
    len: u8,
    data: [u8; 31],
}

impl Str31 {
    pub fn new(payload: &[u8]) -> Result<Self> {
        if payload.len() > 31 {
            return Err(HfsError::NameTooLong);
        }
        let mut data = [0u8; 31];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Str31 {
            len: payload.len() as u8,
            data,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Pascal-string payload -> decomposed Unicode. Total: never fails.
pub type ToUnicodeFn = fn(&[u8]) -> Vec<u16>;

/// Decomposed Unicode -> pascal payload. `bool` reports lossy fallback chars.
pub type FromUnicodeFn = fn(&[u16]) -> Result<(Str31, bool)>;

#[derive(Clone, Copy)]
pub struct Converter {
    pub to_unicode: ToUnicodeFn,
    pub from_unicode: FromUnicodeFn,
}

fn registry() -> &'static Mutex<HashMap<u32, Converter>> {
    static REGISTRY: OnceLock<Mutex<HashMap<u32, Converter>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map = HashMap::new();
        map.insert(
            ENCODING_MACROMAN,
            Converter {
                to_unicode: mac_roman_to_unicode,
                from_unicode: unicode_to_mac_roman,
            },
        );
        Mutex::new(map)
    })
}

/// Install the resident converters. Idempotent.
pub fn init() {
    let _ = registry();
}

/// Remove every converter registered after `init`; MacRoman stays resident.
pub fn shutdown() {
    let mut map = registry().lock().expect("encoding registry poisoned");
    map.retain(|&enc, _| enc == ENCODING_MACROMAN);
}

pub fn add_converter(encoding: u32, conv: Converter) {
    let mut map = registry().lock().expect("encoding registry poisoned");
    map.insert(encoding, conv);
}

pub fn remove_converter(encoding: u32) {
    let mut map = registry().lock().expect("encoding registry poisoned");
    if encoding != ENCODING_MACROMAN {
        map.remove(&encoding);
    }
}

fn lookup_converter(encoding: u32) -> Option<Converter> {
    registry()
        .lock()
        .expect("encoding registry poisoned")
        .get(&encoding)
        .copied()
}

/// Bit in the volume header's encodings bitmap for a given encoding index.
pub fn encoding_bit(encoding: u32) -> u64 {
    1u64 << (encoding & 63)
}

/// Convert a UTF-8 name to an HFS-standard Str31 using `encoding`.
///
/// ':' is converted to '/' (the on-disk Mac form). If the requested encoding
/// produced fallback characters the conversion retries with MacRoman.
/// Returns the string, the encoding actually used, and whether fallback
/// characters ('?') were emitted.
pub fn utf8_to_hfs(encoding: u32, name: &str) -> Result<(Str31, u32, bool)> {
    let swapped: String = name.chars().map(|c| if c == ':' { '/' } else { c }).collect();
    let units = unicode::decompose(&unicode::string_to_utf16(&swapped));

    let conv = lookup_converter(encoding)
        .ok_or(HfsError::Unsupported("no converter for encoding"))?;
    let (s, lossy) = (conv.from_unicode)(&units)?;
    if lossy && encoding != ENCODING_MACROMAN {
        let mac = lookup_converter(ENCODING_MACROMAN)
            .ok_or(HfsError::Unsupported("no converter for encoding"))?;
        let (s2, lossy2) = (mac.from_unicode)(&units)?;
        return Ok((s2, ENCODING_MACROMAN, lossy2));
    }
    Ok((s, encoding, lossy))
}

/// Convert an HFS-standard Str31 back to UTF-8; '/' becomes ':'.
pub fn hfs_to_utf8(encoding: u32, name: &Str31) -> Result<String> {
    let conv = lookup_converter(encoding)
        .or_else(|| lookup_converter(ENCODING_MACROMAN))
        .ok_or(HfsError::Unsupported("no converter for encoding"))?;
    let units = (conv.to_unicode)(name.as_bytes());
    let s = unicode::utf16_to_string(&units);
    Ok(s.chars().map(|c| if c == '/' { ':' } else { c }).collect())
}

// ── MacRoman tables (resident converter) ─────────────────────────────────
//
// Transcribed from the classic Mac OS text-encoding tables. The reverse
// direction maps Unicode ranges through per-range tables; `b'?'` marks an
// unmapped code point and makes the conversion lossy.

const Q: u8 = b'?';

/// 0x00A0 - 0x00FF (Latin-1 supplement) -> MacRoman
static LATIN1_TABLE: [u8; 96] = [
    0xCA, 0xC1, 0xA2, 0xA3, 0xDB, 0xB4, Q, 0xA4, 0xAC, 0xA9, 0xBB, 0xC7, 0xC2, Q, 0xA8, 0xF8,
    0xA1, 0xB1, Q, Q, 0xAB, 0xB5, 0xA6, 0xE1, 0xFC, Q, 0xBC, 0xC8, Q, Q, Q, 0xC0,
    Q, Q, Q, Q, Q, Q, 0xAE, Q, Q, Q, Q, Q, Q, Q, Q, Q,
    Q, Q, Q, Q, Q, Q, Q, Q, 0xAF, Q, Q, Q, Q, Q, Q, 0xA7,
    Q, Q, Q, Q, Q, Q, 0xBE, Q, Q, Q, Q, Q, Q, Q, Q, Q,
    Q, Q, Q, Q, Q, Q, Q, 0xD6, 0xBF, Q, Q, Q, Q, Q, Q, Q,
];

/// 0x02C0 - 0x02DF (spacing modifiers) -> MacRoman
static SPACE_MODS_TABLE: [u8; 32] = [
    Q, Q, Q, Q, Q, Q, 0xF6, 0xFF, Q, Q, Q, Q, Q, Q, Q, Q,
    Q, Q, Q, Q, Q, Q, Q, Q, 0xF9, 0xFA, 0xFB, 0xFE, 0xF7, 0xFD, Q, Q,
];

/// 0x2010 - 0x20AF (general punctuation) -> MacRoman
static PUNCT_TABLE: [u8; 160] = [
    Q, Q, Q, 0xD0, 0xD1, Q, Q, Q, 0xD4, 0xD5, 0xE2, Q, 0xD2, 0xD3, 0xE3, Q,
    0xA0, 0xE0, 0xA5, Q, Q, Q, 0xC9, Q, Q, Q, Q, Q, Q, Q, Q, Q,
    0xE4, Q, Q, Q, Q, Q, Q, Q, Q, 0xDC, 0xDD, Q, Q, Q, Q, Q,
    Q, Q, Q, Q, 0xDA, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q,
    Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q,
    Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q,
    Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q,
    Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q,
    Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q,
    Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, 0xDB, Q, Q, Q,
];

/// 0x2200 - 0x2267 (mathematical operators) -> MacRoman
static MATH_TABLE: [u8; 104] = [
    Q, Q, 0xB6, Q, Q, Q, 0xC6, Q, Q, Q, Q, Q, Q, Q, Q, 0xB8,
    Q, 0xB7, Q, Q, Q, Q, Q, Q, Q, Q, 0xC3, Q, Q, Q, 0xB0, Q,
    Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, 0xBA, Q, Q, Q, Q,
    Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q,
    Q, Q, Q, Q, Q, Q, Q, Q, 0xC5, Q, Q, Q, Q, Q, Q, Q,
    Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q,
    0xAD, Q, Q, Q, 0xB2, 0xB3, Q, Q,
];

/// Two-level table folding (base letter, combining mark 0x0300-0x030A) into a
/// precomposed MacRoman byte. The first 64 entries index the base character
/// (0x40-0x7F) to a row offset; 0xDA selects the all-'?' row.
static REVERSE_COMB_TABLE: [u8; 229] = [
    // base char -> row offset
    0xDA, 0x40, 0xDA, 0xDA, 0xDA, 0x56, 0xDA, 0xDA, 0xDA, 0x6C, 0xDA, 0xDA, 0xDA, 0xDA, 0x82, 0x98,
    0xDA, 0xDA, 0xDA, 0xDA, 0xDA, 0xAE, 0xDA, 0xDA, 0xDA, 0xC4, 0xDA, 0xDA, 0xDA, 0xDA, 0xDA, 0xDA,
    0xDA, 0x4B, 0xDA, 0xDA, 0xDA, 0x61, 0xDA, 0xDA, 0xDA, 0x77, 0xDA, 0xDA, 0xDA, 0xDA, 0x8D, 0xA3,
    0xDA, 0xDA, 0xDA, 0xDA, 0xDA, 0xB9, 0xDA, 0xDA, 0xDA, 0xCF, 0xDA, 0xDA, 0xDA, 0xDA, 0xDA, 0xDA,
    // 'A'
    0xCB, 0xE7, 0xE5, 0xCC, Q, Q, Q, Q, 0x80, Q, 0x81,
    // 'a'
    0x88, 0x87, 0x89, 0x8B, Q, Q, Q, Q, 0x8A, Q, 0x8C,
    // 'E'
    0xE9, 0x83, 0xE6, Q, Q, Q, Q, Q, 0xE8, Q, Q,
    // 'e'
    0x8F, 0x8E, 0x90, Q, Q, Q, Q, Q, 0x91, Q, Q,
    // 'I'
    0xED, 0xEA, 0xEB, Q, Q, Q, Q, Q, 0xEC, Q, Q,
    // 'i'
    0x93, 0x92, 0x94, Q, Q, Q, Q, Q, 0x95, Q, Q,
    // 'N'
    Q, Q, Q, 0x84, Q, Q, Q, Q, Q, Q, Q,
    // 'n'
    Q, Q, Q, 0x96, Q, Q, Q, Q, Q, Q, Q,
    // 'O'
    0xF1, 0xEE, 0xEF, 0xCD, Q, Q, Q, Q, 0x85, Q, Q,
    // 'o'
    0x98, 0x97, 0x99, 0x9B, Q, Q, Q, Q, 0x9A, Q, Q,
    // 'U'
    0xF4, 0xF2, 0xF3, Q, Q, Q, Q, Q, 0x86, Q, Q,
    // 'u'
    0x9D, 0x9C, 0x9E, Q, Q, Q, Q, Q, 0x9F, Q, Q,
    // 'Y'
    Q, Q, Q, Q, Q, Q, Q, Q, 0xD9, Q, Q,
    // 'y'
    Q, Q, Q, Q, Q, Q, Q, Q, 0xD8, Q, Q,
    // else
    Q, Q, Q, Q, Q, Q, Q, Q, Q, Q, Q,
];

/// MacRoman 0x80-0xFF -> Unicode base character
static HI_BIT_BASE_UNICODE: [u16; 128] = [
    0x0041, 0x0041, 0x0043, 0x0045, 0x004e, 0x004f, 0x0055, 0x0061,
    0x0061, 0x0061, 0x0061, 0x0061, 0x0061, 0x0063, 0x0065, 0x0065,
    0x0065, 0x0065, 0x0069, 0x0069, 0x0069, 0x0069, 0x006e, 0x006f,
    0x006f, 0x006f, 0x006f, 0x006f, 0x0075, 0x0075, 0x0075, 0x0075,
    0x2020, 0x00b0, 0x00a2, 0x00a3, 0x00a7, 0x2022, 0x00b6, 0x00df,
    0x00ae, 0x00a9, 0x2122, 0x00b4, 0x00a8, 0x2260, 0x00c6, 0x00d8,
    0x221e, 0x00b1, 0x2264, 0x2265, 0x00a5, 0x00b5, 0x2202, 0x2211,
    0x220f, 0x03c0, 0x222b, 0x00aa, 0x00ba, 0x03a9, 0x00e6, 0x00f8,
    0x00bf, 0x00a1, 0x00ac, 0x221a, 0x0192, 0x2248, 0x2206, 0x00ab,
    0x00bb, 0x2026, 0x00a0, 0x0041, 0x0041, 0x004f, 0x0152, 0x0153,
    0x2013, 0x2014, 0x201c, 0x201d, 0x2018, 0x2019, 0x00f7, 0x25ca,
    0x0079, 0x0059, 0x2044, 0x20ac, 0x2039, 0x203a, 0xfb01, 0xfb02,
    0x2021, 0x00b7, 0x201a, 0x201e, 0x2030, 0x0041, 0x0045, 0x0041,
    0x0045, 0x0045, 0x0049, 0x0049, 0x0049, 0x0049, 0x004f, 0x004f,
    0xf8ff, 0x004f, 0x0055, 0x0055, 0x0055, 0x0131, 0x02c6, 0x02dc,
    0x00af, 0x02d8, 0x02d9, 0x02da, 0x00b8, 0x02dd, 0x02db, 0x02c7,
];

/// MacRoman 0x80-0xFF -> trailing combining mark (0 when none)
static HI_BIT_COMB_UNICODE: [u16; 128] = [
    0x0308, 0x030a, 0x0327, 0x0301, 0x0303, 0x0308, 0x0308, 0x0301,
    0x0300, 0x0302, 0x0308, 0x0303, 0x030a, 0x0327, 0x0301, 0x0300,
    0x0302, 0x0308, 0x0301, 0x0300, 0x0302, 0x0308, 0x0303, 0x0301,
    0x0300, 0x0302, 0x0308, 0x0303, 0x0301, 0x0300, 0x0302, 0x0308,
    0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000,
    0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000,
    0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000,
    0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000,
    0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000,
    0x0000, 0x0000, 0x0000, 0x0300, 0x0303, 0x0303, 0x0000, 0x0000,
    0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000,
    0x0308, 0x0308, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000,
    0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0302, 0x0302, 0x0301,
    0x0308, 0x0300, 0x0301, 0x0302, 0x0308, 0x0300, 0x0301, 0x0302,
    0x0000, 0x0300, 0x0301, 0x0302, 0x0300, 0x0000, 0x0000, 0x0000,
    0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000, 0x0000,
];

/// MacRoman pascal payload -> fully decomposed Unicode.
pub fn mac_roman_to_unicode(payload: &[u8]) -> Vec<u16> {
    let mut out = Vec::with_capacity(payload.len() * 2);
    for &c in payload {
        if c < 0x80 {
            out.push(c as u16);
        } else {
            let idx = (c & 0x7F) as usize;
            let base = HI_BIT_BASE_UNICODE[idx];
            out.push(base);
            // alpha base characters carry a combining mark
            if base >= u16::from(b'A') && base <= u16::from(b'z') {
                out.push(HI_BIT_COMB_UNICODE[idx]);
            }
        }
    }
    out
}

/// Fully decomposed Unicode -> MacRoman pascal payload.
pub fn unicode_to_mac_roman(units: &[u16]) -> Result<(Str31, bool)> {
    let mut out: Vec<u8> = Vec::with_capacity(units.len());
    let mut lossy = false;
    let mut prev: u8 = 0;

    for c in units.iter().copied() {
        let lsb = (c & 0xFF) as u8;
        let mc: u8;

        if (c & 0xFF80) == 0 {
            // 7-bit ascii passes through
            prev = lsb;
            if out.len() >= 31 {
                return Err(HfsError::NameTooLong);
            }
            out.push(lsb);
            continue;
        }

        mc = match c & 0xFF00 {
            0x0000 if lsb >= 0xA0 => LATIN1_TABLE[(lsb - 0xA0) as usize],
            0x0200 if (0xC0..=0xDF).contains(&lsb) => SPACE_MODS_TABLE[(lsb - 0xC0) as usize],
            0x2000 if (0x10..=0xAF).contains(&lsb) => PUNCT_TABLE[(lsb - 0x10) as usize],
            0x2200 if lsb < 0x68 => MATH_TABLE[lsb as usize],
            0x0300 => {
                if c <= 0x030A {
                    if prev >= b'A' && prev < b'z' {
                        let row = REVERSE_COMB_TABLE[(prev - 0x40) as usize] as usize;
                        out.pop(); // base char folds into the composed byte
                        REVERSE_COMB_TABLE[row + lsb as usize]
                    } else {
                        Q
                    }
                } else {
                    match c {
                        0x0327 if prev == b'C' => {
                            out.pop();
                            0x82
                        }
                        0x0327 if prev == b'c' => {
                            out.pop();
                            0x8D
                        }
                        0x03A9 => 0xBD, // omega
                        0x03C0 => 0xB9, // pi
                        _ => Q,
                    }
                }
            }
            _ => match c {
                0x0131 => 0xF5, // dotless i
                0x0152 => 0xCE, // OE
                0x0153 => 0xCF, // oe
                0x0192 => 0xC4, // florin
                0x2122 => 0xAA, // TM
                0x25CA => 0xD7, // diamond
                0xF8FF => 0xF0, // apple logo
                0xFB01 => 0xDE, // fi
                0xFB02 => 0xDF, // fl
                _ => Q,
            },
        };

        if mc == Q {
            lossy = true;
        }
        prev = 0;
        if out.len() >= 31 {
            return Err(HfsError::NameTooLong);
        }
        out.push(mc);
    }

    Ok((Str31::new(&out)?, lossy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unicode::{decompose, string_to_utf16};

    #[test]
    fn ascii_roundtrip() {
        let (s, enc, lossy) = utf8_to_hfs(ENCODING_MACROMAN, "Desktop Folder").unwrap();
        assert_eq!(s.as_bytes(), b"Desktop Folder");
        assert_eq!(enc, ENCODING_MACROMAN);
        assert!(!lossy);
        assert_eq!(hfs_to_utf8(ENCODING_MACROMAN, &s).unwrap(), "Desktop Folder");
    }

    #[test]
    fn accented_roundtrip() {
        // é decomposes to e + U+0301 and composes back to MacRoman 0x8E
        let units = decompose(&string_to_utf16("résumé"));
        let (s, lossy) = unicode_to_mac_roman(&units).unwrap();
        assert!(!lossy);
        assert_eq!(s.as_bytes(), &[b'r', 0x8E, b's', b'u', b'm', 0x8E]);

        let back = mac_roman_to_unicode(s.as_bytes());
        assert_eq!(back, units);
    }

    #[test]
    fn unmapped_becomes_fallback() {
        // Japanese "日" has no MacRoman mapping
        let units = string_to_utf16("日x");
        let (s, lossy) = unicode_to_mac_roman(&units).unwrap();
        assert!(lossy);
        assert_eq!(s.as_bytes(), b"?x");
    }

    #[test]
    fn colon_slash_swap() {
        let (s, _, _) = utf8_to_hfs(ENCODING_MACROMAN, "a:b").unwrap();
        assert_eq!(s.as_bytes(), b"a/b");
        assert_eq!(hfs_to_utf8(ENCODING_MACROMAN, &s).unwrap(), "a:b");
    }

    #[test]
    fn name_too_long() {
        let long = "x".repeat(32);
        assert!(matches!(
            utf8_to_hfs(ENCODING_MACROMAN, &long),
            Err(HfsError::NameTooLong)
        ));
    }

    #[test]
    fn symbols_map() {
        // π and Ω live in the 0x03xx page without combining behavior
        let units = string_to_utf16("πΩ");
        let (s, lossy) = unicode_to_mac_roman(&units).unwrap();
        assert!(!lossy);
        assert_eq!(s.as_bytes(), &[0xB9, 0xBD]);
    }
}
