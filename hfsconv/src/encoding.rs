//! Classic Mac OS text encoding conversion.
//!
//! HFS (16-bit) volumes store catalog names as Pascal strings in whatever
//! script the volume's creator selected; HFS+ stores names as UTF-16.
//! Converting a volume means converting every name from its source script
//! to Unicode. Script code 0 (`smRoman`) is also the default used when a
//! volume or file does not specify one explicitly.

use crate::error::{Error, Result};

/// Classic `ScriptCode` values relevant to HFS volumes encountered in
/// practice. Unlisted codes are accepted as opaque integers but have no
/// conversion table here and fall back to MacRoman with a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptCode {
    Roman,
    Japanese,
    TradChinese,
    Korean,
    Arabic,
    Hebrew,
    Greek,
    Cyrillic,
    SimpChinese,
    Thai,
    Other(u8),
}

impl ScriptCode {
    pub fn from_u8(code: u8) -> Self {
        match code {
            0 => ScriptCode::Roman,
            1 => ScriptCode::Japanese,
            2 => ScriptCode::TradChinese,
            3 => ScriptCode::Korean,
            4 => ScriptCode::Arabic,
            5 => ScriptCode::Hebrew,
            6 => ScriptCode::Greek,
            7 => ScriptCode::Cyrillic,
            25 => ScriptCode::SimpChinese,
            21 => ScriptCode::Thai,
            other => ScriptCode::Other(other),
        }
    }
}

/// Mac OS Roman -> Unicode scalar value, for code points 0x80-0xFF.
/// 0x00-0x7F is identical to ASCII.
const MAC_ROMAN_HIGH: [u16; 128] = [
    0x00C4, 0x00C5, 0x00C7, 0x00C9, 0x00D1, 0x00D6, 0x00DC, 0x00E1, 0x00E0, 0x00E2, 0x00E4, 0x00E3,
    0x00E5, 0x00E7, 0x00E9, 0x00E8, 0x00EA, 0x00EB, 0x00ED, 0x00EC, 0x00EE, 0x00EF, 0x00F1, 0x00F3,
    0x00F2, 0x00F4, 0x00F6, 0x00F5, 0x00FA, 0x00F9, 0x00FB, 0x00FC, 0x2020, 0x00B0, 0x00A2, 0x00A3,
    0x00A7, 0x2022, 0x00B6, 0x00DF, 0x00AE, 0x00A9, 0x2122, 0x00B4, 0x00A8, 0x2260, 0x00C6, 0x00D8,
    0x221E, 0x00B1, 0x2264, 0x2265, 0x00A5, 0x00B5, 0x2202, 0x2211, 0x220F, 0x03C0, 0x222B, 0x00AA,
    0x00BA, 0x03A9, 0x00E6, 0x00F8, 0x00BF, 0x00A1, 0x00AC, 0x221A, 0x0192, 0x2248, 0x2206, 0x00AB,
    0x00BB, 0x2026, 0x00A0, 0x00C0, 0x00C3, 0x00D5, 0x0152, 0x0153, 0x2013, 0x2014, 0x201C, 0x201D,
    0x2018, 0x2019, 0x00F7, 0x25CA, 0x00FF, 0x0178, 0x2044, 0x20AC, 0x2039, 0x203A, 0xFB01, 0xFB02,
    0x2021, 0x00B7, 0x201A, 0x201E, 0x2030, 0x00C2, 0x00CA, 0x00C1, 0x00CB, 0x00C8, 0x00CD, 0x00CE,
    0x00CF, 0x00CC, 0x00D3, 0x00D4, 0xF8FF, 0x00D2, 0x00DA, 0x00DB, 0x00D9, 0x0131, 0x02C6, 0x02DC,
    0x00AF, 0x02D8, 0x02D9, 0x02DA, 0x00B8, 0x02DD, 0x02DB, 0x02C7,
];

/// Decode a MacRoman Pascal-string byte slice (already stripped of its
/// length byte) to a Rust `String`.
pub fn mac_roman_to_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if b < 0x80 {
                b as char
            } else {
                char::from_u32(MAC_ROMAN_HIGH[(b - 0x80) as usize] as u32).unwrap_or('\u{FFFD}')
            }
        })
        .collect()
}

/// Encode a Rust string to MacRoman bytes, for round-tripping names that
/// came from a MacRoman HFS volume into an archive. Characters outside the
/// MacRoman repertoire map to '?'.
pub fn string_to_mac_roman(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| {
            if (c as u32) < 0x80 {
                c as u8
            } else {
                MAC_ROMAN_HIGH
                    .iter()
                    .position(|&u| u == c as u16)
                    .map(|i| (i + 0x80) as u8)
                    .unwrap_or(b'?')
            }
        })
        .collect()
}

/// Convert an HFS catalog name (script-coded Pascal string bytes) to a
/// UTF-16 HFSUniStr255-style code point vector, per the volume's script
/// code. Non-Roman scripts outside this module's tables fall back to
/// MacRoman and report it via the returned bool (`true` = fallback used).
pub fn hfs_name_to_utf16(bytes: &[u8], script: ScriptCode) -> (Vec<u16>, bool) {
    match script {
        ScriptCode::Roman => (mac_roman_to_string(bytes).encode_utf16().collect(), false),
        _ => (mac_roman_to_string(bytes).encode_utf16().collect(), true),
    }
}

/// Extract a script code from an HFS catalog record's extended Finder flags
/// low byte, per the rule: a zero low nibble means "use the volume default";
/// a nonzero low nibble is only a script code when the high nibble carries
/// `HAS_CUSTOM_BADGE` (bit 8, 0x0100 in the full flags word).
pub const EXTENDED_FLAG_HAS_SCRIPT: u16 = 0x0100;

pub fn script_code_from_extended_flags(flags: u16, volume_default: ScriptCode) -> ScriptCode {
    let low_nibble = (flags & 0x000F) as u8;
    if low_nibble == 0 || flags & EXTENDED_FLAG_HAS_SCRIPT == 0 {
        volume_default
    } else {
        ScriptCode::from_u8(low_nibble)
    }
}

/// Decode a classic-Mac Pascal-string name (length byte already stripped)
/// to HFSUniStr255-style UTF-16 code units, per TN1150's `HFSUniStr255`.
/// Non-Roman scripts fall back to MacRoman (see [`hfs_name_to_utf16`]);
/// callers that need to know whether the fallback happened should call
/// that function directly and report the `bool` as a [`crate::error::Warning`].
pub fn pascal_to_uni_str255(bytes: &[u8], script: ScriptCode) -> Vec<u16> {
    hfs_name_to_utf16(bytes, script).0
}

/// Inverse of [`pascal_to_uni_str255`]: encode an HFSUniStr255-style name
/// back to a MacRoman Pascal-string body (no length byte). Fails with
/// [`Error::EncodingFailure`] when a character has no MacRoman
/// representation, or when the result would exceed the 31-byte Pascal
/// string limit.
pub fn uni_str255_to_pascal(name: &[u16]) -> Result<Vec<u8>> {
    let s = crate::unicode::utf16_to_string(name);
    let mut out = Vec::with_capacity(name.len());
    for c in s.chars() {
        if (c as u32) < 0x80 {
            out.push(c as u8);
        } else if let Some(pos) = MAC_ROMAN_HIGH.iter().position(|&u| u == c as u16) {
            out.push((pos + 0x80) as u8);
        } else {
            return Err(Error::EncodingFailure(format!("character {c:?} has no MacRoman representation")));
        }
    }
    if out.len() > 31 {
        return Err(Error::EncodingFailure(format!("name is {} bytes, exceeds the 31-byte Pascal string limit", out.len())));
    }
    Ok(out)
}

/// Upper bound, in bytes, on the on-disk size of an `HFSUniStr255` encoding
/// `name`: a 2-byte length plus up to 255 UTF-16 code units.
pub fn estimate_size_of_hfs_uni_str255(name: &[u16]) -> usize {
    2 + 2 * name.len().min(255)
}

/// Substitute path-unsafe characters for presentation/conversion: HFS+
/// reserves `/` as the path separator (where classic HFS reserved `:`), so
/// a literal `/` carried over from an HFS name is swapped to `:`; stray
/// control bytes are mapped the same way since neither system's Finder
/// ever wrote them deliberately.
pub fn string_by_escaping_string(name: &str) -> String {
    name.chars().map(|c| if c == '/' || (c as u32) < 0x20 { ':' } else { c }).collect()
}

/// Validate that a name round-trips through UTF-16 cleanly; HFS+ rejects
/// names containing U+0000 and colons are reserved as the path separator,
/// matching the classic Mac OS convention.
pub fn validate_hfs_plus_name(name: &[u16]) -> Result<()> {
    if name.is_empty() {
        return Err(Error::EncodingFailure("empty catalog name".into()));
    }
    if name.len() > 255 {
        return Err(Error::EncodingFailure(format!(
            "catalog name too long: {} UTF-16 units (max 255)",
            name.len()
        )));
    }
    if name.contains(&0) {
        return Err(Error::EncodingFailure("catalog name contains NUL".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_roman_ascii_roundtrip() {
        let s = "Hello, World!";
        assert_eq!(mac_roman_to_string(s.as_bytes()), s);
        assert_eq!(string_to_mac_roman(s), s.as_bytes());
    }

    #[test]
    fn mac_roman_accented_roundtrip() {
        let s = "café";
        let encoded = string_to_mac_roman(s);
        assert_eq!(mac_roman_to_string(&encoded), s);
    }

    #[test]
    fn script_code_default_on_zero_low_nibble() {
        let sc = script_code_from_extended_flags(0x0000, ScriptCode::Roman);
        assert_eq!(sc, ScriptCode::Roman);
    }

    #[test]
    fn script_code_requires_custom_badge_bit() {
        // low byte nonzero but HAS_CUSTOM_BADGE not set: still default.
        let sc = script_code_from_extended_flags(0x0001, ScriptCode::Roman);
        assert_eq!(sc, ScriptCode::Roman);
    }

    #[test]
    fn script_code_extracted_when_flagged() {
        let sc = script_code_from_extended_flags(0x0101, ScriptCode::Roman);
        assert_eq!(sc, ScriptCode::Japanese);
    }

    #[test]
    fn rejects_nul_name() {
        assert!(validate_hfs_plus_name(&[0x41, 0x00, 0x42]).is_err());
    }
}
