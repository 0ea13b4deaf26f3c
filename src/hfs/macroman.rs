//! Mac Roman name handling for catalog keys and the volume name

use std::cmp::Ordering;

use super::error::{HfsError, Result};

/// Longest file or folder name, in Mac Roman bytes
pub const MAX_NAME_LEN: usize = 31;

/// Longest volume name, in Mac Roman bytes
pub const MAX_VOLUME_NAME_LEN: usize = 27;

/// Mac Roman to Unicode lookup table for bytes 0x80-0xFF.
static MAC_ROMAN_TABLE: [char; 128] = [
    '\u{00C4}', '\u{00C5}', '\u{00C7}', '\u{00C9}', '\u{00D1}', '\u{00D6}', '\u{00DC}', '\u{00E1}',
    '\u{00E0}', '\u{00E2}', '\u{00E4}', '\u{00E3}', '\u{00E5}', '\u{00E7}', '\u{00E9}', '\u{00E8}',
    '\u{00EA}', '\u{00EB}', '\u{00ED}', '\u{00EC}', '\u{00EE}', '\u{00EF}', '\u{00F1}', '\u{00F3}',
    '\u{00F2}', '\u{00F4}', '\u{00F6}', '\u{00F5}', '\u{00FA}', '\u{00F9}', '\u{00FB}', '\u{00FC}',
    '\u{2020}', '\u{00B0}', '\u{00A2}', '\u{00A3}', '\u{00A7}', '\u{2022}', '\u{00B6}', '\u{00DF}',
    '\u{00AE}', '\u{00A9}', '\u{2122}', '\u{00B4}', '\u{00A8}', '\u{2260}', '\u{00C6}', '\u{00D8}',
    '\u{221E}', '\u{00B1}', '\u{2264}', '\u{2265}', '\u{00A5}', '\u{00B5}', '\u{2202}', '\u{2211}',
    '\u{220F}', '\u{03C0}', '\u{222B}', '\u{00AA}', '\u{00BA}', '\u{03A9}', '\u{00E6}', '\u{00F8}',
    '\u{00BF}', '\u{00A1}', '\u{00AC}', '\u{221A}', '\u{0192}', '\u{2248}', '\u{2206}', '\u{00AB}',
    '\u{00BB}', '\u{2026}', '\u{00A0}', '\u{00C0}', '\u{00C3}', '\u{00D5}', '\u{0152}', '\u{0153}',
    '\u{2013}', '\u{2014}', '\u{201C}', '\u{201D}', '\u{2018}', '\u{2019}', '\u{00F7}', '\u{25CA}',
    '\u{00FF}', '\u{0178}', '\u{2044}', '\u{20AC}', '\u{2039}', '\u{203A}', '\u{FB01}', '\u{FB02}',
    '\u{2021}', '\u{00B7}', '\u{201A}', '\u{201E}', '\u{2030}', '\u{00C2}', '\u{00CA}', '\u{00C1}',
    '\u{00CB}', '\u{00C8}', '\u{00CD}', '\u{00CE}', '\u{00CF}', '\u{00CC}', '\u{00D3}', '\u{00D4}',
    '\u{F8FF}', '\u{00D2}', '\u{00DA}', '\u{00DB}', '\u{00D9}', '\u{0131}', '\u{02C6}', '\u{02DC}',
    '\u{00AF}', '\u{02D8}', '\u{02D9}', '\u{02DA}', '\u{00B8}', '\u{02DD}', '\u{02DB}', '\u{02C7}',
];

/// Accented letters in the order they sort after their base letter. Bytes
/// sharing an entry are case variants and compare equal when folding.
const DIACRITIC_ORDER: [(u8, &[u8]); 33] = [
    (b'A', &[0xCB, 0x88]), // À à
    (b'A', &[0xE7, 0x87]), // Á á
    (b'A', &[0xE5, 0x89]), // Â â
    (b'A', &[0xCC, 0x8B]), // Ã ã
    (b'A', &[0x80, 0x8A]), // Ä ä
    (b'A', &[0x81, 0x8C]), // Å å
    (b'A', &[0xBB]), // ª
    (b'A', &[0xAE, 0xBE]), // Æ æ
    (b'C', &[0x82, 0x8D]), // Ç ç
    (b'E', &[0xE9, 0x8F]), // È è
    (b'E', &[0x83, 0x8E]), // É é
    (b'E', &[0xE6, 0x90]), // Ê ê
    (b'E', &[0xE8, 0x91]), // Ë ë
    (b'I', &[0xED, 0x93]), // Ì ì
    (b'I', &[0xEA, 0x92]), // Í í
    (b'I', &[0xEB, 0x94]), // Î î
    (b'I', &[0xEC, 0x95]), // Ï ï
    (b'I', &[0xF5]), // ı
    (b'N', &[0x84, 0x96]), // Ñ ñ
    (b'O', &[0xF1, 0x98]), // Ò ò
    (b'O', &[0xEE, 0x97]), // Ó ó
    (b'O', &[0xEF, 0x99]), // Ô ô
    (b'O', &[0xCD, 0x9B]), // Õ õ
    (b'O', &[0x85, 0x9A]), // Ö ö
    (b'O', &[0xAF, 0xBF]), // Ø ø
    (b'O', &[0xBC]), // º
    (b'O', &[0xCE, 0xCF]), // Œ œ
    (b'S', &[0xA7]), // ß
    (b'U', &[0xF4, 0x9D]), // Ù ù
    (b'U', &[0xF2, 0x9C]), // Ú ú
    (b'U', &[0xF3, 0x9E]), // Û û
    (b'U', &[0x86, 0x9F]), // Ü ü
    (b'Y', &[0xD9, 0xD8]), // Ÿ ÿ
];

/// Case-insensitive sort weight of every Mac Roman byte
static SORT_WEIGHTS: [u16; 256] = build_sort_weights();

const fn build_sort_weights() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut b = 0;
    while b < 256 {
        let folded = if b >= 0x61 && b <= 0x7A { b - 0x20 } else { b };
        table[b] = (folded as u16) * 16;
        b += 1;
    }
    let mut i = 0;
    while i < DIACRITIC_ORDER.len() {
        let (base, bytes) = DIACRITIC_ORDER[i];
        let mut rank = 1;
        let mut j = 0;
        while j < i {
            if DIACRITIC_ORDER[j].0 == base {
                rank += 1;
            }
            j += 1;
        }
        let mut k = 0;
        while k < bytes.len() {
            table[bytes[k] as usize] = (base as u16) * 16 + rank;
            k += 1;
        }
        i += 1;
    }
    table
}

/// Decode a Mac Roman byte string to UTF-8.
pub fn decode(data: &[u8]) -> String {
    data.iter()
        .map(|&b| {
            if b < 0x80 {
                b as char
            } else {
                MAC_ROMAN_TABLE[(b - 0x80) as usize]
            }
        })
        .collect()
}

/// Encode UTF-8 text as Mac Roman, failing on unmappable characters
pub fn encode(text: &str) -> Result<Vec<u8>> {
    text.chars()
        .map(|c| {
            if (c as u32) < 0x80 {
                Ok(c as u8)
            } else {
                MAC_ROMAN_TABLE
                    .iter()
                    .position(|&m| m == c)
                    .map(|i| 0x80 + i as u8)
                    .ok_or_else(|| {
                        HfsError::InvalidName(format!("{:?} has no Mac Roman encoding", c))
                    })
            }
        })
        .collect()
}

/// Encode and validate a file or folder name
pub fn encode_name(name: &str) -> Result<Vec<u8>> {
    encode_limited(name, MAX_NAME_LEN)
}

/// Encode and validate a volume name
pub fn encode_volume_name(name: &str) -> Result<Vec<u8>> {
    encode_limited(name, MAX_VOLUME_NAME_LEN)
}

fn encode_limited(name: &str, limit: usize) -> Result<Vec<u8>> {
    if name.is_empty() {
        return Err(HfsError::InvalidName("empty name".to_string()));
    }
    if name.contains(':') {
        return Err(HfsError::InvalidName(format!("{}: ':' is reserved", name)));
    }
    let bytes = encode(name)?;
    if bytes.len() > limit {
        return Err(HfsError::InvalidName(format!(
            "{}: longer than {} bytes",
            name, limit
        )));
    }
    Ok(bytes)
}

fn sort_weight(b: u8) -> u16 {
    SORT_WEIGHTS[b as usize]
}

/// Compare two names the way the catalog orders them
pub fn compare_names(a: &[u8], b: &[u8], case_sensitive: bool) -> Ordering {
    if case_sensitive {
        return a.cmp(b);
    }
    a.iter().map(|&c| sort_weight(c)).cmp(b.iter().map(|&c| sort_weight(c)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_ascii() {
        assert_eq!(decode(b"Hello World"), "Hello World");
    }

    #[test]
    fn test_decode_special() {
        // 0x80 = Ä, 0xA5 = •
        assert_eq!(decode(&[0x80, 0xA5]), "Ä•");
    }

    #[test]
    fn test_encode_round_trips_table() {
        assert_eq!(encode("Ärger™").unwrap(), vec![0x80, b'r', b'g', b'e', b'r', 0xAA]);
        assert!(matches!(encode("日本"), Err(HfsError::InvalidName(_))));
    }

    #[test]
    fn test_name_validation() {
        assert!(encode_name("ReadMe").is_ok());
        assert!(encode_name("").is_err());
        assert!(encode_name("a:b").is_err());
        assert!(encode_name(&"x".repeat(31)).is_ok());
        assert!(encode_name(&"x".repeat(32)).is_err());
        assert!(encode_volume_name(&"v".repeat(28)).is_err());
    }

    #[test]
    fn test_case_folding() {
        assert_eq!(compare_names(b"readme", b"README", false), Ordering::Equal);
        assert_ne!(compare_names(b"readme", b"README", true), Ordering::Equal);
        assert_eq!(compare_names(&[0x8A], &[0x80], false), Ordering::Equal);
        assert_eq!(compare_names(b"abc", b"ABD", false), Ordering::Less);
        assert_eq!(compare_names(b"ab", b"abc", false), Ordering::Less);
        // è and È have no folding counterpart in ASCII
        assert_eq!(compare_names(&[0x8F], &[0xE9], false), Ordering::Equal);
    }

    #[test]
    fn test_accents_sort_beside_base_letter() {
        let e_acute_upper = [0x83, b'c'];
        let e_acute_lower = [0x8E, b'c'];
        assert_eq!(compare_names(&e_acute_upper, b"Fig", false), Ordering::Less);
        assert_eq!(compare_names(&e_acute_lower, &e_acute_upper, false), Ordering::Equal);
        assert_eq!(compare_names(b"Ec", &e_acute_upper, false), Ordering::Less);
        assert_eq!(compare_names(b"ez", &e_acute_lower, false), Ordering::Less);
        // Ä sorts after plain A but before B
        assert_eq!(compare_names(b"Apfel", &[0x80, b'r'], false), Ordering::Less);
        assert_eq!(compare_names(&[0x80, b'r'], b"Bahn", false), Ordering::Less);
        // ß stays within S
        assert_eq!(compare_names(&[0xA7], b"S", false), Ordering::Greater);
        assert_eq!(compare_names(&[0xA7], b"T", false), Ordering::Less);
        // Punctuation keeps its byte order
        assert_eq!(compare_names(b"_", b"a", false), Ordering::Less);
    }
}
