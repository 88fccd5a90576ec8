//! File-type Classifier (C10): magic-byte and text-encoding detection
//! used to label body data (spec §4.10), grounded in
//! `original_source/filetype.c`'s `ci_magics_db_data_type`,
//! `check_ascii`, and `check_unicode`/`isUTF8`.
//!
//! Detection is two-pronged: a magic-byte database checked first
//! (multi-block entries require every block to match), falling back
//! to a text-encoding heuristic over the first N bytes.

use std::io::Read;

/// A group a [`DataType`] belongs to (spec §4.10 "Each type belongs to
/// one or more groups... used by ACLs"), mirrors
/// `original_source/filetype.c`'s `predefined_groups` (`TEXT`, `DATA`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeGroup {
    Text,
    Data,
}

/// A registered data type: a stable id, a name, and the groups it
/// belongs to.
#[derive(Debug, Clone, Copy)]
pub struct DataType {
    pub id: u32,
    pub name: &'static str,
    pub groups: &'static [TypeGroup],
}

pub const ASCII: DataType = DataType { id: 0, name: "ASCII", groups: &[TypeGroup::Text] };
pub const ISO8859: DataType = DataType { id: 1, name: "ISO-8859", groups: &[TypeGroup::Text] };
pub const EXT_ASCII: DataType = DataType { id: 2, name: "EXT-ASCII", groups: &[TypeGroup::Text] };
pub const UTF: DataType = DataType { id: 3, name: "UTF", groups: &[TypeGroup::Text] };
pub const HTML: DataType = DataType { id: 4, name: "HTML", groups: &[TypeGroup::Text] };
pub const BINARY: DataType = DataType { id: 5, name: "BINARY", groups: &[TypeGroup::Data] };

pub const GIF: DataType = DataType { id: 10, name: "GIF", groups: &[TypeGroup::Data] };
pub const PNG: DataType = DataType { id: 11, name: "PNG", groups: &[TypeGroup::Data] };
pub const JPEG: DataType = DataType { id: 12, name: "JPEG", groups: &[TypeGroup::Data] };
pub const PDF: DataType = DataType { id: 13, name: "PDF", groups: &[TypeGroup::Data] };
pub const ZIP: DataType = DataType { id: 14, name: "ZIP", groups: &[TypeGroup::Data] };
pub const GZIP: DataType = DataType { id: 15, name: "GZIP", groups: &[TypeGroup::Data] };
pub const ELF: DataType = DataType { id: 16, name: "ELF", groups: &[TypeGroup::Data] };
pub const MSDOS_EXE: DataType = DataType { id: 17, name: "MSDOS-EXE", groups: &[TypeGroup::Data] };

/// One (offset, pattern) block; a [`MagicEntry`] matches only if every
/// one of its blocks matches (spec §4.10 "possibly multi-block (all
/// blocks must match)").
#[derive(Debug, Clone, Copy)]
pub struct MagicBlock {
    pub offset: usize,
    pub pattern: &'static [u8],
}

#[derive(Debug, Clone, Copy)]
pub struct MagicEntry {
    pub data_type: DataType,
    pub blocks: &'static [MagicBlock],
}

/// The compiled-in default magic table (spec §9: "a built-in compiled
/// default table is used instead of a loader for an external
/// `.magic`-style file"). Checked in this (insertion) order.
const MAGICS: &[MagicEntry] = &[
    MagicEntry { data_type: GIF, blocks: &[MagicBlock { offset: 0, pattern: b"GIF8" }] },
    MagicEntry { data_type: PNG, blocks: &[MagicBlock { offset: 0, pattern: b"\x89PNG\r\n\x1a\n" }] },
    MagicEntry { data_type: JPEG, blocks: &[MagicBlock { offset: 0, pattern: b"\xff\xd8\xff" }] },
    MagicEntry { data_type: PDF, blocks: &[MagicBlock { offset: 0, pattern: b"%PDF-" }] },
    MagicEntry { data_type: GZIP, blocks: &[MagicBlock { offset: 0, pattern: b"\x1f\x8b" }] },
    MagicEntry { data_type: ZIP, blocks: &[MagicBlock { offset: 0, pattern: b"PK\x03\x04" }] },
    MagicEntry { data_type: ELF, blocks: &[MagicBlock { offset: 0, pattern: b"\x7fELF" }] },
    MagicEntry { data_type: MSDOS_EXE, blocks: &[MagicBlock { offset: 0, pattern: b"MZ" }] },
];

/// Matches `buf` against every registered magic, in insertion order,
/// returning the first whose every block matches (spec §8 invariant
/// 5, §4.10).
pub fn match_magic(buf: &[u8]) -> Option<DataType> {
    'entries: for entry in MAGICS {
        for block in entry.blocks {
            let end = block.offset + block.pattern.len();
            if buf.len() < end || &buf[block.offset..end] != block.pattern {
                continue 'entries;
            }
        }
        return Some(entry.data_type);
    }
    None
}

/// `text_chars` table from `original_source/filetype.c`: which of the
/// 256 byte values appear in plain ASCII (`T`), ISO-8859 (`I`), or
/// extended/non-ISO ASCII text (`X`). `0` never appears in text.
const T: u8 = 1;
const I: u8 = 2;
const X: u8 = 4;

#[rustfmt::skip]
const TEXT_CHARS: [u8; 256] = [
    0,0,0,0,0,0,0,T,T,T,T,0,T,T,0,0,
    0,0,0,0,0,0,0,0,0,0,0,T,0,0,0,0,
    T,T,T,T,T,T,T,T,T,T,T,T,T,T,T,T,
    T,T,T,T,T,T,T,T,T,T,T,T,T,T,T,T,
    T,T,T,T,T,T,T,T,T,T,T,T,T,T,T,T,
    T,T,T,T,T,T,T,T,T,T,T,T,T,T,T,T,
    T,T,T,T,T,T,T,T,T,T,T,T,T,T,T,T,
    T,T,T,T,T,T,T,T,T,T,T,T,T,T,T,0,
    X,X,X,X,X,T,X,X,X,X,X,X,X,X,X,X,
    X,X,X,X,X,X,X,X,X,X,X,X,X,X,X,X,
    I,I,I,I,I,I,I,I,I,I,I,I,I,I,I,I,
    I,I,I,I,I,I,I,I,I,I,I,I,I,I,I,I,
    I,I,I,I,I,I,I,I,I,I,I,I,I,I,I,I,
    I,I,I,I,I,I,I,I,I,I,I,I,I,I,I,I,
    I,I,I,I,I,I,I,I,I,I,I,I,I,I,I,I,
    I,I,I,I,I,I,I,I,I,I,I,I,I,I,I,I,
];

/// Port of `check_ascii`: `None` if any byte never appears in text at
/// all, else `ASCII`/`ISO8859`/`EXT_ASCII` by the highest category bit
/// seen.
fn check_ascii(buf: &[u8]) -> Option<DataType> {
    let mut res = 0u8;
    for &b in buf {
        let kind = TEXT_CHARS[b as usize];
        if kind == 0 {
            return None;
        }
        res |= kind;
    }
    if res <= 1 {
        Some(ASCII)
    } else if res <= 3 {
        Some(ISO8859)
    } else {
        Some(EXT_ASCII)
    }
}

/// UTF-8 boundaries below which a multi-byte sequence is an overlong
/// encoding (port of `utf_boundaries` in the original).
const UTF8_BOUNDARIES: [u32; 7] = [0x0, 0x0, 0x7F, 0x7FF, 0xFFFF, 0x1FFFFF, 0x3FFFFFF];

/// Validates one UTF-8 character starting at `buf[0]`. Returns
/// `Some(len)` (1-6) on a valid, non-overlong, non-surrogate,
/// non-U+FFFE/FFFF character, `Some(0)` if `buf` doesn't contain
/// enough bytes to tell yet, and `None` on a definite encoding error.
/// Port of `isUTF8`.
fn is_utf8_char(buf: &[u8]) -> Option<usize> {
    let c = buf[0];
    if TEXT_CHARS[c as usize] == T {
        return Some(1);
    }
    let (mut ucs, r_size) = if c & 0xE0 == 0xC0 {
        ((c & 0x1F) as u32, 2)
    } else if c & 0xF0 == 0xE0 {
        ((c & 0x0F) as u32, 3)
    } else if c & 0xF8 == 0xF0 {
        ((c & 0x07) as u32, 4)
    } else if c & 0xFC == 0xF8 {
        ((c & 0x03) as u32, 5)
    } else if c & 0xFE == 0xFC {
        ((c & 0x01) as u32, 6)
    } else {
        return None;
    };

    let mut i = 1;
    while i < r_size && i < buf.len() {
        if buf[i] & 0xC0 != 0x80 {
            return None;
        }
        ucs = (ucs << 6) | (buf[i] & 0x3F) as u32;
        i += 1;
    }
    if i < r_size {
        return Some(0);
    }
    if ucs <= UTF8_BOUNDARIES[r_size] {
        return None;
    }
    if (0xd800..=0xdfff).contains(&ucs) || ucs == 0xfffe || ucs == 0xffff {
        return None;
    }
    Some(r_size)
}

/// Port of `check_unicode`: checks UTF-8 over the whole buffer, then
/// falls back to UTF-16-by-BOM.
fn check_unicode(buf: &[u8]) -> Option<DataType> {
    let mut i = 0;
    let mut last_ret = 0i64;
    while i < buf.len() {
        match is_utf8_char(&buf[i..]) {
            Some(0) => {
                last_ret = 0;
                break;
            }
            Some(n) => {
                last_ret = n as i64;
                i += n;
            }
            None => {
                last_ret = -1;
                break;
            }
        }
    }
    if last_ret != 0 {
        // Even a trailing unknown/incomplete char at EOF still counts
        // the buffer as UTF (matches the original's `if (ret) return
        // CI_UTF_DATA`), unless the very first char was a hard error.
        if last_ret > 0 || i > 0 {
            return Some(UTF);
        }
    }

    if buf.len() < 2 {
        return None;
    }
    let little_endian = buf[0] == 0xff && buf[1] == 0xfe;
    let big_endian = buf[0] == 0xfe && buf[1] == 0xff;
    if !little_endian && !big_endian {
        return None;
    }
    let mut i = 2;
    while i + 1 < buf.len() {
        let (hi, lo) = if big_endian { (buf[i], buf[i + 1]) } else { (buf[i + 1], buf[i]) };
        if hi == 0 && lo < 128 && TEXT_CHARS[lo as usize] != T {
            return None;
        }
        i += 2;
    }
    Some(UTF)
}

/// Classifies `buf`: magic match first, then the ASCII/ISO-8859 text
/// heuristic, then the Unicode heuristic, defaulting to `BINARY`
/// (spec §4.10, §8 invariant 5). Empty input has no determinable type.
pub fn classify(buf: &[u8]) -> Option<DataType> {
    if buf.is_empty() {
        return None;
    }
    if let Some(t) = match_magic(buf) {
        return Some(t);
    }
    if let Some(t) = check_ascii(buf) {
        return Some(t);
    }
    if let Some(t) = check_unicode(buf) {
        return Some(t);
    }
    Some(BINARY)
}

/// Content-Encoding values the extended HTTP-body classifier knows how
/// to inflate before re-running [`classify`] (spec §4.10 "Extended
/// classification").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Gzip,
    Deflate,
    Bzip2,
    Brotli,
}

impl ContentEncoding {
    pub fn from_header_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(ContentEncoding::Gzip),
            "deflate" => Some(ContentEncoding::Deflate),
            "bzip2" => Some(ContentEncoding::Bzip2),
            "br" => Some(ContentEncoding::Brotli),
            _ => None,
        }
    }
}

/// Bound on how much inflated preview data is classified, to avoid a
/// decompression bomb spending unbounded memory just to label a body.
const MAX_INFLATE_PREVIEW: usize = 256 * 1024;

/// Bounded-size inflate of `buf` per `encoding`, capped at
/// [`MAX_INFLATE_PREVIEW`] bytes of output. Errors are swallowed: a
/// body that fails to decompress is classified from its raw (still
/// compressed) bytes instead, same as the original's best-effort
/// `extend_object_type`.
fn inflate_bounded(buf: &[u8], encoding: ContentEncoding) -> Vec<u8> {
    let mut out = Vec::new();
    let result: std::io::Result<()> = match encoding {
        ContentEncoding::Gzip => {
            let mut d = flate2::read::GzDecoder::new(buf);
            d.take(MAX_INFLATE_PREVIEW as u64).read_to_end(&mut out).map(|_| ())
        }
        ContentEncoding::Deflate => {
            let mut d = flate2::read::DeflateDecoder::new(buf);
            d.take(MAX_INFLATE_PREVIEW as u64).read_to_end(&mut out).map(|_| ())
        }
        ContentEncoding::Bzip2 => {
            let mut d = bzip2::read::BzDecoder::new(buf);
            d.take(MAX_INFLATE_PREVIEW as u64).read_to_end(&mut out).map(|_| ())
        }
        ContentEncoding::Brotli => {
            let mut d = brotli::Decompressor::new(buf, 4096);
            d.take(MAX_INFLATE_PREVIEW as u64).read_to_end(&mut out).map(|_| ())
        }
    };
    if result.is_err() {
        out.clear();
    }
    out
}

/// Whether a `Content-Type` value looks like one of the markup/script
/// types the original upgrades a TEXT-group match to HTML for.
fn looks_like_markup(content_type: &str) -> bool {
    let ct = content_type.split(';').next().unwrap_or(content_type).trim().to_ascii_lowercase();
    matches!(ct.as_str(), "text/html" | "text/css" | "text/javascript" | "application/javascript")
}

/// Extended classification over an HTTP body (spec §4.10 "Extended
/// classification on HTTP body"): inflate by `Content-Encoding` before
/// classifying, then upgrade a TEXT-group result to HTML when
/// `Content-Type` looks like markup/script.
pub fn classify_http_body(buf: &[u8], content_encoding: Option<&str>, content_type: Option<&str>) -> Option<DataType> {
    let effective: Vec<u8>;
    let to_classify: &[u8] = match content_encoding.and_then(ContentEncoding::from_header_value) {
        Some(enc) => {
            effective = inflate_bounded(buf, enc);
            if effective.is_empty() {
                buf
            } else {
                &effective
            }
        }
        None => buf,
    };

    let detected = classify(to_classify)?;
    if detected.groups.contains(&TypeGroup::Text) {
        if let Some(ct) = content_type {
            if looks_like_markup(ct) {
                return Some(HTML);
            }
        }
    }
    Some(detected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_first_magic_by_insertion_order() {
        let mut buf = b"GIF89a".to_vec();
        buf.extend_from_slice(&[0; 10]);
        assert_eq!(match_magic(&buf).unwrap().id, GIF.id);
    }

    #[test]
    fn plain_ascii_text_is_classified_ascii() {
        let dt = classify(b"hello world\n").unwrap();
        assert_eq!(dt.id, ASCII.id);
    }

    #[test]
    fn iso8859_bytes_are_classified_iso8859() {
        let buf = [b'h', b'i', 0xe9, 0xe8];
        let dt = classify(&buf).unwrap();
        assert_eq!(dt.id, ISO8859.id);
    }

    #[test]
    fn valid_utf8_multibyte_is_classified_utf() {
        let dt = classify("héllo wörld".as_bytes()).unwrap();
        assert_eq!(dt.id, UTF.id);
    }

    #[test]
    fn overlong_utf8_encoding_is_rejected_as_not_utf() {
        // overlong 2-byte encoding of NUL: 0xC0 0x80
        let buf = [0xC0, 0x80, b'x', b'x', b'x'];
        let dt = classify(&buf).unwrap();
        assert_ne!(dt.id, UTF.id);
    }

    #[test]
    fn utf16_le_bom_is_detected() {
        let mut buf = vec![0xff, 0xfe];
        for c in "hi".encode_utf16() {
            buf.extend_from_slice(&c.to_le_bytes());
        }
        let dt = classify(&buf).unwrap();
        assert_eq!(dt.id, UTF.id);
    }

    #[test]
    fn binary_data_falls_through_to_binary() {
        let buf = [0x00, 0x01, 0x02, 0x03, 0xff, 0xfe, 0x10, 0x20];
        let dt = classify(&buf).unwrap();
        assert_eq!(dt.id, BINARY.id);
    }

    #[test]
    fn empty_input_has_no_type() {
        assert!(classify(&[]).is_none());
    }

    #[test]
    fn text_upgraded_to_html_by_content_type() {
        let dt = classify_http_body(b"<html></html>", None, Some("text/html; charset=utf-8")).unwrap();
        assert_eq!(dt.id, HTML.id);
    }

    #[test]
    fn non_markup_content_type_keeps_ascii() {
        let dt = classify_http_body(b"hello world", None, Some("text/plain")).unwrap();
        assert_eq!(dt.id, ASCII.id);
    }
}
