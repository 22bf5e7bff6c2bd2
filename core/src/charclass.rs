// core/src/charclass.rs
//
// Codepoint -> character-class mapping used by the CRF feature templates,
// plus the cc_ranges text-file parser. Class ids are part of the on-disk
// contract and must not be renumbered.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lossless::{META_FIRST, META_LAST};

pub const CLASS_OTHER: u8 = 0;
pub const CLASS_SPACE: u8 = 1;
pub const CLASS_DIGIT: u8 = 2;
pub const CLASS_ALPHA: u8 = 3;
pub const CLASS_HIRAGANA: u8 = 4;
pub const CLASS_KATAKANA: u8 = 5;
pub const CLASS_KANJI: u8 = 6;
pub const CLASS_FULLWIDTH: u8 = 7;
pub const CLASS_SYMBOL: u8 = 8;
pub const CLASS_UTF8_2B: u8 = 9;
pub const CLASS_UTF8_3B: u8 = 10;
pub const CLASS_UTF8_4B: u8 = 11;
pub const CLASS_BOS: u8 = 250;
pub const CLASS_EOS: u8 = 251;

/// Classifier dispatch mode. Byte values match the model header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CcMode {
    Ascii = 0,
    Utf8Len = 1,
    Ranges = 2,
    Compat = 3,
}

impl CcMode {
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(CcMode::Ascii),
            1 => Ok(CcMode::Utf8Len),
            2 => Ok(CcMode::Ranges),
            3 => Ok(CcMode::Compat),
            _ => Err(Error::BadArg("unknown character-class mode byte")),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One `(lo, hi, class)` triple from a cc_ranges table; inclusive bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcRange {
    pub lo: u32,
    pub hi: u32,
    pub class_id: u8,
}

/// Character classifier: a mode, a fallback mode for RANGES misses, and the
/// sorted, non-overlapping range table.
#[derive(Debug, Clone)]
pub struct CharClassifier {
    mode: CcMode,
    fallback: CcMode,
    ranges: Vec<CcRange>,
}

impl CharClassifier {
    pub fn new(mode: CcMode, fallback: CcMode, ranges: Vec<CcRange>) -> Result<Self> {
        if mode == CcMode::Ranges && !matches!(fallback, CcMode::Ascii | CcMode::Utf8Len) {
            return Err(Error::BadArg("ranges fallback must be ascii or utf8len"));
        }
        validate_ranges(&ranges)?;
        Ok(Self {
            mode,
            fallback,
            ranges,
        })
    }

    /// ASCII-only classifier; the conventional default.
    pub fn ascii() -> Self {
        Self {
            mode: CcMode::Ascii,
            fallback: CcMode::Ascii,
            ranges: Vec::new(),
        }
    }

    /// Hard-coded Japanese ranges.
    pub fn compat() -> Self {
        Self {
            mode: CcMode::Compat,
            fallback: CcMode::Ascii,
            ranges: Vec::new(),
        }
    }

    pub fn mode(&self) -> CcMode {
        self.mode
    }

    pub fn fallback(&self) -> CcMode {
        self.fallback
    }

    pub fn ranges(&self) -> &[CcRange] {
        &self.ranges
    }

    /// Map a codepoint to its class id.
    ///
    /// The lossless meta codepoints always classify as SPACE, and ASCII
    /// codepoints always follow the shared ASCII rule, regardless of mode.
    pub fn classify(&self, cp: u32) -> u8 {
        if (META_FIRST..=META_LAST).contains(&cp) {
            return CLASS_SPACE;
        }
        if cp <= 0x7F {
            return ascii_class(cp);
        }
        match self.mode {
            CcMode::Ascii => CLASS_OTHER,
            CcMode::Utf8Len => utf8len_class(cp),
            CcMode::Compat => compat_class(cp),
            CcMode::Ranges => match self.range_lookup(cp) {
                Some(class) => class,
                None => match self.fallback {
                    CcMode::Utf8Len => utf8len_class(cp),
                    _ => CLASS_OTHER,
                },
            },
        }
    }

    fn range_lookup(&self, cp: u32) -> Option<u8> {
        let idx = self.ranges.partition_point(|r| r.hi < cp);
        let r = self.ranges.get(idx)?;
        (r.lo <= cp && cp <= r.hi).then_some(r.class_id)
    }
}

fn ascii_class(cp: u32) -> u8 {
    match cp {
        0x20 | 0x09 | 0x0D | 0x0A => CLASS_SPACE,
        0x30..=0x39 => CLASS_DIGIT,
        0x41..=0x5A | 0x61..=0x7A => CLASS_ALPHA,
        _ => CLASS_SYMBOL,
    }
}

fn utf8len_class(cp: u32) -> u8 {
    if cp < 0x800 {
        CLASS_UTF8_2B
    } else if cp < 0x10000 {
        CLASS_UTF8_3B
    } else {
        CLASS_UTF8_4B
    }
}

fn compat_class(cp: u32) -> u8 {
    match cp {
        0x3040..=0x309F => CLASS_HIRAGANA,
        0x30A0..=0x30FF => CLASS_KATAKANA,
        0x4E00..=0x9FFF => CLASS_KANJI,
        0xFF00..=0xFFEF => CLASS_FULLWIDTH,
        _ => CLASS_OTHER,
    }
}

fn validate_ranges(ranges: &[CcRange]) -> Result<()> {
    for w in ranges.windows(2) {
        if w[0].hi >= w[1].lo {
            return Err(Error::BadArg("cc ranges overlap or are unsorted"));
        }
    }
    Ok(())
}

/// Parse a cc_ranges text file: one `start end class_id` triple per line,
/// decimal or `0x` hex, `#` comments. Ranges are sorted ascending by start
/// and must not overlap.
pub fn parse_cc_ranges(text: &str) -> Result<Vec<CcRange>> {
    let mut out = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = match raw.find('#') {
            Some(i) => &raw[..i],
            None => raw,
        }
        .trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let parse_err = |msg: &str| Error::Parse {
            line: lineno + 1,
            msg: msg.to_string(),
        };
        let lo = parse_uint(fields.next().ok_or_else(|| parse_err("missing start"))?)
            .ok_or_else(|| parse_err("bad start value"))?;
        let hi = parse_uint(fields.next().ok_or_else(|| parse_err("missing end"))?)
            .ok_or_else(|| parse_err("bad end value"))?;
        let class = parse_uint(fields.next().ok_or_else(|| parse_err("missing class id"))?)
            .ok_or_else(|| parse_err("bad class id"))?;
        if fields.next().is_some() {
            return Err(parse_err("trailing fields"));
        }
        if lo > 0x10FFFF || hi > 0x10FFFF {
            return Err(parse_err("codepoint beyond U+10FFFF"));
        }
        if class > 255 {
            return Err(parse_err("class id above 255"));
        }
        if lo > hi {
            return Err(parse_err("start above end"));
        }
        out.push(CcRange {
            lo,
            hi,
            class_id: class as u8,
        });
    }
    out.sort_by_key(|r| r.lo);
    validate_ranges(&out)?;
    Ok(out)
}

fn parse_uint(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_rule_applies_in_every_mode() {
        for clf in [
            CharClassifier::ascii(),
            CharClassifier::compat(),
            CharClassifier::new(CcMode::Utf8Len, CcMode::Ascii, vec![]).unwrap(),
        ] {
            assert_eq!(clf.classify(b' ' as u32), CLASS_SPACE);
            assert_eq!(clf.classify(b'\t' as u32), CLASS_SPACE);
            assert_eq!(clf.classify(b'7' as u32), CLASS_DIGIT);
            assert_eq!(clf.classify(b'Q' as u32), CLASS_ALPHA);
            assert_eq!(clf.classify(b'%' as u32), CLASS_SYMBOL);
        }
    }

    #[test]
    fn meta_codepoints_are_space_everywhere() {
        let clf = CharClassifier::compat();
        for cp in META_FIRST..=META_LAST {
            assert_eq!(clf.classify(cp), CLASS_SPACE);
        }
    }

    #[test]
    fn compat_japanese_ranges() {
        let clf = CharClassifier::compat();
        assert_eq!(clf.classify(0x3042), CLASS_HIRAGANA); // あ
        assert_eq!(clf.classify(0x30A2), CLASS_KATAKANA); // ア
        assert_eq!(clf.classify(0x65E5), CLASS_KANJI); // 日
        assert_eq!(clf.classify(0xFF10), CLASS_FULLWIDTH); // ０
        assert_eq!(clf.classify(0x0416), CLASS_OTHER); // Ж
    }

    #[test]
    fn utf8len_mode_by_magnitude() {
        let clf = CharClassifier::new(CcMode::Utf8Len, CcMode::Ascii, vec![]).unwrap();
        assert_eq!(clf.classify(0x00E9), CLASS_UTF8_2B);
        assert_eq!(clf.classify(0x3042), CLASS_UTF8_3B);
        assert_eq!(clf.classify(0x1F600), CLASS_UTF8_4B);
    }

    #[test]
    fn ranges_mode_with_fallback() {
        let ranges = vec![
            CcRange {
                lo: 0x0400,
                hi: 0x04FF,
                class_id: CLASS_ALPHA,
            },
            CcRange {
                lo: 0x3040,
                hi: 0x309F,
                class_id: CLASS_HIRAGANA,
            },
        ];
        let clf = CharClassifier::new(CcMode::Ranges, CcMode::Utf8Len, ranges).unwrap();
        assert_eq!(clf.classify(0x0416), CLASS_ALPHA);
        assert_eq!(clf.classify(0x3050), CLASS_HIRAGANA);
        // miss -> utf8len fallback
        assert_eq!(clf.classify(0x4E00), CLASS_UTF8_3B);
    }

    #[test]
    fn parse_ranges_file() {
        // ';' is not a comment marker in range files; that line must fail.
        let text = "# cyrillic\n0x400 0x4FF 3\n; nope\n0x3040 0x309f 4 # hiragana\n";
        assert!(parse_cc_ranges(text).is_err());

        // 1024..1032 overlaps 0x400..0x4FF
        let text = "# cyrillic\n0x400 0x4FF 3\n0x3040 0x309f 4 # hiragana\n1024 1032 5\n";
        assert!(parse_cc_ranges(text).is_err());

        let text = "0x3040 0x309f 4\n0x400 0x4FF 3\n";
        let ranges = parse_cc_ranges(text).unwrap();
        assert_eq!(ranges.len(), 2);
        // sorted ascending by start
        assert_eq!(ranges[0].lo, 0x400);
        assert_eq!(ranges[1].class_id, 4);
    }

    #[test]
    fn parse_rejects_out_of_unicode() {
        assert!(parse_cc_ranges("0x110000 0x110001 1\n").is_err());
        assert!(parse_cc_ranges("10 5 1\n").is_err());
        assert!(parse_cc_ranges("10 20 300\n").is_err());
    }
}
