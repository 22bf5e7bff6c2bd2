// core/src/lossless.rs
//
// Bijective whitespace <-> meta-codepoint recoding. Encoding maps spaces,
// tabs, and (optionally) newlines onto the U+2581..U+2584 block glyphs so a
// tokenizer can split on real whitespace without losing it; U+2580 escapes
// occurrences of the metas themselves. Invalid bytes pass through unchanged
// in both directions so imperfect corpora survive the round trip.
//
// The codec is a small state machine on codepoints, not bytes; both
// directions run after UTF-8 decoding and fall back to byte-wise copy only
// on invalid sequences.

use crate::utf8::{decode_cp, encode_cp};

/// Escape prefix (U+2580, upper half block).
pub const META_ESCAPE: u32 = 0x2580;
/// Encoded space (U+2581).
pub const META_SPACE: u32 = 0x2581;
/// Encoded tab (U+2582).
pub const META_TAB: u32 = 0x2582;
/// Encoded LF (U+2583).
pub const META_LF: u32 = 0x2583;
/// Encoded CR (U+2584).
pub const META_CR: u32 = 0x2584;

/// First and last codepoints of the meta block.
pub const META_FIRST: u32 = META_ESCAPE;
pub const META_LAST: u32 = META_CR;

#[inline]
fn is_meta(cp: u32) -> bool {
    (META_FIRST..=META_LAST).contains(&cp)
}

fn push_cp(out: &mut Vec<u8>, cp: u32) {
    let mut buf = [0u8; 4];
    // cp is always a scalar we produced or already decoded; encode cannot fail.
    let n = encode_cp(cp, &mut buf).unwrap_or(0);
    out.extend_from_slice(&buf[..n]);
}

/// Encode whitespace into meta codepoints.
///
/// `0x20 -> U+2581`, `0x09 -> U+2582`, and when `include_newlines` is set,
/// `0x0A -> U+2583`, `0x0D -> U+2584`. A meta codepoint in the source is
/// emitted behind a U+2580 escape. Everything else, including invalid
/// bytes, copies through.
pub fn encode(input: &[u8], include_newlines: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + input.len() / 4);
    let mut off = 0usize;
    while off < input.len() {
        match decode_cp(input, off) {
            Ok((cp, adv)) => {
                match cp {
                    0x20 => push_cp(&mut out, META_SPACE),
                    0x09 => push_cp(&mut out, META_TAB),
                    0x0A if include_newlines => push_cp(&mut out, META_LF),
                    0x0D if include_newlines => push_cp(&mut out, META_CR),
                    _ if is_meta(cp) => {
                        push_cp(&mut out, META_ESCAPE);
                        out.extend_from_slice(&input[off..off + adv]);
                    }
                    _ => out.extend_from_slice(&input[off..off + adv]),
                }
                off += adv;
            }
            Err(_) => {
                out.push(input[off]);
                off += 1;
            }
        }
    }
    out
}

/// Invert [`encode`]. Meta codepoints map back to their whitespace; an
/// escape copies the following codepoint verbatim; a trailing lone escape
/// is emitted unchanged.
pub fn decode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut off = 0usize;
    while off < input.len() {
        match decode_cp(input, off) {
            Ok((cp, adv)) => {
                off += adv;
                match cp {
                    META_SPACE => out.push(0x20),
                    META_TAB => out.push(0x09),
                    META_LF => out.push(0x0A),
                    META_CR => out.push(0x0D),
                    META_ESCAPE => match decode_cp(input, off) {
                        Ok((_, esc_adv)) => {
                            out.extend_from_slice(&input[off..off + esc_adv]);
                            off += esc_adv;
                        }
                        // lone trailing escape, or escape before invalid
                        // bytes: keep the escape itself
                        Err(_) => push_cp(&mut out, META_ESCAPE),
                    },
                    _ => out.extend_from_slice(&input[off - adv..off]),
                }
            }
            Err(_) => {
                out.push(input[off]);
                off += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_space_and_tab() {
        assert_eq!(encode(b" ", false), "\u{2581}".as_bytes());
        assert_eq!(encode(b"\t", false), "\u{2582}".as_bytes());
        assert_eq!(encode(b"a b", false), "a\u{2581}b".as_bytes());
    }

    #[test]
    fn newlines_only_when_requested() {
        assert_eq!(encode(b"\n", false), b"\n");
        assert_eq!(encode(b"\n", true), "\u{2583}".as_bytes());
        assert_eq!(encode(b"\r", true), "\u{2584}".as_bytes());
    }

    #[test]
    fn escapes_meta_codepoints() {
        let src = "\u{2581}".as_bytes();
        let enc = encode(src, false);
        assert_eq!(enc, "\u{2580}\u{2581}".as_bytes());
        assert_eq!(decode(&enc), src);

        let esc = "\u{2580}".as_bytes();
        let enc = encode(esc, false);
        assert_eq!(enc, "\u{2580}\u{2580}".as_bytes());
        assert_eq!(decode(&enc), esc);
    }

    #[test]
    fn lone_trailing_escape_passes_through() {
        assert_eq!(decode("\u{2580}".as_bytes()), "\u{2580}".as_bytes());
    }

    #[test]
    fn round_trip_mixed_text() {
        for include_newlines in [false, true] {
            for s in [
                "hello world",
                " leading and trailing ",
                "tabs\tand\nnewlines\r\n",
                "メタ\u{2581}文字\u{2580}も\u{2584}含む",
                "",
            ] {
                let enc = encode(s.as_bytes(), include_newlines);
                assert_eq!(
                    decode(&enc),
                    s.as_bytes(),
                    "round trip failed for {:?} (newlines={})",
                    s,
                    include_newlines
                );
            }
        }
    }

    #[test]
    fn invalid_bytes_survive() {
        let src = [b'a', 0xFF, b' ', 0xC3];
        let enc = encode(&src, false);
        assert_eq!(decode(&enc), &src[..]);
    }
}
