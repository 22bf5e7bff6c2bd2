// core/src/candidates.rs
//
// Suffix-array candidate mining: collect the most frequent n-grams of
// 2..=max_piece_len_cp codepoints from a corpus sample as seed pieces for
// the unigram trainer. Starts at ASCII punctuation or whitespace are
// skipped, and candidates containing structural bytes or the replacement
// codepoint are rejected.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use tracing::debug;

use crate::error::{Error, Result};
use crate::utf8::decode_cp;

/// Bytes that must not occur inside a candidate.
const BAD_BYTES: [u8; 5] = [0x00, b'\n', b'\r', b'\t', b' '];

/// The replacement codepoint marks decode damage in the sample.
const FALLBACK_CP: u32 = 0xFFFD;

/// Mine up to `cand_total` frequent n-grams from `sentences`.
///
/// Returns `(bytes, count)` pairs sorted by descending count. Each n-gram
/// length gets an even share of the budget (`cand_total / (max - 1)`),
/// kept with a min-heap per length, then the union is re-sorted and
/// truncated.
pub fn mine<B: AsRef<[u8]>>(
    sentences: &[B],
    max_piece_len_cp: usize,
    cand_total: usize,
) -> Result<Vec<(Vec<u8>, u32)>> {
    if max_piece_len_cp < 2 {
        return Err(Error::BadArg("max piece length below 2"));
    }
    if cand_total == 0 {
        return Ok(Vec::new());
    }

    // one buffer, newline-separated; candidates never span sentences
    // because they may not contain the separator byte
    let mut buf = Vec::new();
    for sent in sentences {
        buf.extend_from_slice(sent.as_ref());
        buf.push(b'\n');
    }

    // codepoint starts, skipping ASCII punctuation and whitespace
    let mut starts: Vec<usize> = Vec::new();
    let mut off = 0usize;
    while off < buf.len() {
        match decode_cp(&buf, off) {
            Ok((cp, adv)) => {
                let skip = cp < 0x80
                    && ((cp as u8).is_ascii_punctuation() || (cp as u8).is_ascii_whitespace());
                if !skip {
                    starts.push(off);
                }
                off += adv;
            }
            Err(_) => {
                off += 1;
            }
        }
    }
    starts.sort_unstable_by(|&a, &b| buf[a..].cmp(&buf[b..]));

    let per_len_cap = (cand_total / (max_piece_len_cp - 1)).max(1);
    let mut union: Vec<(Vec<u8>, u32)> = Vec::new();

    for n in 2..=max_piece_len_cp {
        let mut heap: BinaryHeap<Reverse<(u32, Vec<u8>)>> =
            BinaryHeap::with_capacity(per_len_cap + 1);
        let mut i = 0usize;
        while i < starts.len() {
            let Some(plen) = prefix_len(&buf, starts[i], n) else {
                i += 1;
                continue;
            };
            let prefix = &buf[starts[i]..starts[i] + plen];
            let mut j = i + 1;
            while j < starts.len()
                && buf.len() - starts[j] >= plen
                && &buf[starts[j]..starts[j] + plen] == prefix
            {
                j += 1;
            }
            let count = (j - i) as u32;
            i = j;

            if !acceptable(prefix) {
                continue;
            }
            heap.push(Reverse((count, prefix.to_vec())));
            if heap.len() > per_len_cap {
                heap.pop();
            }
        }
        debug!(n, kept = heap.len(), "mined n-gram length");
        union.extend(heap.into_iter().map(|Reverse((count, bytes))| (bytes, count)));
    }

    union.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    union.truncate(cand_total);
    Ok(union)
}

/// Byte length of the `n_cp`-codepoint prefix at `start`, or `None` when
/// the suffix is shorter or not cleanly decodable.
fn prefix_len(buf: &[u8], start: usize, n_cp: usize) -> Option<usize> {
    let mut off = start;
    for _ in 0..n_cp {
        let (_, adv) = decode_cp(buf, off).ok()?;
        off += adv;
    }
    Some(off - start)
}

fn acceptable(candidate: &[u8]) -> bool {
    if candidate.iter().any(|b| BAD_BYTES.contains(b)) {
        return false;
    }
    let mut off = 0usize;
    while off < candidate.len() {
        match decode_cp(candidate, off) {
            Ok((cp, adv)) => {
                if cp == FALLBACK_CP {
                    return false;
                }
                off += adv;
            }
            Err(_) => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mines_frequent_bigrams() {
        let corpus = vec![
            b"abab".to_vec(),
            b"abc".to_vec(),
            b"dab".to_vec(),
            b"ab".to_vec(),
        ];
        let cands = mine(&corpus, 3, 100).unwrap();
        let ab = cands.iter().find(|(b, _)| b == b"ab").expect("ab mined");
        assert_eq!(ab.1, 5);
        // sorted by descending count
        for w in cands.windows(2) {
            assert!(w[0].1 >= w[1].1);
        }
    }

    #[test]
    fn skips_punctuation_and_space_starts() {
        let corpus = vec![b".ab .ab .ab".to_vec()];
        let cands = mine(&corpus, 2, 100).unwrap();
        assert!(cands.iter().all(|(b, _)| !b.starts_with(b".")));
        assert!(cands.iter().any(|(b, _)| b == b"ab"));
    }

    #[test]
    fn rejects_candidates_with_structural_bytes() {
        // "a b" would contain a space; sentence joins contribute newlines
        let corpus = vec![b"a b".to_vec(), b"a b".to_vec(), b"a b".to_vec()];
        let cands = mine(&corpus, 3, 100).unwrap();
        for (bytes, _) in &cands {
            assert!(!bytes.iter().any(|b| BAD_BYTES.contains(b)), "{:?}", bytes);
        }
    }

    #[test]
    fn rejects_fallback_codepoint() {
        let corpus = vec!["x\u{FFFD}y x\u{FFFD}y".as_bytes().to_vec()];
        let cands = mine(&corpus, 3, 100).unwrap();
        for (bytes, _) in &cands {
            assert!(!String::from_utf8_lossy(bytes).contains('\u{FFFD}'));
        }
    }

    #[test]
    fn respects_total_budget() {
        let mut corpus = Vec::new();
        for a in b'a'..=b'z' {
            for b in b'a'..=b'z' {
                corpus.push(vec![a, b, a, b]);
            }
        }
        let cands = mine(&corpus, 4, 10).unwrap();
        assert!(cands.len() <= 10);
    }

    #[test]
    fn multibyte_candidates_survive() {
        let corpus = vec!["こんにちは こんにちは こんにちは".as_bytes().to_vec()];
        let cands = mine(&corpus, 4, 100).unwrap();
        assert!(cands
            .iter()
            .any(|(b, _)| b == "こん".as_bytes()));
    }
}
