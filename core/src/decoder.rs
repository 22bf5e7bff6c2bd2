// core/src/decoder.rs
//
// Semi-Markov lattice decoding over the joint CRF + LM score. Lattice
// states are (pos, k): a word of k codepoints ending at codepoint position
// pos. (0, 0) is BOS; terminal states are (N, k) for k in 1..=min(N, L).
//
// Three decoders share one precomputation pass (offsets, per-position
// emissions, emission prefix sums, and the span id/unigram tables):
//   - best-path Viterbi over a ring buffer of L+1 rows,
//   - Forward-Filtering Backward-Sampling on f64 with a temperature,
//   - k-best enumeration with per-state ordered candidate lists.

use crate::charclass::{CLASS_BOS, CLASS_EOS};
use crate::crf;
use crate::error::{Error, Result};
use crate::model::Model;
use crate::piece::{PieceId, PIECE_BOS, PIECE_NONE};
use crate::qformat::{log_sum_exp, q_mul, sat32, sat_add, NEG_INF, SCALE};
use crate::trie;
use crate::utf8::{build_offsets_into, decode_cp};
use crate::workarea::WorkArea;

/// Compile-time cap on k-best list width.
pub const NBEST_MAX: usize = 64;

/// One enumerated segmentation: joint score and codepoint boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NBestPath {
    pub score: i32,
    pub boundaries: Vec<u32>,
}

/// 32-bit xorshift generator for FFBS. State is threaded explicitly so a
/// seed fully determines the sample sequence.
#[derive(Debug, Clone)]
pub struct Xorshift32 {
    state: u32,
}

impl Xorshift32 {
    /// A zero seed would freeze the stream; it is replaced by a fixed
    /// nonzero constant.
    pub fn new(seed: u32) -> Self {
        Self {
            state: if seed == 0 { 0x2545_F491 } else { seed },
        }
    }

    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }

    /// Uniform in [0, 1) from the top 24 bits.
    #[inline]
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u32() >> 8) as f64 / 16_777_216.0
    }
}

/// Stateless decoding front end over an immutable model.
pub struct Decoder<'m> {
    model: &'m Model,
}

impl<'m> Decoder<'m> {
    pub fn new(model: &'m Model) -> Self {
        Self { model }
    }

    /// Best-path Viterbi. Fills `out` with codepoint boundaries
    /// `0 = b[0] < .. < b[m] = N` and returns the joint score.
    pub fn viterbi(&self, bytes: &[u8], wa: &mut WorkArea, out: &mut Vec<u32>) -> Result<i32> {
        out.clear();
        let n = self.precompute(bytes, wa)?;
        let crf = self.model.crf_params();
        if n == 0 {
            out.extend_from_slice(&[0, 0]);
            return Ok(crf.bos_to1 as i32);
        }
        let l = self.model.max_word_len() as usize;
        let stride = wa.stride;

        // BOS row
        for k in 0..stride {
            let cell = wa.ring_cell(0, k);
            wa.ring[cell] = NEG_INF;
        }
        let bos_cell = wa.ring_cell(0, 0);
        wa.ring[bos_cell] = crf.bos_to1 as i32;

        for t in 1..=n {
            for k in 0..stride {
                let cell = wa.ring_cell(t, k);
                wa.ring[cell] = NEG_INF;
            }
            for k in 1..=l.min(t) {
                let s = t - k;
                let mut best = NEG_INF;
                let mut best_j = 0u16;
                for j in pred_lens(s, l) {
                    let prev = wa.ring[wa.ring_cell(s, j)];
                    if prev == NEG_INF {
                        continue;
                    }
                    let cand = sat_add(prev, self.edge(wa, s, j, t, k));
                    // strict '>' with ascending j: ties keep the smaller j
                    if cand > best {
                        best = cand;
                        best_j = j as u16;
                    }
                }
                let cell = wa.ring_cell(t, k);
                wa.ring[cell] = best;
                let st = wa.state(t, k);
                wa.bp_prevlen[st] = best_j;
            }
        }

        let mut best = NEG_INF;
        let mut best_k = 0usize;
        for k in 1..=l.min(n) {
            let v = wa.ring[wa.ring_cell(n, k)];
            if v > best {
                best = v;
                best_k = k;
            }
        }
        if best == NEG_INF {
            return Err(self.no_cover(bytes, wa, n));
        }

        // backtrack in codepoint units
        let mut pos = n;
        let mut k = best_k;
        let mut steps = 0usize;
        while pos > 0 {
            out.push(pos as u32);
            let j = wa.bp_prevlen[wa.state(pos, k)] as usize;
            if k == 0 || k > pos {
                return Err(Error::Internal("corrupted backpointer"));
            }
            pos -= k;
            k = j;
            steps += 1;
            if steps > n {
                return Err(Error::Internal("backtrack does not terminate"));
            }
        }
        out.push(0);
        out.reverse();
        if out.first() != Some(&0) || out.last() != Some(&(n as u32)) {
            return Err(Error::Internal("boundary endpoints"));
        }
        Ok(best)
    }

    /// Draw one segmentation from the joint distribution at temperature
    /// `temp` (> 0). Lower temperatures concentrate on the Viterbi path.
    pub fn sample(
        &self,
        bytes: &[u8],
        temp: f64,
        rng: &mut Xorshift32,
        wa: &mut WorkArea,
        out: &mut Vec<u32>,
    ) -> Result<()> {
        if !(temp > 0.0) {
            return Err(Error::BadArg("temperature must be positive"));
        }
        out.clear();
        let n = self.precompute(bytes, wa)?;
        if n == 0 {
            out.extend_from_slice(&[0, 0]);
            return Ok(());
        }
        let l = self.model.max_word_len() as usize;
        wa.ensure_alpha();
        let inv = 1.0 / (SCALE as f64 * temp);

        // forward filtering on f64 log-partitions
        for t in 0..=n {
            for k in 0..wa.stride {
                let st = wa.state(t, k);
                wa.alpha[st] = f64::NEG_INFINITY;
            }
        }
        let bos = wa.state(0, 0);
        wa.alpha[bos] = self.model.crf_params().bos_to1 as f64 * inv;
        for t in 1..=n {
            for k in 1..=l.min(t) {
                let s = t - k;
                let mut acc = f64::NEG_INFINITY;
                for j in pred_lens(s, l) {
                    let a = wa.alpha[wa.state(s, j)];
                    if a == f64::NEG_INFINITY {
                        continue;
                    }
                    let e = self.edge(wa, s, j, t, k);
                    acc = log_sum_exp(acc, a + e as f64 * inv);
                }
                let st = wa.state(t, k);
                wa.alpha[st] = acc;
            }
        }

        let mut z = f64::NEG_INFINITY;
        for k in 1..=l.min(n) {
            z = log_sum_exp(z, wa.alpha[wa.state(n, k)]);
        }
        if z == f64::NEG_INFINITY {
            return Err(self.no_cover(bytes, wa, n));
        }

        // sample the terminal length; rounding shortfalls fall back to the
        // last reachable state
        let mut k = {
            let r = rng.next_f64();
            let mut acc = 0.0;
            let mut chosen = 0usize;
            for kk in 1..=l.min(n) {
                let a = wa.alpha[wa.state(n, kk)];
                if a == f64::NEG_INFINITY {
                    continue;
                }
                chosen = kk;
                acc += (a - z).exp();
                if r < acc {
                    break;
                }
            }
            chosen
        };

        // backward sampling of predecessor lengths
        let mut pos = n;
        while pos > 0 {
            out.push(pos as u32);
            let s = pos - k;
            if s == 0 {
                break;
            }
            let norm = wa.alpha[wa.state(pos, k)];
            let r = rng.next_f64();
            let mut acc = 0.0;
            let mut next_j = 0usize;
            for j in pred_lens(s, l) {
                let a = wa.alpha[wa.state(s, j)];
                if a == f64::NEG_INFINITY {
                    continue;
                }
                let e = self.edge(wa, s, j, pos, k);
                next_j = j;
                acc += (a + e as f64 * inv - norm).exp();
                if r < acc {
                    break;
                }
            }
            if next_j == 0 {
                return Err(Error::Internal("sampler found no predecessor"));
            }
            pos = s;
            k = next_j;
        }
        out.push(0);
        out.reverse();
        Ok(())
    }

    /// Enumerate up to `nbest` best segmentations, scores non-increasing,
    /// all distinct. `nbest` is clamped to [1, NBEST_MAX].
    pub fn kbest(&self, bytes: &[u8], nbest: usize, wa: &mut WorkArea) -> Result<Vec<NBestPath>> {
        let nbest = nbest.clamp(1, NBEST_MAX);
        let n = self.precompute(bytes, wa)?;
        let crf = self.model.crf_params();
        if n == 0 {
            return Ok(vec![NBestPath {
                score: crf.bos_to1 as i32,
                boundaries: vec![0, 0],
            }]);
        }
        let l = self.model.max_word_len() as usize;
        wa.ensure_kbest(nbest);

        for t in 0..=n {
            for k in 0..wa.stride {
                let st = wa.state(t, k);
                wa.kb_count[st] = 0;
            }
        }
        let bos = wa.state(0, 0);
        wa.kb_count[bos] = 1;
        let bos_idx = wa.kb_idx(bos, 0);
        wa.kb_score[bos_idx] = crf.bos_to1 as i32;
        wa.kb_prev[bos_idx] = (0, 0);

        for t in 1..=n {
            for k in 1..=l.min(t) {
                let s = t - k;
                let st = wa.state(t, k);
                for j in pred_lens(s, l) {
                    let sj = wa.state(s, j);
                    let count = wa.kb_count[sj] as usize;
                    if count == 0 {
                        continue;
                    }
                    let e = self.edge(wa, s, j, t, k);
                    for r in 0..count {
                        let cand = sat_add(wa.kb_score[wa.kb_idx(sj, r)], e);
                        if !self.kb_insert(wa, st, nbest, cand, (j as u16, r as u16)) {
                            // source ranks are sorted; later ones only shrink
                            break;
                        }
                    }
                }
            }
        }

        // merge terminal states, k ascending for stable ties
        let mut finals: Vec<(i32, usize, usize)> = Vec::new();
        for k in 1..=l.min(n) {
            let st = wa.state(n, k);
            for r in 0..wa.kb_count[st] as usize {
                finals.push((wa.kb_score[wa.kb_idx(st, r)], k, r));
            }
        }
        if finals.is_empty() {
            return Err(self.no_cover(bytes, wa, n));
        }
        finals.sort_by(|a, b| b.0.cmp(&a.0));
        finals.truncate(nbest);

        let mut out = Vec::with_capacity(finals.len());
        for (score, mut k, mut r) in finals {
            let mut boundaries = Vec::new();
            let mut pos = n;
            let mut steps = 0usize;
            while pos > 0 {
                boundaries.push(pos as u32);
                let (pj, pr) = wa.kb_prev[wa.kb_idx(wa.state(pos, k), r)];
                if k == 0 || k > pos {
                    return Err(Error::Internal("corrupted k-best backpointer"));
                }
                pos -= k;
                k = pj as usize;
                r = pr as usize;
                steps += 1;
                if steps > n {
                    return Err(Error::Internal("k-best backtrack does not terminate"));
                }
            }
            boundaries.push(0);
            boundaries.reverse();
            out.push(NBestPath { score, boundaries });
        }
        Ok(out)
    }

    /// Convert codepoint boundaries from the latest decode into byte
    /// boundaries via the offset table.
    pub fn byte_boundaries(&self, wa: &WorkArea, cp_bounds: &[u32], out: &mut Vec<u32>) {
        out.clear();
        out.extend(cp_bounds.iter().map(|&b| wa.offsets[b as usize]));
    }

    /// Slice the input into tokens along codepoint boundaries.
    pub fn tokens<'a>(&self, bytes: &'a [u8], wa: &WorkArea, cp_bounds: &[u32]) -> Vec<&'a [u8]> {
        let mut toks = Vec::with_capacity(cp_bounds.len().saturating_sub(1));
        for w in cp_bounds.windows(2) {
            let lo = wa.offsets[w[0] as usize] as usize;
            let hi = wa.offsets[w[1] as usize] as usize;
            if lo < hi {
                toks.push(&bytes[lo..hi]);
            }
        }
        toks
    }

    // ---- shared precomputation ----

    /// Offsets, classes, emissions, prefix sums, span ids and unigram
    /// scores. Returns the codepoint count.
    fn precompute(&self, bytes: &[u8], wa: &mut WorkArea) -> Result<usize> {
        build_offsets_into(bytes, &mut wa.offsets)?;
        let n = wa.offsets.len() - 1;
        let l = self.model.max_word_len() as usize;
        wa.ensure(n, l)?;
        if n == 0 {
            return Ok(0);
        }

        let clf = self.model.classifier();
        for i in 0..n {
            let (cp, _) = decode_cp(bytes, wa.offsets[i] as usize)?;
            wa.classes[i] = clf.classify(cp);
        }

        let feats = self.model.features();
        for i in 0..n {
            let prev = if i == 0 { CLASS_BOS } else { wa.classes[i - 1] };
            let next = if i + 1 == n {
                CLASS_EOS
            } else {
                wa.classes[i + 1]
            };
            let cur = wa.classes[i];
            wa.emit0[i] = crf::emit(feats, 0, prev, cur, next);
            wa.emit1[i] = crf::emit(feats, 1, prev, cur, next);
        }
        wa.pref_emit0[0] = 0;
        for i in 0..n {
            wa.pref_emit0[i + 1] = sat_add(wa.pref_emit0[i], wa.emit0[i]);
        }

        // reset the used span region, then fill from the trie
        for t in 0..=n {
            for k in 0..wa.stride {
                let st = wa.state(t, k);
                wa.span_id[st] = PIECE_NONE;
                wa.span_luni[st] = NEG_INF;
            }
        }
        let view = self.model.trie();
        for s in 0..n {
            let mut node = trie::ROOT;
            'walk: for k in 1..=l.min(n - s) {
                let lo = wa.offsets[s + k - 1] as usize;
                let hi = wa.offsets[s + k] as usize;
                for &b in &bytes[lo..hi] {
                    match view.step(node, b) {
                        Some(next) => node = next,
                        None => break 'walk,
                    }
                }
                if let Some(id) = view.value(node) {
                    if id as usize >= self.model.vocab_size() {
                        return Err(Error::Internal("trie id out of vocabulary"));
                    }
                    let st = wa.state(s + k, k);
                    wa.span_id[st] = id as PieceId;
                }
            }
        }
        for t in 1..=n {
            for k in 1..=l.min(t) {
                let st = wa.state(t, k);
                let id = wa.span_id[st];
                wa.span_luni[st] = if id != PIECE_NONE {
                    self.model.unigram_logp(id)
                } else {
                    self.model.unknown_logp(k as u32)
                };
            }
        }
        let bos = wa.state(0, 0);
        wa.span_id[bos] = PIECE_BOS;
        wa.span_luni[bos] = 0;
        Ok(n)
    }

    /// CRF segment score for span [s, t) plus the scaled LM bigram term
    /// conditioned on the predecessor word length `j`.
    #[inline]
    fn edge(&self, wa: &WorkArea, s: usize, j: usize, t: usize, k: usize) -> i32 {
        let crf = self.model.crf_params();
        let seg = if k == 1 {
            sat_add(wa.emit1[s], crf.trans11 as i32)
        } else {
            let internal = sat32(wa.pref_emit0[t] as i64 - wa.pref_emit0[s + 1] as i64);
            let mut acc = sat_add(wa.emit1[s], crf.trans10 as i32);
            acc = sat_add(acc, internal);
            acc = sat_add(acc, sat32((k as i64 - 2) * crf.trans00 as i64));
            sat_add(acc, crf.trans01 as i32)
        };
        let prev_id = wa.span_id[wa.state(s, j)];
        let cur = wa.state(t, k);
        let lm = self
            .model
            .bigram_logp(prev_id, wa.span_id[cur], wa.span_luni[cur]);
        sat_add(seg, q_mul(self.model.lambda0() as i32, lm))
    }

    /// Build the NoCover diagnostic: first codepoint with no
    /// single-codepoint piece, if any.
    fn no_cover(&self, bytes: &[u8], wa: &WorkArea, n: usize) -> Error {
        let mut missing = None;
        for i in 0..n {
            if wa.span_id[wa.state(i + 1, 1)] == PIECE_NONE {
                if let Ok((cp, _)) = decode_cp(bytes, wa.offsets[i] as usize) {
                    missing = char::from_u32(cp);
                }
                break;
            }
        }
        Error::NoCover { missing }
    }

    /// Ordered insertion into a state's k-best list. Returns false when the
    /// candidate did not fit (list full of better-or-equal entries).
    fn kb_insert(
        &self,
        wa: &mut WorkArea,
        st: usize,
        nbest: usize,
        score: i32,
        prev: (u16, u16),
    ) -> bool {
        let count = wa.kb_count[st] as usize;
        // first slot whose score is strictly below the candidate: equal
        // scores keep their insertion order (stable ties)
        let mut pos = count;
        for r in 0..count {
            if wa.kb_score[wa.kb_idx(st, r)] < score {
                pos = r;
                break;
            }
        }
        if pos >= nbest {
            return false;
        }
        let new_count = (count + 1).min(nbest);
        let mut r = new_count - 1;
        while r > pos {
            let src = wa.kb_idx(st, r - 1);
            let dst = wa.kb_idx(st, r);
            wa.kb_score[dst] = wa.kb_score[src];
            wa.kb_prev[dst] = wa.kb_prev[src];
            r -= 1;
        }
        let idx = wa.kb_idx(st, pos);
        wa.kb_score[idx] = score;
        wa.kb_prev[idx] = prev;
        wa.kb_count[st] = new_count as u16;
        true
    }
}

/// Valid predecessor word lengths for a span starting at `s`: only the BOS
/// state at position 0, otherwise lengths 1..=min(s, L).
#[inline]
fn pred_lens(s: usize, l: usize) -> std::ops::RangeInclusive<usize> {
    if s == 0 {
        0..=0
    } else {
        1..=l.min(s)
    }
}
