// core/src/unigram_trainer.rs
//
// EM training of the unigram piece table with MDL-style pruning.
//
// The trainer owns the mutable piece storage and a mutable trie; after
// training it hands the frozen tables to a ModelBuilder. The E-step runs a
// forward-backward over each sentence's match lattice in f64; the M-step
// renormalizes with smoothing and a probability floor; pruning scores each
// non-mandatory piece by the description length it saves over spelling
// itself out of single-codepoint pieces.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use ahash::AHashMap;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::ModelBuilder;
use crate::piece::{Piece, PieceId, MAX_VOCAB};
use crate::qformat::log_sum_exp;
use crate::trie::{self, DoubleArrayTrie};
use crate::utf8::{build_offsets, decode_cp, encode_cp};
use crate::TrainerConfig;

/// Contributions with log-weight below this are dropped in the E-step.
const MIN_LOG_WEIGHT: f64 = -80.0;

/// Per-iteration E-step statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmStats {
    pub sentences: usize,
    pub log_likelihood: f64,
    pub expected_tokens: f64,
}

/// Result of a full training run.
#[derive(Debug, Clone, Copy)]
pub struct TrainStats {
    pub iterations: usize,
    pub vocab_size: usize,
    pub last: EmStats,
}

/// MDL pruning mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneMode {
    /// Keep the top-K non-mandatory scorers, plus every mandatory piece.
    TargetSize,
    /// Keep pieces whose amortized saving is positive.
    Threshold,
}

/// Min-heap entry ordered by score; the heap root is the worst survivor.
struct HeapEntry {
    score: f64,
    idx: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap pops the max, we want the min on top
        other
            .score
            .total_cmp(&self.score)
            .then(other.idx.cmp(&self.idx))
    }
}

/// Unigram-LM trainer state.
pub struct UnigramTrainer {
    pieces: Vec<Piece>,
    logp: Vec<f64>,
    counts: Vec<f64>,
    trie: DoubleArrayTrie,
    max_piece_len_cp: usize,
}

impl UnigramTrainer {
    pub fn new(max_piece_len_cp: usize) -> Result<Self> {
        if max_piece_len_cp == 0 {
            return Err(Error::BadArg("max piece length is zero"));
        }
        Ok(Self {
            pieces: Vec::new(),
            logp: Vec::new(),
            counts: Vec::new(),
            trie: DoubleArrayTrie::new(),
            max_piece_len_cp,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.pieces.len()
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    pub fn logp(&self) -> &[f64] {
        &self.logp
    }

    pub fn max_piece_len_cp(&self) -> usize {
        self.max_piece_len_cp
    }

    /// Add a piece, deduplicating by bytes. An existing entry keeps its id
    /// and becomes mandatory if either insertion said so.
    pub fn add_piece(&mut self, bytes: &[u8], mandatory: bool) -> Result<PieceId> {
        if let Some(id) = self.trie.get_value(bytes) {
            let id = id as usize;
            self.pieces[id].mandatory |= mandatory;
            return Ok(id as PieceId);
        }
        if self.pieces.len() >= MAX_VOCAB {
            return Err(Error::Full("vocabulary id space"));
        }
        let piece = Piece::new(bytes, mandatory)?;
        if piece.cp_len as usize > self.max_piece_len_cp {
            return Err(Error::BadArg("piece longer than max piece length"));
        }
        let id = self.pieces.len() as PieceId;
        self.trie.insert(bytes, id as u32)?;
        self.pieces.push(piece);
        self.logp.push(0.0);
        self.counts.push(0.0);
        Ok(id)
    }

    /// Seed the vocabulary with every codepoint seen at least `min_count`
    /// times. These single-codepoint pieces carry the mandatory bit so the
    /// coverage invariant survives any amount of pruning.
    pub fn seed_chars<B: AsRef<[u8]>>(&mut self, sentences: &[B], min_count: u64) -> Result<usize> {
        let mut freq: AHashMap<u32, u64> = AHashMap::new();
        for sent in sentences {
            let bytes = sent.as_ref();
            let mut off = 0usize;
            while off < bytes.len() {
                let (cp, adv) = decode_cp(bytes, off)?;
                *freq.entry(cp).or_insert(0) += 1;
                off += adv;
            }
        }
        let mut added = 0usize;
        let mut cps: Vec<(u32, u64)> = freq.into_iter().collect();
        cps.sort_unstable_by_key(|&(cp, _)| cp);
        let mut buf = [0u8; 4];
        for (cp, count) in cps {
            if count < min_count.max(1) {
                continue;
            }
            let n = encode_cp(cp, &mut buf)?;
            self.add_piece(&buf[..n], true)?;
            added += 1;
        }
        Ok(added)
    }

    /// Add mined multi-codepoint candidates, non-mandatory. Candidates that
    /// exceed the trainer's piece length or collide with existing entries
    /// are skipped.
    pub fn add_candidates(&mut self, candidates: &[(Vec<u8>, u32)]) -> Result<usize> {
        let mut added = 0usize;
        for (bytes, _) in candidates {
            if self.trie.get_value(bytes).is_some() {
                continue;
            }
            if self.pieces.len() >= MAX_VOCAB {
                break;
            }
            let piece = Piece::new(bytes, false)?;
            if piece.cp_len as usize > self.max_piece_len_cp || piece.cp_len < 2 {
                continue;
            }
            let id = self.pieces.len() as u32;
            self.trie.insert(bytes, id)?;
            self.pieces.push(piece);
            self.logp.push(0.0);
            self.counts.push(0.0);
            added += 1;
        }
        Ok(added)
    }

    /// Run the EM/MDL driver loop: initialize uniformly if untouched, then
    /// E, M, and optional prune for each iteration.
    pub fn train<B: AsRef<[u8]>>(
        &mut self,
        sentences: &[B],
        cfg: &TrainerConfig,
    ) -> Result<TrainStats> {
        if self.pieces.is_empty() {
            return Err(Error::BadArg("empty vocabulary"));
        }
        if self.logp.iter().all(|&lp| lp == 0.0) {
            let uniform = -(self.pieces.len() as f64).ln();
            self.logp.fill(uniform);
        }

        let mut last = EmStats::default();
        for iter in 0..cfg.em_iters.max(1) {
            let stats = self.e_step(sentences)?;
            self.m_step(cfg.em_smoothing, cfg.min_prob);
            if cfg.prune_enabled {
                let over_target = match cfg.prune_mode {
                    PruneMode::TargetSize => self.pieces.len() > cfg.target_vocab,
                    PruneMode::Threshold => true,
                };
                if over_target {
                    let removed = self.prune(cfg)?;
                    debug!(iter, removed, "pruned vocabulary");
                }
            }
            info!(
                iter,
                sentences = stats.sentences,
                log_likelihood = stats.log_likelihood,
                expected_tokens = stats.expected_tokens,
                vocab = self.pieces.len(),
                "em iteration"
            );
            last = stats;
        }
        Ok(TrainStats {
            iterations: cfg.em_iters.max(1),
            vocab_size: self.pieces.len(),
            last,
        })
    }

    /// Forward-backward expectation pass. Accumulates fractional counts
    /// into the trainer and returns corpus statistics.
    pub fn e_step<B: AsRef<[u8]>>(&mut self, sentences: &[B]) -> Result<EmStats> {
        let mut counts = vec![0.0f64; self.pieces.len()];
        let mut stats = EmStats::default();

        for sent in sentences {
            let bytes = sent.as_ref();
            let offsets = build_offsets(bytes)?;
            let n = offsets.len() - 1;
            if n == 0 {
                continue;
            }
            let matches = self.match_table(bytes, &offsets);

            let mut alpha = vec![f64::NEG_INFINITY; n + 1];
            alpha[0] = 0.0;
            for s in 0..n {
                if alpha[s] == f64::NEG_INFINITY {
                    continue;
                }
                for &(k, id) in &matches[s] {
                    let t = s + k;
                    alpha[t] = log_sum_exp(alpha[t], alpha[s] + self.logp[id as usize]);
                }
            }
            let logz = alpha[n];
            if logz == f64::NEG_INFINITY {
                return Err(self.no_cover(bytes, &offsets, &matches));
            }

            let mut beta = vec![f64::NEG_INFINITY; n + 1];
            beta[n] = 0.0;
            for s in (0..n).rev() {
                for &(k, id) in &matches[s] {
                    let t = s + k;
                    beta[s] = log_sum_exp(beta[s], self.logp[id as usize] + beta[t]);
                }
            }

            for s in 0..n {
                if alpha[s] == f64::NEG_INFINITY {
                    continue;
                }
                for &(k, id) in &matches[s] {
                    let lw = alpha[s] + self.logp[id as usize] + beta[s + k] - logz;
                    if lw < MIN_LOG_WEIGHT {
                        continue;
                    }
                    let p = lw.exp();
                    counts[id as usize] += p;
                    stats.expected_tokens += p;
                }
            }
            stats.log_likelihood += logz;
            stats.sentences += 1;
        }

        self.counts = counts;
        Ok(stats)
    }

    /// Maximization: smoothing pseudocounts, normalize, floor, renormalize.
    pub fn m_step(&mut self, smoothing: f64, min_prob: f64) {
        let total: f64 = self.counts.iter().map(|&c| c + smoothing).sum();
        if total <= 0.0 {
            return;
        }
        let mut probs: Vec<f64> = self
            .counts
            .iter()
            .map(|&c| (c + smoothing) / total)
            .collect();
        // second pass: floor, then restore sum-to-one
        for p in probs.iter_mut() {
            *p = p.max(min_prob);
        }
        let sum: f64 = probs.iter().sum();
        for (lp, p) in self.logp.iter_mut().zip(&probs) {
            *lp = (p / sum).ln();
        }
    }

    /// MDL prune. Survivors are compacted in dictionary order and the trie
    /// is rebuilt with the new ids. Returns the number of removed pieces.
    pub fn prune(&mut self, cfg: &TrainerConfig) -> Result<usize> {
        let n = self.pieces.len();
        let mut keep = vec![false; n];
        let mut n_mandatory = 0usize;
        for (i, piece) in self.pieces.iter().enumerate() {
            if !piece.prunable() {
                keep[i] = true;
                n_mandatory += 1;
            }
        }

        let scores: Vec<f64> = (0..n)
            .map(|i| {
                if keep[i] {
                    return f64::INFINITY;
                }
                let char_cost = self.char_cost(i);
                let self_cost = -self.logp[i];
                let saved = (char_cost - self_cost) * self.counts[i];
                let cost =
                    cfg.mdl_lambda0 + cfg.mdl_lambda_len * self.pieces[i].cp_len as f64;
                saved - cost
            })
            .collect();

        match cfg.prune_mode {
            PruneMode::TargetSize => {
                let budget = cfg.target_vocab.saturating_sub(n_mandatory);
                let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::with_capacity(budget + 1);
                for i in 0..n {
                    if keep[i] {
                        continue;
                    }
                    heap.push(HeapEntry {
                        score: scores[i],
                        idx: i,
                    });
                    if heap.len() > budget {
                        heap.pop();
                    }
                }
                for entry in heap {
                    keep[entry.idx] = true;
                }
            }
            PruneMode::Threshold => {
                for i in 0..n {
                    if !keep[i] && scores[i] > 0.0 {
                        keep[i] = true;
                    }
                }
            }
        }

        let removed = keep.iter().filter(|&&k| !k).count();
        self.compact(&keep)?;

        // survivors must stay a proper distribution
        let total: f64 = self.logp.iter().map(|&lp| lp.exp()).sum();
        if total > 0.0 {
            let log_total = total.ln();
            for lp in self.logp.iter_mut() {
                *lp -= log_total;
            }
        }
        Ok(removed)
    }

    /// Drop unkept pieces, re-id survivors in lexicographic byte order
    /// (old id breaks ties), and rebuild the trie by dictionary-order
    /// insertion for smaller base arrays.
    fn compact(&mut self, keep: &[bool]) -> Result<()> {
        let mut order: Vec<usize> = (0..self.pieces.len()).filter(|&i| keep[i]).collect();
        order.sort_by(|&a, &b| {
            self.pieces[a]
                .bytes
                .cmp(&self.pieces[b].bytes)
                .then(a.cmp(&b))
        });

        let mut pieces = Vec::with_capacity(order.len());
        let mut logp = Vec::with_capacity(order.len());
        let mut counts = Vec::with_capacity(order.len());
        let mut trie = DoubleArrayTrie::new();
        for (new_id, &old) in order.iter().enumerate() {
            trie.insert(&self.pieces[old].bytes, new_id as u32)?;
            pieces.push(self.pieces[old].clone());
            logp.push(self.logp[old]);
            counts.push(self.counts[old]);
        }
        self.pieces = pieces;
        self.logp = logp;
        self.counts = counts;
        self.trie = trie;
        Ok(())
    }

    /// Re-id the whole vocabulary in dictionary order, as done after a
    /// prune. Used before export so base arrays stay compact even when no
    /// pruning ran.
    pub fn compact_dictionary_order(&mut self) -> Result<()> {
        let keep = vec![true; self.pieces.len()];
        self.compact(&keep)
    }

    /// Hand the trained table to a model builder. The caller supplies the
    /// CRF weights and penalties before `build()`.
    pub fn export(&mut self) -> Result<ModelBuilder> {
        self.compact_dictionary_order()?;
        let mut builder = ModelBuilder::new();
        builder.max_word_len(self.max_piece_len_cp as u32);
        for (piece, &lp) in self.pieces.iter().zip(&self.logp) {
            builder.piece(&piece.bytes, lp)?;
        }
        Ok(builder)
    }

    // ---- internals ----

    /// Matches from every start position: `(len_cp, id)` pairs, lengths up
    /// to `max_piece_len_cp`.
    fn match_table(&self, bytes: &[u8], offsets: &[u32]) -> Vec<Vec<(usize, PieceId)>> {
        let n = offsets.len() - 1;
        let view = self.trie.view();
        let mut matches = vec![Vec::new(); n];
        for (s, row) in matches.iter_mut().enumerate() {
            let mut node = trie::ROOT;
            'walk: for k in 1..=self.max_piece_len_cp.min(n - s) {
                let lo = offsets[s + k - 1] as usize;
                let hi = offsets[s + k] as usize;
                for &b in &bytes[lo..hi] {
                    match view.step(node, b) {
                        Some(next) => node = next,
                        None => break 'walk,
                    }
                }
                if let Some(id) = view.value(node) {
                    row.push((k, id as PieceId));
                }
            }
        }
        matches
    }

    /// Cost of spelling piece `i` out of single-codepoint pieces; infinite
    /// when some codepoint has no piece.
    fn char_cost(&self, i: usize) -> f64 {
        let bytes = &self.pieces[i].bytes;
        let view = self.trie.view();
        let mut cost = 0.0f64;
        let mut off = 0usize;
        while off < bytes.len() {
            let Ok((_, adv)) = decode_cp(bytes, off) else {
                return f64::INFINITY;
            };
            match view.get_value(&bytes[off..off + adv]) {
                Some(id) => cost += -self.logp[id as usize],
                None => return f64::INFINITY,
            }
            off += adv;
        }
        cost
    }

    fn no_cover(
        &self,
        bytes: &[u8],
        offsets: &[u32],
        matches: &[Vec<(usize, PieceId)>],
    ) -> Error {
        for (s, row) in matches.iter().enumerate() {
            if row.iter().any(|&(k, _)| k == 1) {
                continue;
            }
            if let Ok((cp, _)) = decode_cp(bytes, offsets[s] as usize) {
                return Error::NoCover {
                    missing: char::from_u32(cp),
                };
            }
        }
        Error::NoCover { missing: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TrainerConfig {
        TrainerConfig::default()
    }

    fn corpus() -> Vec<&'static [u8]> {
        vec![
            b"abab".as_slice(),
            b"abc".as_slice(),
            b"ab".as_slice(),
            b"cab".as_slice(),
        ]
    }

    #[test]
    fn seeding_covers_every_codepoint() {
        let mut tr = UnigramTrainer::new(4).unwrap();
        let added = tr.seed_chars(&corpus(), 1).unwrap();
        assert_eq!(added, 3); // a, b, c
        for key in [b"a".as_slice(), b"b", b"c"] {
            assert!(tr.trie.contains_bytes(key));
        }
    }

    #[test]
    fn em_log_likelihood_is_nondecreasing() {
        let mut tr = UnigramTrainer::new(4).unwrap();
        let sentences = corpus();
        tr.seed_chars(&sentences, 1).unwrap();
        tr.add_candidates(&[(b"ab".to_vec(), 3)]).unwrap();

        let uniform = -(tr.vocab_size() as f64).ln();
        tr.logp.fill(uniform);

        let mut prev = f64::NEG_INFINITY;
        for _ in 0..5 {
            let stats = tr.e_step(&sentences).unwrap();
            assert!(
                stats.log_likelihood >= prev - 1e-9,
                "EM must not decrease the likelihood: {} -> {}",
                prev,
                stats.log_likelihood
            );
            prev = stats.log_likelihood;
            tr.m_step(0.0, 1e-9);
        }
    }

    #[test]
    fn frequent_compound_gains_probability() {
        let mut tr = UnigramTrainer::new(4).unwrap();
        let sentences = corpus();
        tr.seed_chars(&sentences, 1).unwrap();
        let ab = tr.add_piece(b"ab", false).unwrap();
        let mut cfg = config();
        cfg.em_iters = 4;
        cfg.prune_enabled = false;
        tr.train(&sentences, &cfg).unwrap();
        // "ab" appears in every sentence; it must outrank "c"
        let c = tr.trie.get_value(b"c").unwrap() as usize;
        assert!(tr.logp[ab as usize] > tr.logp[c]);
    }

    #[test]
    fn e_step_reports_missing_coverage() {
        let mut tr = UnigramTrainer::new(4).unwrap();
        tr.seed_chars(&[b"ab".as_slice()], 1).unwrap();
        let err = tr.e_step(&[b"axb".as_slice()]).unwrap_err();
        match err {
            Error::NoCover { missing } => assert_eq!(missing, Some('x')),
            other => panic!("expected NoCover, got {other:?}"),
        }
    }

    #[test]
    fn prune_preserves_single_codepoint_pieces() {
        let mut tr = UnigramTrainer::new(4).unwrap();
        let sentences = corpus();
        tr.seed_chars(&sentences, 1).unwrap();
        for cand in [&b"ab"[..], b"ba", b"bc", b"ca", b"abc", b"bab"] {
            tr.add_piece(cand, false).unwrap();
        }
        let mut cfg = config();
        cfg.em_iters = 2;
        cfg.prune_enabled = true;
        cfg.prune_mode = PruneMode::TargetSize;
        cfg.target_vocab = 5;
        tr.train(&sentences, &cfg).unwrap();

        assert!(tr.vocab_size() <= 5);
        for key in [b"a".as_slice(), b"b", b"c"] {
            assert!(
                tr.trie.contains_bytes(key),
                "single-codepoint piece {:?} was pruned",
                key
            );
        }
        // ids are dictionary-ordered after compaction
        for w in tr.pieces.windows(2) {
            assert!(w[0].bytes <= w[1].bytes);
        }
    }

    #[test]
    fn threshold_prune_drops_useless_pieces() {
        let mut tr = UnigramTrainer::new(4).unwrap();
        let sentences = corpus();
        tr.seed_chars(&sentences, 1).unwrap();
        tr.add_piece(b"ab", false).unwrap();
        // "cc" never occurs; its count stays zero and the length cost wins
        tr.add_piece(b"cc", false).unwrap();
        let mut cfg = config();
        cfg.em_iters = 2;
        cfg.prune_enabled = true;
        cfg.prune_mode = PruneMode::Threshold;
        tr.train(&sentences, &cfg).unwrap();
        assert!(!tr.trie.contains_bytes(b"cc"));
    }

    #[test]
    fn m_step_keeps_distribution_normalized_and_floored() {
        let mut tr = UnigramTrainer::new(4).unwrap();
        tr.seed_chars(&[b"ab".as_slice()], 1).unwrap();
        tr.counts = vec![10.0, 0.0];
        tr.m_step(0.0, 1e-4);
        let sum: f64 = tr.logp.iter().map(|&lp| lp.exp()).sum();
        assert!((sum - 1.0).abs() < 1e-9);
        for &lp in tr.logp.iter() {
            assert!(lp.exp() >= 1e-4 / 2.0, "floor not applied");
        }
    }

    #[test]
    fn export_builds_a_decodable_model() {
        use crate::decoder::Decoder;
        use crate::workarea::WorkArea;

        let mut tr = UnigramTrainer::new(4).unwrap();
        let sentences = corpus();
        tr.seed_chars(&sentences, 1).unwrap();
        tr.add_piece(b"ab", false).unwrap();
        let mut cfg = config();
        cfg.em_iters = 3;
        cfg.prune_enabled = false;
        tr.train(&sentences, &cfg).unwrap();

        let model = tr.export().unwrap().build().unwrap();
        let d = Decoder::new(&model);
        let mut wa = WorkArea::new();
        let mut out = Vec::new();
        d.viterbi(b"abab", &mut wa, &mut out).unwrap();
        assert_eq!(out.first(), Some(&0));
        assert_eq!(out.last(), Some(&4));
    }
}
