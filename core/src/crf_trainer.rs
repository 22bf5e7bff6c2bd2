// core/src/crf_trainer.rs
//
// Supervised training of the 2-label linear-chain CRF over character
// classes: exact forward-backward in f64, batch SGD, and L-BFGS on the
// averaged negative log-likelihood with L2 regularization.
//
// Label 0 is word-internal, label 1 is word-start. y[0] is always 1 and
// the sentence end behaves as an implicit transition into label 1 (EOS),
// mirroring the decoder's segment scores. BOS->1 is not identifiable from
// labeled data (every sentence pays it exactly once), so it is not trained
// and stays a model parameter.

use ahash::AHashMap;
use tracing::info;

use crate::charclass::{CharClassifier, CLASS_BOS, CLASS_EOS};
use crate::crf::{
    pack_key, CrfParams, TPL_CUR, TPL_CUR_NEXT, TPL_NEXT, TPL_PREV, TPL_PREV_CUR,
};
use crate::decoder::Decoder;
use crate::error::{Error, Result};
use crate::lbfgs::{self, LbfgsOptions};
use crate::model::Model;
use crate::qformat::{log_sum_exp, to_q8};
use crate::workarea::WorkArea;
use crate::TrainerConfig;

/// Transition indices into the trained vector: from-label, to-label.
pub const T00: usize = 0;
pub const T01: usize = 1;
pub const T10: usize = 2;
pub const T11: usize = 3;

/// One training sentence: per-codepoint classes and binary labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrfSentence {
    pub classes: Vec<u8>,
    pub labels: Vec<u8>,
}

/// Trained CRF weights in natural-log units.
#[derive(Debug, Clone, Default)]
pub struct CrfWeights {
    pub trans: [f64; 4],
    pub feats: AHashMap<u32, f64>,
}

impl CrfWeights {
    #[inline]
    fn feat(&self, key: u32) -> f64 {
        self.feats.get(&key).copied().unwrap_or(0.0)
    }

    /// Emission for `label` at a position with the given class context.
    fn emit(&self, label: u8, prev: u8, cur: u8, next: u8) -> f64 {
        self.feat(pack_key(TPL_CUR, label, cur, 0))
            + self.feat(pack_key(TPL_PREV, label, prev, 0))
            + self.feat(pack_key(TPL_NEXT, label, next, 0))
            + self.feat(pack_key(TPL_PREV_CUR, label, prev, cur))
            + self.feat(pack_key(TPL_CUR_NEXT, label, cur, next))
    }

    /// Quantize to model parameters. `bos_to1` passes through untouched.
    pub fn params(&self, bos_to1: f64) -> CrfParams {
        CrfParams {
            trans00: to_q8(self.trans[T00]),
            trans01: to_q8(self.trans[T01]),
            trans10: to_q8(self.trans[T10]),
            trans11: to_q8(self.trans[T11]),
            bos_to1: to_q8(bos_to1),
        }
    }

    /// Quantized feature pairs for a model builder, dropping zero weights.
    pub fn feature_pairs(&self) -> Vec<(u32, i16)> {
        let mut pairs: Vec<(u32, i16)> = self
            .feats
            .iter()
            .map(|(&k, &w)| (k, to_q8(w)))
            .filter(|&(_, w)| w != 0)
            .collect();
        pairs.sort_by_key(|&(k, _)| k);
        pairs
    }
}

/// Parse one line of gold segmented text: whitespace-separated tokens, the
/// first codepoint of each token labeled 1. Returns `None` for blank lines.
pub fn sentence_from_gold(line: &str, clf: &CharClassifier) -> Option<CrfSentence> {
    let mut classes = Vec::new();
    let mut labels = Vec::new();
    for token in line.split_whitespace() {
        let mut first = true;
        for ch in token.chars() {
            classes.push(clf.classify(ch as u32));
            labels.push(if first { 1 } else { 0 });
            first = false;
        }
    }
    if classes.is_empty() {
        return None;
    }
    labels[0] = 1;
    Some(CrfSentence { classes, labels })
}

/// Class context (prev, cur, next) at position `i`, with BOS/EOS at the
/// boundaries.
#[inline]
fn context(classes: &[u8], i: usize) -> (u8, u8, u8) {
    let prev = if i == 0 { CLASS_BOS } else { classes[i - 1] };
    let next = if i + 1 == classes.len() {
        CLASS_EOS
    } else {
        classes[i + 1]
    };
    (prev, classes[i], next)
}

/// Forward-backward tables for one sentence.
struct FwdBwd {
    e0: Vec<f64>,
    e1: Vec<f64>,
    a0: Vec<f64>,
    a1: Vec<f64>,
    b0: Vec<f64>,
    b1: Vec<f64>,
    logz: f64,
}

fn forward_backward(sent: &CrfSentence, w: &CrfWeights) -> FwdBwd {
    let n = sent.classes.len();
    let mut e0 = vec![0.0; n];
    let mut e1 = vec![0.0; n];
    for i in 0..n {
        let (prev, cur, next) = context(&sent.classes, i);
        e0[i] = w.emit(0, prev, cur, next);
        e1[i] = w.emit(1, prev, cur, next);
    }

    let mut a0 = vec![f64::NEG_INFINITY; n];
    let mut a1 = vec![f64::NEG_INFINITY; n];
    a1[0] = e1[0];
    for i in 1..n {
        a0[i] = e0[i] + log_sum_exp(a0[i - 1] + w.trans[T00], a1[i - 1] + w.trans[T10]);
        a1[i] = e1[i] + log_sum_exp(a0[i - 1] + w.trans[T01], a1[i - 1] + w.trans[T11]);
    }
    // EOS is label 1
    let logz = log_sum_exp(a0[n - 1] + w.trans[T01], a1[n - 1] + w.trans[T11]);

    let mut b0 = vec![f64::NEG_INFINITY; n];
    let mut b1 = vec![f64::NEG_INFINITY; n];
    b0[n - 1] = w.trans[T01];
    b1[n - 1] = w.trans[T11];
    for i in (0..n - 1).rev() {
        b0[i] = log_sum_exp(
            w.trans[T00] + e0[i + 1] + b0[i + 1],
            w.trans[T01] + e1[i + 1] + b1[i + 1],
        );
        b1[i] = log_sum_exp(
            w.trans[T10] + e0[i + 1] + b0[i + 1],
            w.trans[T11] + e1[i + 1] + b1[i + 1],
        );
    }

    FwdBwd {
        e0,
        e1,
        a0,
        a1,
        b0,
        b1,
        logz,
    }
}

/// Add one sentence's log-likelihood and its gradient (empirical minus
/// expected counts) into the accumulators.
fn accumulate(
    sent: &CrfSentence,
    w: &CrfWeights,
    grad_trans: &mut [f64; 4],
    grad_feats: &mut AHashMap<u32, f64>,
) -> f64 {
    let n = sent.classes.len();
    if n == 0 {
        return 0.0;
    }
    let fb = forward_backward(sent, w);

    let mut bump = |key: u32, delta: f64| {
        *grad_feats.entry(key).or_insert(0.0) += delta;
    };
    let feat_keys = |label: u8, i: usize| {
        let (prev, cur, next) = context(&sent.classes, i);
        [
            pack_key(TPL_CUR, label, cur, 0),
            pack_key(TPL_PREV, label, prev, 0),
            pack_key(TPL_NEXT, label, next, 0),
            pack_key(TPL_PREV_CUR, label, prev, cur),
            pack_key(TPL_CUR_NEXT, label, cur, next),
        ]
    };

    // empirical score and counts
    let mut emp_score = 0.0;
    for i in 0..n {
        let y = sent.labels[i];
        emp_score += if y == 1 { fb.e1[i] } else { fb.e0[i] };
        for key in feat_keys(y, i) {
            bump(key, 1.0);
        }
        if i > 0 {
            let idx = trans_idx(sent.labels[i - 1], y);
            emp_score += w.trans[idx];
            grad_trans[idx] += 1.0;
        }
    }
    let eos_idx = trans_idx(sent.labels[n - 1], 1);
    emp_score += w.trans[eos_idx];
    grad_trans[eos_idx] += 1.0;

    // expected counts from marginals
    for i in 0..n {
        let p0 = (fb.a0[i] + fb.b0[i] - fb.logz).exp();
        let p1 = (fb.a1[i] + fb.b1[i] - fb.logz).exp();
        for key in feat_keys(0, i) {
            bump(key, -p0);
        }
        for key in feat_keys(1, i) {
            bump(key, -p1);
        }
    }
    for i in 1..n {
        let a = [fb.a0[i - 1], fb.a1[i - 1]];
        let b = [fb.b0[i], fb.b1[i]];
        let e = [fb.e0[i], fb.e1[i]];
        for from in 0..2usize {
            for to in 0..2usize {
                let idx = trans_idx(from as u8, to as u8);
                let p = (a[from] + w.trans[idx] + e[to] + b[to] - fb.logz).exp();
                grad_trans[idx] -= p;
            }
        }
    }
    // implicit EOS transition
    let p0_last = (fb.a0[n - 1] + fb.b0[n - 1] - fb.logz).exp();
    let p1_last = (fb.a1[n - 1] + fb.b1[n - 1] - fb.logz).exp();
    grad_trans[T01] -= p0_last;
    grad_trans[T11] -= p1_last;

    emp_score - fb.logz
}

#[inline]
fn trans_idx(from: u8, to: u8) -> usize {
    (from as usize) * 2 + to as usize
}

/// Batch SGD: per-epoch gradient accumulation, one step of size
/// `lr / total_positions` applied to the accumulator, L2 included.
pub fn train_sgd(data: &[CrfSentence], cfg: &TrainerConfig) -> Result<CrfWeights> {
    if data.is_empty() {
        return Err(Error::BadArg("empty training set"));
    }
    let total_pos: usize = data.iter().map(|s| s.classes.len()).sum();
    let mut w = CrfWeights::default();
    let step = cfg.sgd_lr / total_pos as f64;

    for epoch in 0..cfg.sgd_epochs.max(1) {
        let mut grad_trans = [0.0f64; 4];
        let mut grad_feats: AHashMap<u32, f64> = AHashMap::new();
        let mut ll = 0.0;
        for sent in data {
            ll += accumulate(sent, &w, &mut grad_trans, &mut grad_feats);
        }
        // L2 penalty
        for i in 0..4 {
            grad_trans[i] -= cfg.l2_lambda * w.trans[i];
        }
        for (&key, &wv) in w.feats.iter() {
            *grad_feats.entry(key).or_insert(0.0) -= cfg.l2_lambda * wv;
        }

        for i in 0..4 {
            w.trans[i] += step * grad_trans[i];
        }
        for (key, g) in grad_feats {
            *w.feats.entry(key).or_insert(0.0) += step * g;
        }
        info!(epoch, log_likelihood = ll, "sgd epoch");
    }
    Ok(w)
}

/// L-BFGS on `f = -(ll - 0.5 lambda ||w||^2) / total_positions`.
pub fn train_lbfgs(data: &[CrfSentence], cfg: &TrainerConfig) -> Result<CrfWeights> {
    if data.is_empty() {
        return Err(Error::BadArg("empty training set"));
    }
    let total_pos: usize = data.iter().map(|s| s.classes.len()).sum();

    // the feature universe: every key observable in the data, both labels
    let mut keys: Vec<u32> = Vec::new();
    for sent in data {
        for i in 0..sent.classes.len() {
            let (prev, cur, next) = context(&sent.classes, i);
            for label in 0..2u8 {
                keys.push(pack_key(TPL_CUR, label, cur, 0));
                keys.push(pack_key(TPL_PREV, label, prev, 0));
                keys.push(pack_key(TPL_NEXT, label, next, 0));
                keys.push(pack_key(TPL_PREV_CUR, label, prev, cur));
                keys.push(pack_key(TPL_CUR_NEXT, label, cur, next));
            }
        }
    }
    keys.sort_unstable();
    keys.dedup();

    let dim = 4 + keys.len();
    let lambda = cfg.l2_lambda;
    let norm = total_pos as f64;

    let unpack = |x: &[f64]| -> CrfWeights {
        let mut w = CrfWeights {
            trans: [x[0], x[1], x[2], x[3]],
            feats: AHashMap::with_capacity(keys.len()),
        };
        for (i, &key) in keys.iter().enumerate() {
            if x[4 + i] != 0.0 {
                w.feats.insert(key, x[4 + i]);
            }
        }
        w
    };

    let opts = LbfgsOptions {
        history: cfg.lbfgs_history.clamp(lbfgs::MIN_HISTORY, lbfgs::MAX_HISTORY),
        tol: cfg.lbfgs_tol,
        max_iter: cfg.lbfgs_max_iter,
    };
    let outcome = lbfgs::minimize(vec![0.0; dim], &opts, |x, grad| {
        let w = unpack(x);
        let mut grad_trans = [0.0f64; 4];
        let mut grad_feats: AHashMap<u32, f64> = AHashMap::new();
        let mut ll = 0.0;
        for sent in data {
            ll += accumulate(sent, &w, &mut grad_trans, &mut grad_feats);
        }
        let mut pen = 0.0;
        for &v in x {
            pen += v * v;
        }
        pen *= 0.5 * lambda;

        for i in 0..4 {
            grad[i] = -(grad_trans[i] - lambda * x[i]) / norm;
        }
        for (i, &key) in keys.iter().enumerate() {
            let g = grad_feats.get(&key).copied().unwrap_or(0.0);
            grad[4 + i] = -(g - lambda * x[4 + i]) / norm;
        }
        -(ll - pen) / norm
    })?;

    info!(
        iterations = outcome.iterations,
        objective = outcome.f,
        converged = outcome.converged,
        "lbfgs finished"
    );
    Ok(unpack(&outcome.x))
}

/// Segment raw sentences with an LM-only model (CRF weights zeroed) and
/// derive pseudo-labeled CRF sentences: each piece start becomes y=1. A
/// sentence that fails to decode falls back to all-boundaries labels.
pub fn pseudo_label<B: AsRef<[u8]>>(model: &Model, sentences: &[B]) -> Vec<CrfSentence> {
    let decoder = Decoder::new(model);
    let clf = model.classifier();
    let mut wa = WorkArea::new();
    let mut bounds = Vec::new();
    let mut out = Vec::new();

    for sent in sentences {
        let bytes = sent.as_ref();
        let Ok(text) = std::str::from_utf8(bytes) else {
            continue;
        };
        let classes: Vec<u8> = text.chars().map(|c| clf.classify(c as u32)).collect();
        if classes.is_empty() {
            continue;
        }
        let labels = match decoder.viterbi(bytes, &mut wa, &mut bounds) {
            Ok(_) => {
                let mut labels = vec![0u8; classes.len()];
                for &b in bounds.iter().take(bounds.len() - 1) {
                    labels[b as usize] = 1;
                }
                labels
            }
            Err(_) => vec![1u8; classes.len()],
        };
        out.push(CrfSentence { classes, labels });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::charclass::CharClassifier;

    fn gold_data() -> Vec<CrfSentence> {
        let clf = CharClassifier::compat();
        // digits start words, letters continue them
        [
            "1ab 2cd 3e",
            "9zz 8yy",
            "1a 2b 3c 4d",
            "7qq 6rr 5ss",
        ]
        .iter()
        .filter_map(|line| sentence_from_gold(line, &clf))
        .collect()
    }

    #[test]
    fn gold_parsing_labels_token_starts() {
        let clf = CharClassifier::compat();
        let s = sentence_from_gold("ab cde", &clf).unwrap();
        assert_eq!(s.labels, vec![1, 0, 1, 0, 0]);
        assert_eq!(s.classes.len(), 5);
        assert!(sentence_from_gold("   ", &clf).is_none());
    }

    #[test]
    fn marginals_are_normalized_per_position() {
        let mut w = CrfWeights::default();
        w.trans = [0.3, -0.2, 0.7, -0.5];
        w.feats.insert(pack_key(TPL_CUR, 1, 2, 0), 1.5);
        w.feats.insert(pack_key(TPL_PREV, 0, 3, 0), -0.75);

        for sent in gold_data() {
            let fb = forward_backward(&sent, &w);
            let mut expected_starts = 0.0;
            for i in 0..sent.classes.len() {
                let p0 = (fb.a0[i] + fb.b0[i] - fb.logz).exp();
                let p1 = (fb.a1[i] + fb.b1[i] - fb.logz).exp();
                assert!((p0 + p1 - 1.0).abs() < 1e-9, "position {} not normalized", i);
                expected_starts += p1;
            }
            // position 0 has label 1 with certainty
            let p1_first = (fb.a1[0] + fb.b1[0] - fb.logz).exp();
            assert!((p1_first - 1.0).abs() < 1e-9);
            assert!(expected_starts >= 1.0 - 1e-9);
            assert!(expected_starts <= sent.classes.len() as f64 + 1e-9);
        }
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let sent = gold_data().remove(0);
        let mut w = CrfWeights::default();
        w.trans = [0.1, -0.3, 0.2, 0.4];
        let probe_key = pack_key(TPL_CUR, 1, 2, 0);
        w.feats.insert(probe_key, 0.25);

        let mut grad_trans = [0.0f64; 4];
        let mut grad_feats: AHashMap<u32, f64> = AHashMap::new();
        let ll = accumulate(&sent, &w, &mut grad_trans, &mut grad_feats);

        let eps = 1e-6;
        for idx in 0..4 {
            let mut wp = w.clone();
            wp.trans[idx] += eps;
            let mut gt = [0.0f64; 4];
            let mut gf = AHashMap::new();
            let llp = accumulate(&sent, &wp, &mut gt, &mut gf);
            let numeric = (llp - ll) / eps;
            assert!(
                (numeric - grad_trans[idx]).abs() < 1e-4,
                "transition {} gradient: analytic {} vs numeric {}",
                idx,
                grad_trans[idx],
                numeric
            );
        }
        {
            let mut wp = w.clone();
            *wp.feats.get_mut(&probe_key).unwrap() += eps;
            let mut gt = [0.0f64; 4];
            let mut gf = AHashMap::new();
            let llp = accumulate(&sent, &wp, &mut gt, &mut gf);
            let numeric = (llp - ll) / eps;
            let analytic = grad_feats.get(&probe_key).copied().unwrap_or(0.0);
            assert!(
                (numeric - analytic).abs() < 1e-4,
                "feature gradient: analytic {} vs numeric {}",
                analytic,
                numeric
            );
        }
    }

    #[test]
    fn sgd_improves_log_likelihood() {
        let data = gold_data();
        let mut cfg = TrainerConfig::default();
        cfg.sgd_epochs = 30;
        cfg.sgd_lr = 5.0;
        cfg.l2_lambda = 1e-4;
        let trained = train_sgd(&data, &cfg).unwrap();

        let ll = |w: &CrfWeights| {
            let mut gt = [0.0f64; 4];
            let mut gf = AHashMap::new();
            data.iter().map(|s| accumulate(s, w, &mut gt, &mut gf)).sum::<f64>()
        };
        assert!(ll(&trained) > ll(&CrfWeights::default()));
    }

    #[test]
    fn lbfgs_improves_likelihood() {
        let data = gold_data();
        let mut cfg = TrainerConfig::default();
        cfg.lbfgs_max_iter = 60;
        cfg.l2_lambda = 1e-4;
        let trained = train_lbfgs(&data, &cfg).unwrap();

        let mut gt = [0.0f64; 4];
        let mut gf = AHashMap::new();
        let ll: f64 = data
            .iter()
            .map(|s| accumulate(s, &trained, &mut gt, &mut gf))
            .sum();
        let base: f64 = data
            .iter()
            .map(|s| accumulate(s, &CrfWeights::default(), &mut gt, &mut gf))
            .sum();
        assert!(ll > base, "training must improve likelihood: {ll} vs {base}");

        // trained model should prefer digit positions as word starts
        let params = trained.params(0.0);
        assert!(params != CrfParams::default());
    }

    #[test]
    fn pseudo_labels_mark_piece_starts() {
        use crate::model::ModelBuilder;
        let mut b = ModelBuilder::new();
        b.piece(b"a", -2.0).unwrap();
        b.piece(b"b", -2.0).unwrap();
        b.piece(b"ab", -0.5).unwrap();
        let model = b.build().unwrap();

        let data = pseudo_label(&model, &[b"abab".as_slice()]);
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].labels, vec![1, 0, 1, 0]);
    }

    #[test]
    fn quantized_features_are_sorted_and_nonzero() {
        let mut w = CrfWeights::default();
        w.feats.insert(pack_key(1, 1, 3, 0), 0.5);
        w.feats.insert(pack_key(0, 0, 2, 0), -0.25);
        w.feats.insert(pack_key(2, 1, 9, 0), 1e-9); // rounds to zero
        let pairs = w.feature_pairs();
        assert_eq!(pairs.len(), 2);
        assert!(pairs.windows(2).all(|p| p[0].0 < p[1].0));
    }
}
