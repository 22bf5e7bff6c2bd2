// core/src/model.rs
//
// The frozen inference model: read-only double-array, Q8.8 LM and CRF
// tables, and the character classifier. Immutable after construction and
// freely shareable by reference across threads; all per-call state lives
// in the caller's work area.

use crate::charclass::{CcMode, CharClassifier};
use crate::crf::{CrfParams, FeatureTable};
use crate::error::{Error, Result};
use crate::piece::{Piece, PieceId, MAX_VOCAB, PIECE_NONE};
use crate::qformat::{sat16, to_q8, NEG_INF};
use crate::trie::{DoubleArrayTrie, TrieView};

/// Flag bits in the model header.
pub const FLAG_LOSSLESS_WS: u32 = 1 << 0;
pub const FLAG_CC_ASCII: u32 = 1 << 8;
pub const FLAG_CC_UTF8LEN: u32 = 1 << 9;
pub const FLAG_CC_RANGES: u32 = 1 << 10;
pub const FLAG_CC_COMPAT: u32 = 1 << 11;

/// Annotation bit matching a classifier mode. `cc_mode` stays authoritative
/// on read; the bit only mirrors it in `flags`.
pub fn cc_flag_for_mode(mode: CcMode) -> u32 {
    match mode {
        CcMode::Ascii => FLAG_CC_ASCII,
        CcMode::Utf8Len => FLAG_CC_UTF8LEN,
        CcMode::Ranges => FLAG_CC_RANGES,
        CcMode::Compat => FLAG_CC_COMPAT,
    }
}

/// Immutable segmentation model.
#[derive(Debug, Clone)]
pub struct Model {
    pub(crate) base: Vec<i32>,
    pub(crate) check: Vec<i32>,
    pub(crate) logp_uni: Vec<i16>,
    pub(crate) bigram_keys: Vec<u32>,
    pub(crate) bigram_logp: Vec<i16>,
    pub(crate) feats: FeatureTable,
    pub(crate) crf: CrfParams,
    pub(crate) unk_base: i16,
    pub(crate) unk_per_cp: i16,
    pub(crate) lambda0: i16,
    pub(crate) max_word_len: u32,
    pub(crate) flags: u32,
    pub(crate) classifier: CharClassifier,
}

impl Model {
    /// Read-only trie over the stored arrays.
    #[inline]
    pub fn trie(&self) -> TrieView<'_> {
        TrieView::from_arrays(&self.base, &self.check)
    }

    pub fn vocab_size(&self) -> usize {
        self.logp_uni.len()
    }

    pub fn max_word_len(&self) -> u32 {
        self.max_word_len
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn lossless_ws(&self) -> bool {
        self.flags & FLAG_LOSSLESS_WS != 0
    }

    pub fn classifier(&self) -> &CharClassifier {
        &self.classifier
    }

    pub fn crf_params(&self) -> CrfParams {
        self.crf
    }

    pub fn features(&self) -> &FeatureTable {
        &self.feats
    }

    /// Unigram log-prob for a real piece id, as a Q8.8 score.
    #[inline]
    pub fn unigram_logp(&self, id: PieceId) -> i32 {
        match self.logp_uni.get(id as usize) {
            Some(&v) => v as i32,
            None => NEG_INF,
        }
    }

    /// Unknown-span penalty for a span of `len_cp` codepoints.
    #[inline]
    pub fn unknown_logp(&self, len_cp: u32) -> i32 {
        sat16(self.unk_base as i64 + self.unk_per_cp as i64 * len_cp as i64) as i32
    }

    /// Bigram log-prob with unigram backoff: the sorted key array is probed
    /// for `(prev << 16) | cur`; a miss, or a sentinel id on either side,
    /// falls back to `backoff` (the current span's unigram score).
    #[inline]
    pub fn bigram_logp(&self, prev: PieceId, cur: PieceId, backoff: i32) -> i32 {
        if cur == PIECE_NONE || prev == PIECE_NONE {
            return backoff;
        }
        let key = ((prev as u32) << 16) | cur as u32;
        match self.bigram_keys.binary_search(&key) {
            Ok(i) => self.bigram_logp[i] as i32,
            Err(_) => backoff,
        }
    }

    pub fn lambda0(&self) -> i16 {
        self.lambda0
    }

    pub fn unk_params(&self) -> (i16, i16) {
        (self.unk_base, self.unk_per_cp)
    }

    pub fn bigram_len(&self) -> usize {
        self.bigram_keys.len()
    }

    /// Size of the stored double-array.
    pub fn da_capacity(&self) -> usize {
        self.base.len()
    }

    pub(crate) fn da_arrays(&self) -> (&[i32], &[i32]) {
        (&self.base, &self.check)
    }

    /// Copy of this model with all CRF weight zeroed: LM-only decoding,
    /// used to derive pseudo-labels for unsupervised CRF training.
    pub fn lm_only(&self) -> Model {
        let mut m = self.clone();
        m.crf = CrfParams::default();
        m.feats = FeatureTable::default();
        m
    }

    /// Copy of this model carrying new CRF transitions and features.
    pub fn with_crf(&self, crf: CrfParams, feats: FeatureTable) -> Model {
        let mut m = self.clone();
        m.crf = crf;
        m.feats = feats;
        m
    }
}

/// Assembles a [`Model`] from natural-log parts: pieces with ids in
/// insertion order, optional bigrams, CRF weights, penalties, and the
/// classifier. Used by the trainers and by tests that need a small
/// hand-built model.
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    pieces: Vec<Piece>,
    logps: Vec<f64>,
    bigrams: Vec<(PieceId, PieceId, f64)>,
    feats: Vec<(u32, f64)>,
    crf: CrfParams,
    unk_base: f64,
    unk_per_cp: f64,
    lambda0: f64,
    max_word_len: Option<u32>,
    flags: u32,
    classifier: CharClassifier,
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self {
            pieces: Vec::new(),
            logps: Vec::new(),
            bigrams: Vec::new(),
            feats: Vec::new(),
            crf: CrfParams::default(),
            unk_base: -16.0,
            unk_per_cp: -4.0,
            lambda0: 1.0,
            max_word_len: None,
            flags: 0,
            classifier: CharClassifier::compat(),
        }
    }

    /// Add a piece with the next free id; returns that id.
    pub fn piece(&mut self, bytes: &[u8], logp: f64) -> Result<PieceId> {
        if self.pieces.len() >= MAX_VOCAB {
            return Err(Error::Full("vocabulary id space"));
        }
        let piece = Piece::new(bytes, false)?;
        let id = self.pieces.len() as PieceId;
        self.pieces.push(piece);
        self.logps.push(logp);
        Ok(id)
    }

    pub fn bigram(&mut self, prev: PieceId, cur: PieceId, logp: f64) -> &mut Self {
        self.bigrams.push((prev, cur, logp));
        self
    }

    pub fn feature(&mut self, key: u32, weight: f64) -> &mut Self {
        self.feats.push((key, weight));
        self
    }

    pub fn transitions(&mut self, t00: f64, t01: f64, t10: f64, t11: f64, bos: f64) -> &mut Self {
        self.crf = CrfParams {
            trans00: to_q8(t00),
            trans01: to_q8(t01),
            trans10: to_q8(t10),
            trans11: to_q8(t11),
            bos_to1: to_q8(bos),
        };
        self
    }

    pub fn crf_params(&mut self, crf: CrfParams) -> &mut Self {
        self.crf = crf;
        self
    }

    pub fn unknown_penalty(&mut self, base: f64, per_cp: f64) -> &mut Self {
        self.unk_base = base;
        self.unk_per_cp = per_cp;
        self
    }

    pub fn lambda0(&mut self, lambda0: f64) -> &mut Self {
        self.lambda0 = lambda0;
        self
    }

    pub fn max_word_len(&mut self, len_cp: u32) -> &mut Self {
        self.max_word_len = Some(len_cp);
        self
    }

    pub fn lossless_ws(&mut self, enabled: bool) -> &mut Self {
        if enabled {
            self.flags |= FLAG_LOSSLESS_WS;
        } else {
            self.flags &= !FLAG_LOSSLESS_WS;
        }
        self
    }

    pub fn classifier(&mut self, classifier: CharClassifier) -> &mut Self {
        self.classifier = classifier;
        self
    }

    pub fn build(self) -> Result<Model> {
        if self.pieces.is_empty() {
            return Err(Error::BadArg("model without pieces"));
        }
        let max_piece_len = self
            .pieces
            .iter()
            .map(|p| p.cp_len as u32)
            .max()
            .unwrap_or(1);
        let max_word_len = self.max_word_len.unwrap_or(max_piece_len).max(1);

        let mut trie = DoubleArrayTrie::new();
        for (id, piece) in self.pieces.iter().enumerate() {
            trie.insert(&piece.bytes, id as u32)?;
        }
        let used = trie.used_capacity();
        let (base, check) = trie.as_arrays();

        let logp_uni: Vec<i16> = self.logps.iter().map(|&lp| to_q8(lp)).collect();

        let mut bigrams: Vec<(u32, i16)> = self
            .bigrams
            .iter()
            .map(|&(prev, cur, lp)| (((prev as u32) << 16) | cur as u32, to_q8(lp)))
            .collect();
        bigrams.sort_by_key(|&(k, _)| k);
        bigrams.dedup_by_key(|&mut (k, _)| k);
        let (bigram_keys, bigram_logp): (Vec<u32>, Vec<i16>) = bigrams.into_iter().unzip();

        let feats = FeatureTable::from_pairs(
            self.feats
                .into_iter()
                .map(|(k, w)| (k, to_q8(w)))
                .collect(),
        );

        let flags = self.flags | cc_flag_for_mode(self.classifier.mode());

        Ok(Model {
            base: base[..used].to_vec(),
            check: check[..used].to_vec(),
            logp_uni,
            bigram_keys,
            bigram_logp,
            feats,
            crf: self.crf,
            unk_base: to_q8(self.unk_base),
            unk_per_cp: to_q8(self.unk_per_cp),
            lambda0: to_q8(self.lambda0),
            max_word_len,
            flags,
            classifier: self.classifier,
        })
    }
}
