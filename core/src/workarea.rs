// core/src/workarea.rs
//
// Per-call decode state. One owned buffer per concern, carved once and
// reused: codepoint offsets, per-position emissions and their prefix sums,
// the span id/unigram tables indexed by (end_pos, len), backpointers, and
// the Viterbi ring of width L+1. A decode call performs no allocation when
// the area already fits its input; growth doubles the capacity up to the
// sentence-length ceiling and resizes every buffer together.
//
// The area is exclusively owned by the running call and must not be shared
// between threads; the model itself stays immutable and shareable.

use crate::error::{Error, Result};
use crate::piece::PIECE_NONE;
use crate::qformat::NEG_INF;

/// Hard ceiling on decodable sentence length, in codepoints.
pub const MAX_SENTENCE_CP: usize = 65530;

/// Reusable decode work area.
#[derive(Debug, Clone, Default)]
pub struct WorkArea {
    pub(crate) offsets: Vec<u32>,
    pub(crate) classes: Vec<u8>,
    pub(crate) emit0: Vec<i32>,
    pub(crate) emit1: Vec<i32>,
    pub(crate) pref_emit0: Vec<i32>,
    pub(crate) span_id: Vec<u16>,
    pub(crate) span_luni: Vec<i32>,
    pub(crate) bp_prevlen: Vec<u16>,
    pub(crate) ring: Vec<i32>,
    // FFBS log-partition table; sized on first sampling call.
    pub(crate) alpha: Vec<f64>,
    // k-best state lists; sized on first k-best call.
    pub(crate) kb_score: Vec<i32>,
    pub(crate) kb_prev: Vec<(u16, u16)>,
    pub(crate) kb_count: Vec<u16>,
    pub(crate) stride: usize,
    cap_cp: usize,
    cap_len: usize,
    cap_nbest: usize,
}

impl WorkArea {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-size for sentences up to `max_cp` codepoints and words up to
    /// `max_word_len`; later decodes within these bounds never allocate.
    pub fn with_capacity(max_cp: usize, max_word_len: usize) -> Result<Self> {
        let mut wa = Self::default();
        wa.ensure(max_cp, max_word_len)?;
        Ok(wa)
    }

    /// Capacity currently reserved, in codepoints.
    pub fn capacity_cp(&self) -> usize {
        self.cap_cp
    }

    /// Reserve for an `n_cp`-codepoint sentence with max word length `l`.
    ///
    /// Growth is at least a doubling so repeated slightly-larger inputs do
    /// not reallocate every call. `Range` when the input can never fit.
    pub fn ensure(&mut self, n_cp: usize, l: usize) -> Result<()> {
        if n_cp > MAX_SENTENCE_CP {
            return Err(Error::Range {
                needed: n_cp,
                limit: MAX_SENTENCE_CP,
            });
        }
        if l == 0 {
            return Err(Error::BadArg("max word length is zero"));
        }
        self.stride = l + 1;
        if n_cp <= self.cap_cp && l <= self.cap_len {
            return Ok(());
        }
        let cap_cp = (self.cap_cp * 2).max(n_cp).min(MAX_SENTENCE_CP);
        let cap_len = self.cap_len.max(l);
        let states = (cap_cp + 1) * (cap_len + 1);

        self.offsets.reserve(cap_cp + 1);
        self.classes.resize(cap_cp, 0);
        self.emit0.resize(cap_cp, 0);
        self.emit1.resize(cap_cp, 0);
        self.pref_emit0.resize(cap_cp + 1, 0);
        self.span_id.resize(states, PIECE_NONE);
        self.span_luni.resize(states, NEG_INF);
        self.bp_prevlen.resize(states, 0);
        self.ring.resize((cap_len + 1) * (cap_len + 1), NEG_INF);
        if !self.alpha.is_empty() {
            self.alpha.resize(states, f64::NEG_INFINITY);
        }
        if self.cap_nbest > 0 {
            self.kb_score.resize(states * self.cap_nbest, NEG_INF);
            self.kb_prev.resize(states * self.cap_nbest, (0, 0));
            self.kb_count.resize(states, 0);
        }

        self.cap_cp = cap_cp;
        self.cap_len = cap_len;
        Ok(())
    }

    /// Reserve the FFBS alpha table for the current capacity.
    pub(crate) fn ensure_alpha(&mut self) {
        let states = (self.cap_cp + 1) * (self.cap_len + 1);
        self.alpha.resize(states, f64::NEG_INFINITY);
    }

    /// Reserve the k-best lists for the current capacity and `nbest`.
    pub(crate) fn ensure_kbest(&mut self, nbest: usize) {
        let states = (self.cap_cp + 1) * (self.cap_len + 1);
        if nbest > self.cap_nbest {
            self.cap_nbest = nbest;
        }
        self.kb_score.resize(states * self.cap_nbest, NEG_INF);
        self.kb_prev.resize(states * self.cap_nbest, (0, 0));
        self.kb_count.resize(states, 0);
    }

    /// Flat index of lattice state `(pos, k)` for the current stride.
    #[inline]
    pub(crate) fn state(&self, pos: usize, k: usize) -> usize {
        pos * self.stride + k
    }

    /// Ring-buffer cell for `(pos mod stride, k)`.
    #[inline]
    pub(crate) fn ring_cell(&self, pos: usize, k: usize) -> usize {
        (pos % self.stride) * self.stride + k
    }

    /// Flat index of k-best entry `r` of a lattice state.
    #[inline]
    pub(crate) fn kb_idx(&self, state: usize, r: usize) -> usize {
        state * self.cap_nbest + r
    }

    /// Byte offsets of the most recent decode's codepoints.
    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }
}
