// core/src/error.rs
//
// Error taxonomy shared by the decoder, the trainers, and model IO.

use thiserror::Error;

/// Errors surfaced by the core engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Empty, null-like, or misconfigured input.
    #[error("bad argument: {0}")]
    BadArg(&'static str),

    /// A static capacity was exhausted (trie address space, vocabulary ids).
    #[error("capacity exhausted: {0}")]
    Full(&'static str),

    /// Input bytes fail UTF-8 validation.
    #[error("invalid UTF-8 at byte offset {offset}")]
    InvalidUtf8 { offset: usize },

    /// The language model cannot segment the input (decoding), or a training
    /// sentence has zero lattice mass (E-step). `missing` carries the first
    /// codepoint with no single-codepoint piece, when known, to aid diagnosis.
    #[error("no covering segmentation{}", missing.map(|c| format!(" (first uncovered codepoint {:?})", c)).unwrap_or_default())]
    NoCover { missing: Option<char> },

    /// Work area or output buffer too small for this input.
    #[error("input too large: {needed} codepoints exceeds the {limit}-codepoint limit")]
    Range { needed: usize, limit: usize },

    /// Corpus or model file IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Text-format syntax error (CRF config, cc_ranges).
    #[error("parse error at line {line}: {msg}")]
    Parse { line: usize, msg: String },

    /// Invariant violation inside the engine.
    #[error("internal invariant violated: {0}")]
    Internal(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
