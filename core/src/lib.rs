//! libmmjp-core
//!
//! Joint discriminative/generative subword segmentation: a two-state
//! linear-chain CRF over character positions combined with a unigram/bigram
//! piece language model, decoded on a semi-Markov lattice whose arcs are
//! candidate word spans.
//!
//! The crate provides the full pipeline:
//! - `Decoder` - Viterbi, FFBS sampling, and k-best over the joint score
//! - `UnigramTrainer` - EM with MDL pruning producing the piece table
//! - `crf_trainer` - supervised CRF training (SGD and L-BFGS)
//! - `candidates` - suffix-array n-gram mining for seed vocabulary
//! - `lossless` - bijective whitespace recoding for exact detokenization
//! - `format` - the little-endian model file (v2 written, v1 accepted)
//!
//! Inference is fixed-point (Q8.8) and allocation-free once a `WorkArea`
//! is sized; training runs on f64. A `Model` is immutable after export and
//! shareable across threads, while each decode call exclusively owns its
//! work area.

use serde::{Deserialize, Serialize};

pub mod candidates;
pub mod charclass;
pub mod crf;
pub mod crf_trainer;
pub mod decoder;
pub mod error;
pub mod format;
pub mod lbfgs;
pub mod lossless;
pub mod model;
pub mod piece;
pub mod qformat;
pub mod trie;
pub mod unigram_trainer;
pub mod utf8;
pub mod workarea;

pub use charclass::{CcMode, CcRange, CharClassifier};
pub use crf::{CrfParams, FeatureTable};
pub use crf_trainer::{CrfSentence, CrfWeights};
pub use decoder::{Decoder, NBestPath, Xorshift32, NBEST_MAX};
pub use error::{Error, Result};
pub use format::{load_model_file, save_model_file};
pub use model::{Model, ModelBuilder};
pub use piece::{Piece, PieceId, PIECE_BOS, PIECE_NONE};
pub use trie::{DoubleArrayTrie, TrieView};
pub use unigram_trainer::{EmStats, PruneMode, TrainStats, UnigramTrainer};
pub use workarea::{WorkArea, MAX_SENTENCE_CP};

/// CRF optimizer selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrfOptimizer {
    Sgd,
    Lbfgs,
}

/// Training-pipeline configuration, loadable from TOML.
///
/// Every field has a default, so a config file only needs the fields it
/// wants to change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Maximum piece (and decoded word) length in codepoints.
    pub max_piece_len_cp: usize,
    /// A codepoint seen at least this often becomes a seed piece.
    pub keep_char_min_count: u64,
    /// Total candidate budget for n-gram mining.
    pub cand_total: usize,

    /// EM iterations for the unigram trainer.
    pub em_iters: usize,
    /// Pseudocount added to every piece in the M-step.
    pub em_smoothing: f64,
    /// Probability floor applied during normalization.
    pub min_prob: f64,

    /// Whether the driver loop prunes at all.
    pub prune_enabled: bool,
    pub prune_mode: PruneMode,
    /// Vocabulary target for target-size pruning.
    pub target_vocab: usize,
    /// Fixed cost per kept piece.
    pub mdl_lambda0: f64,
    /// Additional cost per codepoint of a kept piece.
    pub mdl_lambda_len: f64,

    pub optimizer: CrfOptimizer,
    pub sgd_lr: f64,
    pub sgd_epochs: usize,
    /// L2 regularization strength shared by both optimizers.
    pub l2_lambda: f64,
    pub lbfgs_history: usize,
    pub lbfgs_tol: f64,
    pub lbfgs_max_iter: usize,

    /// Unknown-span penalty: base and per-codepoint slope (natural log).
    pub unk_base: f64,
    pub unk_per_cp: f64,
    /// Weight of the LM term in the joint score.
    pub lambda0: f64,
    /// Virtual BOS -> word-start cost.
    pub bos_to1: f64,

    /// Train and tag the model for lossless whitespace.
    pub lossless_ws: bool,
    /// Also recode newlines when lossless is on.
    pub lossless_newlines: bool,

    pub cc_mode: CcMode,
    pub cc_fallback: CcMode,
    /// Range table file for `ranges` mode, one `start end class_id` per line.
    pub cc_ranges_path: Option<std::path::PathBuf>,

    /// Input lines longer than this are discarded whole.
    pub max_line_bytes: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_piece_len_cp: 8,
            keep_char_min_count: 1,
            cand_total: 20_000,
            em_iters: 4,
            em_smoothing: 0.5,
            min_prob: 1e-7,
            prune_enabled: true,
            prune_mode: PruneMode::TargetSize,
            target_vocab: 8000,
            mdl_lambda0: 0.5,
            mdl_lambda_len: 0.1,
            optimizer: CrfOptimizer::Lbfgs,
            sgd_lr: 0.5,
            sgd_epochs: 10,
            l2_lambda: 1e-4,
            lbfgs_history: 8,
            lbfgs_tol: 1e-4,
            lbfgs_max_iter: 100,
            unk_base: -16.0,
            unk_per_cp: -4.0,
            lambda0: 1.0,
            bos_to1: 0.0,
            lossless_ws: false,
            lossless_newlines: false,
            cc_mode: CcMode::Compat,
            cc_fallback: CcMode::Ascii,
            cc_ranges_path: None,
            max_line_bytes: 65536,
        }
    }
}

impl TrainerConfig {
    /// Load configuration from a TOML file.
    pub fn load_toml<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Save configuration to a TOML file.
    pub fn save_toml<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml_string()?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Parse {
            line: 0,
            msg: e.to_string(),
        })
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Parse {
            line: 0,
            msg: e.to_string(),
        })
    }

    /// Build the classifier these settings describe, reading the range
    /// table file when `ranges` mode is selected.
    pub fn classifier(&self) -> Result<CharClassifier> {
        let ranges = match (&self.cc_ranges_path, self.cc_mode) {
            (Some(path), CcMode::Ranges) => {
                let text = std::fs::read_to_string(path)?;
                charclass::parse_cc_ranges(&text)?
            }
            (None, CcMode::Ranges) => {
                return Err(Error::BadArg("ranges mode requires cc_ranges_path"));
            }
            _ => Vec::new(),
        };
        CharClassifier::new(self.cc_mode, self.cc_fallback, ranges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips_through_toml() {
        let mut cfg = TrainerConfig::default();
        cfg.target_vocab = 1234;
        cfg.optimizer = CrfOptimizer::Sgd;
        cfg.cc_mode = CcMode::Utf8Len;
        let text = cfg.to_toml_string().unwrap();
        let back = TrainerConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.target_vocab, 1234);
        assert_eq!(back.optimizer, CrfOptimizer::Sgd);
        assert_eq!(back.cc_mode, CcMode::Utf8Len);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let cfg = TrainerConfig::from_toml_str("target_vocab = 99\n").unwrap();
        assert_eq!(cfg.target_vocab, 99);
        assert_eq!(cfg.em_iters, TrainerConfig::default().em_iters);
        assert_eq!(cfg.cc_mode, CcMode::Compat);
    }

    #[test]
    fn ranges_mode_requires_a_table() {
        let mut cfg = TrainerConfig::default();
        cfg.cc_mode = CcMode::Ranges;
        assert!(cfg.classifier().is_err());
        cfg.cc_mode = CcMode::Compat;
        assert!(cfg.classifier().is_ok());
    }
}
