//! mmjp
//!
//! Command-line front end for libmmjp-core: stream tokenization and
//! detokenization with the lossless whitespace codec, plus the training
//! pipeline (candidate mining, unigram EM/MDL, CRF fitting) behind
//! subcommands. This library half holds the line-level pipeline helpers so
//! they stay testable without a process.

use libmmjp_core::{
    crf::{NUM_TEMPLATES, TPL_CUR},
    crf_trainer::CrfWeights,
    lossless, Decoder, Model, Result, WorkArea, Xorshift32,
};

/// How a single line is segmented.
pub enum LineMode {
    /// Best path only.
    Viterbi,
    /// Top-N paths, tab-separated on output.
    NBest(usize),
    /// One FFBS draw at the given temperature.
    Sample(f64),
}

/// Per-stream tokenizer state: decoder, reusable work area, RNG.
pub struct Tokenizer<'m> {
    model: &'m Model,
    decoder: Decoder<'m>,
    wa: WorkArea,
    rng: Xorshift32,
    lossless: bool,
    newlines: bool,
}

impl<'m> Tokenizer<'m> {
    pub fn new(model: &'m Model, lossless: Option<bool>, newlines: bool, seed: u32) -> Self {
        Self {
            model,
            decoder: Decoder::new(model),
            wa: WorkArea::new(),
            rng: Xorshift32::new(seed),
            lossless: lossless.unwrap_or(model.lossless_ws()),
            newlines,
        }
    }

    pub fn lossless(&self) -> bool {
        self.lossless
    }

    /// Segment one line into a printable string: tokens joined by single
    /// spaces; n-best variants joined by tabs.
    pub fn tokenize_line(&mut self, line: &[u8], mode: &LineMode) -> Result<String> {
        let encoded;
        let input: &[u8] = if self.lossless {
            encoded = lossless::encode(line, self.newlines);
            &encoded
        } else {
            line
        };

        match mode {
            LineMode::Viterbi => {
                let mut bounds = Vec::new();
                self.decoder.viterbi(input, &mut self.wa, &mut bounds)?;
                Ok(join_tokens(
                    &self.decoder.tokens(input, &self.wa, &bounds),
                ))
            }
            LineMode::Sample(temp) => {
                let mut bounds = Vec::new();
                self.decoder
                    .sample(input, *temp, &mut self.rng, &mut self.wa, &mut bounds)?;
                Ok(join_tokens(
                    &self.decoder.tokens(input, &self.wa, &bounds),
                ))
            }
            LineMode::NBest(n) => {
                let paths = self.decoder.kbest(input, *n, &mut self.wa)?;
                let rendered: Vec<String> = paths
                    .iter()
                    .map(|p| join_tokens(&self.decoder.tokens(input, &self.wa, &p.boundaries)))
                    .collect();
                Ok(rendered.join("\t"))
            }
        }
    }

    pub fn model(&self) -> &Model {
        self.model
    }
}

fn join_tokens(tokens: &[&[u8]]) -> String {
    let strs: Vec<String> = tokens
        .iter()
        .map(|t| String::from_utf8_lossy(t).into_owned())
        .collect();
    strs.join(" ")
}

/// Invert a tokenized line: drop inter-token spaces, lossless-decode when
/// requested. The caller appends the trailing newline if missing.
pub fn detokenize_line(line: &str, lossless: bool) -> Vec<u8> {
    let joined: String = line.split(' ').collect::<Vec<_>>().concat();
    if lossless {
        lossless::decode(joined.as_bytes())
    } else {
        joined.into_bytes()
    }
}

/// Render trained CRF weights in the text weight-file format.
pub fn format_crf_weights(w: &CrfWeights, bos_to1: f64) -> String {
    use std::fmt::Write as _;
    let mut out = String::new();
    let _ = writeln!(out, "trans00 = {}", w.trans[0]);
    let _ = writeln!(out, "trans01 = {}", w.trans[1]);
    let _ = writeln!(out, "trans10 = {}", w.trans[2]);
    let _ = writeln!(out, "trans11 = {}", w.trans[3]);
    let _ = writeln!(out, "bos_to1 = {}", bos_to1);
    let mut feats: Vec<(u32, f64)> = w.feats.iter().map(|(&k, &v)| (k, v)).collect();
    feats.sort_by_key(|&(k, _)| k);
    for (key, weight) in feats {
        let tid = (key >> 24) as u8;
        let label = ((key >> 16) & 0xFF) as u8;
        let v1 = ((key >> 8) & 0xFF) as u8;
        let v2 = (key & 0xFF) as u8;
        debug_assert!((TPL_CUR..NUM_TEMPLATES).contains(&tid));
        let _ = writeln!(out, "feat {} {} {} {} = {}", tid, label, v1, v2, weight);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use libmmjp_core::ModelBuilder;

    fn lossless_model() -> Model {
        let mut b = ModelBuilder::new();
        b.piece("a".as_bytes(), -1.0).unwrap();
        b.piece("b".as_bytes(), -1.0).unwrap();
        b.piece("ab".as_bytes(), -0.5).unwrap();
        b.piece("\u{2581}".as_bytes(), -1.0).unwrap();
        b.piece("\u{2582}".as_bytes(), -1.5).unwrap();
        b.piece("\u{2583}".as_bytes(), -1.5).unwrap();
        b.piece("\u{2584}".as_bytes(), -1.5).unwrap();
        b.lossless_ws(true);
        b.build().unwrap()
    }

    #[test]
    fn tokenize_then_detokenize_commutes() {
        let model = lossless_model();
        let mut tok = Tokenizer::new(&model, None, false, 1);
        assert!(tok.lossless());

        for text in ["ab ab", "a  b", " ab", "ab ", "a\tb", "abba abab"] {
            let line = tok
                .tokenize_line(text.as_bytes(), &LineMode::Viterbi)
                .unwrap();
            let back = detokenize_line(&line, true);
            assert_eq!(back, text.as_bytes(), "round trip failed for {text:?}");
        }
    }

    #[test]
    fn tokenize_without_lossless_keeps_raw_bytes() {
        let model = lossless_model();
        let mut tok = Tokenizer::new(&model, Some(false), false, 1);
        let line = tok.tokenize_line(b"abab", &LineMode::Viterbi).unwrap();
        let joined: String = line.split(' ').collect::<Vec<_>>().concat();
        assert_eq!(joined, "abab");
    }

    #[test]
    fn nbest_renders_tab_separated_alternatives() {
        let model = lossless_model();
        let mut tok = Tokenizer::new(&model, Some(false), false, 1);
        let line = tok.tokenize_line(b"ab", &LineMode::NBest(4)).unwrap();
        let variants: Vec<&str> = line.split('\t').collect();
        assert_eq!(variants[0], "ab");
        assert!(variants.len() >= 2);
        assert!(variants.contains(&"a b"));
    }

    #[test]
    fn sampling_mode_produces_valid_cover() {
        let model = lossless_model();
        let mut tok = Tokenizer::new(&model, Some(false), false, 7);
        for _ in 0..20 {
            let line = tok
                .tokenize_line(b"abab", &LineMode::Sample(2.0))
                .unwrap();
            let joined: String = line.split(' ').collect::<Vec<_>>().concat();
            assert_eq!(joined, "abab");
        }
    }

    #[test]
    fn weight_file_render_parses_back() {
        use libmmjp_core::crf::{pack_key, parse_crf_weights};
        let mut w = CrfWeights::default();
        w.trans = [0.25, -0.5, 0.75, -1.0];
        w.feats.insert(pack_key(0, 1, 6, 0), 2.0);
        w.feats.insert(pack_key(3, 0, 4, 6), -0.125);
        let text = format_crf_weights(&w, 0.5);
        let parsed = parse_crf_weights(&text).unwrap();
        assert_eq!(parsed.trans00, Some(0.25));
        assert_eq!(parsed.trans11, Some(-1.0));
        assert_eq!(parsed.bos_to1, Some(0.5));
        assert_eq!(parsed.feats.len(), 2);
    }
}
