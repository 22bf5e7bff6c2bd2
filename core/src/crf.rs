// core/src/crf.rs
//
// CRF inference tables: the five Q8.8 transition scalars, the sorted
// feature-key table, emission computation over the five templates, and the
// text-format weight file parser.
//
// Feature keys pack as (template << 24) | (label << 16) | (v1 << 8) | v2.
// Lookup is a binary search over a sorted u32 array; the table is frozen
// after training, and the decoder never hashes.

use tracing::warn;

use crate::error::{Error, Result};
use crate::qformat::sat16;

/// Feature template ids.
pub const TPL_CUR: u8 = 0;
pub const TPL_PREV: u8 = 1;
pub const TPL_NEXT: u8 = 2;
pub const TPL_PREV_CUR: u8 = 3;
pub const TPL_CUR_NEXT: u8 = 4;

/// Number of feature templates.
pub const NUM_TEMPLATES: u8 = 5;

/// The five Q8.8 transition scalars. Label 0 is word-internal, label 1 is
/// word-start; `transXY` is the cost of moving from label X to label Y.
/// `bos_to1` is the virtual BOS -> 1 cost applied once at position 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrfParams {
    pub trans00: i16,
    pub trans01: i16,
    pub trans10: i16,
    pub trans11: i16,
    pub bos_to1: i16,
}

/// Pack a feature key.
#[inline]
pub fn pack_key(template: u8, label: u8, v1: u8, v2: u8) -> u32 {
    ((template as u32) << 24) | ((label as u32) << 16) | ((v1 as u32) << 8) | v2 as u32
}

/// Sorted parallel arrays of feature keys and Q8.8 weights. An unseen key
/// has weight 0.
#[derive(Debug, Clone, Default)]
pub struct FeatureTable {
    keys: Vec<u32>,
    weights: Vec<i16>,
}

impl FeatureTable {
    /// Build from unsorted `(key, weight)` pairs; later duplicates win.
    pub fn from_pairs(mut pairs: Vec<(u32, i16)>) -> Self {
        pairs.sort_by_key(|&(k, _)| k);
        let mut keys = Vec::with_capacity(pairs.len());
        let mut weights = Vec::with_capacity(pairs.len());
        for (k, w) in pairs {
            if keys.last() == Some(&k) {
                *weights.last_mut().unwrap() = w;
            } else {
                keys.push(k);
                weights.push(w);
            }
        }
        Self { keys, weights }
    }

    /// Rewrap arrays already sorted (e.g. loaded from a model file).
    pub fn from_sorted(keys: Vec<u32>, weights: Vec<i16>) -> Result<Self> {
        if keys.len() != weights.len() {
            return Err(Error::BadArg("feature key/weight length mismatch"));
        }
        if keys.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::BadArg("feature keys not strictly sorted"));
        }
        Ok(Self { keys, weights })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[u32] {
        &self.keys
    }

    pub fn weights(&self) -> &[i16] {
        &self.weights
    }

    /// Weight of `key`, 0 when unseen.
    #[inline]
    pub fn weight(&self, key: u32) -> i32 {
        match self.keys.binary_search(&key) {
            Ok(i) => self.weights[i] as i32,
            Err(_) => 0,
        }
    }
}

/// Sum the five templates for `label` at a position with the given class
/// context, saturated to the i16 range.
#[inline]
pub fn emit(feats: &FeatureTable, label: u8, prev: u8, cur: u8, next: u8) -> i32 {
    let sum = feats.weight(pack_key(TPL_CUR, label, cur, 0)) as i64
        + feats.weight(pack_key(TPL_PREV, label, prev, 0)) as i64
        + feats.weight(pack_key(TPL_NEXT, label, next, 0)) as i64
        + feats.weight(pack_key(TPL_PREV_CUR, label, prev, cur)) as i64
        + feats.weight(pack_key(TPL_CUR_NEXT, label, cur, next)) as i64;
    sat16(sum) as i32
}

/// Parsed contents of a CRF weight text file, in natural-log units.
#[derive(Debug, Clone, Default)]
pub struct CrfTextWeights {
    pub trans00: Option<f64>,
    pub trans01: Option<f64>,
    pub trans10: Option<f64>,
    pub trans11: Option<f64>,
    pub bos_to1: Option<f64>,
    pub feats: Vec<(u32, f64)>,
}

/// Parse the CRF config text format.
///
/// Whitespace-tolerant; `#` and `;` start comments. Recognized forms:
/// `transXY = <float>`, `bos_to1 = <float>`, and
/// `feat <tid> <label> <v1> <v2> [=] <weight>`. Lines with an unknown
/// feature key (template or label out of range) are reported and ignored.
pub fn parse_crf_weights(text: &str) -> Result<CrfTextWeights> {
    let mut out = CrfTextWeights::default();
    for (lineno, raw) in text.lines().enumerate() {
        let cut = raw
            .find(|c| c == '#' || c == ';')
            .map(|i| &raw[..i])
            .unwrap_or(raw);
        let line = cut.trim();
        if line.is_empty() {
            continue;
        }
        let parse_err = |msg: &str| Error::Parse {
            line: lineno + 1,
            msg: msg.to_string(),
        };

        let tokens: Vec<&str> = line
            .split(|c: char| c.is_whitespace() || c == '=')
            .filter(|t| !t.is_empty())
            .collect();
        match tokens.as_slice() {
            [name, value]
                if matches!(
                    *name,
                    "trans00" | "trans01" | "trans10" | "trans11" | "bos_to1"
                ) =>
            {
                let v: f64 = value.parse().map_err(|_| parse_err("bad float"))?;
                match *name {
                    "trans00" => out.trans00 = Some(v),
                    "trans01" => out.trans01 = Some(v),
                    "trans10" => out.trans10 = Some(v),
                    "trans11" => out.trans11 = Some(v),
                    _ => out.bos_to1 = Some(v),
                }
            }
            ["feat", tid, label, v1, v2, weight] => {
                let tid: u32 = tid.parse().map_err(|_| parse_err("bad template id"))?;
                let label: u32 = label.parse().map_err(|_| parse_err("bad label"))?;
                let v1: u32 = v1.parse().map_err(|_| parse_err("bad v1"))?;
                let v2: u32 = v2.parse().map_err(|_| parse_err("bad v2"))?;
                let w: f64 = weight.parse().map_err(|_| parse_err("bad weight"))?;
                if tid >= NUM_TEMPLATES as u32 || label > 1 || v1 > 255 || v2 > 255 {
                    warn!(
                        line = lineno + 1,
                        tid, label, v1, v2, "ignoring unknown feature key"
                    );
                    continue;
                }
                out.feats
                    .push((pack_key(tid as u8, label as u8, v1 as u8, v2 as u8), w));
            }
            _ => return Err(parse_err("unrecognized line")),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qformat::to_q8;

    #[test]
    fn key_packing_layout() {
        assert_eq!(pack_key(0, 0, 0, 0), 0);
        assert_eq!(pack_key(4, 1, 0x12, 0x34), 0x0401_1234);
    }

    #[test]
    fn missing_feature_weight_is_zero() {
        let table = FeatureTable::from_pairs(vec![(pack_key(0, 1, 3, 0), 100)]);
        assert_eq!(table.weight(pack_key(0, 1, 3, 0)), 100);
        assert_eq!(table.weight(pack_key(0, 0, 3, 0)), 0);
    }

    #[test]
    fn emit_sums_all_five_templates() {
        let table = FeatureTable::from_pairs(vec![
            (pack_key(TPL_CUR, 1, 6, 0), 10),
            (pack_key(TPL_PREV, 1, 4, 0), 20),
            (pack_key(TPL_NEXT, 1, 5, 0), 40),
            (pack_key(TPL_PREV_CUR, 1, 4, 6), 80),
            (pack_key(TPL_CUR_NEXT, 1, 6, 5), 160),
            // different label must not contribute
            (pack_key(TPL_CUR, 0, 6, 0), 5000),
        ]);
        assert_eq!(emit(&table, 1, 4, 6, 5), 310);
    }

    #[test]
    fn emit_saturates_to_i16() {
        let table = FeatureTable::from_pairs(vec![
            (pack_key(TPL_CUR, 1, 1, 0), i16::MAX),
            (pack_key(TPL_PREV, 1, 1, 0), i16::MAX),
            (pack_key(TPL_NEXT, 1, 1, 0), i16::MAX),
        ]);
        assert_eq!(emit(&table, 1, 1, 1, 1), i16::MAX as i32);
    }

    #[test]
    fn parse_weight_file_forms() {
        let text = "\
# comment
trans00 = 0.25
trans11 -1.5        ; inline comment
feat 0 1 6 0 = 2.0
feat 4 0 6 5 -0.125
feat 7 1 6 0 = 9.0
";
        let w = parse_crf_weights(text).unwrap();
        assert_eq!(w.trans00, Some(0.25));
        assert_eq!(w.trans11, Some(-1.5));
        assert_eq!(w.trans01, None);
        // the template-7 line is reported and ignored
        assert_eq!(w.feats.len(), 2);
        assert_eq!(w.feats[0].0, pack_key(0, 1, 6, 0));
        assert_eq!(to_q8(w.feats[1].1), -32);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_crf_weights("trans00 = not_a_float\n").is_err());
        assert!(parse_crf_weights("bogus line here\n").is_err());
        assert!(parse_crf_weights("feat 1 2\n").is_err());
    }

    #[test]
    fn from_sorted_validates() {
        assert!(FeatureTable::from_sorted(vec![1, 2, 3], vec![1, 2, 3]).is_ok());
        assert!(FeatureTable::from_sorted(vec![2, 1], vec![1, 2]).is_err());
        assert!(FeatureTable::from_sorted(vec![1], vec![1, 2]).is_err());
    }
}
