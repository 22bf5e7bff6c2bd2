// core/src/format.rs
//
// Little-endian binary model format. Version 2 is written; version 1 files
// (no flags, classifier bytes, or range records) are still accepted and get
// COMPAT classification, matching the models that predate configurable
// character classes.
//
// Header layout (all little-endian):
//   0  magic "MMJPv2\0\0"      32 lambda0 (Q8.8)       48 bigram_size
//   8  version = 2             34 trans00              52 flags
//  12  da_index_bytes = 4      36 trans01              56 cc_mode
//  16  da_capacity             38 trans10              57 cc_fallback
//  20  vocab_size              40 trans11              58 padding = 0
//  24  max_word_len            42 bos_to1              60 cc_range_count
//  28  unk_base (Q8.8)         44 feat_count
//  30  unk_per_cp (Q8.8)
// then: base[], check[] (i32), logp_uni[] (i16), bigram keys (u32) and
// values (i16), feature keys (u32) and weights (i16), and per-range
// records (u32 lo, u32 hi, u8 class, u8 pad[3]).

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::charclass::{CcMode, CcRange, CharClassifier};
use crate::crf::{CrfParams, FeatureTable};
use crate::error::{Error, Result};
use crate::model::Model;
use crate::piece::MAX_VOCAB;

pub const MAGIC_V2: &[u8; 8] = b"MMJPv2\0\0";
pub const MAGIC_V1: &[u8; 8] = b"MMJPv1\0\0";

const DA_INDEX_BYTES: u32 = 4;
const MAX_DA_CAPACITY: u32 = 1 << 26;
const MAX_TABLE_LEN: u32 = 1 << 26;
const MAX_RANGES: u32 = 1 << 20;

/// Serialize a model in the v2 layout.
pub fn save_model<W: Write>(model: &Model, w: &mut W) -> Result<()> {
    let (base, check) = model.da_arrays();
    let feats = model.features();
    let crf = model.crf_params();
    let (unk_base, unk_per_cp) = model.unk_params();
    let clf = model.classifier();

    w.write_all(MAGIC_V2)?;
    w.write_u32::<LittleEndian>(2)?;
    w.write_u32::<LittleEndian>(DA_INDEX_BYTES)?;
    w.write_u32::<LittleEndian>(base.len() as u32)?;
    w.write_u32::<LittleEndian>(model.vocab_size() as u32)?;
    w.write_u32::<LittleEndian>(model.max_word_len())?;
    w.write_i16::<LittleEndian>(unk_base)?;
    w.write_i16::<LittleEndian>(unk_per_cp)?;
    w.write_i16::<LittleEndian>(model.lambda0())?;
    w.write_i16::<LittleEndian>(crf.trans00)?;
    w.write_i16::<LittleEndian>(crf.trans01)?;
    w.write_i16::<LittleEndian>(crf.trans10)?;
    w.write_i16::<LittleEndian>(crf.trans11)?;
    w.write_i16::<LittleEndian>(crf.bos_to1)?;
    w.write_u32::<LittleEndian>(feats.len() as u32)?;
    w.write_u32::<LittleEndian>(model.bigram_len() as u32)?;
    w.write_u32::<LittleEndian>(model.flags())?;
    w.write_u8(clf.mode().as_byte())?;
    w.write_u8(clf.fallback().as_byte())?;
    w.write_u16::<LittleEndian>(0)?;
    w.write_u32::<LittleEndian>(clf.ranges().len() as u32)?;

    for &v in base {
        w.write_i32::<LittleEndian>(v)?;
    }
    for &v in check {
        w.write_i32::<LittleEndian>(v)?;
    }
    for &v in &model.logp_uni {
        w.write_i16::<LittleEndian>(v)?;
    }
    for &k in &model.bigram_keys {
        w.write_u32::<LittleEndian>(k)?;
    }
    for &v in &model.bigram_logp {
        w.write_i16::<LittleEndian>(v)?;
    }
    for &k in feats.keys() {
        w.write_u32::<LittleEndian>(k)?;
    }
    for &v in feats.weights() {
        w.write_i16::<LittleEndian>(v)?;
    }
    for r in clf.ranges() {
        w.write_u32::<LittleEndian>(r.lo)?;
        w.write_u32::<LittleEndian>(r.hi)?;
        w.write_u8(r.class_id)?;
        w.write_all(&[0u8; 3])?;
    }
    Ok(())
}

/// Deserialize a v1 or v2 model. All tables end up in one owned [`Model`].
pub fn load_model<R: Read>(r: &mut R) -> Result<Model> {
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)?;
    let v1 = match &magic {
        m if m == MAGIC_V2 => false,
        m if m == MAGIC_V1 => true,
        _ => return Err(Error::BadArg("bad model magic")),
    };
    let version = r.read_u32::<LittleEndian>()?;
    if (v1 && version != 1) || (!v1 && version != 2) {
        return Err(Error::BadArg("model version does not match magic"));
    }
    let da_index_bytes = r.read_u32::<LittleEndian>()?;
    if da_index_bytes != DA_INDEX_BYTES {
        return Err(Error::BadArg("unsupported double-array index width"));
    }
    let da_capacity = r.read_u32::<LittleEndian>()?;
    if da_capacity < 2 || da_capacity > MAX_DA_CAPACITY {
        return Err(Error::BadArg("double-array capacity out of range"));
    }
    let vocab = r.read_u32::<LittleEndian>()?;
    if vocab as usize > MAX_VOCAB {
        return Err(Error::BadArg("vocabulary too large"));
    }
    let max_word_len = r.read_u32::<LittleEndian>()?;
    if max_word_len == 0 {
        return Err(Error::BadArg("max word length is zero"));
    }
    let unk_base = r.read_i16::<LittleEndian>()?;
    let unk_per_cp = r.read_i16::<LittleEndian>()?;
    let lambda0 = r.read_i16::<LittleEndian>()?;
    let crf = CrfParams {
        trans00: r.read_i16::<LittleEndian>()?,
        trans01: r.read_i16::<LittleEndian>()?,
        trans10: r.read_i16::<LittleEndian>()?,
        trans11: r.read_i16::<LittleEndian>()?,
        bos_to1: r.read_i16::<LittleEndian>()?,
    };
    let feat_count = r.read_u32::<LittleEndian>()?;
    let bigram_size = r.read_u32::<LittleEndian>()?;
    if feat_count > MAX_TABLE_LEN || bigram_size > MAX_TABLE_LEN {
        return Err(Error::BadArg("table size out of range"));
    }

    let (flags, cc_mode, cc_fallback, range_count) = if v1 {
        (0u32, CcMode::Compat, CcMode::Ascii, 0u32)
    } else {
        let flags = r.read_u32::<LittleEndian>()?;
        let mode = CcMode::from_byte(r.read_u8()?)?;
        let fallback = CcMode::from_byte(r.read_u8()?)?;
        let _pad = r.read_u16::<LittleEndian>()?;
        let range_count = r.read_u32::<LittleEndian>()?;
        if range_count > MAX_RANGES {
            return Err(Error::BadArg("range table too large"));
        }
        (flags, mode, fallback, range_count)
    };

    let mut base = vec![0i32; da_capacity as usize];
    r.read_i32_into::<LittleEndian>(&mut base)?;
    let mut check = vec![0i32; da_capacity as usize];
    r.read_i32_into::<LittleEndian>(&mut check)?;
    let mut logp_uni = vec![0i16; vocab as usize];
    r.read_i16_into::<LittleEndian>(&mut logp_uni)?;

    let mut bigram_keys = vec![0u32; bigram_size as usize];
    let mut bigram_logp = vec![0i16; bigram_size as usize];
    if bigram_size > 0 {
        r.read_u32_into::<LittleEndian>(&mut bigram_keys)?;
        r.read_i16_into::<LittleEndian>(&mut bigram_logp)?;
        if bigram_keys.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::BadArg("bigram keys not strictly sorted"));
        }
    }

    let mut feat_keys = vec![0u32; feat_count as usize];
    let mut feat_w = vec![0i16; feat_count as usize];
    if feat_count > 0 {
        r.read_u32_into::<LittleEndian>(&mut feat_keys)?;
        r.read_i16_into::<LittleEndian>(&mut feat_w)?;
    }
    let feats = FeatureTable::from_sorted(feat_keys, feat_w)?;

    let mut ranges = Vec::with_capacity(range_count as usize);
    for _ in 0..range_count {
        let lo = r.read_u32::<LittleEndian>()?;
        let hi = r.read_u32::<LittleEndian>()?;
        let class_id = r.read_u8()?;
        let mut pad = [0u8; 3];
        r.read_exact(&mut pad)?;
        ranges.push(CcRange { lo, hi, class_id });
    }
    let classifier = CharClassifier::new(cc_mode, cc_fallback, ranges)?;

    Ok(Model {
        base,
        check,
        logp_uni,
        bigram_keys,
        bigram_logp,
        feats,
        crf,
        unk_base,
        unk_per_cp,
        lambda0,
        max_word_len,
        flags,
        classifier,
    })
}

pub fn save_model_file<P: AsRef<Path>>(model: &Model, path: P) -> Result<()> {
    let file = File::create(path)?;
    let mut w = BufWriter::new(file);
    save_model(model, &mut w)?;
    w.flush()?;
    Ok(())
}

pub fn load_model_file<P: AsRef<Path>>(path: P) -> Result<Model> {
    let file = File::open(path)?;
    let mut r = BufReader::new(file);
    load_model(&mut r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Decoder;
    use crate::model::{ModelBuilder, FLAG_CC_COMPAT};
    use crate::piece::PIECE_BOS;
    use crate::workarea::WorkArea;

    fn sample_model() -> Model {
        let mut b = ModelBuilder::new();
        let a = b.piece("あ".as_bytes(), -1.25).unwrap();
        b.piece("い".as_bytes(), -1.5).unwrap();
        let ai = b.piece("あい".as_bytes(), -0.75).unwrap();
        b.bigram(PIECE_BOS, ai, -0.5);
        b.bigram(a, a, -0.25);
        b.transitions(0.1, -0.2, 0.3, -0.4, 0.5);
        b.feature(crate::crf::pack_key(0, 1, 4, 0), 1.0);
        b.feature(crate::crf::pack_key(3, 0, 4, 4), -1.0);
        b.lossless_ws(true);
        b.build().unwrap()
    }

    #[test]
    fn v2_round_trip_preserves_decoding() {
        let model = sample_model();
        let mut buf = Vec::new();
        save_model(&model, &mut buf).unwrap();
        let loaded = load_model(&mut buf.as_slice()).unwrap();

        assert_eq!(loaded.vocab_size(), model.vocab_size());
        assert_eq!(loaded.max_word_len(), model.max_word_len());
        assert_eq!(loaded.crf_params(), model.crf_params());
        assert_eq!(loaded.flags(), model.flags());
        assert!(loaded.lossless_ws());
        assert_ne!(loaded.flags() & FLAG_CC_COMPAT, 0);

        let text = "あいあ".as_bytes();
        let mut wa1 = WorkArea::new();
        let mut wa2 = WorkArea::new();
        let mut b1 = Vec::new();
        let mut b2 = Vec::new();
        let s1 = Decoder::new(&model).viterbi(text, &mut wa1, &mut b1).unwrap();
        let s2 = Decoder::new(&loaded)
            .viterbi(text, &mut wa2, &mut b2)
            .unwrap();
        assert_eq!(s1, s2);
        assert_eq!(b1, b2);
    }

    #[test]
    fn file_round_trip() {
        let model = sample_model();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.mmjp");
        save_model_file(&model, &path).unwrap();
        let loaded = load_model_file(&path).unwrap();
        assert_eq!(loaded.vocab_size(), 3);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = Vec::new();
        save_model(&sample_model(), &mut buf).unwrap();
        buf[0] = b'X';
        assert!(matches!(
            load_model(&mut buf.as_slice()),
            Err(Error::BadArg(_))
        ));
    }

    #[test]
    fn truncated_file_is_io_error() {
        let mut buf = Vec::new();
        save_model(&sample_model(), &mut buf).unwrap();
        buf.truncate(buf.len() / 2);
        assert!(matches!(load_model(&mut buf.as_slice()), Err(Error::Io(_))));
    }

    #[test]
    fn v1_header_gets_compat_defaults() {
        // build a v1 image by hand: the v2 header through bigram_size, then
        // the arrays without flags/classifier/ranges
        let model = sample_model();
        let mut v2 = Vec::new();
        save_model(&model, &mut v2).unwrap();

        let mut v1 = Vec::new();
        v1.extend_from_slice(MAGIC_V1);
        v1.extend_from_slice(&1u32.to_le_bytes());
        v1.extend_from_slice(&v2[12..52]); // da through bigram_size
        v1.extend_from_slice(&v2[64..]); // arrays; no ranges present

        // sample_model has no ranges, so the tail is exactly the arrays
        let loaded = load_model(&mut v1.as_slice()).unwrap();
        assert_eq!(loaded.flags(), 0);
        assert_eq!(loaded.classifier().mode(), CcMode::Compat);
        assert_eq!(loaded.classifier().fallback(), CcMode::Ascii);
        assert_eq!(loaded.vocab_size(), model.vocab_size());
    }

    #[test]
    fn version_must_match_magic() {
        let mut buf = Vec::new();
        save_model(&sample_model(), &mut buf).unwrap();
        buf[8] = 1; // claim version 1 under a v2 magic
        assert!(matches!(
            load_model(&mut buf.as_slice()),
            Err(Error::BadArg(_))
        ));
    }
}
