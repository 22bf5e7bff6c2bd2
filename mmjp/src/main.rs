use std::fs;
use std::io::{self, BufRead, Read, Write};
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use libmmjp_core::{
    candidates,
    crf::{parse_crf_weights, FeatureTable},
    crf_trainer, format, lossless,
    qformat::to_q8,
    CrfOptimizer, TrainerConfig, UnigramTrainer, NBEST_MAX,
};
use mmjp::{detokenize_line, format_crf_weights, LineMode, Tokenizer};

#[derive(Parser)]
#[command(name = "mmjp", version, about = "Joint CRF+LM subword tokenizer")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Segment stdin line by line (or whole with --read-all)
    Tokenize {
        /// Model file
        model: PathBuf,
        /// Emit the N best segmentations, tab-separated
        #[arg(long, default_value_t = 1)]
        nbest: usize,
        /// Draw one FFBS sample per line instead of the best path
        #[arg(long)]
        sample: bool,
        /// Sampling temperature
        #[arg(long, default_value_t = 1.0)]
        temp: f64,
        /// Sampling seed
        #[arg(long, default_value_t = 42)]
        seed: u32,
        /// Tokenize the entire input as one sentence
        #[arg(long)]
        read_all: bool,
        /// Discard lines longer than this many bytes
        #[arg(long, default_value_t = 65536)]
        max_line_bytes: usize,
        /// Force lossless whitespace encoding on
        #[arg(long, conflicts_with = "raw")]
        lossless: bool,
        /// Force lossless whitespace encoding off
        #[arg(long)]
        raw: bool,
        /// Also recode newlines in lossless mode
        #[arg(long)]
        newlines: bool,
    },
    /// Join tokens of each stdin line and undo the lossless encoding
    Detokenize {
        /// Model file; supplies the lossless flag when given
        #[arg(long)]
        model: Option<PathBuf>,
        #[arg(long, conflicts_with = "raw")]
        lossless: bool,
        #[arg(long)]
        raw: bool,
    },
    /// Train the unigram LM from a raw corpus and write a model
    TrainLm {
        corpus: PathBuf,
        out: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Train CRF weights on gold or pseudo-labeled data
    TrainCrf {
        /// Existing model supplying the LM and classifier
        model: PathBuf,
        /// Gold segmented text, whitespace-separated tokens per line
        #[arg(long, conflicts_with = "unsupervised")]
        gold: Option<PathBuf>,
        /// Raw corpus for LM-only pseudo-labels
        #[arg(long)]
        unsupervised: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Output model path (defaults to overwriting the input model)
        #[arg(long)]
        out: Option<PathBuf>,
        /// Also write the weights as a text weight file
        #[arg(long)]
        weights_out: Option<PathBuf>,
    },
    /// Apply a text weight file onto a model
    ApplyWeights {
        model: PathBuf,
        weights: PathBuf,
        out: PathBuf,
    },
    /// Mine candidate n-grams from a corpus and print them
    Mine {
        corpus: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print a model's header fields and table sizes
    Info {
        model: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();
    let cli = Cli::parse();
    if let Err(err) = run(cli.cmd) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cmd: Cmd) -> anyhow::Result<()> {
    match cmd {
        Cmd::Tokenize {
            model,
            nbest,
            sample,
            temp,
            seed,
            read_all,
            max_line_bytes,
            lossless,
            raw,
            newlines,
        } => {
            let model = format::load_model_file(&model).context("loading model")?;
            let mode = if sample {
                LineMode::Sample(temp)
            } else if nbest > 1 {
                LineMode::NBest(nbest.min(NBEST_MAX))
            } else {
                LineMode::Viterbi
            };
            let mut tok = Tokenizer::new(&model, override_flag(lossless, raw), newlines, seed);
            let stdout = io::stdout();
            let mut out = stdout.lock();

            if read_all {
                let mut buf = Vec::new();
                io::stdin().lock().read_to_end(&mut buf)?;
                let line = tok.tokenize_line(&buf, &mode)?;
                writeln!(out, "{line}")?;
            } else {
                for line in io::stdin().lock().lines() {
                    let line = line?;
                    if line.len() > max_line_bytes {
                        warn!(len = line.len(), "discarding over-long line");
                        continue;
                    }
                    let rendered = tok.tokenize_line(line.as_bytes(), &mode)?;
                    writeln!(out, "{rendered}")?;
                }
            }
            Ok(())
        }

        Cmd::Detokenize {
            model,
            lossless,
            raw,
        } => {
            let from_model = match model {
                Some(path) => format::load_model_file(&path)?.lossless_ws(),
                None => true,
            };
            let decode = override_flag(lossless, raw).unwrap_or(from_model);
            let stdout = io::stdout();
            let mut out = stdout.lock();
            for line in io::stdin().lock().lines() {
                let line = line?;
                let mut bytes = detokenize_line(&line, decode);
                if bytes.last() != Some(&b'\n') {
                    bytes.push(b'\n');
                }
                out.write_all(&bytes)?;
            }
            Ok(())
        }

        Cmd::TrainLm {
            corpus,
            out,
            config,
        } => {
            let cfg = load_config(config)?;
            let raw_lines = read_corpus(&corpus, cfg.max_line_bytes)?;
            let sentences: Vec<Vec<u8>> = if cfg.lossless_ws {
                raw_lines
                    .iter()
                    .map(|l| lossless::encode(l, cfg.lossless_newlines))
                    .collect()
            } else {
                raw_lines
            };

            let mut trainer = UnigramTrainer::new(cfg.max_piece_len_cp)?;
            let seeded = trainer.seed_chars(&sentences, cfg.keep_char_min_count)?;
            let cands = candidates::mine(&sentences, cfg.max_piece_len_cp, cfg.cand_total)?;
            let added = trainer.add_candidates(&cands)?;
            info!(seeded, candidates = added, "vocabulary initialized");

            let stats = trainer.train(&sentences, &cfg)?;
            info!(
                vocab = stats.vocab_size,
                log_likelihood = stats.last.log_likelihood,
                "lm training finished"
            );

            let mut builder = trainer.export()?;
            builder
                .unknown_penalty(cfg.unk_base, cfg.unk_per_cp)
                .lambda0(cfg.lambda0)
                .transitions(0.0, 0.0, 0.0, 0.0, cfg.bos_to1)
                .lossless_ws(cfg.lossless_ws)
                .classifier(cfg.classifier()?);
            let model = builder.build()?;
            format::save_model_file(&model, &out)?;
            println!(
                "wrote {} ({} pieces, {} da slots)",
                out.display(),
                model.vocab_size(),
                model.da_capacity()
            );
            Ok(())
        }

        Cmd::TrainCrf {
            model: model_path,
            gold,
            unsupervised,
            config,
            out,
            weights_out,
        } => {
            let cfg = load_config(config)?;
            let model = format::load_model_file(&model_path).context("loading model")?;

            let data = if let Some(gold_path) = gold {
                let text = fs::read_to_string(&gold_path)?;
                let clf = model.classifier();
                text.lines()
                    .filter_map(|line| crf_trainer::sentence_from_gold(line, clf))
                    .collect::<Vec<_>>()
            } else if let Some(corpus_path) = unsupervised {
                let raw_lines = read_corpus(&corpus_path, cfg.max_line_bytes)?;
                let sentences: Vec<Vec<u8>> = if model.lossless_ws() {
                    raw_lines
                        .iter()
                        .map(|l| lossless::encode(l, cfg.lossless_newlines))
                        .collect()
                } else {
                    raw_lines
                };
                crf_trainer::pseudo_label(&model.lm_only(), &sentences)
            } else {
                bail!("train-crf needs --gold or --unsupervised");
            };
            if data.is_empty() {
                bail!("no usable training sentences");
            }
            info!(sentences = data.len(), "crf training set ready");

            let weights = match cfg.optimizer {
                CrfOptimizer::Sgd => crf_trainer::train_sgd(&data, &cfg)?,
                CrfOptimizer::Lbfgs => crf_trainer::train_lbfgs(&data, &cfg)?,
            };

            if let Some(wpath) = weights_out {
                fs::write(&wpath, format_crf_weights(&weights, cfg.bos_to1))?;
                println!("wrote weights {}", wpath.display());
            }

            let updated = model.with_crf(
                weights.params(cfg.bos_to1),
                FeatureTable::from_pairs(weights.feature_pairs()),
            );
            let dest = out.unwrap_or(model_path);
            format::save_model_file(&updated, &dest)?;
            println!("wrote {}", dest.display());
            Ok(())
        }

        Cmd::ApplyWeights {
            model,
            weights,
            out,
        } => {
            let model = format::load_model_file(&model)?;
            let text = fs::read_to_string(&weights)?;
            let parsed = parse_crf_weights(&text)?;

            let mut crf = model.crf_params();
            if let Some(v) = parsed.trans00 {
                crf.trans00 = to_q8(v);
            }
            if let Some(v) = parsed.trans01 {
                crf.trans01 = to_q8(v);
            }
            if let Some(v) = parsed.trans10 {
                crf.trans10 = to_q8(v);
            }
            if let Some(v) = parsed.trans11 {
                crf.trans11 = to_q8(v);
            }
            if let Some(v) = parsed.bos_to1 {
                crf.bos_to1 = to_q8(v);
            }

            // parsed entries override the model's existing table
            let feats = model.features();
            let mut pairs: Vec<(u32, i16)> = feats
                .keys()
                .iter()
                .copied()
                .zip(feats.weights().iter().copied())
                .collect();
            pairs.extend(parsed.feats.iter().map(|&(k, w)| (k, to_q8(w))));
            let updated = model.with_crf(crf, FeatureTable::from_pairs(pairs));
            format::save_model_file(&updated, &out)?;
            println!("wrote {}", out.display());
            Ok(())
        }

        Cmd::Mine { corpus, config } => {
            let cfg = load_config(config)?;
            let sentences = read_corpus(&corpus, cfg.max_line_bytes)?;
            let cands = candidates::mine(&sentences, cfg.max_piece_len_cp, cfg.cand_total)?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            for (bytes, count) in cands {
                writeln!(out, "{}\t{}", count, String::from_utf8_lossy(&bytes))?;
            }
            Ok(())
        }

        Cmd::Info { model, json } => {
            let m = format::load_model_file(&model).context("loading model")?;
            if json {
                let value = serde_json::json!({
                    "vocab_size": m.vocab_size(),
                    "max_word_len": m.max_word_len(),
                    "da_capacity": m.da_capacity(),
                    "bigrams": m.bigram_len(),
                    "features": m.features().len(),
                    "flags": m.flags(),
                    "lossless_ws": m.lossless_ws(),
                    "cc_mode": format!("{:?}", m.classifier().mode()),
                    "cc_ranges": m.classifier().ranges().len(),
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("vocab_size   {}", m.vocab_size());
                println!("max_word_len {}", m.max_word_len());
                println!("da_capacity  {}", m.da_capacity());
                println!("bigrams      {}", m.bigram_len());
                println!("features     {}", m.features().len());
                println!("flags        0x{:08x}", m.flags());
                println!("lossless_ws  {}", m.lossless_ws());
                println!("cc_mode      {:?}", m.classifier().mode());
                println!("cc_ranges    {}", m.classifier().ranges().len());
            }
            Ok(())
        }
    }
}

fn override_flag(on: bool, off: bool) -> Option<bool> {
    if on {
        Some(true)
    } else if off {
        Some(false)
    } else {
        None
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<TrainerConfig> {
    match path {
        Some(p) => {
            TrainerConfig::load_toml(&p).with_context(|| format!("reading {}", p.display()))
        }
        None => Ok(TrainerConfig::default()),
    }
}

/// Read a corpus as byte lines. Over-long and non-UTF-8 lines are
/// discarded whole with a warning.
fn read_corpus(path: &PathBuf, max_line_bytes: usize) -> anyhow::Result<Vec<Vec<u8>>> {
    let file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = io::BufReader::new(file);
    let mut lines = Vec::new();
    let mut buf = Vec::new();
    let mut lineno = 0usize;
    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }
        lineno += 1;
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        if buf.is_empty() {
            continue;
        }
        if buf.len() > max_line_bytes {
            warn!(line = lineno, len = buf.len(), "discarding over-long line");
            continue;
        }
        if std::str::from_utf8(&buf).is_err() {
            warn!(line = lineno, "discarding non-UTF-8 line");
            continue;
        }
        lines.push(buf.clone());
    }
    Ok(lines)
}
