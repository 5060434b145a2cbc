use crate::embeddings::{open_maybe_gz, WordVectors};
use anyhow::{bail, Context};
use candle_core::{DType, Device, Result, Tensor};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::prelude::*;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Positive,
    Negative,
}

impl Label {
    /// One-hot target: `[1, 0]` for positive, `[0, 1]` for negative.
    pub fn target(self) -> [f32; 2] {
        match self {
            Label::Positive => [1., 0.],
            Label::Negative => [0., 1.],
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLabel {
    Flag(bool),
    Int(i64),
}

#[derive(Deserialize)]
struct CommentRecord {
    #[serde(alias = "text", alias = "comment")]
    body: String,
    #[serde(alias = "is_positive", alias = "target")]
    label: RawLabel,
}

impl CommentRecord {
    fn label(&self) -> anyhow::Result<Label> {
        match self.label {
            RawLabel::Flag(true) | RawLabel::Int(1) => Ok(Label::Positive),
            RawLabel::Flag(false) | RawLabel::Int(0) => Ok(Label::Negative),
            RawLabel::Int(other) => bail!("label must be 0 or 1, got {other}"),
        }
    }
}

/// Order in which the sampled positives and negatives are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MixingStrategy {
    /// All positives first, then all negatives.
    Ordered,
    /// Positives and negatives shuffled together.
    Random,
}

pub struct DatasetConfig<'a> {
    pub path: &'a Path,
    pub num_samples: usize,
    pub pos_to_neg_ratio: f64,
    pub mixing_strategy: MixingStrategy,
    pub max_seq_len: Option<usize>,
}

/// Reads a JSON array of records, or one record per line.
fn read_records(path: &Path) -> anyhow::Result<Vec<CommentRecord>> {
    let mut text = String::new();
    open_maybe_gz(path)?.read_to_string(&mut text)?;

    if text.trim_start().starts_with('[') {
        return serde_json::from_str(&text)
            .with_context(|| format!("malformed dataset '{}'", path.display()));
    }
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: malformed record", path.display(), i + 1))
        })
        .collect()
}

struct Sample {
    token_ids: Vec<u32>,
    label: Label,
}

pub struct Batch {
    /// `(batch, seq_len, embedding_size)`
    pub input: Tensor,
    /// `(batch, 2)` one-hot targets
    pub target: Tensor,
}

/// Labeled Reddit comments, held as word ids and embedded on demand.
pub struct RedditComments {
    samples: Vec<Sample>,
}

impl RedditComments {
    pub fn load(
        cfg: &DatasetConfig,
        vectors: &WordVectors,
        rng: &mut StdRng,
    ) -> anyhow::Result<Self> {
        let records = read_records(cfg.path)?;
        tracing::debug!("read {} records from '{}'", records.len(), cfg.path.display());
        Self::from_records(records, cfg, vectors, rng)
    }

    fn from_records(
        records: Vec<CommentRecord>,
        cfg: &DatasetConfig,
        vectors: &WordVectors,
        rng: &mut StdRng,
    ) -> anyhow::Result<Self> {
        let num_pos = (cfg.num_samples as f64 * cfg.pos_to_neg_ratio).round() as usize;
        let num_neg = cfg.num_samples - num_pos;

        let mut positives = Vec::with_capacity(num_pos);
        let mut negatives = Vec::with_capacity(num_neg);
        let mut skipped = 0;
        for record in records {
            if positives.len() == num_pos && negatives.len() == num_neg {
                break;
            }
            let label = record.label()?;
            let bucket = match label {
                Label::Positive if positives.len() < num_pos => &mut positives,
                Label::Negative if negatives.len() < num_neg => &mut negatives,
                _ => continue,
            };
            let mut token_ids = vectors.encode(&record.body)?;
            if token_ids.is_empty() {
                skipped += 1;
                continue;
            }
            if let Some(max_len) = cfg.max_seq_len {
                token_ids.truncate(max_len);
            }
            bucket.push(Sample { token_ids, label });
        }
        if skipped > 0 {
            tracing::warn!("skipped {skipped} comments without any known word");
        }
        if positives.len() < num_pos || negatives.len() < num_neg {
            bail!(
                "dataset too small: wanted {num_pos} positive and {num_neg} negative comments, \
                 found {} and {}",
                positives.len(),
                negatives.len()
            );
        }

        let mut samples = positives;
        samples.append(&mut negatives);
        if cfg.mixing_strategy == MixingStrategy::Random {
            samples.shuffle(rng);
        }
        Ok(Self { samples })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Randomly partitions the samples, `train_fraction` of them (rounded
    /// down) going to the first split.
    pub fn random_split(&self, train_fraction: f64, rng: &mut StdRng) -> (Split<'_>, Split<'_>) {
        let mut indices: Vec<usize> = (0..self.len()).collect();
        indices.shuffle(rng);
        let n_train = (self.len() as f64 * train_fraction) as usize;
        let eval = indices.split_off(n_train);
        (
            Split { dataset: self, indices },
            Split { dataset: self, indices: eval },
        )
    }
}

/// An index view over a `RedditComments` dataset.
pub struct Split<'a> {
    dataset: &'a RedditComments,
    indices: Vec<usize>,
}

impl Split<'_> {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Sequential batches in split order. The last batch may be smaller.
    pub fn batches<'b>(
        &'b self,
        batch_size: usize,
        vectors: &'b WordVectors,
        device: &'b Device,
    ) -> impl Iterator<Item = Result<Batch>> + 'b {
        self.indices
            .chunks(batch_size)
            .map(move |chunk| self.collate(chunk, vectors, device))
    }

    /// Embeds the chunk and right-pads every sequence with zero vectors to
    /// the longest one.
    fn collate(&self, chunk: &[usize], vectors: &WordVectors, device: &Device) -> Result<Batch> {
        let samples: Vec<&Sample> = chunk.iter().map(|&i| &self.dataset.samples[i]).collect();
        let max_len = samples.iter().map(|s| s.token_ids.len()).max().unwrap_or(0);

        let mut inputs = Vec::with_capacity(samples.len());
        let mut targets = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            let mut seq = vectors.lookup(&sample.token_ids)?;
            let pad = max_len - sample.token_ids.len();
            if pad > 0 {
                let zeros = Tensor::zeros((pad, vectors.dim()), DType::F32, seq.device())?;
                seq = Tensor::cat(&[&seq, &zeros], 0)?;
            }
            inputs.push(seq);
            targets.extend(sample.label.target());
        }
        let input = Tensor::stack(&inputs, 0)?.to_device(device)?;
        let target = Tensor::from_vec(targets, (chunk.len(), 2), device)?;
        Ok(Batch { input, target })
    }
}
