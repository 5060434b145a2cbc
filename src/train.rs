use crate::data::{DatasetConfig, MixingStrategy, RedditComments, Split};
use crate::embeddings::WordVectors;
use crate::metrics::ScalarWriter;
use crate::model::{num_trainable_params, BinaryClassifier, ClassifierConfig};
use anyhow::{ensure, Context};
use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub name: String,
    pub dataset_path: PathBuf,
    pub embeddings: String,
    pub lowercase: bool,
    pub dataset_size: usize,
    pub pos_to_neg_ratio: f64,
    pub mixing_strategy: MixingStrategy,
    pub max_seq_len: Option<usize>,
    pub train_fraction: f64,
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub model: ClassifierConfig,
    pub eval_every: usize,
    pub log_every: usize,
    pub models_dir: PathBuf,
    pub log_dir: PathBuf,
    pub seed: Option<u64>,
    pub resume: bool,
    pub cpu: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            dataset_path: "./data/anon_auth_dataset.json".into(),
            embeddings: "./data/glove.6B.300d.txt".to_string(),
            lowercase: true,
            dataset_size: 2000,
            pos_to_neg_ratio: 0.50,
            mixing_strategy: MixingStrategy::Ordered,
            max_seq_len: None,
            train_fraction: 0.8,
            batch_size: 1,
            epochs: 20,
            learning_rate: 0.001,
            model: ClassifierConfig::default(),
            eval_every: 1,
            log_every: 200,
            models_dir: "./models".into(),
            log_dir: "./log".into(),
            seed: None,
            resume: false,
            cpu: false,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.dataset_size > 0, "dataset size must be positive");
        ensure!(
            (0.0..=1.0).contains(&self.pos_to_neg_ratio),
            "positive ratio must lie in [0, 1], got {}",
            self.pos_to_neg_ratio
        );
        ensure!(
            self.train_fraction > 0.0 && self.train_fraction < 1.0,
            "train fraction must lie in (0, 1), got {}",
            self.train_fraction
        );
        ensure!(self.batch_size > 0, "batch size must be positive");
        ensure!(self.epochs > 0, "epochs must be positive");
        ensure!(self.model.hidden_size > 0, "hidden size must be positive");
        ensure!(self.model.num_hidden_layers > 0, "need at least one hidden layer");
        ensure!(self.eval_every > 0, "eval interval must be positive");
        ensure!(self.log_every > 0, "log interval must be positive");
        ensure!(self.max_seq_len != Some(0), "max sequence length must be positive");
        Ok(())
    }

    pub fn model_path(&self) -> PathBuf {
        self.models_dir.join(format!("{}_model.safetensors", self.name))
    }

    pub fn run_log_dir(&self) -> PathBuf {
        self.log_dir.join(&self.name)
    }
}

/// Mean binary cross-entropy with the log terms clamped at -100.
fn binary_cross_entropy(probs: &Tensor, target: &Tensor) -> Result<Tensor> {
    let log_p = probs.log()?.clamp(-100., 0.)?;
    let log_not_p = probs.affine(-1., 1.)?.log()?.clamp(-100., 0.)?;
    let pos = target.mul(&log_p)?;
    let neg = target.affine(-1., 1.)?.mul(&log_not_p)?;
    pos.add(&neg)?.mean_all()?.neg()
}

/// Number of rows whose predicted class matches the target class.
fn num_correct(probs: &Tensor, target: &Tensor) -> Result<usize> {
    let hits = probs
        .argmax(D::Minus1)?
        .eq(&target.argmax(D::Minus1)?)?
        .to_dtype(DType::U32)?
        .sum_all()?
        .to_scalar::<u32>()?;
    Ok(hits as usize)
}

/// Keeps the carried state when the batch size is unchanged, otherwise
/// starts over from zeros.
fn hidden_for(
    model: &BinaryClassifier,
    hidden: &[Tensor],
    batch: usize,
    dev: &Device,
) -> Result<Vec<Tensor>> {
    if hidden[0].dim(0)? == batch {
        Ok(hidden.to_vec())
    } else {
        model.init_hidden(batch, dev)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EpochStats {
    pub loss: f64,
    pub accuracy: f64,
}

fn evaluate(
    model: &BinaryClassifier,
    split: &Split,
    cfg: &TrainConfig,
    vectors: &WordVectors,
    hidden: &[Tensor],
    dev: &Device,
) -> Result<EpochStats> {
    let mut loss_sum = 0f64;
    let mut correct = 0;
    let mut batches = 0;
    for batch in split.batches(cfg.batch_size, vectors, dev) {
        let batch = batch?;
        let h0 = hidden_for(model, hidden, batch.input.dim(0)?, dev)?;
        let (probs, _) = model.forward(&batch.input, &h0)?;
        loss_sum += binary_cross_entropy(&probs, &batch.target)?.to_scalar::<f32>()? as f64;
        correct += num_correct(&probs, &batch.target)?;
        batches += 1;
    }
    Ok(EpochStats {
        loss: loss_sum / batches.max(1) as f64,
        accuracy: correct as f64 / split.len().max(1) as f64,
    })
}

/// Builds the classifier, restoring the saved weights when resuming.
fn build_model(
    cfg: &TrainConfig,
    embedding_size: usize,
    dev: &Device,
) -> anyhow::Result<(BinaryClassifier, VarMap)> {
    let model_cfg = ClassifierConfig {
        embedding_size,
        ..cfg.model.clone()
    };
    let mut varmap = VarMap::new();
    let vs = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    let model = BinaryClassifier::new(&model_cfg, vs)?;

    let model_path = cfg.model_path();
    if cfg.resume && model_path.exists() {
        varmap
            .load(&model_path)
            .with_context(|| format!("cannot resume from '{}'", model_path.display()))?;
        tracing::info!("Resumed weights from '{}'", model_path.display());
    }
    Ok((model, varmap))
}

pub fn training_loop(cfg: &TrainConfig) -> anyhow::Result<()> {
    cfg.validate()?;
    let dev = if cfg.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };
    tracing::info!("Running {} on {:?}", cfg.name, dev);

    let run_log_dir = cfg.run_log_dir();
    fs::create_dir_all(&run_log_dir)
        .with_context(|| format!("cannot create '{}'", run_log_dir.display()))?;
    fs::write(run_log_dir.join("config.json"), serde_json::to_string_pretty(cfg)?)
        .context("cannot write config.json")?;

    let mut rng = match cfg.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let vectors = WordVectors::load(&cfg.embeddings, cfg.lowercase)?;
    tracing::info!("{} word vectors of size {}", vectors.len(), vectors.dim());

    let dataset = RedditComments::load(
        &DatasetConfig {
            path: &cfg.dataset_path,
            num_samples: cfg.dataset_size,
            pos_to_neg_ratio: cfg.pos_to_neg_ratio,
            mixing_strategy: cfg.mixing_strategy,
            max_seq_len: cfg.max_seq_len,
        },
        &vectors,
        &mut rng,
    )?;
    let (train, eval) = dataset.random_split(cfg.train_fraction, &mut rng);
    ensure!(train.len() > 0, "training split is empty");
    ensure!(eval.len() > 0, "evaluation split is empty");

    let (model, varmap) = build_model(cfg, vectors.dim(), &dev)?;
    let model_path = cfg.model_path();

    tracing::info!(
        "dataset size: {}/{}, #trainable_params: {}",
        train.len(),
        eval.len(),
        num_trainable_params(&varmap)
    );

    let params = ParamsAdamW {
        lr: cfg.learning_rate,
        weight_decay: 0.0,
        ..Default::default()
    };
    let mut optim = AdamW::new(varmap.all_vars(), params)?;
    let mut scalars = ScalarWriter::new(&run_log_dir)?;
    tracing::info!("Writing scalars to '{}'", scalars.path().display());
    fs::create_dir_all(&cfg.models_dir)
        .with_context(|| format!("cannot create '{}'", cfg.models_dir.display()))?;

    let mut hidden = model.init_hidden(cfg.batch_size, &dev)?;
    for e in 1..=cfg.epochs {
        tracing::info!("Training Epoch#{e}");
        let mut loss_sum = 0f64;
        let mut correct = 0;
        let mut batches = 0;

        for batch in train.batches(cfg.batch_size, &vectors, &dev) {
            let batch = batch?;
            let h0 = hidden_for(&model, &hidden, batch.input.dim(0)?, &dev)?;
            let (probs, next_hidden) = model.forward(&batch.input, &h0)?;
            hidden = next_hidden;

            let loss = binary_cross_entropy(&probs, &batch.target)?;
            correct += num_correct(&probs, &batch.target)?;
            loss_sum += loss.to_scalar::<f32>()? as f64;
            optim.backward_step(&loss)?;

            batches += 1;
            if batches % cfg.log_every == 0 {
                tracing::debug!(
                    "epoch {e} batch {batches}: mean loss {:.4}",
                    loss_sum / batches as f64
                );
            }
        }

        if e % cfg.eval_every == 0 {
            let train_stats = EpochStats {
                loss: loss_sum / batches.max(1) as f64,
                accuracy: correct as f64 / train.len().max(1) as f64,
            };
            let test_stats = evaluate(&model, &eval, cfg, &vectors, &hidden, &dev)?;

            scalars.add_scalars(
                "classifier/loss",
                &[("test", test_stats.loss), ("train", train_stats.loss)],
                e,
            )?;
            scalars.add_scalars(
                "classifier/accuracy",
                &[("test", test_stats.accuracy), ("train", train_stats.accuracy)],
                e,
            )?;
            tracing::info!(
                "epoch {e}: train loss {:.4} acc {:.3} | test loss {:.4} acc {:.3}",
                train_stats.loss,
                train_stats.accuracy,
                test_stats.loss,
                test_stats.accuracy
            );

            varmap
                .save(&model_path)
                .with_context(|| format!("cannot save weights to '{}'", model_path.display()))?;
            tracing::debug!("saved weights to '{}'", model_path.display());
        }
    }

    Ok(())
}
