mod data;
mod embeddings;
mod metrics;
mod model;
mod train;

use crate::data::MixingStrategy;
use crate::train::{training_loop, TrainConfig};
use clap::Parser;
use std::path::PathBuf;

/// Trains a GRU binary classifier on labeled Reddit comments.
#[derive(Parser, Debug)]
#[command(name = "gru-bin-classifier", version)]
struct Cli {
    /// Experiment name; prefixes the saved weights and names the log directory.
    #[arg(short, long, default_value = "default")]
    name: String,

    /// Labeled comments, JSON array or JSON lines, optionally gzipped.
    #[arg(long)]
    dataset: Option<PathBuf>,

    /// GloVe-style vectors file (optionally gzipped) or `hf://<repo>`.
    #[arg(long)]
    embeddings: Option<String>,

    /// Match words against the vectors case-sensitively.
    #[arg(long)]
    keep_case: bool,

    #[arg(long)]
    dataset_size: Option<usize>,

    /// Share of positive comments in the sampled dataset.
    #[arg(long)]
    pos_to_neg_ratio: Option<f64>,

    #[arg(long, value_enum)]
    mixing_strategy: Option<MixingStrategy>,

    /// Truncate comments to this many words.
    #[arg(long)]
    max_seq_len: Option<usize>,

    #[arg(long)]
    train_fraction: Option<f64>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    #[arg(long)]
    hidden_size: Option<usize>,

    #[arg(long)]
    num_hidden_layers: Option<usize>,

    /// Evaluate, log and checkpoint every this many epochs.
    #[arg(long)]
    eval_every: Option<usize>,

    /// Report running training loss every this many batches (debug level).
    #[arg(long)]
    log_every: Option<usize>,

    #[arg(long)]
    models_dir: Option<PathBuf>,

    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,

    /// Start from the saved weights of this experiment, if any.
    #[arg(long)]
    resume: bool,

    /// Train on the CPU even when CUDA is available.
    #[arg(long)]
    cpu: bool,
}

impl Cli {
    fn into_config(self) -> TrainConfig {
        let mut cfg = TrainConfig {
            name: self.name,
            lowercase: !self.keep_case,
            max_seq_len: self.max_seq_len,
            seed: self.seed,
            resume: self.resume,
            cpu: self.cpu,
            ..TrainConfig::default()
        };
        if let Some(v) = self.dataset {
            cfg.dataset_path = v;
        }
        if let Some(v) = self.embeddings {
            cfg.embeddings = v;
        }
        if let Some(v) = self.dataset_size {
            cfg.dataset_size = v;
        }
        if let Some(v) = self.pos_to_neg_ratio {
            cfg.pos_to_neg_ratio = v;
        }
        if let Some(v) = self.mixing_strategy {
            cfg.mixing_strategy = v;
        }
        if let Some(v) = self.train_fraction {
            cfg.train_fraction = v;
        }
        if let Some(v) = self.batch_size {
            cfg.batch_size = v;
        }
        if let Some(v) = self.epochs {
            cfg.epochs = v;
        }
        if let Some(v) = self.learning_rate {
            cfg.learning_rate = v;
        }
        if let Some(v) = self.hidden_size {
            cfg.model.hidden_size = v;
        }
        if let Some(v) = self.num_hidden_layers {
            cfg.model.num_hidden_layers = v;
        }
        if let Some(v) = self.eval_every {
            cfg.eval_every = v;
        }
        if let Some(v) = self.log_every {
            cfg.log_every = v;
        }
        if let Some(v) = self.models_dir {
            cfg.models_dir = v;
        }
        if let Some(v) = self.log_dir {
            cfg.log_dir = v;
        }
        cfg
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("gru_bin_classifier=info")),
        )
        .init();

    let train_cfg = Cli::parse().into_config();
    training_loop(&train_cfg)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_run() {
        let cfg = Cli::parse_from(["gru-bin-classifier"]).into_config();
        assert_eq!(cfg.name, "default");
        assert_eq!(cfg.dataset_size, 2000);
        assert_eq!(cfg.batch_size, 1);
        assert_eq!(cfg.epochs, 20);
        assert_eq!(cfg.model.hidden_size, 150);
        assert_eq!(cfg.mixing_strategy, MixingStrategy::Ordered);
        assert_eq!(cfg.model_path(), PathBuf::from("./models/default_model.safetensors"));
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = Cli::parse_from([
            "gru-bin-classifier",
            "-n",
            "expt1",
            "--mixing-strategy",
            "random",
            "--hidden-size",
            "32",
            "--keep-case",
        ])
        .into_config();
        assert_eq!(cfg.name, "expt1");
        assert_eq!(cfg.mixing_strategy, MixingStrategy::Random);
        assert_eq!(cfg.model.hidden_size, 32);
        assert!(!cfg.lowercase);
        assert_eq!(cfg.run_log_dir(), PathBuf::from("./log/expt1"));
    }
}
