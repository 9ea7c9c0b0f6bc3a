//! YAML run configuration.
//!
//! A run is described by one file with four sections. Every field has a
//! default, so a config only needs to spell out what it changes:
//!
//! ```yaml
//! model:
//!   hidden_features: 64
//!   depth: 8
//!   sequence_length: 256
//! optimizer:
//!   kind: shampoo
//!   learning_rate: 0.001
//! training:
//!   batch_size: 16
//! data:
//!   train_path: data/train.jsonl.zst
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub optimizer: OptimizerConfig,
    pub training: TrainingConfig,
    pub data: DataConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Number of input cases (embedding rows); also the output vocabulary
    pub vocab_size: usize,
    /// Features per stream; the stem carries two streams
    pub hidden_features: usize,
    /// Number of reversible linear-attention cells
    pub depth: usize,
    /// Maximum context length
    pub sequence_length: usize,
    /// Standard deviation of the embedding init and positional table scale
    pub embedding_std: f64,
    /// Width of the causal convolutions
    pub kernel_size: usize,
    /// Expansion of the feed-forward intermediate channels
    pub intermediate_factor: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 256,
            hidden_features: 64,
            depth: 8,
            sequence_length: 256,
            embedding_std: 1.0,
            kernel_size: 7,
            intermediate_factor: 1,
        }
    }
}

impl ModelConfig {
    pub fn stem_features(&self) -> usize {
        self.hidden_features * 2
    }

    pub fn num_parameters(&self) -> usize {
        let h = self.hidden_features;
        let inter = h * self.intermediate_factor;
        let feed_forward = 2 * h * inter * self.kernel_size;
        let cell = 3 * feed_forward;
        let embedding = self.vocab_size * self.stem_features();
        let head = self.stem_features() * self.vocab_size + self.vocab_size;
        embedding + self.depth * cell + head
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    AdamW,
    Sgd,
    Shampoo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub learning_rate: f64,
    /// Adam beta1
    pub beta1: f64,
    /// Adam beta2
    pub beta2: f64,
    pub weight_decay: f64,
    pub eps: f64,
    /// Take every step from a look-ahead gradient
    pub extragradient: bool,
    pub shampoo: ShampooConfig,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::AdamW,
            learning_rate: 3e-4,
            beta1: 0.9,
            beta2: 0.95,
            weight_decay: 0.0,
            eps: 1e-8,
            extragradient: false,
            shampoo: ShampooConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShampooConfig {
    pub momentum: f64,
    /// Decay of the Kronecker statistics; 1.0 accumulates like AdaGrad
    pub statistics_decay: f64,
    /// Ridge added to the statistics before taking the inverse root
    pub epsilon: f64,
    /// Recompute inverse roots every N steps
    pub preconditioning_interval: usize,
    /// Sides larger than this are left unpreconditioned
    pub max_preconditioner_dim: usize,
    pub root_iterations: usize,
    pub root_tolerance: f64,
    /// Rescale each update to the norm of its raw gradient
    pub graft: bool,
}

impl Default for ShampooConfig {
    fn default() -> Self {
        Self {
            momentum: 0.9,
            statistics_decay: 1.0,
            epsilon: 1e-4,
            preconditioning_interval: 10,
            max_preconditioner_dim: 1024,
            root_iterations: 100,
            root_tolerance: 1e-6,
            graft: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub epochs: usize,
    /// Stop after this many optimizer steps even if epochs remain
    pub max_steps: Option<usize>,
    pub gradient_accumulation_steps: usize,
    /// Global gradient norm limit; 0 disables clipping
    pub grad_clip: f64,
    pub warmup_steps: usize,
    pub min_learning_rate: f64,
    pub log_every: usize,
    /// Save a step checkpoint every N steps; 0 saves only at epoch ends
    pub save_every: usize,
    /// Evaluate every N steps; 0 evaluates only at epoch ends
    pub eval_every: usize,
    pub output_dir: PathBuf,
    pub resume_from: Option<PathBuf>,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            epochs: 1,
            max_steps: None,
            gradient_accumulation_steps: 1,
            grad_clip: 1.0,
            warmup_steps: 100,
            min_learning_rate: 0.0,
            log_every: 10,
            save_every: 0,
            eval_every: 0,
            output_dir: PathBuf::from("checkpoints"),
            resume_from: None,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    /// One JSON object per line
    Jsonl,
    /// The whole file is a single document
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub train_path: Option<PathBuf>,
    pub eval_path: Option<PathBuf>,
    pub format: DataFormat,
    /// JSONL field holding the document text
    pub text_field: String,
    /// HF tokenizer file; byte-level tokens are used when absent
    pub tokenizer: Option<PathBuf>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_path: None,
            eval_path: None,
            format: DataFormat::Jsonl,
            text_field: "text".to_string(),
            tokenizer: None,
        }
    }
}

impl Config {
    /// Byte-level model that trains in seconds on a CPU
    pub fn tiny() -> Self {
        Self {
            model: ModelConfig {
                vocab_size: 256,
                hidden_features: 16,
                depth: 2,
                sequence_length: 32,
                embedding_std: 1.0,
                kernel_size: 3,
                intermediate_factor: 1,
            },
            training: TrainingConfig {
                batch_size: 8,
                warmup_steps: 10,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn small() -> Self {
        Self {
            model: ModelConfig {
                vocab_size: 256,
                hidden_features: 256,
                depth: 16,
                sequence_length: 1024,
                embedding_std: 1.0,
                kernel_size: 7,
                intermediate_factor: 2,
            },
            optimizer: OptimizerConfig {
                kind: OptimizerKind::Shampoo,
                learning_rate: 1e-3,
                ..Default::default()
            },
            training: TrainingConfig {
                batch_size: 32,
                warmup_steps: 1000,
                log_every: 10,
                save_every: 1000,
                eval_every: 500,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "tiny" => Some(Self::tiny()),
            "small" => Some(Self::small()),
            _ => None,
        }
    }

    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.model;
        if m.vocab_size == 0 {
            return Err(invalid("model.vocab_size", "must be positive"));
        }
        if m.hidden_features == 0 {
            return Err(invalid("model.hidden_features", "must be positive"));
        }
        if m.depth == 0 {
            return Err(invalid("model.depth", "must be positive"));
        }
        if m.sequence_length < 2 {
            return Err(invalid("model.sequence_length", "must be at least 2"));
        }
        if m.kernel_size == 0 {
            return Err(invalid("model.kernel_size", "must be positive"));
        }
        if m.intermediate_factor == 0 {
            return Err(invalid("model.intermediate_factor", "must be positive"));
        }
        if !(m.embedding_std > 0.0) {
            return Err(invalid("model.embedding_std", "must be positive"));
        }

        let o = &self.optimizer;
        if !(o.learning_rate > 0.0) {
            return Err(invalid("optimizer.learning_rate", "must be positive"));
        }
        if o.shampoo.preconditioning_interval == 0 {
            return Err(invalid(
                "optimizer.shampoo.preconditioning_interval",
                "must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&o.shampoo.statistics_decay) {
            return Err(invalid(
                "optimizer.shampoo.statistics_decay",
                format!("{} is outside [0, 1]", o.shampoo.statistics_decay),
            ));
        }

        if !(o.shampoo.epsilon >= 0.0) {
            return Err(invalid(
                "optimizer.shampoo.epsilon",
                format!("{} is negative", o.shampoo.epsilon),
            ));
        }
        if o.shampoo.root_iterations == 0 {
            return Err(invalid("optimizer.shampoo.root_iterations", "must be positive"));
        }
        if !(0.0..1.0).contains(&o.shampoo.momentum) {
            return Err(invalid(
                "optimizer.shampoo.momentum",
                format!("{} is outside [0, 1)", o.shampoo.momentum),
            ));
        }

        let t = &self.training;
        if t.batch_size == 0 {
            return Err(invalid("training.batch_size", "must be positive"));
        }
        if t.gradient_accumulation_steps == 0 {
            return Err(invalid(
                "training.gradient_accumulation_steps",
                "must be positive",
            ));
        }
        if t.min_learning_rate > o.learning_rate {
            return Err(invalid(
                "training.min_learning_rate",
                "exceeds optimizer.learning_rate",
            ));
        }
        Ok(())
    }
}
