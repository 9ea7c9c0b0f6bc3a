//! Reversible linear-attention language models trained with candle.

pub mod config;
pub mod data;
pub mod generate;
pub mod io;
pub mod model;
pub mod optim;
pub mod tokenizer;
pub mod training;

pub use config::{Config, ConfigError};
pub use generate::TextGenerator;
pub use model::LinearAttention;
pub use optim::ModelOptimizer;
pub use tokenizer::Tokenizer;
pub use training::{StepStats, Trainer, lr_schedule};
