//! Reversible linear-attention language model.
//!
//! Token ids are embedded into `2 * hidden_features` channels, pushed through a
//! [`ReversibleSequential`] stack of [`LinearAttentionCell`]s laid out as
//! `[batch, channels, seq]`, and projected back to the vocabulary by a
//! per-position output head. Every component is causal, so logits at position
//! `t` only depend on tokens `..=t`.

pub mod attention;
pub mod feed_forward;
pub mod norm;
pub mod reversible;

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{Device, Module, Tensor, Var};
use candle_nn::{Init, Linear, VarBuilder, linear};

use crate::config::ModelConfig;
use crate::optim::grads;

pub use attention::{LinearAttentionCell, Positions, linear_attention};
pub use feed_forward::{FeedForward, causal_conv};
pub use norm::activate_norm;
pub use reversible::ReversibleSequential;

pub struct LinearAttention {
    embedding: Tensor,
    stem: ReversibleSequential,
    output: Linear,
    positions: Positions,
    config: ModelConfig,
}

impl LinearAttention {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let embedding = vb.get_with_hints(
            (config.vocab_size, config.stem_features()),
            "embedding",
            Init::Randn {
                mean: 0.0,
                stdev: config.embedding_std,
            },
        )?;
        let mut cells = Vec::with_capacity(config.depth);
        for i in 0..config.depth {
            cells.push(LinearAttentionCell::new(
                config,
                vb.pp(format!("stem.{}", i)),
            )?);
        }
        let output = linear(config.stem_features(), config.vocab_size, vb.pp("output"))?;
        let positions = Positions::new(config, vb.device())?;
        Ok(Self {
            embedding,
            stem: ReversibleSequential::new(cells),
            output,
            positions,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        self.embedding.device()
    }

    pub fn num_parameters(&self) -> usize {
        self.config.num_parameters()
    }

    fn check_input(&self, input_ids: &Tensor) -> Result<(usize, usize)> {
        let (batch, len) = input_ids
            .dims2()
            .context("input ids must be [batch, seq]")?;
        if len == 0 || len > self.config.sequence_length {
            anyhow::bail!(
                "sequence length {} outside 1..={}",
                len,
                self.config.sequence_length
            );
        }
        Ok((batch, len))
    }

    /// `[batch, seq]` ids to `[batch, 2 * hidden, seq]` stem input.
    fn embed(&self, input_ids: &Tensor, batch: usize, len: usize) -> Result<Tensor> {
        let rows = self.embedding.index_select(&input_ids.flatten_all()?, 0)?;
        let embedded = rows
            .reshape((batch, len, self.config.stem_features()))?
            .transpose(1, 2)?
            .contiguous()?;
        Ok(embedded)
    }

    /// `[batch, 2 * hidden, seq]` stem output to `[batch, seq, vocab]` logits.
    fn logits(&self, hidden: &Tensor) -> Result<Tensor> {
        let hidden = hidden.transpose(1, 2)?.contiguous()?;
        Ok(self.output.forward(&hidden)?)
    }

    /// Full forward pass with the autograd graph intact.
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (batch, len) = self.check_input(input_ids)?;
        let positions = self.positions.narrow(len)?;
        let embedded = self.embed(input_ids, batch, len)?;
        let hidden = self.stem.forward(&embedded, &positions)?;
        self.logits(&hidden)
    }

    /// Forward pass that drops the stem graph as it goes; used for evaluation
    /// and sampling.
    pub fn predict(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (batch, len) = self.check_input(input_ids)?;
        let positions = self.positions.narrow(len)?;
        let embedded = self.embed(input_ids, batch, len)?;
        let hidden = self.stem.forward_detached(&embedded, &positions)?;
        Ok(self.logits(&hidden)?.detach())
    }

    pub fn loss(&self, input_ids: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let logits = self.forward(input_ids)?;
        cross_entropy_loss(&logits, targets)
    }

    /// Memory-efficient loss and gradients.
    ///
    /// Only the stem output is kept; the reversible stem rebuilds each cell's
    /// input while backpropagating. The returned store holds gradients for
    /// every trainable tensor of the model.
    pub fn backward(&self, input_ids: &Tensor, targets: &Tensor) -> Result<(f32, GradStore)> {
        let (batch, len) = self.check_input(input_ids)?;
        let positions = self.positions.narrow(len)?;

        let embedded = self.embed(input_ids, batch, len)?;
        let hidden = self.stem.forward_detached(&embedded, &positions)?;
        let hidden = Var::from_tensor(&hidden)?;

        let loss = cross_entropy_loss(&self.logits(hidden.as_tensor())?, targets)?;
        let mut store = loss.backward()?;
        let grad_hidden = store
            .remove(hidden.as_tensor())
            .context("stem output received no gradient")?;

        let grad_embedded =
            self.stem
                .backward(hidden.as_tensor(), &grad_hidden, &positions, &mut store)?;

        let local = (&embedded * &grad_embedded)?.sum_all()?.backward()?;
        grads::accumulate(&mut store, &local, &[&self.embedding])?;

        Ok((loss.to_scalar::<f32>()?, store))
    }
}

pub fn cross_entropy_loss(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let (batch_size, seq_len, vocab_size) = logits.dims3()?;
    let logits = logits.reshape((batch_size * seq_len, vocab_size))?;
    let targets = targets.reshape((batch_size * seq_len,))?;
    Ok(candle_nn::loss::cross_entropy(&logits, &targets)?)
}
