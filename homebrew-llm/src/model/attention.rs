use candle_core::{Device, Result, Tensor};
use candle_nn::VarBuilder;
use std::f64::consts::PI;

use super::feed_forward::FeedForward;
use super::norm::activate_norm;
use crate::config::ModelConfig;

/// Fixed sinusoidal position table and the running-mean divisor.
///
/// `embedding` is `[1, hidden, seq]` and `divisor` is `[1, 1, seq]` holding
/// positions `1..=seq`.
#[derive(Clone)]
pub struct Positions {
    embedding: Tensor,
    divisor: Tensor,
}

impl Positions {
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        let hidden = config.hidden_features;
        let seq = config.sequence_length;
        let scale = config.embedding_std / config.depth as f64;
        let offset = (seq as f64 / 2.0 / PI).ln();

        let mut table = Vec::with_capacity(hidden * seq);
        for feature in 1..=hidden {
            let additive = (feature % 2) as f64;
            let exponent = (feature as f64 - additive) / 2.0 * 8.0 / hidden as f64 - offset;
            let frequency = exponent.exp() + additive * PI;
            for position in 1..=seq {
                table.push(((position as f64 * frequency).sin() * scale) as f32);
            }
        }
        let embedding = Tensor::from_vec(table, (1, hidden, seq), device)?;

        let positions: Vec<f32> = (1..=seq).map(|p| p as f32).collect();
        let divisor = Tensor::from_vec(positions, (1, 1, seq), device)?;

        Ok(Self { embedding, divisor })
    }

    /// The table restricted to the first `len` positions.
    pub fn narrow(&self, len: usize) -> Result<Self> {
        Ok(Self {
            embedding: self.embedding.narrow(2, 0, len)?,
            divisor: self.divisor.narrow(2, 0, len)?,
        })
    }

    pub fn len(&self) -> usize {
        self.divisor.dims()[2]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn embedding(&self) -> &Tensor {
        &self.embedding
    }
}

/// `activate_norm(x * (cumsum(depth) / position + point) + shift)`
///
/// The cumulative sum runs over the sequence axis, which makes the first term a
/// causal running mean of `depth`.
pub fn linear_attention(
    x: &Tensor,
    depth: &Tensor,
    point: &Tensor,
    shift: &Tensor,
    divisor: &Tensor,
) -> Result<Tensor> {
    let running_mean = depth.cumsum(2)?.broadcast_div(divisor)?;
    let gate = (running_mean + point)?;
    let out = ((x * gate)? + shift)?;
    activate_norm(&out, 1)
}

pub struct LinearAttentionCell {
    depth: FeedForward,
    point: FeedForward,
    shift: FeedForward,
}

impl LinearAttentionCell {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let build = |name: &str| {
            FeedForward::new(
                config.hidden_features,
                config.kernel_size,
                config.intermediate_factor,
                vb.pp(name),
            )
        };
        Ok(Self {
            depth: build("depth")?,
            point: build("point")?,
            shift: build("shift")?,
        })
    }

    pub fn forward(&self, x: &Tensor, positions: &Positions) -> Result<Tensor> {
        let h = x.broadcast_add(&positions.embedding)?;
        linear_attention(
            x,
            &self.depth.forward(&h)?,
            &self.point.forward(&h)?,
            &self.shift.forward(&h)?,
            &positions.divisor,
        )
    }

    pub fn parameters(&self) -> Vec<&Tensor> {
        [&self.depth, &self.point, &self.shift]
            .into_iter()
            .flat_map(FeedForward::parameters)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_table() {
        let config = ModelConfig {
            hidden_features: 4,
            sequence_length: 6,
            depth: 2,
            embedding_std: 1.0,
            ..Default::default()
        };
        let positions = Positions::new(&config, &Device::Cpu).unwrap();
        assert_eq!(positions.embedding().dims(), &[1, 4, 6]);
        assert_eq!(positions.len(), 6);

        let table: Vec<Vec<f32>> = positions.embedding().squeeze(0).unwrap().to_vec2().unwrap();
        // Feature 2 is even, so its frequency carries no pi offset.
        let offset = (6.0f64 / 2.0 / PI).ln();
        let frequency = ((2.0 - 0.0) / 2.0 * 8.0 / 4.0 - offset).exp();
        let expected = (3.0 * frequency).sin() / 2.0;
        assert!((table[1][2] as f64 - expected).abs() < 1e-5);
        assert!(table.iter().flatten().all(|v| v.abs() <= 0.5 + 1e-6));

        let short = positions.narrow(3).unwrap();
        assert_eq!(short.embedding().dims(), &[1, 4, 3]);
        assert_eq!(short.len(), 3);
    }

    #[test]
    fn test_linear_attention_running_mean() {
        let device = Device::Cpu;
        let x = Tensor::ones((1, 2, 3), candle_core::DType::F32, &device).unwrap();
        let depth = Tensor::new(&[[[3f32, 0.0, 3.0], [0.0, 0.0, 0.0]]], &device).unwrap();
        let zeros = x.zeros_like().unwrap();
        let divisor = Tensor::new(&[[[1f32, 2.0, 3.0]]], &device).unwrap();

        // Gate for channel 0 is [3, 1.5, 2]; channel 1 stays 0.
        let out = linear_attention(&x, &depth, &zeros, &zeros, &divisor).unwrap();
        let out: Vec<Vec<f32>> = out.squeeze(0).unwrap().to_vec2().unwrap();
        for t in 0..3 {
            assert!(out[0][t] > 0.0);
            assert!(out[1][t] < 0.0);
            assert!((out[0][t] + out[1][t]).abs() < 1e-5);
        }
    }
}
