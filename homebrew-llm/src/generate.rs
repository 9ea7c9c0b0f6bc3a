//! Autoregressive sampling from a trained model.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use rand::Rng;

use crate::model::LinearAttention;

pub struct TextGenerator<'a> {
    model: &'a LinearAttention,
    device: &'a Device,
}

impl<'a> TextGenerator<'a> {
    pub fn new(model: &'a LinearAttention, device: &'a Device) -> Self {
        Self { model, device }
    }

    /// Extends `prompt_tokens` by up to `max_new_tokens` tokens.
    ///
    /// Only the last `sequence_length` tokens are fed to the model. A
    /// `temperature` of zero picks the most likely token at every step.
    pub fn generate(
        &self,
        prompt_tokens: &[u32],
        max_new_tokens: usize,
        temperature: f64,
        top_k: Option<usize>,
    ) -> Result<Vec<u32>> {
        self.generate_with_rng(
            prompt_tokens,
            max_new_tokens,
            temperature,
            top_k,
            &mut rand::rng(),
        )
    }

    pub fn generate_with_rng(
        &self,
        prompt_tokens: &[u32],
        max_new_tokens: usize,
        temperature: f64,
        top_k: Option<usize>,
        rng: &mut impl Rng,
    ) -> Result<Vec<u32>> {
        if prompt_tokens.is_empty() {
            anyhow::bail!("generation needs at least one prompt token");
        }
        if temperature < 0.0 || !temperature.is_finite() {
            anyhow::bail!("temperature must be finite and non-negative, got {}", temperature);
        }

        let max_context = self.model.config().sequence_length;
        let mut tokens = prompt_tokens.to_vec();

        for _ in 0..max_new_tokens {
            let context_len = tokens.len().min(max_context);
            let context = &tokens[tokens.len() - context_len..];

            let input = Tensor::new(context, self.device)?
                .unsqueeze(0)?
                .to_dtype(DType::U32)?;

            let logits = self.model.predict(&input)?;
            // [1, seq, vocab] -> [vocab]
            let logits = logits
                .narrow(1, context_len - 1, 1)?
                .squeeze(1)?
                .squeeze(0)?
                .to_dtype(DType::F32)?;

            let next_token = if temperature == 0.0 {
                logits.argmax(0)?.to_scalar::<u32>()?
            } else {
                let logits = if temperature != 1.0 {
                    logits.affine(1.0 / temperature, 0.0)?
                } else {
                    logits
                };
                let logits = match top_k {
                    Some(k) => top_k_filter(&logits, k, self.device)?,
                    None => logits,
                };
                sample_from_logits(&logits, rng)?
            };
            tokens.push(next_token);
        }

        Ok(tokens)
    }
}

/// Keeps the `k` largest logits and masks the rest with negative infinity.
fn top_k_filter(logits: &Tensor, k: usize, device: &Device) -> Result<Tensor> {
    let logits_vec: Vec<f32> = logits.to_vec1()?;
    let mut indexed: Vec<(usize, f32)> = logits_vec.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut masked = vec![f32::NEG_INFINITY; logits_vec.len()];
    for &(i, value) in indexed.iter().take(k.max(1)) {
        masked[i] = value;
    }

    Ok(Tensor::new(masked, device)?)
}

/// Inverse-CDF sampling from the softmax of `logits`.
fn sample_from_logits(logits: &Tensor, rng: &mut impl Rng) -> Result<u32> {
    let probs = candle_nn::ops::softmax_last_dim(logits)?;
    let probs_vec: Vec<f32> = probs.to_vec1()?;

    let cumsum: Vec<f32> = probs_vec
        .iter()
        .scan(0.0, |acc, &x| {
            *acc += x;
            Some(*acc)
        })
        .collect();

    let r: f32 = rng.random();
    // Rounding can leave the total just below r; fall back to the last
    // token with any mass.
    let next_token = cumsum.iter().position(|&p| p > r).unwrap_or_else(|| {
        probs_vec
            .iter()
            .rposition(|&p| p > 0.0)
            .unwrap_or(probs_vec.len().saturating_sub(1))
    });

    Ok(next_token as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use candle_nn::{VarBuilder, VarMap};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn model(var_map: &VarMap) -> LinearAttention {
        let config = ModelConfig {
            vocab_size: 12,
            hidden_features: 4,
            depth: 2,
            sequence_length: 4,
            embedding_std: 1.0,
            kernel_size: 2,
            intermediate_factor: 1,
        };
        let vb = VarBuilder::from_varmap(var_map, DType::F32, &Device::Cpu);
        LinearAttention::new(&config, vb).unwrap()
    }

    #[test]
    fn test_generates_past_context_window() {
        let var_map = VarMap::new();
        let model = model(&var_map);
        let generator = TextGenerator::new(&model, &Device::Cpu);

        let mut rng = StdRng::seed_from_u64(7);
        let tokens = generator
            .generate_with_rng(&[1, 2, 3], 10, 0.8, Some(5), &mut rng)
            .unwrap();
        assert_eq!(tokens.len(), 13);
        assert_eq!(&tokens[..3], &[1, 2, 3]);
        assert!(tokens.iter().all(|&t| t < 12));
    }

    #[test]
    fn test_greedy_is_deterministic() {
        let var_map = VarMap::new();
        let model = model(&var_map);
        let generator = TextGenerator::new(&model, &Device::Cpu);

        let a = generator.generate(&[4, 5], 6, 0.0, None).unwrap();
        let b = generator.generate(&[4, 5], 6, 0.0, Some(3)).unwrap();
        assert_eq!(a, b);

        let input = Tensor::new(&[[4u32, 5]], &Device::Cpu).unwrap();
        let logits = model.predict(&input).unwrap();
        let expected = logits
            .narrow(1, 1, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .argmax(0)
            .unwrap()
            .to_scalar::<u32>()
            .unwrap();
        assert_eq!(a[2], expected);
    }

    #[test]
    fn test_rejects_empty_prompt() {
        let var_map = VarMap::new();
        let model = model(&var_map);
        let generator = TextGenerator::new(&model, &Device::Cpu);
        assert!(generator.generate(&[], 3, 1.0, None).is_err());
        assert!(generator.generate(&[1], 3, -1.0, None).is_err());
    }

    #[test]
    fn test_top_k_masks_all_but_k() {
        let logits = Tensor::new(&[0.1f32, 2.0, -1.0, 1.5], &Device::Cpu).unwrap();
        let filtered: Vec<f32> = top_k_filter(&logits, 2, &Device::Cpu)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(filtered[1], 2.0);
        assert_eq!(filtered[3], 1.5);
        assert!(filtered[0].is_infinite() && filtered[2].is_infinite());
    }

    #[test]
    fn test_sampling_respects_mask() {
        let logits = Tensor::new(&[f32::NEG_INFINITY, 0.0, f32::NEG_INFINITY], &Device::Cpu).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..20 {
            assert_eq!(sample_from_logits(&logits, &mut rng).unwrap(), 1);
        }
    }
}
