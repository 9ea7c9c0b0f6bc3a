pub mod grads;
pub mod root;
pub mod shampoo;

use anyhow::Result;
use candle_core::Var;
use candle_core::backprop::GradStore;
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW, SGD};

use crate::config::{OptimizerConfig, OptimizerKind};

pub use grads::clip_grad_norm;
pub use root::inverse_pth_root;
pub use shampoo::{ParamsShampoo, Shampoo};

/// The optimizer selected by `optimizer.kind`.
pub enum ModelOptimizer {
    AdamW(AdamW),
    Sgd(SGD),
    Shampoo(Box<Shampoo>),
}

impl ModelOptimizer {
    pub fn new(vars: Vec<Var>, config: &OptimizerConfig) -> Result<Self> {
        let optimizer = match config.kind {
            OptimizerKind::AdamW => {
                let params = ParamsAdamW {
                    lr: config.learning_rate,
                    beta1: config.beta1,
                    beta2: config.beta2,
                    weight_decay: config.weight_decay,
                    eps: config.eps,
                };
                Self::AdamW(AdamW::new(vars, params)?)
            }
            OptimizerKind::Sgd => Self::Sgd(SGD::new(vars, config.learning_rate)?),
            OptimizerKind::Shampoo => {
                let params = ParamsShampoo {
                    lr: config.learning_rate,
                    weight_decay: config.weight_decay,
                    shampoo: config.shampoo.clone(),
                };
                Self::Shampoo(Box::new(Shampoo::new(vars, params)?))
            }
        };
        Ok(optimizer)
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            Self::AdamW(opt) => opt.step(grads)?,
            Self::Sgd(opt) => opt.step(grads)?,
            Self::Shampoo(opt) => opt.step(grads)?,
        }
        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::AdamW(opt) => opt.learning_rate(),
            Self::Sgd(opt) => opt.learning_rate(),
            Self::Shampoo(opt) => opt.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::AdamW(opt) => opt.set_learning_rate(lr),
            Self::Sgd(opt) => opt.set_learning_rate(lr),
            Self::Shampoo(opt) => opt.set_learning_rate(lr),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AdamW(_) => "adamw",
            Self::Sgd(_) => "sgd",
            Self::Shampoo(_) => "shampoo",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_builds_every_kind() {
        for kind in [
            OptimizerKind::AdamW,
            OptimizerKind::Sgd,
            OptimizerKind::Shampoo,
        ] {
            let var = Var::ones((2, 2), DType::F32, &Device::Cpu).unwrap();
            let config = OptimizerConfig {
                kind,
                learning_rate: 0.01,
                ..Default::default()
            };
            let mut opt = ModelOptimizer::new(vec![var.clone()], &config).unwrap();
            assert_eq!(opt.learning_rate(), 0.01);
            opt.set_learning_rate(0.02);
            assert_eq!(opt.learning_rate(), 0.02);

            let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
            let grads = loss.backward().unwrap();
            opt.step(&grads).unwrap();
            let after: f32 = var.as_tensor().sum_all().unwrap().to_scalar().unwrap();
            assert!(after < 4.0, "{} did not descend", opt.name());
        }
    }
}
