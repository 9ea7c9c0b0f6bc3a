//! Shampoo: Kronecker-factored preconditioning.
//!
//! Every parameter is viewed as a matrix `G` of shape `[d0, d1 * d2 * ...]`.
//! Left and right statistics `L = sum G Gᵀ` and `R = sum Gᵀ G` are kept for
//! every side no larger than `max_preconditioner_dim`, and the update is
//! `L^(-1/p) G R^(-1/p)` with `p = 2 * preconditioned sides`. Parameters with
//! no preconditioned side (biases, huge embeddings) fall back to diagonal
//! AdaGrad.

use candle_core::backprop::GradStore;
use candle_core::{DType, Result, Tensor, Var};
use candle_nn::optim::Optimizer;

use super::root::inverse_pth_root;
use crate::config::ShampooConfig;

#[derive(Debug, Clone)]
pub struct ParamsShampoo {
    pub lr: f64,
    pub weight_decay: f64,
    pub shampoo: ShampooConfig,
}

impl Default for ParamsShampoo {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            weight_decay: 0.0,
            shampoo: ShampooConfig::default(),
        }
    }
}

struct Side {
    statistics: Tensor,
    root: Option<Tensor>,
}

impl Side {
    fn new(dim: usize, var: &Var) -> Result<Self> {
        Ok(Self {
            statistics: Tensor::zeros((dim, dim), DType::F32, var.device())?,
            root: None,
        })
    }
}

struct ShampooVar {
    var: Var,
    rows: usize,
    cols: usize,
    left: Option<Side>,
    right: Option<Side>,
    diagonal: Option<Tensor>,
    momentum: Tensor,
}

impl ShampooVar {
    fn new(var: Var, max_dim: usize) -> Result<Self> {
        let dims = var.dims().to_vec();
        let (rows, cols) = match dims.as_slice() {
            [] => (1, 1),
            [n] => (1, *n),
            [first, rest @ ..] => (*first, rest.iter().product()),
        };
        let matrix = dims.len() >= 2;
        let left = if matrix && rows <= max_dim {
            Some(Side::new(rows, &var)?)
        } else {
            None
        };
        let right = if matrix && cols <= max_dim {
            Some(Side::new(cols, &var)?)
        } else {
            None
        };
        let diagonal = if left.is_none() && right.is_none() {
            Some(var.zeros_like()?.to_dtype(DType::F32)?)
        } else {
            None
        };
        let momentum = var.zeros_like()?.to_dtype(DType::F32)?;
        Ok(Self {
            var,
            rows,
            cols,
            left,
            right,
            diagonal,
            momentum,
        })
    }

    fn root_order(&self) -> usize {
        2 * (self.left.is_some() as usize + self.right.is_some() as usize)
    }
}

pub struct Shampoo {
    vars: Vec<ShampooVar>,
    params: ParamsShampoo,
    step_t: usize,
}

impl Shampoo {
    pub fn params(&self) -> &ParamsShampoo {
        &self.params
    }

    /// Number of parameters that received at least one Kronecker factor.
    pub fn num_preconditioned(&self) -> usize {
        self.vars
            .iter()
            .filter(|v| v.left.is_some() || v.right.is_some())
            .count()
    }
}

fn precondition(
    state: &mut ShampooVar,
    grad: &Tensor,
    refresh: bool,
    cfg: &ShampooConfig,
) -> Result<Tensor> {
    if let Some(acc) = state.diagonal.as_mut() {
        let updated = (acc.affine(cfg.statistics_decay, 0.0)? + grad.sqr()?)?;
        let update = grad.broadcast_div(&(updated.sqrt()? + cfg.epsilon)?)?;
        *acc = updated;
        return Ok(update);
    }

    let g = grad.reshape((state.rows, state.cols))?;
    let order = state.root_order();

    if let Some(side) = state.left.as_mut() {
        side.statistics = (side.statistics.affine(cfg.statistics_decay, 0.0)?
            + g.matmul(&g.t()?)?)?;
        if refresh || side.root.is_none() {
            side.root = Some(inverse_pth_root(
                &side.statistics,
                order,
                cfg.epsilon,
                cfg.root_iterations,
                cfg.root_tolerance,
            )?);
        }
    }
    if let Some(side) = state.right.as_mut() {
        side.statistics = (side.statistics.affine(cfg.statistics_decay, 0.0)?
            + g.t()?.matmul(&g)?)?;
        if refresh || side.root.is_none() {
            side.root = Some(inverse_pth_root(
                &side.statistics,
                order,
                cfg.epsilon,
                cfg.root_iterations,
                cfg.root_tolerance,
            )?);
        }
    }

    let mut update = g.contiguous()?;
    if let Some(root) = state.left.as_ref().and_then(|s| s.root.as_ref()) {
        update = root.matmul(&update)?;
    }
    if let Some(root) = state.right.as_ref().and_then(|s| s.root.as_ref()) {
        update = update.matmul(root)?;
    }
    update.reshape(grad.shape())
}

fn frobenius(t: &Tensor) -> Result<f64> {
    t.sqr()?
        .sum_all()?
        .to_dtype(DType::F64)?
        .to_scalar::<f64>()
        .map(f64::sqrt)
}

impl Optimizer for Shampoo {
    type Config = ParamsShampoo;

    fn new(vars: Vec<Var>, params: ParamsShampoo) -> Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| ShampooVar::new(var, params.shampoo.max_preconditioner_dim))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            vars,
            params,
            step_t: 0,
        })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let cfg = self.params.shampoo.clone();
        let refresh = (self.step_t - 1) % cfg.preconditioning_interval == 0;
        let lr = self.params.lr;
        let weight_decay = self.params.weight_decay;

        for state in self.vars.iter_mut() {
            let Some(grad) = grads.get(state.var.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32)?;
            let mut update = precondition(state, &grad, refresh, &cfg)?;

            if cfg.graft {
                let update_norm = frobenius(&update)?;
                if update_norm > 0.0 {
                    update = update.affine(frobenius(&grad)? / update_norm, 0.0)?;
                }
            }

            state.momentum = (state.momentum.affine(cfg.momentum, 0.0)? + update)?;

            let param = state.var.as_tensor();
            let decayed = if weight_decay > 0.0 {
                param.affine(1.0 - lr * weight_decay, 0.0)?
            } else {
                param.clone()
            };
            let delta = state.momentum.affine(lr, 0.0)?.to_dtype(param.dtype())?;
            state.var.set(&(decayed - delta)?)?;
        }
        Ok(())
    }
}
