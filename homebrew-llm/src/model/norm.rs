use candle_core::{Result, Tensor};

const EPS: f64 = 1e-5;

/// ReLU followed by centering and scaling to unit RMS along `dim`.
///
/// The model applies it over the channel axis, so every sequence position is
/// normalised on its own and no information crosses time steps.
pub fn activate_norm(x: &Tensor, dim: usize) -> Result<Tensor> {
    let n = x.dim(dim)? as f64;
    let x = x.relu()?;
    let x = x.broadcast_sub(&x.mean_keepdim(dim)?)?;
    // The 1e-12 keeps the sqrt gradient finite for all-zero rows.
    let norm = (x.sqr()?.sum_keepdim(dim)? + 1e-12)?.sqrt()?;
    let scale = (norm + EPS)?.affine(n.powf(-0.5), 0.0)?;
    x.broadcast_div(&scale)
}
