use candle_core::{DType, Device, Result, Tensor};

pub fn identity(n: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f64; n * n];
    for i in 0..n {
        data[i * n + i] = 1.0;
    }
    Tensor::from_vec(data, (n, n), device)?.to_dtype(dtype)
}

fn matrix_power(m: &Tensor, p: usize) -> Result<Tensor> {
    let mut out = m.clone();
    for _ in 1..p {
        out = out.matmul(m)?;
    }
    Ok(out)
}

/// `(a + ridge * I)^(-1/p)` for a symmetric positive semi-definite `a`.
///
/// Coupled Newton iteration: only matrix products are needed, which keeps it
/// on whatever device `a` lives on. Runs in f64 and casts back to the input
/// dtype. Stops after `iterations` steps or once `max |M - I| < tolerance`.
pub fn inverse_pth_root(
    a: &Tensor,
    p: usize,
    ridge: f64,
    iterations: usize,
    tolerance: f64,
) -> Result<Tensor> {
    let (n, m) = a.dims2()?;
    if n != m {
        candle_core::bail!("inverse root of a non-square {n}x{m} matrix");
    }
    if p == 0 {
        candle_core::bail!("inverse root order must be positive");
    }
    let dtype = a.dtype();
    let device = a.device();
    let eye = identity(n, DType::F64, device)?;
    let a = (a.to_dtype(DType::F64)? + eye.affine(ridge, 0.0)?)?;

    let norm = a.sqr()?.sum_all()?.sqrt()?.to_scalar::<f64>()?;
    if norm == 0.0 || !norm.is_finite() {
        candle_core::bail!("cannot take the inverse root of a matrix with norm {norm}");
    }

    let alpha = -1.0 / p as f64;
    let z = (1.0 + p as f64) / (2.0 * norm);
    let mut root = eye.affine(z.powf(1.0 / p as f64), 0.0)?;
    let mut m = a.affine(z, 0.0)?;

    for _ in 0..iterations {
        let error = (&m - &eye)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f64>()?;
        if error < tolerance {
            break;
        }
        // (1 - alpha) I + alpha M
        let step = (eye.affine(1.0 - alpha, 0.0)? + m.affine(alpha, 0.0)?)?;
        root = root.matmul(&step)?;
        m = matrix_power(&step, p)?.matmul(&m)?;
    }

    root.to_dtype(dtype)
}
