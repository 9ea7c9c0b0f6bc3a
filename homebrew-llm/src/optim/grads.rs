//! Gradient store arithmetic used by the reversible backward pass and by
//! gradient accumulation.

use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};

/// Adds `grad` to whatever `store` already holds for `tensor`.
pub fn add_grad(store: &mut GradStore, tensor: &Tensor, grad: &Tensor) -> Result<()> {
    let merged = match store.get(tensor) {
        Some(previous) => (previous + grad)?,
        None => grad.clone(),
    };
    store.insert(tensor, merged);
    Ok(())
}

/// Copies the gradients of `params` from `local` into `store`, summing with
/// existing entries.
pub fn accumulate(store: &mut GradStore, local: &GradStore, params: &[&Tensor]) -> Result<()> {
    for param in params {
        if let Some(grad) = local.get(param) {
            add_grad(store, param, grad)?;
        }
    }
    Ok(())
}

/// Multiplies the gradients of `vars` by `factor`.
pub fn scale(store: &mut GradStore, vars: &[Var], factor: f64) -> Result<()> {
    for var in vars {
        if let Some(grad) = store.get(var.as_tensor()) {
            let scaled = grad.affine(factor, 0.0)?;
            store.insert(var.as_tensor(), scaled);
        }
    }
    Ok(())
}

/// Global L2 norm over the gradients of `vars`.
pub fn grad_norm(store: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(grad) = store.get(var.as_tensor()) {
            total += grad
                .sqr()?
                .sum_all()?
                .to_dtype(candle_core::DType::F64)?
                .to_scalar::<f64>()?;
        }
    }
    Ok(total.sqrt())
}

/// Rescales the gradients so their global norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(store: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let norm = grad_norm(store, vars)?;
    if max_norm > 0.0 && norm > max_norm {
        scale(store, vars, max_norm / (norm + 1e-6))?;
    }
    Ok(norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn store_with(var: &Var, values: &[f32]) -> GradStore {
        let loss = (var.as_tensor() * Tensor::new(values, &Device::Cpu).unwrap())
            .unwrap()
            .sum_all()
            .unwrap();
        loss.backward().unwrap()
    }

    #[test]
    fn test_accumulate_sums() {
        let var = Var::new(&[1f32, 1.0], &Device::Cpu).unwrap();
        let mut store = store_with(&var, &[1.0, 2.0]);
        let local = store_with(&var, &[3.0, 4.0]);

        accumulate(&mut store, &local, &[var.as_tensor()]).unwrap();
        let grad = store.get(var.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(grad, vec![4.0, 6.0]);
    }

    #[test]
    fn test_clip_grad_norm() {
        let var = Var::new(&[1f32, 1.0], &Device::Cpu).unwrap();
        let vars = vec![var.clone()];
        let mut store = store_with(&var, &[3.0, 4.0]);

        let norm = clip_grad_norm(&mut store, &vars, 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-6);
        assert!((grad_norm(&store, &vars).unwrap() - 1.0).abs() < 1e-4);

        // Already within bounds: untouched.
        let norm = clip_grad_norm(&mut store, &vars, 10.0).unwrap();
        assert!((norm - 1.0).abs() < 1e-4);
        assert!((grad_norm(&store, &vars).unwrap() - 1.0).abs() < 1e-4);
    }
}
