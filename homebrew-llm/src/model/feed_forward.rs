use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

use super::norm::activate_norm;

/// 1-D convolution that only looks backwards in time.
///
/// `x` is `[batch, in_channels, seq]` and `weight` is
/// `[out_channels, in_channels, kernel_size]`; the sequence is left-padded with
/// `kernel_size - 1` zeros so output `t` sees inputs `t - k + 1 ..= t`.
pub fn causal_conv(x: &Tensor, weight: &Tensor, kernel_size: usize) -> Result<Tensor> {
    let x = if kernel_size > 1 {
        x.pad_with_zeros(2, kernel_size - 1, 0)?
    } else {
        x.contiguous()?
    };
    x.conv1d(weight, 0, 1, 1, 1)
}

fn conv_init(in_channels: usize, kernel_size: usize) -> Init {
    let bound = 1.0 / ((in_channels * kernel_size) as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

/// Two bias-free causal convolutions around an activation norm.
pub struct FeedForward {
    w0: Tensor,
    w1: Tensor,
    kernel_size: usize,
}

impl FeedForward {
    pub fn new(
        features: usize,
        kernel_size: usize,
        intermediate_factor: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let intermediate = features * intermediate_factor;
        let w0 = vb.get_with_hints(
            (intermediate, features, kernel_size),
            "w0",
            conv_init(features, kernel_size),
        )?;
        let w1 = vb.get_with_hints(
            (features, intermediate, kernel_size),
            "w1",
            conv_init(intermediate, kernel_size),
        )?;
        Ok(Self {
            w0,
            w1,
            kernel_size,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = causal_conv(x, &self.w0, self.kernel_size)?;
        let hidden = activate_norm(&hidden, 1)?;
        causal_conv(&hidden, &self.w1, self.kernel_size)
    }

    pub fn parameters(&self) -> [&Tensor; 2] {
        [&self.w0, &self.w1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_causal_conv_ignores_future() {
        let device = Device::Cpu;
        let weight = Tensor::ones((1, 1, 3), DType::F32, &device).unwrap();
        let x = Tensor::new(&[[[1f32, 2.0, 3.0, 4.0]]], &device).unwrap();

        let y = causal_conv(&x, &weight, 3).unwrap();
        // Running sum over the last three steps.
        assert_eq!(
            y.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![1.0, 3.0, 6.0, 9.0]
        );
    }

    #[test]
    fn test_feed_forward_shapes_and_causality() {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let ff = FeedForward::new(4, 3, 2, vb).unwrap();
        assert_eq!(ff.parameters()[0].dims(), &[8, 4, 3]);
        assert_eq!(ff.parameters()[1].dims(), &[4, 8, 3]);

        let x = Tensor::randn(0f32, 1.0, (1, 4, 6), &device).unwrap();
        let y = ff.forward(&x).unwrap();
        assert_eq!(y.dims(), &[1, 4, 6]);

        // Perturb the last step; earlier outputs must not move.
        let bumped = Tensor::cat(
            &[
                &x.narrow(2, 0, 5).unwrap(),
                &(x.narrow(2, 5, 1).unwrap() + 10.0).unwrap(),
            ],
            2,
        )
        .unwrap();
        let y2 = ff.forward(&bumped).unwrap();
        let diff = (y.narrow(2, 0, 5).unwrap() - y2.narrow(2, 0, 5).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .max_keepdim(2)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(diff.iter().all(|d| *d < 1e-6));
    }
}
