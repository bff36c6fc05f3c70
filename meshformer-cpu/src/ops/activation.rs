//! ActivationOps implementation for CpuBackend.

use meshformer::backend::ActivationOps;
use meshformer::config::Activation;
use meshformer::tensor::Tensor;
use meshformer::Result;

use crate::tensor::CpuTensor;
use crate::CpuBackend;

const SQRT_2_OVER_PI: f32 = 0.797_884_6;

/// tanh-approximated GELU: `0.5 x (1 + tanh(sqrt(2/π) (x + 0.044715 x³)))`
fn gelu_tanh(x: f32) -> f32 {
    let inner = SQRT_2_OVER_PI * x.mul_add(0.044_715 * x * x, x);
    0.5 * x * (1.0 + inner.tanh())
}

/// Same curve as [`gelu_tanh`], factored as `0.79788456 x (1 + 0.044715 x²)`.
fn gelu_fast(x: f32) -> f32 {
    0.5 * x * (1.0 + (0.797_884_56 * x * (1.0 + 0.044_715 * x * x)).tanh())
}

/// Abramowitz & Stegun 7.1.26, max absolute error 1.5e-7.
fn erf(x: f32) -> f32 {
    let sign = x.signum();
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_6
            + t * (-0.284_496_74 + t * (1.421_413_7 + t * (-1.453_152_1 + t * 1.061_405_4))));
    sign * (1.0 - poly * (-x * x).exp())
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// `ln(1 + e^x)` without overflow for large `x`.
fn softplus(x: f32) -> f32 {
    if x > 20.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}

/// Apply one activation to a scalar.
#[must_use]
pub fn apply(kind: Activation, x: f32) -> f32 {
    match kind {
        Activation::GeluTanh => gelu_tanh(x),
        Activation::Gelu => 0.5 * x * (1.0 + erf(x / std::f32::consts::SQRT_2)),
        Activation::QuickGelu => x * sigmoid(1.702 * x),
        Activation::GeluFast => gelu_fast(x),
        Activation::Gelu10 => gelu_tanh(x).clamp(-10.0, 10.0),
        Activation::Mish => x * softplus(x).tanh(),
        Activation::Silu => x * sigmoid(x),
        Activation::Relu => x.max(0.0),
        Activation::Sigmoid => sigmoid(x),
        Activation::Tanh => x.tanh(),
        Activation::Linear => x,
    }
}

impl ActivationOps for CpuBackend {
    fn activation(input: &CpuTensor, kind: Activation) -> Result<CpuTensor> {
        let out = input
            .as_f32_slice()
            .iter()
            .map(|&x| apply(kind, x))
            .collect();
        CpuTensor::from_vec(input.shape(), out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn test_gelu_variants_agree() {
        for x in [-3.0, -1.0, -0.1, 0.0, 0.5, 2.0] {
            let exact = apply(Activation::Gelu, x);
            assert!((apply(Activation::GeluTanh, x) - exact).abs() < 2e-3, "{x}");
            assert!(close(apply(Activation::GeluFast, x), apply(Activation::GeluTanh, x)));
        }
        assert!(close(apply(Activation::Gelu, 1.0), 0.841_345));
    }

    #[test]
    fn test_gelu_10_clips() {
        assert_eq!(apply(Activation::Gelu10, 50.0), 10.0);
        assert!(close(apply(Activation::Gelu10, 1.0), apply(Activation::GeluTanh, 1.0)));
    }

    #[test]
    fn test_simple_activations() {
        assert_eq!(apply(Activation::Relu, -2.0), 0.0);
        assert_eq!(apply(Activation::Linear, -2.0), -2.0);
        assert!(close(apply(Activation::Sigmoid, 0.0), 0.5));
        assert!(close(apply(Activation::Silu, 1.0), 0.731_059));
        assert!(close(apply(Activation::QuickGelu, 1.0), 0.845_795));
        assert!(close(apply(Activation::Mish, 1.0), 0.865_098));
        assert!(close(apply(Activation::Tanh, 0.5), 0.462_117));
        assert!(apply(Activation::Mish, 100.0).is_finite());
    }

    #[test]
    fn test_activation_op_keeps_shape() {
        let x = CpuTensor::from_f32(&[2, 2], &[-1.0, 0.0, 1.0, 2.0]).unwrap();
        let y = CpuBackend::activation(&x, Activation::Relu).unwrap();
        assert_eq!(y.shape(), &[2, 2]);
        assert_eq!(y.as_f32_slice(), &[0.0, 0.0, 1.0, 2.0]);
    }
}
