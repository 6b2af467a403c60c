//! Layer wrappers that bind weights once and run forward passes on the
//! accelerator.
//!
//! Every layer also exposes a scalar reference forward, used by the
//! functional verifier to check accelerator output. There is no gradient
//! path: `backward` always fails.

use crate::accel::{cpu, Activation, PimRuntime};
use crate::ops::dense::plan_dense;
use crate::ops::{plan_gemm, AcceleratorClient, OpError};
use crate::tensor::Tensor;

/// An operation that can run on the PIM accelerator.
pub trait PimOp {
    fn name(&self) -> &'static str;

    /// Accelerator forward pass.
    fn forward<R: PimRuntime>(
        &self,
        client: &AcceleratorClient<R>,
        input: &Tensor,
    ) -> Result<Tensor, OpError>;

    /// Scalar reference forward pass.
    fn reference(&self, input: &Tensor) -> Result<Tensor, OpError>;

    /// Not differentiable on the accelerator.
    fn backward(&self, _grad_output: &Tensor) -> Result<Tensor, OpError> {
        Err(OpError::GradientUnsupported { op: self.name() })
    }
}

/// Batched GEMM with bias and a fused activation.
#[derive(Debug, Clone)]
pub struct GemmLayer {
    pub weights: Tensor,
    pub bias: Tensor,
    pub activation: Activation,
}

impl GemmLayer {
    pub fn new(weights: Tensor, bias: Tensor, activation: Activation) -> Self {
        Self {
            weights,
            bias,
            activation,
        }
    }
}

impl PimOp for GemmLayer {
    fn name(&self) -> &'static str {
        "PIM Gemm layer"
    }

    fn forward<R: PimRuntime>(
        &self,
        client: &AcceleratorClient<R>,
        input: &Tensor,
    ) -> Result<Tensor, OpError> {
        client.gemm(input, &self.weights, &self.bias, self.activation)
    }

    fn reference(&self, input: &Tensor) -> Result<Tensor, OpError> {
        let plan = plan_gemm(input, &self.weights, &self.bias)?;
        let data = cpu::gemm(
            &plan.dims,
            plan.weight_channels,
            input.data(),
            self.weights.data(),
            self.bias.data(),
            self.activation,
        );
        reshape(&plan.output_shape, data)
    }
}

/// Fully connected layer. A layer built without bias runs with a zero bias.
#[derive(Debug, Clone)]
pub struct DenseLayer {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    pub activation: Activation,
}

impl DenseLayer {
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Self {
        Self {
            weight,
            bias,
            activation: Activation::None,
        }
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }
}

impl PimOp for DenseLayer {
    fn name(&self) -> &'static str {
        "PIM Dense layer"
    }

    fn forward<R: PimRuntime>(
        &self,
        client: &AcceleratorClient<R>,
        input: &Tensor,
    ) -> Result<Tensor, OpError> {
        client.execute_dense(input, &self.weight, self.bias.as_ref(), self.activation)
    }

    fn reference(&self, input: &Tensor) -> Result<Tensor, OpError> {
        let plan = plan_dense(input, &self.weight)?;
        let bias = match &self.bias {
            Some(b) => b.clone(),
            None => Tensor::zeros(&[plan.dims.out_width]),
        };
        if bias.numel() != plan.dims.out_width {
            return Err(OpError::ShapeMismatch(format!(
                "bias holds {} element(s), output width is {}",
                bias.numel(),
                plan.dims.out_width
            )));
        }
        let data = cpu::gemm(
            &plan.dims,
            1,
            input.data(),
            self.weight.data(),
            bias.data(),
            self.activation,
        );
        reshape(&plan.output_shape, data)
    }
}

fn reshape(shape: &[usize], data: Vec<half::f16>) -> Result<Tensor, OpError> {
    Tensor::from_vec(shape, data).ok_or_else(|| {
        OpError::ShapeMismatch(format!("reference output does not fill shape {shape:?}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backward_is_explicitly_unsupported() {
        let gemm = GemmLayer::new(Tensor::zeros(&[4, 4]), Tensor::zeros(&[4]), Activation::None);
        let dense = DenseLayer::new(Tensor::zeros(&[4, 4]), None);
        let grad = Tensor::zeros(&[1, 4, 4]);

        assert!(matches!(
            gemm.backward(&grad),
            Err(OpError::GradientUnsupported { op: "PIM Gemm layer" })
        ));
        assert!(matches!(
            dense.backward(&grad),
            Err(OpError::GradientUnsupported { op: "PIM Dense layer" })
        ));
    }

    #[test]
    fn test_dense_reference_without_bias() {
        let weight = Tensor::from_f32(&[2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let layer = DenseLayer::new(weight, None);
        assert!(!layer.has_bias());
        let x = Tensor::from_f32(&[1, 2], &[1.0, 1.0]).unwrap();
        let y = layer.reference(&x).unwrap();
        assert_eq!(y.shape(), &[1, 2]);
        assert_eq!(y.to_f32_vec(), vec![4.0, 6.0]);
    }
}
