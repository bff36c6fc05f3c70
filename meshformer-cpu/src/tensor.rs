//! CPU tensor implementation.

use std::sync::Arc;

use meshformer::tensor::Tensor;
use meshformer::{Error, Result};

/// A CPU-resident f32 tensor backed by shared storage.
///
/// Uses `Arc<Vec<f32>>` so clones and reshapes are cheap (shared backing).
/// Mutation copies on write.
#[derive(Clone, Debug)]
pub struct CpuTensor {
    data: Arc<Vec<f32>>,
    shape: Vec<usize>,
}

impl CpuTensor {
    /// Create a tensor that takes ownership of `data`.
    ///
    /// # Errors
    /// Returns an error if `data.len()` is not the product of `shape`.
    pub fn from_vec(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(Error::InvalidShape(format!(
                "data len {} != shape product {numel} for {shape:?}",
                data.len()
            )));
        }
        Ok(Self {
            data: Arc::new(data),
            shape: shape.to_vec(),
        })
    }

    /// Create a tensor from an f32 slice.
    ///
    /// # Errors
    /// Returns an error if `data.len()` is not the product of `shape`.
    pub fn from_f32(shape: &[usize], data: &[f32]) -> Result<Self> {
        Self::from_vec(shape, data.to_vec())
    }

    /// Create a zero-filled tensor.
    #[must_use]
    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            data: Arc::new(vec![0.0; shape.iter().product()]),
            shape: shape.to_vec(),
        }
    }

    #[must_use]
    pub fn as_f32_slice(&self) -> &[f32] {
        &self.data
    }

    /// Mutable access; copies the storage if it is shared.
    pub fn as_f32_slice_mut(&mut self) -> &mut [f32] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    /// Little-endian f32 bytes of the tensor.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }

    #[must_use]
    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.data.as_ref().clone()
    }
}

impl Tensor for CpuTensor {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn reshape(&self, shape: &[usize]) -> Self {
        let new_numel: usize = shape.iter().product();
        assert_eq!(
            self.numel(),
            new_numel,
            "reshape: {} elements != {new_numel} elements",
            self.numel()
        );
        Self {
            data: Arc::clone(&self.data),
            shape: shape.to_vec(),
        }
    }
}
