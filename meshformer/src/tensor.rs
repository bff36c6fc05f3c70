//! Tensor trait definition

/// Shape-level interface every backend tensor provides.
///
/// Compute tensors are always f32; storage dtypes only matter at the
/// checkpoint boundary (see [`DType`](crate::DType)).
pub trait Tensor: Sized {
    /// Returns the shape of the tensor as a slice of dimensions
    fn shape(&self) -> &[usize];

    /// Create a view with a different shape (same data, same number of elements).
    ///
    /// # Panics
    /// Panics if the new shape has a different number of elements.
    #[must_use]
    fn reshape(&self, shape: &[usize]) -> Self;

    /// Returns the total number of elements in the tensor
    fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    /// Returns the number of dimensions (rank) of the tensor
    fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Size of the innermost axis (1 for scalars).
    fn last_dim(&self) -> usize {
        self.shape().last().copied().unwrap_or(1)
    }

    /// Number of rows when viewed as `(numel / last_dim, last_dim)`.
    fn rows(&self) -> usize {
        match self.last_dim() {
            0 => 0,
            n => self.numel() / n,
        }
    }

    /// Returns the row-major stride for each dimension
    fn strides(&self) -> Vec<usize> {
        let shape = self.shape();
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct ShapeOnly {
        shape: Vec<usize>,
    }

    impl Tensor for ShapeOnly {
        fn shape(&self) -> &[usize] {
            &self.shape
        }

        fn reshape(&self, shape: &[usize]) -> Self {
            let new_numel: usize = shape.iter().product();
            assert_eq!(self.numel(), new_numel);
            Self {
                shape: shape.to_vec(),
            }
        }
    }

    fn t(shape: &[usize]) -> ShapeOnly {
        ShapeOnly {
            shape: shape.to_vec(),
        }
    }

    #[test]
    fn test_numel_and_scalar() {
        assert_eq!(t(&[2, 3, 4]).numel(), 24);
        assert_eq!(t(&[]).numel(), 1);
    }

    #[test]
    fn test_rows_of_attention_layout() {
        // (seq, heads, d_head) viewed as rows of d_head
        let q = t(&[5, 2, 8]);
        assert_eq!(q.last_dim(), 8);
        assert_eq!(q.rows(), 10);
        assert_eq!(t(&[]).rows(), 1);
        assert_eq!(t(&[3, 0]).rows(), 0);
    }

    #[test]
    fn test_strides_3d() {
        assert_eq!(t(&[2, 3, 4]).strides(), vec![12, 4, 1]);
        assert_eq!(t(&[]).strides(), Vec::<usize>::new());
    }

    #[test]
    #[should_panic]
    fn test_reshape_rejects_numel_change() {
        let _ = t(&[2, 3]).reshape(&[7]);
    }
}
