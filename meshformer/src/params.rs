//! Host-side parameter containers.
//!
//! Parameters live on the host as [`HostTensor`]s while they are
//! initialised, updated by an optimizer, or moved through a checkpoint
//! store; models upload them to their backend when (re)building weights.

use std::collections::BTreeMap;

use crate::{Error, Result};

/// Parameters keyed by path (`layers.3.attention.q.weight`).
///
/// A `BTreeMap` so every worker iterates in the same order.
pub type ParamSet = BTreeMap<String, HostTensor>;

/// A dense row-major f32 tensor in host memory.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl HostTensor {
    /// # Errors
    /// Returns an error if `data.len()` is not the product of `shape`.
    pub fn new(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(Error::InvalidShape(format!(
                "{} values for shape {shape:?}",
                data.len()
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    #[must_use]
    pub fn full(shape: &[usize], value: f32) -> Self {
        Self {
            shape: shape.to_vec(),
            data: vec![value; shape.iter().product()],
        }
    }

    #[must_use]
    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    #[must_use]
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// `(outer, dim, inner)` sizes around `axis`.
    fn split_at_axis(&self, axis: usize) -> Result<(usize, usize, usize)> {
        if axis >= self.shape.len() {
            return Err(Error::InvalidShape(format!(
                "axis {axis} out of range for shape {:?}",
                self.shape
            )));
        }
        let outer = self.shape[..axis].iter().product();
        let inner = self.shape[axis + 1..].iter().product();
        Ok((outer, self.shape[axis], inner))
    }

    /// Copy `len` entries of `axis` starting at `start`.
    ///
    /// # Errors
    /// Returns an error if the axis or range is out of bounds.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Self> {
        let (outer, dim, inner) = self.split_at_axis(axis)?;
        if start + len > dim {
            return Err(Error::InvalidShape(format!(
                "narrow {start}..{} exceeds axis {axis} of {:?}",
                start + len,
                self.shape
            )));
        }
        let mut data = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let from = (o * dim + start) * inner;
            data.extend_from_slice(&self.data[from..from + len * inner]);
        }
        let mut shape = self.shape.clone();
        shape[axis] = len;
        Ok(Self { shape, data })
    }

    /// Concatenate tensors that agree on every axis but `axis`.
    ///
    /// # Errors
    /// Returns an error for an empty input or mismatched shapes.
    pub fn concat(parts: &[Self], axis: usize) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| Error::InvalidShape("concat of zero tensors".into()))?;
        let (outer, _, inner) = first.split_at_axis(axis)?;
        let mut total = 0;
        for part in parts {
            let same_frame = part.shape.len() == first.shape.len()
                && part
                    .shape
                    .iter()
                    .zip(&first.shape)
                    .enumerate()
                    .all(|(i, (a, b))| i == axis || a == b);
            if !same_frame {
                return Err(Error::InvalidShape(format!(
                    "cannot concat {:?} with {:?} on axis {axis}",
                    part.shape, first.shape
                )));
            }
            total += part.shape[axis];
        }
        let mut data = Vec::with_capacity(outer * total * inner);
        for o in 0..outer {
            for part in parts {
                let block = part.shape[axis] * inner;
                data.extend_from_slice(&part.data[o * block..(o + 1) * block]);
            }
        }
        let mut shape = first.shape.clone();
        shape[axis] = total;
        Ok(Self { shape, data })
    }
}

/// Sum of squares over every tensor of a set.
#[must_use]
pub fn squared_norm(params: &ParamSet) -> f32 {
    params
        .values()
        .flat_map(|t| t.data().iter())
        .map(|v| v * v)
        .sum()
}
