//! Data types for stored tensor elements

use std::fmt;

use crate::{Error, Result};

/// Element types a checkpoint may carry. All compute is done in f32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit floating point
    F32,
    /// 16-bit floating point (IEEE 754)
    F16,
    /// Brain floating point (16-bit)
    BF16,
}

impl DType {
    /// Size of the dtype in bytes
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::BF16 => 2,
        }
    }

    /// Convert from safetensors dtype string
    #[must_use]
    pub fn from_safetensors(s: &str) -> Option<Self> {
        match s {
            "F32" => Some(Self::F32),
            "F16" => Some(Self::F16),
            "BF16" => Some(Self::BF16),
            _ => None,
        }
    }

    /// Decode little-endian raw bytes of this dtype into f32 values.
    ///
    /// # Errors
    /// Returns an error if the byte length is not a multiple of the element size.
    pub fn decode_f32(self, bytes: &[u8]) -> Result<Vec<f32>> {
        let elem = self.size_in_bytes();
        if bytes.len() % elem != 0 {
            return Err(Error::InvalidShape(format!(
                "{} bytes is not a whole number of {self} elements",
                bytes.len()
            )));
        }
        let out = match self {
            Self::F32 => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            Self::F16 => bytes
                .chunks_exact(2)
                .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            Self::BF16 => bytes
                .chunks_exact(2)
                .map(|c| half::bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
        };
        Ok(out)
    }

    /// Encode f32 values as little-endian bytes of this dtype.
    #[must_use]
    pub fn encode_f32(self, values: &[f32]) -> Vec<u8> {
        match self {
            Self::F32 => bytemuck::cast_slice::<f32, u8>(values).to_vec(),
            Self::F16 => values
                .iter()
                .flat_map(|&v| half::f16::from_f32(v).to_le_bytes())
                .collect(),
            Self::BF16 => values
                .iter()
                .flat_map(|&v| half::bf16::from_f32(v).to_le_bytes())
                .collect(),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::F16 => write!(f, "f16"),
            Self::BF16 => write!(f, "bf16"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size_in_bytes() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::BF16.size_in_bytes(), 2);
    }

    #[test]
    fn test_from_safetensors() {
        assert_eq!(DType::from_safetensors("BF16"), Some(DType::BF16));
        assert_eq!(DType::from_safetensors("I64"), None);
    }

    #[test]
    fn test_bf16_decode_is_lossy_but_close() {
        let values = [1.0_f32, -0.333_333, 1024.5];
        let bytes = DType::BF16.encode_f32(&values);
        assert_eq!(bytes.len(), 6);
        let back = DType::BF16.decode_f32(&bytes).unwrap();
        for (a, b) in values.iter().zip(&back) {
            assert!((a - b).abs() <= a.abs() * 1e-2, "{a} vs {b}");
        }
    }

    #[test]
    fn test_decode_rejects_ragged_bytes() {
        assert!(DType::F32.decode_f32(&[0, 0, 0]).is_err());
    }
}
