//! CPU implementations of all backend op traits.

pub mod activation;
pub mod arith;
pub mod attention;
pub mod embed;
pub mod matmul;
pub mod norm;
pub mod rope;
pub mod tensor_ops;

use meshformer::{Error, Result};

/// Fail with `InvalidShape` unless `a` and `b` have the same element count.
pub(crate) fn check_same_len(op: &str, a: usize, b: usize) -> Result<()> {
    if a == b {
        Ok(())
    } else {
        Err(Error::InvalidShape(format!("{op}: length mismatch {a} vs {b}")))
    }
}
