//! EmbedOps implementation for CpuBackend.

use meshformer::backend::EmbedOps;
use meshformer::tensor::Tensor;
use meshformer::{Error, Result};

use crate::tensor::CpuTensor;
use crate::CpuBackend;

impl EmbedOps for CpuBackend {
    fn embedding_gather(table: &CpuTensor, ids: &[u32], vocab_start: usize) -> Result<CpuTensor> {
        let &[vocab_slice, hidden_size] = table.shape() else {
            return Err(Error::InvalidShape(format!(
                "embedding_gather: table must be 2D, got {:?}",
                table.shape()
            )));
        };
        let table_data = table.as_f32_slice();

        let mut out = vec![0.0f32; ids.len() * hidden_size];
        for (row, &id) in out.chunks_exact_mut(hidden_size.max(1)).zip(ids) {
            let Some(local) = (id as usize).checked_sub(vocab_start) else {
                continue;
            };
            if local < vocab_slice {
                let start = local * hidden_size;
                row.copy_from_slice(&table_data[start..start + hidden_size]);
            }
        }
        CpuTensor::from_vec(&[ids.len(), hidden_size], out)
    }
}
