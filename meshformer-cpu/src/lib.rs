//! CPU backend for Meshformer.
//!
//! Provides a pure-CPU compute path, in-process thread collectives standing
//! in for a device interconnect, and a safetensors checkpoint store. All
//! compute is done in f32; bf16/f16 checkpoints are cast on load.
//!
//! This backend is intended for testing and for running small models on
//! machines without an accelerator. It is not optimised for throughput.

#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

pub mod comm;
pub mod kernels;
pub mod ops;
pub mod tensor;
pub mod weights;

use meshformer::backend::Backend;

pub use comm::ThreadComm;
pub use tensor::CpuTensor;
pub use weights::SafeTensorsCheckpoint;

/// Marker type for the CPU backend.
///
/// All op trait impls are on this type. Models parameterised by
/// `B: Backend` can use `CpuBackend` to run on CPU.
pub struct CpuBackend;

impl Backend for CpuBackend {
    type Tensor = CpuTensor;
    type Comm = ThreadComm;
}
