//! Neural model interface
//!
//! Named-tensor model abstraction shared by every inference consumer in the
//! pipeline, plus PLDA parameter handling and pooled I/O scratch buffers.

pub mod plda;
pub mod session;
pub mod tensor;

#[cfg(feature = "onnx")]
pub mod onnx;

pub use plda::{PldaParameters, PldaTransform, EMBEDDING_DIM};
pub use session::{
    warm_up, BatchLimitedModel, BufferPool, ModelPredictor, PooledBuffer, SingleShotModel,
};
pub use tensor::{Tensor, TensorMap};

#[cfg(feature = "onnx")]
pub use onnx::OnnxModel;
