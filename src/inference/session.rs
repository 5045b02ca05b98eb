//! Model invocation abstraction
//!
//! Every neural model consumed by the pipeline (segmentation, fbank,
//! embedding, PLDA projection) is a [`ModelPredictor`]: a named-tensor map
//! in, a named-tensor map out. Concrete backends live elsewhere (the
//! optional `onnx` feature, or test doubles); this module provides the
//! trait, a single-shot adapter for backends without native batching, and
//! the pooled scratch buffers used to assemble batched model inputs.

use super::tensor::{Tensor, TensorMap};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// A neural model invoked through named tensors.
///
/// `predict` must be safe to call from multiple tasks; backends that are not
/// internally thread-safe must serialize access themselves.
pub trait ModelPredictor: Send + Sync {
    /// Model name used in logs and error messages.
    fn name(&self) -> &str;

    /// Run one inference.
    fn predict(&self, inputs: &TensorMap) -> Result<TensorMap>;

    /// Run several independent inferences. The default implementation maps
    /// `predict` over the batch; backends with a native batched entry point
    /// override this.
    fn batch_predict(&self, batches: &[TensorMap]) -> Result<Vec<TensorMap>> {
        batches.iter().map(|b| self.predict(b)).collect()
    }

    /// Largest batch the model declares support for, if any.
    fn declared_batch_limit(&self) -> Option<usize> {
        None
    }
}

/// Adapter that forces per-item invocation of a wrapped model, for backends
/// whose batched entry point is unreliable or absent.
pub struct SingleShotModel<M> {
    inner: M,
}

impl<M: ModelPredictor> SingleShotModel<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<M: ModelPredictor> ModelPredictor for SingleShotModel<M> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn predict(&self, inputs: &TensorMap) -> Result<TensorMap> {
        self.inner.predict(inputs)
    }

    fn batch_predict(&self, batches: &[TensorMap]) -> Result<Vec<TensorMap>> {
        batches.iter().map(|b| self.inner.predict(b)).collect()
    }

    fn declared_batch_limit(&self) -> Option<usize> {
        Some(1)
    }
}

/// Adapter that caps the batch visible to a wrapped model, splitting larger
/// `batch_predict` calls into sequential sub-batches.
pub struct BatchLimitedModel<M> {
    inner: M,
    limit: usize,
}

impl<M: ModelPredictor> BatchLimitedModel<M> {
    pub fn new(inner: M, limit: usize) -> Self {
        Self {
            inner,
            limit: limit.max(1),
        }
    }
}

impl<M: ModelPredictor> ModelPredictor for BatchLimitedModel<M> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn predict(&self, inputs: &TensorMap) -> Result<TensorMap> {
        self.inner.predict(inputs)
    }

    fn batch_predict(&self, batches: &[TensorMap]) -> Result<Vec<TensorMap>> {
        let mut outputs = Vec::with_capacity(batches.len());
        for chunk in batches.chunks(self.limit) {
            outputs.extend(self.inner.batch_predict(chunk)?);
        }
        Ok(outputs)
    }

    fn declared_batch_limit(&self) -> Option<usize> {
        Some(self.limit)
    }
}

/// Run a throwaway inference so the backend can compile kernels and allocate
/// its workspace before the timed run. Failure is logged and ignored.
pub fn warm_up(model: &dyn ModelPredictor, inputs: TensorMap) {
    match model.predict(&inputs) {
        Ok(_) => debug!("{} warm-up complete", model.name()),
        Err(e) => warn!("{} warm-up failed (non-fatal): {}", model.name(), e),
    }
}

/// Key identifying a pooled scratch buffer: consumer name, batch, shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    name: &'static str,
    batch: usize,
    shape: Vec<usize>,
}

/// Pool of reusable f32 scratch buffers for model I/O staging.
///
/// Assembling a `(B, 1, W)` segmentation batch allocates ~20 MB; reusing the
/// allocation across batches keeps the runner's memory flat on hour-long
/// inputs. The pool is guarded by a mutex and shared via `Arc`.
#[derive(Debug, Default)]
pub struct BufferPool {
    buffers: Mutex<HashMap<PoolKey, Vec<Vec<f32>>>>,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire a zeroed buffer sized for `batch` x product(shape). The guard
    /// returns the allocation to the pool on drop, on every exit path.
    pub fn acquire(
        self: &Arc<Self>,
        name: &'static str,
        batch: usize,
        shape: &[usize],
    ) -> PooledBuffer {
        let key = PoolKey {
            name,
            batch,
            shape: shape.to_vec(),
        };
        let len = batch * shape.iter().product::<usize>();
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        let mut data = buffers
            .get_mut(&key)
            .and_then(|stack| stack.pop())
            .unwrap_or_default();
        data.clear();
        data.resize(len, 0.0);
        PooledBuffer {
            pool: Arc::clone(self),
            key: Some(key),
            data,
        }
    }

    fn release(&self, key: PoolKey, data: Vec<f32>) {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers.entry(key).or_default().push(data);
    }

    #[cfg(test)]
    fn pooled_count(&self) -> usize {
        let buffers = self.buffers.lock().unwrap();
        buffers.values().map(|v| v.len()).sum()
    }
}

/// RAII guard over a pooled buffer.
pub struct PooledBuffer {
    pool: Arc<BufferPool>,
    key: Option<PoolKey>,
    data: Vec<f32>,
}

impl PooledBuffer {
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Copy the filled prefix into a standalone tensor.
    pub fn to_tensor(&self, shape: Vec<usize>) -> Result<Tensor> {
        let len: usize = shape.iter().product();
        Tensor::new(shape, self.data[..len].to_vec())
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.pool.release(key, std::mem::take(&mut self.data));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoModel;

    impl ModelPredictor for EchoModel {
        fn name(&self) -> &str {
            "echo"
        }

        fn predict(&self, inputs: &TensorMap) -> Result<TensorMap> {
            Ok(inputs.clone())
        }
    }

    #[test]
    fn test_default_batch_predict_maps_predict() {
        let model = EchoModel;
        let mut input = TensorMap::new();
        input.insert("audio", Tensor::zeros(vec![4]));
        let out = model.batch_predict(&[input.clone(), input]).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_single_shot_declares_limit() {
        let model = SingleShotModel::new(EchoModel);
        assert_eq!(model.declared_batch_limit(), Some(1));
    }

    #[test]
    fn test_batch_limited_splits_large_batches() {
        let model = BatchLimitedModel::new(EchoModel, 2);
        assert_eq!(model.declared_batch_limit(), Some(2));

        let mut input = TensorMap::new();
        input.insert("audio", Tensor::zeros(vec![4]));
        let batches = vec![input.clone(), input.clone(), input.clone(), input.clone(), input];
        let out = model.batch_predict(&batches).unwrap();
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn test_pool_reuses_allocations() {
        let pool = BufferPool::new();
        {
            let mut buf = pool.acquire("seg", 2, &[1, 8]);
            buf.as_mut_slice()[0] = 42.0;
            assert_eq!(buf.as_slice().len(), 16);
        }
        assert_eq!(pool.pooled_count(), 1);

        // Reacquired buffers come back zeroed.
        let buf = pool.acquire("seg", 2, &[1, 8]);
        assert_eq!(buf.as_slice()[0], 0.0);
        assert_eq!(pool.pooled_count(), 0);
    }

    #[test]
    fn test_pool_keys_are_distinct() {
        let pool = BufferPool::new();
        drop(pool.acquire("a", 1, &[4]));
        drop(pool.acquire("b", 1, &[4]));
        assert_eq!(pool.pooled_count(), 2);
    }
}
