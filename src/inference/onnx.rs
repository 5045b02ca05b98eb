//! ONNX Runtime backend for the model interface
//!
//! Optional adapter (feature `onnx`) exposing an `ort` session as a
//! [`ModelPredictor`]. Inputs are matched to the session's declared input
//! names; outputs are returned under the session's output names, so the
//! pipeline's `segments`/`log_probs`/`embedding` lookups work against
//! models exported with those conventions.

use super::session::ModelPredictor;
use super::tensor::{Tensor, TensorMap};
use anyhow::{anyhow, Context, Result};
use ndarray::{CowArray, IxDyn};
use ort::{Environment, Session, SessionBuilder, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

/// A `ModelPredictor` backed by an ONNX Runtime session.
///
/// `ort` sessions take `&mut self` to run, so invocation is serialized
/// behind a mutex; model handles stay shareable across tasks.
pub struct OnnxModel {
    name: String,
    session: Mutex<Session>,
    input_names: Vec<String>,
    output_names: Vec<String>,
    batch_limit: Option<usize>,
}

impl OnnxModel {
    /// Load a model from disk into a fresh ONNX environment.
    pub fn from_file(
        name: impl Into<String>,
        path: impl AsRef<Path>,
        batch_limit: Option<usize>,
    ) -> Result<Self> {
        let name = name.into();
        let path = path.as_ref();
        let environment = Arc::new(
            Environment::builder()
                .with_name("diarium")
                .build()
                .context("failed to build ONNX environment")?,
        );
        let session = SessionBuilder::new(&environment)?
            .with_model_from_file(path)
            .with_context(|| format!("failed to load {} from {}", name, path.display()))?;

        let input_names = session.inputs.iter().map(|i| i.name.clone()).collect();
        let output_names = session.outputs.iter().map(|o| o.name.clone()).collect();
        info!("loaded ONNX model {} from {}", name, path.display());

        Ok(Self {
            name,
            session: Mutex::new(session),
            input_names,
            output_names,
            batch_limit,
        })
    }
}

impl ModelPredictor for OnnxModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn predict(&self, inputs: &TensorMap) -> Result<TensorMap> {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());

        // ort 1.x feeds inputs positionally; order them by declared name.
        let arrays: Vec<CowArray<'_, f32, IxDyn>> = self
            .input_names
            .iter()
            .map(|name| {
                let tensor = inputs
                    .get(name)
                    .ok_or_else(|| anyhow!("{}: missing input tensor '{}'", self.name, name))?;
                Ok(CowArray::from(
                    ndarray::ArrayViewD::from_shape(tensor.shape(), tensor.data())?,
                ))
            })
            .collect::<Result<_>>()?;

        let values: Vec<Value> = arrays
            .iter()
            .map(|a| Value::from_array(session.allocator(), a))
            .collect::<std::result::Result<_, _>>()
            .context("failed to bind input tensors")?;

        let outputs = session
            .run(values)
            .with_context(|| format!("{} inference failed", self.name))?;

        let mut result = TensorMap::new();
        for (name, value) in self.output_names.iter().zip(outputs.iter()) {
            let extracted = value
                .try_extract::<f32>()
                .with_context(|| format!("{}: output '{}' is not f32", self.name, name))?;
            let view = extracted.view();
            result.insert(
                name.clone(),
                Tensor::new(view.shape().to_vec(), view.iter().copied().collect())?,
            );
        }
        Ok(result)
    }

    fn declared_batch_limit(&self) -> Option<usize> {
        self.batch_limit
    }
}
