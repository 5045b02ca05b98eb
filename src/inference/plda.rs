//! PLDA projection
//!
//! The clustering stage works on rho vectors: speaker embeddings rotated by
//! a PLDA transform whose per-dimension scaling psi drives the VBx model.
//! The rotation itself runs through a [`ModelPredictor`]; psi is loaded once
//! from a JSON parameter file and kept immutable.

use super::session::ModelPredictor;
use super::tensor::{Tensor, TensorMap};
use crate::error::DiarizationError;
use base64::Engine as _;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Embedding dimension expected on the PLDA input side.
pub const EMBEDDING_DIM: usize = 256;

/// Largest batch submitted to the projection model in one call.
const PLDA_BATCH_CAP: usize = 256;

#[derive(Debug, Deserialize)]
struct ParameterFile {
    tensors: ParameterTensors,
}

#[derive(Debug, Deserialize)]
struct ParameterTensors {
    psi: ParameterTensor,
}

#[derive(Debug, Deserialize)]
struct ParameterTensor {
    data_base64: String,
}

/// Immutable PLDA parameters: the diagonal psi, decoded once at init.
#[derive(Debug, Clone)]
pub struct PldaParameters {
    psi: Vec<f64>,
}

impl PldaParameters {
    /// Load psi from the exporter's JSON parameter file. The payload is a
    /// little-endian f32 array; its length defines the rho dimension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DiarizationError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DiarizationError::processing(format!(
                "failed to read PLDA parameters {}: {}",
                path.display(),
                e
            ))
        })?;
        let parsed = Self::from_json(&raw)?;
        info!(
            "loaded PLDA parameters from {} (dim {})",
            path.display(),
            parsed.dim()
        );
        Ok(parsed)
    }

    /// Parse the parameter document from an in-memory JSON string.
    pub fn from_json(raw: &str) -> Result<Self, DiarizationError> {
        let file: ParameterFile = serde_json::from_str(raw).map_err(|e| {
            DiarizationError::processing(format!("malformed PLDA parameter file: {}", e))
        })?;

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(file.tensors.psi.data_base64.trim())
            .map_err(|e| {
                DiarizationError::processing(format!("psi payload is not valid base64: {}", e))
            })?;
        if bytes.is_empty() || bytes.len() % 4 != 0 {
            return Err(DiarizationError::processing(format!(
                "psi payload has {} bytes, expected a nonempty multiple of 4",
                bytes.len()
            )));
        }

        let psi: Vec<f64> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
            .collect();
        if psi.iter().any(|v| !v.is_finite()) {
            return Err(DiarizationError::processing(
                "psi payload contains non-finite values",
            ));
        }

        Ok(Self { psi })
    }

    /// Build parameters directly, for callers that ship psi another way.
    pub fn from_psi(psi: Vec<f64>) -> Self {
        Self { psi }
    }

    pub fn psi(&self) -> &[f64] {
        &self.psi
    }

    /// Dimension of the projected rho vectors.
    pub fn dim(&self) -> usize {
        self.psi.len()
    }
}

/// Batched projection of 256-d embeddings to rho vectors.
pub struct PldaTransform {
    model: Arc<dyn ModelPredictor>,
    parameters: PldaParameters,
}

impl PldaTransform {
    pub fn new(model: Arc<dyn ModelPredictor>, parameters: PldaParameters) -> Self {
        Self { model, parameters }
    }

    pub fn parameters(&self) -> &PldaParameters {
        &self.parameters
    }

    /// Project a batch of embeddings, splitting into sub-batches capped by
    /// the model's declared limit (or the internal cap when undeclared).
    pub fn transform(&self, embeddings: &[Vec<f32>]) -> Result<Vec<Vec<f64>>, DiarizationError> {
        if embeddings.is_empty() {
            return Ok(Vec::new());
        }

        let cap = self
            .model
            .declared_batch_limit()
            .unwrap_or(PLDA_BATCH_CAP)
            .clamp(1, PLDA_BATCH_CAP);

        let mut rho = Vec::with_capacity(embeddings.len());
        for batch in embeddings.chunks(cap) {
            rho.extend(self.transform_batch(batch)?);
        }
        Ok(rho)
    }

    fn transform_batch(&self, batch: &[Vec<f32>]) -> Result<Vec<Vec<f64>>, DiarizationError> {
        let rows = batch.len();
        let mut data = Vec::with_capacity(rows * EMBEDDING_DIM);
        for embedding in batch {
            if embedding.len() != EMBEDDING_DIM {
                return Err(DiarizationError::model_shape(
                    self.model.name(),
                    format!(
                        "PLDA input must be {}-d, got {}",
                        EMBEDDING_DIM,
                        embedding.len()
                    ),
                ));
            }
            data.extend_from_slice(embedding);
        }

        let mut inputs = TensorMap::new();
        inputs.insert(
            "embedding",
            Tensor::new(vec![rows, EMBEDDING_DIM], data)
                .map_err(|e| DiarizationError::model_shape(self.model.name(), e.to_string()))?,
        );

        let outputs = self
            .model
            .predict(&inputs)
            .map_err(|e| DiarizationError::model_shape(self.model.name(), e.to_string()))?;
        let tensor = outputs
            .sole()
            .map_err(|e| DiarizationError::model_shape(self.model.name(), e.to_string()))?;

        let dim = self.parameters.dim();
        if tensor.data().len() != rows * dim {
            return Err(DiarizationError::model_shape(
                self.model.name(),
                format!(
                    "expected {}x{} projection output, got {} values (shape {:?})",
                    rows,
                    dim,
                    tensor.data().len(),
                    tensor.shape()
                ),
            ));
        }

        debug!("projected {} embeddings to {}-d rho vectors", rows, dim);
        Ok(tensor
            .data()
            .chunks_exact(dim)
            .map(|row| row.iter().map(|&v| v as f64).collect())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result as AnyResult;

    fn psi_json(values: &[f32]) -> String {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        format!(
            r#"{{ "tensors": {{ "psi": {{ "data_base64": "{}" }} }} }}"#,
            encoded
        )
    }

    #[test]
    fn test_psi_round_trip() {
        let params = PldaParameters::from_json(&psi_json(&[1.5, 0.25, 4.0])).unwrap();
        assert_eq!(params.dim(), 3);
        assert!((params.psi()[0] - 1.5).abs() < 1e-9);
        assert!((params.psi()[2] - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_malformed_payload_rejected() {
        assert!(PldaParameters::from_json("{}").is_err());
        assert!(PldaParameters::from_json(
            r#"{ "tensors": { "psi": { "data_base64": "not base64!!" } } }"#
        )
        .is_err());
    }

    /// Identity projection onto the first `dim` components.
    struct TruncatingModel {
        dim: usize,
    }

    impl ModelPredictor for TruncatingModel {
        fn name(&self) -> &str {
            "plda-test"
        }

        fn predict(&self, inputs: &TensorMap) -> AnyResult<TensorMap> {
            let input = inputs.require("embedding")?;
            let view = input.view2()?;
            let mut data = Vec::new();
            for row in view.rows() {
                data.extend(row.iter().take(self.dim).copied());
            }
            let mut out = TensorMap::new();
            out.insert("rho", Tensor::new(vec![view.nrows(), self.dim], data)?);
            Ok(out)
        }
    }

    #[test]
    fn test_transform_batches_and_converts() {
        let params = PldaParameters::from_psi(vec![1.0; 4]);
        let transform = PldaTransform::new(Arc::new(TruncatingModel { dim: 4 }), params);

        let embeddings: Vec<Vec<f32>> = (0..5)
            .map(|i| {
                let mut v = vec![0.0f32; EMBEDDING_DIM];
                v[0] = i as f32;
                v
            })
            .collect();

        let rho = transform.transform(&embeddings).unwrap();
        assert_eq!(rho.len(), 5);
        assert_eq!(rho[3].len(), 4);
        assert!((rho[3][0] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_wrong_input_dim_is_model_shape() {
        let params = PldaParameters::from_psi(vec![1.0; 4]);
        let transform = PldaTransform::new(Arc::new(TruncatingModel { dim: 4 }), params);
        let err = transform.transform(&[vec![0.0; 10]]).unwrap_err();
        assert!(matches!(err, DiarizationError::ModelShape { .. }));
    }
}
