//! Named tensor values exchanged with neural models
//!
//! Models are invoked with a map of named f32 tensors and return another.
//! Shapes are carried explicitly so adapters can validate the inference
//! contract without knowing the backing runtime.

use anyhow::{anyhow, bail, Result};
use ndarray::{Array2, ArrayView2, ArrayView3};
use std::collections::HashMap;

/// A dense f32 tensor with an explicit shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Build a tensor, checking that the element count matches the shape.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            bail!(
                "tensor shape {:?} implies {} elements, got {}",
                shape,
                expected,
                data.len()
            );
        }
        Ok(Self { shape, data })
    }

    /// A tensor of zeros, used for model warm-up.
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len: usize = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    pub fn from_array2(array: Array2<f32>) -> Self {
        let shape = vec![array.nrows(), array.ncols()];
        let data = array.into_raw_vec();
        Self { shape, data }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// View as a 2-D matrix. Fails when the rank is not 2.
    pub fn view2(&self) -> Result<ArrayView2<'_, f32>> {
        match self.shape[..] {
            [r, c] => ArrayView2::from_shape((r, c), &self.data)
                .map_err(|e| anyhow!("invalid 2-D view: {}", e)),
            _ => bail!("expected rank-2 tensor, got shape {:?}", self.shape),
        }
    }

    /// View as a 3-D array. Fails when the rank is not 3.
    pub fn view3(&self) -> Result<ArrayView3<'_, f32>> {
        match self.shape[..] {
            [a, b, c] => ArrayView3::from_shape((a, b, c), &self.data)
                .map_err(|e| anyhow!("invalid 3-D view: {}", e)),
            _ => bail!("expected rank-3 tensor, got shape {:?}", self.shape),
        }
    }

    /// Flatten away leading length-1 axes, e.g. `(1, 1, N)` to `(N,)`.
    pub fn squeezed_shape(&self) -> Vec<usize> {
        let mut shape: Vec<usize> = self
            .shape
            .iter()
            .copied()
            .skip_while(|&d| d == 1)
            .collect();
        if shape.is_empty() {
            shape.push(self.data.len());
        }
        shape
    }
}

/// Named tensors passed to and from a model.
#[derive(Debug, Clone, Default)]
pub struct TensorMap {
    tensors: HashMap<String, Tensor>,
}

impl TensorMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Fetch the first present tensor among `names`, for models that expose
    /// the same output under different names (e.g. `segments` vs `log_probs`).
    pub fn get_any(&self, names: &[&str]) -> Option<&Tensor> {
        names.iter().find_map(|n| self.tensors.get(*n))
    }

    /// Fetch a required tensor or fail with its name.
    pub fn require(&self, name: &str) -> Result<&Tensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| anyhow!("model output is missing tensor '{}'", name))
    }

    /// The single tensor in the map, for models with one unnamed output.
    pub fn sole(&self) -> Result<&Tensor> {
        if self.tensors.len() != 1 {
            bail!("expected exactly one output tensor, got {}", self.tensors.len());
        }
        Ok(self.tensors.values().next().unwrap())
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.tensors.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_rejected() {
        assert!(Tensor::new(vec![2, 3], vec![0.0; 5]).is_err());
        assert!(Tensor::new(vec![2, 3], vec![0.0; 6]).is_ok());
    }

    #[test]
    fn test_view2() {
        let t = Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let v = t.view2().unwrap();
        assert_eq!(v[[1, 0]], 3.0);
        assert!(t.view3().is_err());
    }

    #[test]
    fn test_squeezed_shape() {
        let t = Tensor::zeros(vec![1, 1, 80, 500]);
        assert_eq!(t.squeezed_shape(), vec![80, 500]);

        let t = Tensor::zeros(vec![1, 1]);
        assert_eq!(t.squeezed_shape(), vec![1]);
    }

    #[test]
    fn test_get_any_prefers_first_match() {
        let mut map = TensorMap::new();
        map.insert("log_probs", Tensor::zeros(vec![4]));
        assert!(map.get_any(&["segments", "log_probs"]).is_some());
        assert!(map.get_any(&["missing"]).is_none());
    }
}
