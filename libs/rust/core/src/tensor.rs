//! Minimal dense tensor used as the exchange type between the core and the
//! numeric backend. Row-major `f32` storage with an explicit shape.

use serde::{Deserialize, Serialize};

use crate::error::{FlError, FlResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> FlResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(FlError::Backend(format!("shape {:?} needs {} elements, got {}", shape, expected, data.len())));
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self { shape, data: vec![0.0; len] }
    }

    pub fn from_vec(data: Vec<f32>) -> Self { Self { shape: vec![data.len()], data } }

    pub fn shape(&self) -> &[usize] { &self.shape }
    pub fn len(&self) -> usize { self.data.len() }
    pub fn is_empty(&self) -> bool { self.data.is_empty() }
    pub fn data(&self) -> &[f32] { &self.data }
    pub fn data_mut(&mut self) -> &mut [f32] { &mut self.data }

    pub fn reshape(mut self, shape: Vec<usize>) -> FlResult<Self> {
        let expected: usize = shape.iter().product();
        if expected != self.data.len() {
            return Err(FlError::Backend(format!("cannot reshape {:?} into {:?}", self.shape, shape)));
        }
        self.shape = shape;
        Ok(self)
    }

    fn check_same_shape(&self, other: &Tensor) -> FlResult<()> {
        if self.shape != other.shape {
            return Err(FlError::Backend(format!("shape mismatch {:?} vs {:?}", self.shape, other.shape)));
        }
        Ok(())
    }

    pub fn add(&self, other: &Tensor) -> FlResult<Tensor> {
        self.check_same_shape(other)?;
        let data = self.data.iter().zip(&other.data).map(|(a, b)| a + b).collect();
        Ok(Tensor { shape: self.shape.clone(), data })
    }

    /// In-place `self += alpha * other`.
    pub fn axpy(&mut self, alpha: f32, other: &Tensor) -> FlResult<()> {
        self.check_same_shape(other)?;
        for (a, b) in self.data.iter_mut().zip(&other.data) { *a += alpha * b; }
        Ok(())
    }

    pub fn scale(&self, factor: f32) -> Tensor {
        Tensor { shape: self.shape.clone(), data: self.data.iter().map(|v| v * factor).collect() }
    }

    pub fn scale_in_place(&mut self, factor: f32) { for v in &mut self.data { *v *= factor; } }

    pub fn mul(&self, other: &Tensor) -> FlResult<Tensor> {
        self.check_same_shape(other)?;
        let data = self.data.iter().zip(&other.data).map(|(a, b)| a * b).collect();
        Ok(Tensor { shape: self.shape.clone(), data })
    }

    pub fn dot(&self, values: &[f32]) -> FlResult<f32> {
        if values.len() != self.data.len() {
            return Err(FlError::Backend(format!("dot length mismatch {} vs {}", self.data.len(), values.len())));
        }
        Ok(self.data.iter().zip(values).map(|(a, b)| a * b).sum())
    }

    pub fn sum(&self) -> f32 { self.data.iter().sum() }

    pub fn mean(&self) -> f32 {
        if self.data.is_empty() { return 0.0; }
        self.sum() / self.data.len() as f32
    }

    pub fn squared_norm(&self) -> f32 { self.data.iter().map(|v| v * v).sum() }

    pub fn is_finite(&self) -> bool { self.data.iter().all(|v| v.is_finite()) }
}

/// Global L2 norm across a parameter set.
pub fn global_norm(tensors: &[Tensor]) -> f32 {
    tensors.iter().map(Tensor::squared_norm).sum::<f32>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reshape_keeps_data_and_rejects_bad_shape() {
        let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        let r = t.clone().reshape(vec![2, 2]).unwrap();
        assert_eq!(r.shape(), &[2, 2]);
        assert_eq!(r.data(), t.data());
        assert!(t.reshape(vec![3]).is_err());
    }

    #[test]
    fn arithmetic_and_norm() {
        let a = Tensor::from_vec(vec![3.0, 4.0]);
        let b = Tensor::from_vec(vec![1.0, 1.0]);
        assert_eq!(a.add(&b).unwrap().data(), &[4.0, 5.0]);
        assert_eq!(a.mul(&b).unwrap().data(), &[3.0, 4.0]);
        assert!((global_norm(&[a.clone()]) - 5.0).abs() < 1e-6);
        assert!((a.mean() - 3.5).abs() < 1e-6);
        assert!(a.add(&Tensor::zeros(vec![3])).is_err());
    }
}
