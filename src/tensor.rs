//! Parameter store
//!
//! Named parameters and external inputs with their host-side value and
//! gradient buffers. Device mirrors live in the runtime; a tensor only
//! tracks whether its host value changed since the last upload.

use crate::error::{GraphError, Result};
use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

/// Handle to a tensor owned by a `Graph`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub(crate) usize);

impl TensorId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorKind {
    /// Trainable; receives a gradient on every `run`
    Parameter,
    /// Fed from outside (batches, targets); never differentiated
    Input,
}

/// Value initializer for a tensor
#[derive(Debug, Clone)]
pub enum Init {
    /// Explicit values, must match the element count
    Values(Vec<f32>),
    Fill(f32),
    Uniform { low: f32, high: f32 },
    /// Standard normal N(0, 1)
    Normal,
    /// Xavier uniform: U(-limit, limit) with limit = sqrt(6 / (fan_in + fan_out))
    Xavier,
    /// He normal: N(0, 2 / fan_in), suited to ReLU networks
    He,
}

/// (fan_in, fan_out) of a `[in, out]` weight; 1-D shapes use their length for both
fn fans(shape: &[usize]) -> (usize, usize) {
    match shape {
        [n] => (*n, *n),
        [fan_in, fan_out, ..] => (*fan_in, *fan_out),
        [] => (1, 1),
    }
}

impl Init {
    pub(crate) fn sample(&self, name: &str, shape: &[usize], rng: &mut StdRng) -> Result<Vec<f32>> {
        let size: usize = shape.iter().product();
        let (fan_in, fan_out) = fans(shape);
        let data = match self {
            Init::Values(values) => {
                if values.len() != size {
                    return Err(GraphError::InputSizeMismatch {
                        name: name.to_string(),
                        expected: size,
                        actual: values.len(),
                    });
                }
                values.clone()
            }
            Init::Fill(v) => vec![*v; size],
            Init::Uniform { low, high } => {
                if low >= high {
                    vec![*low; size]
                } else {
                    (0..size).map(|_| rng.random_range(*low..*high)).collect()
                }
            }
            Init::Normal => sample_normal(size, 1.0, rng),
            Init::Xavier => {
                let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
                (0..size).map(|_| rng.random_range(-limit..limit)).collect()
            }
            Init::He => sample_normal(size, (2.0 / fan_in as f32).sqrt(), rng),
        };
        Ok(data)
    }
}

fn sample_normal(size: usize, std: f32, rng: &mut StdRng) -> Vec<f32> {
    // A positive finite std is always a valid distribution
    match Normal::new(0.0f32, std) {
        Ok(normal) => (0..size).map(|_| normal.sample(rng)).collect(),
        Err(_) => vec![0.0; size],
    }
}

/// A named tensor with host value and gradient buffers
#[derive(Debug, Clone)]
pub struct Tensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub kind: TensorKind,
    pub value: Vec<f32>,
    /// Same length as `value`; stays zero for inputs
    pub grad: Vec<f32>,
    pub(crate) dirty: bool,
}

impl Tensor {
    fn new(name: &str, shape: &[usize], kind: TensorKind) -> Self {
        let size = shape.iter().product();
        Self {
            name: name.to_string(),
            shape: shape.to_vec(),
            kind,
            value: vec![0.0; size],
            grad: vec![0.0; size],
            dirty: true,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.value.len()
    }

    /// Device buffer name, unique across the graph
    #[must_use]
    pub fn binding_name(&self) -> String {
        match self.kind {
            TensorKind::Parameter => format!("param_{}", self.name),
            TensorKind::Input => format!("input_{}", self.name),
        }
    }

    pub(crate) fn set(&mut self, data: &[f32]) -> Result<()> {
        if data.len() != self.size() {
            return Err(GraphError::InputSizeMismatch {
                name: self.name.clone(),
                expected: self.size(),
                actual: data.len(),
            });
        }
        self.value.copy_from_slice(data);
        self.dirty = true;
        Ok(())
    }

    /// One gradient-descent step: θ ← θ - lr·∇θ
    pub(crate) fn learn(&mut self, lr: f32) {
        if self.kind != TensorKind::Parameter {
            return;
        }
        for (v, &g) in self.value.iter_mut().zip(&self.grad) {
            *v -= lr * g;
        }
        self.dirty = true;
    }
}

/// Host-generated dropout mask, one per `dropout` site in the compiled graph
#[derive(Debug, Clone)]
pub(crate) struct Mask {
    pub rate: f32,
    pub value: Vec<f32>,
}

impl Mask {
    pub fn binding_name(index: usize) -> String {
        format!("mask_{index}")
    }

    /// Inverted dropout: kept elements are scaled by 1/(1-rate)
    pub fn refresh(&mut self, rng: &mut StdRng) {
        let keep = (1.0 - self.rate).clamp(0.0, 1.0);
        let scale = if keep > 0.0 { 1.0 / keep } else { 0.0 };
        for v in &mut self.value {
            *v = if rng.random_bool(f64::from(keep)) { scale } else { 0.0 };
        }
    }

    pub fn disable(&mut self) {
        self.value.fill(1.0);
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Default)]
pub(crate) struct TensorStore {
    tensors: Vec<Tensor>,
    masks: Vec<Mask>,
}

impl TensorStore {
    pub fn insert(&mut self, name: &str, shape: &[usize], kind: TensorKind) -> Result<TensorId> {
        if !valid_name(name) {
            return Err(GraphError::InvalidName(name.to_string()));
        }
        if self.tensors.iter().any(|t| t.name == name) {
            return Err(GraphError::DuplicateName(name.to_string()));
        }
        self.tensors.push(Tensor::new(name, shape, kind));
        Ok(TensorId(self.tensors.len() - 1))
    }

    pub fn get(&self, id: TensorId) -> Result<&Tensor> {
        self.tensors.get(id.0).ok_or(GraphError::UnknownTensor(id.0))
    }

    pub fn get_mut(&mut self, id: TensorId) -> Result<&mut Tensor> {
        self.tensors
            .get_mut(id.0)
            .ok_or(GraphError::UnknownTensor(id.0))
    }

    pub fn find(&self, name: &str) -> Option<TensorId> {
        self.tensors.iter().position(|t| t.name == name).map(TensorId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TensorId, &Tensor)> {
        self.tensors.iter().enumerate().map(|(i, t)| (TensorId(i), t))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (TensorId, &mut Tensor)> {
        self.tensors
            .iter_mut()
            .enumerate()
            .map(|(i, t)| (TensorId(i), t))
    }

    pub fn add_mask(&mut self, size: usize, rate: f32) -> usize {
        self.masks.push(Mask {
            rate,
            value: vec![1.0; size],
        });
        self.masks.len() - 1
    }

    pub fn masks(&self) -> &[Mask] {
        &self.masks
    }

    pub fn masks_mut(&mut self) -> &mut [Mask] {
        &mut self.masks
    }

    pub fn clear_masks(&mut self) {
        self.masks.clear();
    }
}
