//! Named tensor with value and gradient storage

use super::EngineError;

/// A tensor with separate `data` (values) and `diff` (gradients).
///
/// Storage is allocated once at construction and never reallocated, so raw
/// pointers handed out by the `cpu_*` accessors stay valid for the lifetime
/// of the blob.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    name: String,
    shape: Vec<usize>,
    data: Vec<f32>,
    diff: Vec<f32>,
}

impl Blob {
    /// Allocate a zeroed blob. Fails if the element count overflows or the
    /// storage cannot be reserved.
    pub fn new(name: impl Into<String>, shape: Vec<usize>) -> Result<Self, EngineError> {
        let name = name.into();
        let too_large = || EngineError::InvalidNet(format!("blob '{}' of shape {:?} is too large", name, shape));
        let count = shape_count(&shape).ok_or_else(too_large)?;
        Ok(Self {
            data: zeroed(count).ok_or_else(too_large)?,
            diff: zeroed(count).ok_or_else(too_large)?,
            name,
            shape,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn count(&self) -> usize {
        self.data.len()
    }

    /// Size of the first axis (0 for a scalar blob).
    pub fn num(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn diff(&self) -> &[f32] {
        &self.diff
    }

    pub fn diff_mut(&mut self) -> &mut [f32] {
        &mut self.diff
    }

    pub fn cpu_data(&self) -> *const f32 {
        self.data.as_ptr()
    }

    pub fn mutable_cpu_data(&mut self) -> *mut f32 {
        self.data.as_mut_ptr()
    }

    pub fn cpu_diff(&self) -> *const f32 {
        self.diff.as_ptr()
    }

    pub fn mutable_cpu_diff(&mut self) -> *mut f32 {
        self.diff.as_mut_ptr()
    }

    pub fn zero_diff(&mut self) {
        self.diff.iter_mut().for_each(|d| *d = 0.0);
    }

    pub fn sumsq_diff(&self) -> f32 {
        self.diff.iter().map(|d| d * d).sum()
    }

    pub fn scale_diff(&mut self, factor: f32) {
        self.diff.iter_mut().for_each(|d| *d *= factor);
    }

    /// `data -= diff`
    pub fn update(&mut self) {
        for (w, d) in self.data.iter_mut().zip(self.diff.iter()) {
            *w -= d;
        }
    }
}

/// Product of `shape`, `None` on overflow.
pub fn shape_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

fn zeroed(count: usize) -> Option<Vec<f32>> {
    let mut values = Vec::new();
    values.try_reserve_exact(count).ok()?;
    values.resize(count, 0.0);
    Some(values)
}
