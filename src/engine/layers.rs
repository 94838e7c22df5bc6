//! Layer implementations
//!
//! Each layer reads its bottom blobs and writes its top blobs, both held by
//! the owning [`Net`](super::Net) and addressed by index. Backward passes
//! accumulate into bottom diffs; the net zeroes them before each pass.

use crate::param::LayerParameter;

use super::blob::shape_count;
use super::{Blob, EngineError};

/// A named node of the network
#[derive(Debug)]
pub struct Layer {
    name: String,
    bottoms: Vec<usize>,
    tops: Vec<usize>,
    params: Vec<Blob>,
    kind: LayerKind,
}

#[derive(Debug)]
pub enum LayerKind {
    MemoryData(MemoryDataLayer),
    InnerProduct { num_output: usize, bias_term: bool },
    ReLU,
    EuclideanLoss { residual: Vec<f32> },
}

impl LayerKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            LayerKind::MemoryData(_) => "MemoryData",
            LayerKind::InnerProduct { .. } => "InnerProduct",
            LayerKind::ReLU => "ReLU",
            LayerKind::EuclideanLoss { .. } => "EuclideanLoss",
        }
    }
}

impl Layer {
    /// Build a layer and compute the shapes of its tops.
    pub fn setup(
        param: &LayerParameter,
        bottoms: Vec<usize>,
        tops: Vec<usize>,
        bottom_shapes: &[Vec<usize>],
    ) -> Result<(Self, Vec<Vec<usize>>), EngineError> {
        let name = param.name().to_string();
        let invalid = |message: String| EngineError::InvalidNet(format!("layer '{}': {}", name, message));

        let expect_counts = |b: usize, t: usize| {
            if bottoms.len() != b || tops.len() != t {
                return Err(invalid(format!(
                    "{} takes {} bottom(s) and {} top(s), got {} and {}",
                    param.layer_type(),
                    b,
                    t,
                    bottoms.len(),
                    tops.len()
                )));
            }
            Ok(())
        };

        let (kind, params, top_shapes) = match param.layer_type() {
            "MemoryData" => {
                expect_counts(0, 2)?;
                let mp = param
                    .memory_data_param
                    .as_ref()
                    .ok_or_else(|| invalid("missing memory_data_param".to_string()))?;
                let batch_size = mp.batch_size() as usize;
                if batch_size == 0 {
                    return Err(invalid("batch_size must be positive".to_string()));
                }
                let dims = mp.sample_dims();
                let sample_len = mp
                    .sample_len()
                    .filter(|len| len.checked_mul(batch_size).is_some())
                    .ok_or_else(|| invalid(format!("batch of {} x {:?} is too large", batch_size, dims)))?;
                let mut data_shape = vec![batch_size];
                data_shape.extend(dims);
                let layer = MemoryDataLayer::new(name.clone(), batch_size, sample_len);
                (
                    LayerKind::MemoryData(layer),
                    Vec::new(),
                    vec![data_shape, vec![batch_size]],
                )
            }
            "InnerProduct" => {
                expect_counts(1, 1)?;
                let ip = param
                    .inner_product_param
                    .as_ref()
                    .ok_or_else(|| invalid("missing inner_product_param".to_string()))?;
                let num_output = ip.num_output() as usize;
                if num_output == 0 {
                    return Err(invalid("num_output must be positive".to_string()));
                }
                let shape = &bottom_shapes[0];
                let n = shape.first().copied().unwrap_or(1);
                let k = shape_count(shape.get(1..).unwrap_or(&[]))
                    .ok_or_else(|| invalid(format!("bottom shape {:?} is too large", shape)))?;
                if num_output.checked_mul(k).is_none() || n.checked_mul(num_output).is_none() {
                    return Err(invalid(format!("{} outputs over {} inputs is too large", num_output, k)));
                }
                let mut params = vec![Blob::new(format!("{}.weight", name), vec![num_output, k])?];
                if ip.bias_term() {
                    params.push(Blob::new(format!("{}.bias", name), vec![num_output])?);
                }
                (
                    LayerKind::InnerProduct {
                        num_output,
                        bias_term: ip.bias_term(),
                    },
                    params,
                    vec![vec![n, num_output]],
                )
            }
            "ReLU" => {
                expect_counts(1, 1)?;
                (LayerKind::ReLU, Vec::new(), vec![bottom_shapes[0].clone()])
            }
            "EuclideanLoss" => {
                expect_counts(2, 1)?;
                let a: usize = bottom_shapes[0].iter().product();
                let b: usize = bottom_shapes[1].iter().product();
                if a != b {
                    return Err(invalid(format!("bottoms have different counts ({} vs {})", a, b)));
                }
                (
                    LayerKind::EuclideanLoss { residual: vec![0.0; a] },
                    Vec::new(),
                    vec![vec![1]],
                )
            }
            other => return Err(invalid(format!("unsupported layer type '{}'", other))),
        };

        let layer = Self {
            name,
            bottoms,
            tops,
            params,
            kind,
        };
        Ok((layer, top_shapes))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &LayerKind {
        &self.kind
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    pub fn tops(&self) -> &[usize] {
        &self.tops
    }

    pub fn params(&self) -> &[Blob] {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut [Blob] {
        &mut self.params
    }

    pub fn is_loss(&self) -> bool {
        matches!(self.kind, LayerKind::EuclideanLoss { .. })
    }

    /// The memory-feeding view of this layer, if it is one.
    pub fn as_memory_data_mut(&mut self) -> Option<&mut MemoryDataLayer> {
        match &mut self.kind {
            LayerKind::MemoryData(layer) => Some(layer),
            _ => None,
        }
    }

    /// Run the layer forward; returns its loss contribution.
    pub fn forward(&mut self, blobs: &mut [Blob]) -> Result<f32, EngineError> {
        match &mut self.kind {
            LayerKind::MemoryData(layer) => {
                let (data, label) = pair_mut(blobs, self.tops[0], self.tops[1]);
                layer.forward(data, label)?;
                Ok(0.0)
            }
            LayerKind::InnerProduct { num_output, bias_term } => {
                let input = blobs[self.bottoms[0]].data().to_vec();
                let n = blobs[self.bottoms[0]].num().max(1);
                let k = input.len() / n;
                let mut output = gemm(&input, self.params[0].data(), n, k, *num_output, false, true);
                if *bias_term {
                    let bias = self.params[1].data();
                    for row in output.chunks_mut(*num_output) {
                        for (y, b) in row.iter_mut().zip(bias) {
                            *y += b;
                        }
                    }
                }
                blobs[self.tops[0]].data_mut().copy_from_slice(&output);
                Ok(0.0)
            }
            LayerKind::ReLU => {
                let input = blobs[self.bottoms[0]].data().to_vec();
                let top = blobs[self.tops[0]].data_mut();
                for (y, x) in top.iter_mut().zip(input) {
                    *y = x.max(0.0);
                }
                Ok(0.0)
            }
            LayerKind::EuclideanLoss { residual } => {
                let a = blobs[self.bottoms[0]].data();
                let b = blobs[self.bottoms[1]].data();
                let n = blobs[self.bottoms[0]].num().max(1);
                for ((r, x), y) in residual.iter_mut().zip(a).zip(b) {
                    *r = x - y;
                }
                let loss = residual.iter().map(|r| r * r).sum::<f32>() / n as f32 / 2.0;
                blobs[self.tops[0]].data_mut()[0] = loss;
                Ok(loss)
            }
        }
    }

    /// Propagate top diffs to bottom diffs and accumulate parameter gradients.
    pub fn backward(&mut self, blobs: &mut [Blob]) {
        match &self.kind {
            LayerKind::MemoryData(_) => {}
            LayerKind::InnerProduct { num_output, bias_term } => {
                let num_output = *num_output;
                let top_diff = blobs[self.tops[0]].diff().to_vec();
                let input = blobs[self.bottoms[0]].data().to_vec();
                let n = blobs[self.bottoms[0]].num().max(1);
                let k = input.len() / n;

                // dW += dY^T X
                let weight_grad = gemm(&top_diff, &input, num_output, n, k, true, false);
                accumulate(self.params[0].diff_mut(), &weight_grad);

                if *bias_term {
                    let bias_diff = self.params[1].diff_mut();
                    for row in top_diff.chunks(num_output) {
                        accumulate(bias_diff, row);
                    }
                }

                // dX += dY W
                let input_grad = gemm(&top_diff, self.params[0].data(), n, num_output, k, false, false);
                accumulate(blobs[self.bottoms[0]].diff_mut(), &input_grad);
            }
            LayerKind::ReLU => {
                let top = &blobs[self.tops[0]];
                let grad: Vec<f32> = top
                    .diff()
                    .iter()
                    .zip(top.data())
                    .map(|(&dy, &y)| if y > 0.0 { dy } else { 0.0 })
                    .collect();
                let bottom_diff = blobs[self.bottoms[0]].diff_mut();
                if self.bottoms[0] == self.tops[0] {
                    bottom_diff.copy_from_slice(&grad);
                } else {
                    accumulate(bottom_diff, &grad);
                }
            }
            LayerKind::EuclideanLoss { residual } => {
                let n = blobs[self.bottoms[0]].num().max(1) as f32;
                let scale = blobs[self.tops[0]].diff()[0] / n;
                let grad: Vec<f32> = residual.iter().map(|r| r * scale).collect();
                accumulate(blobs[self.bottoms[0]].diff_mut(), &grad);
                let neg: Vec<f32> = grad.iter().map(|g| -g).collect();
                accumulate(blobs[self.bottoms[1]].diff_mut(), &neg);
            }
        }
    }
}

// =============================================================================
// MemoryData
// =============================================================================

/// Feeds batches out of host-owned arrays.
///
/// The layer keeps raw pointers into host memory between `reset` and the
/// next `reset`; it never owns or frees that memory.
#[derive(Debug)]
pub struct MemoryDataLayer {
    name: String,
    batch_size: usize,
    sample_len: usize,
    data: *const f32,
    labels: *const f32,
    n: usize,
    pos: usize,
}

impl MemoryDataLayer {
    fn new(name: String, batch_size: usize, sample_len: usize) -> Self {
        Self {
            name,
            batch_size,
            sample_len,
            data: std::ptr::null(),
            labels: std::ptr::null(),
            n: 0,
            pos: 0,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn sample_len(&self) -> usize {
        self.sample_len
    }

    /// Number of samples behind the current pointers.
    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Point the layer at `n` samples of host data and labels.
    ///
    /// # Safety
    /// `data` must stay valid for reads of `n * sample_len()` floats and
    /// `labels` for `n` floats until the next `reset` or until the network
    /// is dropped.
    pub unsafe fn reset(&mut self, data: *const f32, labels: *const f32, n: i32) -> Result<(), EngineError> {
        let invalid = |message: String| EngineError::InvalidReset {
            layer: self.name.clone(),
            message,
        };
        if data.is_null() || labels.is_null() {
            return Err(invalid("data and label pointers must be non-null".to_string()));
        }
        let n = usize::try_from(n)
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| invalid(format!("sample count {} must be positive", n)))?;
        if n % self.batch_size != 0 {
            return Err(invalid(format!(
                "sample count {} must be a multiple of batch size {}",
                n, self.batch_size
            )));
        }
        let addressable = isize::MAX as usize / std::mem::size_of::<f32>();
        if n.checked_mul(self.sample_len).map_or(true, |count| count > addressable) {
            return Err(invalid(format!(
                "{} samples of {} values exceed the addressable range",
                n, self.sample_len
            )));
        }

        log::debug!("Layer {}: reset with {} samples", self.name, n);
        self.data = data;
        self.labels = labels;
        self.n = n;
        self.pos = 0;
        Ok(())
    }

    fn forward(&mut self, data_top: &mut Blob, label_top: &mut Blob) -> Result<(), EngineError> {
        if self.data.is_null() {
            return Err(EngineError::MemoryDataNotReset(self.name.clone()));
        }

        let values = self.batch_size * self.sample_len;
        // SAFETY: `reset` validated `n` against `batch_size`, so the batch at
        // `pos` lies inside the regions the host promised to keep alive.
        let (batch, labels) = unsafe {
            (
                std::slice::from_raw_parts(self.data.add(self.pos * self.sample_len), values),
                std::slice::from_raw_parts(self.labels.add(self.pos), self.batch_size),
            )
        };
        data_top.data_mut().copy_from_slice(batch);
        label_top.data_mut().copy_from_slice(labels);

        self.pos = (self.pos + self.batch_size) % self.n;
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Two distinct mutable blobs out of one slice.
fn pair_mut(blobs: &mut [Blob], a: usize, b: usize) -> (&mut Blob, &mut Blob) {
    debug_assert_ne!(a, b);
    if a < b {
        let (left, right) = blobs.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = blobs.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

fn accumulate(target: &mut [f32], values: &[f32]) {
    for (t, v) in target.iter_mut().zip(values) {
        *t += v;
    }
}

/// Row-major `C[M, N] = op(A) @ op(B)`, with `op(A)` of shape `[M, K]`.
pub fn gemm(
    a: &[f32],
    b: &[f32],
    m: usize,
    k: usize,
    n: usize,
    transpose_a: bool,
    transpose_b: bool,
) -> Vec<f32> {
    let mut c = vec![0.0f32; m * n];

    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0f32;
            for kk in 0..k {
                let a_idx = if transpose_a { kk * m + i } else { i * k + kk };
                let b_idx = if transpose_b { j * k + kk } else { kk * n + j };
                sum += a[a_idx] * b[b_idx];
            }
            c[i * n + j] = sum;
        }
    }

    c
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::{InnerProductParameter, MemoryDataParameter};

    fn layer_param(name: &str, layer_type: &str) -> LayerParameter {
        LayerParameter {
            name: Some(name.to_string()),
            layer_type: Some(layer_type.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_gemm_2x2() {
        // [[1,2],[3,4]] @ [[5,6],[7,8]] = [[19,22],[43,50]]
        let a = vec![1.0, 2.0, 3.0, 4.0];
        let b = vec![5.0, 6.0, 7.0, 8.0];
        assert_eq!(gemm(&a, &b, 2, 2, 2, false, false), vec![19.0, 22.0, 43.0, 50.0]);
        // A^T @ B = [[1,3],[2,4]] @ B = [[26,30],[38,44]]
        assert_eq!(gemm(&a, &b, 2, 2, 2, true, false), vec![26.0, 30.0, 38.0, 44.0]);
        // A @ B^T = A @ [[5,7],[6,8]] = [[17,23],[39,53]]
        assert_eq!(gemm(&a, &b, 2, 2, 2, false, true), vec![17.0, 23.0, 39.0, 53.0]);
    }

    #[test]
    fn test_inner_product_forward_backward() {
        let mut param = layer_param("ip", "InnerProduct");
        param.inner_product_param = Some(InnerProductParameter {
            num_output: Some(1),
            ..Default::default()
        });
        let (mut layer, shapes) = Layer::setup(&param, vec![0], vec![1], &[vec![2, 3]]).unwrap();
        assert_eq!(shapes, vec![vec![2, 1]]);
        assert_eq!(layer.params().len(), 2);

        let mut blobs = vec![Blob::new("x", vec![2, 3]).unwrap(), Blob::new("y", vec![2, 1]).unwrap()];
        blobs[0].data_mut().copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        layer.params_mut()[0].data_mut().copy_from_slice(&[1.0, 0.0, -1.0]);
        layer.params_mut()[1].data_mut()[0] = 0.5;

        layer.forward(&mut blobs).unwrap();
        assert_eq!(blobs[1].data(), &[-1.5, -1.5]);

        blobs[1].diff_mut().copy_from_slice(&[1.0, 2.0]);
        layer.backward(&mut blobs);
        assert_eq!(layer.params()[0].diff(), &[9.0, 12.0, 15.0]);
        assert_eq!(layer.params()[1].diff(), &[3.0]);
        assert_eq!(blobs[0].diff(), &[1.0, 0.0, -1.0, 2.0, 0.0, -2.0]);
    }

    #[test]
    fn test_relu_in_place_overwrites() {
        let (mut layer, _) = Layer::setup(&layer_param("relu", "ReLU"), vec![0], vec![0], &[vec![4]]).unwrap();
        let mut blobs = vec![Blob::new("x", vec![4]).unwrap()];
        blobs[0].data_mut().copy_from_slice(&[-1.0, 2.0, 0.0, 3.0]);
        layer.forward(&mut blobs).unwrap();
        assert_eq!(blobs[0].data(), &[0.0, 2.0, 0.0, 3.0]);

        blobs[0].diff_mut().copy_from_slice(&[5.0, 5.0, 5.0, 5.0]);
        layer.backward(&mut blobs);
        assert_eq!(blobs[0].diff(), &[0.0, 5.0, 0.0, 5.0]);
    }

    #[test]
    fn test_euclidean_loss() {
        let (mut layer, _) =
            Layer::setup(&layer_param("loss", "EuclideanLoss"), vec![0, 1], vec![2], &[vec![2, 1], vec![2]]).unwrap();
        let mut blobs = vec![Blob::new("a", vec![2, 1]).unwrap(), Blob::new("b", vec![2]).unwrap(), Blob::new("loss", vec![1]).unwrap()];
        blobs[0].data_mut().copy_from_slice(&[3.0, 1.0]);
        blobs[1].data_mut().copy_from_slice(&[1.0, 1.0]);

        let loss = layer.forward(&mut blobs).unwrap();
        assert_eq!(loss, 1.0); // (2^2 + 0) / 2 / 2

        blobs[2].diff_mut()[0] = 1.0;
        layer.backward(&mut blobs);
        assert_eq!(blobs[0].diff(), &[1.0, 0.0]);
        assert_eq!(blobs[1].diff(), &[-1.0, 0.0]);
    }

    #[test]
    fn test_layer_count_mismatch() {
        let err = Layer::setup(&layer_param("relu", "ReLU"), vec![], vec![0], &[]).unwrap_err();
        assert!(err.to_string().contains("takes 1 bottom(s)"), "{}", err);

        let err = Layer::setup(&layer_param("x", "Convolution"), vec![], vec![], &[]).unwrap_err();
        assert!(err.to_string().contains("unsupported layer type"));
    }

    #[test]
    fn test_memory_data_batches_wrap() {
        let mut param = layer_param("data", "MemoryData");
        param.memory_data_param = Some(MemoryDataParameter {
            batch_size: Some(2),
            channels: Some(2),
            ..Default::default()
        });
        let (mut layer, shapes) = Layer::setup(&param, vec![], vec![0, 1], &[]).unwrap();
        assert_eq!(shapes, vec![vec![2, 2, 1, 1], vec![2]]);

        let mut blobs = vec![Blob::new("data", vec![2, 2, 1, 1]).unwrap(), Blob::new("label", vec![2]).unwrap()];
        assert!(matches!(layer.forward(&mut blobs), Err(EngineError::MemoryDataNotReset(_))));

        let data: Vec<f32> = (0..8).map(|v| v as f32).collect();
        let labels = [10.0f32, 11.0, 12.0, 13.0];
        let mem = layer.as_memory_data_mut().unwrap();
        unsafe {
            assert!(mem.reset(data.as_ptr(), labels.as_ptr(), 3).is_err());
            assert!(mem.reset(data.as_ptr(), labels.as_ptr(), 0).is_err());
            mem.reset(data.as_ptr(), labels.as_ptr(), 4).unwrap();
        }

        layer.forward(&mut blobs).unwrap();
        assert_eq!(blobs[0].data(), &[0.0, 1.0, 2.0, 3.0]);
        assert_eq!(blobs[1].data(), &[10.0, 11.0]);
        layer.forward(&mut blobs).unwrap();
        assert_eq!(blobs[0].data(), &[4.0, 5.0, 6.0, 7.0]);
        layer.forward(&mut blobs).unwrap();
        assert_eq!(blobs[1].data(), &[10.0, 11.0]);
    }

    #[test]
    fn test_oversized_memory_data_rejected() {
        let mut param = layer_param("data", "MemoryData");
        param.memory_data_param = Some(MemoryDataParameter {
            batch_size: Some(1),
            channels: Some(4_194_304),
            height: Some(4_194_304),
            width: Some(4_194_304),
        });
        let err = Layer::setup(&param, vec![], vec![0, 1], &[]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidNet(_)), "{}", err);
        assert!(err.to_string().contains("too large"), "{}", err);

        param.memory_data_param = Some(MemoryDataParameter {
            batch_size: Some(u32::MAX),
            channels: Some(u32::MAX),
            height: Some(u32::MAX),
            width: Some(1),
        });
        assert!(Layer::setup(&param, vec![], vec![0, 1], &[]).is_err());
    }

    #[test]
    fn test_oversized_inner_product_rejected() {
        let mut param = layer_param("ip", "InnerProduct");
        param.inner_product_param = Some(InnerProductParameter {
            num_output: Some(u32::MAX),
            ..Default::default()
        });
        let err = Layer::setup(&param, vec![0], vec![1], &[vec![1, usize::MAX / 2]]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidNet(_)), "{}", err);
    }

    #[test]
    fn test_only_memory_data_has_memory_view() {
        let (mut layer, _) = Layer::setup(&layer_param("relu", "ReLU"), vec![0], vec![1], &[vec![2]]).unwrap();
        assert!(layer.as_memory_data_mut().is_none());
        assert_eq!(layer.type_name(), "ReLU");
    }
}
