//! Host-side batch tensors and their conversion into burn tensors.

/// Dense row-major `f32` buffer with an explicit shape.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl HostTensor {
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        debug_assert_eq!(
            data.len(),
            shape.iter().product::<usize>(),
            "buffer length does not match shape {shape:?}"
        );
        Self { data, shape }
    }

    /// Leading dimension.
    pub fn batch(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Elements per batch row.
    pub fn row_len(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    pub fn row(&self, i: usize) -> &[f32] {
        let n = self.row_len();
        &self.data[i * n..(i + 1) * n]
    }
}

#[cfg(feature = "burn-runtime")]
impl HostTensor {
    /// Uploads to `device`. `D` must equal the length of `shape`.
    pub fn to_burn<B: burn::tensor::backend::Backend, const D: usize>(
        &self,
        device: &B::Device,
    ) -> burn::tensor::Tensor<B, D> {
        burn::tensor::Tensor::<B, D>::from_data(
            burn::tensor::TensorData::new(self.data.clone(), self.shape.clone()),
            device,
        )
    }
}
