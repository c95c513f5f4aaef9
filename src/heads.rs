use burn::{
    nn::{Linear, LinearConfig},
    prelude::*,
    tensor::{activation::softmax, backend::Backend},
};

/// Dense classification layer appended to the flattened backbone output.
///
/// `forward` returns logits; the softmax is applied by `probabilities` and
/// folded into the loss during training.
#[derive(Module, Debug)]
pub struct ClassificationHead<B: Backend> {
    dense: Linear<B>,
    num_classes: usize,
}

impl<B: Backend> ClassificationHead<B> {
    pub fn new(in_features: usize, num_classes: usize, device: &B::Device) -> Self {
        Self {
            dense: LinearConfig::new(in_features, num_classes).init(device),
            num_classes,
        }
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.dense.forward(x)
    }

    pub fn probabilities(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        softmax(self.forward(x), 1)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn probabilities_sum_to_one() {
        let device = Default::default();
        let head = ClassificationHead::<TestBackend>::new(8, 2, &device);
        let x = Tensor::<TestBackend, 2>::ones([3, 8], &device);

        let probs = head.probabilities(x);
        assert_eq!(probs.dims(), [3, 2]);

        let sums: Vec<f32> = probs.sum_dim(1).into_data().to_vec().unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5);
        }
    }
}
