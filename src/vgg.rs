// ============================================
// src/vgg.rs
// ============================================
use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Tensor},
};

use crate::entity::{FreezePolicy, ImageSize};

/// Output channels of each convolution, grouped by block.
const BLOCKS: [&[usize]; 5] = [
    &[64, 64],
    &[128, 128],
    &[256, 256, 256],
    &[512, 512, 512],
    &[512, 512, 512],
];

/// Spatial reduction after the five pooling stages.
pub const DOWNSAMPLE: usize = 32;
pub const IMAGENET_CLASSES: usize = 1000;
const TOP_HIDDEN: usize = 4096;

#[derive(Config, Debug)]
pub struct Vgg16Config {
    pub image_size: ImageSize,
    #[config(default = "false")]
    pub include_top: bool,
}

impl Vgg16Config {
    /// Height and width of the final feature map.
    pub fn feature_map(&self) -> (usize, usize) {
        (
            self.image_size.height / DOWNSAMPLE,
            self.image_size.width / DOWNSAMPLE,
        )
    }

    /// Width of the flattened backbone output.
    pub fn output_features(&self) -> usize {
        if self.include_top {
            IMAGENET_CLASSES
        } else {
            let (h, w) = self.feature_map();
            512 * h * w
        }
    }

    pub fn check(&self) -> anyhow::Result<()> {
        let (h, w) = self.feature_map();
        if h == 0 || w == 0 {
            anyhow::bail!(
                "input {}x{} is too small for VGG16, need at least {DOWNSAMPLE}x{DOWNSAMPLE}",
                self.image_size.height,
                self.image_size.width
            );
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Vgg16<B> {
        let mut blocks = Vec::with_capacity(BLOCKS.len());
        let mut in_channels = self.image_size.channels;

        for widths in BLOCKS {
            let mut convs = Vec::with_capacity(widths.len());
            for &out_channels in widths {
                convs.push(
                    Conv2dConfig::new([in_channels, out_channels], [3, 3])
                        .with_padding(PaddingConfig2d::Same)
                        .init(device),
                );
                in_channels = out_channels;
            }
            blocks.push(VggBlock {
                convs,
                pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
                relu: Relu::new(),
            });
        }

        let top = if self.include_top {
            let (h, w) = self.feature_map();
            Some(VggTop {
                fc1: LinearConfig::new(in_channels * h * w, TOP_HIDDEN).init(device),
                fc2: LinearConfig::new(TOP_HIDDEN, TOP_HIDDEN).init(device),
                predictions: LinearConfig::new(TOP_HIDDEN, IMAGENET_CLASSES).init(device),
                relu: Relu::new(),
            })
        } else {
            None
        };

        Vgg16 { blocks, top }
    }
}

#[derive(Module, Debug)]
pub struct VggBlock<B: Backend> {
    convs: Vec<Conv2d<B>>,
    pool: MaxPool2d,
    relu: Relu,
}

impl<B: Backend> VggBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = x;
        for conv in &self.convs {
            x = self.relu.forward(conv.forward(x));
        }
        self.pool.forward(x)
    }
}

/// ImageNet classifier: flatten, fc1, fc2, predictions.
#[derive(Module, Debug)]
pub struct VggTop<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
    predictions: Linear<B>,
    relu: Relu,
}

impl<B: Backend> VggTop<B> {
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.relu.forward(self.fc1.forward(x));
        let x = self.relu.forward(self.fc2.forward(x));
        softmax(self.predictions.forward(x), 1)
    }
}

#[derive(Module, Debug)]
pub struct Vgg16<B: Backend> {
    blocks: Vec<VggBlock<B>>,
    top: Option<VggTop<B>>,
}

impl<B: Backend> Vgg16<B> {
    /// Number of layers in the flat layer listing: the input layer,
    /// every convolution and pooling layer, then flatten + three dense
    /// layers when the top is included.
    pub fn layer_count(&self) -> usize {
        let body: usize = self.blocks.iter().map(|b| b.convs.len() + 1).sum();
        let top = if self.top.is_some() { 4 } else { 0 };
        1 + body + top
    }

    /// Stop gradients for the leading layers selected by `policy`.
    pub fn freeze(self, policy: FreezePolicy) -> Self {
        let frozen = policy.frozen_count(self.layer_count());
        let mut index = 1;

        let mut blocks = Vec::with_capacity(self.blocks.len());
        for block in self.blocks {
            let VggBlock { convs, pool, relu } = block;
            let mut kept = Vec::with_capacity(convs.len());
            for conv in convs {
                kept.push(if index < frozen { conv.no_grad() } else { conv });
                index += 1;
            }
            index += 1;
            blocks.push(VggBlock {
                convs: kept,
                pool,
                relu,
            });
        }

        let top = self.top.map(|top| {
            let VggTop {
                fc1,
                fc2,
                predictions,
                relu,
            } = top;
            let flatten = index;
            let gate = |layer: Linear<B>, at: usize| {
                if at < frozen {
                    layer.no_grad()
                } else {
                    layer
                }
            };
            VggTop {
                fc1: gate(fc1, flatten + 1),
                fc2: gate(fc2, flatten + 2),
                predictions: gate(predictions, flatten + 3),
                relu,
            }
        });

        Self { blocks, top }
    }

    /// Flattened features, or ImageNet class probabilities with the top.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = x;
        for block in &self.blocks {
            x = block.forward(x);
        }

        let [batch_size, channels, height, width] = x.dims();
        let flat = x.reshape([batch_size, channels * height * width]);

        match &self.top {
            Some(top) => top.forward(flat),
            None => flat,
        }
    }
}
