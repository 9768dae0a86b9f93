//! Classifier contract and the bundled convolutional classifier.

use candle_core::{Module, Tensor};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Linear, VarBuilder};

/// An image classifier whose parameters come from a [`VarBuilder`].
///
/// `build` must request every parameter by name so that the
/// [`ParameterStore`](crate::params::ParameterStore) can enumerate, freeze and
/// re-bind them. The classification layer's parameters should carry the freeze
/// marker (`fc` by default) in their names.
pub trait Classifier: Sized {
    /// Construct the classifier for `num_classes` outputs.
    ///
    /// # Errors
    ///
    /// Returns an error if a parameter cannot be created or has the wrong shape.
    fn build(vb: VarBuilder, num_classes: usize) -> candle_core::Result<Self>;

    /// Map an input batch to per-class scores of shape `(batch, num_classes)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the input shape does not fit the network.
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor>;
}

/// Stage widths of [`CompactNet`] after the stem.
const STAGES: [(usize, usize); 3] = [(24, 48), (48, 96), (96, 192)];
const STEM_CHANNELS: usize = 24;

/// Depthwise 3x3 followed by a pointwise 1x1 projection.
#[derive(Debug, Clone)]
struct SeparableBlock {
    depthwise: Conv2d,
    pointwise: Conv2d,
}

impl SeparableBlock {
    fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let dw_config = Conv2dConfig {
            padding: 1,
            stride: 2,
            groups: in_channels,
            ..Default::default()
        };
        let depthwise = conv2d(in_channels, in_channels, 3, dw_config, vb.pp("dw"))?;
        let pointwise = conv2d(
            in_channels,
            out_channels,
            1,
            Conv2dConfig::default(),
            vb.pp("pw"),
        )?;
        Ok(Self {
            depthwise,
            pointwise,
        })
    }
}

impl Module for SeparableBlock {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xs = self.depthwise.forward(xs)?.relu()?;
        self.pointwise.forward(&xs)?.relu()
    }
}

/// Small depthwise-separable CNN for RGB input of any square size >= 32.
///
/// Layout: `stem` 3x3 stride-2 convolution and 2x2 max-pool, three
/// `features.{i}` separable blocks each halving the resolution, global average
/// pooling, then the linear classification layer `fc`.
#[derive(Debug, Clone)]
pub struct CompactNet {
    stem: Conv2d,
    features: Vec<SeparableBlock>,
    fc: Linear,
}

impl Classifier for CompactNet {
    fn build(vb: VarBuilder, num_classes: usize) -> candle_core::Result<Self> {
        let stem_config = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let stem = conv2d(3, STEM_CHANNELS, 3, stem_config, vb.pp("stem"))?;

        let features = STAGES
            .iter()
            .enumerate()
            .map(|(i, &(cin, cout))| SeparableBlock::new(cin, cout, vb.pp(format!("features.{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;

        let last = STAGES[STAGES.len() - 1].1;
        let fc = linear(last, num_classes, vb.pp("fc"))?;

        Ok(Self { stem, features, fc })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut xs = self.stem.forward(xs)?.relu()?.max_pool2d(2)?;
        for block in &self.features {
            xs = block.forward(&xs)?;
        }
        let pooled = xs.mean((2, 3))?;
        self.fc.forward(&pooled)
    }
}
