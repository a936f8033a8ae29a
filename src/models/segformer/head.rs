use crate::compat::ops::resize_bilinear;
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::{Backend, Tensor};
use burn::tensor::activation::relu;

/// Configuration for the SegFormerHead module.
#[derive(Config, Debug)]
pub struct SegFormerHeadConfig {
    /// Channel dimension sizes of the backbone feature maps, highest
    /// resolution first.
    pub embedding_dims: Vec<usize>,

    /// Number of output classes.
    pub num_classes: usize,

    /// Resolution of the emitted logit map.
    pub output_resolution: [usize; 2],

    /// Common channel width the pyramid levels are projected to.
    #[config(default = 256)]
    pub projection_filters: usize,

    /// Dropout rate applied before the classifier.
    #[config(default = 0.1)]
    pub drop_rate: f64,
}

impl SegFormerHeadConfig {
    /// Initializes a new SegFormerHead.
    ///
    /// ## Panics
    ///
    /// If no embedding dimensions are given or `num_classes` is 0.
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> SegFormerHead<B> {
        assert!(
            !self.embedding_dims.is_empty(),
            "Head requires at least one pyramid level"
        );
        assert!(
            self.num_classes > 0,
            "Number of classes must be positive, but got {}",
            self.num_classes
        );

        let p = self.projection_filters;

        SegFormerHead {
            output_resolution: self.output_resolution,
            linear_layers: self
                .embedding_dims
                .iter()
                .map(|&dim| LinearConfig::new(dim, p).init(device))
                .collect(),
            fuse: Conv2dConfig::new([p * self.embedding_dims.len(), p], [1, 1])
                .with_bias(false)
                .init(device),
            fuse_norm: BatchNormConfig::new(p).init(device),
            drop: DropoutConfig::new(self.drop_rate).init(),
            classifier: Conv2dConfig::new([p, self.num_classes], [1, 1]).init(device),
        }
    }
}

/// All-MLP segmentation head.
///
/// Each pyramid level is linearly projected to a common width, bilinearly
/// upsampled to the finest level's resolution, fused with a 1x1
/// convolution, and classified per pixel. Emits raw logits.
#[derive(Module, Debug)]
pub struct SegFormerHead<B: Backend> {
    /// Resolution of the emitted logit map.
    pub output_resolution: [usize; 2],

    /// Per-level channel projections, highest resolution first.
    pub linear_layers: Vec<Linear<B>>,

    /// 1x1 fusion convolution over the concatenated levels.
    pub fuse: Conv2d<B>,

    /// Normalization after fusion.
    pub fuse_norm: BatchNorm<B, 2>,

    /// Dropout before the classifier.
    pub drop: Dropout,

    /// Per-pixel classifier.
    pub classifier: Conv2d<B>,
}

impl<B: Backend> SegFormerHead<B> {
    /// Applies the forward pass on the backbone feature pyramid.
    ///
    /// ## Arguments
    ///
    /// * `features` - One feature map per pyramid level, highest
    ///   resolution first, each of shape (B, C_i, H_i, W_i).
    /// * `training` - Whether the pre-classifier dropout is active.
    ///
    /// ## Returns
    ///
    /// Logit tensor of shape (B, num_classes, H_out, W_out).
    #[must_use]
    pub fn forward(
        &self,
        features: &[Tensor<B, 4>],
        training: bool,
    ) -> Tensor<B, 4> {
        assert_eq!(
            features.len(),
            self.linear_layers.len(),
            "Expected {} pyramid levels, but got {}",
            self.linear_layers.len(),
            features.len()
        );

        let [_, _, h0, w0] = features[0].dims();

        let mut projected: Vec<Tensor<B, 4>> = features
            .iter()
            .zip(self.linear_layers.iter())
            .map(|(feature, linear)| {
                let [b, _, h, w] = feature.dims();

                // Project channels token-wise, then restore the grid.
                let x = feature.clone().flatten::<3>(2, 3).swap_dims(1, 2);
                let x = linear.forward(x);
                let p = x.dims()[2];
                let x = x.swap_dims(1, 2).reshape([b, p, h, w]);

                resize_bilinear(x, [h0, w0])
            })
            .collect();

        // Coarsest level first in the fused stack.
        projected.reverse();
        let x = Tensor::cat(projected, 1);

        let x = self.fuse.forward(x);
        let x = relu(self.fuse_norm.forward(x));
        let x = if training { self.drop.forward(x) } else { x };
        let x = self.classifier.forward(x);

        resize_bilinear(x, self.output_resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    #[test]
    fn test_head_forward() {
        let device = Default::default();
        let embedding_dims = vec![8, 16, 32];
        let num_classes = 5;

        let head = SegFormerHeadConfig::new(embedding_dims, num_classes, [32, 32])
            .with_projection_filters(12)
            .init::<NdArray>(&device);

        let features = vec![
            Tensor::<NdArray, 4>::random([2, 8, 8, 8], Distribution::Normal(0.0, 1.0), &device),
            Tensor::<NdArray, 4>::random([2, 16, 4, 4], Distribution::Normal(0.0, 1.0), &device),
            Tensor::<NdArray, 4>::random([2, 32, 2, 2], Distribution::Normal(0.0, 1.0), &device),
        ];

        let logits = head.forward(&features, false);
        assert_eq!(logits.dims(), [2, num_classes, 32, 32]);
    }

    #[test]
    fn test_head_inference_determinism() {
        // Dropout only gates on the explicit training flag; inference
        // calls are exactly repeatable.
        let device = Default::default();
        let head = SegFormerHeadConfig::new(vec![4, 8], 3, [8, 8])
            .with_projection_filters(6)
            .init::<NdArray>(&device);

        let features = vec![
            Tensor::<NdArray, 4>::random([1, 4, 4, 4], Distribution::Normal(0.0, 1.0), &device),
            Tensor::<NdArray, 4>::random([1, 8, 2, 2], Distribution::Normal(0.0, 1.0), &device),
        ];

        let first = head.forward(&features, false);
        let second = head.forward(&features, false);
        first.to_data().assert_eq(&second.to_data(), true);
    }

    #[test]
    #[should_panic(expected = "Expected 2 pyramid levels, but got 1")]
    fn test_head_wrong_level_count() {
        let device = Default::default();
        let head = SegFormerHeadConfig::new(vec![8, 16], 3, [16, 16])
            .with_projection_filters(4)
            .init::<NdArray>(&device);

        let features = vec![Tensor::<NdArray, 4>::random(
            [1, 8, 4, 4],
            Distribution::Normal(0.0, 1.0),
            &device,
        )];
        let _ = head.forward(&features, false);
    }
}
