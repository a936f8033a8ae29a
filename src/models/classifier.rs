//! Image classification on top of a MiT backbone.
use crate::models::segformer::backbone::{MitBackbone, MitBackboneConfig};
use burn::config::Config;
use burn::module::{Ignored, Module};
use burn::nn::pool::{AdaptiveAvgPool1d, AdaptiveAvgPool1dConfig};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::{Backend, Tensor};
use serde::{Deserialize, Serialize};

/// Spatial pooling applied to the final feature map before the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pooling {
    /// Global average pooling.
    Avg,

    /// Global max pooling.
    Max,
}

/// Configuration for the ImageClassifier model.
#[derive(Config, Debug)]
pub struct ImageClassifierConfig {
    /// Backbone configuration.
    pub backbone: MitBackboneConfig,

    /// Number of output classes.
    pub num_classes: usize,

    /// Pooling applied to the final feature map.
    #[config(default = "Pooling::Avg")]
    pub pooling: Pooling,
}

impl ImageClassifierConfig {
    /// Initializes a new ImageClassifier.
    ///
    /// ## Panics
    ///
    /// On any backbone configuration error, or if `num_classes` is 0.
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> ImageClassifier<B> {
        assert!(
            self.num_classes > 0,
            "Number of classes must be positive, but got {}",
            self.num_classes
        );

        let backbone = self.backbone.init(device);
        let d_features = *self
            .backbone
            .embedding_dims()
            .last()
            .unwrap();

        ImageClassifier {
            backbone,
            pooling: Ignored(self.pooling),
            avgpool: AdaptiveAvgPool1dConfig::new(1).init(),
            head: LinearConfig::new(d_features, self.num_classes).init(device),
        }
    }
}

/// Image classifier: a MiT backbone, global pooling over the coarsest
/// feature map, and a linear head. Emits raw class logits.
#[derive(Module, Debug)]
pub struct ImageClassifier<B: Backend> {
    /// Feature pyramid backbone.
    pub backbone: MitBackbone<B>,

    /// Pooling applied to the final feature map.
    pub pooling: Ignored<Pooling>,

    /// Pooling operator for [`Pooling::Avg`].
    pub avgpool: AdaptiveAvgPool1d,

    /// Classification head.
    pub head: Linear<B>,
}

impl<B: Backend> ImageClassifier<B> {
    /// Applies the forward pass on an input image batch.
    ///
    /// ## Arguments
    ///
    /// * `images` - Input tensor of shape (B, C, H, W).
    /// * `training` - Whether stochastic depth is active.
    ///
    /// ## Returns
    ///
    /// Logit tensor of shape (B, num_classes).
    #[must_use]
    pub fn forward(
        &self,
        images: Tensor<B, 4>,
        training: bool,
    ) -> Tensor<B, 2> {
        let features = self.backbone.forward(images, training);
        // Only the coarsest level feeds the head.
        let x = features
            .into_iter()
            .last()
            .unwrap();

        let x = x.flatten::<3>(2, 3);
        // b, c, h*w

        let x = match self.pooling.0 {
            Pooling::Avg => self.avgpool.forward(x),
            Pooling::Max => x.max_dim(2),
        };
        // b, c, 1

        self.head.forward(x.flatten::<2>(1, 2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    #[test]
    fn test_classifier_avg() {
        let device = Default::default();
        let num_classes = 10;

        let model =
            ImageClassifierConfig::new(MitBackboneConfig::mit_b0([64, 64]), num_classes)
                .init::<NdArray>(&device);
        assert_eq!(model.pooling.0, Pooling::Avg);

        let images = Tensor::<NdArray, 4>::random(
            [2, 3, 64, 64],
            Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let logits = model.forward(images, false);
        assert_eq!(logits.dims(), [2, num_classes]);
    }

    #[test]
    fn test_classifier_max() {
        let device = Default::default();

        let model = ImageClassifierConfig::new(MitBackboneConfig::mit_b0([64, 64]), 7)
            .with_pooling(Pooling::Max)
            .init::<NdArray>(&device);

        let images = Tensor::<NdArray, 4>::random(
            [1, 3, 64, 64],
            Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let logits = model.forward(images, false);
        assert_eq!(logits.dims(), [1, 7]);
    }
}
