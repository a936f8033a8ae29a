use crate::models::segformer::backbone::{MitBackbone, MitBackboneConfig};
use crate::models::segformer::head::{SegFormerHead, SegFormerHeadConfig};
use burn::config::Config;
use burn::module::Module;
use burn::prelude::{Backend, Tensor};

/// Configuration for the SegFormer model.
#[derive(Config, Debug)]
pub struct SegFormerConfig {
    /// Backbone configuration.
    pub backbone: MitBackboneConfig,

    /// Number of segmentation classes.
    pub num_classes: usize,

    /// Channel width of the decode head's level projections.
    #[config(default = 256)]
    pub projection_filters: usize,

    /// Dropout rate of the decode head.
    #[config(default = 0.1)]
    pub drop_rate: f64,
}

impl SegFormerConfig {
    /// Initializes a new SegFormer model.
    ///
    /// ## Panics
    ///
    /// On any backbone or head configuration error.
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> SegFormer<B> {
        let backbone = self.backbone.init(device);

        let head = SegFormerHeadConfig::new(
            self.backbone.embedding_dims(),
            self.num_classes,
            self.backbone.input_resolution,
        )
        .with_projection_filters(self.projection_filters)
        .with_drop_rate(self.drop_rate)
        .init(device);

        SegFormer { backbone, head }
    }
}

/// SegFormer semantic segmentation model.
///
/// A MiT backbone feeding an all-MLP decode head; emits per-pixel class
/// logits at the input resolution.
#[derive(Module, Debug)]
pub struct SegFormer<B: Backend> {
    /// Feature pyramid backbone.
    pub backbone: MitBackbone<B>,

    /// All-MLP decode head.
    pub head: SegFormerHead<B>,
}

impl<B: Backend> SegFormer<B> {
    /// Applies the forward pass on an input image batch.
    ///
    /// ## Arguments
    ///
    /// * `images` - Input tensor of shape (B, C, H, W).
    /// * `training` - Whether stochastic depth and dropout are active.
    ///
    /// ## Returns
    ///
    /// Logit tensor of shape (B, num_classes, H, W).
    #[must_use]
    pub fn forward(
        &self,
        images: Tensor<B, 4>,
        training: bool,
    ) -> Tensor<B, 4> {
        let features = self.backbone.forward(images, training);
        self.head.forward(&features, training)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    #[test]
    fn test_segformer_forward() {
        let device = Default::default();
        let num_classes = 4;

        let model = SegFormerConfig::new(MitBackboneConfig::mit_b0([64, 64]), num_classes)
            .with_projection_filters(16)
            .init::<NdArray>(&device);

        let images = Tensor::<NdArray, 4>::random(
            [1, 3, 64, 64],
            Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let logits = model.forward(images, false);
        assert_eq!(logits.dims(), [1, num_classes, 64, 64]);
    }
}
