use crate::compat::dims::conv_output_size;
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{LayerNorm, LayerNormConfig, PaddingConfig2d};
use burn::prelude::{Backend, Tensor};

/// Common introspection interface for OverlapPatchEmbed.
pub trait OverlapPatchEmbedMeta {
    /// Get the input resolution.
    fn input_resolution(&self) -> [usize; 2];

    /// Get the patch (convolution kernel) size.
    fn patch_size(&self) -> usize;

    /// Get the patch stride.
    fn stride(&self) -> usize;

    /// Get the input channel dimension size.
    fn d_input(&self) -> usize;

    /// Get the output channel dimension size.
    fn d_output(&self) -> usize;

    /// Get the symmetric padding applied before the convolution.
    fn padding(&self) -> usize {
        self.patch_size() / 2
    }

    /// Get the output resolution.
    fn output_resolution(&self) -> [usize; 2] {
        let [h, w] = self.input_resolution();
        [
            conv_output_size(h, self.patch_size(), self.stride(), self.padding()),
            conv_output_size(w, self.patch_size(), self.stride(), self.padding()),
        ]
    }

    /// Get the output sequence length.
    fn num_patches(&self) -> usize {
        let [h, w] = self.output_resolution();
        h * w
    }
}

/// Configuration for the OverlapPatchEmbed module.
#[derive(Config, Debug)]
pub struct OverlapPatchEmbedConfig {
    /// Input resolution (height, width).
    pub input_resolution: [usize; 2],

    /// Patch (convolution kernel) size.
    pub patch_size: usize,

    /// Patch stride; strictly smaller than `patch_size` for overlap.
    pub stride: usize,

    /// Input channel dimension size.
    pub d_input: usize,

    /// Output channel dimension size.
    pub d_output: usize,

    /// Epsilon of the normalization applied to the embedded patches.
    #[config(default = 1e-6)]
    pub norm_epsilon: f64,
}

impl OverlapPatchEmbedMeta for OverlapPatchEmbedConfig {
    fn input_resolution(&self) -> [usize; 2] {
        self.input_resolution
    }

    fn patch_size(&self) -> usize {
        self.patch_size
    }

    fn stride(&self) -> usize {
        self.stride
    }

    fn d_input(&self) -> usize {
        self.d_input
    }

    fn d_output(&self) -> usize {
        self.d_output
    }
}

impl OverlapPatchEmbedConfig {
    /// Initializes a new OverlapPatchEmbed module.
    ///
    /// ## Panics
    ///
    /// If `patch_size` or `stride` is 0.
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> OverlapPatchEmbed<B> {
        assert!(
            self.patch_size > 0,
            "Patch size must be positive, but got {}",
            self.patch_size
        );
        assert!(
            self.stride > 0,
            "Patch stride must be positive, but got {}",
            self.stride
        );

        let padding = self.padding();

        OverlapPatchEmbed {
            input_resolution: self.input_resolution,
            patch_size: self.patch_size,
            stride: self.stride,
            projection: Conv2dConfig::new(
                [self.d_input, self.d_output],
                [self.patch_size, self.patch_size],
            )
            .with_stride([self.stride, self.stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .init(device),
            norm: LayerNormConfig::new(self.d_output)
                .with_epsilon(self.norm_epsilon)
                .init(device),
        }
    }
}

/// Overlapping patch embedding.
///
/// Projects a ``(B, C_in, H, W)`` image into a ``(B, H' * W', C_out)``
/// token sequence with a strided convolution whose kernel exceeds the
/// stride, so neighboring patches share pixels and local continuity is
/// preserved across patch boundaries.
#[derive(Module, Debug)]
pub struct OverlapPatchEmbed<B: Backend> {
    /// Input resolution (height, width).
    pub input_resolution: [usize; 2],

    /// Patch (convolution kernel) size.
    pub patch_size: usize,

    /// Patch stride.
    pub stride: usize,

    /// Patch projection convolution.
    pub projection: Conv2d<B>,

    /// Post-embedding normalization.
    pub norm: LayerNorm<B>,
}

impl<B: Backend> OverlapPatchEmbedMeta for OverlapPatchEmbed<B> {
    fn input_resolution(&self) -> [usize; 2] {
        self.input_resolution
    }

    fn patch_size(&self) -> usize {
        self.patch_size
    }

    fn stride(&self) -> usize {
        self.stride
    }

    fn d_input(&self) -> usize {
        // Conv2d weights are (out, in / groups, k_h, k_w).
        self.projection.weight.dims()[1]
    }

    fn d_output(&self) -> usize {
        self.projection.weight.dims()[0]
    }
}

impl<B: Backend> OverlapPatchEmbed<B> {
    /// Applies the forward pass on an input image batch.
    ///
    /// ## Arguments
    ///
    /// * `x` - Input tensor of shape (B, C_in, H, W).
    ///
    /// ## Returns
    ///
    /// Output tensor of shape (B, H' * W', C_out).
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
    ) -> Tensor<B, 3> {
        let [h, w] = self.input_resolution;
        let [_, _, x_h, x_w] = x.dims();
        assert_eq!(
            [x_h, x_w],
            [h, w],
            "Expected input shape (B, C, {}, {}), but got {:?}",
            h,
            w,
            x.dims()
        );

        let x = self.projection.forward(x);
        // b, c_out, h', w'

        let x = x.flatten::<3>(2, 3).swap_dims(1, 2);
        // b, h'*w', c_out

        self.norm.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    #[test]
    fn test_config() {
        // First stage geometry: 7x7 patches at stride 4 on a 224 image.
        let config = OverlapPatchEmbedConfig::new([224, 224], 7, 4, 3, 32);

        assert_eq!(config.padding(), 3);
        assert_eq!(config.output_resolution(), [56, 56]);
        assert_eq!(config.num_patches(), 3136);
        assert_eq!(config.d_input(), 3);
        assert_eq!(config.d_output(), 32);
    }

    #[test]
    fn test_patch_embed_forward() {
        let device = Default::default();
        let config = OverlapPatchEmbedConfig::new([32, 32], 7, 4, 3, 16);
        assert_eq!(config.output_resolution(), [8, 8]);

        let module = config.init::<NdArray>(&device);
        assert_eq!(module.d_input(), 3);
        assert_eq!(module.d_output(), 16);
        assert_eq!(module.num_patches(), 64);

        let x = Tensor::<NdArray, 4>::random(
            [2, 3, 32, 32],
            Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let y = module.forward(x);
        assert_eq!(y.dims(), [2, 64, 16]);
    }

    #[test]
    fn test_patch_embed_downsampling_stage() {
        // Later stages halve the resolution with 3x3 patches at stride 2.
        let device = Default::default();
        let module =
            OverlapPatchEmbedConfig::new([16, 16], 3, 2, 16, 32).init::<NdArray>(&device);
        assert_eq!(module.output_resolution(), [8, 8]);

        let x = Tensor::<NdArray, 4>::random(
            [1, 16, 16, 16],
            Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let y = module.forward(x);
        assert_eq!(y.dims(), [1, 64, 32]);
    }

    #[test]
    #[should_panic(expected = "Expected input shape (B, C, 16, 16)")]
    fn test_patch_embed_wrong_resolution() {
        let device = Default::default();
        let module =
            OverlapPatchEmbedConfig::new([16, 16], 3, 2, 4, 8).init::<NdArray>(&device);

        let x = Tensor::<NdArray, 4>::random(
            [1, 4, 12, 12],
            Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let _ = module.forward(x);
    }
}
