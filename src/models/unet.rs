//! Configurable UNet built from pre-activation residual blocks.
use crate::compat::ops::resize_bilinear;
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AvgPool2d, AvgPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d};
use burn::prelude::{Backend, Tensor};
use burn::tensor::activation::silu;

fn conv3x3_config(d_input: usize, d_output: usize) -> Conv2dConfig {
    Conv2dConfig::new([d_input, d_output], [3, 3])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
}

/// Configuration for a ResidualBlock.
#[derive(Config, Debug)]
pub struct ResidualBlockConfig {
    /// Input channel dimension size.
    pub d_input: usize,

    /// Output channel dimension size.
    pub width: usize,
}

impl ResidualBlockConfig {
    /// Initializes a new ResidualBlock.
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> ResidualBlock<B> {
        let shortcut = if self.d_input != self.width {
            Some(Conv2dConfig::new([self.d_input, self.width], [1, 1]).init(device))
        } else {
            None
        };

        ResidualBlock {
            shortcut,
            norm: BatchNormConfig::new(self.d_input).init(device),
            conv1: conv3x3_config(self.d_input, self.width).init(device),
            conv2: conv3x3_config(self.width, self.width).init(device),
        }
    }
}

/// Pre-activation residual block: batch norm, two 3x3 convolutions with a
/// SiLU between them, and an identity (or 1x1-projected) skip.
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    /// 1x1 skip projection; present only when the channel count changes.
    pub shortcut: Option<Conv2d<B>>,

    /// Input normalization. Affine; burn's `BatchNorm` has no
    /// center/scale-free variant.
    pub norm: BatchNorm<B, 2>,

    /// First 3x3 convolution.
    pub conv1: Conv2d<B>,

    /// Second 3x3 convolution.
    pub conv2: Conv2d<B>,
}

impl<B: Backend> ResidualBlock<B> {
    /// Applies the forward pass; preserves spatial resolution.
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let residual = match &self.shortcut {
            Some(shortcut) => shortcut.forward(x.clone()),
            None => x.clone(),
        };

        let x = self.norm.forward(x);
        let x = silu(self.conv1.forward(x));
        let x = self.conv2.forward(x);

        x + residual
    }
}

/// Downsampling block: a run of residual blocks followed by average
/// pooling. Also yields the pre-pool feature map for skip connections.
#[derive(Module, Debug)]
pub struct DownBlock<B: Backend> {
    /// Residual blocks applied before pooling.
    pub blocks: Vec<ResidualBlock<B>>,

    /// Downsampling pool.
    pub pool: AvgPool2d,
}

impl<B: Backend> DownBlock<B> {
    /// Applies the forward pass.
    ///
    /// ## Returns
    ///
    /// `(pooled, skip)`: the downsampled output and the pre-pool feature
    /// map.
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
    ) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let mut x = x;
        for block in &self.blocks {
            x = block.forward(x);
        }
        let skip = x.clone();
        (self.pool.forward(x), skip)
    }
}

/// Upsampling block: bilinear upsampling, an optional skip concatenation,
/// and a run of residual blocks.
#[derive(Module, Debug)]
pub struct UpBlock<B: Backend> {
    /// Spatial upsampling factor.
    pub scale: usize,

    /// Residual blocks applied after upsampling.
    pub blocks: Vec<ResidualBlock<B>>,
}

impl<B: Backend> UpBlock<B> {
    /// Applies the forward pass.
    ///
    /// ## Arguments
    ///
    /// * `x` - Input tensor of shape (B, C, H, W).
    /// * `skip` - Optional skip feature map, concatenated on the channel
    ///   axis after upsampling.
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        skip: Option<Tensor<B, 4>>,
    ) -> Tensor<B, 4> {
        let [_, _, h, w] = x.dims();
        let mut x = resize_bilinear(x, [h * self.scale, w * self.scale]);

        if let Some(skip) = skip {
            x = Tensor::cat(vec![x, skip], 1);
        }

        for block in &self.blocks {
            x = block.forward(x);
        }
        x
    }
}

/// Configuration for the UNet model.
///
/// The architecture is given either symmetrically with `block_widths`, or
/// asymmetrically with `down_block_widths` / `up_block_widths` and an
/// explicit `bottleneck_width`; the two styles are mutually exclusive.
#[derive(Config, Debug)]
pub struct UNetConfig {
    /// Input channel dimension size.
    pub d_input: usize,

    /// Number of output channels.
    pub output_channels: usize,

    /// Symmetric widths: all but the last define the down path (mirrored
    /// on the up path), the last is the bottleneck.
    #[config(default = "None")]
    pub block_widths: Option<Vec<usize>>,

    /// Widths of the down path, for asymmetric architectures.
    #[config(default = "None")]
    pub down_block_widths: Option<Vec<usize>>,

    /// Widths of the up path, for asymmetric architectures.
    #[config(default = "None")]
    pub up_block_widths: Option<Vec<usize>>,

    /// Residual blocks per down/up block.
    #[config(default = 2)]
    pub block_depth: usize,

    /// Bottleneck width, for asymmetric architectures.
    #[config(default = "None")]
    pub bottleneck_width: Option<usize>,

    /// Residual blocks in the bottleneck; defaults to `block_depth`.
    #[config(default = "None")]
    pub bottleneck_depth: Option<usize>,

    /// Spatial scale factor of each down/up block.
    #[config(default = 2)]
    pub block_scale_factor: usize,

    /// Whether inputs are rescaled from `[0, 255]` to `[0, 1]`.
    #[config(default = false)]
    pub include_rescaling: bool,

    /// Whether down-path feature maps are concatenated into the up path.
    /// Requires the symmetric `block_widths` style.
    #[config(default = false)]
    pub include_skip_connections: bool,
}

/// Pre-computed construction plan for a UNet; see [`UNetConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UNetPlan {
    /// Widths of the down path.
    pub down_widths: Vec<usize>,

    /// Bottleneck width.
    pub bottleneck_width: usize,

    /// Widths of the up path.
    pub up_widths: Vec<usize>,

    /// Residual blocks in the bottleneck.
    pub bottleneck_depth: usize,
}

impl UNetConfig {
    /// Validates the configuration and computes the construction plan.
    pub fn validate(&self) -> Result<UNetPlan, String> {
        if self.block_depth == 0 {
            return Err("Block depth must be at least 1".to_string());
        }
        if self.block_scale_factor < 2 {
            return Err(format!(
                "Block scale factor must be at least 2, but got {}",
                self.block_scale_factor
            ));
        }

        let asymmetric =
            self.down_block_widths.is_some() || self.up_block_widths.is_some();

        if let Some(widths) = &self.block_widths {
            if widths.is_empty() {
                return Err("block_widths must not be empty".to_string());
            }
            if asymmetric || self.bottleneck_width.is_some() {
                return Err(
                    "block_widths is mutually exclusive with down_block_widths, \
                     up_block_widths, and bottleneck_width"
                        .to_string(),
                );
            }

            let down_widths = widths[..widths.len() - 1].to_vec();
            let mut up_widths = down_widths.clone();
            up_widths.reverse();

            return Ok(UNetPlan {
                down_widths,
                bottleneck_width: *widths.last().unwrap(),
                up_widths,
                bottleneck_depth: self.bottleneck_depth.unwrap_or(self.block_depth),
            });
        }

        if !asymmetric {
            return Err(
                "At least one of block_widths, down_block_widths, or up_block_widths \
                 must be given"
                    .to_string(),
            );
        }
        if self.include_skip_connections {
            return Err(
                "Skip connections require the symmetric block_widths style".to_string(),
            );
        }
        let Some(bottleneck_width) = self.bottleneck_width else {
            return Err(
                "Either block_widths or bottleneck_width must be given".to_string(),
            );
        };

        Ok(UNetPlan {
            down_widths: self.down_block_widths.clone().unwrap_or_default(),
            bottleneck_width,
            up_widths: self.up_block_widths.clone().unwrap_or_default(),
            bottleneck_depth: self.bottleneck_depth.unwrap_or(self.block_depth),
        })
    }

    /// Initializes a new UNet.
    ///
    /// ## Panics
    ///
    /// On any error reported by [`Self::validate`].
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> UNet<B> {
        let plan = self.validate().unwrap();
        let scale = self.block_scale_factor;

        let residual_run = |d_input: usize, width: usize, depth: usize| -> Vec<ResidualBlock<B>> {
            (0..depth)
                .map(|i| {
                    let d_in = if i == 0 { d_input } else { width };
                    ResidualBlockConfig::new(d_in, width).init(device)
                })
                .collect()
        };

        let mut d = self.d_input;

        let down_blocks = plan
            .down_widths
            .iter()
            .map(|&width| {
                let block = DownBlock {
                    blocks: residual_run(d, width, self.block_depth),
                    pool: AvgPool2dConfig::new([scale, scale])
                        .with_strides([scale, scale])
                        .init(),
                };
                d = width;
                block
            })
            .collect();

        let bottleneck = residual_run(d, plan.bottleneck_width, plan.bottleneck_depth);
        d = plan.bottleneck_width;

        let up_blocks = plan
            .up_widths
            .iter()
            .enumerate()
            .map(|(i, &width)| {
                // Skip maps arrive deepest-first; their channel counts are
                // the down widths in reverse.
                let skip_width = if self.include_skip_connections {
                    plan.down_widths[plan.down_widths.len() - 1 - i]
                } else {
                    0
                };
                let block = UpBlock {
                    scale,
                    blocks: residual_run(d + skip_width, width, self.block_depth),
                };
                d = width;
                block
            })
            .collect();

        UNet {
            include_rescaling: self.include_rescaling,
            include_skip_connections: self.include_skip_connections,
            down_blocks,
            bottleneck,
            up_blocks,
            output_conv: Conv2dConfig::new([d, self.output_channels], [1, 1])
                .with_initializer(Initializer::Zeros)
                .init(device),
        }
    }
}

/// UNet model.
#[derive(Module, Debug)]
pub struct UNet<B: Backend> {
    /// Whether inputs are rescaled from `[0, 255]` to `[0, 1]`.
    pub include_rescaling: bool,

    /// Whether down-path feature maps feed the up path.
    pub include_skip_connections: bool,

    /// Downsampling path.
    pub down_blocks: Vec<DownBlock<B>>,

    /// Bottleneck residual blocks.
    pub bottleneck: Vec<ResidualBlock<B>>,

    /// Upsampling path.
    pub up_blocks: Vec<UpBlock<B>>,

    /// Zero-initialized 1x1 output convolution.
    pub output_conv: Conv2d<B>,
}

impl<B: Backend> UNet<B> {
    /// Applies the forward pass on an input image batch.
    ///
    /// ## Arguments
    ///
    /// * `x` - Input tensor of shape (B, C, H, W); spatial dimensions must
    ///   be divisible by `scale ^ depth` of the down path.
    ///
    /// ## Returns
    ///
    /// Output tensor of shape (B, output_channels, H', W').
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let mut x = if self.include_rescaling {
            x.div_scalar(255.0)
        } else {
            x
        };

        let mut skips = Vec::with_capacity(self.down_blocks.len());
        for down in &self.down_blocks {
            let (pooled, skip) = down.forward(x);
            x = pooled;
            skips.push(skip);
        }

        for block in &self.bottleneck {
            x = block.forward(x);
        }

        for up in &self.up_blocks {
            let skip = if self.include_skip_connections {
                skips.pop()
            } else {
                None
            };
            x = up.forward(x, skip);
        }

        self.output_conv.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    #[test]
    fn test_symmetric_plan() {
        let config = UNetConfig::new(3, 2)
            .with_block_widths(Some(vec![8, 16, 32]))
            .with_block_depth(1);

        let plan = config.validate().unwrap();
        assert_eq!(plan.down_widths, vec![8, 16]);
        assert_eq!(plan.bottleneck_width, 32);
        assert_eq!(plan.up_widths, vec![16, 8]);
        assert_eq!(plan.bottleneck_depth, 1);
    }

    #[test]
    fn test_validate_requires_widths() {
        let config = UNetConfig::new(3, 2);
        assert!(config
            .validate()
            .unwrap_err()
            .starts_with("At least one of"));
    }

    #[test]
    fn test_validate_rejects_bottleneck_only() {
        // A bottleneck alone would build a UNet with empty down and up
        // paths; some widths list is required.
        let config = UNetConfig::new(3, 2).with_bottleneck_width(Some(16));
        assert!(config
            .validate()
            .unwrap_err()
            .starts_with("At least one of"));
    }

    #[test]
    fn test_validate_asymmetric_requires_bottleneck() {
        let config = UNetConfig::new(3, 2).with_down_block_widths(Some(vec![8]));
        assert_eq!(
            config.validate().unwrap_err(),
            "Either block_widths or bottleneck_width must be given"
        );
    }

    #[test]
    fn test_validate_exclusive_styles() {
        let config = UNetConfig::new(3, 2)
            .with_block_widths(Some(vec![8, 16]))
            .with_down_block_widths(Some(vec![8]));
        assert!(config
            .validate()
            .unwrap_err()
            .contains("mutually exclusive"));
    }

    #[test]
    fn test_validate_skip_requires_symmetric() {
        let config = UNetConfig::new(3, 2)
            .with_down_block_widths(Some(vec![8]))
            .with_up_block_widths(Some(vec![8]))
            .with_bottleneck_width(Some(16))
            .with_include_skip_connections(true);
        assert_eq!(
            config.validate().unwrap_err(),
            "Skip connections require the symmetric block_widths style"
        );
    }

    #[test]
    fn test_unet_forward() {
        let device = Default::default();
        let model = UNetConfig::new(3, 2)
            .with_block_widths(Some(vec![8, 16]))
            .with_block_depth(1)
            .init::<NdArray>(&device);

        let x = Tensor::<NdArray, 4>::random(
            [1, 3, 16, 16],
            Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let y = model.forward(x);
        assert_eq!(y.dims(), [1, 2, 16, 16]);
    }

    #[test]
    fn test_unet_forward_with_skips() {
        let device = Default::default();
        let model = UNetConfig::new(3, 2)
            .with_block_widths(Some(vec![4, 8, 16]))
            .with_block_depth(1)
            .with_include_skip_connections(true)
            .init::<NdArray>(&device);

        let x = Tensor::<NdArray, 4>::random(
            [2, 3, 16, 16],
            Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let y = model.forward(x);
        assert_eq!(y.dims(), [2, 2, 16, 16]);
    }

    #[test]
    fn test_unet_output_starts_at_zero() {
        // The zero-initialized output convolution (with a zero bias) makes
        // a freshly built model emit all zeros.
        let device = Default::default();
        let model = UNetConfig::new(1, 1)
            .with_block_widths(Some(vec![4]))
            .with_block_depth(1)
            .init::<NdArray>(&device);

        let x = Tensor::<NdArray, 4>::random(
            [1, 1, 8, 8],
            Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let y = model.forward(x);
        y.to_data()
            .assert_eq(&Tensor::<NdArray, 4>::zeros([1, 1, 8, 8], &device).to_data(), true);
    }
}
