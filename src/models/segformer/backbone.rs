use crate::compat::dims::conv_output_size;
use crate::models::segformer::block::{
    HierarchicalEncoderBlock, HierarchicalEncoderBlockConfig,
};
use crate::models::segformer::dpr::stage_rate_table;
use crate::models::segformer::embed::{
    OverlapPatchEmbed, OverlapPatchEmbedConfig, OverlapPatchEmbedMeta,
};
use burn::config::Config;
use burn::module::Module;
use burn::nn::{LayerNorm, LayerNormConfig};
use burn::prelude::{Backend, Tensor};

/// Configuration for one stage of a MiT backbone.
#[derive(Config, Debug)]
pub struct StageConfig {
    /// Channel dimension size of the stage.
    pub d_model: usize,

    /// Number of encoder blocks in the stage.
    pub depth: usize,

    /// Number of attention heads per block.
    pub num_heads: usize,

    /// Sequence reduction ratio of the stage's attention.
    #[config(default = 1)]
    pub sr_ratio: usize,

    /// Patch size of the stage's embedding.
    #[config(default = 3)]
    pub patch_size: usize,

    /// Patch stride of the stage's embedding.
    #[config(default = 2)]
    pub stride: usize,
}

/// Configuration for the MiT (Mix Transformer) backbone.
#[derive(Config, Debug)]
pub struct MitBackboneConfig {
    /// Input resolution (height, width).
    pub input_resolution: [usize; 2],

    /// Input channel dimension size.
    pub d_input: usize,

    /// Per-stage configurations, ordered coarse to fine.
    pub stage_configs: Vec<StageConfig>,

    /// Maximum stochastic depth rate; ramped linearly over all blocks.
    #[config(default = 0.1)]
    pub drop_path_rate: f64,

    /// Epsilon for all layer normalizations.
    #[config(default = 1e-6)]
    pub norm_epsilon: f64,
}

/// Pre-computed construction plan for a MiT backbone; see
/// [`MitBackboneConfig::validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct MitBackbonePlan {
    /// Token grid resolution at the output of each stage.
    pub stage_resolutions: Vec<[usize; 2]>,

    /// Input channel count of each stage's patch embedding.
    pub stage_inputs: Vec<usize>,
}

impl MitBackboneConfig {
    /// The MiT-B0 preset.
    #[must_use]
    pub fn mit_b0(input_resolution: [usize; 2]) -> Self {
        Self::preset(input_resolution, &[32, 64, 160, 256], &[2, 2, 2, 2])
    }

    /// The MiT-B1 preset.
    #[must_use]
    pub fn mit_b1(input_resolution: [usize; 2]) -> Self {
        Self::preset(input_resolution, &[64, 128, 320, 512], &[2, 2, 2, 2])
    }

    /// The MiT-B2 preset.
    #[must_use]
    pub fn mit_b2(input_resolution: [usize; 2]) -> Self {
        Self::preset(input_resolution, &[64, 128, 320, 512], &[3, 4, 6, 3])
    }

    fn preset(
        input_resolution: [usize; 2],
        d_models: &[usize; 4],
        depths: &[usize; 4],
    ) -> Self {
        let num_heads = [1, 2, 5, 8];
        let sr_ratios = [8, 4, 2, 1];
        let patch_sizes = [7, 3, 3, 3];
        let strides = [4, 2, 2, 2];

        let stage_configs = (0..4)
            .map(|i| {
                StageConfig::new(d_models[i], depths[i], num_heads[i])
                    .with_sr_ratio(sr_ratios[i])
                    .with_patch_size(patch_sizes[i])
                    .with_stride(strides[i])
            })
            .collect();

        Self::new(input_resolution, 3, stage_configs)
    }

    /// Channel dimension sizes of the stage outputs, coarse to fine.
    #[must_use]
    pub fn embedding_dims(&self) -> Vec<usize> {
        self.stage_configs.iter().map(|s| s.d_model).collect()
    }

    /// Per-stage block depths.
    #[must_use]
    pub fn stage_depths(&self) -> Vec<usize> {
        self.stage_configs.iter().map(|s| s.depth).collect()
    }

    /// Validates the configuration and computes the construction plan.
    ///
    /// Checks every constraint the stage modules would panic on, so a full
    /// model config can be rejected with an error before any allocation.
    pub fn validate(&self) -> Result<MitBackbonePlan, String> {
        if self.stage_configs.is_empty() {
            return Err("Backbone requires at least one stage".to_string());
        }
        if self.drop_path_rate < 0.0 || self.drop_path_rate >= 1.0 {
            return Err(format!(
                "Drop path rate should be in [0, 1), but got {}",
                self.drop_path_rate
            ));
        }

        let mut stage_resolutions = Vec::with_capacity(self.stage_configs.len());
        let mut stage_inputs = Vec::with_capacity(self.stage_configs.len());

        let mut resolution = self.input_resolution;
        let mut d_in = self.d_input;

        for (idx, stage) in self.stage_configs.iter().enumerate() {
            if stage.depth == 0 {
                return Err(format!("Stage {} must have at least one block", idx));
            }
            if stage.num_heads == 0 || stage.d_model % stage.num_heads != 0 {
                return Err(format!(
                    "Stage {}: number of heads ({}) must evenly divide the model dimension ({})",
                    idx, stage.num_heads, stage.d_model
                ));
            }
            if stage.patch_size == 0 || stage.stride == 0 {
                return Err(format!(
                    "Stage {}: patch size ({}) and stride ({}) must be positive",
                    idx, stage.patch_size, stage.stride
                ));
            }

            let padding = stage.patch_size / 2;
            let out = [
                conv_output_size(resolution[0], stage.patch_size, stage.stride, padding),
                conv_output_size(resolution[1], stage.patch_size, stage.stride, padding),
            ];

            if out[0] != out[1] {
                return Err(format!(
                    "Stage {}: token grid {:?} must be square for the Mix-FFN",
                    idx, out
                ));
            }
            if stage.sr_ratio == 0 {
                return Err(format!("Stage {}: reduction ratio must be >= 1", idx));
            }
            if out[0] % stage.sr_ratio != 0 || out[1] % stage.sr_ratio != 0 {
                return Err(format!(
                    "Stage {}: token grid {:?} must be divisible by the reduction ratio {}",
                    idx, out, stage.sr_ratio
                ));
            }

            stage_resolutions.push(out);
            stage_inputs.push(d_in);

            resolution = out;
            d_in = stage.d_model;
        }

        Ok(MitBackbonePlan {
            stage_resolutions,
            stage_inputs,
        })
    }

    /// Initializes a new MitBackbone.
    ///
    /// ## Panics
    ///
    /// On any error reported by [`Self::validate`].
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> MitBackbone<B> {
        let plan = self.validate().unwrap();
        let rate_table = stage_rate_table(self.drop_path_rate, &self.stage_depths());

        let stages = self
            .stage_configs
            .iter()
            .enumerate()
            .map(|(idx, stage)| {
                let resolution = plan.stage_resolutions[idx];

                let embed = OverlapPatchEmbedConfig::new(
                    if idx == 0 {
                        self.input_resolution
                    } else {
                        plan.stage_resolutions[idx - 1]
                    },
                    stage.patch_size,
                    stage.stride,
                    plan.stage_inputs[idx],
                    stage.d_model,
                )
                .with_norm_epsilon(self.norm_epsilon)
                .init(device);

                let blocks = rate_table[idx]
                    .iter()
                    .map(|&rate| {
                        HierarchicalEncoderBlockConfig::new(
                            stage.d_model,
                            resolution,
                            stage.num_heads,
                        )
                        .with_sr_ratio(stage.sr_ratio)
                        .with_drop_path_rate(rate)
                        .with_norm_epsilon(self.norm_epsilon)
                        .init(device)
                    })
                    .collect();

                MitStage {
                    embed,
                    blocks,
                    norm: LayerNormConfig::new(stage.d_model)
                        .with_epsilon(self.norm_epsilon)
                        .init(device),
                }
            })
            .collect();

        MitBackbone { stages }
    }
}

/// One stage of a MiT backbone: patch embedding, a run of encoder blocks,
/// and a final normalization, re-gridded to a feature map.
#[derive(Module, Debug)]
pub struct MitStage<B: Backend> {
    /// Overlapping patch embedding; downsamples the feature map.
    pub embed: OverlapPatchEmbed<B>,

    /// Encoder blocks.
    pub blocks: Vec<HierarchicalEncoderBlock<B>>,

    /// Stage-final normalization.
    pub norm: LayerNorm<B>,
}

impl<B: Backend> MitStage<B> {
    /// Applies the forward pass on an input feature map.
    ///
    /// ## Arguments
    ///
    /// * `x` - Input tensor of shape (B, C_in, H, W).
    /// * `training` - Whether stochastic depth is active.
    ///
    /// ## Returns
    ///
    /// Output tensor of shape (B, C_out, H', W').
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        training: bool,
    ) -> Tensor<B, 4> {
        let [h, w] = self.embed.output_resolution();
        let c = self.embed.d_output();

        let mut x = self.embed.forward(x);
        for block in &self.blocks {
            x = block.forward(x, training);
        }
        let x = self.norm.forward(x);

        let [b, _, _] = x.dims();
        x.swap_dims(1, 2).reshape([b, c, h, w])
    }
}

/// MiT (Mix Transformer) backbone.
///
/// A pyramid of stages, each downsampling the feature map and widening the
/// channels; yields one feature map per stage, coarse to fine.
#[derive(Module, Debug)]
pub struct MitBackbone<B: Backend> {
    /// The stages, ordered coarse to fine.
    pub stages: Vec<MitStage<B>>,
}

impl<B: Backend> MitBackbone<B> {
    /// Channel dimension sizes of the stage outputs.
    #[must_use]
    pub fn embedding_dims(&self) -> Vec<usize> {
        self.stages.iter().map(|s| s.embed.d_output()).collect()
    }

    /// Applies the forward pass on an input image batch.
    ///
    /// ## Arguments
    ///
    /// * `x` - Input tensor of shape (B, C, H, W).
    /// * `training` - Whether stochastic depth is active.
    ///
    /// ## Returns
    ///
    /// One feature map per stage, highest resolution first.
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        training: bool,
    ) -> Vec<Tensor<B, 4>> {
        let mut features = Vec::with_capacity(self.stages.len());
        let mut x = x;
        for stage in &self.stages {
            x = stage.forward(x, training);
            features.push(x.clone());
        }
        features
    }
}
