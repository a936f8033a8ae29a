use crate::layers::drop::{DropPath, DropPathConfig};
use crate::models::segformer::attention::{
    EfficientAttention, EfficientAttentionConfig, EfficientAttentionMeta,
};
use crate::models::segformer::ffn::{MixFfn, MixFfnConfig, MixFfnMeta};
use burn::config::Config;
use burn::module::Module;
use burn::nn::{LayerNorm, LayerNormConfig};
use burn::prelude::{Backend, Tensor};

/// Common introspection interface for HierarchicalEncoderBlock.
pub trait HierarchicalEncoderBlockMeta {
    /// Get the channel dimension size.
    fn d_model(&self) -> usize;

    /// Get the input resolution.
    fn input_resolution(&self) -> [usize; 2];

    /// Get the input height.
    fn input_height(&self) -> usize {
        self.input_resolution()[0]
    }

    /// Get the input width.
    fn input_width(&self) -> usize {
        self.input_resolution()[1]
    }

    /// Get the number of attention heads.
    fn num_heads(&self) -> usize;

    /// Get the sequence reduction ratio.
    fn sr_ratio(&self) -> usize;

    /// Get the hidden dimension of the Mix-FFN.
    fn d_hidden(&self) -> usize;

    /// Get the stochastic depth rate.
    fn drop_path_rate(&self) -> f64;
}

/// Configuration for HierarchicalEncoderBlock.
#[derive(Config, Debug)]
pub struct HierarchicalEncoderBlockConfig {
    /// Channel dimension size; the residual additions require input and
    /// output dimensionality to be equal.
    pub d_model: usize,

    /// Input resolution (height, width); fixed for the block's lifetime.
    pub input_resolution: [usize; 2],

    /// Number of attention heads.
    pub num_heads: usize,

    /// Sequence reduction ratio for attention keys/values.
    #[config(default = 1)]
    pub sr_ratio: usize,

    /// Hidden dimension of the Mix-FFN; defaults to `4 * d_model`.
    #[config(default = "None")]
    pub d_hidden: Option<usize>,

    /// Stochastic depth rate; must be in `[0, 1)`.
    #[config(default = 0.0)]
    pub drop_path_rate: f64,

    /// Epsilon for the layer normalizations.
    #[config(default = 1e-6)]
    pub norm_epsilon: f64,
}

impl HierarchicalEncoderBlockMeta for HierarchicalEncoderBlockConfig {
    fn d_model(&self) -> usize {
        self.d_model
    }

    fn input_resolution(&self) -> [usize; 2] {
        self.input_resolution
    }

    fn num_heads(&self) -> usize {
        self.num_heads
    }

    fn sr_ratio(&self) -> usize {
        self.sr_ratio
    }

    fn d_hidden(&self) -> usize {
        self.d_hidden.unwrap_or(4 * self.d_model)
    }

    fn drop_path_rate(&self) -> f64 {
        self.drop_path_rate
    }
}

impl HierarchicalEncoderBlockConfig {
    /// Initializes a new HierarchicalEncoderBlock.
    ///
    /// ## Panics
    ///
    /// On configuration errors: `num_heads` not dividing `d_model`,
    /// `drop_path_rate` outside `[0, 1)`, a zero `sr_ratio`, a resolution
    /// indivisible by `sr_ratio`, or a non-positive `norm_epsilon`.
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> HierarchicalEncoderBlock<B> {
        assert!(
            self.norm_epsilon > 0.0,
            "Norm epsilon must be positive, but got {}",
            self.norm_epsilon
        );

        let attn = EfficientAttentionConfig::new(self.d_model, self.input_resolution, self.num_heads)
            .with_sr_ratio(self.sr_ratio)
            .with_norm_epsilon(self.norm_epsilon)
            .init(device);

        let ffn = MixFfnConfig::new(self.d_model)
            .with_d_hidden(Some(self.d_hidden()))
            .init(device);

        HierarchicalEncoderBlock {
            input_resolution: self.input_resolution,
            norm1: LayerNormConfig::new(self.d_model)
                .with_epsilon(self.norm_epsilon)
                .init(device),
            attn,
            norm2: LayerNormConfig::new(self.d_model)
                .with_epsilon(self.norm_epsilon)
                .init(device),
            ffn,
            drop_path: DropPathConfig::new()
                .with_drop_prob(self.drop_path_rate)
                .init(),
        }
    }
}

/// Hierarchical transformer encoder block.
///
/// Two residual sub-layers applied in order:
///
/// - Stage A: `x = x + DropPath(EfficientAttention(Norm1(x)))`
/// - Stage B: `x = x + DropPath(MixFfn(Norm2(x)))`
///
/// The block is a pure function of the input tensor, its parameters, and
/// the training flag; it keeps no state across calls.
#[derive(Module, Debug)]
pub struct HierarchicalEncoderBlock<B: Backend> {
    /// Input resolution (height, width).
    pub input_resolution: [usize; 2],

    /// Pre-attention normalization.
    pub norm1: LayerNorm<B>,

    /// Attention sub-layer.
    pub attn: EfficientAttention<B>,

    /// Pre-FFN normalization.
    pub norm2: LayerNorm<B>,

    /// Feed-forward sub-layer.
    pub ffn: MixFfn<B>,

    /// Stochastic depth on both residual branches.
    pub drop_path: DropPath,
}

impl<B: Backend> HierarchicalEncoderBlockMeta for HierarchicalEncoderBlock<B> {
    fn d_model(&self) -> usize {
        self.attn.d_model()
    }

    fn input_resolution(&self) -> [usize; 2] {
        self.input_resolution
    }

    fn num_heads(&self) -> usize {
        self.attn.num_heads()
    }

    fn sr_ratio(&self) -> usize {
        self.attn.sr_ratio()
    }

    fn d_hidden(&self) -> usize {
        self.ffn.d_hidden()
    }

    fn drop_path_rate(&self) -> f64 {
        self.drop_path.drop_prob
    }
}

impl<B: Backend> HierarchicalEncoderBlock<B> {
    /// Applies the forward pass on the input sequence.
    ///
    /// ## Arguments
    ///
    /// * `x` - Input tensor of shape (B, H * W, C).
    /// * `training` - Whether stochastic depth is active.
    ///
    /// ## Returns
    ///
    /// Output tensor of shape (B, H * W, C).
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        training: bool,
    ) -> Tensor<B, 3> {
        let [h, w] = self.input_resolution;
        let [_, l, _] = x.dims();
        assert_eq!(
            l,
            h * w,
            "Expected input shape (B, H ({}) * W ({}), C), but got {:?}",
            h,
            w,
            x.dims()
        );

        let x = self.drop_path.with_skip(x, training, |x| {
            self.attn.forward(self.norm1.forward(x))
        });

        self.drop_path.with_skip(x, training, |x| {
            self.ffn.forward(self.norm2.forward(x))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::nn::{Initializer, LinearConfig};
    use burn::tensor::Distribution;

    #[test]
    fn test_config() {
        let config = HierarchicalEncoderBlockConfig::new(64, [56, 56], 8);

        assert_eq!(config.d_model(), 64);
        assert_eq!(config.input_resolution(), [56, 56]);
        assert_eq!(config.input_height(), 56);
        assert_eq!(config.input_width(), 56);
        assert_eq!(config.num_heads(), 8);
        assert_eq!(config.sr_ratio(), 1);
        assert_eq!(config.d_hidden(), 256);
        assert_eq!(config.drop_path_rate(), 0.0);
        assert_eq!(config.norm_epsilon, 1e-6);
    }

    #[test]
    fn test_block_shape_invariance_with_reduction() {
        // (2, 3136, 64), 8 heads, reduction 4: output shape must equal
        // input shape even though keys/values shrink to length 196.
        let device = Default::default();
        let b = 2;
        let side = 56;
        let c = 64;

        let block = HierarchicalEncoderBlockConfig::new(c, [side, side], 8)
            .with_sr_ratio(4)
            .init::<NdArray>(&device);

        assert_eq!(block.sr_ratio(), 4);
        assert_eq!(block.attn.kv_len(), 196);

        let x = Tensor::<NdArray, 3>::random(
            [b, side * side, c],
            Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let y = block.forward(x, false);
        assert_eq!(y.dims(), [b, 3136, c]);
    }

    #[test]
    fn test_block_inference_determinism() {
        let device = Default::default();
        let b = 3;
        let side = 7;
        let c = 8;

        let block = HierarchicalEncoderBlockConfig::new(c, [side, side], 1)
            .with_drop_path_rate(0.5)
            .init::<NdArray>(&device);

        let x = Tensor::<NdArray, 3>::random(
            [b, side * side, c],
            Distribution::Normal(0.0, 1.0),
            &device,
        );

        // Stochastic depth is a no-op at inference.
        let first = block.forward(x.clone(), false);
        let second = block.forward(x, false);
        first.to_data().assert_eq(&second.to_data(), true);
        assert_eq!(first.dims(), [b, 49, c]);
    }

    #[test]
    fn test_block_residual_pass_through() {
        // With both branch output projections zeroed, the block reduces to
        // the residual connections: block(x) == x exactly.
        let device = Default::default();
        let side = 4;
        let c = 8;

        let mut block =
            HierarchicalEncoderBlockConfig::new(c, [side, side], 2).init::<NdArray>(&device);

        block.attn.proj = LinearConfig::new(c, c)
            .with_bias(false)
            .with_initializer(Initializer::Zeros)
            .init(&device);
        block.ffn.fc2 = LinearConfig::new(block.ffn.d_hidden(), c)
            .with_bias(false)
            .with_initializer(Initializer::Zeros)
            .init(&device);

        let x = Tensor::<NdArray, 3>::random(
            [2, side * side, c],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        let y = block.forward(x.clone(), false);
        y.to_data().assert_eq(&x.to_data(), true);
    }

    #[test]
    #[should_panic(expected = "Expected input shape (B, H (7) * W (7), C)")]
    fn test_block_rejects_drifted_resolution() {
        let device = Default::default();
        let block = HierarchicalEncoderBlockConfig::new(4, [7, 7], 1).init::<NdArray>(&device);

        // 50 tokens is neither 7 * 7 nor a perfect square.
        let x = Tensor::<NdArray, 3>::random([1, 50, 4], Distribution::Uniform(0.0, 1.0), &device);
        let _ = block.forward(x, false);
    }

    #[test]
    #[should_panic(expected = "Drop probability should be in [0, 1)")]
    fn test_block_rejects_bad_drop_rate() {
        let device = Default::default();
        let _ = HierarchicalEncoderBlockConfig::new(4, [4, 4], 1)
            .with_drop_path_rate(1.5)
            .init::<NdArray>(&device);
    }
}
