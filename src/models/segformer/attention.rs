use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::prelude::{Backend, Tensor};
use burn::tensor::activation::softmax;

/// Common introspection interface for SequenceReduction.
pub trait SequenceReductionMeta {
    /// Get the channel dimension size.
    fn d_model(&self) -> usize;

    /// Get the input resolution.
    fn input_resolution(&self) -> [usize; 2];

    /// Get the reduction ratio.
    fn ratio(&self) -> usize;

    /// Get the output resolution.
    fn output_resolution(&self) -> [usize; 2] {
        let [h, w] = self.input_resolution();
        let r = self.ratio();
        [h / r, w / r]
    }

    /// Get the output sequence length.
    fn output_len(&self) -> usize {
        let [h, w] = self.output_resolution();
        h * w
    }
}

/// Configuration for the SequenceReduction module.
#[derive(Config, Debug)]
pub struct SequenceReductionConfig {
    /// Channel dimension size.
    pub d_model: usize,

    /// Input resolution (height, width).
    pub input_resolution: [usize; 2],

    /// Reduction ratio; the sequence length shrinks by `ratio * ratio`.
    pub ratio: usize,

    /// Epsilon of the normalization applied after reduction.
    #[config(default = 1e-6)]
    pub norm_epsilon: f64,
}

impl SequenceReductionMeta for SequenceReductionConfig {
    fn d_model(&self) -> usize {
        self.d_model
    }

    fn input_resolution(&self) -> [usize; 2] {
        self.input_resolution
    }

    fn ratio(&self) -> usize {
        self.ratio
    }
}

impl SequenceReductionConfig {
    /// Initializes a new SequenceReduction module.
    ///
    /// ## Panics
    ///
    /// If `ratio < 2` (a ratio of 1 is the identity and needs no module),
    /// or if the input resolution is not divisible by the ratio.
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> SequenceReduction<B> {
        assert!(
            self.ratio >= 2,
            "Sequence reduction ratio must be >= 2, but got {}",
            self.ratio
        );
        let [h, w] = self.input_resolution;
        assert!(
            h % self.ratio == 0 && w % self.ratio == 0,
            "Input resolution {:?} must be divisible by the reduction ratio: {}",
            self.input_resolution,
            self.ratio
        );

        SequenceReduction {
            input_resolution: self.input_resolution,
            ratio: self.ratio,
            conv: Conv2dConfig::new([self.d_model, self.d_model], [self.ratio, self.ratio])
                .with_stride([self.ratio, self.ratio])
                .init(device),
            norm: LayerNormConfig::new(self.d_model)
                .with_epsilon(self.norm_epsilon)
                .init(device),
        }
    }
}

/// Strided reduction of a token sequence.
///
/// Reinterprets a ``(B, H * W, C)`` sequence as a ``(B, H, W, C)`` grid,
/// applies a kernel-`r` / stride-`r` convolution, flattens back to a
/// ``(B, (H/r) * (W/r), C)`` sequence, and layer-normalizes the channels.
///
/// Used to bound attention cost: keys/values computed on the reduced
/// sequence shrink the score matrix by a factor of `r * r`.
#[derive(Module, Debug)]
pub struct SequenceReduction<B: Backend> {
    /// Input resolution (height, width).
    pub input_resolution: [usize; 2],

    /// Reduction ratio.
    pub ratio: usize,

    /// Strided reduction convolution.
    pub conv: Conv2d<B>,

    /// Post-reduction normalization.
    pub norm: LayerNorm<B>,
}

impl<B: Backend> SequenceReductionMeta for SequenceReduction<B> {
    fn d_model(&self) -> usize {
        self.conv.weight.dims()[0]
    }

    fn input_resolution(&self) -> [usize; 2] {
        self.input_resolution
    }

    fn ratio(&self) -> usize {
        self.ratio
    }
}

impl<B: Backend> SequenceReduction<B> {
    /// Applies the reduction to the input sequence.
    ///
    /// ## Arguments
    ///
    /// * `x` - Input tensor of shape (B, H * W, C).
    ///
    /// ## Returns
    ///
    /// Output tensor of shape (B, (H/r) * (W/r), C).
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
    ) -> Tensor<B, 3> {
        let [h, w] = self.input_resolution;
        let [b, n, c] = x.dims();
        assert_eq!(
            n,
            h * w,
            "Expected input shape (B, H ({}) * W ({}), C), but got {:?}",
            h,
            w,
            x.dims()
        );

        let x = x.reshape([b, h, w, c]).permute([0, 3, 1, 2]);
        // b, c, h, w

        let x = self.conv.forward(x);
        // b, c, h/r, w/r

        let x = x.flatten::<3>(2, 3).swap_dims(1, 2);
        // b, (h/r)*(w/r), c

        self.norm.forward(x)
    }
}

/// Common introspection interface for EfficientAttention.
pub trait EfficientAttentionMeta {
    /// Get the channel dimension size.
    fn d_model(&self) -> usize;

    /// Get the input resolution.
    fn input_resolution(&self) -> [usize; 2];

    /// Get the number of attention heads.
    fn num_heads(&self) -> usize;

    /// Get the per-head channel dimension size.
    fn d_head(&self) -> usize {
        self.d_model() / self.num_heads()
    }

    /// Get the sequence reduction ratio; 1 means no reduction.
    fn sr_ratio(&self) -> usize;

    /// Get the key/value sequence length.
    fn kv_len(&self) -> usize {
        let [h, w] = self.input_resolution();
        let r = self.sr_ratio();
        (h / r) * (w / r)
    }
}

/// Configuration for the EfficientAttention module.
#[derive(Config, Debug)]
pub struct EfficientAttentionConfig {
    /// Channel dimension size; must be divisible by `num_heads`.
    pub d_model: usize,

    /// Input resolution (height, width).
    pub input_resolution: [usize; 2],

    /// Number of attention heads.
    pub num_heads: usize,

    /// Sequence reduction ratio for keys/values; 1 disables reduction.
    #[config(default = 1)]
    pub sr_ratio: usize,

    /// Epsilon of the post-reduction normalization.
    #[config(default = 1e-6)]
    pub norm_epsilon: f64,
}

impl EfficientAttentionMeta for EfficientAttentionConfig {
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
}

impl EfficientAttentionConfig {
    /// Initializes a new EfficientAttention module.
    ///
    /// ## Panics
    ///
    /// If `num_heads` does not evenly divide `d_model`, if `sr_ratio` is 0,
    /// or if the input resolution is not divisible by `sr_ratio`.
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> EfficientAttention<B> {
        assert!(
            self.num_heads > 0 && self.d_model % self.num_heads == 0,
            "Number of heads ({}) must evenly divide the model dimension ({})",
            self.num_heads,
            self.d_model
        );
        assert!(
            self.sr_ratio >= 1,
            "Sequence reduction ratio must be >= 1, but got {}",
            self.sr_ratio
        );

        let reduction = if self.sr_ratio > 1 {
            Some(
                SequenceReductionConfig::new(self.d_model, self.input_resolution, self.sr_ratio)
                    .with_norm_epsilon(self.norm_epsilon)
                    .init(device),
            )
        } else {
            None
        };

        EfficientAttention {
            input_resolution: self.input_resolution,
            num_heads: self.num_heads,
            query: LinearConfig::new(self.d_model, self.d_model).init(device),
            key_value: LinearConfig::new(self.d_model, 2 * self.d_model).init(device),
            proj: LinearConfig::new(self.d_model, self.d_model).init(device),
            reduction,
        }
    }
}

/// Multi-head self-attention with sequence-length reduction.
///
/// Queries are computed from the full sequence; keys and values from the
/// (possibly reduced) sequence. The output length therefore always equals
/// the input length, whatever the reduction ratio.
#[derive(Module, Debug)]
pub struct EfficientAttention<B: Backend> {
    /// Input resolution (height, width).
    pub input_resolution: [usize; 2],

    /// Number of attention heads.
    pub num_heads: usize,

    /// Query projection.
    pub query: Linear<B>,

    /// Combined key/value projection.
    pub key_value: Linear<B>,

    /// Output projection.
    pub proj: Linear<B>,

    /// Key/value sequence reduction; `None` when the ratio is 1.
    pub reduction: Option<SequenceReduction<B>>,
}

impl<B: Backend> EfficientAttentionMeta for EfficientAttention<B> {
    fn d_model(&self) -> usize {
        self.query.weight.dims()[0]
    }

    fn input_resolution(&self) -> [usize; 2] {
        self.input_resolution
    }

    fn num_heads(&self) -> usize {
        self.num_heads
    }

    fn sr_ratio(&self) -> usize {
        self.reduction.as_ref().map_or(1, |r| r.ratio)
    }
}

impl<B: Backend> EfficientAttention<B> {
    /// Applies the forward pass on the input sequence.
    ///
    /// ## Arguments
    ///
    /// * `x` - Input tensor of shape (B, H * W, C).
    ///
    /// ## Returns
    ///
    /// Output tensor of shape (B, H * W, C).
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
    ) -> Tensor<B, 3> {
        let [h, w] = self.input_resolution;
        let [b, n, c] = x.dims();
        assert_eq!(
            n,
            h * w,
            "Expected input shape (B, H ({}) * W ({}), C), but got {:?}",
            h,
            w,
            x.dims()
        );

        let d_head = c / self.num_heads;

        let q = self
            .query
            .forward(x.clone())
            .reshape([b, n, self.num_heads, d_head])
            .swap_dims(1, 2);
        // b, num_heads, n, d_head

        let reduced = match &self.reduction {
            Some(reduction) => reduction.forward(x),
            None => x,
        };
        let n_kv = reduced.dims()[1];

        let kv = self.key_value.forward(reduced);
        // b, n_kv, 2 * c

        let mut kv = kv.split_with_sizes(vec![c, c], 2);
        let v = kv
            .pop()
            .unwrap()
            .reshape([b, n_kv, self.num_heads, d_head])
            .swap_dims(1, 2);
        let k = kv
            .pop()
            .unwrap()
            .reshape([b, n_kv, self.num_heads, d_head])
            .swap_dims(1, 2);
        // b, num_heads, n_kv, d_head

        let attn = self.attention(q, k);
        // b, num_heads, n, n_kv

        let x = attn.matmul(v);
        // b, num_heads, n, d_head

        let x = x.swap_dims(1, 2).reshape([b, n, c]);
        // b, n, c

        self.proj.forward(x)
    }

    /// Computes the attention weights.
    ///
    /// Scores are scaled by `1 / sqrt(d_head)` and normalized with a softmax
    /// over the key axis.
    ///
    /// ## Arguments
    ///
    /// - `q`: Query tensor of shape (B, num_heads, N, d_head).
    /// - `k`: Key tensor of shape (B, num_heads, N_kv, d_head).
    ///
    /// ## Returns
    ///
    /// Attention weight tensor of shape (B, num_heads, N, N_kv); each row
    /// sums to 1.
    fn attention(
        &self,
        q: Tensor<B, 4>,
        k: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let d_head = q.dims()[3];

        let scores = q
            .matmul(k.swap_dims(2, 3))
            .div_scalar((d_head as f64).sqrt());
        // b, num_heads, n, n_kv

        softmax(scores, 3)
    }
}
