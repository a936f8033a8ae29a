//! Burn implementation of the DropPath (Stochastic Depth) regularization layer.
//!
//! Papers:
//! Deep Networks with Stochastic Depth (https://arxiv.org/abs/1603.09382)
//!
//! During training, the entire residual-branch output of a sample is zeroed
//! with probability `drop_prob`, and surviving samples are rescaled by
//! `1 / (1 - drop_prob)` to keep the expected value unchanged. At inference
//! the layer is the identity.
//!
//! Training-vs-inference is an explicit argument to every forward call,
//! rather than ambient backend mode state, so both behaviors are directly
//! testable.
use burn::config::Config;
use burn::module::Module;
use burn::prelude::{Backend, Tensor};
use burn::tensor::Distribution;

/// Checks that a drop probability lies in `[0, 1)`.
#[inline(always)]
fn check_probability(prob: f64) -> f64 {
    if !(0.0..1.0).contains(&prob) {
        panic!("Drop probability should be in [0, 1), but got {}", prob);
    }
    prob
}

/// DropPath (stochastic depth) regularization.
///
/// ## Arguments
///
/// * `x`: Input tensor.
/// * `drop_prob`: Probability of dropping a sample's branch output.
/// * `training`: Whether the model is in training mode.
/// * `scale_by_keep`: Whether to scale survivors by `1 / (1 - drop_prob)`.
///
/// ## Returns
///
/// * Output tensor with the same shape as the input tensor.
#[must_use]
pub fn drop_path<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    drop_prob: f64,
    training: bool,
    scale_by_keep: bool,
) -> Tensor<B, D> {
    _drop_path_sample(
        x,
        drop_prob,
        training,
        scale_by_keep,
        |shape, keep_prob, device| {
            Tensor::<B, D>::random(shape, Distribution::Bernoulli(keep_prob), device)
        },
    )
}

/// Internal implementation of DropPath.
///
/// Deferred to a separate function to allow for testing sampling.
///
/// The keep-decision is drawn per sample (the batch dimension) and broadcast
/// across all non-batch dimensions.
#[inline(always)]
#[must_use]
fn _drop_path_sample<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    drop_prob: f64,
    training: bool,
    scale_by_keep: bool,
    sample: fn([usize; D], f64, &B::Device) -> Tensor<B, D>,
) -> Tensor<B, D> {
    check_probability(drop_prob);

    if !training || drop_prob == 0.0 {
        return x;
    }

    let keep_prob = 1.0 - drop_prob;

    let mut shape = [1; D];
    shape[0] = x.dims()[0];

    let random_tensor = sample(shape, keep_prob, &x.device());

    let random_tensor = if scale_by_keep {
        random_tensor.div_scalar(keep_prob)
    } else {
        random_tensor
    };

    x * random_tensor
}

/// Common introspection interface for DropPath modules.
pub trait DropPathMeta {
    /// Probability of dropping a sample's branch output.
    fn drop_prob(&self) -> f64;

    /// Probability of keeping a sample's branch output.
    fn keep_prob(&self) -> f64 {
        1.0 - self.drop_prob()
    }

    /// Whether survivors are rescaled by `1 / keep_prob`.
    fn scale_by_keep(&self) -> bool;
}

/// Configuration for the DropPath module.
#[derive(Config, Debug)]
pub struct DropPathConfig {
    /// Probability of dropping a sample's branch output; must be in `[0, 1)`.
    #[config(default = 0.0)]
    pub drop_prob: f64,

    /// Whether survivors are rescaled by `1 / keep_prob`.
    #[config(default = true)]
    pub scale_by_keep: bool,
}

impl DropPathMeta for DropPathConfig {
    fn drop_prob(&self) -> f64 {
        self.drop_prob
    }

    fn scale_by_keep(&self) -> bool {
        self.scale_by_keep
    }
}

impl DropPathConfig {
    /// Initializes a new DropPath module.
    ///
    /// ## Panics
    ///
    /// If `drop_prob` lies outside `[0, 1)`.
    #[inline(always)]
    #[must_use]
    pub fn init(&self) -> DropPath {
        DropPath {
            drop_prob: check_probability(self.drop_prob),
            scale_by_keep: self.scale_by_keep,
        }
    }
}

/// The DropPath module.
#[derive(Module, Clone, Debug)]
pub struct DropPath {
    /// Probability of dropping a sample's branch output.
    pub drop_prob: f64,

    /// Whether survivors are rescaled by `1 / keep_prob`.
    pub scale_by_keep: bool,
}

impl DropPathMeta for DropPath {
    fn drop_prob(&self) -> f64 {
        self.drop_prob
    }

    fn scale_by_keep(&self) -> bool {
        self.scale_by_keep
    }
}

impl DropPath {
    /// Applies the forward pass on the input tensor.
    ///
    /// Identity when `training` is false.
    ///
    /// # Shapes
    ///
    /// - input: `[batch, ..., any]`
    /// - output: `[batch, ..., any]`
    #[must_use]
    pub fn forward<B: Backend, const D: usize>(
        &self,
        input: Tensor<B, D>,
        training: bool,
    ) -> Tensor<B, D> {
        drop_path(input, self.drop_prob, training, self.scale_by_keep)
    }

    /// Applies an inner function under a stochastic residual/depth-skip connection.
    ///
    /// Computes `x + DropPath(f(x))`.
    #[inline]
    #[must_use]
    pub fn with_skip<B: Backend, const D: usize, F>(
        &self,
        x: Tensor<B, D>,
        training: bool,
        f: F,
    ) -> Tensor<B, D>
    where
        F: FnOnce(Tensor<B, D>) -> Tensor<B, D>,
    {
        x.clone() + self.forward(f(x), training)
    }
}
