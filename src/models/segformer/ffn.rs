use crate::compat::dims::checked_square_side;
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Gelu, Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::{Backend, Tensor};

/// Common introspection interface for MixFfn.
pub trait MixFfnMeta {
    /// Get the input/output channel dimension size.
    fn d_model(&self) -> usize;

    /// Get the hidden channel dimension size.
    fn d_hidden(&self) -> usize;
}

/// Configuration for the MixFfn module.
#[derive(Config, Debug)]
pub struct MixFfnConfig {
    /// Input/output channel dimension size.
    pub d_model: usize,

    /// Hidden channel dimension size; defaults to `4 * d_model`.
    #[config(default = "None")]
    pub d_hidden: Option<usize>,
}

impl MixFfnMeta for MixFfnConfig {
    fn d_model(&self) -> usize {
        self.d_model
    }

    fn d_hidden(&self) -> usize {
        self.d_hidden.unwrap_or(4 * self.d_model)
    }
}

impl MixFfnConfig {
    /// Initializes a new MixFfn module.
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> MixFfn<B> {
        let d_model = self.d_model();
        let d_hidden = self.d_hidden();

        MixFfn {
            fc1: LinearConfig::new(d_model, d_hidden).init(device),
            dwconv: Conv2dConfig::new([d_hidden, d_hidden], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_groups(d_hidden)
                .init(device),
            act: Gelu::new(),
            fc2: LinearConfig::new(d_hidden, d_model).init(device),
        }
    }
}

/// Mix-FFN: a position-wise feed-forward sub-block with a depthwise
/// convolution between its two linear projections.
///
/// Pure sequence attention has no notion of 2-D adjacency; the depthwise
/// 3x3 convolution over the re-gridded sequence reintroduces local spatial
/// mixing.
#[derive(Module, Debug)]
pub struct MixFfn<B: Backend> {
    /// Channel expansion.
    pub fc1: Linear<B>,

    /// Depthwise 3x3 convolution over the token grid.
    pub dwconv: Conv2d<B>,

    /// GELU nonlinearity.
    pub act: Gelu,

    /// Channel restoration.
    pub fc2: Linear<B>,
}

impl<B: Backend> MixFfnMeta for MixFfn<B> {
    fn d_model(&self) -> usize {
        self.fc1.weight.dims()[0]
    }

    fn d_hidden(&self) -> usize {
        self.fc1.weight.dims()[1]
    }
}

impl<B: Backend> MixFfn<B> {
    /// Applies the forward pass on the input sequence.
    ///
    /// The spatial side is recomputed from the current tensor's sequence
    /// length, which must be a perfect square.
    ///
    /// ## Arguments
    ///
    /// * `x` - Input tensor of shape (B, N, C), N a perfect square.
    ///
    /// ## Returns
    ///
    /// Output tensor of shape (B, N, C).
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
    ) -> Tensor<B, 3> {
        let [b, n, _] = x.dims();
        let side = checked_square_side(n);

        let x = self.fc1.forward(x);
        let d_hidden = x.dims()[2];
        // b, n, d_hidden

        // Re-grid the sequence so the depthwise conv sees 2-D neighborhoods.
        let x = x.reshape([b, side, side, d_hidden]).permute([0, 3, 1, 2]);
        // b, d_hidden, side, side

        let x = self.dwconv.forward(x);

        let x = x.permute([0, 2, 3, 1]).reshape([b, n, d_hidden]);
        // b, n, d_hidden

        let x = self.act.forward(x);

        self.fc2.forward(x)
        // b, n, d_model
    }
}
