use crate::candle_aux_layers::*;
use crate::candle_model_traits::*;
use candle_core::{Result, Tensor};
use candle_nn::{Activation, Linear, Module, VarBuilder};

/// What the last layer of a decoder maps to
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OutputActivation {
    /// logistic output in (0, 1), paired with the Bernoulli likelihood
    Sigmoid,
    /// unbounded output, paired with the Gaussian likelihood
    Identity,
}

pub struct MlpDecoder {
    n_features: usize,
    n_latent: usize,
    fc: StackLayers<Linear>,
    out: Linear,
    output_activation: OutputActivation,
}

impl DecoderModuleT for MlpDecoder {
    fn forward(&self, z_nk: &Tensor) -> Result<Tensor> {
        let h_nl = self.fc.forward(z_nk)?;
        let x_nd = self.out.forward(&h_nl)?;
        match self.output_activation {
            OutputActivation::Sigmoid => candle_nn::ops::sigmoid(&x_nd),
            OutputActivation::Identity => Ok(x_nd),
        }
    }

    fn dim_obs(&self) -> usize {
        self.n_features
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }
}

impl MlpDecoder {
    /// Will create a new decoder module with these variables:
    ///
    /// * `nn.dec.fc.{}.weight` where {} is the layer index
    /// * `nn.dec.out.weight`
    ///
    /// # Arguments
    /// * `n_latent` - input (latent) dimension
    /// * `n_features` - the number of output features
    /// * `layers` - fully connected layers, each with the dim
    /// * `output_activation` - last layer activation
    /// * `vs` - variable builder
    pub fn new(
        n_latent: usize,
        n_features: usize,
        layers: &[usize],
        output_activation: OutputActivation,
        vs: VarBuilder,
    ) -> Result<Self> {
        let (fc, prev_dim) = fc_stack(n_latent, layers, Activation::Relu, vs.pp("nn.dec"))?;
        let out = candle_nn::linear(prev_dim, n_features, vs.pp("nn.dec.out"))?;

        Ok(Self {
            n_features,
            n_latent,
            fc,
            out,
            output_activation,
        })
    }
}
