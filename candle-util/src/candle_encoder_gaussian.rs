use crate::candle_aux_layers::*;
use crate::candle_model_traits::*;
use crate::candle_noise::NoiseSource;
use candle_core::{Result, Tensor};
use candle_nn::{Activation, Linear, Module, VarBuilder};

///
/// z = mu + sigma * eps
/// where eps ~ N(0, 1) is drawn from `noise`
///
/// # Arguments
/// * `z_mean` - mean of Gaussian distribution
/// * `z_lnvar` - log variance of Gaussian distribution
/// * `noise` - source of `eps`
pub fn reparameterize(
    z_mean: &Tensor,
    z_lnvar: &Tensor,
    noise: &mut dyn NoiseSource,
) -> Result<Tensor> {
    let eps = noise.standard_normal_like(z_mean)?;
    z_mean + (z_lnvar * 0.5)?.exp()? * eps
}

/// Bounds on the encoder's log variance, keeping `exp(lnvar)` finite
pub const LNVAR_MIN: f64 = -8.;
pub const LNVAR_MAX: f64 = 8.;

pub struct GaussianEncoder {
    n_features: usize,
    n_latent: usize,
    fc: StackLayers<Linear>,
    z_mean: Linear,
    z_lnvar: Linear,
}

impl EncoderModuleT for GaussianEncoder {
    fn forward_t(
        &self,
        x_nd: &Tensor,
        noise: &mut dyn NoiseSource,
        train: bool,
    ) -> Result<LatentSample> {
        let (mu, lnvar) = self.latent_gaussian_params(x_nd)?;
        let z = if train {
            reparameterize(&mu, &lnvar, noise)?
        } else {
            mu.clone()
        };
        Ok(LatentSample { z, mu, lnvar })
    }

    fn dim_obs(&self) -> usize {
        self.n_features
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }
}

impl GaussianEncoder {
    ///
    /// Evaluate latent Gaussian parameters: mu and log_var
    /// z ~ (mu(x), log_var(x))
    pub fn latent_gaussian_params(&self, x_nd: &Tensor) -> Result<(Tensor, Tensor)> {
        let h_nl = self.fc.forward(x_nd)?;
        let z_mean_nk = self.z_mean.forward(&h_nl)?;
        let z_lnvar_nk = self.z_lnvar.forward(&h_nl)?.clamp(LNVAR_MIN, LNVAR_MAX)?;
        Ok((z_mean_nk, z_lnvar_nk))
    }

    /// Will create a new Gaussian encoder module
    /// with these variables:
    ///
    /// * `nn.enc.fc.{}.weight` where {} is the layer index
    /// * `nn.enc.z.mean.weight`
    /// * `nn.enc.z.lnvar.weight`
    ///
    /// # Arguments
    /// * `n_features` - the number of input features
    /// * `n_latent` - the dimension of latent states
    /// * `layers` - fully connected layers, each with the dim
    /// * `vs` - variable builder
    pub fn new(n_features: usize, n_latent: usize, layers: &[usize], vs: VarBuilder) -> Result<Self> {
        // (1) data -> fc
        let (fc, prev_dim) = fc_stack(n_features, layers, Activation::Relu, vs.pp("nn.enc"))?;

        // (2) fc -> K
        let z_mean = candle_nn::linear(prev_dim, n_latent, vs.pp("nn.enc.z.mean"))?;
        let z_lnvar = candle_nn::linear(prev_dim, n_latent, vs.pp("nn.enc.z.lnvar"))?;

        Ok(Self {
            n_features,
            n_latent,
            fc,
            z_mean,
            z_lnvar,
        })
    }
}
