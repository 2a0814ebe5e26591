#![allow(dead_code)]

use crate::candle_noise::NoiseSource;
use candle_core::{Result, Tensor};

/// Latent sample `z` with the diagonal Gaussian posterior it was
/// drawn from
pub struct LatentSample {
    pub z: Tensor,
    pub mu: Tensor,
    pub lnvar: Tensor,
}

pub trait EncoderModuleT {
    /// An encoder that spits out a latent sample
    ///
    /// # Arguments
    /// * `x_nd` - input data (n x d)
    /// * `noise` - source of `eps` for the reparameterization
    /// * `train` - sample `z` (true) or take the posterior mean (false)
    ///
    /// # Returns `LatentSample` with `z_nk`, `mu_nk`, `lnvar_nk`
    fn forward_t(
        &self,
        x_nd: &Tensor,
        noise: &mut dyn NoiseSource,
        train: bool,
    ) -> Result<LatentSample>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}

pub trait DecoderModuleT {
    /// A decoder that spits out reconstruction
    fn forward(&self, z_nk: &Tensor) -> Result<Tensor>;

    /// A decoder that spits out reconstruction and log-likelihood
    /// * `z_nk` - latent states
    /// * `x_nd` - observed data to validate with
    /// * `llik` - fn (observed, reconstruction) -> log-likelihood
    fn forward_with_llik<LlikFn>(
        &self,
        z_nk: &Tensor,
        x_nd: &Tensor,
        llik: &LlikFn,
    ) -> Result<(Tensor, Tensor)>
    where
        LlikFn: Fn(&Tensor, &Tensor) -> Result<Tensor>,
    {
        let recon_nd = self.forward(z_nk)?;
        let llik_n = llik(x_nd, &recon_nd)?;
        Ok((recon_nd, llik_n))
    }

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}

pub trait ClassifierModuleT {
    /// Unnormalized class scores (n x K)
    fn logits(&self, x_nd: &Tensor) -> Result<Tensor>;

    /// Posterior over classes; each row sums to one
    fn predict_proba(&self, x_nd: &Tensor) -> Result<Tensor> {
        candle_nn::ops::softmax(&self.logits(x_nd)?, 1)
    }

    /// Most probable class index of each row (u32)
    fn predict(&self, x_nd: &Tensor) -> Result<Tensor> {
        self.logits(x_nd)?.argmax(1)
    }

    fn num_classes(&self) -> usize;
}

/// A generative model of `x` conditioned on a one-hot label `y`
pub trait ConditionalGenerativeT {
    /// # Returns `(recon_nd, latent)`
    fn forward_t(
        &self,
        x_nd: &Tensor,
        y_nk: &Tensor,
        noise: &mut dyn NoiseSource,
        train: bool,
    ) -> Result<(Tensor, LatentSample)>;

    fn num_classes(&self) -> usize;
}
