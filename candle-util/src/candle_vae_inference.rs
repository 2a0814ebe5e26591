#![allow(dead_code)]

use crate::candle_data_loader::*;
use crate::candle_inference::TrainConfig;
use crate::candle_loss_functions::gaussian_kl_loss;
use crate::candle_model_traits::{DecoderModuleT, EncoderModuleT};
use crate::candle_noise::NoiseSource;

use candle_core::{Result, Tensor};
use candle_nn::AdamW;
use candle_nn::Optimizer;
use log::info;

/// An unconditional VAE built from borrowed modules
pub struct Vae<'a, Enc, Dec>
where
    Enc: EncoderModuleT,
    Dec: DecoderModuleT,
{
    pub encoder: &'a Enc,
    pub decoder: &'a Dec,
}

pub trait VaeT<'a, Enc, Dec>
where
    Enc: EncoderModuleT,
    Dec: DecoderModuleT,
{
    /// Per-sample negative ELBO, `KL - llik`
    ///
    /// * `x_nd` - data
    /// * `llik` - fn (observed, reconstruction) -> log-likelihood
    /// * `noise` - source of the reparameterization noise
    /// * `train` - sample `z` or use the posterior mean
    fn negative_elbo<LlikFn>(
        &self,
        x_nd: &Tensor,
        llik: &LlikFn,
        noise: &mut dyn NoiseSource,
        train: bool,
    ) -> Result<Tensor>
    where
        LlikFn: Fn(&Tensor, &Tensor) -> Result<Tensor>;

    /// One pass over the (already shuffled) minibatches of `data`
    ///
    /// # Returns the mean loss per minibatch
    fn train_epoch<DataL, LlikFn>(
        &self,
        data: &DataL,
        llik: &LlikFn,
        optimizer: &mut AdamW,
        noise: &mut dyn NoiseSource,
        train_config: &TrainConfig,
    ) -> anyhow::Result<f32>
    where
        DataL: DataLoader,
        LlikFn: Fn(&Tensor, &Tensor) -> Result<Tensor>;

    /// Mean negative ELBO of every sample, evaluated at the posterior mean
    fn evaluate_loss<DataL, LlikFn>(
        &self,
        data: &DataL,
        llik: &LlikFn,
        noise: &mut dyn NoiseSource,
        train_config: &TrainConfig,
    ) -> anyhow::Result<f32>
    where
        DataL: DataLoader,
        LlikFn: Fn(&Tensor, &Tensor) -> Result<Tensor>;

    /// Build a VAE model
    /// * `encoder` - encoder module
    /// * `decoder` - decoder module
    fn build(encoder: &'a Enc, decoder: &'a Dec) -> anyhow::Result<Self>
    where
        Self: Sized;
}

impl<'a, Enc, Dec> VaeT<'a, Enc, Dec> for Vae<'a, Enc, Dec>
where
    Enc: EncoderModuleT,
    Dec: DecoderModuleT,
{
    fn negative_elbo<LlikFn>(
        &self,
        x_nd: &Tensor,
        llik: &LlikFn,
        noise: &mut dyn NoiseSource,
        train: bool,
    ) -> Result<Tensor>
    where
        LlikFn: Fn(&Tensor, &Tensor) -> Result<Tensor>,
    {
        let latent = self.encoder.forward_t(x_nd, noise, train)?;
        let kl_n = gaussian_kl_loss(&latent.mu, &latent.lnvar)?;
        let (_, llik_n) = self.decoder.forward_with_llik(&latent.z, x_nd, llik)?;
        kl_n - llik_n
    }

    fn train_epoch<DataL, LlikFn>(
        &self,
        data: &DataL,
        llik: &LlikFn,
        optimizer: &mut AdamW,
        noise: &mut dyn NoiseSource,
        train_config: &TrainConfig,
    ) -> anyhow::Result<f32>
    where
        DataL: DataLoader,
        LlikFn: Fn(&Tensor, &Tensor) -> Result<Tensor>,
    {
        let device = &train_config.device;
        let num_minibatches = data.num_minibatch();
        if num_minibatches == 0 {
            return Err(anyhow::anyhow!("need to shuffle data"));
        }

        let mut loss_tot = 0f32;
        for b in 0..num_minibatches {
            let x_nd = data.minibatch_data(b, device)?.input;
            let loss = self.negative_elbo(&x_nd, llik, noise, true)?.mean_all()?;
            optimizer.backward_step(&loss)?;
            loss_tot += loss.to_scalar::<f32>()?;
        }

        let loss = loss_tot / num_minibatches as f32;
        if train_config.verbose {
            info!("vae loss: {}", loss);
        }
        Ok(loss)
    }

    fn evaluate_loss<DataL, LlikFn>(
        &self,
        data: &DataL,
        llik: &LlikFn,
        noise: &mut dyn NoiseSource,
        train_config: &TrainConfig,
    ) -> anyhow::Result<f32>
    where
        DataL: DataLoader,
        LlikFn: Fn(&Tensor, &Tensor) -> Result<Tensor>,
    {
        let x_nd = data.full_data(&train_config.device)?.input;
        let loss = self.negative_elbo(&x_nd, llik, noise, false)?.mean_all()?;
        Ok(loss.to_scalar::<f32>()?)
    }

    fn build(encoder: &'a Enc, decoder: &'a Dec) -> anyhow::Result<Self> {
        if encoder.dim_latent() != decoder.dim_latent() || encoder.dim_obs() != decoder.dim_obs() {
            return Err(anyhow::anyhow!(
                "encoder {} -> {} vs. decoder {} -> {}",
                encoder.dim_obs(),
                encoder.dim_latent(),
                decoder.dim_latent(),
                decoder.dim_obs()
            ));
        }

        Ok(Self { encoder, decoder })
    }
}
