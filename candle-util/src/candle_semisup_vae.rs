use crate::candle_decoder_mlp::*;
use crate::candle_encoder_gaussian::*;
use crate::candle_model_traits::*;
use crate::candle_noise::NoiseSource;
use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

///
/// Label-conditioned VAE: the encoder reads `concat(x, y)` and the
/// decoder reads `concat(z, y)`, with a logistic output so that the
/// reconstruction is a Bernoulli mean.
///
pub struct ConditionalVae {
    n_features: usize,
    n_classes: usize,
    encoder: GaussianEncoder,
    decoder: MlpDecoder,
}

impl ConditionalVae {
    /// Variables live under `nn.enc` and `nn.dec` of `vs`
    ///
    /// # Arguments
    /// * `n_features` - data dimension
    /// * `n_classes` - number of classes `K`
    /// * `n_latent` - latent dimension
    /// * `layers` - hidden layers of the encoder (reversed for the decoder)
    pub fn new(
        n_features: usize,
        n_classes: usize,
        n_latent: usize,
        layers: &[usize],
        vs: VarBuilder,
    ) -> Result<Self> {
        let encoder = GaussianEncoder::new(n_features + n_classes, n_latent, layers, vs.clone())?;

        let dec_layers: Vec<usize> = layers.iter().rev().copied().collect();
        let decoder = MlpDecoder::new(
            n_latent + n_classes,
            n_features,
            &dec_layers,
            OutputActivation::Sigmoid,
            vs,
        )?;

        Ok(Self {
            n_features,
            n_classes,
            encoder,
            decoder,
        })
    }

    pub fn dim_obs(&self) -> usize {
        self.n_features
    }

    pub fn dim_latent(&self) -> usize {
        self.encoder.dim_latent()
    }
}

impl ConditionalGenerativeT for ConditionalVae {
    fn forward_t(
        &self,
        x_nd: &Tensor,
        y_nk: &Tensor,
        noise: &mut dyn NoiseSource,
        train: bool,
    ) -> Result<(Tensor, LatentSample)> {
        let xy = Tensor::cat(&[x_nd, y_nk], 1)?;
        let latent = self.encoder.forward_t(&xy, noise, train)?;
        let zy = Tensor::cat(&[&latent.z, y_nk], 1)?;
        let recon_nd = self.decoder.forward(&zy)?;
        Ok((recon_nd, latent))
    }

    fn num_classes(&self) -> usize {
        self.n_classes
    }
}
