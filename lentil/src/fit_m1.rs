use crate::fit_simple::supervised_epoch;
use crate::lentil_common::*;

use candle_core::{DType, Tensor};
use candle_nn::{AdamW, VarBuilder, VarMap};
use candle_util::candle_checkpoint::*;
use candle_util::candle_classifier::*;
use candle_util::candle_data_loader::*;
use candle_util::candle_decoder_mlp::*;
use candle_util::candle_early_stopping::*;
use candle_util::candle_encoder_gaussian::GaussianEncoder;
use candle_util::candle_inference::TrainConfig;
use candle_util::candle_loss_functions::bernoulli_likelihood;
use candle_util::candle_model_runner::ModelRunnerT;
use candle_util::candle_model_traits::*;
use candle_util::candle_noise::*;
use candle_util::candle_vae_inference::*;

use indicatif::{ProgressBar, ProgressDrawTarget};

pub const M1_VAE_LAYERS: [usize; 2] = [256, 128];
pub const M1_CLASSIFIER_LAYERS: [usize; 1] = [32];
pub const M1_LATENT_DIM: usize = 32;
pub const M1_AUTOENCODER_PATIENCE: usize = 7;

///
/// M1: a VAE fitted to the unlabelled data, then a classifier on the
/// latent codes. Training codes are sampled and detached so the
/// classifier never moves the encoder; evaluation uses the posterior
/// mean.
///
pub struct M1Runner {
    vae_variables: VarMap,
    encoder: GaussianEncoder,
    decoder: MlpDecoder,
    vae_optimizer: AdamW,
    classifier_variables: VarMap,
    classifier: MlpClassifier,
    classifier_optimizer: AdamW,
    noise: SeededNoise,
}

impl M1Runner {
    pub fn new(shape: &ModelShape, train_config: &TrainConfig) -> anyhow::Result<Self> {
        let dev = &train_config.device;
        let lr: f64 = train_config.learning_rate.into();
        let layers = shape.layers_or(&M1_VAE_LAYERS);
        let n_latent = shape.latent_or(M1_LATENT_DIM);

        let vae_variables = VarMap::new();
        let vs = VarBuilder::from_varmap(&vae_variables, DType::F32, dev);
        let encoder = GaussianEncoder::new(shape.n_features, n_latent, &layers, vs.pp("m1.vae"))?;
        let dec_layers: Vec<usize> = layers.iter().rev().copied().collect();
        let decoder = MlpDecoder::new(
            n_latent,
            shape.n_features,
            &dec_layers,
            OutputActivation::Sigmoid,
            vs.pp("m1.vae"),
        )?;
        let vae_optimizer = AdamW::new_lr(vae_variables.all_vars(), lr)?;

        let classifier_variables = VarMap::new();
        let vs = VarBuilder::from_varmap(&classifier_variables, DType::F32, dev);
        let classifier = MlpClassifier::new(
            n_latent,
            &M1_CLASSIFIER_LAYERS,
            shape.n_classes,
            vs.pp("m1"),
        )?;
        let classifier_optimizer = AdamW::new_lr(classifier_variables.all_vars(), lr)?;

        Ok(Self {
            vae_variables,
            encoder,
            decoder,
            vae_optimizer,
            classifier_variables,
            classifier,
            classifier_optimizer,
            noise: SeededNoise::new(train_config.seed),
        })
    }

    /// Posterior mean of the latent code
    fn latent_mean(&self, x_nd: &Tensor) -> candle_core::Result<Tensor> {
        Ok(self.encoder.latent_gaussian_params(x_nd)?.0)
    }
}

impl ModelRunnerT for M1Runner {
    fn checkpoint_identity(&self) -> String {
        "m1".to_string()
    }

    fn stage_suffix(&self) -> &str {
        "_classifier"
    }

    fn parameters(&self) -> &VarMap {
        &self.classifier_variables
    }

    /// VAE on the unlabelled set under its own early stopping, with
    /// the validation negative ELBO as the score
    fn pretrain(
        &mut self,
        data: &mut SemiSupervisedData,
        store: &mut dyn CheckpointStore,
        key_prefix: &str,
        train_config: &TrainConfig,
    ) -> anyhow::Result<()> {
        let key = format!("{}_autoencoder", key_prefix);
        let mut controller = TrainingController::new(
            &key,
            EarlyStoppingConfig::new(M1_AUTOENCODER_PATIENCE, train_config.min_delta),
            store,
        );

        let vae = Vae::build(&self.encoder, &self.decoder)?;

        let pb = ProgressBar::new(train_config.num_epochs as u64);
        if !train_config.show_progress || train_config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        for epoch in 0..train_config.num_epochs {
            data.unlabelled.shuffle_minibatch(train_config.batch_size)?;

            let train_loss = vae.train_epoch(
                &data.unlabelled,
                &bernoulli_likelihood,
                &mut self.vae_optimizer,
                &mut self.noise,
                train_config,
            )?;
            let score = vae.evaluate_loss(
                &data.validation,
                &bernoulli_likelihood,
                &mut self.noise,
                train_config,
            )?;

            controller.report(score, &self.vae_variables)?;
            pb.inc(1);

            if train_config.verbose {
                info!(
                    "[{}][{}] loss: {}, validation loss: {}",
                    key,
                    epoch + 1,
                    train_loss,
                    score
                );
            }
            if controller.is_stopped() {
                info!("[{}] early stop at epoch {}", key, epoch + 1);
                break;
            }
        }
        pb.finish_and_clear();

        controller.restore_best(&self.vae_variables)
    }

    fn train_epoch(
        &mut self,
        data: &mut SemiSupervisedData,
        train_config: &TrainConfig,
    ) -> anyhow::Result<f32> {
        let encoder = &self.encoder;
        let classifier = &self.classifier;
        let noise = std::cell::RefCell::new(&mut self.noise);

        supervised_epoch(
            &|x: &Tensor| {
                let mut noise = noise.borrow_mut();
                let z = encoder.forward_t(x, &mut **noise, true)?.z.detach();
                classifier.logits(&z)
            },
            &mut self.classifier_optimizer,
            &data.labelled,
            train_config,
        )
    }

    fn evaluate(&self, data: &InMemoryData, train_config: &TrainConfig) -> anyhow::Result<f32> {
        accuracy(
            data,
            &|x: &Tensor| self.classifier.logits(&self.latent_mean(x)?),
            &train_config.device,
        )
    }
}
