use crate::fit_simple::supervised_epoch;
use crate::lentil_common::*;

use candle_core::{DType, Tensor};
use candle_nn::{Activation, AdamW, Linear, Module, Optimizer, VarBuilder, VarMap};
use candle_util::candle_aux_layers::*;
use candle_util::candle_checkpoint::*;
use candle_util::candle_classifier::*;
use candle_util::candle_data_loader::*;
use candle_util::candle_decoder_mlp::*;
use candle_util::candle_early_stopping::*;
use candle_util::candle_inference::TrainConfig;
use candle_util::candle_loss_functions::bernoulli_likelihood;
use candle_util::candle_model_runner::ModelRunnerT;
use candle_util::candle_model_traits::*;

use indicatif::{ProgressBar, ProgressDrawTarget};

pub const SIMPLE_M1_ENCODER_LAYERS: [usize; 2] = [256, 128];
pub const SIMPLE_M1_CLASSIFIER_LAYERS: [usize; 1] = [32];
pub const SIMPLE_M1_CODE_DIM: usize = 32;
pub const SIMPLE_M1_AUTOENCODER_PATIENCE: usize = 7;

/// Deterministic encoder: relu stack, then a linear code layer
struct CodeEncoder {
    fc: StackLayers<Linear>,
    code: Linear,
}

impl CodeEncoder {
    /// Variables: `nn.enc.fc.{j}.*`, `nn.enc.code.*`
    fn new(
        n_features: usize,
        n_code: usize,
        layers: &[usize],
        vs: VarBuilder,
    ) -> candle_core::Result<Self> {
        let (fc, prev_dim) = fc_stack(n_features, layers, Activation::Relu, vs.pp("nn.enc"))?;
        let code = candle_nn::linear(prev_dim, n_code, vs.pp("nn.enc.code"))?;
        Ok(Self { fc, code })
    }
}

impl Module for CodeEncoder {
    fn forward(&self, x_nd: &Tensor) -> candle_core::Result<Tensor> {
        self.code.forward(&self.fc.forward(x_nd)?)
    }
}

///
/// M1 with a plain autoencoder in place of the VAE: the autoencoder
/// is fitted to the unlabelled set by binary cross entropy under its
/// own early stopping, then a classifier learns from the codes.
///
pub struct SimpleM1Runner {
    autoencoder_variables: VarMap,
    encoder: CodeEncoder,
    decoder: MlpDecoder,
    autoencoder_optimizer: AdamW,
    classifier_variables: VarMap,
    classifier: MlpClassifier,
    classifier_optimizer: AdamW,
}

impl SimpleM1Runner {
    pub fn new(shape: &ModelShape, train_config: &TrainConfig) -> anyhow::Result<Self> {
        let dev = &train_config.device;
        let lr: f64 = train_config.learning_rate.into();
        let layers = shape.layers_or(&SIMPLE_M1_ENCODER_LAYERS);
        let n_code = shape.latent_or(SIMPLE_M1_CODE_DIM);

        let autoencoder_variables = VarMap::new();
        let vs = VarBuilder::from_varmap(&autoencoder_variables, DType::F32, dev);
        let encoder = CodeEncoder::new(shape.n_features, n_code, &layers, vs.pp("simple_m1.ae"))?;
        let dec_layers: Vec<usize> = layers.iter().rev().copied().collect();
        let decoder = MlpDecoder::new(
            n_code,
            shape.n_features,
            &dec_layers,
            OutputActivation::Sigmoid,
            vs.pp("simple_m1.ae"),
        )?;
        let autoencoder_optimizer = AdamW::new_lr(autoencoder_variables.all_vars(), lr)?;

        let classifier_variables = VarMap::new();
        let vs = VarBuilder::from_varmap(&classifier_variables, DType::F32, dev);
        let classifier = MlpClassifier::new(
            n_code,
            &SIMPLE_M1_CLASSIFIER_LAYERS,
            shape.n_classes,
            vs.pp("simple_m1"),
        )?;
        let classifier_optimizer = AdamW::new_lr(classifier_variables.all_vars(), lr)?;

        Ok(Self {
            autoencoder_variables,
            encoder,
            decoder,
            autoencoder_optimizer,
            classifier_variables,
            classifier,
            classifier_optimizer,
        })
    }

    /// Binary cross entropy averaged over every element of `x_nd`
    fn reconstruction_loss(&self, x_nd: &Tensor) -> candle_core::Result<Tensor> {
        let recon_nd = self.decoder.forward(&self.encoder.forward(x_nd)?)?;
        let n_features = x_nd.dim(1)? as f64;
        bernoulli_likelihood(x_nd, &recon_nd)?.mean_all()?.affine(-1. / n_features, 0.)
    }

    fn autoencoder_epoch(
        &mut self,
        unlabelled: &InMemoryData,
        train_config: &TrainConfig,
    ) -> anyhow::Result<f32> {
        let num_minibatches = unlabelled.num_minibatch();
        if num_minibatches == 0 {
            return Err(anyhow::anyhow!("need to shuffle data"));
        }

        let mut loss_tot = 0f32;
        for b in 0..num_minibatches {
            let x_nd = unlabelled.minibatch_data(b, &train_config.device)?.input;
            let loss = self.reconstruction_loss(&x_nd)?;
            self.autoencoder_optimizer.backward_step(&loss)?;
            loss_tot += loss.to_scalar::<f32>()?;
        }
        Ok(loss_tot / num_minibatches as f32)
    }
}

impl ModelRunnerT for SimpleM1Runner {
    fn checkpoint_identity(&self) -> String {
        "simple_m1".to_string()
    }

    fn stage_suffix(&self) -> &str {
        "_classifier"
    }

    fn parameters(&self) -> &VarMap {
        &self.classifier_variables
    }

    /// Autoencoder on the unlabelled set, early-stopped on the
    /// validation reconstruction loss
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
            EarlyStoppingConfig::new(SIMPLE_M1_AUTOENCODER_PATIENCE, train_config.min_delta),
            store,
        );

        let pb = ProgressBar::new(train_config.num_epochs as u64);
        if !train_config.show_progress || train_config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        for epoch in 0..train_config.num_epochs {
            data.unlabelled.shuffle_minibatch(train_config.batch_size)?;
            let train_loss = self.autoencoder_epoch(&data.unlabelled, train_config)?;

            let x_valid = data.validation.full_data(&train_config.device)?.input;
            let score = self.reconstruction_loss(&x_valid)?.to_scalar::<f32>()?;

            controller.report(score, &self.autoencoder_variables)?;
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

        controller.restore_best(&self.autoencoder_variables)
    }

    fn train_epoch(
        &mut self,
        data: &mut SemiSupervisedData,
        train_config: &TrainConfig,
    ) -> anyhow::Result<f32> {
        let encoder = &self.encoder;
        let classifier = &self.classifier;
        supervised_epoch(
            &|x: &Tensor| classifier.logits(&encoder.forward(x)?.detach()),
            &mut self.classifier_optimizer,
            &data.labelled,
            train_config,
        )
    }

    fn evaluate(&self, data: &InMemoryData, train_config: &TrainConfig) -> anyhow::Result<f32> {
        accuracy(
            data,
            &|x: &Tensor| self.classifier.logits(&self.encoder.forward(x)?),
            &train_config.device,
        )
    }
}
