use crate::fit_simple::{supervised_epoch, SIMPLE_LAYERS};
use crate::lentil_common::*;

use candle_core::{DType, Tensor};
use candle_nn::{AdamW, Module, Optimizer, VarBuilder, VarMap};
use candle_util::candle_checkpoint::*;
use candle_util::candle_classifier::*;
use candle_util::candle_data_loader::*;
use candle_util::candle_decoder_mlp::*;
use candle_util::candle_inference::TrainConfig;
use candle_util::candle_loss_functions::mse_loss;
use candle_util::candle_model_runner::ModelRunnerT;
use candle_util::candle_model_traits::*;

///
/// Autoencoder pretraining on the unlabelled set for a fixed number
/// of epochs, then the encoder stack becomes the hidden part of a
/// classifier fine-tuned on the labelled set.
///
pub struct PretrainingRunner {
    variable_map: VarMap,
    classifier: MlpClassifier,
    decoder: MlpDecoder,
    autoencoder_optimizer: AdamW,
    classifier_optimizer: AdamW,
}

impl PretrainingRunner {
    /// Variables: `pretraining.nn.cls.*` (encoder and class head),
    /// `pretraining.nn.dec.*` (decoder)
    pub fn new(shape: &ModelShape, train_config: &TrainConfig) -> anyhow::Result<Self> {
        let variable_map = VarMap::new();
        let vs = VarBuilder::from_varmap(&variable_map, DType::F32, &train_config.device);

        let layers = shape.layers_or(&SIMPLE_LAYERS);
        let (code_dim, dec_layers) = match layers.split_last() {
            Some((&last, rest)) => (last, rest.iter().rev().copied().collect::<Vec<_>>()),
            None => return Err(anyhow::anyhow!("pretraining needs a hidden layer")),
        };

        let classifier = MlpClassifier::new(
            shape.n_features,
            &layers,
            shape.n_classes,
            vs.pp("pretraining"),
        )?;

        let decoder = MlpDecoder::new(
            code_dim,
            shape.n_features,
            &dec_layers,
            OutputActivation::Sigmoid,
            vs.pp("pretraining"),
        )?;

        let lr: f64 = train_config.learning_rate.into();

        let mut ae_vars = vars_with_prefix(&variable_map, "pretraining.nn.cls.fc.")?;
        ae_vars.extend(vars_with_prefix(&variable_map, "pretraining.nn.dec.")?);
        let autoencoder_optimizer = AdamW::new_lr(ae_vars, lr)?;

        let classifier_optimizer =
            AdamW::new_lr(vars_with_prefix(&variable_map, "pretraining.nn.cls.")?, lr)?;

        Ok(Self {
            variable_map,
            classifier,
            decoder,
            autoencoder_optimizer,
            classifier_optimizer,
        })
    }

    /// Mean squared reconstruction error of `x_nd`
    fn reconstruction_loss(&self, x_nd: &Tensor) -> candle_core::Result<Tensor> {
        let code = self.classifier.hidden_layers().forward(x_nd)?;
        mse_loss(x_nd, &self.decoder.forward(&code)?)
    }
}

impl ModelRunnerT for PretrainingRunner {
    fn checkpoint_identity(&self) -> String {
        "pretraining".to_string()
    }

    fn parameters(&self) -> &VarMap {
        &self.variable_map
    }

    fn pretrain(
        &mut self,
        data: &mut SemiSupervisedData,
        _store: &mut dyn CheckpointStore,
        key_prefix: &str,
        train_config: &TrainConfig,
    ) -> anyhow::Result<()> {
        for epoch in 0..train_config.num_pretrain_epochs {
            data.unlabelled.shuffle_minibatch(train_config.batch_size)?;

            let num_minibatches = data.unlabelled.num_minibatch();
            let mut loss_tot = 0f32;
            for b in 0..num_minibatches {
                let x_nd = data
                    .unlabelled
                    .minibatch_data(b, &train_config.device)?
                    .input;
                let loss = self.reconstruction_loss(&x_nd)?;
                self.autoencoder_optimizer.backward_step(&loss)?;
                loss_tot += loss.to_scalar::<f32>()?;
            }

            info!(
                "[{}_autoencoder][{}] reconstruction loss: {}",
                key_prefix,
                epoch + 1,
                loss_tot / num_minibatches.max(1) as f32
            );
        }
        Ok(())
    }

    fn train_epoch(
        &mut self,
        data: &mut SemiSupervisedData,
        train_config: &TrainConfig,
    ) -> anyhow::Result<f32> {
        let classifier = &self.classifier;
        supervised_epoch(
            &|x: &Tensor| classifier.logits(x),
            &mut self.classifier_optimizer,
            &data.labelled,
            train_config,
        )
    }

    fn evaluate(&self, data: &InMemoryData, train_config: &TrainConfig) -> anyhow::Result<f32> {
        accuracy(
            data,
            &|x: &Tensor| self.classifier.logits(x),
            &train_config.device,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pretraining_lowers_reconstruction_loss() -> anyhow::Result<()> {
        let mut data = toy_semisup_data(4, 40)?;
        let config = TrainConfig {
            learning_rate: 1e-2,
            batch_size: 10,
            num_pretrain_epochs: 30,
            show_progress: false,
            ..TrainConfig::default()
        };
        let shape = ModelShape {
            n_features: 8,
            n_classes: 2,
            hidden_layers: Some(vec![16, 4]),
            latent_dim: None,
        };

        let mut runner = PretrainingRunner::new(&shape, &config)?;
        let x_nd = data.unlabelled.full_data(&config.device)?.input;

        let before = runner.reconstruction_loss(&x_nd)?.to_scalar::<f32>()?;
        let head_before = runner.variable_map.state_dict()?["pretraining.nn.cls.out.weight"]
            .to_vec2::<f32>()?;

        let mut store = MemoryCheckpointStore::new();
        runner.pretrain(&mut data, &mut store, "pretraining/toy_fold0", &config)?;

        let after = runner.reconstruction_loss(&x_nd)?.to_scalar::<f32>()?;
        let head_after = runner.variable_map.state_dict()?["pretraining.nn.cls.out.weight"]
            .to_vec2::<f32>()?;

        assert!(after < before);
        // the class head is not part of the autoencoder
        assert_eq!(head_before, head_after);
        Ok(())
    }
}
