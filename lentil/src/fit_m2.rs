use crate::lentil_common::*;

use candle_core::{DType, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_util::candle_classifier::*;
use candle_util::candle_data_loader::*;
use candle_util::candle_inference::TrainConfig;
use candle_util::candle_model_runner::ModelRunnerT;
use candle_util::candle_model_traits::ClassifierModuleT;
use candle_util::candle_noise::SeededNoise;
use candle_util::candle_semisup_inference::*;
use candle_util::candle_semisup_vae::ConditionalVae;

pub const M2_VAE_LAYERS: [usize; 2] = [256, 128];
pub const M2_CLASSIFIER_LAYERS: [usize; 1] = [256];
pub const M2_LATENT_DIM: usize = 32;
pub const M2_PATIENCE: usize = 7;

/// M2: label-conditioned VAE and classifier trained jointly on
/// labelled and unlabelled minibatches
pub struct M2Runner {
    trainer: SemiSupervisedTrainer<ConditionalVae, MlpClassifier>,
    noise: SeededNoise,
}

impl M2Runner {
    /// * `num_labelled`, `num_unlabelled` - set sizes for the
    ///   classification weight
    pub fn new(
        shape: &ModelShape,
        num_labelled: usize,
        num_unlabelled: usize,
        train_config: &TrainConfig,
    ) -> anyhow::Result<Self> {
        let variable_map = VarMap::new();
        let vs = VarBuilder::from_varmap(&variable_map, DType::F32, &train_config.device);

        let model = ConditionalVae::new(
            shape.n_features,
            shape.n_classes,
            shape.latent_or(M2_LATENT_DIM),
            &shape.layers_or(&M2_VAE_LAYERS),
            vs.pp("m2.vae"),
        )?;
        let classifier = MlpClassifier::new(
            shape.n_features,
            &M2_CLASSIFIER_LAYERS,
            shape.n_classes,
            vs.pp("m2"),
        )?;

        let alpha = classification_weight(train_config.alpha_scale, num_unlabelled, num_labelled);
        info!("classification weight alpha = {}", alpha);

        let trainer = SemiSupervisedTrainer::new(
            model,
            classifier,
            variable_map,
            alpha,
            train_config.learning_rate.into(),
        )?;

        Ok(Self {
            trainer,
            noise: SeededNoise::new(train_config.seed),
        })
    }
}

impl ModelRunnerT for M2Runner {
    fn checkpoint_identity(&self) -> String {
        "m2".to_string()
    }

    fn parameters(&self) -> &VarMap {
        &self.trainer.variable_map
    }

    fn default_patience(&self) -> usize {
        M2_PATIENCE
    }

    fn train_epoch(
        &mut self,
        data: &mut SemiSupervisedData,
        train_config: &TrainConfig,
    ) -> anyhow::Result<f32> {
        self.trainer.train_epoch(data, &mut self.noise, train_config)
    }

    fn evaluate(&self, data: &InMemoryData, train_config: &TrainConfig) -> anyhow::Result<f32> {
        accuracy(
            data,
            &|x: &Tensor| self.trainer.classifier.logits(x),
            &train_config.device,
        )
    }
}
