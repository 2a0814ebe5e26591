use crate::fit_simple::{supervised_epoch, SIMPLE_LAYERS};
use crate::lentil_common::*;

use candle_core::{DType, Tensor};
use candle_nn::{AdamW, Linear, Module, Optimizer, VarBuilder, VarMap};
use candle_util::candle_checkpoint::*;
use candle_util::candle_classifier::*;
use candle_util::candle_data_loader::*;
use candle_util::candle_inference::TrainConfig;
use candle_util::candle_loss_functions::mse_loss;
use candle_util::candle_model_runner::ModelRunnerT;
use candle_util::candle_model_traits::ClassifierModuleT;
use candle_util::candle_noise::*;

pub const CORRUPTION_SCALE: f64 = 0.3;

///
/// Stacked denoising autoencoder. Each hidden layer is pretrained in
/// turn to reconstruct its (frozen) input from a gaussian-corrupted
/// copy; the stack is then fine-tuned with a class head.
///
pub struct SdaeRunner {
    variable_map: VarMap,
    classifier: MlpClassifier,
    layer_decoders: Vec<Linear>,
    classifier_optimizer: AdamW,
    learning_rate: f64,
    noise: SeededNoise,
}

impl SdaeRunner {
    /// Variables: `sdae.nn.cls.*` and one linear decoder per hidden
    /// layer, `sdae.dae.{j}.*`
    pub fn new(shape: &ModelShape, train_config: &TrainConfig) -> anyhow::Result<Self> {
        let variable_map = VarMap::new();
        let vs = VarBuilder::from_varmap(&variable_map, DType::F32, &train_config.device);

        let layers = shape.layers_or(&SIMPLE_LAYERS);
        let classifier =
            MlpClassifier::new(shape.n_features, &layers, shape.n_classes, vs.pp("sdae"))?;

        let mut layer_decoders = vec![];
        let mut in_dim = shape.n_features;
        for (j, &out_dim) in layers.iter().enumerate() {
            let _name = format!("sdae.dae.{}", j);
            layer_decoders.push(candle_nn::linear(out_dim, in_dim, vs.pp(_name))?);
            in_dim = out_dim;
        }

        let learning_rate: f64 = train_config.learning_rate.into();
        let classifier_optimizer = AdamW::new_lr(
            vars_with_prefix(&variable_map, "sdae.nn.cls.")?,
            learning_rate,
        )?;

        Ok(Self {
            variable_map,
            classifier,
            layer_decoders,
            classifier_optimizer,
            learning_rate,
            noise: SeededNoise::new(train_config.seed),
        })
    }

    /// Denoising loss of layer `j` on a minibatch
    fn layer_loss(&mut self, x_nd: &Tensor, j: usize) -> anyhow::Result<Tensor> {
        let fc = self.classifier.hidden_layers();
        let input = fc.forward_prefix(x_nd, j)?.detach();
        let eps = self.noise.standard_normal_like(&input)?;
        let corrupted = (&input + (eps * CORRUPTION_SCALE)?)?;
        let code = fc.forward_layer(&corrupted, j)?;
        let recon = self.layer_decoders[j].forward(&code)?;
        Ok(mse_loss(&input, &recon)?)
    }
}

impl ModelRunnerT for SdaeRunner {
    fn checkpoint_identity(&self) -> String {
        "sdae".to_string()
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
        for j in 0..self.layer_decoders.len() {
            let mut layer_vars =
                vars_with_prefix(&self.variable_map, &format!("sdae.nn.cls.fc.{}.", j))?;
            layer_vars.extend(vars_with_prefix(
                &self.variable_map,
                &format!("sdae.dae.{}.", j),
            )?);
            let mut optimizer = AdamW::new_lr(layer_vars, self.learning_rate)?;

            for epoch in 0..train_config.num_pretrain_epochs {
                data.unlabelled.shuffle_minibatch(train_config.batch_size)?;

                let num_minibatches = data.unlabelled.num_minibatch();
                let mut loss_tot = 0f32;
                for b in 0..num_minibatches {
                    let x_nd = data
                        .unlabelled
                        .minibatch_data(b, &train_config.device)?
                        .input;
                    let loss = self.layer_loss(&x_nd, j)?;
                    optimizer.backward_step(&loss)?;
                    loss_tot += loss.to_scalar::<f32>()?;
                }

                info!(
                    "[{}_dae{}][{}] denoising loss: {}",
                    key_prefix,
                    j,
                    epoch + 1,
                    loss_tot / num_minibatches.max(1) as f32
                );
            }
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
