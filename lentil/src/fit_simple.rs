use crate::lentil_common::*;

use candle_core::{DType, Tensor};
use candle_nn::{AdamW, Optimizer, VarBuilder, VarMap};
use candle_util::candle_classifier::*;
use candle_util::candle_data_loader::*;
use candle_util::candle_inference::TrainConfig;
use candle_util::candle_model_runner::ModelRunnerT;
use candle_util::candle_model_traits::ClassifierModuleT;

pub const SIMPLE_LAYERS: [usize; 5] = [1000, 500, 250, 250, 250];

///
/// One pass of supervised cross entropy over the labelled
/// minibatches
///
/// * `logits_fn` - inputs to class logits
/// * `optimizer` - steps the parameters `logits_fn` depends on
///
pub fn supervised_epoch<LogitFn>(
    logits_fn: &LogitFn,
    optimizer: &mut AdamW,
    labelled: &InMemoryData,
    train_config: &TrainConfig,
) -> anyhow::Result<f32>
where
    LogitFn: Fn(&Tensor) -> candle_core::Result<Tensor>,
{
    let num_minibatches = labelled.num_minibatch();
    if num_minibatches == 0 {
        return Err(anyhow::anyhow!("need to shuffle data"));
    }

    let mut loss_tot = 0f32;
    for b in 0..num_minibatches {
        let mb = labelled.minibatch_data(b, &train_config.device)?;
        let y = mb
            .labels
            .ok_or(anyhow::anyhow!("labelled minibatch without labels"))?
            .to_dtype(DType::U32)?;
        let loss = candle_nn::loss::cross_entropy(&logits_fn(&mb.input)?, &y)?;
        optimizer.backward_step(&loss)?;
        loss_tot += loss.to_scalar::<f32>()?;
    }
    Ok(loss_tot / num_minibatches as f32)
}

/// Plain MLP trained on the labelled samples only
pub struct SimpleRunner {
    variable_map: VarMap,
    classifier: MlpClassifier,
    optimizer: AdamW,
}

impl SimpleRunner {
    pub fn new(shape: &ModelShape, train_config: &TrainConfig) -> anyhow::Result<Self> {
        let variable_map = VarMap::new();
        let vs = VarBuilder::from_varmap(&variable_map, DType::F32, &train_config.device);

        let classifier = MlpClassifier::new(
            shape.n_features,
            &shape.layers_or(&SIMPLE_LAYERS),
            shape.n_classes,
            vs.pp("simple"),
        )?;

        let optimizer = AdamW::new_lr(
            variable_map.all_vars(),
            train_config.learning_rate.into(),
        )?;

        Ok(Self {
            variable_map,
            classifier,
            optimizer,
        })
    }
}

impl ModelRunnerT for SimpleRunner {
    fn checkpoint_identity(&self) -> String {
        "simple".to_string()
    }

    fn parameters(&self) -> &VarMap {
        &self.variable_map
    }

    fn train_epoch(
        &mut self,
        data: &mut SemiSupervisedData,
        train_config: &TrainConfig,
    ) -> anyhow::Result<f32> {
        let classifier = &self.classifier;
        supervised_epoch(
            &|x: &Tensor| classifier.logits(x),
            &mut self.optimizer,
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
