//! One interface for every trainable model variant and the early
//! stopping loop that drives it.

use crate::candle_checkpoint::*;
use crate::candle_data_loader::*;
use crate::candle_early_stopping::*;
use crate::candle_inference::TrainConfig;

use candle_nn::VarMap;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;

pub trait ModelRunnerT {
    /// Name of the model, the first component of its checkpoint keys
    fn checkpoint_identity(&self) -> String;

    /// Suffix of the main stage's checkpoint key, e.g. `"_classifier"`
    fn stage_suffix(&self) -> &str {
        ""
    }

    /// Parameters tracked by the early stopping controller
    fn parameters(&self) -> &VarMap;

    /// Patience used unless the configuration overrides it
    fn default_patience(&self) -> usize {
        1
    }

    /// Stages before the main loop (autoencoder pretraining and the
    /// like); checkpoints go under `key_prefix` with a stage suffix
    fn pretrain(
        &mut self,
        _data: &mut SemiSupervisedData,
        _store: &mut dyn CheckpointStore,
        _key_prefix: &str,
        _train_config: &TrainConfig,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// One epoch over shuffled minibatches
    ///
    /// # Returns the mean training loss
    fn train_epoch(
        &mut self,
        data: &mut SemiSupervisedData,
        train_config: &TrainConfig,
    ) -> anyhow::Result<f32>;

    /// Classification accuracy on `data`
    fn evaluate(&self, data: &InMemoryData, train_config: &TrainConfig) -> anyhow::Result<f32>;

    /// Lower is better; defaults to validation error rate
    fn validation_score(
        &mut self,
        data: &SemiSupervisedData,
        train_config: &TrainConfig,
    ) -> anyhow::Result<f32> {
        Ok(1. - self.evaluate(&data.validation, train_config)?)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f32,
    pub validation_score: f32,
}

#[derive(Clone, Debug, Default)]
pub struct TrainTrace {
    pub epochs: Vec<EpochMetrics>,
    pub best_score: f32,
    pub stopped_early: bool,
}

///
/// Train `runner` until the controller stops it or the epoch budget
/// runs out, then roll back to the best checkpoint either way.
///
/// * `runner` - model variant
/// * `data` - labelled, unlabelled and validation sets
/// * `controller` - early stopping over `runner.parameters()`
/// * `train_config` - epochs, batch size, device
///
pub fn fit_with_early_stopping<R, S>(
    runner: &mut R,
    data: &mut SemiSupervisedData,
    controller: &mut TrainingController<S>,
    train_config: &TrainConfig,
) -> anyhow::Result<TrainTrace>
where
    R: ModelRunnerT + ?Sized,
    S: CheckpointStore,
{
    if train_config.num_epochs == 0 {
        return Err(anyhow::anyhow!("need at least one epoch"));
    }

    let pb = ProgressBar::new(train_config.num_epochs as u64);
    if !train_config.show_progress || train_config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let mut trace = TrainTrace::default();

    for epoch in 0..train_config.num_epochs {
        data.shuffle_minibatch(train_config.batch_size)?;

        let train_loss = runner.train_epoch(data, train_config)?;
        let validation_score = runner.validation_score(data, train_config)?;

        controller.report(validation_score, runner.parameters())?;

        trace.epochs.push(EpochMetrics {
            epoch: epoch + 1,
            train_loss,
            validation_score,
        });
        pb.inc(1);

        if train_config.verbose {
            info!(
                "[{}][{}] loss: {}, validation score: {}",
                controller.key(),
                epoch + 1,
                train_loss,
                validation_score
            );
        }

        if controller.is_stopped() {
            info!("[{}] early stop at epoch {}", controller.key(), epoch + 1);
            break;
        }
    }
    pb.finish_and_clear();

    controller.restore_best(runner.parameters())?;

    trace.best_score = controller.best_score();
    trace.stopped_early = controller.is_stopped();
    Ok(trace)
}
