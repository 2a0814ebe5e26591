//! Early stopping with a best-parameter checkpoint.
//!
//! The monitored score is "lower is better" (a validation loss or
//! `1 - accuracy`). Every improving report saves a snapshot under the
//! controller's key; `restore_best` writes it back.

use crate::candle_checkpoint::{CheckpointStore, Checkpointable};
use log::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EarlyStoppingConfig {
    /// Consecutive non-improving reports before stopping
    pub patience: usize,
    /// A score must beat the best by more than this to count
    pub min_delta: f32,
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            patience: 1,
            min_delta: 0.,
        }
    }
}

impl EarlyStoppingConfig {
    pub fn new(patience: usize, min_delta: f32) -> Self {
        Self {
            patience: patience.max(1),
            min_delta,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    Improving,
    Waiting,
    /// terminal
    Stopped,
}

pub struct TrainingController<S>
where
    S: CheckpointStore,
{
    key: String,
    config: EarlyStoppingConfig,
    best_score: f32,
    wait_count: usize,
    state: ControllerState,
    has_checkpoint: bool,
    store: S,
}

impl<S> TrainingController<S>
where
    S: CheckpointStore,
{
    /// * `key` - where the best snapshot lives in `store`, e.g. `"m2/mnist_fold0"`
    /// * `config` - patience and minimum improvement
    /// * `store` - checkpoint store
    pub fn new(key: &str, config: EarlyStoppingConfig, store: S) -> Self {
        Self {
            key: key.to_string(),
            config,
            best_score: f32::INFINITY,
            wait_count: 0,
            state: ControllerState::Improving,
            has_checkpoint: false,
            store,
        }
    }

    /// Record the score of the current parameters of `module`.
    ///
    /// An improving score saves a snapshot and resets the wait count;
    /// otherwise the wait count grows until it reaches the patience.
    /// Once stopped, further reports change nothing.
    pub fn report<M>(&mut self, score: f32, module: &M) -> anyhow::Result<()>
    where
        M: Checkpointable + ?Sized,
    {
        if self.state == ControllerState::Stopped {
            debug!("[{}] report after stop ignored", self.key);
            return Ok(());
        }

        if score < self.best_score - self.config.min_delta {
            self.store.save(&self.key, &module.state_dict()?)?;
            debug!(
                "[{}] improved {} -> {}, checkpoint saved",
                self.key, self.best_score, score
            );
            self.best_score = score;
            self.wait_count = 0;
            self.has_checkpoint = true;
            self.state = ControllerState::Improving;
        } else {
            self.wait_count += 1;
            self.state = if self.wait_count >= self.config.patience {
                info!(
                    "[{}] no improvement for {} report(s), best score: {}",
                    self.key, self.wait_count, self.best_score
                );
                ControllerState::Stopped
            } else {
                ControllerState::Waiting
            };
        }
        Ok(())
    }

    /// Overwrite `module` with the best snapshot; fails if there is
    /// none, which means no report ever improved on `+inf`
    pub fn restore_best<M>(&self, module: &M) -> anyhow::Result<()>
    where
        M: Checkpointable + ?Sized,
    {
        if !self.has_checkpoint {
            return Err(anyhow::anyhow!(
                "no checkpoint to restore for `{}`",
                self.key
            ));
        }
        let snapshot = self.store.load(&self.key)?;
        module.load_state_dict(&snapshot)?;
        debug!("[{}] restored best score {}", self.key, self.best_score);
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.state == ControllerState::Stopped
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn best_score(&self) -> f32 {
        self.best_score
    }

    pub fn wait_count(&self) -> usize {
        self.wait_count
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn into_store(self) -> S {
        self.store
    }
}
