use crate::candle_early_stopping::EarlyStoppingConfig;

pub struct TrainConfig {
    pub learning_rate: f32,
    pub batch_size: usize,
    /// upper bound; early stopping may end training sooner
    pub num_epochs: usize,
    pub num_pretrain_epochs: usize,
    pub device: candle_core::Device,
    pub verbose: bool,
    pub show_progress: bool,
    /// `None`: each runner's own default
    pub patience: Option<usize>,
    pub min_delta: f32,
    /// `alpha = alpha_scale * |unlabelled| / |labelled|`
    pub alpha_scale: f64,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            batch_size: 100,
            num_epochs: 100,
            num_pretrain_epochs: 10,
            device: candle_core::Device::Cpu,
            verbose: false,
            show_progress: true,
            patience: None,
            min_delta: 0.,
            alpha_scale: 0.1,
            seed: 42,
        }
    }
}

impl TrainConfig {
    pub fn early_stopping(&self, default_patience: usize) -> EarlyStoppingConfig {
        EarlyStoppingConfig::new(self.patience.unwrap_or(default_patience), self.min_delta)
    }
}
