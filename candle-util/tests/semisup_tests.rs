use candle_util::candle_checkpoint::*;
use candle_util::candle_classifier::*;
use candle_util::candle_data_loader::*;
use candle_util::candle_early_stopping::*;
use candle_util::candle_inference::TrainConfig;
use candle_util::candle_model_runner::*;
use candle_util::candle_model_traits::*;
use candle_util::candle_noise::*;
use candle_util::candle_semisup_inference::*;
use candle_util::candle_semisup_vae::*;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use nalgebra::DMatrix;

const NUM_FEATURES: usize = 8;

/// class 0 lights up the first half of the features, class 1 the
/// second half
fn two_blobs(n: usize, offset: usize) -> (DMatrix<f32>, Vec<u32>) {
    let labels: Vec<u32> = (0..n).map(|i| ((i + offset) % 2) as u32).collect();
    let x = DMatrix::<f32>::from_fn(n, NUM_FEATURES, |i, j| {
        let on = (j < NUM_FEATURES / 2) == (labels[i] == 0);
        let jitter = ((i * 7 + j * 3) % 5) as f32 * 0.02;
        if on {
            0.9 - jitter
        } else {
            0.1 + jitter
        }
    });
    (x, labels)
}

fn toy_trainer(
    num_labelled: usize,
    num_unlabelled: usize,
    lr: f64,
) -> anyhow::Result<SemiSupervisedTrainer<ConditionalVae, MlpClassifier>> {
    let dev = Device::Cpu;
    let vm = VarMap::new();
    let vs = VarBuilder::from_varmap(&vm, DType::F32, &dev);
    let model = ConditionalVae::new(NUM_FEATURES, 2, 2, &[16], vs.pp("m2.vae"))?;
    let classifier = MlpClassifier::new(NUM_FEATURES, &[16], 2, vs.pp("m2.cls"))?;
    let alpha = classification_weight(0.1, num_unlabelled, num_labelled);
    SemiSupervisedTrainer::new(model, classifier, vm, alpha, lr)
}

#[test]
fn semisup_step_on_toy_data_converges() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let (xl, yl) = two_blobs(4, 0);
    let (xu, _) = two_blobs(20, 1);

    let x_l = Tensor::from_slice(xl.transpose().as_slice(), (4, NUM_FEATURES), &dev)?;
    let y_l = Tensor::from_slice(&yl, 4, &dev)?;
    let x_u = Tensor::from_slice(xu.transpose().as_slice(), (20, NUM_FEATURES), &dev)?;

    let mut trainer = toy_trainer(4, 20, 1e-2)?;
    let mut noise = SeededNoise::new(0);

    let first = trainer.train_step(&x_l, &y_l, &x_u, &mut noise)?;
    assert!(first.total.is_finite());

    let mut last = first;
    for _ in 1..50 {
        last = trainer.train_step(&x_l, &y_l, &x_u, &mut noise)?;
    }
    assert!(last.total < first.total);
    Ok(())
}

#[test]
fn state_dict_round_trip_on_semisup_model() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let (xu, _) = two_blobs(6, 0);
    let x = Tensor::from_slice(xu.transpose().as_slice(), (6, NUM_FEATURES), &dev)?;
    let y = candle_nn::encoding::one_hot(Tensor::new(&[0u32, 1, 0, 1, 0, 1], &dev)?, 2, 1f32, 0f32)?;

    let trainer = toy_trainer(2, 6, 1e-3)?;
    let snapshot = trainer.variable_map.state_dict()?;

    let (recon0, _) = trainer
        .model
        .forward_t(&x, &y, &mut SeededNoise::new(5), true)?;
    let logits0 = trainer.classifier.logits(&x)?;

    for var in trainer.variable_map.all_vars() {
        var.set(&var.as_tensor().zeros_like()?)?;
    }
    trainer.variable_map.load_state_dict(&snapshot)?;

    let (recon1, _) = trainer
        .model
        .forward_t(&x, &y, &mut SeededNoise::new(5), true)?;
    let logits1 = trainer.classifier.logits(&x)?;

    assert_eq!(recon0.to_vec2::<f32>()?, recon1.to_vec2::<f32>()?);
    assert_eq!(logits0.to_vec2::<f32>()?, logits1.to_vec2::<f32>()?);
    Ok(())
}

struct ToyM2Runner {
    trainer: SemiSupervisedTrainer<ConditionalVae, MlpClassifier>,
    noise: SeededNoise,
}

impl ModelRunnerT for ToyM2Runner {
    fn checkpoint_identity(&self) -> String {
        "m2".to_string()
    }

    fn parameters(&self) -> &VarMap {
        &self.trainer.variable_map
    }

    fn default_patience(&self) -> usize {
        7
    }

    fn train_epoch(
        &mut self,
        data: &mut SemiSupervisedData,
        train_config: &TrainConfig,
    ) -> anyhow::Result<f32> {
        self.trainer.train_epoch(data, &mut self.noise, train_config)
    }

    fn evaluate(&self, data: &InMemoryData, train_config: &TrainConfig) -> anyhow::Result<f32> {
        accuracy(data, &|x: &Tensor| self.trainer.classifier.logits(x), &train_config.device)
    }
}

#[test]
fn early_stopping_loop_restores_best_checkpoint() -> anyhow::Result<()> {
    let (xl, yl) = two_blobs(4, 0);
    let (xu, _) = two_blobs(20, 1);
    let (xv, yv) = two_blobs(10, 0);

    let mut data = SemiSupervisedData {
        labelled: InMemoryData::new_with_labels(&xl, &yl, 1)?,
        unlabelled: InMemoryData::new(&xu, 2)?,
        validation: InMemoryData::new_with_labels(&xv, &yv, 3)?,
    };

    let config = TrainConfig {
        learning_rate: 1e-2,
        batch_size: 4,
        num_epochs: 5,
        show_progress: false,
        patience: Some(2),
        ..TrainConfig::default()
    };

    let mut runner = ToyM2Runner {
        trainer: toy_trainer(4, 20, config.learning_rate.into())?,
        noise: SeededNoise::new(9),
    };

    let dir = tempfile::tempdir()?;
    let mut store = FileCheckpointStore::new(dir.path());
    let key = format!("{}/toy_fold0", runner.checkpoint_identity());

    let mut controller = TrainingController::new(
        &key,
        config.early_stopping(runner.default_patience()),
        &mut store,
    );

    let trace = fit_with_early_stopping(&mut runner, &mut data, &mut controller, &config)?;
    assert!(!trace.epochs.is_empty());
    assert!(trace.epochs.len() <= config.num_epochs);
    assert!(dir.path().join("m2").join("toy_fold0.safetensors").exists());

    let best = trace
        .epochs
        .iter()
        .map(|m| m.validation_score)
        .fold(f32::INFINITY, f32::min);
    approx::assert_abs_diff_eq!(trace.best_score, best);

    // the restored parameters reproduce the best validation score
    let restored = runner.validation_score(&data, &config)?;
    approx::assert_abs_diff_eq!(restored, best, epsilon = 1e-6);
    Ok(())
}

#[test]
fn zero_epoch_budget_is_rejected() -> anyhow::Result<()> {
    let (xl, yl) = two_blobs(4, 0);
    let (xu, _) = two_blobs(8, 1);
    let mut data = SemiSupervisedData {
        labelled: InMemoryData::new_with_labels(&xl, &yl, 1)?,
        unlabelled: InMemoryData::new(&xu, 2)?,
        validation: InMemoryData::new_with_labels(&xl, &yl, 3)?,
    };
    let config = TrainConfig {
        num_epochs: 0,
        show_progress: false,
        ..TrainConfig::default()
    };
    let mut runner = ToyM2Runner {
        trainer: toy_trainer(4, 8, 1e-3)?,
        noise: SeededNoise::new(0),
    };
    let mut controller = TrainingController::new(
        "m2/toy",
        EarlyStoppingConfig::default(),
        MemoryCheckpointStore::new(),
    );
    assert!(fit_with_early_stopping(&mut runner, &mut data, &mut controller, &config).is_err());
    Ok(())
}
