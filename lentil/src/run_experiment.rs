use crate::fit_m1::M1Runner;
use crate::fit_m2::M2Runner;
use crate::fit_pretraining::PretrainingRunner;
use crate::fit_sdae::SdaeRunner;
use crate::fit_simple::SimpleRunner;
use crate::fit_simple_m1::SimpleM1Runner;
use crate::fit_ssgan::SsganRunner;
use crate::lentil_common::*;
use crate::lentil_input::*;
use crate::lentil_output::*;
use crate::lentil_split::*;

use candle_util::candle_checkpoint::FileCheckpointStore;
use candle_util::candle_data_loader::*;
use candle_util::candle_early_stopping::TrainingController;
use candle_util::candle_inference::TrainConfig;
use candle_util::candle_model_runner::*;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ModelKind {
    Simple,
    Pretraining,
    Sdae,
    #[value(name = "simple_m1")]
    SimpleM1,
    M1,
    M2,
    Ssgan,
}

impl ModelKind {
    /// Models with a Bernoulli likelihood need data in `[0, 1]`
    fn needs_unit_interval(&self) -> bool {
        matches!(self, ModelKind::SimpleM1 | ModelKind::M1 | ModelKind::M2)
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum DataFormat {
    Csv,
    Idx,
}

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[arg(
        value_enum,
        help = "Model",
        long_help = "Model to train on each fold:\n\
		     simple: supervised MLP on the labelled samples\n\
		     pretraining: autoencoder pretraining, then fine-tuning\n\
		     sdae: stacked denoising autoencoder, then fine-tuning\n\
		     simple_m1: autoencoder on the unlabelled samples, then a classifier on the codes\n\
		     m1: VAE on the unlabelled samples, then a classifier on the latent codes\n\
		     m2: semi-supervised VAE with a jointly trained classifier\n\
		     ssgan: semi-supervised GAN"
    )]
    model: ModelKind,

    #[arg(
        required = true,
        help = "Data files",
        long_help = "Data files to be processed.\n\
		     csv: `.csv`/`.tsv` (optionally `.gz`) files sharing one header.\n\
		     idx: pairs of image and label files, e.g.,\n\
		     `train-images.idx3-ubyte train-labels.idx1-ubyte`."
    )]
    data_files: Vec<Box<str>>,

    #[arg(
        long,
        value_enum,
        default_value = "csv",
        help = "Data format",
        long_help = "Format of the data files.\n\
		     Options: csv, idx."
    )]
    format: DataFormat,

    #[arg(
        long,
        required = true,
        help = "Dataset name",
        long_help = "Name of the dataset, used in output paths and checkpoint keys."
    )]
    dataset_name: Box<str>,

    #[arg(
        long,
        short = 'n',
        required = true,
        help = "Number of labelled samples",
        long_help = "Number of training samples whose labels are visible.\n\
		     Drawn per fold with the class proportions of the training part."
    )]
    num_labelled: usize,

    #[arg(
        long,
        short = 'k',
        default_value_t = 5,
        help = "Number of folds",
        long_help = "Number of stratified cross-validation folds.\n\
		     The held-out fold is split in half into validation and test sets."
    )]
    num_folds: usize,

    #[arg(
        long,
        short,
        required = true,
        help = "Output directory",
        long_help = "Output directory. Results are written to:\n\
		     - {out}/{dataset}/{model}/state/ (checkpoints)\n\
		     - {out}/{dataset}/{model}/results/{n}_fold{i}_trace.csv\n\
		     - {out}/{dataset}/{model}/results/{n}_test_accuracy.csv\n\
		     - {out}/{dataset}/{model}/results/{n}_test_results.json"
    )]
    out: Box<str>,

    #[arg(
        long,
        default_value = "label",
        help = "Label column",
        long_help = "Name of the label column in the header of csv/tsv files."
    )]
    label_column: Box<str>,

    #[arg(
        long,
        default_value_t = false,
        help = "First column holds sample names",
        long_help = "Skip the first column of csv/tsv files (sample names)."
    )]
    row_names: bool,

    #[arg(
        long,
        value_enum,
        default_value = "drop-samples",
        help = "Missing value policy",
        long_help = "How to handle missing feature values in csv/tsv files.\n\
		     drop-samples: drop rows with a missing value\n\
		     drop-features: drop columns with a missing value\n\
		     mean: fill in the column mean\n\
		     zero: fill in zero\n\
		     Rows without a label are always dropped."
    )]
    impute: Imputation,

    #[arg(
        long,
        value_enum,
        default_value = "range",
        help = "Feature normalization",
        long_help = "Column normalization fitted on the training part of each fold.\n\
		     range: (x - min) / (max - min), required by simple_m1, m1 and m2\n\
		     gaussian: (x - mean) / std\n\
		     none: keep the data as is"
    )]
    normalize: Normalization,

    #[arg(
        long,
        value_enum,
        default_value = "stratified",
        help = "Labelled subset sampling",
        long_help = "How the labelled samples are spread over the classes.\n\
		     stratified: keep the class proportions of the training part\n\
		     uniform: the same number per class, capped by the class size"
    )]
    label_sampling: LabelSampling,

    #[arg(
        long,
        default_value_t = 0,
        help = "Minimum class size",
        long_help = "Drop classes with fewer samples than this before splitting."
    )]
    min_class_size: usize,

    #[arg(
        long,
        value_delimiter = ',',
        help = "Hidden layers",
        long_help = "Hidden layer sizes of the main network, e.g., `256,128`.\n\
		     Each model has its own default."
    )]
    hidden_layers: Option<Vec<usize>>,

    #[arg(
        long,
        help = "Latent dimension",
        long_help = "Latent dimension of simple_m1, m1, m2 (default 32) and the ssgan noise (default 50)."
    )]
    latent_dim: Option<usize>,

    #[arg(
        long,
        short = 'i',
        default_value_t = DEFAULT_MAX_EPOCHS,
        help = "Maximum number of epochs",
        long_help = "Upper bound on training epochs; early stopping may end sooner."
    )]
    epochs: usize,

    #[arg(
        long,
        default_value_t = 10,
        help = "Pretraining epochs",
        long_help = "Fixed number of autoencoder epochs (pretraining, sdae per layer)."
    )]
    pretrain_epochs: usize,

    #[arg(
        long,
        help = "Patience",
        long_help = "Epochs without improvement before stopping.\n\
		     Defaults: 7 for m2, 1 otherwise."
    )]
    patience: Option<usize>,

    #[arg(
        long,
        default_value_t = 0.,
        help = "Minimum improvement",
        long_help = "A validation score counts as better only if it drops by more than this."
    )]
    min_delta: f32,

    #[arg(
        long,
        default_value_t = 0.1,
        help = "Classification weight scale",
        long_help = "m2 classification weight alpha = scale * |unlabelled| / |labelled|."
    )]
    alpha_scale: f64,

    #[arg(
        long,
        default_value_t = 100,
        help = "Minibatch size",
        long_help = "Number of samples per minibatch."
    )]
    minibatch_size: usize,

    #[arg(
        long,
        default_value_t = 1e-3,
        help = "Learning rate",
        long_help = "AdamW learning rate."
    )]
    learning_rate: f32,

    #[arg(
        long,
        value_enum,
        default_value = "cpu",
        help = "Candle device",
        long_help = "Candle device to use for computation.\n\
		     Options: cpu, cuda, metal."
    )]
    device: ComputeDevice,

    #[arg(
        long,
        default_value_t = 0,
        help = "A device for cuda",
        long_help = "For cuda or metal, we may want to choose a different device."
    )]
    device_no: usize,

    #[arg(
        long,
        default_value_t = 42,
        help = "Random seed",
        long_help = "Seed for fold assignment, labelled subsets, shuffling and noise."
    )]
    seed: u64,

    #[arg(
        long,
        short,
        default_value_t = false,
        help = "Verbose output",
        long_help = "Log every epoch instead of showing a progress bar."
    )]
    verbose: bool,
}

impl RunArgs {
    fn model_name(&self) -> &'static str {
        match self.model {
            ModelKind::Simple => "simple",
            ModelKind::Pretraining => "pretraining",
            ModelKind::Sdae => "sdae",
            ModelKind::SimpleM1 => "simple_m1",
            ModelKind::M1 => "m1",
            ModelKind::M2 => "m2",
            ModelKind::Ssgan => "ssgan",
        }
    }

    fn train_config(&self, device: &candle_core::Device, seed: u64) -> TrainConfig {
        TrainConfig {
            learning_rate: self.learning_rate,
            batch_size: self.minibatch_size,
            num_epochs: self.epochs,
            num_pretrain_epochs: self.pretrain_epochs,
            device: device.clone(),
            verbose: self.verbose,
            show_progress: true,
            patience: self.patience,
            min_delta: self.min_delta,
            alpha_scale: self.alpha_scale,
            seed,
        }
    }
}

fn build_runner(
    model: ModelKind,
    shape: &ModelShape,
    num_labelled: usize,
    num_unlabelled: usize,
    train_config: &TrainConfig,
) -> anyhow::Result<Box<dyn ModelRunnerT>> {
    Ok(match model {
        ModelKind::Simple => Box::new(SimpleRunner::new(shape, train_config)?),
        ModelKind::Pretraining => Box::new(PretrainingRunner::new(shape, train_config)?),
        ModelKind::Sdae => Box::new(SdaeRunner::new(shape, train_config)?),
        ModelKind::SimpleM1 => Box::new(SimpleM1Runner::new(shape, train_config)?),
        ModelKind::M1 => Box::new(M1Runner::new(shape, train_config)?),
        ModelKind::M2 => Box::new(M2Runner::new(
            shape,
            num_labelled,
            num_unlabelled,
            train_config,
        )?),
        ModelKind::Ssgan => Box::new(SsganRunner::new(shape, train_config)?),
    })
}

pub fn run_experiment(args: &RunArgs) -> anyhow::Result<()> {
    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let results = run_cross_validation(args)?;
    info!(
        "{} on {}: test accuracy {} +/- {}",
        results.model, results.dataset, results.mean_accuracy, results.std_accuracy
    );
    Ok(())
}

/// Train and test `args.model` on every fold
pub fn run_cross_validation(args: &RunArgs) -> anyhow::Result<TestResults> {
    if args.model.needs_unit_interval() && args.normalize == Normalization::Gaussian {
        return Err(anyhow::anyhow!(
            "{} has a Bernoulli likelihood; use --normalize range",
            args.model_name()
        ));
    }

    let device = match args.device {
        ComputeDevice::Metal => candle_core::Device::new_metal(args.device_no)?,
        ComputeDevice::Cuda => candle_core::Device::new_cuda(args.device_no)?,
        _ => candle_core::Device::Cpu,
    };

    // 1. Read the data
    let input = match args.format {
        DataFormat::Csv => read_delimited_with_labels(
            &args.data_files,
            &args.label_column,
            args.row_names,
            args.impute,
        )?,
        DataFormat::Idx => read_idx_with_labels(&args.data_files)?,
    };
    let input = if args.min_class_size > 0 {
        input.filter_min_class_size(args.min_class_size)?
    } else {
        input
    };

    // 2. Folds
    let splits = cross_validation_splits(
        &input.labels,
        input.num_classes(),
        args.num_folds,
        args.num_labelled,
        args.label_sampling,
        args.seed,
    )?;

    let dirs = OutputDirs::create(&args.out, &args.dataset_name, args.model_name())?;
    let mut test_accuracy = vec![];
    let mut epochs_trained = vec![];

    for (fold, split) in splits.iter().enumerate() {
        let seed = args.seed + fold as u64;
        let train_config = args.train_config(&device, seed);

        info!(
            "fold {}: {} train, {} labelled, {} validation, {} test",
            fold,
            split.train.len(),
            split.labelled.len(),
            split.validation.len(),
            split.test.len()
        );

        // 3. Normalize with the training statistics
        let normalizer = fit_normalizer(args.normalize, &select_rows(&input.data, &split.train));
        let prepare = |rows: &[usize]| normalizer.transform(&select_rows(&input.data, rows));
        let labels_of = |rows: &[usize]| select_labels(&input.labels, rows);

        let mut data = SemiSupervisedData {
            labelled: InMemoryData::new_with_labels(
                &prepare(&split.labelled),
                &labels_of(&split.labelled),
                seed,
            )?,
            unlabelled: InMemoryData::new(&prepare(&split.train), seed + 1)?,
            validation: InMemoryData::new_with_labels(
                &prepare(&split.validation),
                &labels_of(&split.validation),
                seed + 2,
            )?,
        };
        let test = InMemoryData::new_with_labels(
            &prepare(&split.test),
            &labels_of(&split.test),
            seed + 3,
        )?;

        // 4. Train with early stopping
        let shape = ModelShape {
            n_features: input.data.ncols(),
            n_classes: input.num_classes(),
            hidden_layers: args.hidden_layers.clone(),
            latent_dim: args.latent_dim,
        };
        let mut runner = build_runner(
            args.model,
            &shape,
            split.labelled.len(),
            split.train.len(),
            &train_config,
        )?;

        let mut store = FileCheckpointStore::new(&dirs.state);
        let key_prefix = format!(
            "{}/{}_fold{}",
            runner.checkpoint_identity(),
            args.dataset_name,
            fold
        );

        runner.pretrain(&mut data, &mut store, &key_prefix, &train_config)?;

        let key = format!("{}{}", key_prefix, runner.stage_suffix());
        let mut controller = TrainingController::new(
            &key,
            train_config.early_stopping(runner.default_patience()),
            &mut store,
        );
        let trace =
            fit_with_early_stopping(runner.as_mut(), &mut data, &mut controller, &train_config)?;
        dirs.write_trace(args.num_labelled, fold, &trace)?;

        // 5. Test the restored model
        let acc = runner.evaluate(&test, &train_config)?;
        info!(
            "fold {}: {} epochs, best validation score {}, test accuracy {}",
            fold,
            trace.epochs.len(),
            trace.best_score,
            acc
        );
        test_accuracy.push(acc);
        epochs_trained.push(trace.epochs.len());
    }

    let results = TestResults::new(
        args.model_name(),
        &args.dataset_name,
        args.num_labelled,
        test_accuracy,
        epochs_trained,
    );
    dirs.write_test_results(&results)?;
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        args: RunArgs,
    }

    fn write_toy_csv(file: &str) -> anyhow::Result<()> {
        let mut writer = open_buf_writer(file)?;
        writeln!(writer, "sample,f0,f1,f2,f3,label")?;
        for i in 0..40 {
            let (label, on) = if i % 2 == 0 { ("tumor", 0) } else { ("normal", 2) };
            let x: Vec<String> = (0..4)
                .map(|j| {
                    let base = if j / 2 == on / 2 { 5.0 } else { 1.0 };
                    format!("{}", base + (i % 5) as f32 * 0.1)
                })
                .collect();
            writeln!(writer, "s{},{},{}", i, x.join(","), label)?;
        }
        writer.flush()?;
        Ok(())
    }

    #[test]
    fn cross_validation_writes_every_result() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let csv = dir.path().join("toy.csv.gz");
        let csv = csv.to_string_lossy().into_owned();
        write_toy_csv(&csv)?;
        let out = dir.path().join("out").to_string_lossy().into_owned();

        let cli = TestCli::try_parse_from([
            "lentil",
            "simple",
            csv.as_str(),
            "--dataset-name",
            "toy",
            "--num-labelled",
            "6",
            "--num-folds",
            "2",
            "--out",
            out.as_str(),
            "--row-names",
            "--hidden-layers",
            "8",
            "--epochs",
            "3",
            "--minibatch-size",
            "4",
        ])?;

        let results = run_cross_validation(&cli.args)?;
        assert_eq!(results.test_accuracy.len(), 2);
        assert!(results.epochs_trained.iter().all(|&e| (1..=3).contains(&e)));

        let root = dir.path().join("out").join("toy").join("simple");
        assert!(root.join("state").join("simple").join("toy_fold0.safetensors").exists());
        assert!(root.join("results").join("6_fold1_trace.csv").exists());
        assert!(root.join("results").join("6_test_results.json").exists());
        Ok(())
    }

    #[test]
    fn simple_m1_cross_validation_with_imputation() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let csv = dir.path().join("toy.csv");
        let csv = csv.to_string_lossy().into_owned();
        write_toy_csv(&csv)?;
        {
            // one hole that the mean policy fills in
            let mut writer = std::fs::OpenOptions::new().append(true).open(&csv)?;
            writeln!(writer, "s40,5.0,,1.0,1.0,tumor")?;
        }
        let out = dir.path().join("out").to_string_lossy().into_owned();

        let cli = TestCli::try_parse_from([
            "lentil",
            "simple_m1",
            csv.as_str(),
            "--dataset-name",
            "toy",
            "--num-labelled",
            "6",
            "--num-folds",
            "2",
            "--out",
            out.as_str(),
            "--row-names",
            "--impute",
            "mean",
            "--label-sampling",
            "uniform",
            "--hidden-layers",
            "8",
            "--latent-dim",
            "2",
            "--epochs",
            "2",
            "--minibatch-size",
            "4",
        ])?;
        assert_eq!(cli.args.model, ModelKind::SimpleM1);
        assert_eq!(cli.args.impute, Imputation::Mean);

        let results = run_cross_validation(&cli.args)?;
        assert_eq!(results.test_accuracy.len(), 2);

        let state = dir.path().join("out").join("toy").join("simple_m1").join("state");
        let stage = |name: &str| state.join("simple_m1").join(format!("{}.safetensors", name));
        assert!(stage("toy_fold1_autoencoder").exists());
        assert!(stage("toy_fold1_classifier").exists());
        Ok(())
    }

    #[test]
    fn bernoulli_models_reject_gaussian_normalization() -> anyhow::Result<()> {
        let cli = TestCli::try_parse_from([
            "lentil",
            "m2",
            "data.csv",
            "--dataset-name",
            "toy",
            "--num-labelled",
            "6",
            "--out",
            "out",
            "--normalize",
            "gaussian",
        ])?;
        assert!(run_cross_validation(&cli.args).is_err());
        Ok(())
    }
}
