mod fit_m1;
mod fit_m2;
mod fit_pretraining;
mod fit_sdae;
mod fit_simple;
mod fit_simple_m1;
mod fit_ssgan;
mod lentil_common;
mod lentil_input;
mod lentil_output;
mod lentil_split;
mod run_experiment;

use lentil_common::*;
use run_experiment::*;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "LENTIL",
    long_about = "Semi-supervised classification with few labels, evaluated by cross-validation.\n\
		  Labelled data in `.csv`/`.tsv` (optionally gzipped) or MNIST `idx` format."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Cross-validate a (semi-)supervised classifier",
        long_about = "Train and test a model on stratified folds in the stages: \n\
		      (1) Split each fold into labelled, unlabelled, validation and test sets\n\
		      (2) Pretrain (autoencoders, M1's VAE) if the model has such a stage\n\
		      (3) Train with early stopping on the validation score\n\
		      (4) Restore the best checkpoint and report test accuracy.\n"
    )]
    Run(RunArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.commands {
        Commands::Run(args) => {
            run_experiment(args)?;
        }
    }

    info!("Done");
    Ok(())
}
