use crate::lentil_common::*;
use candle_util::candle_model_runner::TrainTrace;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

/// `<out>/<dataset>/<model>/{state,results}`
pub struct OutputDirs {
    pub state: PathBuf,
    pub results: PathBuf,
}

impl OutputDirs {
    pub fn create(out: &str, dataset: &str, model: &str) -> anyhow::Result<Self> {
        let root = Path::new(out).join(dataset).join(model);
        let state = root.join("state");
        let results = root.join("results");
        std::fs::create_dir_all(&state)?;
        std::fs::create_dir_all(&results)?;
        Ok(Self { state, results })
    }

    fn result_file(&self, name: String) -> anyhow::Result<Box<str>> {
        self.results
            .join(name)
            .to_str()
            .map(Box::from)
            .ok_or(anyhow::anyhow!("non-UTF-8 output path"))
    }

    /// `<N>_fold<i>_trace.csv` with `epoch,train_loss,validation_score`
    pub fn write_trace(
        &self,
        num_labelled: usize,
        fold: usize,
        trace: &TrainTrace,
    ) -> anyhow::Result<Box<str>> {
        let file = self.result_file(format!("{}_fold{}_trace.csv", num_labelled, fold))?;
        let mut lines = vec!["epoch,train_loss,validation_score".to_string()];
        lines.extend(
            trace
                .epochs
                .iter()
                .map(|m| format!("{},{},{}", m.epoch, m.train_loss, m.validation_score)),
        );
        write_lines(&lines, &file)?;
        Ok(file)
    }

    /// `<N>_test_accuracy.csv` and `<N>_test_results.json`
    pub fn write_test_results(&self, results: &TestResults) -> anyhow::Result<()> {
        let csv = self.result_file(format!("{}_test_accuracy.csv", results.num_labelled))?;
        let mut lines = vec!["fold,accuracy".to_string()];
        lines.extend(
            results
                .test_accuracy
                .iter()
                .enumerate()
                .map(|(f, a)| format!("{},{}", f, a)),
        );
        write_lines(&lines, &csv)?;

        let json = self.result_file(format!("{}_test_results.json", results.num_labelled))?;
        let mut writer = open_buf_writer(&json)?;
        serde_json::to_writer_pretty(&mut writer, results)?;
        writer.flush()?;

        info!("wrote {} and {}", csv, json);
        Ok(())
    }
}

#[derive(Serialize, Debug)]
pub struct TestResults {
    pub model: String,
    pub dataset: String,
    pub num_labelled: usize,
    pub test_accuracy: Vec<f32>,
    pub mean_accuracy: f32,
    pub std_accuracy: f32,
    pub epochs_trained: Vec<usize>,
}

impl TestResults {
    pub fn new(
        model: &str,
        dataset: &str,
        num_labelled: usize,
        test_accuracy: Vec<f32>,
        epochs_trained: Vec<usize>,
    ) -> Self {
        let n = test_accuracy.len().max(1) as f32;
        let mean = test_accuracy.iter().sum::<f32>() / n;
        let var = test_accuracy.iter().map(|a| (a - mean).powi(2)).sum::<f32>() / n;
        Self {
            model: model.to_string(),
            dataset: dataset.to_string(),
            num_labelled,
            test_accuracy,
            mean_accuracy: mean,
            std_accuracy: var.sqrt(),
            epochs_trained,
        }
    }
}
