#![allow(dead_code)]

pub use clap::{Args, Parser, Subcommand, ValueEnum};
pub use log::{info, warn};

pub type Mat = nalgebra::DMatrix<f32>;
pub type DVec = nalgebra::DVector<f32>;

pub use candle_util::{candle_core, candle_nn};

use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

pub const DEFAULT_MAX_EPOCHS: usize = 200;

///
/// Open a file for reading, and return a buffered reader
/// * `input_file` - file name--either gzipped or not
pub fn open_buf_reader(input_file: &str) -> anyhow::Result<Box<dyn BufRead>> {
    let ext = Path::new(input_file).extension().and_then(|x| x.to_str());
    let file = File::open(input_file)
        .map_err(|e| anyhow::anyhow!("failed to open {}: {}", input_file, e))?;
    match ext {
        Some("gz") => Ok(Box::new(BufReader::new(GzDecoder::new(file)))),
        _ => Ok(Box::new(BufReader::new(file))),
    }
}

///
/// Open a file for writing, and return a buffered writer
/// * `output_file` - file name--either gzipped or not
pub fn open_buf_writer(output_file: &str) -> anyhow::Result<Box<dyn Write>> {
    let ext = Path::new(output_file).extension().and_then(|x| x.to_str());
    let file = File::create(output_file)?;
    match ext {
        Some("gz") => {
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            Ok(Box::new(BufWriter::new(encoder)))
        }
        _ => Ok(Box::new(BufWriter::new(file))),
    }
}

///
/// Write every line into the output_file
///
/// * `lines` - vector of lines
/// * `output_file` - file name--either gzipped or not
///
pub fn write_lines<T>(lines: &[T], output_file: &str) -> anyhow::Result<()>
where
    T: std::fmt::Display,
{
    let mut buf = open_buf_writer(output_file)?;
    for line in lines {
        writeln!(buf, "{}", line)?;
    }
    buf.flush()?;
    Ok(())
}

/// Take the rows of `mat` in the order of `rows`
pub fn select_rows(mat: &Mat, rows: &[usize]) -> Mat {
    Mat::from_fn(rows.len(), mat.ncols(), |i, j| mat[(rows[i], j)])
}

pub fn select_labels(labels: &[u32], rows: &[usize]) -> Vec<u32> {
    rows.iter().map(|&i| labels[i]).collect()
}

/// Dimensions and layer sizes handed to a model runner; `None` picks
/// the runner's default
pub struct ModelShape {
    pub n_features: usize,
    pub n_classes: usize,
    pub hidden_layers: Option<Vec<usize>>,
    pub latent_dim: Option<usize>,
}

impl ModelShape {
    pub fn layers_or(&self, default: &[usize]) -> Vec<usize> {
        self.hidden_layers
            .clone()
            .unwrap_or_else(|| default.to_vec())
    }

    pub fn latent_or(&self, default: usize) -> usize {
        self.latent_dim.unwrap_or(default)
    }
}

/// Two separable classes in `[0,1]^8`, split into labelled,
/// unlabelled and validation sets
#[cfg(test)]
pub fn toy_semisup_data(
    num_labelled: usize,
    num_unlabelled: usize,
) -> anyhow::Result<candle_util::candle_data_loader::SemiSupervisedData> {
    use candle_util::candle_data_loader::*;

    let blobs = |n: usize, offset: usize| {
        let labels: Vec<u32> = (0..n).map(|i| ((i + offset) % 2) as u32).collect();
        let x = Mat::from_fn(n, 8, |i, j| {
            let jitter = ((i * 7 + j * 3) % 5) as f32 * 0.02;
            if (j < 4) == (labels[i] == 0) {
                0.9 - jitter
            } else {
                0.1 + jitter
            }
        });
        (x, labels)
    };

    let (xl, yl) = blobs(num_labelled, 0);
    let (xu, _) = blobs(num_unlabelled, 1);
    let (xv, yv) = blobs(10, 0);

    Ok(SemiSupervisedData {
        labelled: InMemoryData::new_with_labels(&xl, &yl, 1)?,
        unlabelled: InMemoryData::new(&xu, 2)?,
        validation: InMemoryData::new_with_labels(&xv, &yv, 3)?,
    })
}
