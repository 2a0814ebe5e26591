#![allow(dead_code)]

use candle_core::{Device, Tensor};
use nalgebra::DMatrix;
use rand::prelude::SliceRandom;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

pub struct MinibatchData {
    pub input: Tensor,
    pub labels: Option<Tensor>,
}

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData>;

    /// All samples in their original order as one batch
    fn full_data(&self, target_device: &Device) -> anyhow::Result<MinibatchData>;

    fn num_minibatch(&self) -> usize;

    /// Total number of samples (not minibatches)
    fn num_samples(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

///
/// A simple data loader for in-memory 2d matrix.  Each row will be
/// considered as a feature vector. The number of samples is the
/// number of rows. Labels, if any, are class indexes.
///
pub struct InMemoryData {
    input_data: Vec<Tensor>,
    label_data: Option<Vec<u32>>,

    shuffled_input_data: Option<Vec<Tensor>>,
    shuffled_label_data: Option<Vec<Tensor>>,

    minibatches: Minibatches,
}

impl InMemoryData {
    ///
    /// Create a data loader with the main data tensor `data`
    ///
    pub fn new<D>(data: &D, seed: u64) -> anyhow::Result<Self>
    where
        D: RowsToTensorVec,
    {
        let data = data.rows_to_tensor_vec()?;
        let rows = (0..data.len()).collect();

        Ok(InMemoryData {
            input_data: data,
            label_data: None,
            shuffled_input_data: None,
            shuffled_label_data: None,
            minibatches: Minibatches::new(rows, seed),
        })
    }

    ///
    /// Create a data loader with the main `data` and class `labels`
    ///
    pub fn new_with_labels<D>(data: &D, labels: &[u32], seed: u64) -> anyhow::Result<Self>
    where
        D: RowsToTensorVec,
    {
        let data = data.rows_to_tensor_vec()?;

        if data.len() != labels.len() {
            return Err(anyhow::anyhow!(
                "{} rows vs. {} labels",
                data.len(),
                labels.len()
            ));
        }

        let rows = (0..data.len()).collect();

        Ok(InMemoryData {
            input_data: data,
            label_data: Some(labels.to_vec()),
            shuffled_input_data: None,
            shuffled_label_data: None,
            minibatches: Minibatches::new(rows, seed),
        })
    }

    pub fn has_labels(&self) -> bool {
        self.label_data.is_some()
    }

    pub fn labels(&self) -> Option<&[u32]> {
        self.label_data.as_deref()
    }

    pub fn num_features(&self) -> usize {
        self.input_data.first().map(|x| x.dims()[1]).unwrap_or(0)
    }
}

impl DataLoader for InMemoryData {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        if let Some(input) =
            take_shuffled(batch_idx, target_device, self.shuffled_input_data.as_ref())?
        {
            let labels =
                take_shuffled(batch_idx, target_device, self.shuffled_label_data.as_ref())?;
            Ok(MinibatchData { input, labels })
        } else {
            Err(anyhow::anyhow!("need to shuffle data"))
        }
    }

    fn full_data(&self, target_device: &Device) -> anyhow::Result<MinibatchData> {
        if self.input_data.is_empty() {
            return Err(anyhow::anyhow!("empty data"));
        }
        let input = Tensor::cat(&self.input_data, 0)?.to_device(target_device)?;
        let labels = match self.label_data.as_ref() {
            Some(labels) => Some(Tensor::from_slice(labels, labels.len(), target_device)?),
            None => None,
        };
        Ok(MinibatchData { input, labels })
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn num_samples(&self) -> usize {
        self.input_data.len()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        /////////////////////
        // shuffle indexes //
        /////////////////////

        self.minibatches.shuffle_minibatch(batch_size)?;

        ///////////////////////////////////
        // preload all the shuffled data //
        ///////////////////////////////////

        let mut shuffled_input = Vec::with_capacity(self.num_minibatch());
        let mut shuffled_labels = Vec::with_capacity(self.num_minibatch());

        for samples in self.minibatches.chunks.iter() {
            let chunk: Vec<Tensor> = samples
                .iter()
                .map(|&i| self.input_data[i].clone())
                .collect();
            shuffled_input.push(Tensor::cat(&chunk, 0)?);

            if let Some(label_data) = self.label_data.as_ref() {
                let chunk: Vec<u32> = samples.iter().map(|&i| label_data[i]).collect();
                let n = chunk.len();
                shuffled_labels.push(Tensor::from_vec(chunk, n, &Device::Cpu)?);
            }
        }

        self.shuffled_input_data = Some(shuffled_input);
        self.shuffled_label_data = self.label_data.as_ref().map(|_| shuffled_labels);

        Ok(())
    }
}

fn take_shuffled(
    batch_idx: usize,
    target_device: &Device,
    data_vec: Option<&Vec<Tensor>>,
) -> anyhow::Result<Option<Tensor>> {
    if let Some(data_vec) = data_vec {
        if data_vec.len() <= batch_idx {
            Err(anyhow::anyhow!(
                "invalid index = {} vs. total # = {}",
                batch_idx,
                data_vec.len()
            ))
        } else {
            Ok(Some(data_vec[batch_idx].to_device(target_device)?))
        }
    } else {
        // if the data vector doesn't exist
        Ok(None)
    }
}

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` partition the
/// samples (the last chunk may be smaller than the batch size).
///
pub struct Minibatches {
    samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
    rng: StdRng,
}

impl Minibatches {
    pub fn new(samples: Vec<usize>, seed: u64) -> Self {
        Self {
            samples,
            chunks: vec![],
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        if batch_size == 0 {
            return Err(anyhow::anyhow!("batch size must be positive"));
        }
        self.samples.shuffle(&mut self.rng);
        self.chunks = self
            .samples
            .chunks(batch_size)
            .map(|c| c.to_vec())
            .collect();
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}

/// Labelled, unlabelled and validation sets of one semi-supervised
/// training run
pub struct SemiSupervisedData {
    pub labelled: InMemoryData,
    pub unlabelled: InMemoryData,
    pub validation: InMemoryData,
}

impl SemiSupervisedData {
    pub fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        self.labelled.shuffle_minibatch(batch_size)?;
        self.unlabelled.shuffle_minibatch(batch_size)?;
        self.validation.shuffle_minibatch(batch_size)
    }
}

///
/// Pair every unlabelled minibatch with a labelled one; the labelled
/// minibatches start over from the beginning once exhausted.
///
/// # Returns `(unlabelled_idx, labelled_idx)` for each optimizer step
pub fn cyclic_minibatch_pairs(num_unlabelled: usize, num_labelled: usize) -> Vec<(usize, usize)> {
    if num_labelled == 0 {
        return vec![];
    }
    (0..num_unlabelled).map(|b| (b, b % num_labelled)).collect()
}

///
/// Convert rows of a matrix to a vector of `Tensor`
///
pub trait RowsToTensorVec {
    fn rows_to_tensor_vec(&self) -> candle_core::Result<Vec<Tensor>>;
}

impl RowsToTensorVec for DMatrix<f32> {
    fn rows_to_tensor_vec(&self) -> candle_core::Result<Vec<Tensor>> {
        let ncol = self.ncols();
        let mut idx_data = self
            .row_iter()
            .enumerate()
            .par_bridge()
            .map(|(i, row)| {
                let v = Tensor::from_iter(row.iter().copied(), &Device::Cpu)?;
                Ok((i, v.reshape((1, ncol))?))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        idx_data.sort_by_key(|(i, _)| *i);
        Ok(idx_data.into_iter().map(|(_, t)| t).collect())
    }
}

impl RowsToTensorVec for Tensor {
    fn rows_to_tensor_vec(&self) -> candle_core::Result<Vec<Tensor>> {
        (0..self.dim(0)?).map(|i| self.narrow(0, i, 1)).collect()
    }
}
