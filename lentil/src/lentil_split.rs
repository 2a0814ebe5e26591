use crate::lentil_common::*;
use rand::prelude::SliceRandom;
use rand::rngs::StdRng;
use rand::SeedableRng;

const GAUSSIAN_EPS: f32 = 1e-7;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum Normalization {
    /// (x - min) / (max - min), clamped to [0, 1]
    Range,
    /// (x - mean) / std
    Gaussian,
    /// keep the data as is
    None,
}

/// Column-wise transformation fitted on the training rows
pub trait ColumnNormalizer {
    fn transform(&self, x: &Mat) -> Mat;
}

pub struct RangeNormalizer {
    min: Vec<f32>,
    range: Vec<f32>,
}

impl RangeNormalizer {
    pub fn fit(train: &Mat) -> Self {
        let (min, range) = train
            .column_iter()
            .map(|c| {
                let lb = c.min();
                (lb, c.max() - lb)
            })
            .unzip();
        Self { min, range }
    }
}

impl ColumnNormalizer for RangeNormalizer {
    fn transform(&self, x: &Mat) -> Mat {
        Mat::from_fn(x.nrows(), x.ncols(), |i, j| {
            if self.range[j] > 0. {
                ((x[(i, j)] - self.min[j]) / self.range[j]).clamp(0., 1.)
            } else {
                0.
            }
        })
    }
}

pub struct GaussianNormalizer {
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl GaussianNormalizer {
    pub fn fit(train: &Mat) -> Self {
        let (mean, std) = train
            .column_iter()
            .map(|c| (c.mean(), c.variance().sqrt()))
            .unzip();
        Self { mean, std }
    }
}

impl ColumnNormalizer for GaussianNormalizer {
    fn transform(&self, x: &Mat) -> Mat {
        Mat::from_fn(x.nrows(), x.ncols(), |i, j| {
            (x[(i, j)] - self.mean[j]) / (GAUSSIAN_EPS + self.std[j])
        })
    }
}

struct Identity;

impl ColumnNormalizer for Identity {
    fn transform(&self, x: &Mat) -> Mat {
        x.clone()
    }
}

pub fn fit_normalizer(kind: Normalization, train: &Mat) -> Box<dyn ColumnNormalizer> {
    match kind {
        Normalization::Range => Box::new(RangeNormalizer::fit(train)),
        Normalization::Gaussian => Box::new(GaussianNormalizer::fit(train)),
        Normalization::None => Box::new(Identity),
    }
}

/// Row indexes of one cross-validation fold
#[derive(Clone, Debug)]
pub struct FoldSplit {
    /// everything outside the held-out fold; all of it is used unlabelled
    pub train: Vec<usize>,
    /// stratified subset of `train` whose labels are visible
    pub labelled: Vec<usize>,
    pub validation: Vec<usize>,
    pub test: Vec<usize>,
}

fn rows_by_class(rows: &[usize], labels: &[u32], num_classes: usize) -> Vec<Vec<usize>> {
    let mut out = vec![vec![]; num_classes];
    for &i in rows {
        out[labels[i] as usize].push(i);
    }
    out
}

///
/// Assign each sample to one of `num_folds` folds. The samples of a
/// class are shuffled, then dealt round robin, so every fold gets a
/// near-equal share of every class.
///
pub fn stratified_k_fold(
    labels: &[u32],
    num_classes: usize,
    num_folds: usize,
    seed: u64,
) -> anyhow::Result<Vec<Vec<usize>>> {
    if num_folds < 2 {
        return Err(anyhow::anyhow!("need at least two folds"));
    }
    if labels.len() < num_folds {
        return Err(anyhow::anyhow!(
            "{} samples for {} folds",
            labels.len(),
            num_folds
        ));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let all: Vec<usize> = (0..labels.len()).collect();

    let mut folds = vec![vec![]; num_folds];
    let mut next = 0;
    for mut members in rows_by_class(&all, labels, num_classes) {
        members.shuffle(&mut rng);
        for i in members {
            folds[next].push(i);
            next = (next + 1) % num_folds;
        }
    }

    for f in folds.iter_mut() {
        f.sort_unstable();
    }
    Ok(folds)
}

/// Split a held-out fold in half, alternating within each class
/// between validation and test
pub fn split_validation_test(
    held_out: &[usize],
    labels: &[u32],
    num_classes: usize,
) -> (Vec<usize>, Vec<usize>) {
    let mut validation = vec![];
    let mut test = vec![];
    for members in rows_by_class(held_out, labels, num_classes) {
        for (r, i) in members.into_iter().enumerate() {
            if r % 2 == 0 {
                validation.push(i);
            } else {
                test.push(i);
            }
        }
    }
    validation.sort_unstable();
    test.sort_unstable();
    (validation, test)
}

/// How the labelled subset is spread over the classes
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum LabelSampling {
    /// each class gets `ceil(count / total * num_labelled)`
    Stratified,
    /// each class gets `ceil(num_labelled / num_classes)`, capped by its size
    Uniform,
}

///
/// Draw `num_labelled` rows of `train`. Each class gets a quota
/// (see `LabelSampling`), capped by the class size; then the largest
/// allocation gives up one row at a time until the total is exactly
/// `num_labelled`. Uniform quotas can fall short when a class is
/// smaller than its share, in which case fewer rows come back.
///
pub fn labelled_split(
    train: &[usize],
    labels: &[u32],
    num_classes: usize,
    num_labelled: usize,
    sampling: LabelSampling,
    seed: u64,
) -> anyhow::Result<Vec<usize>> {
    if num_labelled <= num_classes {
        return Err(anyhow::anyhow!(
            "need more labelled samples ({}) than classes ({})",
            num_labelled,
            num_classes
        ));
    }
    if num_labelled > train.len() {
        return Err(anyhow::anyhow!(
            "{} labelled samples requested from {} training samples",
            num_labelled,
            train.len()
        ));
    }

    let total = train.len() as f32;
    let per_class = num_labelled.div_ceil(num_classes);
    let mut members = rows_by_class(train, labels, num_classes);

    let mut quota: Vec<usize> = members
        .iter()
        .map(|m| {
            let q = match sampling {
                LabelSampling::Stratified => {
                    (m.len() as f32 / total * num_labelled as f32).ceil() as usize
                }
                LabelSampling::Uniform => per_class,
            };
            q.min(m.len())
        })
        .collect();

    let mut assigned: usize = quota.iter().sum();
    while assigned > num_labelled {
        let (largest, _) = quota
            .iter()
            .enumerate()
            .fold((0, 0), |(kmax, qmax), (k, &q)| if q > qmax { (k, q) } else { (kmax, qmax) });
        quota[largest] -= 1;
        assigned -= 1;
    }
    if assigned < num_labelled {
        warn!(
            "only {} of {} labelled samples available with {:?} sampling",
            assigned, num_labelled, sampling
        );
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = vec![];
    for (m, q) in members.iter_mut().zip(quota) {
        m.shuffle(&mut rng);
        out.extend_from_slice(&m[..q]);
    }
    out.sort_unstable();
    Ok(out)
}

/// Every fold's train, labelled, validation and test rows
pub fn cross_validation_splits(
    labels: &[u32],
    num_classes: usize,
    num_folds: usize,
    num_labelled: usize,
    sampling: LabelSampling,
    seed: u64,
) -> anyhow::Result<Vec<FoldSplit>> {
    let folds = stratified_k_fold(labels, num_classes, num_folds, seed)?;

    let mut splits = vec![];
    for (f, held_out) in folds.iter().enumerate() {
        let mut train: Vec<usize> = folds
            .iter()
            .enumerate()
            .filter(|&(g, _)| g != f)
            .flat_map(|(_, rows)| rows.iter().copied())
            .collect();
        train.sort_unstable();

        let (validation, test) = split_validation_test(held_out, labels, num_classes);
        let labelled = labelled_split(
            &train,
            labels,
            num_classes,
            num_labelled,
            sampling,
            seed + f as u64,
        )?;

        splits.push(FoldSplit {
            train,
            labelled,
            validation,
            test,
        });
    }
    Ok(splits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_labels() -> Vec<u32> {
        // 12 of class 0, 6 of class 1, 6 of class 2
        (0..24).map(|i| if i < 12 { 0 } else if i < 18 { 1 } else { 2 }).collect()
    }

    #[test]
    fn folds_partition_and_stratify() -> anyhow::Result<()> {
        let labels = toy_labels();
        let folds = stratified_k_fold(&labels, 3, 3, 7)?;

        let mut all: Vec<usize> = folds.iter().flatten().copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..24).collect::<Vec<_>>());

        for f in folds.iter() {
            assert_eq!(f.len(), 8);
            let n0 = f.iter().filter(|&&i| labels[i] == 0).count();
            assert_eq!(n0, 4);
        }
        Ok(())
    }

    #[test]
    fn labelled_subset_keeps_proportions() -> anyhow::Result<()> {
        let labels = toy_labels();
        let train: Vec<usize> = (0..24).collect();
        let lab = labelled_split(&train, &labels, 3, 7, LabelSampling::Stratified, 0)?;
        assert_eq!(lab.len(), 7);

        // ceil(3.5), ceil(1.75), ceil(1.75) = 4, 2, 2, trimmed from class 0
        let counts: Vec<usize> = (0..3)
            .map(|k| lab.iter().filter(|&&i| labels[i] == k).count())
            .collect();
        assert_eq!(counts, vec![3, 2, 2]);
        Ok(())
    }

    #[test]
    fn uniform_labelled_subset_balances_classes() -> anyhow::Result<()> {
        let labels = toy_labels();
        let train: Vec<usize> = (0..24).collect();
        let count = |lab: &[usize]| -> Vec<usize> {
            (0..3)
                .map(|k| lab.iter().filter(|&&i| labels[i] == k).count())
                .collect()
        };

        // ceil(7 / 3) = 3 each, trimmed from the first largest
        let lab = labelled_split(&train, &labels, 3, 7, LabelSampling::Uniform, 0)?;
        assert_eq!(count(&lab), vec![2, 2, 3]);

        // ceil(21 / 3) = 7 each, but classes 1 and 2 only have 6
        let lab = labelled_split(&train, &labels, 3, 21, LabelSampling::Uniform, 0)?;
        assert_eq!(count(&lab), vec![7, 6, 6]);
        assert_eq!(lab.len(), 19);
        Ok(())
    }

    #[test]
    fn too_few_labelled_samples() {
        let labels = toy_labels();
        let train: Vec<usize> = (0..24).collect();
        assert!(labelled_split(&train, &labels, 3, 3, LabelSampling::Stratified, 0).is_err());
        assert!(labelled_split(&train, &labels, 3, 25, LabelSampling::Uniform, 0).is_err());
    }

    #[test]
    fn held_out_fold_splits_in_half() -> anyhow::Result<()> {
        let labels = toy_labels();
        let splits = cross_validation_splits(&labels, 3, 3, 6, LabelSampling::Stratified, 1)?;
        assert_eq!(splits.len(), 3);
        for s in splits.iter() {
            assert_eq!(s.train.len(), 16);
            assert_eq!(s.validation.len() + s.test.len(), 8);
            assert_eq!(s.validation.len(), 4);
            assert!(s.labelled.iter().all(|i| s.train.binary_search(i).is_ok()));
            assert!(s.test.iter().all(|i| s.train.binary_search(i).is_err()));
        }
        Ok(())
    }

    #[test]
    fn normalizers_use_training_statistics() {
        let train = Mat::from_row_slice(3, 2, &[0., 5., 1., 5., 2., 5.]);
        let test = Mat::from_row_slice(1, 2, &[4., 1.]);

        let range = RangeNormalizer::fit(&train);
        let out = range.transform(&test);
        approx::assert_abs_diff_eq!(out[(0, 0)], 1.0);
        approx::assert_abs_diff_eq!(out[(0, 1)], 0.0);

        let gauss = GaussianNormalizer::fit(&train);
        let out = gauss.transform(&train);
        approx::assert_abs_diff_eq!(out[(1, 0)], 0.0, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(out[(2, 0)], 1.0 / (2f32 / 3.).sqrt(), epsilon = 1e-4);
    }
}
