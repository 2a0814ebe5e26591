use crate::lentil_common::*;
use rayon::prelude::*;
use std::collections::HashMap;
use std::io::{BufRead, Read};

/// Samples in rows with one class index per row
pub struct LabelledMatrix {
    pub data: Mat,
    pub labels: Vec<u32>,
    /// `class_names[k]` is the original label of class `k`
    pub class_names: Vec<Box<str>>,
}

impl LabelledMatrix {
    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.num_classes()];
        for &y in self.labels.iter() {
            counts[y as usize] += 1;
        }
        counts
    }

    ///
    /// Drop every class with fewer than `min_size` samples. The
    /// surviving classes keep their relative order and are renumbered
    /// `0..K'`.
    ///
    pub fn filter_min_class_size(self, min_size: usize) -> anyhow::Result<Self> {
        let counts = self.class_counts();

        let mut new_index = vec![None; counts.len()];
        let mut class_names = vec![];
        for (k, &n) in counts.iter().enumerate() {
            if n >= min_size {
                new_index[k] = Some(class_names.len() as u32);
                class_names.push(self.class_names[k].clone());
            } else {
                info!(
                    "dropping class {} with {} < {} samples",
                    self.class_names[k], n, min_size
                );
            }
        }

        if class_names.len() < 2 {
            return Err(anyhow::anyhow!(
                "fewer than two classes have at least {} samples",
                min_size
            ));
        }

        let (rows, labels): (Vec<usize>, Vec<u32>) = self
            .labels
            .iter()
            .enumerate()
            .filter_map(|(i, &y)| new_index[y as usize].map(|k| (i, k)))
            .unzip();

        Ok(Self {
            data: select_rows(&self.data, &rows),
            labels,
            class_names,
        })
    }
}

fn is_missing(token: &str) -> bool {
    let token = token.trim();
    token.is_empty() || token.eq_ignore_ascii_case("na") || token.eq_ignore_ascii_case("nan")
}

fn delimiter_of(file: &str) -> char {
    if file.ends_with(".tsv") || file.ends_with(".tsv.gz") || file.ends_with(".txt.gz") {
        '\t'
    } else {
        ','
    }
}

/// What to do with the missing values of a feature table
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
#[clap(rename_all = "kebab-case")]
pub enum Imputation {
    /// drop every row with a missing value
    DropSamples,
    /// drop every column with a missing value
    DropFeatures,
    /// fill in the column mean of the observed values
    Mean,
    /// fill in zero
    Zero,
}

///
/// Resolve the missing cells of a row-major `nrows x ncols` table.
/// Returns the complete matrix and the indexes of the rows kept.
///
fn impute_missing(
    cells: &[Option<f32>],
    nrows: usize,
    ncols: usize,
    imputation: Imputation,
) -> anyhow::Result<(Mat, Vec<usize>)> {
    let cell = |i: usize, j: usize| cells[i * ncols + j];
    let all_rows: Vec<usize> = (0..nrows).collect();

    match imputation {
        Imputation::DropSamples => {
            let rows: Vec<usize> = all_rows
                .into_iter()
                .filter(|&i| (0..ncols).all(|j| cell(i, j).is_some()))
                .collect();
            if rows.len() < nrows {
                info!("dropped {} rows with missing values", nrows - rows.len());
            }
            let data = Mat::from_fn(rows.len(), ncols, |r, j| cell(rows[r], j).unwrap_or(0.));
            Ok((data, rows))
        }
        Imputation::DropFeatures => {
            let cols: Vec<usize> = (0..ncols)
                .filter(|&j| (0..nrows).all(|i| cell(i, j).is_some()))
                .collect();
            if cols.is_empty() {
                return Err(anyhow::anyhow!("every feature has a missing value"));
            }
            if cols.len() < ncols {
                info!("dropped {} features with missing values", ncols - cols.len());
            }
            let data = Mat::from_fn(nrows, cols.len(), |i, c| cell(i, cols[c]).unwrap_or(0.));
            Ok((data, all_rows))
        }
        Imputation::Mean => {
            let means: Vec<f32> = (0..ncols)
                .map(|j| {
                    let (tot, n) = (0..nrows)
                        .filter_map(|i| cell(i, j))
                        .fold((0f32, 0usize), |(tot, n), x| (tot + x, n + 1));
                    if n > 0 {
                        tot / n as f32
                    } else {
                        warn!("feature {} has no observed value; filling in zero", j);
                        0.
                    }
                })
                .collect();
            let data = Mat::from_fn(nrows, ncols, |i, j| cell(i, j).unwrap_or(means[j]));
            Ok((data, all_rows))
        }
        Imputation::Zero => {
            let data = Mat::from_fn(nrows, ncols, |i, j| cell(i, j).unwrap_or(0.));
            Ok((data, all_rows))
        }
    }
}

///
/// Read delimited text files (`.csv`, `.tsv`, optionally gzipped)
/// with a header line and a label column. Files are stacked by rows
/// and must share the header. Rows without a label are dropped;
/// missing feature values are resolved by `imputation`. Labels
/// become class indexes in order of first appearance.
///
/// * `files` - data files
/// * `label_column` - name of the label column in the header
/// * `row_names` - the first column holds sample names and is skipped
/// * `imputation` - missing value policy
///
pub fn read_delimited_with_labels(
    files: &[Box<str>],
    label_column: &str,
    row_names: bool,
    imputation: Imputation,
) -> anyhow::Result<LabelledMatrix> {
    if files.is_empty() {
        return Err(anyhow::anyhow!("no data file"));
    }

    let mut header: Option<Vec<Box<str>>> = None;
    let mut raw_labels: Vec<Box<str>> = vec![];
    let mut cells: Vec<Option<f32>> = vec![];
    let mut num_features = 0;
    let mut num_unlabelled = 0;

    for file in files.iter() {
        let delim = delimiter_of(file);

        let lines: Vec<String> = open_buf_reader(file)?
            .lines()
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
            .collect();

        let (hdr_line, body) = lines
            .split_first()
            .ok_or(anyhow::anyhow!("empty file {}", file))?;

        let hdr: Vec<Box<str>> = hdr_line.split(delim).map(|w| w.trim().into()).collect();

        match header.as_ref() {
            Some(prev) if *prev != hdr => {
                return Err(anyhow::anyhow!("{} has a different header", file));
            }
            _ => {}
        }

        let label_idx = hdr
            .iter()
            .position(|w| w.as_ref() == label_column)
            .ok_or(anyhow::anyhow!(
                "no column `{}` in the header of {}",
                label_column,
                file
            ))?;

        let feature_idx: Vec<usize> = (0..hdr.len())
            .filter(|&j| j != label_idx && !(row_names && j == 0))
            .collect();
        num_features = feature_idx.len();

        let parsed = body
            .par_iter()
            .enumerate()
            .map(|(i, line)| -> anyhow::Result<Option<(Box<str>, Vec<Option<f32>>)>> {
                let words: Vec<&str> = line.split(delim).collect();
                if words.len() != hdr.len() {
                    return Err(anyhow::anyhow!(
                        "{}: line {} has {} fields, expected {}",
                        file,
                        i + 2,
                        words.len(),
                        hdr.len()
                    ));
                }
                let label = words[label_idx].trim();
                if is_missing(label) {
                    return Ok(None);
                }
                let row = feature_idx
                    .iter()
                    .map(|&j| {
                        if is_missing(words[j]) {
                            return Ok(None);
                        }
                        words[j].trim().parse::<f32>().map(Some).map_err(|e| {
                            anyhow::anyhow!("{}: line {}: `{}` {}", file, i + 2, words[j], e)
                        })
                    })
                    .collect::<anyhow::Result<Vec<Option<f32>>>>()?;
                Ok(Some((label.into(), row)))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        for row in parsed {
            match row {
                Some((label, x)) => {
                    raw_labels.push(label);
                    cells.extend(x);
                }
                None => num_unlabelled += 1,
            }
        }

        header = Some(hdr);
    }

    if num_unlabelled > 0 {
        info!("dropped {} rows without a label", num_unlabelled);
    }

    let (data, rows) = impute_missing(&cells, raw_labels.len(), num_features, imputation)?;
    if rows.is_empty() {
        return Err(anyhow::anyhow!("no complete row in the data"));
    }

    let raw_labels: Vec<Box<str>> = rows.iter().map(|&i| raw_labels[i].clone()).collect();
    let (labels, class_names) = index_labels_by_appearance(&raw_labels);

    info!(
        "read {} samples x {} features, {} classes",
        data.nrows(),
        data.ncols(),
        class_names.len()
    );

    Ok(LabelledMatrix {
        data,
        labels,
        class_names,
    })
}

fn index_labels_by_appearance(raw: &[Box<str>]) -> (Vec<u32>, Vec<Box<str>>) {
    let mut index: HashMap<&str, u32> = HashMap::new();
    let mut names = vec![];
    let labels = raw
        .iter()
        .map(|y| {
            *index.entry(y.as_ref()).or_insert_with(|| {
                names.push(y.clone());
                (names.len() - 1) as u32
            })
        })
        .collect();
    (labels, names)
}

/// Dimensions and unsigned byte payload of an IDX file
fn read_idx_bytes(file: &str) -> anyhow::Result<(Vec<usize>, Vec<u8>)> {
    let mut bytes = vec![];
    open_buf_reader(file)?.read_to_end(&mut bytes)?;

    if bytes.len() < 4 || bytes[0] != 0 || bytes[1] != 0 {
        return Err(anyhow::anyhow!("{} is not an IDX file", file));
    }
    if bytes[2] != 0x08 {
        return Err(anyhow::anyhow!(
            "{}: only unsigned byte IDX data is supported (type 0x{:02x})",
            file,
            bytes[2]
        ));
    }

    let ndim = bytes[3] as usize;
    let offset = 4 + 4 * ndim;
    if bytes.len() < offset {
        return Err(anyhow::anyhow!("{}: truncated IDX header", file));
    }

    let dims: Vec<usize> = bytes[4..offset]
        .chunks_exact(4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize)
        .collect();

    let expected: usize = dims.iter().product();
    let payload = bytes.split_off(offset);
    if payload.len() != expected {
        return Err(anyhow::anyhow!(
            "{}: {} bytes of data for dimensions {:?}",
            file,
            payload.len(),
            dims
        ));
    }
    Ok((dims, payload))
}

///
/// Read MNIST-style IDX files given as `(images, labels)` pairs and
/// stack them by rows. Pixels are scaled by `1/255`.
///
pub fn read_idx_with_labels(files: &[Box<str>]) -> anyhow::Result<LabelledMatrix> {
    if files.is_empty() || files.len() % 2 != 0 {
        return Err(anyhow::anyhow!(
            "IDX input takes pairs of image and label files"
        ));
    }

    let mut values: Vec<f32> = vec![];
    let mut raw_labels: Vec<u8> = vec![];
    let mut num_features: Option<usize> = None;

    for pair in files.chunks_exact(2) {
        let (img_dims, pixels) = read_idx_bytes(&pair[0])?;
        let (lab_dims, labels) = read_idx_bytes(&pair[1])?;

        if img_dims.len() < 2 || lab_dims.len() != 1 || img_dims[0] != lab_dims[0] {
            return Err(anyhow::anyhow!(
                "images {:?} and labels {:?} do not match",
                img_dims,
                lab_dims
            ));
        }

        let dd: usize = img_dims[1..].iter().product();
        if num_features.is_some_and(|d| d != dd) {
            return Err(anyhow::anyhow!("{} has {} features per image", pair[0], dd));
        }
        num_features = Some(dd);

        values.extend(pixels.iter().map(|&p| p as f32 / 255.));
        raw_labels.extend(labels);
    }

    let mut distinct = raw_labels.clone();
    distinct.sort_unstable();
    distinct.dedup();

    let labels = raw_labels
        .iter()
        .map(|y| distinct.binary_search(y).map(|k| k as u32))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| anyhow::anyhow!("label lookup"))?;

    let class_names = distinct.iter().map(|y| y.to_string().into()).collect();
    let data = Mat::from_row_slice(raw_labels.len(), num_features.unwrap_or(0), &values);

    info!(
        "read {} images x {} pixels",
        data.nrows(),
        data.ncols()
    );

    Ok(LabelledMatrix {
        data,
        labels,
        class_names,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &std::path::Path, name: &str, content: &[u8]) -> anyhow::Result<Box<str>> {
        let path = dir.join(name);
        let path_str: Box<str> = path.to_string_lossy().into();
        let mut writer = open_buf_writer(&path_str)?;
        writer.write_all(content)?;
        writer.flush()?;
        Ok(path_str)
    }

    #[test]
    fn csv_labels_in_order_of_appearance() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let csv = "id,g1,g2,DISEASE\n\
                   s1,1.0,2.0,BRCA\n\
                   s2,3.0,,LUAD\n\
                   s3,5.0,6.0,LUAD\n\
                   s4,7.0,8.0,BRCA\n";
        let file = write_file(dir.path(), "toy.csv.gz", csv.as_bytes())?;

        let out =
            read_delimited_with_labels(&[file], "DISEASE", true, Imputation::DropSamples)?;
        assert_eq!(out.data.nrows(), 3);
        assert_eq!(out.data.ncols(), 2);
        assert_eq!(out.labels, vec![0, 1, 0]);
        let names: Vec<&str> = out.class_names.iter().map(|s| s.as_ref()).collect();
        assert_eq!(names, vec!["BRCA", "LUAD"]);
        approx::assert_abs_diff_eq!(out.data[(1, 1)], 6.0);
        Ok(())
    }

    #[test]
    fn missing_label_column_is_an_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = write_file(dir.path(), "toy.tsv", b"a\tb\n1\t2\n")?;
        assert!(read_delimited_with_labels(&[file], "label", false, Imputation::Zero).is_err());
        Ok(())
    }

    #[test]
    fn idx_pairs_are_scaled() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;

        let mut images = vec![0u8, 0, 8, 3, 0, 0, 0, 2, 0, 0, 0, 2, 0, 0, 0, 2];
        images.extend([0u8, 255, 51, 102, 255, 255, 0, 0]);
        let labels = vec![0u8, 0, 8, 1, 0, 0, 0, 2, 7, 3];

        let img = write_file(dir.path(), "img.idx", &images)?;
        let lab = write_file(dir.path(), "lab.idx.gz", &labels)?;

        let out = read_idx_with_labels(&[img, lab])?;
        assert_eq!(out.data.nrows(), 2);
        assert_eq!(out.data.ncols(), 4);
        approx::assert_abs_diff_eq!(out.data[(0, 1)], 1.0);
        approx::assert_abs_diff_eq!(out.data[(0, 2)], 0.2, epsilon = 1e-6);
        assert_eq!(out.labels, vec![1, 0]);
        let names: Vec<&str> = out.class_names.iter().map(|s| s.as_ref()).collect();
        assert_eq!(names, vec!["3", "7"]);
        Ok(())
    }

    fn holey_csv(dir: &std::path::Path) -> anyhow::Result<Box<str>> {
        let csv = "id,g1,g2,g3,label\n\
                   s1,1.0,2.0,3.0,a\n\
                   s2,,4.0,NA,b\n\
                   s3,5.0,6.0,9.0,a\n\
                   s4,3.0,8.0,nan,\n";
        write_file(dir, "holes.csv", csv.as_bytes())
    }

    #[test]
    fn imputation_drops_incomplete_samples() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = holey_csv(dir.path())?;
        let out = read_delimited_with_labels(&[file], "label", true, Imputation::DropSamples)?;
        assert_eq!(out.data.shape(), (2, 3));
        assert_eq!(out.labels, vec![0, 0]);
        assert_eq!(out.num_classes(), 1);
        approx::assert_abs_diff_eq!(out.data[(1, 2)], 9.0);
        Ok(())
    }

    #[test]
    fn imputation_drops_incomplete_features() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = holey_csv(dir.path())?;
        let out = read_delimited_with_labels(&[file], "label", true, Imputation::DropFeatures)?;
        // s4 has no label, so only g2 is complete over s1..s3
        assert_eq!(out.data.shape(), (3, 1));
        assert_eq!(out.labels, vec![0, 1, 0]);
        approx::assert_abs_diff_eq!(out.data[(1, 0)], 4.0);
        Ok(())
    }

    #[test]
    fn imputation_fills_column_means() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = holey_csv(dir.path())?;
        let out = read_delimited_with_labels(&[file], "label", true, Imputation::Mean)?;
        assert_eq!(out.data.shape(), (3, 3));
        approx::assert_abs_diff_eq!(out.data[(1, 0)], 3.0);
        approx::assert_abs_diff_eq!(out.data[(1, 2)], 6.0);
        approx::assert_abs_diff_eq!(out.data[(2, 0)], 5.0);
        Ok(())
    }

    #[test]
    fn imputation_fills_zero() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = holey_csv(dir.path())?;
        let out = read_delimited_with_labels(&[file], "label", true, Imputation::Zero)?;
        assert_eq!(out.data.shape(), (3, 3));
        approx::assert_abs_diff_eq!(out.data[(1, 0)], 0.0);
        approx::assert_abs_diff_eq!(out.data[(1, 1)], 4.0);
        approx::assert_abs_diff_eq!(out.data[(1, 2)], 0.0);
        Ok(())
    }

    #[test]
    fn small_classes_are_dropped() -> anyhow::Result<()> {
        let data = Mat::from_fn(6, 2, |i, j| (i * 2 + j) as f32);
        let input = LabelledMatrix {
            data,
            labels: vec![0, 1, 2, 1, 0, 0],
            class_names: vec!["a".into(), "b".into(), "c".into()],
        };
        let out = input.filter_min_class_size(2)?;
        assert_eq!(out.labels, vec![0, 1, 1, 0, 0]);
        assert_eq!(out.class_names.len(), 2);
        approx::assert_abs_diff_eq!(out.data[(2, 0)], 6.0);
        Ok(())
    }
}
