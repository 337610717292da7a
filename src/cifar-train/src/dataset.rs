//! CIFAR-100 binary format loader.
//!
//! Each record is `[coarse label][fine label][R plane][G plane][B plane]`
//! with 1024 bytes per plane. Images are converted to HWC on load.

use std::fs;
use std::path::{Path, PathBuf};

use cifar_serve::classifier::NUM_CLASSES;
use cifar_serve::LabelSet;
use log::{info, warn};
use thiserror::Error;

pub const IMAGE_SIDE: usize = 32;
pub const PLANE_BYTES: usize = IMAGE_SIDE * IMAGE_SIDE;
pub const IMAGE_BYTES: usize = PLANE_BYTES * 3;
pub const RECORD_BYTES: usize = 2 + IMAGE_BYTES;

pub const TRAIN_FILE: &str = "train.bin";
pub const TEST_FILE: &str = "test.bin";
pub const LABEL_NAMES_FILE: &str = "fine_label_names.txt";

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("could not read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path:?} is {len} bytes, not a whole number of 3074-byte records")]
    Size { path: PathBuf, len: usize },

    #[error("record {record} has fine label {label}, expected < 100")]
    Label { record: usize, label: u8 },

    #[error("label names in {path:?} do not match the built-in class order (first mismatch at index {index})")]
    LabelOrder { path: PathBuf, index: usize },
}

/// Labeled images, pixels stored HWC as raw bytes.
pub struct Dataset {
    pixels: Vec<u8>,
    labels: Vec<u8>,
}

impl Dataset {
    pub fn load(path: &Path) -> Result<Self, DatasetError> {
        let raw = fs::read(path).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        if raw.is_empty() || raw.len() % RECORD_BYTES != 0 {
            return Err(DatasetError::Size {
                path: path.to_path_buf(),
                len: raw.len(),
            });
        }

        let dataset = Self::parse(&raw)?;
        info!("Loaded {} images from {:?}", dataset.len(), path);

        Ok(dataset)
    }

    /// Parses whole records; a trailing partial record is ignored.
    pub fn parse(raw: &[u8]) -> Result<Self, DatasetError> {
        let count = raw.len() / RECORD_BYTES;
        let mut pixels = Vec::with_capacity(count * IMAGE_BYTES);
        let mut labels = Vec::with_capacity(count);

        for (record, chunk) in raw.chunks_exact(RECORD_BYTES).enumerate() {
            let fine = chunk[1];
            if fine as usize >= NUM_CLASSES {
                return Err(DatasetError::Label {
                    record,
                    label: fine,
                });
            }
            labels.push(fine);

            let planes = &chunk[2..];
            for px in 0..PLANE_BYTES {
                pixels.push(planes[px]);
                pixels.push(planes[PLANE_BYTES + px]);
                pixels.push(planes[2 * PLANE_BYTES + px]);
            }
        }

        Ok(Dataset { pixels, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn label(&self, index: usize) -> usize {
        self.labels[index] as usize
    }

    /// Images at `indices`, scaled to `[0, 1]`, flattened as `[n, 32, 32, 3]`
    pub fn images(&self, indices: &[usize]) -> Vec<f32> {
        let mut out = Vec::with_capacity(indices.len() * IMAGE_BYTES);

        for &i in indices {
            let start = i * IMAGE_BYTES;
            out.extend(
                self.pixels[start..start + IMAGE_BYTES]
                    .iter()
                    .map(|&x| x as f32 / 255f32),
            );
        }

        out
    }

    /// One-hot labels at `indices`, flattened as `[n, 100]`
    pub fn one_hot(&self, indices: &[usize]) -> Vec<f32> {
        let mut out = vec![0f32; indices.len() * NUM_CLASSES];

        for (row, &i) in indices.iter().enumerate() {
            out[row * NUM_CLASSES + self.label(i)] = 1.0;
        }

        out
    }
}

/// Loads the train and test partitions from an extracted `cifar-100-binary`.
pub fn load_splits(data_dir: &Path) -> Result<(Dataset, Dataset), DatasetError> {
    let train = Dataset::load(&data_dir.join(TRAIN_FILE))?;
    let test = Dataset::load(&data_dir.join(TEST_FILE))?;

    Ok((train, test))
}

/// Checks the dataset's own label list against `labels`, if it ships one.
pub fn check_label_order(data_dir: &Path, labels: &LabelSet) -> Result<(), DatasetError> {
    let path = data_dir.join(LABEL_NAMES_FILE);

    let names = match LabelSet::from_file(&path) {
        Ok(names) => names,
        Err(e) => {
            warn!("Skipping label order check, {:?}: {}", path, e);
            return Ok(());
        }
    };

    let mismatch = (0..names.len().max(labels.len())).find(|&i| names.get(i) != labels.get(i));

    match mismatch {
        Some(index) => Err(DatasetError::LabelOrder { path, index }),
        None => Ok(()),
    }
}
