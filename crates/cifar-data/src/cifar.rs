//! Reader for the CIFAR-10 binary distribution.
//!
//! Each record is one label byte followed by 3072 pixel bytes laid out as
//! three 32×32 planes (red, green, blue). Pixels are scaled to `[0, 1]` when a
//! sample is fetched.

use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use flate2::read::GzDecoder;

use crate::{
    dataset::{Dataset, Image, ImageShape, Sample, SampleInput},
    error::{DataError, Result},
};

pub const IMAGE_SIDE: usize = 32;
pub const CHANNELS: usize = 3;
pub const NUM_CLASSES: usize = 10;
pub const PIXELS_PER_IMAGE: usize = CHANNELS * IMAGE_SIDE * IMAGE_SIDE;
pub const RECORD_BYTES: usize = 1 + PIXELS_PER_IMAGE;

pub const ARCHIVE_URL: &str = "https://www.cs.toronto.edu/~kriz/cifar-10-binary.tar.gz";
pub const BATCH_DIR: &str = "cifar-10-batches-bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub fn file_names(&self) -> &'static [&'static str] {
        match self {
            Split::Train => &[
                "data_batch_1.bin",
                "data_batch_2.bin",
                "data_batch_3.bin",
                "data_batch_4.bin",
                "data_batch_5.bin",
            ],
            Split::Test => &["test_batch.bin"],
        }
    }
}

/// Directory holding the extracted archive for a dataset base path.
pub fn dataset_root(base: &Path) -> PathBuf {
    base.join("cifar10")
}

/// Raw CIFAR-10 split held as bytes.
#[derive(Debug, Clone)]
pub struct CifarDataset {
    labels: Vec<u8>,
    pixels: Vec<u8>,
}

impl CifarDataset {
    /// Loads every batch file of `split` from `root/cifar-10-batches-bin`.
    pub fn open(root: &Path, split: Split) -> Result<Self> {
        let dir = root.join(BATCH_DIR);
        if !dir.is_dir() {
            return Err(DataError::Missing(dir));
        }
        let mut dataset = Self {
            labels: Vec::new(),
            pixels: Vec::new(),
        };
        for name in split.file_names() {
            let path = dir.join(name);
            if !path.is_file() {
                return Err(DataError::Missing(path));
            }
            let bytes = fs::read(&path)?;
            dataset.append_records(&path, &bytes)?;
        }
        log::info!(
            "loaded {} {:?} images from {}",
            dataset.len(),
            split,
            dir.display()
        );
        Ok(dataset)
    }

    /// Parses records from an in-memory buffer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut dataset = Self {
            labels: Vec::new(),
            pixels: Vec::new(),
        };
        dataset.append_records(Path::new("<memory>"), bytes)?;
        Ok(dataset)
    }

    fn append_records(&mut self, path: &Path, bytes: &[u8]) -> Result<()> {
        if bytes.len() % RECORD_BYTES != 0 {
            return Err(DataError::Malformed {
                path: path.to_path_buf(),
                reason: format!(
                    "length {} is not a multiple of the {RECORD_BYTES}-byte record size",
                    bytes.len()
                ),
            });
        }
        let records = bytes.len() / RECORD_BYTES;
        self.labels.reserve(records);
        self.pixels.reserve(records * PIXELS_PER_IMAGE);
        for (index, record) in bytes.chunks_exact(RECORD_BYTES).enumerate() {
            let label = record[0];
            if usize::from(label) >= NUM_CLASSES {
                return Err(DataError::Malformed {
                    path: path.to_path_buf(),
                    reason: format!("record {index} has label {label}"),
                });
            }
            self.labels.push(label);
            self.pixels.extend_from_slice(&record[1..]);
        }
        Ok(())
    }

    pub fn labels(&self) -> &[u8] {
        &self.labels
    }
}

impl Dataset for CifarDataset {
    fn len(&self) -> usize {
        self.labels.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let label = *self.labels.get(index).ok_or(DataError::OutOfRange {
            index,
            len: self.labels.len(),
        })?;
        let start = index * PIXELS_PER_IMAGE;
        let data = self.pixels[start..start + PIXELS_PER_IMAGE]
            .iter()
            .map(|&byte| f32::from(byte) / 255.0)
            .collect();
        let image = Image::new(ImageShape::new(CHANNELS, IMAGE_SIDE, IMAGE_SIDE), data)?;
        Ok(Sample {
            input: SampleInput::Single(image),
            label: u32::from(label),
        })
    }
}

/// Fetches and unpacks the binary archive into `root` unless it is already there.
pub fn download(root: &Path) -> Result<()> {
    let batch_dir = root.join(BATCH_DIR);
    let complete = Split::Train
        .file_names()
        .iter()
        .chain(Split::Test.file_names())
        .all(|name| batch_dir.join(name).is_file());
    if complete {
        log::info!("dataset already present at {}", batch_dir.display());
        return Ok(());
    }

    fs::create_dir_all(root)?;
    let archive = root.join("cifar-10-binary.tar.gz");
    log::info!("downloading {} to {}", ARCHIVE_URL, archive.display());
    fetch(ARCHIVE_URL, &archive)?;
    unpack(&archive, root)?;
    fs::remove_file(&archive)?;
    log::info!("extracted dataset into {}", batch_dir.display());
    Ok(())
}

fn fetch(url: &str, dest: &Path) -> Result<()> {
    let mut response = reqwest::blocking::get(url)
        .and_then(|response| response.error_for_status())
        .map_err(|err| DataError::Download(format!("GET {url}: {err}")))?;
    let mut writer = BufWriter::new(File::create(dest)?);
    let written = response
        .copy_to(&mut writer)
        .map_err(|err| DataError::Download(format!("reading body of {url}: {err}")))?;
    writer.flush()?;
    log::debug!("fetched {} bytes from {}", written, url);
    Ok(())
}

/// Extracts a gzip-compressed tarball into `root`.
pub fn unpack(archive: &Path, root: &Path) -> Result<()> {
    let file = File::open(archive)?;
    tar::Archive::new(GzDecoder::new(BufReader::new(file)))
        .unpack(root)
        .map_err(|err: io::Error| {
            DataError::Download(format!("unpacking {}: {err}", archive.display()))
        })
}
