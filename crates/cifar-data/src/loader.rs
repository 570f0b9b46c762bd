//! Host-side batch loader.
//!
//! Gathers and transforms the samples of each batch on a fixed rayon pool,
//! then collates them into one contiguous buffer. Every sample gets its own
//! RNG derived from `(seed, pass, index)`, so a run is reproducible
//! regardless of worker count or scheduling.

use std::sync::Arc;

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};

use crate::{
    dataset::{Dataset, Sample, SampleInput},
    error::{DataError, Result},
    transforms::{Compose, Transform},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    /// Skip a trailing batch smaller than `batch_size`.
    pub drop_last: bool,
    /// Start a new (reshuffled) pass instead of ending.
    pub infinite: bool,
    pub seed: u64,
    pub num_workers: usize,
}

impl LoaderConfig {
    pub fn train(batch_size: usize, seed: u64, num_workers: usize) -> Self {
        Self {
            batch_size,
            shuffle: true,
            drop_last: true,
            infinite: true,
            seed,
            num_workers,
        }
    }

    pub fn eval(batch_size: usize, num_workers: usize) -> Self {
        Self {
            batch_size,
            shuffle: false,
            drop_last: false,
            infinite: false,
            seed: 0,
            num_workers,
        }
    }
}

/// A collated batch in host memory.
///
/// `shape` is `[B, C, H, W]` for single images or `[B, V, C, H, W]` when
/// every sample carries `V` views.
#[derive(Debug, Clone, PartialEq)]
pub struct HostBatch {
    pub inputs: Vec<f32>,
    pub shape: Vec<usize>,
    pub targets: Vec<u32>,
}

impl HostBatch {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

pub struct BatchLoader {
    dataset: Arc<dyn Dataset>,
    transforms: Arc<Compose>,
    config: LoaderConfig,
    pool: Arc<ThreadPool>,
    order: Vec<usize>,
    cursor: usize,
    pass: u64,
    finished: bool,
}

impl BatchLoader {
    pub fn new(
        dataset: Arc<dyn Dataset>,
        transforms: Arc<Compose>,
        config: LoaderConfig,
    ) -> Result<Self> {
        let pool = Arc::new(build_pool(config.num_workers)?);
        Self::with_pool(dataset, transforms, config, pool)
    }

    /// Like [`new`](Self::new), but gathers on an existing pool instead of
    /// spawning `num_workers` threads of its own.
    pub fn with_pool(
        dataset: Arc<dyn Dataset>,
        transforms: Arc<Compose>,
        config: LoaderConfig,
        pool: Arc<ThreadPool>,
    ) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(DataError::InvalidConfig(
                "batch_size must be greater than zero".into(),
            ));
        }
        let len = dataset.len();
        if config.infinite && (len == 0 || (config.drop_last && len < config.batch_size)) {
            return Err(DataError::InvalidConfig(format!(
                "an infinite loader needs at least one full batch per pass ({} samples, batch size {})",
                len, config.batch_size
            )));
        }
        let mut loader = Self {
            dataset,
            transforms,
            config,
            pool,
            order: Vec::new(),
            cursor: 0,
            pass: 0,
            finished: false,
        };
        loader.start_pass();
        Ok(loader)
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Number of batches one pass over the dataset yields.
    pub fn batches_per_pass(&self) -> usize {
        let len = self.dataset.len();
        if self.config.drop_last {
            len / self.config.batch_size
        } else {
            len.div_ceil(self.config.batch_size)
        }
    }

    fn start_pass(&mut self) {
        self.order = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(self.pass));
            self.order.shuffle(&mut rng);
        }
        self.cursor = 0;
    }

    fn next_indices(&mut self) -> Option<Vec<usize>> {
        loop {
            if self.finished {
                return None;
            }
            let remaining = self.order.len() - self.cursor;
            if remaining >= self.config.batch_size || (remaining > 0 && !self.config.drop_last) {
                let take = remaining.min(self.config.batch_size);
                let indices = self.order[self.cursor..self.cursor + take].to_vec();
                self.cursor += take;
                return Some(indices);
            }
            if self.config.infinite {
                self.pass += 1;
                log::debug!("loader starting pass {}", self.pass);
                self.start_pass();
            } else {
                self.finished = true;
            }
        }
    }

    fn load(&self, indices: &[usize]) -> Result<HostBatch> {
        let dataset = &self.dataset;
        let transforms = &self.transforms;
        let seed = self.config.seed;
        let pass = self.pass;
        let samples = self.pool.install(|| {
            indices
                .par_iter()
                .map(|&index| {
                    let sample = dataset.get(index)?;
                    let mut rng = sample_rng(seed, pass, index);
                    let input = transforms.apply(sample.input, &mut rng)?;
                    Ok(Sample {
                        input,
                        label: sample.label,
                    })
                })
                .collect::<Result<Vec<_>>>()
        })?;
        collate(samples)
    }
}

impl Iterator for BatchLoader {
    type Item = Result<HostBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let indices = self.next_indices()?;
        let batch = self.load(&indices);
        if batch.is_err() {
            self.finished = true;
        }
        Some(batch)
    }
}

/// Stacks samples into one batch, rejecting samples whose shapes differ.
pub fn collate(samples: Vec<Sample>) -> Result<HostBatch> {
    let first = samples
        .first()
        .ok_or_else(|| DataError::ShapeMismatch("cannot collate an empty batch".into()))?;
    let sample_dims = first.input.dims();
    let per_sample: usize = sample_dims.iter().product();

    let mut inputs = Vec::with_capacity(per_sample * samples.len());
    let mut targets = Vec::with_capacity(samples.len());
    for (position, sample) in samples.iter().enumerate() {
        let dims = sample.input.dims();
        let same_kind = matches!(
            (&first.input, &sample.input),
            (SampleInput::Single(_), SampleInput::Single(_))
                | (SampleInput::Views(_), SampleInput::Views(_))
        );
        if !same_kind || dims != sample_dims {
            return Err(DataError::ShapeMismatch(format!(
                "sample {position} has shape {:?}, expected {:?}",
                dims, sample_dims
            )));
        }
        sample.input.extend_into(&mut inputs)?;
        targets.push(sample.label);
    }

    let mut shape = vec![samples.len()];
    shape.extend(sample_dims);
    Ok(HostBatch {
        inputs,
        shape,
        targets,
    })
}

/// Fixed-size rayon pool used to gather and transform samples.
pub fn build_pool(num_workers: usize) -> Result<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(num_workers.max(1))
        .thread_name(|index| format!("cifar-loader-{index}"))
        .build()
        .map_err(|err| DataError::WorkerPool(err.to_string()))
}

pub(crate) fn sample_rng(seed: u64, pass: u64, index: usize) -> StdRng {
    let mixed = seed
        ^ pass.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (index as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    StdRng::seed_from_u64(mixed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dataset::{Image, ImageShape, InMemoryDataset},
        transforms::{HorizontalFlipViews, RandomHorizontalFlip},
    };

    fn dataset(len: usize) -> Arc<dyn Dataset> {
        let shape = ImageShape::new(1, 2, 2);
        let samples = (0..len)
            .map(|i| Sample {
                input: SampleInput::Single(
                    Image::new(shape, (0..4).map(|v| (i * 4 + v) as f32).collect()).unwrap(),
                ),
                label: i as u32,
            })
            .collect();
        Arc::new(InMemoryDataset::new(samples))
    }

    fn config(batch_size: usize) -> LoaderConfig {
        LoaderConfig {
            batch_size,
            shuffle: false,
            drop_last: false,
            infinite: false,
            seed: 1,
            num_workers: 2,
        }
    }

    #[test]
    fn finite_loader_keeps_partial_batch() {
        let loader = BatchLoader::new(dataset(10), Arc::new(Compose::new()), config(4)).unwrap();
        assert_eq!(loader.batches_per_pass(), 3);
        let batches: Vec<_> = loader.map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].shape, vec![4, 1, 2, 2]);
        assert_eq!(batches[2].targets, vec![8, 9]);
        assert_eq!(&batches[0].inputs[..4], &[0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn drop_last_discards_partial_batch() {
        let mut cfg = config(4);
        cfg.drop_last = true;
        let loader = BatchLoader::new(dataset(10), Arc::new(Compose::new()), cfg).unwrap();
        let lens: Vec<_> = loader.map(|b| b.unwrap().len()).collect();
        assert_eq!(lens, vec![4, 4]);
    }

    #[test]
    fn infinite_loader_cycles_with_fresh_shuffles() {
        let cfg = LoaderConfig::train(3, 11, 2);
        let mut loader = BatchLoader::new(dataset(7), Arc::new(Compose::new()), cfg).unwrap();
        assert_eq!(loader.batches_per_pass(), 2);
        let batches: Vec<_> = (&mut loader).take(6).map(|b| b.unwrap()).collect();
        assert!(batches.iter().all(|b| b.len() == 3));

        let first_pass: Vec<u32> = batches[..2].iter().flat_map(|b| b.targets.clone()).collect();
        let mut unique = first_pass.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 6);
    }

    #[test]
    fn loaders_share_an_injected_pool() {
        let pool = Arc::new(build_pool(2).unwrap());
        let passes: Vec<Vec<HostBatch>> = (0..3)
            .map(|_| {
                BatchLoader::with_pool(
                    dataset(5),
                    Arc::new(Compose::new()),
                    config(2),
                    Arc::clone(&pool),
                )
                .unwrap()
                .map(|b| b.unwrap())
                .collect()
            })
            .collect();
        assert_eq!(Arc::strong_count(&pool), 1);
        assert_eq!(passes[0].len(), 3);
        assert_eq!(passes[0], passes[2]);
    }

    #[test]
    fn infinite_loader_requires_a_full_batch() {
        let cfg = LoaderConfig::train(8, 0, 1);
        assert!(BatchLoader::new(dataset(5), Arc::new(Compose::new()), cfg).is_err());
    }

    #[test]
    fn augmentation_is_reproducible_across_worker_counts() {
        let transforms = Arc::new(Compose::new().then(RandomHorizontalFlip::new(0.5)));
        let mut a = LoaderConfig::train(4, 5, 1);
        let run = |cfg: LoaderConfig| -> Vec<HostBatch> {
            BatchLoader::new(dataset(8), transforms.clone(), cfg)
                .unwrap()
                .take(4)
                .map(|b| b.unwrap())
                .collect()
        };
        let single = run(a);
        a.num_workers = 4;
        assert_eq!(single, run(a));
    }

    #[test]
    fn views_collate_to_five_dimensions() {
        let transforms = Arc::new(Compose::new().then(HorizontalFlipViews));
        let mut loader = BatchLoader::new(dataset(3), transforms, config(2)).unwrap();
        let batch = loader.next().unwrap().unwrap();
        assert_eq!(batch.shape, vec![2, 2, 1, 2, 2]);
        assert_eq!(batch.inputs.len(), 16);
    }

    #[test]
    fn collate_rejects_mixed_shapes() {
        let small = Sample {
            input: SampleInput::Single(Image::zeros(ImageShape::new(1, 2, 2))),
            label: 0,
        };
        let large = Sample {
            input: SampleInput::Single(Image::zeros(ImageShape::new(1, 3, 3))),
            label: 1,
        };
        assert!(matches!(
            collate(vec![small, large]),
            Err(DataError::ShapeMismatch(_))
        ));
    }
}
