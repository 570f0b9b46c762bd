use rayon::prelude::*;

use crate::{
    dataset::{Dataset, InMemoryDataset, Sample},
    error::{DataError, Result},
    loader::{build_pool, sample_rng},
    transforms::{Compose, Transform},
};

/// Applies deterministic `transforms` to every sample once, in parallel, and
/// keeps the results in memory.
///
/// Random transforms are rejected: their output would be frozen into the cache.
pub fn materialize<D>(source: &D, transforms: &Compose, num_workers: usize) -> Result<InMemoryDataset>
where
    D: Dataset + ?Sized,
{
    if transforms.is_random() {
        return Err(DataError::InvalidConfig(
            "cached transforms must be deterministic".into(),
        ));
    }
    let pool = build_pool(num_workers)?;
    let samples = pool.install(|| {
        (0..source.len())
            .into_par_iter()
            .map(|index| {
                let sample = source.get(index)?;
                let mut rng = sample_rng(0, 0, index);
                Ok(Sample {
                    input: transforms.apply(sample.input, &mut rng)?,
                    label: sample.label,
                })
            })
            .collect::<Result<Vec<_>>>()
    })?;
    log::info!(
        "cached {} samples with {} transform(s)",
        samples.len(),
        transforms.len()
    );
    Ok(InMemoryDataset::new(samples))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dataset::{Image, ImageShape, SampleInput},
        transforms::{Pad, RandomCrop},
    };

    fn source() -> InMemoryDataset {
        let shape = ImageShape::new(1, 2, 2);
        InMemoryDataset::new(
            (0..5)
                .map(|i| Sample {
                    input: SampleInput::Single(Image::new(shape, vec![i as f32; 4]).unwrap()),
                    label: i,
                })
                .collect(),
        )
    }

    #[test]
    fn caches_padded_samples_in_order() {
        let cached = materialize(&source(), &Compose::new().then(Pad::new(1)), 3).unwrap();
        assert_eq!(cached.len(), 5);
        let sample = cached.get(4).unwrap();
        assert_eq!(sample.label, 4);
        assert_eq!(sample.input.dims(), vec![1, 4, 4]);
    }

    #[test]
    fn refuses_random_transforms() {
        let transforms = Compose::new().then(RandomCrop::new(1, 1));
        assert!(materialize(&source(), &transforms, 1).is_err());
    }
}
