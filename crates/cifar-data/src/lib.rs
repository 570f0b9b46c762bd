//! CIFAR-10 data handling: the binary reader, per-sample transforms, a
//! parallel cache for deterministic preprocessing and the host-side batch
//! loader that feeds the training pipeline.

pub mod cache;
pub mod cifar;
pub mod dataset;
pub mod error;
pub mod loader;
pub mod transforms;

pub use cache::materialize;
pub use cifar::{CifarDataset, Split};
pub use dataset::{Dataset, Image, ImageShape, InMemoryDataset, Sample, SampleInput};
pub use error::{DataError, Result};
pub use loader::{build_pool, collate, BatchLoader, HostBatch, LoaderConfig};
pub use transforms::{
    Compose, Cutout, HorizontalFlipViews, Normalize, Pad, RandomCrop, RandomHorizontalFlip,
    Transform,
};
