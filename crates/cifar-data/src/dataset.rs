use std::sync::Arc;

use crate::error::{DataError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl ImageShape {
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    pub fn numel(&self) -> usize {
        self.channels * self.height * self.width
    }

    pub fn dims(&self) -> [usize; 3] {
        [self.channels, self.height, self.width]
    }
}

/// Channel-major (`C, H, W`) floating point image.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    shape: ImageShape,
    data: Vec<f32>,
}

impl Image {
    pub fn new(shape: ImageShape, data: Vec<f32>) -> Result<Self> {
        if data.len() != shape.numel() {
            return Err(DataError::ShapeMismatch(format!(
                "image {:?} needs {} values, got {}",
                shape.dims(),
                shape.numel(),
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: ImageShape) -> Self {
        Self {
            shape,
            data: vec![0.0; shape.numel()],
        }
    }

    pub fn shape(&self) -> ImageShape {
        self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    #[inline]
    pub fn offset(&self, channel: usize, y: usize, x: usize) -> usize {
        (channel * self.shape.height + y) * self.shape.width + x
    }

    pub fn get(&self, channel: usize, y: usize, x: usize) -> f32 {
        self.data[self.offset(channel, y, x)]
    }
}

/// Model input for one sample: a single image, or several views of it for
/// test-time augmentation.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleInput {
    Single(Image),
    Views(Vec<Image>),
}

impl SampleInput {
    /// Per-sample dims: `[C, H, W]` or `[V, C, H, W]`.
    pub fn dims(&self) -> Vec<usize> {
        match self {
            SampleInput::Single(image) => image.shape().dims().to_vec(),
            SampleInput::Views(views) => {
                let mut dims = vec![views.len()];
                match views.first() {
                    Some(first) => dims.extend_from_slice(&first.shape().dims()),
                    None => dims.extend_from_slice(&[0, 0, 0]),
                }
                dims
            }
        }
    }

    pub fn numel(&self) -> usize {
        self.dims().iter().product()
    }

    /// Applies `f` to every image, keeping the single/views structure.
    pub fn try_map<F>(self, mut f: F) -> Result<SampleInput>
    where
        F: FnMut(Image) -> Result<Image>,
    {
        match self {
            SampleInput::Single(image) => Ok(SampleInput::Single(f(image)?)),
            SampleInput::Views(views) => views
                .into_iter()
                .map(f)
                .collect::<Result<Vec<_>>>()
                .map(SampleInput::Views),
        }
    }

    pub(crate) fn extend_into(&self, buffer: &mut Vec<f32>) -> Result<()> {
        match self {
            SampleInput::Single(image) => buffer.extend_from_slice(image.data()),
            SampleInput::Views(views) => {
                let expected = views.first().map(Image::shape);
                for view in views {
                    if Some(view.shape()) != expected {
                        return Err(DataError::ShapeMismatch(
                            "views of one sample must share a shape".into(),
                        ));
                    }
                    buffer.extend_from_slice(view.data());
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub input: SampleInput,
    pub label: u32,
}

/// Indexable, length-known source of labelled samples.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn get(&self, index: usize) -> Result<Sample>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<D: Dataset + ?Sized> Dataset for Arc<D> {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        (**self).get(index)
    }
}

/// Dataset backed by fully materialised samples.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    samples: Vec<Sample>,
}

impl InMemoryDataset {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        self.samples
            .get(index)
            .cloned()
            .ok_or(DataError::OutOfRange {
                index,
                len: self.samples.len(),
            })
    }
}
