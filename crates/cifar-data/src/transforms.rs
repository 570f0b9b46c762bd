//! Per-sample image transforms.
//!
//! Transforms are pure functions of the input and the RNG they are handed, so
//! a loader that seeds the RNG per sample gets the same augmentation no matter
//! which worker runs it.

use rand::{rngs::StdRng, Rng};

use crate::{
    dataset::{Image, ImageShape, SampleInput},
    error::{DataError, Result},
};

pub trait Transform: Send + Sync {
    fn apply(&self, input: SampleInput, rng: &mut StdRng) -> Result<SampleInput>;

    /// Whether the output depends on the RNG.
    fn is_random(&self) -> bool {
        false
    }
}

/// Ordered chain of transforms.
#[derive(Default)]
pub struct Compose {
    steps: Vec<Box<dyn Transform>>,
}

impl Compose {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, transform: impl Transform + 'static) -> Self {
        self.steps.push(Box::new(transform));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// CIFAR training preprocessing that can be computed once: pad + normalise.
    pub fn cifar_train_cached() -> Self {
        Self::train_cached(4)
    }

    /// CIFAR training augmentation applied on every pass.
    pub fn cifar_train_augment() -> Self {
        Self::train_augment(32, 8)
    }

    pub fn train_cached(padding: usize) -> Self {
        Self::new().then(Pad::new(padding)).then(Normalize::cifar10())
    }

    /// Random `crop`×`crop` window, horizontal flip, then a `cutout`×`cutout`
    /// hole (skipped when `cutout` is zero).
    pub fn train_augment(crop: usize, cutout: usize) -> Self {
        let compose = Self::new()
            .then(RandomCrop::new(crop, crop))
            .then(RandomHorizontalFlip::new(0.5));
        if cutout > 0 {
            compose.then(Cutout::new(cutout, cutout))
        } else {
            compose
        }
    }

    /// CIFAR evaluation preprocessing with flip views for test-time augmentation.
    pub fn cifar_eval(tta: bool) -> Self {
        let compose = Self::new().then(Normalize::cifar10());
        if tta {
            compose.then(HorizontalFlipViews)
        } else {
            compose
        }
    }
}

impl Transform for Compose {
    fn apply(&self, mut input: SampleInput, rng: &mut StdRng) -> Result<SampleInput> {
        for step in &self.steps {
            input = step.apply(input, rng)?;
        }
        Ok(input)
    }

    fn is_random(&self) -> bool {
        self.steps.iter().any(|step| step.is_random())
    }
}

/// Zero padding on every spatial border.
#[derive(Debug, Clone, Copy)]
pub struct Pad {
    pub padding: usize,
}

impl Pad {
    pub fn new(padding: usize) -> Self {
        Self { padding }
    }
}

impl Transform for Pad {
    fn apply(&self, input: SampleInput, _rng: &mut StdRng) -> Result<SampleInput> {
        let pad = self.padding;
        input.try_map(|image| {
            let src = image.shape();
            let shape = ImageShape::new(src.channels, src.height + 2 * pad, src.width + 2 * pad);
            let mut out = Image::zeros(shape);
            for c in 0..src.channels {
                for y in 0..src.height {
                    let from = image.offset(c, y, 0);
                    let to = out.offset(c, y + pad, pad);
                    out.data_mut()[to..to + src.width]
                        .copy_from_slice(&image.data()[from..from + src.width]);
                }
            }
            Ok(out)
        })
    }
}

/// Crops a window of `height × width` at a uniformly random position.
#[derive(Debug, Clone, Copy)]
pub struct RandomCrop {
    pub height: usize,
    pub width: usize,
}

impl RandomCrop {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }
}

impl Transform for RandomCrop {
    fn apply(&self, input: SampleInput, rng: &mut StdRng) -> Result<SampleInput> {
        input.try_map(|image| {
            let src = image.shape();
            if src.height < self.height || src.width < self.width {
                return Err(DataError::ShapeMismatch(format!(
                    "cannot crop {}x{} from {}x{}",
                    self.height, self.width, src.height, src.width
                )));
            }
            let top = rng.gen_range(0..=src.height - self.height);
            let left = rng.gen_range(0..=src.width - self.width);
            let shape = ImageShape::new(src.channels, self.height, self.width);
            let mut data = Vec::with_capacity(shape.numel());
            for c in 0..src.channels {
                for y in 0..self.height {
                    let from = image.offset(c, top + y, left);
                    data.extend_from_slice(&image.data()[from..from + self.width]);
                }
            }
            Image::new(shape, data)
        })
    }

    fn is_random(&self) -> bool {
        true
    }
}

/// Mirrors the image left-to-right with probability `p`.
#[derive(Debug, Clone, Copy)]
pub struct RandomHorizontalFlip {
    pub p: f64,
}

impl RandomHorizontalFlip {
    pub fn new(p: f64) -> Self {
        Self { p: p.clamp(0.0, 1.0) }
    }
}

impl Transform for RandomHorizontalFlip {
    fn apply(&self, input: SampleInput, rng: &mut StdRng) -> Result<SampleInput> {
        input.try_map(|image| {
            if rng.gen_bool(self.p) {
                Ok(flip_horizontal(&image))
            } else {
                Ok(image)
            }
        })
    }

    fn is_random(&self) -> bool {
        true
    }
}

/// Zeroes a `height × width` box centred at a random pixel, clipped to the image.
#[derive(Debug, Clone, Copy)]
pub struct Cutout {
    pub height: usize,
    pub width: usize,
}

impl Cutout {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }
}

impl Transform for Cutout {
    fn apply(&self, input: SampleInput, rng: &mut StdRng) -> Result<SampleInput> {
        input.try_map(|mut image| {
            let shape = image.shape();
            if shape.height == 0 || shape.width == 0 {
                return Ok(image);
            }
            let cy = rng.gen_range(0..shape.height);
            let cx = rng.gen_range(0..shape.width);
            let y0 = cy.saturating_sub(self.height / 2);
            let y1 = (cy + self.height - self.height / 2).min(shape.height);
            let x0 = cx.saturating_sub(self.width / 2);
            let x1 = (cx + self.width - self.width / 2).min(shape.width);
            for c in 0..shape.channels {
                for y in y0..y1 {
                    let from = image.offset(c, y, x0);
                    let to = image.offset(c, y, x1);
                    image.data_mut()[from..to].fill(0.0);
                }
            }
            Ok(image)
        })
    }

    fn is_random(&self) -> bool {
        true
    }
}

/// Per-channel `(x - mean) / std`.
#[derive(Debug, Clone)]
pub struct Normalize {
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl Normalize {
    pub fn new(mean: Vec<f32>, std: Vec<f32>) -> Result<Self> {
        if mean.len() != std.len() {
            return Err(DataError::InvalidConfig(
                "normalize mean and std must have the same length".into(),
            ));
        }
        if std.iter().any(|&s| s <= 0.0) {
            return Err(DataError::InvalidConfig(
                "normalize std entries must be positive".into(),
            ));
        }
        Ok(Self { mean, std })
    }

    /// Channel statistics of the CIFAR-10 training set.
    pub fn cifar10() -> Self {
        Self {
            mean: vec![0.4914, 0.4822, 0.4465],
            std: vec![0.2471, 0.2435, 0.2616],
        }
    }
}

impl Transform for Normalize {
    fn apply(&self, input: SampleInput, _rng: &mut StdRng) -> Result<SampleInput> {
        input.try_map(|mut image| {
            let shape = image.shape();
            if shape.channels != self.mean.len() {
                return Err(DataError::ShapeMismatch(format!(
                    "normalize configured for {} channels, image has {}",
                    self.mean.len(),
                    shape.channels
                )));
            }
            let plane = shape.height * shape.width;
            for (c, values) in image.data_mut().chunks_mut(plane.max(1)).enumerate() {
                let (mean, std) = (self.mean[c], self.std[c]);
                for value in values {
                    *value = (*value - mean) / std;
                }
            }
            Ok(image)
        })
    }
}

/// Turns a single image into `[image, mirrored image]` views.
#[derive(Debug, Clone, Copy)]
pub struct HorizontalFlipViews;

impl Transform for HorizontalFlipViews {
    fn apply(&self, input: SampleInput, _rng: &mut StdRng) -> Result<SampleInput> {
        match input {
            SampleInput::Single(image) => {
                let flipped = flip_horizontal(&image);
                Ok(SampleInput::Views(vec![image, flipped]))
            }
            SampleInput::Views(_) => Err(DataError::ShapeMismatch(
                "flip views expects a single image".into(),
            )),
        }
    }
}

fn flip_horizontal(image: &Image) -> Image {
    let shape = image.shape();
    let mut out = image.clone();
    for c in 0..shape.channels {
        for y in 0..shape.height {
            let row = image.offset(c, y, 0);
            out.data_mut()[row..row + shape.width].reverse();
        }
    }
    out
}
