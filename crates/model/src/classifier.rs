use candle_core::{DType, Result, Tensor, Var};

/// Image classifier driven by the training loop.
///
/// `forward_t` maps `(batch, channels, height, width)` inputs to
/// `(batch, num_classes)` logits. `train` selects batch statistics versus
/// running statistics in normalisation layers.
pub trait Classifier {
    fn forward_t(&self, inputs: &Tensor, train: bool) -> Result<Tensor>;

    /// Parameters the optimizer should update, in a stable order.
    fn trainable_parameters(&self) -> Vec<(String, Var)>;

    fn num_classes(&self) -> usize;

    /// Dtype the model expects its inputs in.
    fn input_dtype(&self) -> DType;
}
