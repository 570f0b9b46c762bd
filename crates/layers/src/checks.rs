//! Lightweight validation helpers shared across layer components.
//!
//! These routines return `candle_core::Result<()>` so call sites can propagate
//! errors without panicking.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "expected shape {:?}, got {:?}",
            expected, actual
        )))
    }
}

/// Ensures the tensor has exactly `rank` dimensions.
pub fn expect_rank(label: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    let dims = tensor.dims();
    if dims.len() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected rank {rank}, got shape {:?}",
            dims
        )))
    }
}

/// Validates the `(batch, channels, height, width)` layout with a known channel count.
pub fn expect_nchw(label: &str, tensor: &Tensor, channels: usize) -> Result<()> {
    match tensor.dims() {
        [_, c, _, _] if *c == channels => Ok(()),
        dims => Err(Error::Msg(format!(
            "{label}: expected (batch, {channels}, height, width) layout, got {:?}",
            dims
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "expected dtype in {:?}, got {:?}",
            allowed, dtype
        )))
    }
}
