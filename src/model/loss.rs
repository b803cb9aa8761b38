//! Mean-reduced losses for the model heads.

use candle_core::{DType, Tensor};

use crate::Result;

/// Mean squared error.
pub fn mse(predictions: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let targets = targets.to_dtype(predictions.dtype())?;
    Ok((predictions - targets)?.sqr()?.mean_all()?)
}

/// Cross-entropy of `[N, C]` logits against `[N]` class ids.
pub fn cross_entropy(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let logits = logits.to_dtype(DType::F32)?;
    let targets = targets.to_dtype(DType::U32)?;
    Ok(candle_nn::loss::cross_entropy(&logits, &targets)?)
}

/// Binary cross-entropy on logits, mean over every element.
///
/// Uses `max(x, 0) - x·y + ln(1 + e^{-|x|})`, which stays finite for large
/// logits.
pub fn bce_with_logits(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let x = logits.to_dtype(DType::F32)?;
    let y = targets.to_dtype(DType::F32)?;
    let softplus = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
    let loss = ((x.relu()? - (&x * &y)?)? + softplus)?;
    Ok(loss.mean_all()?)
}
