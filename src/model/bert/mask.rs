//! Additive attention masks.
//!
//! Masks are added to the raw attention scores: 0.0 for visible positions
//! and the dtype's minimum for hidden ones, so softmax drives them to zero.

use candle_core::{DType, Device, Result, Tensor};

/// Most negative finite value representable in `dtype`.
pub fn min_value(dtype: DType) -> f64 {
    match dtype {
        DType::F16 => f64::from(half::f16::MIN),
        DType::BF16 => f64::from(half::bf16::MIN),
        DType::F64 => f64::MIN,
        _ => f64::from(f32::MIN),
    }
}

/// Lower-triangular mask `[1, 1, S, S]` hiding future positions.
pub fn causal_mask(seq_len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let min_val = min_value(dtype);
    let mask_data: Vec<f64> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { min_val } else { 0.0 }))
        .collect();
    Tensor::new(mask_data.as_slice(), device)?
        .reshape((1, 1, seq_len, seq_len))?
        .to_dtype(dtype)
}

/// Expand a `[B, S]` padding mask (1 = valid, 0 = padding) to an additive
/// `[B, 1, 1, S]` mask.
pub fn padding_mask(mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let mask = mask.to_dtype(DType::F32)?.unsqueeze(1)?.unsqueeze(1)?;
    let hidden = (1.0 - mask)?;
    (hidden * min_value(dtype).max(f64::from(f32::MIN)))?.to_dtype(dtype)
}

/// Combine optional additive masks by broadcasting addition.
pub fn combine(a: Option<Tensor>, b: Option<Tensor>) -> Result<Option<Tensor>> {
    match (a, b) {
        (Some(a), Some(b)) => Ok(Some(a.broadcast_add(&b)?)),
        (a, b) => Ok(a.or(b)),
    }
}
