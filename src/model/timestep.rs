//! Sinusoidal timestep embedding for diffusion conditioning.
//!
//! ```text
//! freqs_i = exp(-ln(max_period) · i / half),   i < half = dim / 2
//! emb     = [cos(t · freqs), sin(t · freqs)]   (+ a zero column for odd dim)
//! ```

use candle_core::{DType, Tensor};

use crate::Result;

/// `[B]` timesteps → `[B, dim]` embedding (f32).
pub fn timestep_embedding(timesteps: &Tensor, dim: usize, max_period: f64) -> Result<Tensor> {
    let dev = timesteps.device();
    let half = dim / 2;

    let freqs: Vec<f32> = (0..half)
        .map(|i| (-(max_period.ln()) * i as f64 / half as f64).exp() as f32)
        .collect();
    let freqs = Tensor::new(freqs.as_slice(), dev)?;

    // args = t[:, None] * freqs[None, :]
    let t = timesteps.to_dtype(DType::F32)?;
    let args = t.unsqueeze(1)?.broadcast_mul(&freqs.unsqueeze(0)?)?;

    let mut emb = Tensor::cat(&[&args.cos()?, &args.sin()?], 1)?;
    if dim % 2 == 1 {
        let pad = Tensor::zeros((emb.dim(0)?, 1), DType::F32, dev)?;
        emb = Tensor::cat(&[&emb, &pad], 1)?;
    }
    Ok(emb)
}
