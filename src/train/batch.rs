//! Tensor batches and epoch ordering.

use candle_core::{Device, Tensor};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use crate::dataset::Sample;
use crate::{Error, Result};

/// Model inputs for one step.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[B, L]` u32
    pub input_ids: Tensor,
    /// `[B]` u32
    pub labels: Tensor,
    /// `[B]` u32, for models without a diffusion attached.
    pub timesteps: Option<Tensor>,
}

impl Batch {
    /// Stack `samples` into tensors. Every sample must have the same length.
    pub fn from_samples(samples: &[&Sample], timestep: Option<u32>, device: &Device) -> Result<Self> {
        let Some(first) = samples.first() else {
            return Err(Error::Dataset("empty batch".into()));
        };
        let seq_len = first.input_ids.len();
        let mut ids = Vec::with_capacity(samples.len() * seq_len);
        for sample in samples {
            if sample.input_ids.len() != seq_len {
                return Err(Error::Dataset(format!(
                    "ragged batch: {} and {} tokens",
                    seq_len,
                    sample.input_ids.len()
                )));
            }
            ids.extend_from_slice(&sample.input_ids);
        }
        let labels: Vec<u32> = samples.iter().map(|s| s.label).collect();
        let batch = samples.len();
        Ok(Self {
            input_ids: Tensor::from_vec(ids, (batch, seq_len), device)?,
            labels: Tensor::from_vec(labels, batch, device)?,
            timesteps: timestep
                .map(|t| Tensor::from_vec(vec![t; batch], batch, device))
                .transpose()?,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Number of batches of `batch_size` covering `len` samples.
pub fn num_batches(len: usize, batch_size: usize) -> usize {
    len.div_ceil(batch_size.max(1))
}

/// Per-epoch sample permutations drawn from one seeded stream, so epoch `n`
/// gets the same order whether or not training resumed before it.
#[derive(Debug, Clone)]
pub struct EpochOrder {
    rng: ChaCha8Rng,
    len: usize,
}

impl EpochOrder {
    pub fn new(len: usize, seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            len,
        }
    }

    /// Order of the next epoch.
    pub fn next_epoch(&mut self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len).collect();
        order.shuffle(&mut self.rng);
        order
    }
}
