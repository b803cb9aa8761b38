//! Diffusion-timestep-conditioned BERT network.
//!
//! Inputs are note embeddings `[B, L, in_channels]`. During training with a
//! diffusion attached, each row is independently corrupted to a random
//! timestep (or left clean), and the network is told which timestep it saw:
//!
//! ```text
//! t ~ U{-1, …, T-1}
//! x ← q_sample(x, t)               if t ≥ 0
//! τ ← t if t ≥ 0 else T            (row T of the table means "clean")
//!
//! h = LayerNorm(pos_emb[0..L] + up_proj(x) + time_emb[τ]) → Dropout → encoder
//! ```

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Dropout, Embedding, LayerNorm, Linear, VarBuilder};

use crate::config::BertConfig;
use crate::diffusion::GaussianDiffusion;
use crate::model::bert::{BertEncoder, EncoderOutput};
use crate::{Error, Result};

/// `Linear → Tanh → Linear` projection from note embeddings to the hidden size.
#[derive(Debug, Clone)]
pub struct UpProjection {
    first: Linear,
    second: Linear,
}

impl UpProjection {
    /// Weights at `<vb>.0` and `<vb>.2`.
    pub fn new(in_dim: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            first: candle_nn::linear(in_dim, hidden, vb.pp("0"))?,
            second: candle_nn::linear(hidden, hidden, vb.pp("2"))?,
        })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(self.second.forward(&self.first.forward(xs)?.tanh()?)?)
    }
}

/// Timestep-conditioned encoder shared by the pretraining and
/// classification heads.
#[derive(Debug, Clone)]
pub struct TimedTransformerNet {
    word_embedding: Embedding,
    time_embeddings: Embedding,
    input_up_proj: UpProjection,
    position_embeddings: Embedding,
    layer_norm: LayerNorm,
    dropout: Dropout,
    input_transformers: BertEncoder,
    diffusion: Option<GaussianDiffusion>,
    diffusion_steps: usize,
    max_position_embeddings: usize,
}

impl TimedTransformerNet {
    pub fn new(
        cfg: &BertConfig,
        in_channels: usize,
        diffusion: Option<GaussianDiffusion>,
        vb: VarBuilder,
    ) -> Result<Self> {
        if let Some(diffusion) = &diffusion
            && diffusion.num_timesteps() != cfg.diffusion_steps
        {
            return Err(Error::Config(format!(
                "diffusion has {} steps but the timestep table covers {}",
                diffusion.num_timesteps(),
                cfg.diffusion_steps
            )));
        }
        Ok(Self {
            word_embedding: candle_nn::embedding(cfg.vocab_size, in_channels, vb.pp("word_embedding"))?,
            time_embeddings: candle_nn::embedding(
                cfg.diffusion_steps + 1,
                cfg.hidden_size,
                vb.pp("time_embeddings"),
            )?,
            input_up_proj: UpProjection::new(in_channels, cfg.hidden_size, vb.pp("input_up_proj"))?,
            position_embeddings: candle_nn::embedding(
                cfg.max_position_embeddings,
                cfg.hidden_size,
                vb.pp("position_embeddings"),
            )?,
            layer_norm: candle_nn::layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("LayerNorm"))?,
            dropout: Dropout::new(cfg.hidden_dropout_prob as f32),
            input_transformers: BertEncoder::new(cfg, vb.pp("input_transformers"))?,
            diffusion,
            diffusion_steps: cfg.diffusion_steps,
            max_position_embeddings: cfg.max_position_embeddings,
        })
    }

    pub fn word_embedding(&self) -> &Embedding {
        &self.word_embedding
    }

    pub fn has_diffusion(&self) -> bool {
        self.diffusion.is_some()
    }

    /// Token ids `[B, L]` → note embeddings `[B, L, in_channels]`.
    pub fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        Ok(self.word_embedding.forward(input_ids)?)
    }

    /// Encode note embeddings `x` `[B, L, in_channels]`.
    ///
    /// With a diffusion attached, timesteps are sampled per row and the
    /// `timesteps` argument is ignored. Without one, `timesteps` `[B]` must
    /// be supplied.
    pub fn forward(&self, x: &Tensor, timesteps: Option<&Tensor>, train: bool) -> Result<EncoderOutput> {
        let (batch, seq_len, _) = x.dims3()?;
        if seq_len > self.max_position_embeddings {
            return Err(Error::Config(format!(
                "sequence length {seq_len} exceeds max_position_embeddings {}",
                self.max_position_embeddings
            )));
        }

        let (x, time_ids) = match (&self.diffusion, timesteps) {
            (Some(diffusion), _) => self.corrupt(diffusion, x, batch)?,
            (None, Some(timesteps)) => (x.clone(), timesteps.to_dtype(DType::U32)?),
            (None, None) => {
                return Err(Error::NotImplemented(
                    "timesteps are required when no diffusion is attached".into(),
                ));
            }
        };
        let time_emb = self.time_embeddings.forward(&time_ids)?.unsqueeze(1)?;

        let emb_x = self.input_up_proj.forward(&x)?;
        let position_ids = Tensor::arange(0u32, seq_len as u32, x.device())?;
        let pos_emb = self.position_embeddings.forward(&position_ids)?.unsqueeze(0)?;

        let emb = emb_x.broadcast_add(&pos_emb)?.broadcast_add(&time_emb)?;
        let emb = self.layer_norm.forward(&emb)?;
        let emb = self.dropout.forward(&emb, train)?;

        self.input_transformers.forward(&emb, None, None, None, train)
    }

    /// Sample per-row timesteps and noise the rows with `t ≥ 0`.
    ///
    /// Returns the (partially) noised input and the timestep-table indices.
    fn corrupt(&self, diffusion: &GaussianDiffusion, x: &Tensor, batch: usize) -> Result<(Tensor, Tensor)> {
        let steps = self.diffusion_steps;
        let device = x.device();
        let (noise_t, time_ids, noised) = sample_timesteps(batch, steps, device)?;

        let t = Tensor::from_vec(noise_t, batch, device)?;
        let noisy = diffusion.q_sample(x, &t, None)?;
        let keep_noisy = Tensor::from_vec(noised, (batch, 1, 1), device)?.broadcast_as(x.shape())?;
        let x = keep_noisy.where_cond(&noisy, x)?;

        Ok((x, Tensor::from_vec(time_ids, batch, device)?))
    }
}

/// Draw `t ∈ [-1, steps)` per row on `device`.
///
/// Returns q_sample indices (clamped to 0 for clean rows), timestep-table
/// indices (`steps` for clean rows) and the noised-row flags.
fn sample_timesteps(batch: usize, steps: usize, device: &Device) -> Result<(Vec<u32>, Vec<u32>, Vec<u8>)> {
    // floor(U[0, steps + 1)) - 1
    let draws: Vec<f32> = Tensor::rand(0f32, (steps + 1) as f32, batch, device)?
        .floor()?
        .to_vec1()?;
    let mut noise_t = Vec::with_capacity(batch);
    let mut time_ids = Vec::with_capacity(batch);
    let mut noised = Vec::with_capacity(batch);
    for draw in draws {
        let t = (draw as i64).clamp(0, steps as i64) - 1;
        if t >= 0 {
            noise_t.push(t as u32);
            time_ids.push(t as u32);
            noised.push(1u8);
        } else {
            noise_t.push(0);
            time_ids.push(steps as u32);
            noised.push(0);
        }
    }
    Ok((noise_t, time_ids, noised))
}
