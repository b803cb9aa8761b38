//! Gaussian diffusion forward process.
//!
//! Only the corruption side is needed here: classifiers are trained on
//! embeddings that have been noised the same way the generative model saw
//! them.
//!
//! ## Forward process
//!
//! ```text
//! ᾱ_t  = Π_{s≤t} (1 - β_s)
//! x_t  = √ᾱ_t · x_0 + √(1 - ᾱ_t) · ε,   ε ~ N(0, I)
//! ```
//!
//! ## Named β schedules
//!
//! - `linear`: β from `1e-4·k` to `2e-2·k` with `k = 1000 / T`
//! - `cosine`: ᾱ(t) = cos²((t + 0.008) / 1.008 · π/2)
//! - `sqrt`:   ᾱ(t) = 1 - √(t + 1e-4)
//!
//! Alpha-bar schedules derive β from consecutive ᾱ ratios, clipped at 0.999.

use candle_core::{DType, Tensor};

use crate::config::DiffusionArgs;
use crate::{Error, Result};

const MAX_BETA: f64 = 0.999;

/// Build the β sequence for a named schedule.
pub fn named_beta_schedule(name: &str, num_timesteps: usize) -> Result<Vec<f64>> {
    if num_timesteps == 0 {
        return Err(Error::Config("diffusion needs at least one timestep".into()));
    }
    match name {
        "linear" => {
            let scale = 1000.0 / num_timesteps as f64;
            let beta_start = scale * 0.0001;
            let beta_end = scale * 0.02;
            Ok(linspace(beta_start, beta_end, num_timesteps))
        }
        "cosine" => Ok(betas_for_alpha_bar(num_timesteps, |t| {
            ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2)
                .cos()
                .powi(2)
        })),
        "sqrt" => Ok(betas_for_alpha_bar(num_timesteps, |t| {
            1.0 - (t + 0.0001).sqrt()
        })),
        other => Err(Error::Config(format!("unknown noise schedule '{other}'"))),
    }
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    let step = (end - start) / (n - 1) as f64;
    (0..n).map(|i| start + step * i as f64).collect()
}

fn betas_for_alpha_bar(num_timesteps: usize, alpha_bar: impl Fn(f64) -> f64) -> Vec<f64> {
    (0..num_timesteps)
        .map(|i| {
            let t1 = i as f64 / num_timesteps as f64;
            let t2 = (i + 1) as f64 / num_timesteps as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(MAX_BETA)
        })
        .collect()
}

/// Precomputed forward-process coefficients.
#[derive(Debug, Clone)]
pub struct GaussianDiffusion {
    betas: Vec<f64>,
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
}

impl GaussianDiffusion {
    pub fn new(betas: Vec<f64>) -> Result<Self> {
        if betas.is_empty() {
            return Err(Error::Config("empty beta schedule".into()));
        }
        if let Some(bad) = betas.iter().find(|b| !(**b > 0.0 && **b <= 1.0)) {
            return Err(Error::Config(format!("beta {bad} outside (0, 1]")));
        }
        let mut cumprod = 1.0;
        let mut sqrt_alphas_cumprod = Vec::with_capacity(betas.len());
        let mut sqrt_one_minus_alphas_cumprod = Vec::with_capacity(betas.len());
        for beta in &betas {
            cumprod *= 1.0 - beta;
            sqrt_alphas_cumprod.push(cumprod.sqrt());
            sqrt_one_minus_alphas_cumprod.push((1.0 - cumprod).sqrt());
        }
        Ok(Self {
            betas,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
        })
    }

    /// Build the diffusion described by a training run's arguments.
    pub fn from_args(args: &DiffusionArgs) -> Result<Self> {
        let betas = named_beta_schedule(&args.noise_schedule, args.diffusion_steps)?;
        tracing::info!(
            schedule = %args.noise_schedule,
            steps = args.diffusion_steps,
            "built diffusion noise schedule"
        );
        Self::new(betas)
    }

    pub fn num_timesteps(&self) -> usize {
        self.betas.len()
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn sqrt_alphas_cumprod(&self) -> &[f64] {
        &self.sqrt_alphas_cumprod
    }

    /// Diffuse `x_start` to timesteps `t`.
    ///
    /// - `x_start`: `[B, ...]`
    /// - `t`: `[B]` integer timesteps, each `< num_timesteps`
    /// - `noise`: same shape as `x_start`; drawn from N(0, I) when `None`
    pub fn q_sample(&self, x_start: &Tensor, t: &Tensor, noise: Option<&Tensor>) -> Result<Tensor> {
        let noise = match noise {
            Some(noise) => noise.clone(),
            None => x_start.randn_like(0.0, 1.0)?,
        };
        let a = self.extract(&self.sqrt_alphas_cumprod, t, x_start)?;
        let b = self.extract(&self.sqrt_one_minus_alphas_cumprod, t, x_start)?;
        let out = (x_start.broadcast_mul(&a)? + noise.broadcast_mul(&b)?)?;
        Ok(out)
    }

    /// Gather `coefs[t]` per batch row and reshape to broadcast over `like`.
    fn extract(&self, coefs: &[f64], t: &Tensor, like: &Tensor) -> Result<Tensor> {
        let table = Tensor::new(coefs, like.device())?.to_dtype(like.dtype())?;
        let t = t.to_dtype(DType::U32)?;
        let batch = t.dim(0)?;
        let mut shape = vec![batch];
        shape.extend(std::iter::repeat_n(1, like.rank() - 1));
        Ok(table.index_select(&t, 0)?.reshape(shape)?)
    }
}
