//! Diffusion-conditioned music classifiers in pure Rust.
//!
//! A candle-based implementation of BERT classifiers trained on the noised
//! note embeddings of a symbolic-music diffusion model. Reads MIDI files
//! directly and loads diffusion checkpoints from safetensors or PyTorch
//! pickles.
//!
//! ## Architecture
//!
//! ```text
//! MIDI files ──REMI──▶ bar blocks ──▶ cached token matrix + labels
//!                                            │
//!                      word embedding (from the diffusion checkpoint)
//!                                            ↓
//!              q_sample at a random timestep t  (or clean, t = T)
//!                                            ↓
//!          pos_emb + up_proj(x) + time_emb[t] ──▶ BERT encoder
//!                                            ↓
//!                      pooler → classifier   |   MLM head
//! ```
//!
//! ## Modules
//!
//! - [`midi`]: MIDI parsing, REMI tokenization, bar blocking
//! - [`dataset`]: split building, caching and label maps
//! - [`diffusion`]: noise schedules and the forward process
//! - [`model`]: encoder, timed network, heads, music transformer
//! - [`train`]: trainer loop, evaluation and the train/eval tasks
//! - [`config`]: model and diffusion configuration

pub mod config;
pub mod dataset;
pub mod diffusion;
pub mod midi;
pub mod model;
pub mod train;

mod error;

pub use error::{Error, Result};
