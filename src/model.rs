//! Model components.
//!
//! ## Components
//!
//! - [`bert`]: BERT encoder stack with relative-position attention, pooler and MLM head
//! - [`timed`]: diffusion-timestep-conditioned network shared by both heads
//! - [`pretrain`]: next-token pretraining head
//! - [`classifier`]: sequence classification head
//! - [`music_transformer`]: denoising transformer of the diffusion language model
//! - [`weights`]: safetensors / PyTorch checkpoint loading

pub mod bert;
pub mod classifier;
pub mod loss;
pub mod music_transformer;
pub mod pretrain;
pub mod timed;
pub mod timestep;
pub mod weights;
