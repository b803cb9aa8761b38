//! Bar-aligned fixed-length blocks.
//!
//! A REMI stream is cut at `Bar` tokens and whole bars are packed greedily
//! into blocks of `block_size` tokens, right-padded with `PAD`. A bar that
//! alone exceeds the block is truncated into its own block. Blocks that are
//! mostly padding carry little signal and are dropped.

use serde::{Deserialize, Serialize};

use super::remi::{BAR_ID, PAD_ID};
use crate::{Error, Result};

/// Default maximum padding fraction of a kept block.
pub const DEFAULT_SKIP_PADDINGS_RATIO: f64 = 0.2;

/// How token streams are cut into model inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingMode {
    BarBlock,
}

impl std::str::FromStr for PaddingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bar_block" => Ok(PaddingMode::BarBlock),
            other => Err(Error::NotImplemented(format!("padding mode '{other}'"))),
        }
    }
}

/// Split `tokens` into padded blocks of exactly `block_size` tokens.
///
/// Blocks with more than `skip_paddings_ratio` padding are skipped.
pub fn bar_blocks(tokens: &[u32], block_size: usize, skip_paddings_ratio: f64) -> Vec<Vec<u32>> {
    let mut blocks = Vec::new();
    if block_size == 0 {
        return blocks;
    }
    let mut current: Vec<u32> = Vec::with_capacity(block_size);

    for bar in split_bars(tokens) {
        if bar.len() > block_size {
            flush(&mut current, &mut blocks, block_size, skip_paddings_ratio);
            blocks.push(bar[..block_size].to_vec());
            continue;
        }
        if current.len() + bar.len() > block_size {
            flush(&mut current, &mut blocks, block_size, skip_paddings_ratio);
        }
        current.extend_from_slice(bar);
    }
    flush(&mut current, &mut blocks, block_size, skip_paddings_ratio);
    blocks
}

/// Slices starting at each `Bar` token. Tokens before the first bar form
/// their own slice.
fn split_bars(tokens: &[u32]) -> Vec<&[u32]> {
    let mut bars = Vec::new();
    let mut start = 0;
    for (i, &token) in tokens.iter().enumerate() {
        if token == BAR_ID && i > start {
            bars.push(&tokens[start..i]);
            start = i;
        }
    }
    if start < tokens.len() {
        bars.push(&tokens[start..]);
    }
    bars
}

fn flush(current: &mut Vec<u32>, blocks: &mut Vec<Vec<u32>>, block_size: usize, ratio: f64) {
    if current.is_empty() {
        return;
    }
    let padding = block_size - current.len();
    if padding as f64 / block_size as f64 <= ratio {
        let mut block = std::mem::take(current);
        block.resize(block_size, PAD_ID);
        blocks.push(block);
    } else {
        tracing::trace!(padding, block_size, "dropping sparse block");
        current.clear();
    }
}
