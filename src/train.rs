//! Training and evaluation.
//!
//! ## Components
//!
//! - [`batch`]: tensor batches and seeded epoch ordering
//! - [`schedule`]: learning-rate schedules
//! - [`trainer`]: AdamW loop with periodic logging, evaluation and checkpoints
//! - [`task`]: the classifier train/eval tasks run by the CLI
//!
//! Models plug into the trainer through [`Objective`].

pub mod batch;
pub mod schedule;
pub mod task;
pub mod trainer;

use std::path::{Path, PathBuf};

use candle_core::{DType, IndexOp, Tensor};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::model::classifier::TransformerNetClassifier;
use crate::model::pretrain::TimedTransformerForPretrain;
use batch::Batch;

/// Trainer hyperparameters. Stored as `training_args.json` in the output
/// directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingArgs {
    pub output_dir: PathBuf,
    #[serde(default = "default_num_train_epochs")]
    pub num_train_epochs: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_batch_size")]
    pub per_device_train_batch_size: usize,
    #[serde(default = "default_batch_size")]
    pub per_device_eval_batch_size: usize,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default)]
    pub warmup_steps: usize,
    #[serde(default = "default_logging_steps")]
    pub logging_steps: usize,
    #[serde(default = "default_save_steps")]
    pub save_steps: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl TrainingArgs {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            num_train_epochs: default_num_train_epochs(),
            learning_rate: default_learning_rate(),
            per_device_train_batch_size: default_batch_size(),
            per_device_eval_batch_size: default_batch_size(),
            weight_decay: 0.0,
            warmup_steps: 0,
            logging_steps: default_logging_steps(),
            save_steps: default_save_steps(),
            seed: default_seed(),
        }
    }

    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

fn default_num_train_epochs() -> usize {
    30
}
fn default_learning_rate() -> f64 {
    1e-4
}
fn default_batch_size() -> usize {
    64
}
fn default_logging_steps() -> usize {
    1000
}
fn default_save_steps() -> usize {
    5000
}
fn default_seed() -> u64 {
    102
}

/// Loss and prediction counts of one batch.
#[derive(Debug, Clone)]
pub struct ObjectiveOutput {
    /// Scalar mean loss.
    pub loss: Tensor,
    pub correct: usize,
    pub total: usize,
}

/// A model the trainer can optimise and evaluate.
pub trait Objective {
    fn compute(&self, batch: &Batch, train: bool) -> Result<ObjectiveOutput>;
}

impl Objective for TransformerNetClassifier {
    fn compute(&self, batch: &Batch, train: bool) -> Result<ObjectiveOutput> {
        let out = self.forward(
            &batch.input_ids,
            Some(&batch.labels),
            batch.timesteps.as_ref(),
            None,
            train,
        )?;
        let predictions = out.logits.argmax(1)?;
        let correct = count_equal(&predictions, &batch.labels)?;
        let loss = out
            .loss
            .ok_or_else(|| crate::Error::Config("classifier returned no loss".into()))?;
        Ok(ObjectiveOutput {
            loss,
            correct,
            total: batch.len(),
        })
    }
}

/// Next-token objective over the input ids themselves.
impl Objective for TimedTransformerForPretrain {
    fn compute(&self, batch: &Batch, train: bool) -> Result<ObjectiveOutput> {
        let ids = &batch.input_ids;
        let seq_len = ids.dim(1)?;
        if seq_len < 2 {
            return Err(crate::Error::Dataset(format!(
                "next-token objective needs at least 2 tokens, got {seq_len}"
            )));
        }
        let out = self.forward(ids, batch.timesteps.as_ref(), None, Some(ids), train)?;
        let predictions = out
            .prediction_logits
            .i((.., ..seq_len - 1, ..))?
            .argmax(2)?;
        let targets = ids.i((.., 1..))?;
        let correct = count_equal(&predictions, &targets)?;
        let loss = out
            .loss
            .ok_or_else(|| crate::Error::Config("pretraining head returned no loss".into()))?;
        Ok(ObjectiveOutput {
            loss,
            correct,
            total: predictions.elem_count(),
        })
    }
}

fn count_equal(a: &Tensor, b: &Tensor) -> Result<usize> {
    let same = a
        .to_dtype(DType::U32)?
        .eq(&b.to_dtype(DType::U32)?)?
        .to_dtype(DType::U32)?
        .sum_all()?
        .to_scalar::<u32>()?;
    Ok(same as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BertConfig, PositionEmbeddingType};
    use crate::dataset::Sample;
    use candle_core::Device;
    use candle_nn::{VarBuilder, VarMap};

    fn pretrain_model(varmap: &VarMap) -> TimedTransformerForPretrain {
        let cfg = BertConfig {
            vocab_size: 12,
            hidden_size: 8,
            num_hidden_layers: 1,
            num_attention_heads: 2,
            intermediate_size: 16,
            max_position_embeddings: 8,
            position_embedding_type: PositionEmbeddingType::RelativeKey,
            diffusion_steps: 4,
            ..BertConfig::default()
        };
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        TimedTransformerForPretrain::new(&cfg, 4, None, vb).unwrap()
    }

    fn batch_of(rows: &[Vec<u32>]) -> Batch {
        let samples: Vec<Sample> = rows
            .iter()
            .map(|ids| Sample {
                input_ids: ids.clone(),
                label: 0,
            })
            .collect();
        let refs: Vec<&Sample> = samples.iter().collect();
        Batch::from_samples(&refs, Some(4), &Device::Cpu).unwrap()
    }

    #[test]
    fn pretrain_objective_counts_shifted_tokens() {
        let varmap = VarMap::new();
        let model = pretrain_model(&varmap);
        let batch = batch_of(&[vec![1, 4, 5, 6], vec![3, 3, 7, 11]]);
        let out = model.compute(&batch, false).unwrap();
        assert_eq!(out.total, 2 * 3);
        assert!(out.correct <= out.total);
        let loss: f32 = out.loss.to_scalar().unwrap();
        assert!(loss.is_finite() && loss > 0.0);
    }

    #[test]
    fn pretrain_objective_rejects_single_token_rows() {
        let varmap = VarMap::new();
        let model = pretrain_model(&varmap);
        let batch = batch_of(&[vec![1], vec![2]]);
        assert!(matches!(model.compute(&batch, false), Err(crate::Error::Dataset(_))));
    }

    #[test]
    fn training_args_defaults() {
        let args: TrainingArgs = serde_json::from_str(r#"{"output_dir": "out"}"#).unwrap();
        assert_eq!(args, TrainingArgs::new("out"));
        assert_eq!(args.seed, 102);
        assert_eq!(args.logging_steps, 1000);
        assert_eq!(args.save_steps, 5000);
        assert_eq!(args.weight_decay, 0.0);
    }

    #[test]
    fn count_equal_compares_elementwise() {
        let dev = Device::Cpu;
        let a = Tensor::new(&[1u32, 2, 3, 4], &dev).unwrap();
        let b = Tensor::new(&[1u32, 0, 3, 0], &dev).unwrap();
        assert_eq!(count_equal(&a, &b).unwrap(), 2);
    }
}
