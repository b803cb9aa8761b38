//! AdamW training loop.
//!
//! ```text
//! for epoch:
//!     for batch in seeded permutation:
//!         lr ← schedule(step); loss.backward(); AdamW step
//!         every logging_steps: log mean loss, evaluate
//!         every save_steps:    <output>/checkpoint-<step>/
//! <output>/model.safetensors
//! ```
//!
//! Checkpoint directories hold `model.safetensors` and `trainer_state.json`.
//! Resuming reloads both, replays the epoch permutations and skips the steps
//! already taken. AdamW moments are not checkpointed and restart from zero.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use candle_core::{Device, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use serde::{Deserialize, Serialize};

use super::batch::{Batch, EpochOrder, num_batches};
use super::schedule::LinearSchedule;
use super::{Objective, TrainingArgs};
use crate::dataset::Sample;
use crate::model::weights::{load_into_varmap, read_tensors};
use crate::{Error, Result};

pub const MODEL_FILE: &str = "model.safetensors";
pub const STATE_FILE: &str = "trainer_state.json";

/// One entry of the training log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: usize,
    pub epoch: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_accuracy: Option<f64>,
}

/// Progress written next to every checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: usize,
    pub max_steps: usize,
    pub epoch: f64,
    #[serde(default)]
    pub log_history: Vec<LogEntry>,
}

impl TrainerState {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }

    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Mean loss and accuracy over a dataset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub samples: usize,
}

/// Evaluate `model` over `samples` in order, without dropout.
pub fn evaluate<M: Objective>(
    model: &M,
    samples: &[Sample],
    batch_size: usize,
    timestep: Option<u32>,
    device: &Device,
) -> Result<EvalMetrics> {
    let mut loss_sum = 0.0;
    let mut correct = 0;
    let mut total = 0;
    for chunk in samples.chunks(batch_size.max(1)) {
        let refs: Vec<&Sample> = chunk.iter().collect();
        let batch = Batch::from_samples(&refs, timestep, device)?;
        let out = model.compute(&batch, false)?;
        let loss: f32 = out.loss.to_dtype(candle_core::DType::F32)?.to_scalar()?;
        loss_sum += f64::from(loss) * batch.len() as f64;
        correct += out.correct;
        total += out.total;
    }
    Ok(EvalMetrics {
        loss: loss_sum / samples.len().max(1) as f64,
        accuracy: correct as f64 / total.max(1) as f64,
        samples: samples.len(),
    })
}

/// Drives an [`Objective`] over a training set.
pub struct Trainer<'a, M: Objective> {
    model: &'a M,
    varmap: &'a VarMap,
    args: TrainingArgs,
    frozen: HashSet<String>,
    /// Constant timestep for models without a diffusion attached.
    timestep: Option<u32>,
    device: Device,
}

impl<'a, M: Objective> Trainer<'a, M> {
    pub fn new(model: &'a M, varmap: &'a VarMap, args: TrainingArgs, device: &Device) -> Self {
        Self {
            model,
            varmap,
            args,
            frozen: HashSet::new(),
            timestep: None,
            device: device.clone(),
        }
    }

    /// Exclude the named variables from optimisation.
    pub fn freeze(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.frozen.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_timestep(mut self, timestep: Option<u32>) -> Self {
        self.timestep = timestep;
        self
    }

    pub fn args(&self) -> &TrainingArgs {
        &self.args
    }

    fn trainable_vars(&self) -> Result<Vec<Var>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| Error::Config(format!("variable map poisoned: {e}")))?;
        let mut named: Vec<(&String, &Var)> = data
            .iter()
            .filter(|(name, _)| !self.frozen.contains(*name))
            .collect();
        named.sort_by(|a, b| a.0.cmp(b.0));
        Ok(named.into_iter().map(|(_, var)| var.clone()).collect())
    }

    /// Restore weights and progress from a checkpoint directory.
    fn resume(&self, dir: &Path) -> Result<TrainerState> {
        let tensors = read_tensors(dir.join(MODEL_FILE), &self.device)?;
        load_into_varmap(self.varmap, &tensors, true)?;
        let state = TrainerState::from_json_file(dir.join(STATE_FILE))?;
        tracing::info!(path = %dir.display(), step = state.global_step, "resumed from checkpoint");
        Ok(state)
    }

    fn save_checkpoint(&self, state: &TrainerState) -> Result<PathBuf> {
        let dir = self
            .args
            .output_dir
            .join(format!("checkpoint-{}", state.global_step));
        std::fs::create_dir_all(&dir)?;
        self.varmap.save(dir.join(MODEL_FILE))?;
        state.to_json_file(dir.join(STATE_FILE))?;
        tracing::info!(path = %dir.display(), "saved checkpoint");
        Ok(dir)
    }

    /// Train on `train`, evaluating on `eval` every `logging_steps`.
    pub fn train(&self, train: &[Sample], eval: &[Sample], resume_from: Option<&Path>) -> Result<TrainerState> {
        let args = &self.args;
        if train.is_empty() {
            return Err(Error::Dataset("no training samples".into()));
        }
        std::fs::create_dir_all(&args.output_dir)?;
        args.to_json_file(args.output_dir.join("training_args.json"))?;

        let steps_per_epoch = num_batches(train.len(), args.per_device_train_batch_size);
        let max_steps = steps_per_epoch * args.num_train_epochs;
        let schedule = LinearSchedule::new(args.learning_rate, args.warmup_steps, max_steps);

        let mut state = match resume_from {
            Some(dir) => self.resume(dir)?,
            None => TrainerState::default(),
        };
        state.max_steps = max_steps;

        let vars = self.trainable_vars()?;
        let trainable: usize = vars.iter().map(|v| v.as_tensor().elem_count()).sum();
        tracing::info!(
            samples = train.len(),
            epochs = args.num_train_epochs,
            max_steps,
            trainable_params = trainable,
            frozen = self.frozen.len(),
            "starting training"
        );
        let mut optimizer = AdamW::new(
            vars,
            ParamsAdamW {
                lr: schedule.lr_at(state.global_step),
                weight_decay: args.weight_decay,
                ..Default::default()
            },
        )?;

        let mut order = EpochOrder::new(train.len(), args.seed);
        let mut running_loss = 0.0;
        let mut running_steps = 0;
        let mut step = 0;

        for epoch in 0..args.num_train_epochs {
            let permutation = order.next_epoch();
            for indices in permutation.chunks(args.per_device_train_batch_size.max(1)) {
                step += 1;
                if step <= state.global_step {
                    continue;
                }

                let lr = schedule.lr_at(step - 1);
                optimizer.set_learning_rate(lr);

                let samples: Vec<&Sample> = indices.iter().map(|&i| &train[i]).collect();
                let batch = Batch::from_samples(&samples, self.timestep, &self.device)?;
                let out = self.model.compute(&batch, true)?;
                let loss: f32 = out.loss.to_dtype(candle_core::DType::F32)?.to_scalar()?;
                if !loss.is_finite() {
                    return Err(Error::Training(format!("loss became {loss} at step {step}")));
                }
                optimizer.backward_step(&out.loss)?;

                running_loss += f64::from(loss);
                running_steps += 1;
                state.global_step = step;
                state.epoch = epoch as f64 + (step - epoch * steps_per_epoch) as f64 / steps_per_epoch as f64;

                if args.logging_steps > 0 && step % args.logging_steps == 0 {
                    let mean = running_loss / running_steps as f64;
                    running_loss = 0.0;
                    running_steps = 0;
                    tracing::info!(step, epoch = state.epoch, loss = mean, lr, "train");
                    state.log_history.push(LogEntry {
                        step,
                        epoch: state.epoch,
                        loss: Some(mean),
                        learning_rate: Some(lr),
                        eval_loss: None,
                        eval_accuracy: None,
                    });
                    if !eval.is_empty() {
                        let metrics = evaluate(
                            self.model,
                            eval,
                            args.per_device_eval_batch_size,
                            self.timestep,
                            &self.device,
                        )?;
                        tracing::info!(
                            step,
                            eval_loss = metrics.loss,
                            eval_accuracy = metrics.accuracy,
                            "eval"
                        );
                        state.log_history.push(LogEntry {
                            step,
                            epoch: state.epoch,
                            loss: None,
                            learning_rate: None,
                            eval_loss: Some(metrics.loss),
                            eval_accuracy: Some(metrics.accuracy),
                        });
                    }
                }

                if args.save_steps > 0 && step % args.save_steps == 0 {
                    self.save_checkpoint(&state)?;
                }
            }
        }

        self.varmap.save(args.output_dir.join(MODEL_FILE))?;
        state.to_json_file(args.output_dir.join(STATE_FILE))?;
        tracing::info!(
            steps = state.global_step,
            path = %args.output_dir.join(MODEL_FILE).display(),
            "training finished"
        );
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BertConfig, PositionEmbeddingType};
    use crate::model::classifier::TransformerNetClassifier;
    use candle_core::DType;
    use candle_nn::VarBuilder;

    const FROZEN: &str = "transformer_net.word_embedding.weight";

    fn cfg() -> BertConfig {
        BertConfig {
            vocab_size: 10,
            hidden_size: 8,
            num_hidden_layers: 1,
            num_attention_heads: 2,
            intermediate_size: 16,
            max_position_embeddings: 8,
            position_embedding_type: PositionEmbeddingType::RelativeKey,
            hidden_dropout_prob: 0.0,
            attention_probs_dropout_prob: 0.0,
            diffusion_steps: 4,
            num_labels: 2,
            ..BertConfig::default()
        }
    }

    /// Label 1 iff the sequence starts with token 9.
    fn samples(n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| {
                let label = (i % 2) as u32;
                let first = if label == 1 { 9 } else { 1 };
                Sample {
                    input_ids: vec![first, 2, 3, (i % 7) as u32],
                    label,
                }
            })
            .collect()
    }

    fn build() -> (VarMap, TransformerNetClassifier) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = TransformerNetClassifier::new(&cfg(), 4, None, vb).unwrap();
        (varmap, model)
    }

    fn args(dir: &Path) -> TrainingArgs {
        TrainingArgs {
            num_train_epochs: 3,
            learning_rate: 1e-2,
            per_device_train_batch_size: 4,
            per_device_eval_batch_size: 5,
            logging_steps: 2,
            save_steps: 3,
            ..TrainingArgs::new(dir)
        }
    }

    fn var(varmap: &VarMap, name: &str) -> Vec<f32> {
        varmap.data().lock().unwrap()[name]
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap()
    }

    #[test]
    fn evaluate_weights_loss_by_samples() {
        let (_varmap, model) = build();
        let data = samples(7);
        let metrics = evaluate(&model, &data, 3, Some(4), &Device::Cpu).unwrap();
        assert_eq!(metrics.samples, 7);
        assert!(metrics.loss.is_finite());
        assert!((0.0..=1.0).contains(&metrics.accuracy));
    }

    #[test]
    fn trains_checkpoints_and_keeps_frozen_weights() {
        let dir = tempfile::tempdir().unwrap();
        let (varmap, model) = build();
        let frozen_before = var(&varmap, FROZEN);
        let pooler_before = var(&varmap, "pooler.dense.weight");

        let trainer = Trainer::new(&model, &varmap, args(dir.path()), &Device::Cpu)
            .freeze([FROZEN])
            .with_timestep(Some(4));
        let state = trainer.train(&samples(10), &samples(5), None).unwrap();

        // 10 samples / batch 4 → 3 steps per epoch, 3 epochs.
        assert_eq!(state.global_step, 9);
        assert_eq!(state.max_steps, 9);
        assert!((state.epoch - 3.0).abs() < 1e-9);
        assert!(state.log_history.iter().any(|e| e.eval_accuracy.is_some()));
        assert_eq!(var(&varmap, FROZEN), frozen_before);
        assert_ne!(var(&varmap, "pooler.dense.weight"), pooler_before);

        for step in [3, 6, 9] {
            let ckpt = dir.path().join(format!("checkpoint-{step}"));
            assert!(ckpt.join(MODEL_FILE).exists());
            let saved = TrainerState::from_json_file(ckpt.join(STATE_FILE)).unwrap();
            assert_eq!(saved.global_step, step);
        }
        assert!(dir.path().join(MODEL_FILE).exists());
        assert!(dir.path().join("training_args.json").exists());
    }

    #[test]
    fn resume_skips_completed_steps() {
        let dir = tempfile::tempdir().unwrap();
        let (varmap, model) = build();
        let trainer = Trainer::new(&model, &varmap, args(dir.path()), &Device::Cpu).with_timestep(Some(4));
        trainer.train(&samples(10), &[], None).unwrap();

        let resumed_dir = tempfile::tempdir().unwrap();
        let (varmap2, model2) = build();
        let trainer2 =
            Trainer::new(&model2, &varmap2, args(resumed_dir.path()), &Device::Cpu).with_timestep(Some(4));
        let state = trainer2
            .train(&samples(10), &[], Some(&dir.path().join("checkpoint-6")))
            .unwrap();
        assert_eq!(state.global_step, 9);
        // Steps 7..=9 ran after the resume; only checkpoint-9 was written.
        assert!(resumed_dir.path().join("checkpoint-9").exists());
        assert!(!resumed_dir.path().join("checkpoint-3").exists());
    }

    struct Diverged;

    impl Objective for Diverged {
        fn compute(&self, batch: &Batch, _train: bool) -> Result<crate::train::ObjectiveOutput> {
            Ok(crate::train::ObjectiveOutput {
                loss: candle_core::Tensor::new(f32::NAN, &Device::Cpu)?,
                correct: 0,
                total: batch.len(),
            })
        }
    }

    #[test]
    fn non_finite_loss_stops_training() {
        let dir = tempfile::tempdir().unwrap();
        let varmap = VarMap::new();
        let trainer = Trainer::new(&Diverged, &varmap, args(dir.path()), &Device::Cpu);
        let err = trainer.train(&samples(4), &[], None).unwrap_err();
        match err {
            Error::Training(msg) => assert!(msg.contains("step 1"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_training_set_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (varmap, model) = build();
        let trainer = Trainer::new(&model, &varmap, args(dir.path()), &Device::Cpu);
        assert!(matches!(trainer.train(&[], &[], None), Err(Error::Dataset(_))));
    }
}
