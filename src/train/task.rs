//! Classifier train and eval tasks.
//!
//! Both tasks rebuild the dataset (from cache when present) and the model
//! config the same way, so a model trained here can be evaluated with the
//! same command line and `--task eval`.

use std::path::PathBuf;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

use super::TrainingArgs;
use super::trainer::{EvalMetrics, Trainer, TrainerState, evaluate};
use crate::config::{BertConfig, DiffusionArgs, ModelType};
use crate::dataset::{DatasetArgs, Experiment, PreparedData, prepare};
use crate::diffusion::GaussianDiffusion;
use crate::midi::remi::RemiTokenizer;
use crate::model::classifier::TransformerNetClassifier;
use crate::model::weights::{load_into_varmap, load_tensor_into, read_tensors};
use crate::{Error, Result};

/// Name of the embedding tensor in diffusion checkpoints.
pub const LEARNED_EMBEDDING: &str = "word_embedding.weight";
/// Classifier variable receiving [`LEARNED_EMBEDDING`]. Never trained.
pub const CLASSIFIER_EMBEDDING: &str = "transformer_net.word_embedding.weight";
pub const CONFIG_FILE: &str = "bert-config.json";

/// Everything a train or eval run needs.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// Only `REMI` is supported.
    pub midi_tokenizer: String,
    pub dataset: DatasetArgs,
    pub experiment: Experiment,
    pub min_label_count: usize,
    pub model_type: ModelType,
    /// Width of the diffusion model's note embeddings.
    pub input_emb_dim: usize,
    /// Diffusion checkpoint; its directory holds `training_args.json`.
    pub path_learned: PathBuf,
    /// Classifier weights evaluated by the eval task.
    pub path_trained: PathBuf,
    /// Full classifier weights to start training from.
    pub from_state_path: Option<PathBuf>,
    /// Checkpoint directory to resume training from.
    pub from_check_point: Option<PathBuf>,
    /// Timestep used for evaluation; the clean index `T` by default.
    pub eval_timestep: Option<usize>,
    pub training: TrainingArgs,
}

impl TaskConfig {
    fn check_tokenizer(&self) -> Result<()> {
        if self.midi_tokenizer.eq_ignore_ascii_case("remi") {
            Ok(())
        } else {
            Err(Error::NotImplemented(format!("MIDI tokenizer '{}'", self.midi_tokenizer)))
        }
    }
}

/// Classifier config for the chosen preset and label map.
pub fn create_config(task: &TaskConfig, data: &PreparedData, diffusion: &DiffusionArgs) -> Result<BertConfig> {
    let mut config = BertConfig {
        vocab_size: RemiTokenizer.vocab_size(),
        diffusion_steps: diffusion.diffusion_steps,
        ..BertConfig::default()
    };
    task.model_type.apply(&mut config, task.input_emb_dim);
    data.labels.apply_to(&mut config);
    config.validate()?;

    std::fs::create_dir_all(&task.dataset.output_path)?;
    config.to_json_file(task.dataset.output_path.join(CONFIG_FILE))?;
    Ok(config)
}

fn load_data(task: &TaskConfig) -> Result<(PreparedData, DiffusionArgs)> {
    task.check_tokenizer()?;
    let data = prepare(&task.dataset, task.experiment, task.min_label_count)?;
    let diffusion = DiffusionArgs::for_checkpoint(&task.path_learned)?;
    Ok((data, diffusion))
}

/// Train a classifier on the noised embeddings of the diffusion model at
/// `path_learned`.
pub fn train(task: &TaskConfig, device: &Device) -> Result<TrainerState> {
    let (data, diffusion_args) = load_data(task)?;
    let config = create_config(task, &data, &diffusion_args)?;
    let diffusion = GaussianDiffusion::from_args(&diffusion_args)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = TransformerNetClassifier::new(&config, task.input_emb_dim, Some(diffusion), vb)?;

    load_tensor_into(&varmap, &task.path_learned, LEARNED_EMBEDDING, CLASSIFIER_EMBEDDING)?;
    match &task.from_state_path {
        Some(path) => {
            let loaded = load_into_varmap(&varmap, &read_tensors(path, device)?, true)?;
            tracing::info!(path = %path.display(), loaded, "loaded initial state");
            // The learned embedding always comes from the diffusion model.
            load_tensor_into(&varmap, &task.path_learned, LEARNED_EMBEDDING, CLASSIFIER_EMBEDDING)?;
        }
        None => tracing::info!("training from scratch"),
    }

    tracing::info!(
        train = data.train.len(),
        valid = data.valid.len(),
        num_labels = data.num_labels(),
        "datasets ready"
    );
    let trainer = Trainer::new(&model, &varmap, task.training.clone(), device).freeze([CLASSIFIER_EMBEDDING]);
    trainer.train(&data.train, &data.valid, task.from_check_point.as_deref())
}

/// Evaluate the classifier at `path_trained` on the validation split with
/// a constant timestep and no added noise.
pub fn eval(task: &TaskConfig, device: &Device) -> Result<EvalMetrics> {
    tracing::info!("starting evaluation");
    let (data, diffusion_args) = load_data(task)?;
    let config = create_config(task, &data, &diffusion_args)?;

    let timestep = task.eval_timestep.unwrap_or(config.diffusion_steps);
    if timestep > config.diffusion_steps {
        return Err(Error::Config(format!(
            "eval timestep {timestep} outside 0..={}",
            config.diffusion_steps
        )));
    }

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = TransformerNetClassifier::new(&config, task.input_emb_dim, None, vb)?;
    load_into_varmap(&varmap, &read_tensors(&task.path_trained, device)?, true)?;

    let metrics = evaluate(
        &model,
        &data.valid,
        task.training.per_device_eval_batch_size,
        Some(timestep as u32),
        device,
    )?;
    tracing::info!(
        loss = metrics.loss,
        accuracy = metrics.accuracy,
        samples = metrics.samples,
        timestep,
        "evaluation finished"
    );
    Ok(metrics)
}
