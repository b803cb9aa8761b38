//! Music classifier CLI: train or evaluate a BERT classifier on the noised
//! note embeddings of a symbolic-music diffusion model.
//!
//! # Output
//!
//! `--task train` writes `bert-config.json`, `checkpoint-<step>/` directories
//! and the final `model.safetensors` under `--output-path`.
//!
//! `--task eval` prints the mean validation loss and accuracy to stdout:
//!
//! ```text
//! loss: 0.8132
//! acc: 0.7021
//! ```

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use symbolic_diffusion_rs::{
    config::ModelType,
    dataset::{DatasetArgs, Experiment},
    midi::bar_block::{DEFAULT_SKIP_PADDINGS_RATIO, PaddingMode},
    train::{
        TrainingArgs,
        task::{self, TaskConfig},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Task {
    Train,
    Eval,
}

#[derive(Parser, Debug)]
#[command(
    name = "music-classifier",
    about = "Diffusion-conditioned symbolic music classifier",
    long_about = "Train or evaluate a BERT classifier on REMI bar blocks.\n\
                  Training noises the note embeddings of a diffusion checkpoint at random\n\
                  timesteps; evaluation uses a fixed timestep and no noise."
)]
struct Args {
    /// MIDI tokenization scheme. Only REMI is supported.
    #[arg(long, default_value = "REMI")]
    midi_tokenizer: String,

    /// Blocks hold image_size² tokens.
    #[arg(long, default_value_t = 16)]
    image_size: usize,

    /// Note embedding width of the diffusion model.
    #[arg(long, default_value_t = 32)]
    input_emb_dim: usize,

    /// Directory with train/ and valid/ MIDI subdirectories.
    #[arg(long, default_value = "../datasets/midi/midi_files")]
    data_path: PathBuf,

    /// Directory for dataset caches, configs and checkpoints.
    #[arg(long, default_value = "./classifier_models/bert/")]
    output_path: PathBuf,

    #[arg(long, default_value = "bar_block")]
    padding_mode: String,

    #[arg(long, default_value_t = 30)]
    epoches: usize,

    #[arg(long, default_value_t = 1e-4)]
    learning_rate: f64,

    #[arg(long, default_value_t = 64)]
    batch_size: usize,

    #[arg(long, value_enum, default_value_t = Task::Train)]
    task: Task,

    /// Classifier weights to initialise training from.
    #[arg(long)]
    from_state_path: Option<PathBuf>,

    /// Checkpoint directory to resume training from.
    #[arg(long)]
    from_check_point: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = ModelType::Normal)]
    model_type: ModelType,

    #[arg(long, value_enum, default_value_t = Experiment::Instrument)]
    experiment: Experiment,

    /// Classifier weights evaluated by --task eval.
    #[arg(long, default_value = "./classifier_models/bert/checkpoint-5000/model.safetensors")]
    path_trained: PathBuf,

    /// Diffusion checkpoint (.safetensors or .pt). Its directory must hold
    /// training_args.json.
    #[arg(
        long,
        default_value = "./diffusion_models/diff_midi_midi_files_REMI_bar_block_rand32_transformer_lr0.0001_0.0_2000_sqrt_Lsimple_h128_s2_d0.1_sd102_xstart_midi/model200000.pt"
    )]
    path_learned: PathBuf,

    #[arg(long, default_value_t = 102)]
    seed: u64,

    #[arg(long, default_value_t = 1000)]
    logging_steps: usize,

    #[arg(long, default_value_t = 5000)]
    save_steps: usize,

    /// Instrument labels with fewer training blocks fall into the catch-all
    /// class.
    #[arg(long, default_value_t = 100)]
    min_label_count: usize,

    /// Timestep used for evaluation. Defaults to the clean index.
    #[arg(long)]
    eval_timestep: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if args.image_size == 0 || args.batch_size == 0 {
        anyhow::bail!("image size and batch size must be positive");
    }
    let padding_mode: PaddingMode = args
        .padding_mode
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid --padding-mode: {e}"))?;

    let device = candle_core::Device::cuda_if_available(0)?;
    tracing::info!("Using device: {:?}", device);
    if let Err(e) = device.set_seed(args.seed) {
        tracing::debug!("device RNG not seeded: {e}");
    }

    let training = TrainingArgs {
        num_train_epochs: args.epoches,
        learning_rate: args.learning_rate,
        per_device_train_batch_size: args.batch_size,
        per_device_eval_batch_size: args.batch_size,
        logging_steps: args.logging_steps,
        save_steps: args.save_steps,
        seed: args.seed,
        ..TrainingArgs::new(&args.output_path)
    };
    let config = TaskConfig {
        midi_tokenizer: args.midi_tokenizer,
        dataset: DatasetArgs {
            data_path: args.data_path,
            output_path: args.output_path,
            image_size: args.image_size,
            padding_mode,
            skip_paddings_ratio: DEFAULT_SKIP_PADDINGS_RATIO,
        },
        experiment: args.experiment,
        min_label_count: args.min_label_count,
        model_type: args.model_type,
        input_emb_dim: args.input_emb_dim,
        path_learned: args.path_learned,
        path_trained: args.path_trained,
        from_state_path: args.from_state_path,
        from_check_point: args.from_check_point,
        eval_timestep: args.eval_timestep,
        training,
    };

    match args.task {
        Task::Train => {
            let state = task::train(&config, &device).map_err(|e| anyhow::anyhow!("training failed: {e}"))?;
            tracing::info!(steps = state.global_step, "done");
        }
        Task::Eval => {
            let metrics = task::eval(&config, &device).map_err(|e| anyhow::anyhow!("evaluation failed: {e}"))?;
            println!("loss: {}", metrics.loss);
            println!("acc: {}", metrics.accuracy);
        }
    }

    Ok(())
}
