//! Model and diffusion configuration.
//!
//! [`BertConfig`] uses the field names of the JSON configs written next to
//! BERT checkpoints, so a `bert-config.json` produced here can be read back
//! (and vice versa). Defaults match `bert-base-uncased`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Result;

/// How token positions enter the self-attention scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionEmbeddingType {
    /// Learned absolute position embeddings added to the input only.
    #[default]
    Absolute,
    /// Learned relative-distance embeddings applied to queries.
    RelativeKey,
    /// Learned relative-distance embeddings applied to queries and keys.
    RelativeKeyQuery,
}

/// Loss family used by the classification head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemType {
    Regression,
    SingleLabelClassification,
    MultiLabelClassification,
}

/// BERT-style encoder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BertConfig {
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "default_hidden_dropout_prob")]
    pub hidden_dropout_prob: f64,
    #[serde(default = "default_attention_probs_dropout_prob")]
    pub attention_probs_dropout_prob: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub position_embedding_type: PositionEmbeddingType,

    /// Causal self-attention.
    #[serde(default)]
    pub is_decoder: bool,
    /// Adds a cross-attention block to every layer.
    #[serde(default)]
    pub add_cross_attention: bool,
    /// Collect the output of every layer, not just the last one.
    #[serde(default)]
    pub output_hidden_states: bool,

    #[serde(default)]
    pub classifier_dropout: Option<f64>,
    #[serde(default = "default_num_labels")]
    pub num_labels: usize,
    #[serde(default)]
    pub problem_type: Option<ProblemType>,
    #[serde(default)]
    pub id2label: BTreeMap<String, String>,
    #[serde(default)]
    pub label2id: BTreeMap<String, u32>,

    /// Number of diffusion steps the timestep embedding table covers.
    /// The table holds one extra row for uncorrupted inputs.
    #[serde(default = "default_diffusion_steps")]
    pub diffusion_steps: usize,
}

impl Default for BertConfig {
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            hidden_size: default_hidden_size(),
            num_hidden_layers: default_num_hidden_layers(),
            num_attention_heads: default_num_attention_heads(),
            intermediate_size: default_intermediate_size(),
            hidden_dropout_prob: default_hidden_dropout_prob(),
            attention_probs_dropout_prob: default_attention_probs_dropout_prob(),
            max_position_embeddings: default_max_position_embeddings(),
            layer_norm_eps: default_layer_norm_eps(),
            position_embedding_type: PositionEmbeddingType::Absolute,
            is_decoder: false,
            add_cross_attention: false,
            output_hidden_states: false,
            classifier_dropout: None,
            num_labels: default_num_labels(),
            problem_type: None,
            id2label: BTreeMap::new(),
            label2id: BTreeMap::new(),
            diffusion_steps: default_diffusion_steps(),
        }
    }
}

impl BertConfig {
    /// Dimension per attention head.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Dropout applied before the classification layer.
    pub fn classifier_dropout_prob(&self) -> f64 {
        self.classifier_dropout.unwrap_or(self.hidden_dropout_prob)
    }

    /// Check the invariants the layers rely on.
    pub fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(crate::Error::Config(format!(
                "hidden_size {} is not a multiple of num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_labels == 0 {
            return Err(crate::Error::Config("num_labels must be at least 1".into()));
        }
        Ok(())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

/// Encoder size preset selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    /// 6 layers, hidden size 256.
    Normal,
    /// 6 layers, hidden size equal to the diffusion embedding width.
    Simplified,
}

impl ModelType {
    /// Shrink a base config to the preset.
    pub fn apply(self, config: &mut BertConfig, input_emb_dim: usize) {
        config.num_hidden_layers = 6;
        config.hidden_size = match self {
            ModelType::Normal => 256,
            ModelType::Simplified => input_emb_dim,
        };
        config.num_attention_heads = 8;
        config.intermediate_size = config.hidden_size * 4;
        config.max_position_embeddings = 1024;
        config.position_embedding_type = PositionEmbeddingType::RelativeKey;
    }
}

/// Arguments of the diffusion training run, read from the
/// `training_args.json` stored next to its checkpoint.
///
/// Unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffusionArgs {
    #[serde(default = "default_args_diffusion_steps")]
    pub diffusion_steps: usize,
    #[serde(default = "default_noise_schedule")]
    pub noise_schedule: String,
}

impl Default for DiffusionArgs {
    fn default() -> Self {
        Self {
            diffusion_steps: default_args_diffusion_steps(),
            noise_schedule: default_noise_schedule(),
        }
    }
}

impl DiffusionArgs {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Read the `training_args.json` that sits in the same directory as
    /// `checkpoint`.
    pub fn for_checkpoint(checkpoint: impl AsRef<Path>) -> Result<Self> {
        let dir = checkpoint.as_ref().parent().unwrap_or_else(|| Path::new(""));
        Self::from_json_file(dir.join("training_args.json"))
    }
}

fn default_vocab_size() -> usize {
    30522
}
fn default_hidden_size() -> usize {
    768
}
fn default_num_hidden_layers() -> usize {
    12
}
fn default_num_attention_heads() -> usize {
    12
}
fn default_intermediate_size() -> usize {
    3072
}
fn default_hidden_dropout_prob() -> f64 {
    0.1
}
fn default_attention_probs_dropout_prob() -> f64 {
    0.1
}
fn default_max_position_embeddings() -> usize {
    512
}
fn default_layer_norm_eps() -> f64 {
    1e-12
}
fn default_num_labels() -> usize {
    2
}
fn default_diffusion_steps() -> usize {
    2000
}
fn default_args_diffusion_steps() -> usize {
    1000
}
fn default_noise_schedule() -> String {
    "linear".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_bert_base() {
        let config = BertConfig::default();
        assert_eq!(config.hidden_size, 768);
        assert_eq!(config.num_hidden_layers, 12);
        assert_eq!(config.head_dim(), 64);
        assert_eq!(config.position_embedding_type, PositionEmbeddingType::Absolute);
        config.validate().unwrap();
    }

    #[test]
    fn presets_shrink_the_encoder() {
        let mut normal = BertConfig::default();
        ModelType::Normal.apply(&mut normal, 32);
        assert_eq!(normal.hidden_size, 256);
        assert_eq!(normal.intermediate_size, 1024);
        assert_eq!(normal.max_position_embeddings, 1024);
        assert_eq!(normal.position_embedding_type, PositionEmbeddingType::RelativeKey);

        let mut simplified = BertConfig::default();
        ModelType::Simplified.apply(&mut simplified, 32);
        assert_eq!(simplified.hidden_size, 32);
        assert_eq!(simplified.head_dim(), 4);
    }

    #[test]
    fn validate_rejects_uneven_heads() {
        let config = BertConfig {
            hidden_size: 30,
            num_attention_heads: 8,
            ..BertConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn deserialize_hf_style_json() {
        let json = r#"{
            "hidden_size": 256,
            "num_attention_heads": 8,
            "position_embedding_type": "relative_key",
            "id2label": {"0": "-1", "1": "0"},
            "label2id": {"-1": 0, "0": 1},
            "architectures": ["BertForMaskedLM"]
        }"#;
        let config: BertConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.hidden_size, 256);
        assert_eq!(config.position_embedding_type, PositionEmbeddingType::RelativeKey);
        assert_eq!(config.label2id["0"], 1);
        // Unspecified fields use defaults.
        assert_eq!(config.num_hidden_layers, 12);
        assert_eq!(config.diffusion_steps, 2000);
    }

    #[test]
    fn json_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bert-config.json");
        let mut config = BertConfig {
            num_labels: 3,
            problem_type: Some(ProblemType::SingleLabelClassification),
            ..BertConfig::default()
        };
        ModelType::Normal.apply(&mut config, 32);
        config.to_json_file(&path).unwrap();
        let loaded = BertConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn diffusion_args_ignore_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("training_args.json"),
            r#"{"diffusion_steps": 2000, "noise_schedule": "sqrt", "lr": 0.0001, "in_channel": 32}"#,
        )
        .unwrap();
        let args = DiffusionArgs::for_checkpoint(dir.path().join("model200000.pt")).unwrap();
        assert_eq!(args.diffusion_steps, 2000);
        assert_eq!(args.noise_schedule, "sqrt");
    }
}
