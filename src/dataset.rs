//! Labelled bar-block datasets built from MIDI directories.
//!
//! ```text
//! <data_path>/<split>/*.mid ──REMI──▶ bar blocks ──▶ (tokens, raw label)
//!                                                   │
//!                 <output_path>/<split>_data.safetensors  (+ .labels.json)
//! ```
//!
//! The token matrix is cached as a `tokens` tensor `[N, block_size]` (u32)
//! and the raw labels as a JSON list next to it, so a second run skips MIDI
//! parsing entirely.

pub mod labels;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::midi::MidiFile;
use crate::midi::bar_block::{PaddingMode, bar_blocks};
use crate::midi::remi::RemiTokenizer;
use crate::{Error, Result};
use labels::{LabelMap, label_counts};

/// Composition types recognised in file names, in match priority order.
pub const ALLOWED_TYPES: [&str; 15] = [
    "polka",
    "sonatina",
    "etude",
    "rondo",
    "ballade",
    "fantasia",
    "christian",
    "variations",
    "prelude",
    "valse",
    "waltz",
    "morceaux",
    "mazurka",
    "sonata",
    "romance",
];

/// Label of files whose name matches no composition type.
pub const UNKNOWN_TYPE: &str = "unknown";

/// What a sample is labelled with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum Experiment {
    /// Program number of the first instrument.
    Instrument,
    /// Composition type parsed from the file name.
    CompositionType,
}

impl Experiment {
    fn cache_stem(self, split: &str) -> String {
        match self {
            Experiment::Instrument => format!("{split}_data"),
            Experiment::CompositionType => format!("{split}_giant_data"),
        }
    }
}

/// Where and how to build datasets.
#[derive(Debug, Clone)]
pub struct DatasetArgs {
    pub data_path: PathBuf,
    pub output_path: PathBuf,
    /// Blocks hold `image_size²` tokens.
    pub image_size: usize,
    pub padding_mode: PaddingMode,
    pub skip_paddings_ratio: f64,
}

impl DatasetArgs {
    pub fn block_size(&self) -> usize {
        self.image_size * self.image_size
    }
}

/// Token blocks with their raw (string) labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawSplit {
    pub tokens: Vec<Vec<u32>>,
    pub labels: Vec<String>,
}

impl RawSplit {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// One model input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub input_ids: Vec<u32>,
    pub label: u32,
}

/// Train/valid samples sharing one label map.
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub train: Vec<Sample>,
    pub valid: Vec<Sample>,
    pub labels: LabelMap,
}

impl PreparedData {
    pub fn num_labels(&self) -> usize {
        self.labels.num_labels()
    }
}

/// Composition type of a file, from its name.
pub fn composition_type(file_name: &str) -> &'static str {
    let lowered = file_name.to_lowercase();
    ALLOWED_TYPES
        .iter()
        .find(|t| lowered.contains(*t))
        .copied()
        .unwrap_or(UNKNOWN_TYPE)
}

/// Load a split from the cache, or build and cache it.
pub fn build_split(args: &DatasetArgs, experiment: Experiment, split: &str) -> Result<RawSplit> {
    let stem = experiment.cache_stem(split);
    let cache = args.output_path.join(format!("{stem}.safetensors"));
    if cache.exists() {
        tracing::info!(path = %cache.display(), "loading cached dataset");
        return load_cache(&cache);
    }

    let raw = tokenize_directory(args, experiment, &args.data_path.join(split))?;
    std::fs::create_dir_all(&args.output_path)?;
    save_cache(&cache, &raw, args.block_size())?;
    tracing::info!(
        split,
        blocks = raw.len(),
        counts = ?label_counts(raw.labels.iter().map(String::as_str)),
        "built dataset"
    );
    Ok(raw)
}

fn tokenize_directory(args: &DatasetArgs, experiment: Experiment, dir: &Path) -> Result<RawSplit> {
    let tokenizer = RemiTokenizer;

    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "mid"))
        .collect();
    files.sort();

    let mut raw = RawSplit::default();
    for path in files {
        let midi = match MidiFile::read(&path) {
            Ok(midi) => midi,
            Err(Error::Midi(e)) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable MIDI file");
                continue;
            }
            Err(e) => return Err(e),
        };
        let label = match experiment {
            Experiment::Instrument => match midi.first_program() {
                Some(program) => program.to_string(),
                None => {
                    tracing::warn!(path = %path.display(), "skipping MIDI file without notes");
                    continue;
                }
            },
            Experiment::CompositionType => {
                let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
                composition_type(&name).to_string()
            }
        };
        let tokens = tokenizer.midi_to_tokens(&midi);
        let blocks = match args.padding_mode {
            PaddingMode::BarBlock => bar_blocks(&tokens, args.block_size(), args.skip_paddings_ratio),
        };
        tracing::debug!(path = %path.display(), tokens = tokens.len(), blocks = blocks.len(), %label, "tokenized");
        for block in blocks {
            raw.tokens.push(block);
            raw.labels.push(label.clone());
        }
    }
    Ok(raw)
}

fn labels_path(cache: &Path) -> PathBuf {
    cache.with_extension("labels.json")
}

fn save_cache(path: &Path, raw: &RawSplit, block_size: usize) -> Result<()> {
    let flat: Vec<u32> = raw.tokens.iter().flatten().copied().collect();
    let tokens = Tensor::from_vec(flat, (raw.len(), block_size), &Device::Cpu)?;
    let tensors = HashMap::from([("tokens".to_string(), tokens)]);
    candle_core::safetensors::save(&tensors, path)?;
    std::fs::write(labels_path(path), serde_json::to_string(&raw.labels)?)?;
    Ok(())
}

fn load_cache(path: &Path) -> Result<RawSplit> {
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
    let tokens = tensors
        .get("tokens")
        .ok_or_else(|| Error::Dataset(format!("{} has no 'tokens' tensor", path.display())))?
        .to_vec2::<u32>()?;
    let labels: Vec<String> = serde_json::from_str(&std::fs::read_to_string(labels_path(path))?)?;
    if labels.len() != tokens.len() {
        return Err(Error::Dataset(format!(
            "{}: {} token rows but {} labels",
            path.display(),
            tokens.len(),
            labels.len()
        )));
    }
    Ok(RawSplit { tokens, labels })
}

/// Build both splits and remap their labels to class ids.
///
/// The instrument experiment keeps programs with at least `min_label_count`
/// training blocks and folds the rest into class 0. The composition-type
/// experiment keeps every training label.
pub fn prepare(args: &DatasetArgs, experiment: Experiment, min_label_count: usize) -> Result<PreparedData> {
    let train = build_split(args, experiment, "train")?;
    let valid = build_split(args, experiment, "valid")?;

    let train_labels = train.labels.iter().map(String::as_str);
    let labels = match experiment {
        Experiment::Instrument => LabelMap::frequent(train_labels, min_label_count),
        Experiment::CompositionType => LabelMap::exhaustive(train_labels),
    };
    tracing::info!(num_labels = labels.num_labels(), "label map built");

    Ok(PreparedData {
        train: encode(train, &labels)?,
        valid: encode(valid, &labels)?,
        labels,
    })
}

fn encode(raw: RawSplit, labels: &LabelMap) -> Result<Vec<Sample>> {
    raw.tokens
        .into_iter()
        .zip(raw.labels)
        .map(|(input_ids, label)| {
            Ok(Sample {
                input_ids,
                label: labels.encode(&label)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::test_util::{single_track, smf};

    /// A file of `bars` 4/4 bars with a quarter note on every beat.
    fn write_midi(dir: &Path, name: &str, program: u8, bars: u32) {
        let notes: Vec<(u32, u32, u8)> = (0..bars * 4).map(|i| (i * 96, 96, 60 + (i % 12) as u8)).collect();
        std::fs::write(dir.join(name), smf(96, &[single_track(0, program, &notes)])).unwrap();
    }

    fn args(root: &Path) -> DatasetArgs {
        DatasetArgs {
            data_path: root.join("midi"),
            output_path: root.join("out"),
            image_size: 4,
            padding_mode: PaddingMode::BarBlock,
            skip_paddings_ratio: 0.2,
        }
    }

    fn populate(root: &Path) {
        for split in ["train", "valid"] {
            let dir = root.join("midi").join(split);
            std::fs::create_dir_all(&dir).unwrap();
            write_midi(&dir, "Chopin_Mazurka_1.mid", 0, 4);
            write_midi(&dir, "bach_prelude.mid", 0, 2);
            write_midi(&dir, "folk_tune.mid", 40, 1);
            std::fs::write(dir.join("notes.txt"), "ignored").unwrap();
        }
    }

    #[test]
    fn composition_type_matches_first_allowed_type() {
        assert_eq!(composition_type("Chopin_MAZURKA_op7.mid"), "mazurka");
        // "sonatina" is checked before "sonata".
        assert_eq!(composition_type("clementi_sonatina_1.mid"), "sonatina");
        assert_eq!(composition_type("free_improvisation.mid"), UNKNOWN_TYPE);
    }

    #[test]
    fn builds_and_caches_instrument_split() {
        let root = tempfile::tempdir().unwrap();
        populate(root.path());
        let args = args(root.path());

        let raw = build_split(&args, Experiment::Instrument, "train").unwrap();
        // One bar = Bar + Position/Pitch/Velocity/Duration × 4 = 17 tokens,
        // longer than a 16-token block, so every bar becomes its own block.
        assert_eq!(raw.len(), 4 + 2 + 1);
        assert!(raw.tokens.iter().all(|t| t.len() == 16));
        assert_eq!(raw.labels.iter().filter(|l| *l == "40").count(), 1);

        let cache = root.path().join("out/train_data.safetensors");
        assert!(cache.exists());
        // Second build comes from the cache even with the sources gone.
        std::fs::remove_dir_all(root.path().join("midi/train")).unwrap();
        let cached = build_split(&args, Experiment::Instrument, "train").unwrap();
        assert_eq!(cached, raw);
    }

    #[test]
    fn prepare_remaps_labels_per_experiment() {
        let root = tempfile::tempdir().unwrap();
        populate(root.path());
        let args = args(root.path());

        let instrument = prepare(&args, Experiment::Instrument, 3).unwrap();
        // Program 0 has 6 blocks, program 40 only one.
        assert_eq!(instrument.num_labels(), 2);
        assert!(instrument.train.iter().any(|s| s.label == 0));
        assert!(instrument.train.iter().all(|s| s.label < 2));

        let types = prepare(&args, Experiment::CompositionType, 3).unwrap();
        assert_eq!(types.num_labels(), 3);
        assert_eq!(types.labels.decode(0), Some("mazurka"));
        assert!(root.path().join("out/valid_giant_data.safetensors").exists());
    }
}
