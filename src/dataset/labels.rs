//! Raw label ↔ class id mapping.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::BertConfig;
use crate::{Error, Result};

/// Label of the catch-all class in frequency-thresholded maps.
pub const OTHER_LABEL: &str = "-1";

/// Bijection between raw labels and class ids `0..num_labels`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap {
    label2id: BTreeMap<String, u32>,
    id2label: BTreeMap<u32, String>,
    /// Class assigned to labels outside the map.
    fallback: Option<u32>,
}

impl LabelMap {
    /// Classes for labels seen at least `min_count` times, plus class 0
    /// ([`OTHER_LABEL`]) for everything else.
    pub fn frequent<'a>(labels: impl IntoIterator<Item = &'a str>, min_count: usize) -> Self {
        let large = ordered(
            label_counts(labels)
                .into_iter()
                .filter(|(label, n)| *n >= min_count && label != OTHER_LABEL)
                .map(|(label, _)| label),
        );
        let mut map = Self {
            label2id: BTreeMap::new(),
            id2label: BTreeMap::new(),
            fallback: Some(0),
        };
        map.insert(OTHER_LABEL.to_string());
        for label in large {
            map.insert(label);
        }
        map
    }

    /// One class per distinct label.
    pub fn exhaustive<'a>(labels: impl IntoIterator<Item = &'a str>) -> Self {
        let distinct: BTreeSet<String> = labels.into_iter().map(str::to_string).collect();
        let mut map = Self {
            label2id: BTreeMap::new(),
            id2label: BTreeMap::new(),
            fallback: None,
        };
        for label in ordered(distinct) {
            map.insert(label);
        }
        map
    }

    fn insert(&mut self, label: String) {
        let id = self.id2label.len() as u32;
        self.label2id.insert(label.clone(), id);
        self.id2label.insert(id, label);
    }

    pub fn num_labels(&self) -> usize {
        self.id2label.len()
    }

    pub fn encode(&self, label: &str) -> Result<u32> {
        self.label2id
            .get(label)
            .copied()
            .or(self.fallback)
            .ok_or_else(|| Error::Dataset(format!("label '{label}' has no class")))
    }

    pub fn decode(&self, id: u32) -> Option<&str> {
        self.id2label.get(&id).map(String::as_str)
    }

    /// Store the mapping in a model config.
    pub fn apply_to(&self, config: &mut BertConfig) {
        config.num_labels = self.num_labels();
        config.label2id = self.label2id.clone();
        config.id2label = self
            .id2label
            .iter()
            .map(|(id, label)| (id.to_string(), label.clone()))
            .collect();
    }
}

/// Occurrences per label.
pub fn label_counts<'a>(labels: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for label in labels {
        *counts.entry(label.to_string()).or_insert(0) += 1;
    }
    counts
}

/// Numeric labels in numeric order, then the rest alphabetically.
fn ordered(labels: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut labels: Vec<String> = labels.into_iter().collect();
    labels.sort_by_key(|l| {
        let numeric = l.parse::<i64>().ok();
        (numeric.is_none(), numeric, l.clone())
    });
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repeat(label: &str, n: usize) -> Vec<String> {
        vec![label.to_string(); n]
    }

    #[test]
    fn frequent_keeps_large_labels_and_a_catch_all() {
        let labels: Vec<String> = [repeat("40", 3), repeat("0", 5), repeat("73", 1), repeat("1", 2)].concat();
        let map = LabelMap::frequent(labels.iter().map(String::as_str), 2);
        assert_eq!(map.num_labels(), 4);
        assert_eq!(map.encode("-1").unwrap(), 0);
        assert_eq!(map.encode("0").unwrap(), 1);
        assert_eq!(map.encode("1").unwrap(), 2);
        assert_eq!(map.encode("40").unwrap(), 3);
        // Rare and unseen labels fall into class 0.
        assert_eq!(map.encode("73").unwrap(), 0);
        assert_eq!(map.encode("12").unwrap(), 0);
    }

    #[test]
    fn mapping_is_a_bijection() {
        let labels: Vec<String> = [repeat("sonata", 3), repeat("waltz", 1), repeat("unknown", 2)].concat();
        let map = LabelMap::exhaustive(labels.iter().map(String::as_str));
        let ids: BTreeSet<u32> = ["sonata", "waltz", "unknown"]
            .iter()
            .map(|l| map.encode(l).unwrap())
            .collect();
        assert_eq!(ids, (0..map.num_labels() as u32).collect::<BTreeSet<u32>>());
        for id in 0..map.num_labels() as u32 {
            assert_eq!(map.encode(map.decode(id).unwrap()).unwrap(), id);
        }
    }

    #[test]
    fn exhaustive_rejects_unseen_labels() {
        let map = LabelMap::exhaustive(["polka"]);
        assert!(matches!(map.encode("rondo"), Err(Error::Dataset(_))));
    }

    #[test]
    fn apply_to_config_uses_string_keys() {
        let map = LabelMap::exhaustive(["etude", "polka"]);
        let mut config = BertConfig::default();
        map.apply_to(&mut config);
        assert_eq!(config.num_labels, 2);
        assert_eq!(config.id2label["1"], "polka");
        assert_eq!(config.label2id["etude"], 0);
    }
}
