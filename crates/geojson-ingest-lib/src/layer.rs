//! Layer registry and per-layer attribute schema
//!
//! Layers are created on first use and numbered densely in creation order. Entries
//! are updated concurrently by all segments; each update holds the entry exclusively.

use crate::attribute::{AttributeType, AttributeValue, leading_float};
use crate::geometry::FeatureType;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Maximum number of distinct sample values kept per attribute key
pub const MAX_SAMPLE_VALUES: usize = 1000;

/// What has been observed for one attribute key of a layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeStats {
    /// Every value type seen for the key
    pub types: BTreeSet<AttributeType>,
    /// Up to [`MAX_SAMPLE_VALUES`] distinct values, in sorted order
    pub sample_values: BTreeSet<String>,
    /// Numeric range over number-typed values
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl AttributeStats {
    pub fn record(&mut self, value: &AttributeValue) {
        self.types.insert(value.attr_type);

        if self.sample_values.len() < MAX_SAMPLE_VALUES {
            self.sample_values.insert(value.text.clone());
        }

        if value.attr_type == AttributeType::Number {
            let v = leading_float(&value.text);
            self.min = Some(self.min.map_or(v, |m| m.min(v)));
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
        }
    }

    /// Whether the key was seen with more than one type
    pub fn is_ambiguous(&self) -> bool {
        self.types.len() > 1
    }
}

/// One output layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerEntry {
    pub name: String,
    pub id: usize,
    pub points: u64,
    pub lines: u64,
    pub polygons: u64,
    /// Attribute schema by key
    pub file_keys: BTreeMap<String, AttributeStats>,
}

impl LayerEntry {
    fn new(name: String, id: usize) -> Self {
        Self {
            name,
            id,
            points: 0,
            lines: 0,
            polygons: 0,
            file_keys: BTreeMap::new(),
        }
    }

    pub fn feature_count(&self) -> u64 {
        self.points + self.lines + self.polygons
    }
}

/// Registry of every layer of a run
#[derive(Debug, Default)]
pub struct LayerMap {
    layers: DashMap<String, LayerEntry>,
    next_id: AtomicUsize,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl LayerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the named layer, creating it if needed
    pub fn resolve(&self, name: &str) -> usize {
        if let Some(entry) = self.layers.get(name) {
            return entry.id;
        }

        self.layers
            .entry(name.to_string())
            .or_insert_with(|| {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Created layer {name:?} with id {id}");
                LayerEntry::new(name.to_string(), id)
            })
            .id
    }

    /// Count one feature of the given type in the named layer
    pub fn count_feature(&self, name: &str, feature_type: FeatureType) {
        self.resolve(name);
        if let Some(mut entry) = self.layers.get_mut(name) {
            match feature_type {
                FeatureType::Point => entry.points += 1,
                FeatureType::Line => entry.lines += 1,
                FeatureType::Polygon => entry.polygons += 1,
            }
        }
    }

    /// Merge an observed attribute value into the layer's schema
    pub fn record_attribute_type(&self, name: &str, key: &str, value: &AttributeValue) {
        self.resolve(name);
        if let Some(mut entry) = self.layers.get_mut(name) {
            entry.file_keys.entry(key.to_string()).or_default().record(value);
        }
    }

    pub fn get(&self, name: &str) -> Option<LayerEntry> {
        self.layers.get(name).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// All layers ordered by id
    pub fn snapshot(&self) -> Vec<LayerEntry> {
        let mut layers: Vec<LayerEntry> = self.layers.iter().map(|entry| entry.clone()).collect();
        layers.sort_by_key(|layer| layer.id);
        layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_dense_in_creation_order() {
        let layers = LayerMap::new();
        assert_eq!(layers.resolve("roads"), 0);
        assert_eq!(layers.resolve("water"), 1);
        assert_eq!(layers.resolve("roads"), 0);
        assert_eq!(layers.len(), 2);

        let names: Vec<String> = layers.snapshot().into_iter().map(|l| l.name).collect();
        assert_eq!(names, vec!["roads", "water"]);
    }

    #[test]
    fn test_feature_counts() {
        let layers = LayerMap::new();
        layers.count_feature("a", FeatureType::Point);
        layers.count_feature("a", FeatureType::Point);
        layers.count_feature("a", FeatureType::Polygon);

        let a = layers.get("a").unwrap();
        assert_eq!((a.points, a.lines, a.polygons), (2, 0, 1));
        assert_eq!(a.feature_count(), 3);
    }

    #[test]
    fn test_attribute_schema() {
        let layers = LayerMap::new();
        layers.record_attribute_type("a", "pop", &AttributeValue::new(AttributeType::Number, "10"));
        layers.record_attribute_type("a", "pop", &AttributeValue::new(AttributeType::Number, "-2.5"));
        layers.record_attribute_type("a", "name", &AttributeValue::new(AttributeType::String, "x"));

        let a = layers.get("a").unwrap();
        let pop = &a.file_keys["pop"];
        assert_eq!(pop.min, Some(-2.5));
        assert_eq!(pop.max, Some(10.0));
        assert!(!pop.is_ambiguous());
        assert_eq!(pop.sample_values.len(), 2);

        layers.record_attribute_type("a", "pop", &AttributeValue::new(AttributeType::String, "many"));
        assert!(layers.get("a").unwrap().file_keys["pop"].is_ambiguous());
    }

    #[test]
    fn test_sample_values_are_capped() {
        let mut stats = AttributeStats::default();
        for i in 0..(MAX_SAMPLE_VALUES + 50) {
            stats.record(&AttributeValue::new(AttributeType::Number, i.to_string()));
        }
        assert_eq!(stats.sample_values.len(), MAX_SAMPLE_VALUES);
        assert_eq!(stats.max, Some((MAX_SAMPLE_VALUES + 49) as f64));
    }

    #[test]
    fn test_concurrent_creation_gives_unique_ids() {
        let layers = LayerMap::new();
        std::thread::scope(|s| {
            for t in 0..4 {
                let layers = &layers;
                s.spawn(move || {
                    for i in 0..50 {
                        layers.resolve(&format!("layer{}", (i + t * 7) % 60));
                    }
                });
            }
        });

        let mut ids: Vec<usize> = layers.snapshot().iter().map(|l| l.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..layers.len()).collect::<Vec<_>>());
    }
}
