//! In-memory map from sample key to parsed sample.

use crate::types::{Partition, Sample, SampleKey};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Store shared between ingestion and the generators. All access happens on the
/// training thread.
pub type SharedStore = Rc<RefCell<RecordStore>>;

#[derive(Debug, Default)]
pub struct RecordStore {
    samples: HashMap<SampleKey, Sample>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedStore {
        Rc::new(RefCell::new(self))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn contains(&self, key: &SampleKey) -> bool {
        self.samples.contains_key(key)
    }

    /// Inserts `sample` unless its key is already present. Returns whether it was added.
    pub fn insert(&mut self, sample: Sample) -> bool {
        if self.samples.contains_key(&sample.key) {
            return false;
        }
        self.samples.insert(sample.key.clone(), sample);
        true
    }

    pub fn remove(&mut self, key: &SampleKey) -> Option<Sample> {
        self.samples.remove(key)
    }

    pub fn get(&self, key: &SampleKey) -> Option<&Sample> {
        self.samples.get(key)
    }

    pub fn get_mut(&mut self, key: &SampleKey) -> Option<&mut Sample> {
        self.samples.get_mut(key)
    }

    /// Snapshot of every key, unordered.
    pub fn keys(&self) -> Vec<SampleKey> {
        self.samples.keys().cloned().collect()
    }

    /// Snapshot of every sample, unordered.
    pub fn values(&self) -> Vec<Sample> {
        self.samples.values().cloned().collect()
    }

    /// All keys in sorted order.
    pub fn sorted_keys(&self) -> Vec<SampleKey> {
        let mut keys = self.keys();
        keys.sort();
        keys
    }

    pub fn keys_in(&self, partition: Partition) -> Vec<SampleKey> {
        let mut keys: Vec<_> = self
            .samples
            .values()
            .filter(|s| s.partition() == partition)
            .map(|s| s.key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn count(&self, partition: Partition) -> usize {
        self.samples
            .values()
            .filter(|s| s.partition() == partition)
            .count()
    }
}
