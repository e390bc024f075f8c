use std::{collections::BTreeMap, hash::Hasher};

use fnv::FnvHasher;

use crate::mr::rpc::KeyValue;

/// All values emitted for each key of one partition, keys in ascending order
pub type Partition = BTreeMap<String, Vec<String>>;

/// Hashes an intermediate key. The reduce bucket for a key is `ihash(key) % reduce_n`.
///
/// FNV-1a keeps the bucket stable across processes and compiler releases,
/// unlike the std `DefaultHasher`.
pub fn ihash(key: &str) -> u32 {
    let mut hasher = FnvHasher::default();
    hasher.write(key.as_bytes());
    (hasher.finish() & 0x7fff_ffff) as u32
}

pub fn partition_of(key: &str, reduce_n: usize) -> usize {
    ihash(key) as usize % reduce_n
}

/// Flatten a partition back into records, ordered by key
pub fn flatten(partition: &Partition) -> Vec<KeyValue> {
    partition
        .iter()
        .flat_map(|(key, values)| values.iter().map(move |value| KeyValue::new(key.clone(), value.clone())))
        .collect()
}

/// Collects map output until the map phase closes, then hands out the
/// partitions and gathers one reduce result per partition.
#[derive(Debug, Default)]
pub struct ResultAssembler {
    /// Map output waiting for the map phase to close, in no particular order
    buffer: Vec<KeyValue>,
    /// Set once by `partition_for_reduce`
    partitions: Option<Vec<Partition>>,
    /// Reduce output keyed by partition
    results: BTreeMap<usize, String>,
}

impl ResultAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_map_completed(&mut self, map_index: usize, mut records: Vec<KeyValue>) {
        tracing::debug!("[Map] Buffering {} records from map task #{}", records.len(), map_index);
        self.buffer.append(&mut records);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Split the buffered records into `reduce_n` partitions.
    ///
    /// The buffer is consumed by the first call, later calls return the same partitions.
    pub fn partition_for_reduce(&mut self, reduce_n: usize) -> Vec<Partition> {
        if let Some(partitions) = &self.partitions {
            return partitions.clone();
        }

        let mut partitions = vec![Partition::new(); reduce_n];
        for kv in self.buffer.drain(..) {
            let index = partition_of(&kv.key, reduce_n);
            partitions[index].entry(kv.key).or_default().push(kv.value);
        }
        self.partitions = Some(partitions.clone());
        partitions
    }

    pub fn on_reduce_completed(&mut self, partition: usize, value: String) {
        self.results.insert(partition, value);
    }

    /// `None` until every partition has reported
    pub fn final_results(&self) -> Option<&BTreeMap<usize, String>> {
        let expected = self.partitions.as_ref()?.len();
        (self.results.len() == expected).then_some(&self.results)
    }
}
