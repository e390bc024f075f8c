//! The map and reduce functions a worker can run, looked up by name.
//! Applications register their own functions before the worker starts serving.

use std::{collections::HashMap, sync::Arc};

use crate::mr::rpc::{KeyValue, TaskError};

/// User map logic: turns the contents of one input split into intermediate records
pub trait MapFunction: Send + Sync {
    fn map(&self, input: &str) -> Vec<KeyValue>;
}

/// User reduce logic: folds every value emitted for one key into a single value
pub trait ReduceFunction: Send + Sync {
    fn reduce(&self, key: &str, values: Vec<&str>) -> String;
}

/// Word Count application
pub mod wc {
    use super::{MapFunction, ReduceFunction};
    use crate::mr::rpc::KeyValue;

    pub struct WordCount;

    impl MapFunction for WordCount {
        fn map(&self, input: &str) -> Vec<KeyValue> {
            input
                .split_whitespace()
                .map(|x| KeyValue::new(x.to_lowercase(), "1"))
                .collect()
        }
    }

    /// Adds the values up, anything that does not parse as an integer is skipped
    pub struct Sum;

    impl ReduceFunction for Sum {
        fn reduce(&self, _key: &str, values: Vec<&str>) -> String {
            values
                .iter()
                .filter_map(|v| v.parse::<i64>().ok())
                .sum::<i64>()
                .to_string()
        }
    }

    pub struct Count;

    impl ReduceFunction for Count {
        fn reduce(&self, _key: &str, values: Vec<&str>) -> String {
            values.len().to_string()
        }
    }
}

/// Character frequency application
pub mod cf {
    use super::{MapFunction, ReduceFunction};
    use crate::mr::rpc::KeyValue;

    pub struct CharFrequency;

    impl MapFunction for CharFrequency {
        fn map(&self, input: &str) -> Vec<KeyValue> {
            input
                .chars()
                .filter(|c| !c.is_whitespace())
                .map(|c| KeyValue::new(c.to_string(), "1"))
                .collect()
        }
    }

    pub struct Max;

    impl ReduceFunction for Max {
        fn reduce(&self, _key: &str, values: Vec<&str>) -> String {
            values
                .iter()
                .filter_map(|v| v.parse::<i64>().ok())
                .max()
                .unwrap_or(0)
                .to_string()
        }
    }
}

/// Name -> implementation table consulted by the worker runtime
#[derive(Clone)]
pub struct FunctionRegistry {
    map_functions: HashMap<String, Arc<dyn MapFunction>>,
    reduce_functions: HashMap<String, Arc<dyn ReduceFunction>>,
}

impl FunctionRegistry {
    /// An empty registry, see [`FunctionRegistry::with_builtins`] for the usual starting point
    pub fn new() -> Self {
        Self {
            map_functions: HashMap::new(),
            reduce_functions: HashMap::new(),
        }
    }

    /// Registry preloaded with `word_count`, `char_freq`, `sum`, `count` and `max`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_map("word_count", wc::WordCount);
        registry.register_map("char_freq", cf::CharFrequency);
        registry.register_reduce("sum", wc::Sum);
        registry.register_reduce("count", wc::Count);
        registry.register_reduce("max", cf::Max);
        registry
    }

    pub fn register_map(&mut self, name: &str, function: impl MapFunction + 'static) {
        self.map_functions.insert(name.to_string(), Arc::new(function));
    }

    pub fn register_reduce(&mut self, name: &str, function: impl ReduceFunction + 'static) {
        self.reduce_functions.insert(name.to_string(), Arc::new(function));
    }

    pub fn resolve_map(&self, name: &str) -> Result<Arc<dyn MapFunction>, TaskError> {
        self.map_functions
            .get(name)
            .cloned()
            .ok_or_else(|| TaskError::UnknownFunction(name.to_string()))
    }

    pub fn resolve_reduce(&self, name: &str) -> Result<Arc<dyn ReduceFunction>, TaskError> {
        self.reduce_functions
            .get(name)
            .cloned()
            .ok_or_else(|| TaskError::UnknownFunction(name.to_string()))
    }

    pub fn map_names(&self) -> Vec<&str> {
        let mut names = self.map_functions.keys().map(String::as_str).collect::<Vec<_>>();
        names.sort_unstable();
        names
    }

    pub fn reduce_names(&self) -> Vec<&str> {
        let mut names = self.reduce_functions.keys().map(String::as_str).collect::<Vec<_>>();
        names.sort_unstable();
        names
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
