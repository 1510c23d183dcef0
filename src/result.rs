use std::collections::HashMap;
use std::sync::Arc;

use crate::{ErrorInfo, Key, Value};

/// Outcome of an evaluation for the requested keys.
#[derive(Debug, Clone, Default)]
pub struct EvaluationResult {
    values: HashMap<Key, Value, ahash::RandomState>,
    errors: HashMap<Key, Arc<ErrorInfo>, ahash::RandomState>,
    catastrophe: Option<Arc<anyhow::Error>>,
    cycle_roots: Vec<Key>,
}

impl EvaluationResult {
    /// Value of a requested key, if it evaluated without error.
    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.values.get(key)
    }

    /// Value of a requested key, downcast to `T`.
    pub fn get_as<T: 'static>(&self, key: &Key) -> Option<&T> {
        self.get(key).and_then(Value::downcast_ref)
    }

    /// Error of a requested key.
    pub fn error(&self, key: &Key) -> Option<&Arc<ErrorInfo>> {
        self.errors.get(key)
    }

    pub fn values(&self) -> &HashMap<Key, Value, ahash::RandomState> {
        &self.values
    }

    pub fn errors(&self) -> &HashMap<Key, Arc<ErrorInfo>, ahash::RandomState> {
        &self.errors
    }

    /// Returns true if any requested key is in error or the evaluation hit a catastrophe.
    pub fn has_error(&self) -> bool {
        !self.errors.is_empty() || self.catastrophe.is_some()
    }

    /// The exception that aborted the evaluation, if a catastrophic error occurred.
    pub fn catastrophe(&self) -> Option<&Arc<anyhow::Error>> {
        self.catastrophe.as_ref()
    }

    /// Requested keys that are in error because of a dependency cycle.
    pub fn cycle_roots(&self) -> &[Key] {
        &self.cycle_roots
    }
}

/// Accumulates an [`EvaluationResult`].
#[derive(Debug, Default)]
pub struct EvaluationResultBuilder {
    result: EvaluationResult,
}

impl EvaluationResultBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_result(&mut self, key: Key, value: Value) -> &mut Self {
        self.result.values.insert(key, value);
        self
    }

    pub fn add_error(&mut self, key: Key, error: Arc<ErrorInfo>) -> &mut Self {
        self.result.errors.insert(key, error);
        self
    }

    pub fn add_cycle_root(&mut self, key: Key) -> &mut Self {
        if !self.result.cycle_roots.contains(&key) {
            self.result.cycle_roots.push(key);
        }
        self
    }

    pub fn set_catastrophe(&mut self, exception: Arc<anyhow::Error>) -> &mut Self {
        self.result.catastrophe = Some(exception);
        self
    }

    /// Returns true if `key` already has a value or an error.
    pub fn contains(&self, key: &Key) -> bool {
        self.result.values.contains_key(key) || self.result.errors.contains_key(key)
    }

    pub fn has_error(&self) -> bool {
        self.result.has_error()
    }

    pub fn build(self) -> EvaluationResult {
        self.result
    }
}
