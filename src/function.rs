//! Node functions and the environment they compute in.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::scheduler::NodeVisitor;
use crate::{
    CancellationToken, ComputeError, ErrorInfo, FunctionName, InMemoryGraph, InterruptKind, Key,
    NodeEntry, Value,
};

/// Computes the value of every key of one function family.
///
/// A function requests its dependencies through the [`Environment`]. If some of
/// them are not done yet it returns [`ComputeError::Missing`] and is restarted
/// from scratch once they are, so it must be deterministic in the values it reads.
///
/// Any closure `Fn(&Key, &mut Environment<'_>) -> Result<Value, ComputeError>`
/// is a node function.
pub trait NodeFunction: Send + Sync + 'static {
    fn compute(&self, key: &Key, env: &mut Environment<'_>) -> Result<Value, ComputeError>;
}

impl<F> NodeFunction for F
where
    F: Fn(&Key, &mut Environment<'_>) -> Result<Value, ComputeError> + Send + Sync + 'static,
{
    fn compute(&self, key: &Key, env: &mut Environment<'_>) -> Result<Value, ComputeError> {
        self(key, env)
    }
}

/// Node functions by function family.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: HashMap<FunctionName, Arc<dyn NodeFunction>, ahash::RandomState>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure for `name`, replacing any previous function.
    pub fn register<F>(&mut self, name: FunctionName, function: F)
    where
        F: Fn(&Key, &mut Environment<'_>) -> Result<Value, ComputeError> + Send + Sync + 'static,
    {
        self.insert(name, Arc::new(function));
    }

    pub fn insert(&mut self, name: FunctionName, function: Arc<dyn NodeFunction>) {
        self.functions.insert(name, function);
    }

    pub fn get(&self, name: FunctionName) -> Option<&Arc<dyn NodeFunction>> {
        self.functions.get(&name)
    }
}

/// A dependency requested by a function that was not known to its node before.
#[derive(Debug, Clone)]
pub(crate) struct RequestedDep {
    pub key: Key,
    pub done: bool,
}

/// What a function call left behind in its environment.
#[derive(Debug, Default)]
pub(crate) struct EnvironmentOutcome {
    pub new_deps: Vec<Vec<RequestedDep>>,
    pub values_missing: bool,
    pub child_errors: Vec<(Key, Arc<ErrorInfo>)>,
}

enum Mode<'a> {
    /// Regular evaluation: new dependencies are recorded for registration.
    Building {
        entry: &'a NodeEntry,
        visitor: &'a NodeVisitor,
    },
    /// Error bubbling: bubbled errors shadow the graph and nothing is recorded.
    Bubbling {
        bubbled: &'a HashMap<Key, Arc<ErrorInfo>>,
    },
}

/// Access to dependency values for a running node function.
pub struct Environment<'a> {
    graph: &'a InMemoryGraph,
    cancellation: &'a CancellationToken,
    mode: Mode<'a>,
    requested: HashSet<Key>,
    outcome: EnvironmentOutcome,
}

impl<'a> Environment<'a> {
    pub(crate) fn building(
        graph: &'a InMemoryGraph,
        cancellation: &'a CancellationToken,
        entry: &'a NodeEntry,
        visitor: &'a NodeVisitor,
    ) -> Self {
        Self {
            graph,
            cancellation,
            mode: Mode::Building { entry, visitor },
            requested: HashSet::new(),
            outcome: EnvironmentOutcome::default(),
        }
    }

    pub(crate) fn bubbling(
        graph: &'a InMemoryGraph,
        cancellation: &'a CancellationToken,
        bubbled: &'a HashMap<Key, Arc<ErrorInfo>>,
    ) -> Self {
        Self {
            graph,
            cancellation,
            mode: Mode::Bubbling { bubbled },
            requested: HashSet::new(),
            outcome: EnvironmentOutcome::default(),
        }
    }

    /// Request the value of `key`.
    ///
    /// Returns `Ok(None)` if the dependency is not done yet, in which case the
    /// function should return [`ComputeError::Missing`]. Returns
    /// [`ComputeError::Dependency`] if the dependency is in error, so `?`
    /// propagates it.
    pub fn get(&mut self, key: &Key) -> Result<Option<Value>, ComputeError> {
        let mut group = Vec::new();
        let result = self.lookup(key, &mut group);
        self.push_group(group);
        result
    }

    /// Request several values at once. They form one dependency group, checked
    /// together when the node is re-evaluated.
    ///
    /// Every key is requested even if an earlier one is in error. The first
    /// error is returned.
    pub fn get_values(&mut self, keys: &[Key]) -> Result<Vec<Option<Value>>, ComputeError> {
        let mut group = Vec::new();
        let mut values = Vec::with_capacity(keys.len());
        let mut first_error = None;
        for key in keys {
            match self.lookup(key, &mut group) {
                Ok(value) => values.push(value),
                Err(err) => {
                    values.push(None);
                    first_error.get_or_insert(err);
                }
            }
        }
        self.push_group(group);
        match first_error {
            Some(err) => Err(err),
            None => Ok(values),
        }
    }

    /// Returns true if a requested dependency was not done.
    pub fn values_missing(&self) -> bool {
        self.outcome.values_missing
    }

    /// Returns an error if the function should stop early.
    ///
    /// [`InterruptKind::External`] means the caller cancelled the evaluation;
    /// [`InterruptKind::Halted`] means the evaluation already failed elsewhere.
    pub fn check_interrupted(&self) -> Result<(), ComputeError> {
        if self.cancellation.is_cancelled() {
            return Err(ComputeError::Interrupted(InterruptKind::External));
        }
        match self.mode {
            Mode::Building { visitor, .. } if visitor.is_halted() => {
                Err(ComputeError::Interrupted(InterruptKind::Halted))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn finish(self) -> EnvironmentOutcome {
        self.outcome
    }

    fn lookup(
        &mut self,
        key: &Key,
        group: &mut Vec<RequestedDep>,
    ) -> Result<Option<Value>, ComputeError> {
        if let Mode::Bubbling { bubbled } = self.mode {
            if let Some(error) = bubbled.get(key) {
                self.record_child_error(key, error.clone());
                return Err(ComputeError::Dependency {
                    key: key.clone(),
                    error: error.clone(),
                });
            }
        }

        let dep = self.graph.get(key);
        let done = dep.as_ref().is_some_and(|dep| dep.is_done());
        if let Mode::Building { entry, .. } = self.mode {
            let known = dep
                .as_ref()
                .is_some_and(|dep| entry.temporary_direct_deps_contain(dep.id()));
            if !known && self.requested.insert(key.clone()) {
                group.push(RequestedDep {
                    key: key.clone(),
                    done,
                });
            }
        }

        let Some(dep) = dep.filter(|_| done) else {
            self.outcome.values_missing = true;
            return Ok(None);
        };
        if let Some(error) = dep.error_info() {
            self.record_child_error(key, error.clone());
            return Err(ComputeError::Dependency {
                key: key.clone(),
                error,
            });
        }
        Ok(dep.value())
    }

    fn record_child_error(&mut self, key: &Key, error: Arc<ErrorInfo>) {
        if !self.outcome.child_errors.iter().any(|(k, _)| k == key) {
            self.outcome.child_errors.push((key.clone(), error));
        }
    }

    fn push_group(&mut self, group: Vec<RequestedDep>) {
        if !group.is_empty() {
            self.outcome.new_deps.push(group);
        }
    }
}
