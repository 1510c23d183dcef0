//! Error types for node computation and evaluation.

use std::fmt;
use std::sync::Arc;

use crate::key::Key;

/// Why a computation was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptKind {
    /// The caller cancelled the evaluation.
    External,
    /// The evaluator stopped scheduling work because a failure already explains
    /// the result. Never reported to the caller as a cancellation.
    Halted,
}

/// A failure raised by a node function itself.
#[derive(Debug, Clone)]
pub struct FunctionFailure {
    error: Arc<anyhow::Error>,
    transient: bool,
    catastrophic: bool,
}

impl FunctionFailure {
    /// Create an ordinary failure.
    pub fn new(error: impl Into<anyhow::Error>) -> Self {
        Self {
            error: Arc::new(error.into()),
            transient: false,
            catastrophic: false,
        }
    }

    /// Mark the failure as transient: the node is re-evaluated at the next version
    /// even if none of its dependencies changed.
    #[must_use]
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Mark the failure as catastrophic: it aborts the evaluation even in keep-going mode.
    #[must_use]
    pub fn catastrophic(mut self) -> Self {
        self.catastrophic = true;
        self
    }

    /// The underlying error.
    pub fn error(&self) -> &Arc<anyhow::Error> {
        &self.error
    }

    /// Returns true if the failure is transient.
    pub fn is_transient(&self) -> bool {
        self.transient
    }

    /// Returns true if the failure is catastrophic.
    pub fn is_catastrophic(&self) -> bool {
        self.catastrophic
    }
}

/// Error returned by a [`NodeFunction`](crate::NodeFunction).
///
/// Any `Into<anyhow::Error>` converts into [`ComputeError::Failed`], so the `?`
/// operator can be used on ordinary fallible operations inside a function.
#[derive(Debug, Clone)]
pub enum ComputeError {
    /// Some requested dependencies are not done yet. The function is restarted
    /// once all of them have completed.
    Missing,

    /// A requested dependency is in error and the function propagated it.
    ///
    /// The root cause stays with the dependency.
    Dependency {
        /// The dependency in error.
        key: Key,
        /// Its error.
        error: Arc<ErrorInfo>,
    },

    /// The function failed on its own. The root cause is the node being computed.
    Failed(FunctionFailure),

    /// The function observed an interrupt through
    /// [`Environment::check_interrupted`](crate::Environment::check_interrupted).
    Interrupted(InterruptKind),
}

impl ComputeError {
    /// Create a catastrophic failure.
    pub fn catastrophic(error: impl Into<anyhow::Error>) -> Self {
        ComputeError::Failed(FunctionFailure::new(error).catastrophic())
    }

    /// Create a transient failure.
    pub fn transient(error: impl Into<anyhow::Error>) -> Self {
        ComputeError::Failed(FunctionFailure::new(error).transient())
    }
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeError::Missing => write!(f, "dependencies missing"),
            ComputeError::Dependency { key, error } => {
                write!(f, "dependency {:?} failed: {}", key, error)
            }
            ComputeError::Failed(failure) => write!(f, "{}", failure.error),
            ComputeError::Interrupted(kind) => write!(f, "interrupted ({:?})", kind),
        }
    }
}

impl<T: Into<anyhow::Error>> From<T> for ComputeError {
    fn from(err: T) -> Self {
        ComputeError::Failed(FunctionFailure::new(err))
    }
}

/// A dependency cycle found below a requested key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleInfo {
    path_to_cycle: Vec<Key>,
    cycle: Vec<Key>,
}

impl CycleInfo {
    /// Create a cycle info. `path_to_cycle` leads from the requested key to the
    /// first element of `cycle`, exclusive.
    pub fn new(path_to_cycle: Vec<Key>, cycle: Vec<Key>) -> Self {
        assert!(!cycle.is_empty(), "a cycle needs at least one key");
        Self {
            path_to_cycle,
            cycle,
        }
    }

    /// Keys leading from the requested key to the cycle.
    pub fn path_to_cycle(&self) -> &[Key] {
        &self.path_to_cycle
    }

    /// Keys forming the cycle, each depending on the next and the last on the first.
    pub fn cycle(&self) -> &[Key] {
        &self.cycle
    }

    fn prefixed(&self, key: &Key) -> Self {
        if self.path_to_cycle.first() == Some(key) || self.cycle.contains(key) {
            return self.clone();
        }
        let mut path_to_cycle = Vec::with_capacity(self.path_to_cycle.len() + 1);
        path_to_cycle.push(key.clone());
        path_to_cycle.extend(self.path_to_cycle.iter().cloned());
        Self {
            path_to_cycle,
            cycle: self.cycle.clone(),
        }
    }
}

impl fmt::Display for CycleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for key in &self.path_to_cycle {
            write!(f, "{:?} -> ", key)?;
        }
        let cycle: Vec<String> = self.cycle.iter().map(Key::debug_repr).collect();
        write!(f, "[{}]", cycle.join(" -> "))
    }
}

/// Failure information committed to a node.
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    root_causes: Vec<Key>,
    exception: Option<Arc<anyhow::Error>>,
    root_cause_of_exception: Option<Key>,
    cycle_info: Vec<CycleInfo>,
    is_transient: bool,
    is_catastrophic: bool,
}

impl ErrorInfo {
    /// Error of a node whose own function failed.
    pub fn from_failure(key: Key, failure: &FunctionFailure) -> Self {
        Self {
            root_causes: vec![key.clone()],
            exception: Some(failure.error.clone()),
            root_cause_of_exception: Some(key),
            cycle_info: Vec::new(),
            is_transient: failure.transient,
            is_catastrophic: failure.catastrophic,
        }
    }

    /// Error of a node found at the head of a cycle.
    pub fn from_cycle(cycle: CycleInfo) -> Self {
        Self::from_cycles(vec![cycle])
    }

    /// Error of a node with one or more cycles below it.
    pub fn from_cycles(cycles: Vec<CycleInfo>) -> Self {
        assert!(!cycles.is_empty(), "no cycles given");
        Self {
            root_causes: Vec::new(),
            exception: None,
            root_cause_of_exception: None,
            cycle_info: cycles,
            is_transient: false,
            is_catastrophic: false,
        }
    }

    /// Error of `key` aggregated from the errors of its children.
    pub fn from_child_errors<'a>(
        key: &Key,
        children: impl IntoIterator<Item = &'a ErrorInfo>,
    ) -> Self {
        let mut info = Self {
            root_causes: Vec::new(),
            exception: None,
            root_cause_of_exception: None,
            cycle_info: Vec::new(),
            is_transient: false,
            is_catastrophic: false,
        };
        let mut any = false;
        for child in children {
            any = true;
            for cause in &child.root_causes {
                if !info.root_causes.contains(cause) {
                    info.root_causes.push(cause.clone());
                }
            }
            if info.exception.is_none() {
                info.exception = child.exception.clone();
                info.root_cause_of_exception = child.root_cause_of_exception.clone();
            }
            info.cycle_info
                .extend(child.cycle_info.iter().map(|cycle| cycle.prefixed(key)));
            info.is_transient |= child.is_transient;
            info.is_catastrophic |= child.is_catastrophic;
        }
        assert!(any, "no child errors given for {:?}", key);
        info
    }

    /// Keys whose own functions failed, transitively causing this error.
    pub fn root_causes(&self) -> &[Key] {
        &self.root_causes
    }

    /// One of the exceptions behind this error, if it is not purely a cycle.
    pub fn exception(&self) -> Option<&Arc<anyhow::Error>> {
        self.exception.as_ref()
    }

    /// The key whose function raised [`exception`](Self::exception).
    pub fn root_cause_of_exception(&self) -> Option<&Key> {
        self.root_cause_of_exception.as_ref()
    }

    /// Cycles below this node.
    pub fn cycle_info(&self) -> &[CycleInfo] {
        &self.cycle_info
    }

    /// Returns true if the error may disappear at the next version.
    pub fn is_transient(&self) -> bool {
        self.is_transient
    }

    /// Returns true if the error aborts the evaluation even in keep-going mode.
    pub fn is_catastrophic(&self) -> bool {
        self.is_catastrophic
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.exception, &self.root_cause_of_exception) {
            (Some(exception), Some(key)) => write!(f, "{:?}: {}", key, exception)?,
            (Some(exception), None) => write!(f, "{}", exception)?,
            (None, _) => {}
        }
        for (i, cycle) in self.cycle_info.iter().enumerate() {
            if i > 0 || self.exception.is_some() {
                write!(f, "; ")?;
            }
            write!(f, "cycle: {}", cycle)?;
        }
        Ok(())
    }
}

/// Errors returned by an evaluation as a whole.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EvalError {
    /// The caller cancelled the evaluation.
    #[error("evaluation interrupted")]
    Interrupted,

    /// A node function panicked or broke the function protocol.
    #[error("node function for {key:?} crashed: {message}")]
    Crashed {
        /// Key being computed.
        key: Key,
        /// Panic message.
        message: String,
    },
}

/// Errors returned when building an evaluator.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The worker pool could not be created.
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::FunctionName;

    const NODE: FunctionName = FunctionName::new("NODE");

    fn key(name: &'static str) -> Key {
        Key::new(NODE, name)
    }

    #[test]
    fn test_compute_error_from_anyhow() {
        let err: ComputeError = anyhow::anyhow!("broken input").into();
        match err {
            ComputeError::Failed(failure) => {
                assert!(!failure.is_transient());
                assert!(!failure.is_catastrophic());
                assert_eq!(failure.error().to_string(), "broken input");
            }
            other => panic!("Expected Failed, got {:?}", other),
        }
    }

    #[test]
    fn test_compute_error_from_io_error() {
        fn read() -> Result<(), ComputeError> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"))?;
            Ok(())
        }
        let err = read().unwrap_err();
        assert!(matches!(err, ComputeError::Failed(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_info_from_child_errors_aggregates() {
        let a = ErrorInfo::from_failure(key("a"), &FunctionFailure::new(anyhow::anyhow!("a")));
        let b = ErrorInfo::from_failure(
            key("b"),
            &FunctionFailure::new(anyhow::anyhow!("b")).catastrophic(),
        );
        let parent = ErrorInfo::from_child_errors(&key("p"), [&a, &b, &a]);
        assert_eq!(parent.root_causes(), &[key("a"), key("b")]);
        assert_eq!(parent.root_cause_of_exception(), Some(&key("a")));
        assert!(parent.is_catastrophic());
        assert!(!parent.is_transient());
    }

    #[test]
    fn test_error_info_cycle_path_is_prefixed() {
        let cycle = ErrorInfo::from_cycle(CycleInfo::new(vec![], vec![key("a"), key("b")]));
        let parent = ErrorInfo::from_child_errors(&key("top"), [&cycle]);
        assert_eq!(parent.cycle_info()[0].path_to_cycle(), &[key("top")]);
        assert_eq!(parent.cycle_info()[0].cycle(), &[key("a"), key("b")]);
        assert!(parent.exception().is_none());
    }

    #[test]
    #[should_panic(expected = "no child errors")]
    fn test_error_info_requires_children() {
        ErrorInfo::from_child_errors(&key("p"), []);
    }
}
