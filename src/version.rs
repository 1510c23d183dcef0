use std::fmt;

/// Version is a logical clock value. An evaluation runs at one version, and a node's
/// version is the version at which its value last changed. Note that this does not
/// increase one by one for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Version(pub u64);

impl Version {
    /// The version before any evaluation.
    pub const MINIMAL: Version = Version(0);

    /// The version following this one.
    #[must_use]
    pub fn next(self) -> Self {
        Version(self.0 + 1)
    }

    /// Returns true if this version is not newer than `other`.
    pub fn at_most(self, other: Version) -> bool {
        self <= other
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}
