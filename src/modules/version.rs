// src/modules/version.rs
//! Vendor module versions
//!
//! Vendor automation modules version with up to four dotted numeric
//! components (e.g. `13.2.0.22643733`), which rules out strict semver.
//! Comparison pads missing components with zeros, so `13.2` == `13.2.0.0`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A dotted numeric module version
#[derive(Debug, Clone)]
pub struct ModuleVersion {
    components: Vec<u64>,
}

/// Error for unparseable version strings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidVersion(pub String);

impl fmt::Display for InvalidVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid module version '{}'", self.0)
    }
}

impl std::error::Error for InvalidVersion {}

impl ModuleVersion {
    /// Build a version from explicit components
    pub fn new(components: &[u64]) -> Self {
        Self {
            components: components.to_vec(),
        }
    }

    /// Major component (0 when absent)
    pub fn major(&self) -> u64 {
        self.component(0)
    }

    /// Minor component (0 when absent)
    pub fn minor(&self) -> u64 {
        self.component(1)
    }

    /// Whether two versions share the `major.minor` branch
    pub fn same_branch(&self, other: &ModuleVersion) -> bool {
        self.major() == other.major() && self.minor() == other.minor()
    }

    fn component(&self, index: usize) -> u64 {
        self.components.get(index).copied().unwrap_or(0)
    }
}

impl FromStr for ModuleVersion {
    type Err = InvalidVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(InvalidVersion(s.to_string()));
        }

        let components = trimmed
            .split('.')
            .map(|part| part.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| InvalidVersion(s.to_string()))?;

        Ok(Self { components })
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self
            .components
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(".");
        write!(f, "{}", text)
    }
}

impl PartialEq for ModuleVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ModuleVersion {}

impl PartialOrd for ModuleVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ModuleVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let width = self.components.len().max(other.components.len());
        for index in 0..width {
            match self.component(index).cmp(&other.component(index)) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}
