use std::fmt::{self, Display};

use crate::CoordinationError;

const SEPARATOR: char = '/';

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// An absolute, validated path within the coordination namespace.
///
/// Paths always start with `/`, never end with one (except the root itself)
/// and never contain empty segments.
pub struct NodePath(String);

impl NodePath {
    /// The namespace root, `/`.
    pub fn root() -> Self {
        Self(SEPARATOR.to_string())
    }

    /// Parses and validates an absolute path.
    pub fn new(path: impl Into<String>) -> Result<Self, CoordinationError> {
        let path = path.into();

        if !path.starts_with(SEPARATOR) {
            return Err(invalid(path, "paths must be absolute"));
        }

        if path.len() == 1 {
            return Ok(Self(path));
        }

        if path.ends_with(SEPARATOR) {
            return Err(invalid(path, "paths must not end with a separator"));
        }

        if path[1..].split(SEPARATOR).any(|segment| segment.is_empty()) {
            return Err(invalid(path, "paths must not contain empty segments"));
        }

        Ok(Self(path))
    }

    /// Creates the path of the child `name` below this path.
    ///
    /// The name must be a single non-empty segment.
    pub fn join(&self, name: &str) -> Result<Self, CoordinationError> {
        validate_segment(name)?;

        if self.is_root() {
            Ok(Self(format!("/{name}")))
        } else {
            Ok(Self(format!("{}/{name}", self.0)))
        }
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.len() == 1
    }

    /// The parent of this path, `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }

        match self.0.rfind(SEPARATOR) {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// The last segment of the path, empty for the root.
    pub fn name(&self) -> &str {
        match self.0.rfind(SEPARATOR) {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NodePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Checks that `name` can be used as a single path segment.
pub fn validate_segment(name: &str) -> Result<(), CoordinationError> {
    if name.is_empty() {
        return Err(invalid(name.to_string(), "segments must not be empty"));
    }

    if name.contains(SEPARATOR) {
        return Err(invalid(
            name.to_string(),
            "segments must not contain a separator",
        ));
    }

    if name == "." || name == ".." {
        return Err(invalid(name.to_string(), "relative segments are not allowed"));
    }

    Ok(())
}

fn invalid(path: String, reason: &'static str) -> CoordinationError {
    CoordinationError::InvalidPath { path, reason }
}
