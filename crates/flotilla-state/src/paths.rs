//! Node path handling and the per-framework layout.
//!
//! ```text
//! <prefix><framework>/
//!   framework-id          framework id assigned by the master
//!   tasks/
//!     <task-id>           serialized task instance
//! ```

use crate::error::{StateError, StateResult};

/// Validate an absolute node path and strip a trailing slash.
pub fn normalize(path: &str) -> StateResult<String> {
    if !path.starts_with('/') {
        return Err(StateError::InvalidPath(path.to_string()));
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok("/".to_string());
    }
    if trimmed.split('/').skip(1).any(str::is_empty) {
        return Err(StateError::InvalidPath(path.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Proper ancestors of a normalized path, outermost first, root excluded.
pub fn ancestors(path: &str) -> Vec<&str> {
    path.match_indices('/')
        .skip(1)
        .map(|(idx, _)| &path[..idx])
        .collect()
}

/// Key prefix shared by every descendant of `path`.
pub fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    }
}

/// Paths owned by one framework.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameworkPaths {
    root: String,
}

impl FrameworkPaths {
    /// `prefix` is prepended verbatim, e.g. `/dcos-service-` + `flotilla`.
    pub fn new(prefix: &str, framework: &str) -> Self {
        let mut root = format!("{prefix}{framework}");
        if !root.starts_with('/') {
            root.insert(0, '/');
        }
        Self { root }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn tasks(&self) -> String {
        format!("{}/tasks", self.root)
    }

    pub fn task(&self, task_id: &str) -> String {
        format!("{}/tasks/{task_id}", self.root)
    }

    pub fn framework_id(&self) -> String {
        format!("{}/framework-id", self.root)
    }
}
