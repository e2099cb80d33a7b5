//! Error types for run orchestration.
//!
//! Failures surfaced to callers are carried as [`ErrorWithPath`], which pins a
//! message to the position of the failing module inside the model system tree.
//! Lifecycle misuse and transport problems use [`RunError`] / [`ProtocolError`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::model::Module;

/// Child-index path from the tree root to a node. The root itself is `[]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModulePath(Vec<usize>);

impl ModulePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn indices(&self) -> &[usize] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Path of the `index`-th child of this node.
    pub fn child(&self, index: usize) -> Self {
        let mut indices = self.0.clone();
        indices.push(index);
        Self(indices)
    }
}

impl From<Vec<usize>> for ModulePath {
    fn from(indices: Vec<usize>) -> Self {
        Self(indices)
    }
}

impl fmt::Display for ModulePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, index) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{index}")?;
        }
        f.write_str("]")
    }
}

/// A failure attributed (when possible) to a module in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorWithPath {
    /// Absent when the failure cannot be pinned to a specific module.
    pub path: Option<ModulePath>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_name: Option<String>,
}

impl ErrorWithPath {
    pub fn new(path: Option<ModulePath>, message: impl Into<String>) -> Self {
        Self {
            path,
            message: message.into(),
            stack_trace: None,
            module_name: None,
        }
    }

    /// An error that is not attributed to any module.
    pub fn unattributed(message: impl Into<String>) -> Self {
        Self::new(None, message)
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        let stack_trace = stack_trace.into();
        self.stack_trace = (!stack_trace.trim().is_empty()).then_some(stack_trace);
        self
    }

    pub fn with_module_name(mut self, module_name: impl Into<String>) -> Self {
        self.module_name = Some(module_name.into());
        self
    }
}

impl fmt::Display for ErrorWithPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.path, &self.module_name) {
            (Some(path), Some(name)) => write!(f, "{} at {}: {}", name, path, self.message),
            (Some(path), None) => write!(f, "module at {}: {}", path, self.message),
            (None, Some(name)) => write!(f, "{}: {}", name, self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

/// Error raised by a module while the model system is executing.
///
/// Carrying the module lets the executor compute the failing node's
/// [`ModulePath`] by identity. Wrap it in `anyhow::Error` (optionally with
/// extra context); the innermost tag in the error chain wins.
#[derive(thiserror::Error)]
#[error("{message}")]
pub struct ModuleRuntimeError {
    module: Arc<dyn Module>,
    message: String,
}

impl ModuleRuntimeError {
    pub fn new(module: Arc<dyn Module>, message: impl Into<String>) -> Self {
        Self {
            module,
            message: message.into(),
        }
    }

    pub fn module(&self) -> &Arc<dyn Module> {
        &self.module
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Debug for ModuleRuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRuntimeError")
            .field("module", &self.module.name())
            .field("message", &self.message)
            .finish()
    }
}

/// Errors from wire protocol encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),

    #[error("payload field `{0}` is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("payload of {0} bytes exceeds the frame limit")]
    PayloadTooLarge(usize),

    #[error("unknown validation stage {0}")]
    UnknownStage(u8),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True when the peer closed the channel cleanly between messages.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Errors from run lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("run `{0}` has already been started")]
    AlreadyStarted(String),

    #[error("failed to spawn worker for run `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no async runtime available: {0}")]
    NoRuntime(String),

    #[error("failed to serialize model system: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_path_display() {
        assert_eq!(ModulePath::root().to_string(), "[]");
        assert_eq!(ModulePath::from(vec![1, 0, 2]).to_string(), "[1, 0, 2]");
    }

    #[test]
    fn test_module_path_child() {
        let path = ModulePath::from(vec![1]).child(0).child(2);
        assert_eq!(path.indices(), &[1, 0, 2]);
        assert_eq!(path.len(), 3);
    }

    #[test]
    fn test_blank_stack_trace_is_dropped() {
        let err = ErrorWithPath::unattributed("boom").with_stack_trace("   ");
        assert!(err.stack_trace.is_none());

        let err = ErrorWithPath::unattributed("boom").with_stack_trace("at main");
        assert_eq!(err.stack_trace.as_deref(), Some("at main"));
    }

    #[test]
    fn test_error_with_path_display() {
        let err = ErrorWithPath::new(Some(vec![0, 3].into()), "bad zone count")
            .with_module_name("Zone System");
        assert_eq!(err.to_string(), "Zone System at [0, 3]: bad zone count");
        assert_eq!(ErrorWithPath::unattributed("oops").to_string(), "oops");
    }

    #[test]
    fn test_disconnect_detection() {
        let eof = ProtocolError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        assert!(eof.is_disconnect());
        assert!(!ProtocolError::UnknownOpcode(99).is_disconnect());
    }
}
