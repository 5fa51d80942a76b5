//! Frontend failure kinds.
//!
//! Validation runs before lowering, so a malformed body reaching the
//! frontend is a bug somewhere upstream, not a recoverable condition. The
//! frontend still reports it as a typed error rather than panicking, so the
//! embedder can tell a compiler defect apart from an opcode it simply does
//! not implement yet.

use std::error;
use std::fmt;

/// Reportable failure of a single function compilation.
///
/// Raised through [`anyhow::Error`]; callers that need to distinguish the
/// kind can `downcast_ref::<CompileError>()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// The input violates an invariant the validator was supposed to
    /// establish (bad LEB128, label out of range, stack underflow, ...).
    /// Never recoverable.
    InvariantViolation(String),

    /// The opcode (or value type) is valid WebAssembly but the lowerer
    /// does not implement it. Surfaced to the caller verbatim.
    Unsupported(String),

    /// A per-function arena ran out of dense handles.
    Overflow(&'static str),
}

impl CompileError {
    pub(crate) fn invariant(reason: impl Into<String>) -> Self {
        CompileError::InvariantViolation(reason.into())
    }

    pub(crate) fn unsupported(what: impl fmt::Debug) -> Self {
        CompileError::Unsupported(format!("{:?}", what))
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::InvariantViolation(reason) => {
                write!(f, "invariant violation: {}", reason)
            }
            CompileError::Unsupported(what) => write!(f, "unsupported: {}", what),
            CompileError::Overflow(arena) => write!(f, "arena overflow: {}", arena),
        }
    }
}

impl error::Error for CompileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_kind() {
        let err = CompileError::invariant("value stack underflow");
        assert_eq!(err.to_string(), "invariant violation: value stack underflow");

        let err = CompileError::Overflow("values");
        assert_eq!(err.to_string(), "arena overflow: values");
    }

    #[test]
    fn downcast_through_anyhow() {
        let err: anyhow::Error = CompileError::Unsupported("I32Mul".to_string()).into();
        match err.downcast_ref::<CompileError>() {
            Some(CompileError::Unsupported(op)) => assert_eq!(op, "I32Mul"),
            other => panic!("unexpected error kind: {:?}", other),
        }
    }
}
