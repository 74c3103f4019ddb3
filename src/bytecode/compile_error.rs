use thiserror::Error;

use crate::lang::{FunctionId, Type};

pub type Result<T> = std::result::Result<T, CompileError>;

/// Compilation failures.
///
/// Everything here is fatal: compilation is one-shot and stops at the first
/// error. Most variants describe input the front end should have rejected;
/// `UnresolvedToken` is an invariant violation inside the generator itself.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    /// A placeholder survived every resolution pass.
    #[error("compile error: unresolved intermediate token `{token}` in {context}")]
    UnresolvedToken { token: String, context: String },

    /// `break @name` / `continue @name` with no enclosing loop called `name`.
    #[error("compile error: no enclosing loop labelled '{label}' in {context}")]
    UnknownLabel { label: String, context: String },

    /// Unlabelled `break` / `continue` outside of any loop.
    #[error("compile error: '{keyword}' outside of a loop in {context}")]
    JumpOutsideLoop {
        keyword: &'static str,
        context: String,
    },

    #[error("compile error: call to unknown function #{0}")]
    UnknownFunction(FunctionId),

    #[error("compile error: native function '{signature}' is not in the link table")]
    UnknownNative { signature: String },

    #[error("compile error: function '{name}' called with {got} arguments, expected {expected}")]
    ArgumentCount {
        name: String,
        expected: usize,
        got: usize,
    },

    /// A place or expression shape the generator has no encoding for.
    #[error("compile error: {what} on '{name}' ({ty})")]
    Unsupported {
        what: &'static str,
        name: String,
        ty: Type,
    },
}

impl CompileError {
    pub fn unsupported(what: &'static str, name: &str, ty: &Type) -> Self {
        CompileError::Unsupported {
            what,
            name: name.to_string(),
            ty: ty.clone(),
        }
    }
}
