use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::span::{SourceFile, Span};
use crate::value::RuntimeError;

/// A compile-time error with its source position.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub span: Span,
    pub file: Arc<SourceFile>,
}

impl CompileError {
    pub fn new(message: impl Into<String>, span: Span, file: Arc<SourceFile>) -> Self {
        Self { message: message.into(), span, file }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.message, self.file.format_pos(self.span))
    }
}

impl std::error::Error for CompileError {}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("{0}")]
    Runtime(#[from] RuntimeError),

    /// Several errors collected by the optimizer before it bailed out.
    #[error("Multiple errors:\n{}", format_list(.0))]
    Multiple(Vec<Error>),
}

fn format_list(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| format!("  {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

pub type Result<T> = std::result::Result<T, Error>;
