//! Rich diagnostic rendering for compile and runtime errors.
//!
//! Formats errors the way Rust's compiler does: the offending source line,
//! a caret underline, optional notes and help lines. Degrades to a plain
//! message when the source text is unavailable (programmatically built
//! ASTs).

use std::fmt;
use std::sync::Arc;

use crate::error::CompileError;
use crate::span::{SourceFile, Span};
use crate::value::RuntimeError;

/// A label attached to a span with a message.
#[derive(Debug, Clone)]
pub struct Label {
    pub span: Span,
    pub message: String,
    pub is_primary: bool,
}

impl Label {
    pub fn primary(span: Span, message: impl Into<String>) -> Self {
        Self { span, message: message.into(), is_primary: true }
    }

    pub fn secondary(span: Span, message: impl Into<String>) -> Self {
        Self { span, message: message.into(), is_primary: false }
    }
}

/// A renderable diagnostic with source context.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub message: String,
    pub file: Arc<SourceFile>,
    pub labels: Vec<Label>,
    pub notes: Vec<String>,
    pub help: Vec<String>,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>, file: Arc<SourceFile>) -> Self {
        Self {
            message: message.into(),
            file,
            labels: Vec::new(),
            notes: Vec::new(),
            help: Vec::new(),
        }
    }

    pub fn with_label(mut self, span: Span, message: impl Into<String>) -> Self {
        self.labels.push(Label::primary(span, message));
        self
    }

    pub fn with_secondary_label(mut self, span: Span, message: impl Into<String>) -> Self {
        self.labels.push(Label::secondary(span, message));
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help.push(help.into());
        self
    }

    /// Render a compile error with its position underlined.
    pub fn from_compile_error(err: &CompileError) -> Self {
        Self::new(err.message.clone(), err.file.clone()).with_label(err.span, "")
    }

    /// Render a runtime error; the trace becomes notes, innermost first.
    pub fn from_runtime_error(err: &RuntimeError) -> Self {
        let mut diag = Self::new(err.error.to_string(), err.file.clone());
        if let Some(first) = err.trace.first() {
            diag = diag.with_label(*first, "raised here");
        }
        for span in err.trace.iter().skip(1) {
            diag = diag.with_note(format!("called from {}", err.file.format_pos(*span)));
        }
        diag
    }

    fn line_number_width(&self) -> usize {
        let max_line = self.file.text.lines().count();
        max_line.to_string().len().max(1)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "error: {}", self.message)?;

        if self.file.text.is_empty() || self.labels.is_empty() {
            for note in &self.notes {
                writeln!(f, "  = note: {}", note)?;
            }
            for help in &self.help {
                writeln!(f, "  = help: {}", help)?;
            }
            return Ok(());
        }

        let width = self.line_number_width();
        writeln!(f, "{:width$} |", "", width = width)?;

        for label in &self.labels {
            let (line_num, start_col) = self.file.line_col(label.span.start);
            let (_, end_col) = self.file.line_col(label.span.end);
            let line = self.file.line(line_num);

            writeln!(f, "{:width$} | {}", line_num, line, width = width)?;

            let underline_start = start_col.saturating_sub(1);
            let underline_len = end_col.saturating_sub(start_col).max(1);
            let underline_char = if label.is_primary { '^' } else { '-' };

            write!(f, "{:width$} | ", "", width = width)?;
            write!(f, "{:underline_start$}", "")?;
            for _ in 0..underline_len {
                write!(f, "{}", underline_char)?;
            }
            if !label.message.is_empty() {
                write!(f, " {}", label.message)?;
            }
            writeln!(f)?;
        }

        writeln!(f, "{:width$} |", "", width = width)?;

        for note in &self.notes {
            writeln!(f, "  = note: {}", note)?;
        }
        for help in &self.help {
            writeln!(f, "  = help: {}", help)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renders_underline_and_notes() {
        let file = SourceFile::new("script", "x := missing(1)");
        let diag = Diagnostic::new("unresolved reference \"missing\"", file)
            .with_label(Span::new(5, 12), "not defined")
            .with_note("names resolve to locals, globals, then builtins")
            .with_help("register a host function under this name");

        let out = diag.to_string();
        assert!(out.contains("error: unresolved reference"));
        assert!(out.contains("x := missing(1)"));
        assert!(out.contains("^^^^^^^"));
        assert!(out.contains("note:"));
        assert!(out.contains("help:"));
    }

    #[test]
    fn test_plain_render_without_source() {
        let diag = Diagnostic::new("boom", SourceFile::anonymous()).with_note("context");
        let out = diag.to_string();
        assert!(out.contains("error: boom"));
        assert!(out.contains("note: context"));
    }
}
