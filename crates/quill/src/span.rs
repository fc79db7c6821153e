//! Source positions.
//!
//! Every AST node and every emitted instruction carries a [`Span`] of byte
//! offsets into the original source text. A [`SourceFile`] resolves those
//! offsets back to line/column pairs when errors are rendered. Scripts that
//! are built programmatically (the parser is a separate crate) may use an
//! empty source; rendering degrades gracefully to offsets only.

use std::fmt;
use std::sync::Arc;

/// A half-open byte range in the source code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Returns true for the zero span used by synthesized nodes.
    pub fn is_empty(&self) -> bool {
        self.start == 0 && self.end == 0
    }
}

/// A named source file with its full text.
///
/// Shared (`Arc`) between the compiled program and every runtime error that
/// carries a trace, so positions stay resolvable after compilation.
#[derive(Debug, Clone, Default)]
pub struct SourceFile {
    /// Display name, e.g. `(main)` or a path.
    pub name: String,
    /// The complete source text. May be empty for synthesized ASTs.
    pub text: String,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            text: text.into(),
        })
    }

    /// An anonymous, textless file for programmatically built ASTs.
    pub fn anonymous() -> Arc<Self> {
        Self::new("(main)", "")
    }

    /// Resolve a byte offset to a 1-indexed (line, column) pair.
    pub fn line_col(&self, offset: usize) -> (usize, usize) {
        let mut line = 1;
        let mut col = 1;
        for (i, ch) in self.text.char_indices() {
            if i >= offset {
                break;
            }
            if ch == '\n' {
                line += 1;
                col = 1;
            } else {
                col += 1;
            }
        }
        (line, col)
    }

    /// The content of a 1-indexed line, or `""` past the end.
    pub fn line(&self, line_num: usize) -> &str {
        self.text.lines().nth(line_num.saturating_sub(1)).unwrap_or("")
    }

    /// Format a position as `name:line:col` for traces.
    pub fn format_pos(&self, span: Span) -> String {
        if self.text.is_empty() {
            return format!("{}:@{}", self.name, span.start);
        }
        let (line, col) = self.line_col(span.start);
        format!("{}:{}:{}", self.name, line, col)
    }
}

impl fmt::Display for SourceFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_col() {
        let file = SourceFile::new("test", "ab\ncd\nef");
        assert_eq!(file.line_col(0), (1, 1));
        assert_eq!(file.line_col(1), (1, 2));
        assert_eq!(file.line_col(3), (2, 1));
        assert_eq!(file.line_col(7), (3, 2));
    }

    #[test]
    fn test_format_pos_without_text() {
        let file = SourceFile::anonymous();
        assert_eq!(file.format_pos(Span::new(12, 14)), "(main):@12");
    }
}
