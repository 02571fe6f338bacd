//! Located diagnostics shared by every pipeline stage.
//!
//! Every stage that can reject a program does so by producing a
//! [`Diagnostic`]; the driver stops the pipeline at the first one (see
//! spec.md "first error in a pass aborts that pass").

use std::fmt;

use thiserror::Error;

/// The five diagnostic kinds named by the specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    Lexical,
    Syntax,
    Declaration,
    Type,
    Internal,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiagnosticKind::Lexical => "LexicalError",
            DiagnosticKind::Syntax => "SyntaxError",
            DiagnosticKind::Declaration => "DeclarationError",
            DiagnosticKind::Type => "TypeError",
            DiagnosticKind::Internal => "InternalError",
        };
        f.write_str(s)
    }
}

/// A single located diagnostic: `FILE:line:KIND:message`.
///
/// `note` carries the optional second informational line ("earlier
/// declaration of X at line N") that accompanies redeclaration errors.
///
/// `Display` is hand-written below (the optional `note` line doesn't fit
/// `thiserror`'s single-format-string `#[error(...)]` shape); the derive
/// here only supplies the `std::error::Error` impl.
#[derive(Debug, Clone, Error)]
pub struct Diagnostic {
    pub file: String,
    pub line: u32,
    pub kind: DiagnosticKind,
    pub message: String,
    pub note: Option<String>,
}

impl Diagnostic {
    pub fn new(file: impl Into<String>, line: u32, kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Diagnostic { file: file.into(), line, kind, message: message.into(), note: None }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.file, self.line, self.kind, self.message)?;
        if let Some(note) = &self.note {
            write!(f, "\n{}", note)?;
        }
        Ok(())
    }
}

pub type CompileResult<T> = Result<T, Diagnostic>;

/// Raise an [`Diagnostic::Internal`] for an invariant violation in IR
/// construction or lowering. Never user-triggerable for a program that
/// passed type-checking; callers should treat this the same as a panic
/// that the driver chose to report instead of unwinding.
macro_rules! bug {
    ($file:expr, $line:expr, $($arg:tt)*) => {
        return Err($crate::error::Diagnostic::new(
            $file,
            $line,
            $crate::error::DiagnosticKind::Internal,
            format!($($arg)*),
        ))
    };
}

pub(crate) use bug;
