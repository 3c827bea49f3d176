//! Compile-time diagnostics collected while analysing a program.

use std::{collections::TryReserveError, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A source position inside a compiled unit. Lines and columns are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourcePos {
    pub line: u32,
    pub column: u32,
}

impl SourcePos {
    #[must_use]
    pub const fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub file: Option<String>,
    /// `None` when the message is not tied to a position.
    pub pos: Option<SourcePos>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.pos) {
            (Some(file), Some(pos)) => write!(f, "{file}:{}:{}: ", pos.line, pos.column)?,
            (Some(file), None) => write!(f, "{file}: ")?,
            (None, Some(pos)) => write!(f, "{}:{}: ", pos.line, pos.column)?,
            (None, None) => {}
        }
        write!(f, "{}: {}", self.severity, self.message)
    }
}

/// Every diagnostic of a compilation, plus whether it may proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileReport {
    messages: Vec<Diagnostic>,
    success: bool,
}

impl Default for CompileReport {
    fn default() -> Self {
        Self::new()
    }
}

impl CompileReport {
    #[must_use]
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            success: true,
        }
    }

    /// Records a diagnostic. Any error marks the compilation failed.
    pub fn add(&mut self, diagnostic: Diagnostic) -> Result<(), TryReserveError> {
        self.messages.try_reserve(1)?;
        if diagnostic.severity == Severity::Error {
            self.success = false;
        }
        self.messages.push(diagnostic);
        Ok(())
    }

    pub fn error(&mut self, message: impl Into<String>, file: Option<&str>, pos: Option<SourcePos>) -> Result<(), TryReserveError> {
        self.add(Diagnostic {
            severity: Severity::Error,
            message: message.into(),
            file: file.map(str::to_owned),
            pos,
        })
    }

    /// Records an out-of-memory failure.
    ///
    /// Never allocates for the message list if it cannot: the report is marked failed either way.
    pub fn fatal_out_of_memory(&mut self, message: &'static str) {
        self.success = false;
        if self.messages.try_reserve(1).is_ok() {
            self.messages.push(Diagnostic {
                severity: Severity::Error,
                message: message.to_owned(),
                file: None,
                pos: None,
            });
        }
    }

    #[must_use]
    pub fn messages(&self) -> &[Diagnostic] {
        &self.messages
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.success
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.messages.iter().filter(|d| d.severity == Severity::Error)
    }
}

impl fmt::Display for CompileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for message in &self.messages {
            writeln!(f, "{message}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_keep_success() {
        let mut report = CompileReport::new();
        report
            .add(Diagnostic {
                severity: Severity::Warning,
                message: "unused".into(),
                file: None,
                pos: None,
            })
            .unwrap();
        assert!(report.success());
        report.error("boom", Some("main.h64"), Some(SourcePos::new(3, 7))).unwrap();
        assert!(!report.success());
        assert_eq!(report.messages()[1].to_string(), "main.h64:3:7: error: boom");
    }
}
