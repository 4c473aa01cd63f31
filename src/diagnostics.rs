//! Per-architecture warning accumulator.
//!
//! Warnings are logged as they are raised and also retained, so a caller can
//! report them again in the per-architecture summary.

use tracing::warn;

/// Warnings collected while processing one architecture.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    arch: String,
    warnings: Vec<String>,
}

impl Diagnostics {
    /// Creates an empty accumulator tagged with an architecture name.
    pub fn new(arch: &str) -> Self {
        Self {
            arch: arch.to_string(),
            warnings: Vec::new(),
        }
    }

    /// Records and logs a warning.
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{}: {}", self.arch, message);
        self.warnings.push(message);
    }

    /// Returns all warnings in the order raised.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Returns true if nothing was reported.
    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }

    /// Moves the warnings out.
    pub fn take(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulates_in_order() {
        let mut diag = Diagnostics::new("x86_64");
        assert!(diag.is_empty());
        diag.warn("first");
        diag.warn(format!("second {}", 2));
        assert_eq!(diag.warnings(), ["first", "second 2"]);
        assert_eq!(diag.take().len(), 2);
        assert!(diag.is_empty());
    }
}
