//! Accumulating validation: every violation is collected with its location so
//! that an operator can fix a whole file in one pass.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// JSON pointer of the offending value, empty for the document root.
    pub location: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{summary}:{}", render(.violations))]
pub struct ValidationErrors {
    pub summary: String,
    pub violations: Vec<Violation>,
}

fn render(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| {
            let location = if v.location.is_empty() {
                "<root>"
            } else {
                v.location.as_str()
            };
            format!("\n{}: {}", location, v.message)
        })
        .collect()
}

/// Collects violations while walking a document.
#[derive(Debug, Default)]
pub struct ValidationContext {
    violations: Vec<Violation>,
}

impl ValidationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at<'a>(&'a mut self, segments: &[&str]) -> Location<'a> {
        let mut pointer = String::new();
        for s in segments {
            pointer.push('/');
            pointer.push_str(&s.replace('~', "~0").replace('/', "~1"));
        }
        Location { ctx: self, pointer }
    }

    pub fn emit(&mut self, message: impl Into<String>) {
        self.at(&[]).emit(message);
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    /// `Ok(())` when nothing was emitted, otherwise every violation under one summary.
    pub fn finish(self, summary: &str) -> Result<(), ValidationErrors> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors {
                summary: summary.to_string(),
                violations: self.violations,
            })
        }
    }
}

pub struct Location<'a> {
    ctx: &'a mut ValidationContext,
    pointer: String,
}

impl Location<'_> {
    pub fn emit(self, message: impl Into<String>) {
        self.ctx.violations.push(Violation {
            location: self.pointer,
            message: message.into(),
        });
    }
}
