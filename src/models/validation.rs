use serde::Serialize;
use std::collections::BTreeMap;

/// Which validation pass produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPass {
    Chain,
    Schema,
    Endpoint,
    Combined,
}

/// A single failed rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    /// Offending object, e.g. `query 'get_trades_by_symbol'`
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.database {
            Some(db) => write!(f, "[{}] {}: {}", db, self.subject, self.message),
            None => write!(f, "{}: {}", self.subject, self.message),
        }
    }
}

/// Outcome of one validation run. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pass: ValidationPass,
    successes: Vec<String>,
    errors: Vec<ValidationIssue>,
    warnings: Vec<String>,
}

impl ValidationResult {
    pub fn pass(&self) -> ValidationPass {
        self.pass
    }

    pub fn successes(&self) -> &[String] {
        &self.successes
    }

    pub fn errors(&self) -> &[ValidationIssue] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Errors grouped by the database they concern; unscoped errors go under `""`
    pub fn errors_by_database(&self) -> BTreeMap<&str, Vec<&ValidationIssue>> {
        let mut grouped: BTreeMap<&str, Vec<&ValidationIssue>> = BTreeMap::new();
        for issue in &self.errors {
            grouped
                .entry(issue.database.as_deref().unwrap_or(""))
                .or_default()
                .push(issue);
        }
        grouped
    }

    /// Combine two results into a new one, preserving order
    pub fn merge(&self, other: &ValidationResult) -> ValidationResult {
        ValidationResult {
            pass: ValidationPass::Combined,
            successes: self.successes.iter().chain(&other.successes).cloned().collect(),
            errors: self.errors.iter().chain(&other.errors).cloned().collect(),
            warnings: self.warnings.iter().chain(&other.warnings).cloned().collect(),
        }
    }

    /// Log the result the way startup and validate-only mode report it
    pub fn log(&self) {
        for warning in &self.warnings {
            tracing::warn!("validation warning: {}", warning);
        }
        for (database, issues) in self.errors_by_database() {
            for issue in issues {
                if database.is_empty() {
                    tracing::error!("validation error: {}: {}", issue.subject, issue.message);
                } else {
                    tracing::error!("validation error [{}]: {}: {}", database, issue.subject, issue.message);
                }
            }
        }
        tracing::info!(
            "{:?} validation finished: {} passed, {} errors, {} warnings",
            self.pass,
            self.successes.len(),
            self.errors.len(),
            self.warnings.len()
        );
    }
}

/// Accumulates findings during a run, then freezes into a [`ValidationResult`]
#[derive(Debug)]
pub struct ValidationReport {
    pass: ValidationPass,
    successes: Vec<String>,
    errors: Vec<ValidationIssue>,
    warnings: Vec<String>,
}

impl ValidationReport {
    pub fn new(pass: ValidationPass) -> Self {
        Self {
            pass,
            successes: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn success(&mut self, message: impl Into<String>) {
        self.successes.push(message.into());
    }

    pub fn error(&mut self, subject: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationIssue {
            subject: subject.into(),
            database: None,
            message: message.into(),
        });
    }

    pub fn database_error(
        &mut self,
        database: impl Into<String>,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.errors.push(ValidationIssue {
            subject: subject.into(),
            database: Some(database.into()),
            message: message.into(),
        });
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn finish(self) -> ValidationResult {
        ValidationResult {
            pass: self.pass,
            successes: self.successes,
            errors: self.errors,
            warnings: self.warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grouping_by_database() {
        let mut report = ValidationReport::new(ValidationPass::Schema);
        report.database_error("b", "query 'x'", "bad");
        report.database_error("a", "query 'y'", "bad");
        report.database_error("a", "query 'z'", "bad");
        report.error("endpoint 'e'", "broken");
        let result = report.finish();

        let grouped = result.errors_by_database();
        assert_eq!(grouped["a"].len(), 2);
        assert_eq!(grouped["b"].len(), 1);
        assert_eq!(grouped[""].len(), 1);
        assert!(!result.is_valid());
    }

    #[test]
    fn test_merge_preserves_order() {
        let mut first = ValidationReport::new(ValidationPass::Chain);
        first.success("one");
        let mut second = ValidationReport::new(ValidationPass::Schema);
        second.success("two");
        second.warning("careful");

        let merged = first.finish().merge(&second.finish());
        assert_eq!(merged.pass(), ValidationPass::Combined);
        assert_eq!(merged.successes(), &["one".to_string(), "two".to_string()]);
        assert_eq!(merged.warnings().len(), 1);
        assert!(merged.is_valid());
    }
}
