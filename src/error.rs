//! Error taxonomy for the cohort engine.
//!
//! Library operations return [`EngineError`] so callers can branch on the
//! failure class and render field-level messages. CLI glue wraps these in
//! `anyhow` with additional context.

use std::fmt;

use thiserror::Error;

use crate::schema::ColumnType;

pub const MIN_COMPARISON_COHORTS: usize = 2;
pub const MAX_COMPARISON_COHORTS: usize = 5;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("filter validation failed: {}", describe_issues(.issues))]
    Validation { issues: Vec<ValidationIssue> },
    #[error(
        "comparison requires between {} and {} cohorts but {actual} were supplied",
        MIN_COMPARISON_COHORTS,
        MAX_COMPARISON_COHORTS
    )]
    Cardinality { actual: usize },
    #[error("unresolved field mapping(s): {}", .fields.join(", "))]
    UnresolvedMapping { fields: Vec<String> },
    #[error("data access failed: {context}")]
    DataAccess {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl EngineError {
    pub fn validation(issues: Vec<ValidationIssue>) -> Self {
        EngineError::Validation { issues }
    }

    pub fn data_access<E>(context: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        EngineError::DataAccess {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Issues carried by a validation failure, empty for other variants.
    pub fn issues(&self) -> &[ValidationIssue] {
        match self {
            EngineError::Validation { issues } => issues,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub rule_id: Option<String>,
    pub field: Option<String>,
    pub kind: IssueKind,
}

impl ValidationIssue {
    pub fn new(rule_id: Option<&str>, field: Option<&str>, kind: IssueKind) -> Self {
        Self {
            rule_id: rule_id.filter(|id| !id.is_empty()).map(str::to_string),
            field: field.filter(|f| !f.is_empty()).map(str::to_string),
            kind,
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.rule_id, &self.field) {
            (Some(rule), Some(field)) => write!(f, "rule '{rule}' on field '{field}': {}", self.kind),
            (Some(rule), None) => write!(f, "rule '{rule}': {}", self.kind),
            (None, Some(field)) => write!(f, "field '{field}': {}", self.kind),
            (None, None) => write!(f, "{}", self.kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IssueKind {
    #[error("unknown operator '{0}'")]
    UnknownOperator(String),
    #[error("column is not present in the dataset")]
    UnknownField,
    #[error("operator '{operator}' expects a {} column but found {actual}", describe_types(.expected))]
    IncompatibleType {
        operator: String,
        expected: Vec<ColumnType>,
        actual: ColumnType,
    },
    #[error("operator '{0}' requires a value")]
    MissingValue(String),
    #[error("'between' requires value2 for the inclusive upper bound")]
    MissingSecondValue,
    #[error("value '{0}' is not numeric")]
    NonNumericValue(String),
    #[error("value '{0}' is not a recognised date")]
    InvalidDate(String),
    #[error("referenced cohort '{0}' is not available")]
    UnknownCohort(String),
    #[error("cohort '{0}' appears more than once")]
    DuplicateCohort(String),
    #[error("target column '{target}' is already mapped from '{claimed_by}'")]
    DuplicateTarget { target: String, claimed_by: String },
    #[error("dataset is still referenced by cohort(s) {}", .0.join(", "))]
    DatasetInUse(Vec<String>),
}

fn describe_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn describe_types(types: &[ColumnType]) -> String {
    types
        .iter()
        .map(|ty| ty.as_str())
        .collect::<Vec<_>>()
        .join(" or ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_lists_every_issue() {
        let err = EngineError::validation(vec![
            ValidationIssue::new(Some("r1"), Some("age"), IssueKind::MissingSecondValue),
            ValidationIssue::new(
                Some("r2"),
                Some("bmi"),
                IssueKind::UnknownOperator("near".into()),
            ),
        ]);
        let message = err.to_string();
        assert!(message.contains("rule 'r1' on field 'age'"));
        assert!(message.contains("unknown operator 'near'"));
        assert_eq!(err.issues().len(), 2);
    }

    #[test]
    fn incompatible_type_names_expected_and_actual() {
        let kind = IssueKind::IncompatibleType {
            operator: "gte".into(),
            expected: vec![ColumnType::Number, ColumnType::Date],
            actual: ColumnType::Categorical,
        };
        assert_eq!(
            kind.to_string(),
            "operator 'gte' expects a number or date column but found categorical"
        );
    }

    #[test]
    fn cardinality_message_names_bounds() {
        let err = EngineError::Cardinality { actual: 6 };
        assert!(err.to_string().contains("between 2 and 5"));
        assert!(err.issues().is_empty());
    }
}
