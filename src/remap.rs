//! Adapting saved filters to datasets with different column names.
//!
//! Fields the target dataset already has are kept verbatim. For the rest a
//! [`SuggestionSource`] proposes target columns; every proposal is checked
//! locally (the column must exist, accept every operator the filter applies
//! to the field, and not already be claimed by another field). Nothing is
//! rewritten until every field is either verbatim, auto-accepted above the
//! confidence threshold, or confirmed by the caller.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    cohort::SavedFilter,
    data::normalize_column_name,
    error::{EngineError, EngineResult, IssueKind, ValidationIssue},
    filter::{FilterGroup, Operator},
    schema::{Column, ColumnType, MasterDataset},
};

pub const DEFAULT_AUTO_ACCEPT: f64 = 0.8;
pub const DEFAULT_SUGGESTION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub source_field: String,
    pub suggested_target_field: String,
    pub confidence: f64,
}

/// Proposes target columns for source fields. Output is advisory only.
pub trait SuggestionSource: Send + Sync {
    fn suggest(&self, source: &[String], target: &[String]) -> EngineResult<Vec<Suggestion>>;
}

/// Name-similarity heuristic over normalized column names.
///
/// Identical normalized names score 1.0, names whose word tokens contain one
/// another score between 0.75 and 1.0, anything else scores its character
/// similarity ratio.
#[derive(Debug, Clone, Copy)]
pub struct SimilaritySuggester {
    pub min_confidence: f64,
}

impl Default for SimilaritySuggester {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
        }
    }
}

impl SimilaritySuggester {
    pub fn score(source: &str, target: &str) -> f64 {
        let a = normalize_column_name(source);
        let b = normalize_column_name(target);
        if a == b {
            return 1.0;
        }
        let a_tokens: BTreeSet<&str> = a.split('_').filter(|t| !t.is_empty()).collect();
        let b_tokens: BTreeSet<&str> = b.split('_').filter(|t| !t.is_empty()).collect();
        if !a_tokens.is_empty()
            && !b_tokens.is_empty()
            && (a_tokens.is_subset(&b_tokens) || b_tokens.is_subset(&a_tokens))
        {
            let shared = a_tokens.intersection(&b_tokens).count() as f64;
            let larger = a_tokens.len().max(b_tokens.len()) as f64;
            return 0.75 + 0.25 * shared / larger;
        }
        f64::from(similar::TextDiff::from_chars(a.as_str(), b.as_str()).ratio())
    }
}

impl SuggestionSource for SimilaritySuggester {
    fn suggest(&self, source: &[String], target: &[String]) -> EngineResult<Vec<Suggestion>> {
        let mut out = Vec::new();
        for field in source {
            for candidate in target {
                let confidence = Self::score(field, candidate);
                if confidence >= self.min_confidence {
                    out.push(Suggestion {
                        source_field: field.clone(),
                        suggested_target_field: candidate.clone(),
                        confidence,
                    });
                }
            }
        }
        Ok(out)
    }
}

#[derive(Debug)]
pub enum SuggestionOutcome {
    Ready(Vec<Suggestion>),
    TimedOut,
    Failed(EngineError),
}

/// Runs `source` on a worker thread and waits at most `timeout`.
///
/// A late answer is discarded; the worker is left to finish on its own.
pub fn suggest_with_timeout(
    source: Arc<dyn SuggestionSource>,
    fields: Vec<String>,
    targets: Vec<String>,
    timeout: Duration,
) -> SuggestionOutcome {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(source.suggest(&fields, &targets));
    });
    match rx.recv_timeout(timeout) {
        Ok(Ok(suggestions)) => SuggestionOutcome::Ready(suggestions),
        Ok(Err(err)) => SuggestionOutcome::Failed(err),
        Err(_) => SuggestionOutcome::TimedOut,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    /// Field exists in the target under the same name.
    Verbatim,
    /// Valid suggestion at or above the auto-accept threshold.
    Accepted,
    /// Valid suggestion below the threshold, awaiting confirmation.
    NeedsConfirmation,
    /// Confirmed or supplied by the caller.
    Confirmed,
    /// No valid target; manual mapping required.
    Unresolved,
}

impl MappingStatus {
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            MappingStatus::Verbatim | MappingStatus::Accepted | MappingStatus::Confirmed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "reason")]
pub enum RejectReason {
    UnknownTarget,
    IncompatibleType {
        operator: String,
        actual: ColumnType,
    },
    DuplicateTarget {
        claimed_by: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedSuggestion {
    pub target_field: String,
    pub confidence: f64,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    pub source_field: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_type: Option<ColumnType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub status: MappingStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedSuggestion>,
}

#[derive(Debug, Clone, Copy)]
pub struct RemapOptions {
    pub auto_accept: f64,
    pub timeout: Duration,
}

impl Default for RemapOptions {
    fn default() -> Self {
        Self {
            auto_accept: DEFAULT_AUTO_ACCEPT,
            timeout: DEFAULT_SUGGESTION_TIMEOUT,
        }
    }
}

/// Proposed field mappings for one saved filter against one dataset.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemapPlan {
    mappings: Vec<FieldMapping>,
    pub suggestions_timed_out: bool,
    #[serde(skip)]
    required_ops: BTreeMap<String, BTreeSet<Operator>>,
    #[serde(skip)]
    target_columns: Vec<Column>,
}

/// Builds a mapping plan for `saved` against `target`.
pub fn plan_remap(
    saved: &SavedFilter,
    target: &MasterDataset,
    suggester: Option<Arc<dyn SuggestionSource>>,
    options: &RemapOptions,
) -> RemapPlan {
    let required_ops = saved.filter.operators_by_field();
    let source_types: HashMap<&str, ColumnType> = saved
        .source_columns
        .iter()
        .map(|c| (c.name.as_str(), c.column_type))
        .collect();
    let mut plan = RemapPlan {
        mappings: Vec::new(),
        suggestions_timed_out: false,
        required_ops,
        target_columns: target.columns.clone(),
    };

    let mut missing = Vec::new();
    for field in plan.required_ops.keys() {
        let verbatim = target.column(field).is_some();
        plan.mappings.push(FieldMapping {
            source_field: field.clone(),
            source_type: source_types.get(field.as_str()).copied(),
            target_field: verbatim.then(|| field.clone()),
            confidence: verbatim.then_some(1.0),
            status: if verbatim {
                MappingStatus::Verbatim
            } else {
                MappingStatus::Unresolved
            },
            rejected: Vec::new(),
        });
        if !verbatim {
            missing.push(field.clone());
        }
    }
    if missing.is_empty() {
        return plan;
    }
    let Some(suggester) = suggester else {
        return plan;
    };

    let suggestions = match suggest_with_timeout(
        suggester,
        missing.clone(),
        target.headers(),
        options.timeout,
    ) {
        SuggestionOutcome::Ready(suggestions) => suggestions,
        SuggestionOutcome::TimedOut => {
            warn!(
                "Mapping suggestions timed out after {:?}; {} field(s) need manual mapping",
                options.timeout,
                missing.len()
            );
            plan.suggestions_timed_out = true;
            return plan;
        }
        SuggestionOutcome::Failed(err) => {
            warn!("Mapping suggestions failed: {err}; falling back to manual mapping");
            return plan;
        }
    };
    debug!("Received {} mapping suggestion(s)", suggestions.len());
    plan.resolve_suggestions(&missing, suggestions, options.auto_accept);
    plan
}

impl RemapPlan {
    pub fn mappings(&self) -> &[FieldMapping] {
        &self.mappings
    }

    pub fn mapping(&self, source_field: &str) -> Option<&FieldMapping> {
        self.mappings.iter().find(|m| m.source_field == source_field)
    }

    /// Fields still blocking [`RemapPlan::apply`].
    pub fn unresolved(&self) -> Vec<String> {
        self.mappings
            .iter()
            .filter(|m| !m.status.is_resolved())
            .map(|m| m.source_field.clone())
            .collect()
    }

    fn resolve_suggestions(&mut self, missing: &[String], suggestions: Vec<Suggestion>, auto_accept: f64) {
        let mut by_field: BTreeMap<String, Vec<Suggestion>> = BTreeMap::new();
        for suggestion in suggestions {
            if missing.contains(&suggestion.source_field) && suggestion.confidence.is_finite() {
                by_field
                    .entry(suggestion.source_field.clone())
                    .or_default()
                    .push(suggestion);
            }
        }
        for candidates in by_field.values_mut() {
            candidates.sort_by(|a, b| {
                b.confidence
                    .total_cmp(&a.confidence)
                    .then_with(|| a.suggested_target_field.cmp(&b.suggested_target_field))
            });
            candidates.dedup_by(|a, b| a.suggested_target_field == b.suggested_target_field);
        }

        // Strongest claims first so a weaker duplicate loses the target.
        let mut order: Vec<(&String, f64)> = by_field
            .iter()
            .map(|(field, c)| (field, c.first().map_or(0.0, |s| s.confidence)))
            .collect();
        order.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        for (field, _) in order {
            let candidates = &by_field[field];
            let mut rejected = Vec::new();
            let mut chosen = None;
            for candidate in candidates {
                match self.check_target(field, &candidate.suggested_target_field) {
                    Ok(()) => {
                        chosen = Some(candidate);
                        break;
                    }
                    Err(reason) => rejected.push(RejectedSuggestion {
                        target_field: candidate.suggested_target_field.clone(),
                        confidence: candidate.confidence,
                        reason,
                    }),
                }
            }
            let Some(mapping) = self.mappings.iter_mut().find(|m| &m.source_field == field) else {
                continue;
            };
            mapping.rejected = rejected;
            if let Some(candidate) = chosen {
                mapping.target_field = Some(candidate.suggested_target_field.clone());
                mapping.confidence = Some(candidate.confidence);
                mapping.status = if candidate.confidence >= auto_accept {
                    MappingStatus::Accepted
                } else {
                    MappingStatus::NeedsConfirmation
                };
                info!(
                    "Mapped '{}' -> '{}' ({:.2}, {:?})",
                    field, candidate.suggested_target_field, candidate.confidence, mapping.status
                );
            }
        }
    }

    /// Whether `target` may stand in for `field`.
    fn check_target(&self, field: &str, target: &str) -> Result<(), RejectReason> {
        let Some(column) = self.target_columns.iter().find(|c| c.name == target) else {
            return Err(RejectReason::UnknownTarget);
        };
        let incompatible = self
            .required_ops
            .get(field)
            .and_then(|ops| ops.iter().find(|op| !op.accepts(column.column_type)));
        if let Some(op) = incompatible {
            return Err(RejectReason::IncompatibleType {
                operator: op.to_string(),
                actual: column.column_type,
            });
        }
        if let Some(owner) = self.mappings.iter().find(|m| {
            m.source_field != field
                && m.target_field.as_deref() == Some(target)
                && m.status != MappingStatus::Unresolved
        }) {
            return Err(RejectReason::DuplicateTarget {
                claimed_by: owner.source_field.clone(),
            });
        }
        Ok(())
    }

    /// Maps `source_field` to `target_field` on the caller's authority.
    ///
    /// The mapping is validated like any suggestion.
    pub fn confirm(&mut self, source_field: &str, target_field: &str) -> EngineResult<()> {
        let issue = |kind| ValidationIssue::new(None, Some(source_field), kind);
        if self.mapping(source_field).is_none() {
            return Err(EngineError::validation(vec![issue(IssueKind::UnknownField)]));
        }
        if let Err(reason) = self.check_target(source_field, target_field) {
            let kind = match reason {
                RejectReason::UnknownTarget => IssueKind::UnknownField,
                RejectReason::IncompatibleType { operator, actual } => {
                    let expected = Operator::parse(&operator)
                        .compatible_types()
                        .unwrap_or_default()
                        .to_vec();
                    IssueKind::IncompatibleType {
                        operator,
                        expected,
                        actual,
                    }
                }
                RejectReason::DuplicateTarget { claimed_by } => IssueKind::DuplicateTarget {
                    target: target_field.to_string(),
                    claimed_by,
                },
            };
            return Err(EngineError::validation(vec![issue(kind)]));
        }
        if let Some(mapping) = self
            .mappings
            .iter_mut()
            .find(|m| m.source_field == source_field)
        {
            if mapping.status == MappingStatus::Verbatim && target_field == source_field {
                return Ok(());
            }
            mapping.target_field = Some(target_field.to_string());
            mapping.status = MappingStatus::Confirmed;
        }
        Ok(())
    }

    /// Confirms every valid suggestion that was below the threshold.
    pub fn confirm_suggested(&mut self) {
        for mapping in &mut self.mappings {
            if mapping.status == MappingStatus::NeedsConfirmation {
                mapping.status = MappingStatus::Confirmed;
            }
        }
    }

    /// Rewrites the fields of `filter` according to the resolved mappings.
    ///
    /// Fails with [`EngineError::UnresolvedMapping`] while any field is
    /// unresolved or awaiting confirmation.
    pub fn apply(&self, filter: &FilterGroup) -> EngineResult<FilterGroup> {
        let unresolved = self.unresolved();
        if !unresolved.is_empty() {
            return Err(EngineError::UnresolvedMapping { fields: unresolved });
        }
        let rename = self
            .mappings
            .iter()
            .filter_map(|m| {
                let target = m.target_field.as_ref()?;
                (target != &m.source_field).then(|| (m.source_field.clone(), target.clone()))
            })
            .collect::<BTreeMap<_, _>>();
        let mut adapted = filter.clone();
        adapted.rename_fields(&rename);
        Ok(adapted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        filter::FilterRule,
        schema::{PatientIdSource, StorageRef},
    };
    use chrono::Utc;
    use serde_json::json;
    use std::path::PathBuf;

    fn target(columns: Vec<Column>) -> MasterDataset {
        MasterDataset {
            id: "target".into(),
            name: "target".into(),
            columns,
            row_count: 0,
            patient_count: 0,
            patient_id: PatientIdSource::RowIndex,
            storage: StorageRef {
                path: PathBuf::from("t.csv"),
                delimiter: b',',
                encoding: "utf-8".into(),
                fingerprint: String::new(),
            },
            created_at: Utc::now(),
            derived_from: None,
            snapshot_version: None,
        }
    }

    fn saved(rules: Vec<FilterRule>) -> SavedFilter {
        SavedFilter::new(
            "saved",
            FilterGroup::and(rules.into_iter().map(Into::into).collect()),
            vec![Column::new("patient_age", ColumnType::Number)],
        )
    }

    struct Fixed(Vec<Suggestion>);

    impl SuggestionSource for Fixed {
        fn suggest(&self, _: &[String], _: &[String]) -> EngineResult<Vec<Suggestion>> {
            Ok(self.0.clone())
        }
    }

    struct Slow;

    impl SuggestionSource for Slow {
        fn suggest(&self, _: &[String], _: &[String]) -> EngineResult<Vec<Suggestion>> {
            thread::sleep(Duration::from_millis(500));
            Ok(Vec::new())
        }
    }

    fn suggestion(source: &str, target: &str, confidence: f64) -> Suggestion {
        Suggestion {
            source_field: source.into(),
            suggested_target_field: target.into(),
            confidence,
        }
    }

    #[test]
    fn similarity_scores_token_containment_highly() {
        assert_eq!(SimilaritySuggester::score("Patient Age", "patient_age"), 1.0);
        assert_eq!(SimilaritySuggester::score("patient_age", "age"), 0.875);
        assert!(SimilaritySuggester::score("patient_age", "zip") < 0.5);
    }

    #[test]
    fn heuristic_remap_rewrites_patient_age_to_age() {
        let saved = saved(vec![FilterRule::new("patient_age", Operator::Gte, json!(18))]);
        let target = target(vec![
            Column::new("id", ColumnType::String),
            Column::new("age", ColumnType::Number),
        ]);
        let mut plan = plan_remap(
            &saved,
            &target,
            Some(Arc::new(SimilaritySuggester::default())),
            &RemapOptions::default(),
        );
        let mapping = plan.mapping("patient_age").unwrap();
        assert_eq!(mapping.target_field.as_deref(), Some("age"));
        assert_eq!(mapping.status, MappingStatus::Accepted);

        plan.confirm_suggested();
        let adapted = plan.apply(&saved.filter).unwrap();
        assert_eq!(adapted.leaf_rules()[0].field, "age");
    }

    #[test]
    fn incompatible_and_unknown_targets_are_rejected() {
        let saved = saved(vec![FilterRule::new("weight_kg", Operator::Gt, json!(80))]);
        let target = target(vec![
            Column::new("weight_band", ColumnType::Categorical),
            Column::new("weight", ColumnType::Number),
        ]);
        let source = Fixed(vec![
            suggestion("weight_kg", "weight_band", 0.95),
            suggestion("weight_kg", "ghost", 0.9),
            suggestion("weight_kg", "weight", 0.6),
        ]);
        let plan = plan_remap(&saved, &target, Some(Arc::new(source)), &RemapOptions::default());
        let mapping = plan.mapping("weight_kg").unwrap();
        assert_eq!(mapping.target_field.as_deref(), Some("weight"));
        assert_eq!(mapping.status, MappingStatus::NeedsConfirmation);
        assert_eq!(mapping.rejected.len(), 2);
        assert!(matches!(
            mapping.rejected[0].reason,
            RejectReason::IncompatibleType { actual: ColumnType::Categorical, .. }
        ));
        assert_eq!(mapping.rejected[1].reason, RejectReason::UnknownTarget);

        let err = plan.apply(&saved.filter).unwrap_err();
        assert!(matches!(err, EngineError::UnresolvedMapping { ref fields } if fields == &["weight_kg"]));
    }

    #[test]
    fn weaker_duplicate_claims_lose_the_target() {
        let saved = saved(vec![
            FilterRule::new("dx_primary", Operator::Equals, json!("flu")),
            FilterRule::new("dx_code", Operator::Equals, json!("J10")),
        ]);
        let target = target(vec![Column::new("diagnosis", ColumnType::Categorical)]);
        let source = Fixed(vec![
            suggestion("dx_code", "diagnosis", 0.7),
            suggestion("dx_primary", "diagnosis", 0.9),
        ]);
        let plan = plan_remap(&saved, &target, Some(Arc::new(source)), &RemapOptions::default());
        assert_eq!(plan.mapping("dx_primary").unwrap().status, MappingStatus::Accepted);
        let loser = plan.mapping("dx_code").unwrap();
        assert_eq!(loser.status, MappingStatus::Unresolved);
        assert_eq!(
            loser.rejected[0].reason,
            RejectReason::DuplicateTarget {
                claimed_by: "dx_primary".into()
            }
        );
    }

    #[test]
    fn verbatim_targets_cannot_be_claimed_again() {
        let saved = saved(vec![
            FilterRule::new("age", Operator::Gte, json!(18)),
            FilterRule::new("patient_age", Operator::Lte, json!(65)),
        ]);
        let target = target(vec![Column::new("age", ColumnType::Number)]);
        let mut plan = plan_remap(
            &saved,
            &target,
            Some(Arc::new(SimilaritySuggester::default())),
            &RemapOptions::default(),
        );
        assert_eq!(plan.mapping("age").unwrap().status, MappingStatus::Verbatim);
        assert_eq!(plan.mapping("patient_age").unwrap().status, MappingStatus::Unresolved);
        let err = plan.confirm("patient_age", "age").unwrap_err();
        assert!(matches!(
            err.issues()[0].kind,
            IssueKind::DuplicateTarget { .. }
        ));
    }

    #[test]
    fn timeout_falls_back_to_manual_mapping() {
        let saved = saved(vec![FilterRule::new("patient_age", Operator::Gte, json!(18))]);
        let target = target(vec![Column::new("age", ColumnType::Number)]);
        let options = RemapOptions {
            timeout: Duration::from_millis(20),
            ..RemapOptions::default()
        };
        let mut plan = plan_remap(&saved, &target, Some(Arc::new(Slow)), &options);
        assert!(plan.suggestions_timed_out);
        assert_eq!(plan.unresolved(), vec!["patient_age".to_string()]);

        plan.confirm("patient_age", "age").unwrap();
        let adapted = plan.apply(&saved.filter).unwrap();
        assert_eq!(adapted.leaf_rules()[0].field, "age");
    }

    #[test]
    fn manual_confirmation_is_validated() {
        let saved = saved(vec![FilterRule::new("patient_age", Operator::Gte, json!(18))]);
        let target = target(vec![Column::new("age_band", ColumnType::Categorical)]);
        let mut plan = plan_remap(&saved, &target, None, &RemapOptions::default());
        let err = plan.confirm("patient_age", "age_band").unwrap_err();
        assert!(matches!(
            err.issues()[0].kind,
            IssueKind::IncompatibleType { actual: ColumnType::Categorical, .. }
        ));
        assert!(plan.confirm("patient_age", "missing").is_err());
    }
}
