//! Cohort comparison: per-cohort statistics, pairwise overlap and aggregates.
//!
//! Comparison never mutates a cohort. Results are ordered by cohort id so
//! the same set of cohorts always yields the same document, whichever order
//! the caller listed them in.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::{
    activity::{ActivityAction, ActivityEvent, ActivitySink},
    cohort::Cohort,
    error::{
        EngineError, EngineResult, IssueKind, MAX_COMPARISON_COHORTS, MIN_COMPARISON_COHORTS,
        ValidationIssue,
    },
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortStat {
    pub cohort_id: String,
    pub name: String,
    pub patient_count: usize,
    pub master_patient_count: usize,
    pub match_rate: f64,
    pub filter_rule_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairwiseOverlap {
    pub cohort_a: String,
    pub cohort_b: String,
    pub overlap: usize,
    pub unique_a: usize,
    pub unique_b: usize,
    pub overlap_percent: f64,
}

impl PairwiseOverlap {
    pub fn between(a: &Cohort, b: &Cohort) -> Self {
        let (ids_a, ids_b) = (&a.filtered_patient_ids, &b.filtered_patient_ids);
        let overlap = ids_a.intersection(ids_b).count();
        Self {
            cohort_a: a.id.clone(),
            cohort_b: b.id.clone(),
            overlap,
            unique_a: ids_a.len() - overlap,
            unique_b: ids_b.len() - overlap,
            overlap_percent: overlap_percent(overlap, ids_a.len(), ids_b.len()),
        }
    }
}

/// Share of the smaller cohort that also appears in the larger one.
pub fn overlap_percent(overlap: usize, size_a: usize, size_b: usize) -> f64 {
    let smaller = size_a.min(size_b);
    if smaller == 0 {
        0.0
    } else {
        overlap as f64 / smaller as f64 * 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonResult {
    pub id: String,
    pub cohort_ids: Vec<String>,
    pub per_cohort: Vec<CohortStat>,
    pub pairwise: Vec<PairwiseOverlap>,
    pub union_size: usize,
    pub intersection_of_all_size: usize,
    pub computed_at: DateTime<Utc>,
}

/// Patient totals of master datasets, keyed by dataset id.
pub type MasterCounts = HashMap<String, usize>;

fn check_cardinality(cohorts: &[&Cohort]) -> EngineResult<()> {
    if !(MIN_COMPARISON_COHORTS..=MAX_COMPARISON_COHORTS).contains(&cohorts.len()) {
        return Err(EngineError::Cardinality {
            actual: cohorts.len(),
        });
    }
    let issues = cohorts
        .iter()
        .map(|c| c.id.as_str())
        .duplicates()
        .map(|id| ValidationIssue::new(None, None, IssueKind::DuplicateCohort(id.to_string())))
        .collect::<Vec<_>>();
    if issues.is_empty() {
        Ok(())
    } else {
        Err(EngineError::validation(issues))
    }
}

/// Compares 2 to 5 distinct cohorts.
pub fn compare(cohorts: &[&Cohort], master_counts: &MasterCounts) -> EngineResult<ComparisonResult> {
    check_cardinality(cohorts)?;
    let mut ordered = cohorts.to_vec();
    ordered.sort_by(|a, b| a.id.cmp(&b.id));

    let per_cohort = ordered
        .iter()
        .map(|cohort| {
            let master = *master_counts.get(&cohort.master_dataset_id).ok_or_else(|| {
                EngineError::data_access(
                    format!("comparing cohort '{}'", cohort.id),
                    format!("dataset '{}' is not available", cohort.master_dataset_id),
                )
            })?;
            let match_rate = if master == 0 {
                0.0
            } else {
                cohort.patient_count as f64 / master as f64 * 100.0
            };
            Ok(CohortStat {
                cohort_id: cohort.id.clone(),
                name: cohort.name.clone(),
                patient_count: cohort.patient_count,
                master_patient_count: master,
                match_rate,
                filter_rule_count: cohort.filter.rule_count(),
            })
        })
        .collect::<EngineResult<Vec<_>>>()?;

    let pairwise = ordered
        .iter()
        .tuple_combinations()
        .map(|(a, b)| PairwiseOverlap::between(a, b))
        .collect::<Vec<_>>();

    let union: BTreeSet<&String> = ordered
        .iter()
        .flat_map(|c| c.filtered_patient_ids.iter())
        .collect();
    let intersection_of_all_size = ordered
        .first()
        .map(|first| {
            first
                .filtered_patient_ids
                .iter()
                .filter(|id| {
                    ordered[1..]
                        .iter()
                        .all(|other| other.filtered_patient_ids.contains(*id))
                })
                .count()
        })
        .unwrap_or(0);

    Ok(ComparisonResult {
        id: Uuid::new_v4().to_string(),
        cohort_ids: ordered.iter().map(|c| c.id.clone()).collect(),
        per_cohort,
        pairwise,
        union_size: union.len(),
        intersection_of_all_size,
        computed_at: Utc::now(),
    })
}

type CacheKey = Vec<(String, DateTime<Utc>)>;

fn cache_key(cohorts: &[&Cohort]) -> CacheKey {
    cohorts
        .iter()
        .map(|c| (c.id.clone(), c.updated_at))
        .sorted()
        .collect()
}

/// Comparison results keyed by the participating cohorts and their
/// `updated_at` stamps. A cohort whose filter changes gets a new stamp, so
/// stale entries stop matching; [`ComparisonCache::invalidate`] drops them.
#[derive(Debug, Default)]
pub struct ComparisonCache {
    entries: HashMap<CacheKey, ComparisonResult>,
}

impl ComparisonCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the cached result, computing it on a miss. The flag is true
    /// on a hit.
    pub fn get_or_compute(
        &mut self,
        cohorts: &[&Cohort],
        master_counts: &MasterCounts,
    ) -> EngineResult<(ComparisonResult, bool)> {
        check_cardinality(cohorts)?;
        let key = cache_key(cohorts);
        if let Some(result) = self.entries.get(&key) {
            debug!("Comparison cache hit for {} cohort(s)", key.len());
            return Ok((result.clone(), true));
        }
        let result = compare(cohorts, master_counts)?;
        self.entries.insert(key, result.clone());
        Ok((result, false))
    }

    /// Drops every entry involving `cohort_id`.
    pub fn invalidate(&mut self, cohort_id: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|key, _| !key.iter().any(|(id, _)| id == cohort_id));
        before - self.entries.len()
    }
}

/// Compares through `cache` and records a `comparison_run` event.
pub fn run_comparison(
    cohorts: &[&Cohort],
    master_counts: &MasterCounts,
    cache: &mut ComparisonCache,
    sink: &mut dyn ActivitySink,
) -> EngineResult<ComparisonResult> {
    let (result, cached) = cache.get_or_compute(cohorts, master_counts)?;
    sink.record(
        ActivityEvent::new(ActivityAction::ComparisonRun, &result.id)
            .with_change(
                None,
                Some(json!({
                    "unionSize": result.union_size,
                    "intersectionOfAllSize": result.intersection_of_all_size,
                })),
            )
            .with_metadata(json!({
                "cohortIds": result.cohort_ids,
                "cached": cached,
            })),
    )?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        activity::MemorySink,
        filter::{FilterGroup, FilterRule, Operator},
    };
    use serde_json::json;

    fn cohort(id: &str, ids: impl IntoIterator<Item = usize>) -> Cohort {
        let filtered: BTreeSet<String> = ids.into_iter().map(|i| format!("P{i:04}")).collect();
        let now = Utc::now();
        Cohort {
            id: id.into(),
            name: id.to_uppercase(),
            master_dataset_id: "ds".into(),
            filter: FilterGroup::and(vec![
                FilterRule::new("age", Operator::Gte, json!(18)).into(),
                FilterGroup::or(vec![
                    FilterRule::new("sex", Operator::Equals, json!("F")).into(),
                    FilterRule::new("sex", Operator::Equals, json!("M")).into(),
                ])
                .into(),
            ]),
            patient_count: filtered.len(),
            filtered_patient_ids: filtered,
            created_at: now,
            updated_at: now,
            saved_filter_id: None,
        }
    }

    fn counts() -> MasterCounts {
        HashMap::from([("ds".to_string(), 200)])
    }

    #[test]
    fn overlap_percent_divides_by_smaller_cohort() {
        let a = cohort("a", 0..100);
        let b = cohort("b", 80..120);
        let result = compare(&[&a, &b], &counts()).unwrap();
        let pair = &result.pairwise[0];
        assert_eq!(pair.overlap, 20);
        assert_eq!(pair.unique_a, 80);
        assert_eq!(pair.unique_b, 20);
        assert_eq!(pair.overlap_percent, 50.0);
        assert_eq!(result.union_size, 120);
        assert_eq!(result.intersection_of_all_size, 20);
    }

    #[test]
    fn per_cohort_stats_report_rate_and_leaf_rule_count() {
        let a = cohort("a", 0..50);
        let b = cohort("b", 0..10);
        let result = compare(&[&b, &a], &counts()).unwrap();
        assert_eq!(result.cohort_ids, vec!["a", "b"]);
        assert_eq!(result.per_cohort[0].match_rate, 25.0);
        assert_eq!(result.per_cohort[0].filter_rule_count, 3);
        assert_eq!(result.per_cohort[1].master_patient_count, 200);
    }

    #[test]
    fn empty_cohort_yields_zero_overlap_percent() {
        let a = cohort("a", 0..10);
        let b = cohort("b", std::iter::empty());
        let result = compare(&[&a, &b], &counts()).unwrap();
        assert_eq!(result.pairwise[0].overlap_percent, 0.0);
        assert_eq!(result.intersection_of_all_size, 0);
    }

    #[test]
    fn cardinality_outside_two_to_five_is_rejected() {
        let cohorts: Vec<Cohort> = (0..6).map(|i| cohort(&format!("c{i}"), 0..i)).collect();
        let refs: Vec<&Cohort> = cohorts.iter().collect();
        assert!(matches!(
            compare(&refs[..1], &counts()),
            Err(EngineError::Cardinality { actual: 1 })
        ));
        assert!(matches!(
            compare(&refs, &counts()),
            Err(EngineError::Cardinality { actual: 6 })
        ));
        let five = compare(&refs[..5], &counts()).unwrap();
        assert_eq!(five.pairwise.len(), 10);
    }

    #[test]
    fn duplicate_cohorts_are_rejected() {
        let a = cohort("a", 0..5);
        let err = compare(&[&a, &a], &counts()).unwrap_err();
        assert_eq!(err.issues()[0].kind, IssueKind::DuplicateCohort("a".into()));
    }

    #[test]
    fn missing_master_dataset_is_a_data_access_error() {
        let a = cohort("a", 0..5);
        let b = cohort("b", 0..5);
        let err = compare(&[&a, &b], &MasterCounts::new()).unwrap_err();
        assert!(matches!(err, EngineError::DataAccess { .. }));
    }

    #[test]
    fn cache_hits_until_a_cohort_changes() {
        let a = cohort("a", 0..10);
        let mut b = cohort("b", 5..15);
        let mut cache = ComparisonCache::new();
        let (first, hit) = cache.get_or_compute(&[&a, &b], &counts()).unwrap();
        assert!(!hit);
        let (second, hit) = cache.get_or_compute(&[&b, &a], &counts()).unwrap();
        assert!(hit);
        assert_eq!(first, second);

        b.updated_at += chrono::Duration::seconds(1);
        let (_, hit) = cache.get_or_compute(&[&a, &b], &counts()).unwrap();
        assert!(!hit);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.invalidate("b"), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn run_comparison_records_activity() {
        let a = cohort("a", 0..10);
        let b = cohort("b", 5..15);
        let mut cache = ComparisonCache::new();
        let mut sink = MemorySink::default();
        run_comparison(&[&a, &b], &counts(), &mut cache, &mut sink).unwrap();
        run_comparison(&[&a, &b], &counts(), &mut cache, &mut sink).unwrap();
        assert_eq!(sink.events.len(), 2);
        assert_eq!(sink.events[0].action, ActivityAction::ComparisonRun);
        assert_eq!(sink.events[1].metadata["cached"], true);
    }
}
