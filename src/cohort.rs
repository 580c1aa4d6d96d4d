//! Cohort materialization and lifecycle.
//!
//! Materializing a filter streams every record of a dataset snapshot through
//! a [`CompiledFilter`] and keeps the patient ids of matching records. A
//! [`Cohort`] stores the result together with the filter that produced it;
//! editing the filter re-materializes and swaps the result in one step,
//! emitting a `filter_changed` audit event with the count delta and the
//! rules that changed.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::{
    activity::{ActivityAction, ActivityEvent, ActivitySink},
    error::{EngineError, EngineResult},
    filter::{CohortLookup, CompiledFilter, FilterGroup, FilterRule},
    schema::{Column, MasterDataset},
    source::{DatasetSource, FieldIndex, RecordView},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Materialization {
    pub filtered_patient_ids: BTreeSet<String>,
    pub patient_count: usize,
    pub rows_scanned: usize,
    pub rows_matched: usize,
    /// Matching rows dropped for lack of a patient identifier.
    pub rows_without_id: usize,
}

/// Applies `filter` to every record of `dataset`.
///
/// The filter is validated before the first row is read. Matching records
/// without a patient identifier are counted but contribute no patient.
pub fn materialize(
    dataset: &MasterDataset,
    source: &dyn DatasetSource,
    filter: &FilterGroup,
    cohorts: &dyn CohortLookup,
) -> EngineResult<Materialization> {
    let compiled = CompiledFilter::compile(filter, &dataset.columns, cohorts)?;
    let index = FieldIndex::new(dataset);
    let mut ids = BTreeSet::new();
    let mut rows_scanned = 0usize;
    let mut rows_matched = 0usize;
    let mut rows_without_id = 0usize;
    for record in source.rows(dataset)? {
        let record = record?;
        rows_scanned += 1;
        let view = index.view(&record);
        if !compiled.matches(&view) {
            continue;
        }
        rows_matched += 1;
        match view.patient_id() {
            Some(id) => {
                ids.insert(id.to_string());
            }
            None => rows_without_id += 1,
        }
    }
    if rows_without_id > 0 {
        warn!(
            "{rows_without_id} matching row(s) of dataset '{}' have no patient identifier",
            dataset.id
        );
    }
    info!(
        "Materialized {} patient(s) from {rows_matched}/{rows_scanned} row(s) of dataset '{}' ({} rule(s))",
        ids.len(),
        dataset.id,
        compiled.rule_count()
    );
    Ok(Materialization {
        patient_count: ids.len(),
        filtered_patient_ids: ids,
        rows_scanned,
        rows_matched,
        rows_without_id,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cohort {
    pub id: String,
    pub name: String,
    pub master_dataset_id: String,
    pub filter: FilterGroup,
    pub filtered_patient_ids: BTreeSet<String>,
    pub patient_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_filter_id: Option<String>,
}

/// Rule-level difference between two filter trees, keyed by rule id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDelta {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
    /// Group logic or negation changed without any rule changing.
    pub structure_changed: bool,
}

impl RuleDelta {
    pub fn between(previous: &FilterGroup, next: &FilterGroup) -> Self {
        let before = rules_by_id(previous);
        let after = rules_by_id(next);
        let added = after
            .keys()
            .filter(|id| !before.contains_key(*id))
            .cloned()
            .collect::<Vec<_>>();
        let removed = before
            .keys()
            .filter(|id| !after.contains_key(*id))
            .cloned()
            .collect::<Vec<_>>();
        let modified = after
            .iter()
            .filter(|(id, rule)| before.get(*id).is_some_and(|old| old != *rule))
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        let structure_changed = added.is_empty()
            && removed.is_empty()
            && modified.is_empty()
            && !previous.same_shape(next);
        Self {
            added,
            removed,
            modified,
            structure_changed,
        }
    }
}

fn rules_by_id(group: &FilterGroup) -> BTreeMap<String, &FilterRule> {
    group
        .leaf_rules()
        .into_iter()
        .map(|rule| (rule.id.clone(), rule))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterChange {
    pub previous_count: usize,
    pub new_count: usize,
    pub rules: RuleDelta,
}

impl Cohort {
    /// Materializes `filter` against `dataset` into a new cohort.
    pub fn create(
        name: impl Into<String>,
        dataset: &MasterDataset,
        source: &dyn DatasetSource,
        mut filter: FilterGroup,
        cohorts: &dyn CohortLookup,
        sink: &mut dyn ActivitySink,
    ) -> EngineResult<Cohort> {
        filter.assign_missing_ids();
        let result = materialize(dataset, source, &filter, cohorts)?;
        let now = Utc::now();
        let cohort = Cohort {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            master_dataset_id: dataset.id.clone(),
            filter,
            filtered_patient_ids: result.filtered_patient_ids,
            patient_count: result.patient_count,
            created_at: now,
            updated_at: now,
            saved_filter_id: None,
        };
        sink.record(
            ActivityEvent::new(ActivityAction::CohortCreated, &cohort.id)
                .with_change(None, Some(json!({ "patientCount": cohort.patient_count })))
                .with_metadata(json!({
                    "name": cohort.name,
                    "datasetId": cohort.master_dataset_id,
                    "ruleCount": cohort.filter.rule_count(),
                })),
        )?;
        Ok(cohort)
    }

    /// Creates a cohort from a saved filter already adapted to `dataset`.
    pub fn create_from_saved(
        name: impl Into<String>,
        dataset: &MasterDataset,
        source: &dyn DatasetSource,
        saved: &mut SavedFilter,
        adapted: FilterGroup,
        cohorts: &dyn CohortLookup,
        sink: &mut dyn ActivitySink,
    ) -> EngineResult<Cohort> {
        let mut cohort = Cohort::create(name, dataset, source, adapted, cohorts, sink)?;
        cohort.saved_filter_id = Some(saved.id.clone());
        saved.record_use();
        Ok(cohort)
    }

    /// Replaces the filter and re-materializes.
    ///
    /// Nothing changes when `filter` has the same shape as the current one,
    /// ids aside. Otherwise id-less rules inherit the ids of the rules they
    /// replace, then the new patient set is computed and the audit event
    /// recorded before the cohort is touched, so a failure leaves it exactly
    /// as it was.
    pub fn update_filter(
        &mut self,
        mut filter: FilterGroup,
        dataset: &MasterDataset,
        source: &dyn DatasetSource,
        cohorts: &dyn CohortLookup,
        sink: &mut dyn ActivitySink,
    ) -> EngineResult<Option<FilterChange>> {
        if dataset.id != self.master_dataset_id {
            return Err(EngineError::data_access(
                format!("updating cohort '{}'", self.id),
                format!(
                    "cohort belongs to dataset '{}' but '{}' was supplied",
                    self.master_dataset_id, dataset.id
                ),
            ));
        }
        if filter.same_shape(&self.filter) {
            debug!("Filter for cohort '{}' unchanged; skipping", self.id);
            return Ok(None);
        }
        filter.inherit_ids(&self.filter);
        filter.assign_missing_ids();
        let result = materialize(dataset, source, &filter, cohorts)?;
        let change = FilterChange {
            previous_count: self.patient_count,
            new_count: result.patient_count,
            rules: RuleDelta::between(&self.filter, &filter),
        };
        sink.record(
            ActivityEvent::new(ActivityAction::FilterChanged, &self.id)
                .with_change(
                    serde_json::to_value(&self.filter).ok(),
                    serde_json::to_value(&filter).ok(),
                )
                .with_metadata(json!({
                    "previousCount": change.previous_count,
                    "newCount": change.new_count,
                    "changedRules": change.rules,
                })),
        )?;

        self.filter = filter;
        self.filtered_patient_ids = result.filtered_patient_ids;
        self.patient_count = result.patient_count;
        self.updated_at = Utc::now();
        info!(
            "Cohort '{}' re-materialized: {} -> {} patient(s)",
            self.id, change.previous_count, change.new_count
        );
        Ok(Some(change))
    }
}

/// A filter kept independently of any dataset for replay elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedFilter {
    pub id: String,
    pub name: String,
    pub filter: FilterGroup,
    pub source_columns: Vec<Column>,
    #[serde(default)]
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
}

impl SavedFilter {
    pub fn new(name: impl Into<String>, mut filter: FilterGroup, source_columns: Vec<Column>) -> Self {
        filter.assign_missing_ids();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            filter,
            source_columns,
            usage_count: 0,
            created_at: Utc::now(),
        }
    }

    /// Saves `filter` with the columns of the dataset it was built against.
    pub fn from_dataset(name: impl Into<String>, filter: FilterGroup, dataset: &MasterDataset) -> Self {
        Self::new(name, filter, dataset.columns.clone())
    }

    pub fn record_use(&mut self) {
        self.usage_count += 1;
    }
}
