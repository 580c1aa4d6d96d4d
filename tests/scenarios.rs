mod common;

use std::{collections::HashMap, sync::Arc};

use cohort_engine::{
    activity::MemorySink,
    cohort::{Cohort, SavedFilter, materialize},
    compare::{ComparisonCache, compare},
    error::EngineError,
    filter::{FilterGroup, FilterRule, NoCohorts, Operator},
    infer::{IngestOptions, ingest_csv, infer_column_type},
    remap::{MappingStatus, RemapOptions, SimilaritySuggester, plan_remap},
    schema::ColumnType,
    source::{CsvSource, FieldIndex, MemorySource},
};
use common::{TestWorkspace, patients_csv};
use serde_json::json;

#[test]
fn adults_filter_excludes_every_minor() {
    let ws = TestWorkspace::new();
    let csv = ws.write("patients.csv", &patients_csv(162));
    let dataset = ingest_csv(&csv, &IngestOptions::default()).unwrap();
    assert_eq!(dataset.column_type("age"), Some(ColumnType::Number));

    let filter = FilterGroup::and(vec![FilterRule::new("age", Operator::Gte, json!(18)).into()]);
    let result = materialize(&dataset, &CsvSource, &filter, &NoCohorts).unwrap();

    let index = FieldIndex::new(&dataset);
    let age_idx = dataset.column_index("age").unwrap();
    let source = CsvSource;
    let records = cohort_engine::source::DatasetSource::rows(&source, &dataset).unwrap();
    for record in records {
        let record = record.unwrap();
        let id = index.patient_id(&record).unwrap();
        let age: f64 = record.values[age_idx].parse().unwrap();
        assert_eq!(result.filtered_patient_ids.contains(&id), age >= 18.0, "{id}");
    }
    assert_eq!(result.patient_count, 146);
}

#[test]
fn five_diagnoses_over_a_thousand_rows_are_categorical() {
    let values: Vec<&str> = ["flu", "asthma", "copd", "diabetes", "ckd"]
        .into_iter()
        .cycle()
        .take(1000)
        .collect();
    assert_eq!(infer_column_type(&values), ColumnType::Categorical);

    let ws = TestWorkspace::new();
    let csv = ws.write("patients.csv", &patients_csv(1000));
    let dataset = ingest_csv(&csv, &IngestOptions::default()).unwrap();
    assert_eq!(dataset.column_type("diagnosis"), Some(ColumnType::Categorical));
    assert_eq!(dataset.column_type("admitted"), Some(ColumnType::Date));
}

#[test]
fn overlap_of_twenty_between_hundred_and_forty_is_fifty_percent() {
    let ws = TestWorkspace::new();
    let mut csv = String::from("patient_id,group_a,group_b\n");
    for i in 0..120 {
        let a = u8::from(i < 100);
        let b = u8::from(i >= 80);
        csv.push_str(&format!("P{i:03},{a},{b}\n"));
    }
    let path = ws.write("groups.csv", &csv);
    let dataset = ingest_csv(&path, &IngestOptions::default()).unwrap();
    let mut sink = MemorySink::default();
    let in_group = |field: &str| {
        FilterGroup::and(vec![FilterRule::new(field, Operator::Equals, json!(1)).into()])
    };
    let a = Cohort::create("a", &dataset, &CsvSource, in_group("group_a"), &NoCohorts, &mut sink)
        .unwrap();
    let b = Cohort::create("b", &dataset, &CsvSource, in_group("group_b"), &NoCohorts, &mut sink)
        .unwrap();
    assert_eq!((a.patient_count, b.patient_count), (100, 40));

    let counts = HashMap::from([(dataset.id.clone(), dataset.patient_count)]);
    let result = compare(&[&a, &b], &counts).unwrap();
    let pair = &result.pairwise[0];
    assert_eq!(pair.overlap, 20);
    assert_eq!(pair.overlap_percent, 50.0);
    assert_eq!(result.union_size, 120);
}

#[test]
fn saved_filter_on_patient_age_runs_against_age_after_confirmation() {
    let ws = TestWorkspace::new();
    let target_csv = ws.write("target.csv", "id,age\nT1,15\nT2,18\nT3,44\n");
    let target = ingest_csv(&target_csv, &IngestOptions::default()).unwrap();

    let mut saved = SavedFilter::new(
        "adults",
        FilterGroup::and(vec![FilterRule::new("patient_age", Operator::Gte, json!(18)).into()]),
        vec![cohort_engine::schema::Column::new("patient_age", ColumnType::Number)],
    );
    assert!(matches!(
        materialize(&target, &CsvSource, &saved.filter, &NoCohorts),
        Err(EngineError::Validation { .. })
    ));

    let mut plan = plan_remap(
        &saved,
        &target,
        Some(Arc::new(SimilaritySuggester::default())),
        &RemapOptions::default(),
    );
    assert_eq!(plan.mapping("patient_age").unwrap().status, MappingStatus::Accepted);
    plan.confirm("patient_age", "age").unwrap();
    let adapted = plan.apply(&saved.filter).unwrap();
    assert_eq!(adapted.leaf_rules()[0].field, "age");

    let mut sink = MemorySink::default();
    let cohort = Cohort::create_from_saved(
        "adults",
        &target,
        &CsvSource,
        &mut saved,
        adapted,
        &NoCohorts,
        &mut sink,
    )
    .unwrap();
    assert_eq!(
        cohort.filtered_patient_ids.into_iter().collect::<Vec<_>>(),
        vec!["T2".to_string(), "T3".to_string()]
    );
    assert_eq!(saved.usage_count, 1);
}

#[test]
fn editing_a_filter_invalidates_cached_comparisons() {
    let dataset = {
        let ws = TestWorkspace::new();
        let csv = ws.write("p.csv", &patients_csv(81));
        ingest_csv(&csv, &IngestOptions::default()).unwrap()
    };
    let rows = MemorySource::new(
        (0..81)
            .map(|i| {
                vec![
                    format!("P{:03}", i + 1),
                    (10 + i).to_string(),
                    "flu".to_string(),
                    "2024-03-01".to_string(),
                ]
            })
            .collect(),
    );
    let mut sink = MemorySink::default();
    let adults = FilterGroup::and(vec![FilterRule::new("age", Operator::Gte, json!(18)).into()]);
    let seniors = FilterGroup::and(vec![FilterRule::new("age", Operator::Gte, json!(65)).into()]);
    let a = Cohort::create("a", &dataset, &rows, adults, &NoCohorts, &mut sink).unwrap();
    let mut b = Cohort::create("b", &dataset, &rows, seniors, &NoCohorts, &mut sink).unwrap();

    let counts = HashMap::from([(dataset.id.clone(), dataset.patient_count)]);
    let mut cache = ComparisonCache::new();
    let (first, _) = cache.get_or_compute(&[&a, &b], &counts).unwrap();
    assert_eq!(first.pairwise[0].overlap, 26);

    let octogenarians =
        FilterGroup::and(vec![FilterRule::new("age", Operator::Gte, json!(80)).into()]);
    b.update_filter(octogenarians, &dataset, &rows, &NoCohorts, &mut sink)
        .unwrap();
    cache.invalidate(&b.id);
    let (second, hit) = cache.get_or_compute(&[&a, &b], &counts).unwrap();
    assert!(!hit);
    assert_eq!(second.pairwise[0].overlap, 11);
}
