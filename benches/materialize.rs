use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use cohort_engine::cohort::materialize;
use cohort_engine::filter::{FilterGroup, FilterRule, NoCohorts, Operator};
use cohort_engine::infer::{IngestOptions, ingest_csv};
use cohort_engine::schema::MasterDataset;
use cohort_engine::source::CsvSource;
use criterion::{Criterion, criterion_group, criterion_main};
use serde_json::json;
use tempfile::TempDir;

fn generate_patients(rows: usize) -> (TempDir, PathBuf) {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let csv_path = temp_dir.path().join("patients.csv");
    let mut file = BufWriter::new(File::create(&csv_path).expect("create csv"));
    writeln!(file, "patient_id,age,diagnosis,admitted").expect("header");
    for i in 0..rows {
        let diagnosis = match i % 4 {
            0 => "flu",
            1 => "asthma",
            2 => "copd",
            _ => "diabetes",
        };
        let day = (i % 28) + 1;
        writeln!(
            file,
            "P{i:06},{},{diagnosis},2024-02-{day:02}",
            18 + (i % 70)
        )
        .expect("row");
    }
    file.flush().expect("flush");
    (temp_dir, csv_path)
}

fn nested_filter() -> FilterGroup {
    FilterGroup::and(vec![
        FilterRule::between("age", json!(40), json!(65)).into(),
        FilterGroup::or(vec![
            FilterRule::new("diagnosis", Operator::Equals, json!("copd")).into(),
            FilterRule::new("diagnosis", Operator::Equals, json!("asthma")).into(),
        ])
        .into(),
        FilterGroup::and(vec![
            FilterRule::new("admitted", Operator::Gte, json!("2024-02-10")).into(),
        ])
        .negated()
        .into(),
    ])
}

fn ingest(rows: usize) -> (TempDir, MasterDataset) {
    let (dir, path) = generate_patients(rows);
    let dataset = ingest_csv(&path, &IngestOptions::default()).expect("ingest");
    (dir, dataset)
}

fn bench_materialize(c: &mut Criterion) {
    let (_dir, dataset) = ingest(50_000);
    let filter = nested_filter();
    let match_all = FilterGroup::match_all();

    let mut group = c.benchmark_group("materialize_50k");
    group.sample_size(20);
    group.bench_function("nested_filter", |b| {
        b.iter(|| materialize(&dataset, &CsvSource, &filter, &NoCohorts).expect("materialize"))
    });
    group.bench_function("match_all", |b| {
        b.iter(|| materialize(&dataset, &CsvSource, &match_all, &NoCohorts).expect("materialize"))
    });
    group.finish();
}

criterion_group!(benches, bench_materialize);
criterion_main!(benches);
