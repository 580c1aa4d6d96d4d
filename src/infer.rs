//! Column type inference and dataset ingestion.
//!
//! Ingestion makes one full pass over a CSV file. Each column keeps the first
//! [`INFERENCE_SAMPLE_LIMIT`] non-blank values for type inference while the
//! pass also counts rows and settles how patient identifiers are resolved.
//! The result is an immutable [`MasterDataset`] snapshot.
//!
//! Inference rules, first match wins:
//!
//! 1. empty sample: `STRING`
//! 2. at least 90% of values parse as dates: `DATE`
//! 3. at least 90% of values parse as numbers: `NUMBER`
//! 4. at most 20 distinct values: `CATEGORICAL`
//! 5. otherwise `STRING`

use std::{
    collections::{BTreeMap, HashSet},
    path::Path,
};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use log::{debug, info};
use uuid::Uuid;

use crate::{
    data::{coerce_date, coerce_number},
    io_utils,
    schema::{
        Column, ColumnType, MasterDataset, PatientIdSource, StorageRef, match_patient_id_column,
    },
};

pub const INFERENCE_SAMPLE_LIMIT: usize = 1000;
const MATCH_THRESHOLD_PERCENT: usize = 90;
const CATEGORICAL_DISTINCT_LIMIT: usize = 20;

/// Classifies a column from a sample of its values.
///
/// Blank values are ignored and at most [`INFERENCE_SAMPLE_LIMIT`] non-blank
/// values are considered.
pub fn infer_column_type<S: AsRef<str>>(values: &[S]) -> ColumnType {
    let mut sampler = ColumnSampler::with_limit(INFERENCE_SAMPLE_LIMIT);
    for value in values {
        sampler.record(value.as_ref());
    }
    sampler.decide()
}

#[derive(Debug, Clone)]
struct ColumnSampler {
    limit: usize,
    values: Vec<String>,
}

impl ColumnSampler {
    fn with_limit(limit: usize) -> Self {
        Self {
            limit,
            values: Vec::new(),
        }
    }

    fn record(&mut self, value: &str) {
        if self.values.len() >= self.limit {
            return;
        }
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return;
        }
        self.values.push(trimmed.to_string());
    }

    fn meets_threshold(&self, matches: usize) -> bool {
        matches * 100 >= self.values.len() * MATCH_THRESHOLD_PERCENT
    }

    fn distinct(&self) -> usize {
        self.values.iter().collect::<HashSet<_>>().len()
    }

    fn decide(&self) -> ColumnType {
        if self.values.is_empty() {
            return ColumnType::String;
        }
        let dates = self
            .values
            .iter()
            .filter(|v| coerce_date(v).is_some())
            .count();
        if self.meets_threshold(dates) {
            return ColumnType::Date;
        }
        let numbers = self
            .values
            .iter()
            .filter(|v| coerce_number(v).is_some())
            .count();
        if self.meets_threshold(numbers) {
            ColumnType::Number
        } else if self.distinct() <= CATEGORICAL_DISTINCT_LIMIT {
            ColumnType::Categorical
        } else {
            ColumnType::String
        }
    }

    fn profile(&self, name: &str, column_type: ColumnType) -> ColumnProfile {
        ColumnProfile {
            name: name.to_string(),
            column_type,
            sampled: self.values.len(),
            distinct: self.distinct(),
            example: self.values.first().cloned(),
        }
    }
}

/// What inference saw for one column, surfaced before filters use it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnProfile {
    pub name: String,
    pub column_type: ColumnType,
    pub sampled: usize,
    pub distinct: usize,
    pub example: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    pub name: Option<String>,
    pub delimiter: Option<u8>,
    pub encoding: Option<String>,
    /// Non-blank values sampled per column; `Some(0)` samples every row.
    pub sample_rows: Option<usize>,
    /// Declared types that replace inference for the named columns.
    pub overrides: BTreeMap<String, ColumnType>,
}

pub fn ingest_csv(path: &Path, options: &IngestOptions) -> Result<MasterDataset> {
    ingest_csv_with_profile(path, options).map(|(dataset, _)| dataset)
}

pub fn ingest_csv_with_profile(
    path: &Path,
    options: &IngestOptions,
) -> Result<(MasterDataset, Vec<ColumnProfile>)> {
    let delimiter = io_utils::resolve_input_delimiter(path, options.delimiter);
    let encoding = io_utils::resolve_encoding(options.encoding.as_deref())?;
    info!(
        "Ingesting '{}' with delimiter '{}'",
        path.display(),
        io_utils::printable_delimiter(delimiter)
    );
    let fingerprint = io_utils::fingerprint_file(path)?;
    let mut reader = io_utils::open_csv_reader_from_path(path, delimiter)?;
    let headers = io_utils::reader_headers(&mut reader, encoding)
        .with_context(|| format!("Reading headers from {path:?}"))?;
    if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
        bail!("{path:?} has no header row");
    }
    let mut seen = HashSet::new();
    if let Some(duplicate) = headers.iter().find(|h| !seen.insert(h.as_str())) {
        bail!("Column '{duplicate}' appears more than once in {path:?}");
    }
    for name in options.overrides.keys() {
        if !headers.contains(name) {
            bail!("Type override names unknown column '{name}'");
        }
    }

    let matched_id = match_patient_id_column(&headers);
    let id_idx = matched_id
        .as_ref()
        .and_then(|name| headers.iter().position(|h| h == name))
        .unwrap_or(0);

    let limit = match options.sample_rows {
        None => INFERENCE_SAMPLE_LIMIT,
        Some(0) => usize::MAX,
        Some(n) => n,
    };
    let mut samplers = vec![ColumnSampler::with_limit(limit); headers.len()];
    let mut ids: HashSet<String> = HashSet::new();
    let mut blank_or_repeated_ids = false;
    let mut rows = 0usize;
    for (ordinal, result) in reader.byte_records().enumerate() {
        let record = result.with_context(|| format!("Reading row {}", ordinal + 2))?;
        let decoded = io_utils::decode_record(&record, encoding)
            .with_context(|| format!("Decoding row {}", ordinal + 2))?;
        for (idx, sampler) in samplers.iter_mut().enumerate() {
            if let Some(value) = decoded.get(idx) {
                sampler.record(value);
            }
        }
        let id = decoded.get(id_idx).map(|v| v.trim()).unwrap_or_default();
        if id.is_empty() || !ids.insert(id.to_string()) {
            blank_or_repeated_ids = true;
        }
        rows += 1;
    }

    let (patient_id, patient_count) = match matched_id {
        Some(name) => (PatientIdSource::Column { name }, ids.len()),
        None if !blank_or_repeated_ids && rows > 0 => (
            PatientIdSource::Column {
                name: headers[0].clone(),
            },
            rows,
        ),
        None => (PatientIdSource::RowIndex, rows),
    };
    debug!("Patient identifiers resolved from {}", patient_id.describe());

    let mut columns = Vec::with_capacity(headers.len());
    let mut profiles = Vec::with_capacity(headers.len());
    for (header, sampler) in headers.iter().zip(&samplers) {
        let column_type = options
            .overrides
            .get(header)
            .copied()
            .unwrap_or_else(|| sampler.decide());
        profiles.push(sampler.profile(header, column_type));
        columns.push(Column::new(header.clone(), column_type));
    }

    let name = options.name.clone().unwrap_or_else(|| {
        path.file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("dataset")
            .to_string()
    });
    let dataset = MasterDataset {
        id: Uuid::new_v4().to_string(),
        name,
        columns,
        row_count: rows,
        patient_count,
        patient_id,
        storage: StorageRef {
            path: path.to_path_buf(),
            delimiter,
            encoding: encoding.name().to_string(),
            fingerprint,
        },
        created_at: Utc::now(),
        derived_from: None,
        snapshot_version: None,
    };
    info!(
        "Ingested {} row(s) across {} column(s) as dataset '{}'",
        dataset.row_count,
        dataset.columns.len(),
        dataset.id
    );
    Ok((dataset, profiles))
}
