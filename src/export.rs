//! Exporting raw datasets and cohort row subsets.
//!
//! A cohort export joins its patient ids back against the dataset rows and
//! writes every matching row with the original header, so patients with
//! several rows keep all of them.

use std::{fmt, io::Write};

use clap::ValueEnum;
use log::info;
use serde_json::{Map, Value as JsonValue};

use crate::{
    cohort::Cohort,
    data::coerce_number,
    error::{EngineError, EngineResult},
    io_utils::{DEFAULT_CSV_DELIMITER, DEFAULT_TSV_DELIMITER, open_csv_writer},
    schema::{ColumnType, MasterDataset},
    source::{DatasetSource, FieldIndex, Record},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    /// Tab-separated, opens directly in spreadsheet tools.
    Tsv,
    Json,
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Tsv => "tsv",
            ExportFormat::Json => "json",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExportSummary {
    pub rows_scanned: usize,
    pub rows_written: usize,
}

enum RowWriter<'w> {
    Delimited(csv::Writer<&'w mut dyn Write>),
    Json {
        out: &'w mut dyn Write,
        written: usize,
    },
}

impl<'w> RowWriter<'w> {
    fn start(format: ExportFormat, out: &'w mut dyn Write, headers: &[String]) -> EngineResult<Self> {
        let delimiter = match format {
            ExportFormat::Csv => DEFAULT_CSV_DELIMITER,
            ExportFormat::Tsv => DEFAULT_TSV_DELIMITER,
            ExportFormat::Json => {
                out.write_all(b"[")
                    .map_err(|err| EngineError::data_access("starting JSON export", err))?;
                return Ok(RowWriter::Json { out, written: 0 });
            }
        };
        let mut writer = open_csv_writer(out, delimiter);
        writer
            .write_record(headers)
            .map_err(|err| EngineError::data_access("writing export header", err))?;
        Ok(RowWriter::Delimited(writer))
    }

    fn write(&mut self, dataset: &MasterDataset, record: &Record) -> EngineResult<()> {
        let context = || format!("writing row {}", record.ordinal + 2);
        match self {
            RowWriter::Delimited(writer) => writer
                .write_record(&record.values)
                .map_err(|err| EngineError::data_access(context(), err)),
            RowWriter::Json { out, written } => {
                let separator: &[u8] = if *written == 0 { b"\n" } else { b",\n" };
                out.write_all(separator)
                    .map_err(|err| EngineError::data_access(context(), err))?;
                serde_json::to_writer(&mut **out, &json_row(dataset, record))
                    .map_err(|err| EngineError::data_access(context(), err))?;
                *written += 1;
                Ok(())
            }
        }
    }

    fn finish(self) -> EngineResult<()> {
        let context = "finishing export";
        match self {
            RowWriter::Delimited(mut writer) => writer
                .flush()
                .map_err(|err| EngineError::data_access(context, err)),
            RowWriter::Json { out, written } => {
                let closing: &[u8] = if written == 0 { b"]\n" } else { b"\n]\n" };
                out.write_all(closing)
                    .and_then(|_| out.flush())
                    .map_err(|err| EngineError::data_access(context, err))
            }
        }
    }
}

/// Blank cells become `null`, numeric columns become numbers where they parse.
fn json_row(dataset: &MasterDataset, record: &Record) -> JsonValue {
    let mut object = Map::with_capacity(dataset.columns.len());
    for (column, raw) in dataset.columns.iter().zip(&record.values) {
        let value = if raw.trim().is_empty() {
            JsonValue::Null
        } else if column.column_type == ColumnType::Number {
            coerce_number(raw)
                .and_then(serde_json::Number::from_f64)
                .map(JsonValue::Number)
                .unwrap_or_else(|| JsonValue::String(raw.clone()))
        } else {
            JsonValue::String(raw.clone())
        };
        object.insert(column.name.clone(), value);
    }
    JsonValue::Object(object)
}

/// Writes every row of `dataset`.
pub fn export_dataset(
    dataset: &MasterDataset,
    source: &dyn DatasetSource,
    format: ExportFormat,
    out: &mut dyn Write,
) -> EngineResult<ExportSummary> {
    let mut writer = RowWriter::start(format, out, &dataset.headers())?;
    let mut summary = ExportSummary::default();
    for record in source.rows(dataset)? {
        let record = record?;
        summary.rows_scanned += 1;
        writer.write(dataset, &record)?;
        summary.rows_written += 1;
    }
    writer.finish()?;
    info!(
        "Exported {} row(s) of dataset '{}' as {format}",
        summary.rows_written, dataset.id
    );
    Ok(summary)
}

/// Writes the rows of `dataset` whose patient belongs to `cohort`.
pub fn export_cohort(
    cohort: &Cohort,
    dataset: &MasterDataset,
    source: &dyn DatasetSource,
    format: ExportFormat,
    out: &mut dyn Write,
) -> EngineResult<ExportSummary> {
    if cohort.master_dataset_id != dataset.id {
        return Err(EngineError::data_access(
            format!("exporting cohort '{}'", cohort.id),
            format!(
                "cohort belongs to dataset '{}' but '{}' was supplied",
                cohort.master_dataset_id, dataset.id
            ),
        ));
    }
    let index = FieldIndex::new(dataset);
    let mut writer = RowWriter::start(format, out, &dataset.headers())?;
    let mut summary = ExportSummary::default();
    for record in source.rows(dataset)? {
        let record = record?;
        summary.rows_scanned += 1;
        let member = index
            .patient_id(&record)
            .is_some_and(|id| cohort.filtered_patient_ids.contains(&id));
        if member {
            writer.write(dataset, &record)?;
            summary.rows_written += 1;
        }
    }
    writer.finish()?;
    info!(
        "Exported {} row(s) for cohort '{}' ({} patient(s)) as {format}",
        summary.rows_written, cohort.id, cohort.patient_count
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        filter::FilterGroup,
        schema::{Column, PatientIdSource, StorageRef},
        source::MemorySource,
    };
    use chrono::Utc;
    use std::path::PathBuf;

    fn dataset() -> MasterDataset {
        MasterDataset {
            id: "ds".into(),
            name: "ds".into(),
            columns: vec![
                Column::new("patient_id", ColumnType::String),
                Column::new("age", ColumnType::Number),
                Column::new("note", ColumnType::String),
            ],
            row_count: 3,
            patient_count: 2,
            patient_id: PatientIdSource::Column {
                name: "patient_id".into(),
            },
            storage: StorageRef {
                path: PathBuf::from("mem"),
                delimiter: b',',
                encoding: "utf-8".into(),
                fingerprint: String::new(),
            },
            created_at: Utc::now(),
            derived_from: None,
            snapshot_version: None,
        }
    }

    fn rows() -> MemorySource {
        MemorySource::from_str_rows(&[
            &["P1", "40", "first visit"],
            &["P2", "", "no age"],
            &["P1", "41", "follow, up"],
        ])
    }

    fn cohort(ids: &[&str]) -> Cohort {
        let now = Utc::now();
        Cohort {
            id: "c1".into(),
            name: "c1".into(),
            master_dataset_id: "ds".into(),
            filter: FilterGroup::match_all(),
            filtered_patient_ids: ids.iter().map(|s| s.to_string()).collect(),
            patient_count: ids.len(),
            created_at: now,
            updated_at: now,
            saved_filter_id: None,
        }
    }

    #[test]
    fn cohort_export_keeps_every_row_of_each_member() {
        let mut out = Vec::new();
        let summary =
            export_cohort(&cohort(&["P1"]), &dataset(), &rows(), ExportFormat::Csv, &mut out).unwrap();
        assert_eq!(summary.rows_written, 2);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "patient_id,age,note\nP1,40,first visit\nP1,41,\"follow, up\"\n"
        );
    }

    #[test]
    fn tsv_export_uses_tabs() {
        let mut out = Vec::new();
        export_dataset(&dataset(), &rows(), ExportFormat::Tsv, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("patient_id\tage\tnote\n"));
        assert_eq!(text.lines().count(), 4);
    }

    #[test]
    fn json_export_types_numbers_and_nulls() {
        let mut out = Vec::new();
        export_dataset(&dataset(), &rows(), ExportFormat::Json, &mut out).unwrap();
        let parsed: JsonValue = serde_json::from_slice(&out).unwrap();
        let rows = parsed.as_array().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["age"], 40.0);
        assert!(rows[1]["age"].is_null());
        assert_eq!(rows[2]["note"], "follow, up");
    }

    #[test]
    fn empty_cohort_exports_an_empty_json_array() {
        let mut out = Vec::new();
        export_cohort(&cohort(&[]), &dataset(), &rows(), ExportFormat::Json, &mut out).unwrap();
        let parsed: JsonValue = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed, JsonValue::Array(Vec::new()));
    }

    #[test]
    fn cohort_from_another_dataset_is_refused() {
        let mut foreign = cohort(&["P1"]);
        foreign.master_dataset_id = "other".into();
        let mut out = Vec::new();
        assert!(export_cohort(&foreign, &dataset(), &rows(), ExportFormat::Csv, &mut out).is_err());
    }
}
