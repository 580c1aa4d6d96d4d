//! Row delivery for dataset snapshots.
//!
//! The engine never cares where rows are stored; it asks a
//! [`DatasetSource`] for the records behind a [`MasterDataset`] and sees
//! each one through the field-keyed [`RecordView`] interface.

use std::collections::HashMap;

use encoding_rs::Encoding;
use log::debug;

use crate::{
    error::{EngineError, EngineResult},
    io_utils,
    schema::{MasterDataset, PatientIdSource},
};

/// One dataset row with cells aligned to the snapshot's columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub ordinal: usize,
    pub values: Vec<String>,
}

/// Field-name access to a single record.
pub trait RecordView {
    fn value(&self, field: &str) -> Option<&str>;
    fn patient_id(&self) -> Option<&str>;
}

pub type RecordIter<'a> = Box<dyn Iterator<Item = EngineResult<Record>> + 'a>;

pub trait DatasetSource {
    fn rows<'a>(&'a self, dataset: &'a MasterDataset) -> EngineResult<RecordIter<'a>>;
}

/// Column-name to position lookup for one snapshot.
#[derive(Debug, Clone)]
pub struct FieldIndex {
    positions: HashMap<String, usize>,
    patient_column: Option<usize>,
    row_index_ids: bool,
}

impl FieldIndex {
    pub fn new(dataset: &MasterDataset) -> Self {
        let positions = dataset
            .columns
            .iter()
            .enumerate()
            .map(|(idx, column)| (column.name.clone(), idx))
            .collect();
        Self {
            positions,
            patient_column: dataset.patient_id_index(),
            row_index_ids: matches!(dataset.patient_id, PatientIdSource::RowIndex),
        }
    }

    pub fn position(&self, field: &str) -> Option<usize> {
        self.positions.get(field).copied()
    }

    /// Patient identifier of `record`; rows with a blank id have none.
    pub fn patient_id(&self, record: &Record) -> Option<String> {
        if self.row_index_ids {
            return Some(row_index_id(record.ordinal));
        }
        let idx = self.patient_column?;
        let raw = record.values.get(idx)?.trim();
        (!raw.is_empty()).then(|| raw.to_string())
    }

    pub fn view<'a>(&'a self, record: &'a Record) -> DatasetRow<'a> {
        DatasetRow {
            index: self,
            record,
            patient_id: self.patient_id(record),
        }
    }
}

/// Identifier assigned to a row when the dataset has no usable id column.
pub fn row_index_id(ordinal: usize) -> String {
    (ordinal + 1).to_string()
}

pub struct DatasetRow<'a> {
    index: &'a FieldIndex,
    record: &'a Record,
    patient_id: Option<String>,
}

impl RecordView for DatasetRow<'_> {
    fn value(&self, field: &str) -> Option<&str> {
        let idx = self.index.position(field)?;
        self.record.values.get(idx).map(String::as_str)
    }

    fn patient_id(&self) -> Option<&str> {
        self.patient_id.as_deref()
    }
}

/// Standalone record keyed by field name.
#[derive(Debug, Clone, Default)]
pub struct FieldRecord {
    patient_id: Option<String>,
    fields: HashMap<String, String>,
}

impl FieldRecord {
    pub fn new(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: Some(patient_id.into()),
            fields: HashMap::new(),
        }
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }
}

impl RecordView for FieldRecord {
    fn value(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    fn patient_id(&self) -> Option<&str> {
        self.patient_id.as_deref()
    }
}

/// Reads snapshot rows from the CSV file named in its storage reference.
///
/// The file must still hash to the fingerprint recorded at ingestion and
/// carry the same header, otherwise the snapshot is no longer reproducible
/// and the read fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvSource;

impl DatasetSource for CsvSource {
    fn rows<'a>(&'a self, dataset: &'a MasterDataset) -> EngineResult<RecordIter<'a>> {
        let path = &dataset.storage.path;
        let fingerprint = io_utils::fingerprint_file(path)
            .map_err(|err| EngineError::data_access(format!("hashing {path:?}"), err))?;
        if fingerprint != dataset.storage.fingerprint {
            return Err(EngineError::data_access(
                format!("reading dataset '{}'", dataset.id),
                format!("{path:?} changed since the snapshot was taken"),
            ));
        }
        let encoding: &'static Encoding =
            io_utils::resolve_encoding(Some(&dataset.storage.encoding))
                .map_err(|err| EngineError::data_access("resolving encoding", err))?;
        let mut reader = io_utils::open_csv_reader_from_path(path, dataset.storage.delimiter)
            .map_err(|err| EngineError::data_access(format!("opening {path:?}"), err))?;
        let headers = io_utils::reader_headers(&mut reader, encoding)
            .map_err(|err| EngineError::data_access(format!("reading headers of {path:?}"), err))?;
        if headers != dataset.headers() {
            return Err(EngineError::data_access(
                format!("reading dataset '{}'", dataset.id),
                "header no longer matches snapshot columns",
            ));
        }
        debug!("Streaming rows of dataset '{}' from {path:?}", dataset.id);
        let width = dataset.columns.len();
        let iter = reader
            .into_byte_records()
            .enumerate()
            .map(move |(ordinal, result)| {
                let record = result.map_err(|err| {
                    EngineError::data_access(format!("reading row {}", ordinal + 2), err)
                })?;
                let mut values = io_utils::decode_record(&record, encoding).map_err(|err| {
                    EngineError::data_access(format!("decoding row {}", ordinal + 2), err)
                })?;
                values.resize(width, String::new());
                Ok(Record { ordinal, values })
            });
        Ok(Box::new(iter))
    }
}

/// Rows held in memory, served for whichever snapshot asks.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    rows: Vec<Vec<String>>,
}

impl MemorySource {
    pub fn new(rows: Vec<Vec<String>>) -> Self {
        Self { rows }
    }

    pub fn from_str_rows(rows: &[&[&str]]) -> Self {
        Self::new(
            rows.iter()
                .map(|row| row.iter().map(|v| v.to_string()).collect())
                .collect(),
        )
    }
}

impl DatasetSource for MemorySource {
    fn rows<'a>(&'a self, dataset: &'a MasterDataset) -> EngineResult<RecordIter<'a>> {
        let width = dataset.columns.len();
        Ok(Box::new(self.rows.iter().enumerate().map(move |(ordinal, row)| {
            let mut values = row.clone();
            values.resize(width, String::new());
            Ok(Record { ordinal, values })
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, ColumnType, StorageRef};
    use chrono::Utc;
    use std::{io::Write, path::PathBuf};
    use tempfile::NamedTempFile;

    fn dataset(path: PathBuf, fingerprint: String, patient_id: PatientIdSource) -> MasterDataset {
        MasterDataset {
            id: "ds".into(),
            name: "ds".into(),
            columns: vec![
                Column::new("patient_id", ColumnType::String),
                Column::new("age", ColumnType::Number),
            ],
            row_count: 2,
            patient_count: 2,
            patient_id,
            storage: StorageRef {
                path,
                delimiter: b',',
                encoding: "utf-8".into(),
                fingerprint,
            },
            created_at: Utc::now(),
            derived_from: None,
            snapshot_version: None,
        }
    }

    fn id_column() -> PatientIdSource {
        PatientIdSource::Column {
            name: "patient_id".into(),
        }
    }

    #[test]
    fn csv_source_streams_rows_when_fingerprint_matches() {
        let mut file = NamedTempFile::new().expect("temp file");
        write!(file, "patient_id,age\nP1,40\nP2\n").unwrap();
        let fingerprint = io_utils::fingerprint_file(file.path()).unwrap();
        let ds = dataset(file.path().to_path_buf(), fingerprint, id_column());

        let rows = CsvSource
            .rows(&ds)
            .unwrap()
            .collect::<EngineResult<Vec<_>>>()
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].values, vec!["P2".to_string(), String::new()]);
    }

    #[test]
    fn csv_source_refuses_modified_files() {
        let mut file = NamedTempFile::new().expect("temp file");
        write!(file, "patient_id,age\nP1,40\n").unwrap();
        let ds = dataset(file.path().to_path_buf(), "stale".into(), id_column());
        let err = CsvSource.rows(&ds).err().expect("fingerprint mismatch");
        assert!(matches!(err, EngineError::DataAccess { .. }));
    }

    #[test]
    fn field_index_resolves_patient_ids() {
        let ds = dataset(PathBuf::from("x.csv"), String::new(), id_column());
        let index = FieldIndex::new(&ds);
        let record = Record {
            ordinal: 4,
            values: vec![" P9 ".into(), "51".into()],
        };
        let view = index.view(&record);
        assert_eq!(view.patient_id(), Some("P9"));
        assert_eq!(view.value("age"), Some("51"));
        assert_eq!(view.value("weight"), None);

        let blank = Record {
            ordinal: 0,
            values: vec!["  ".into(), "51".into()],
        };
        assert_eq!(index.patient_id(&blank), None);

        let by_row = FieldIndex::new(&dataset(
            PathBuf::from("x.csv"),
            String::new(),
            PatientIdSource::RowIndex,
        ));
        assert_eq!(by_row.patient_id(&record).as_deref(), Some("5"));
    }
}
