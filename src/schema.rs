//! Dataset snapshot model and YAML persistence.
//!
//! A [`MasterDataset`] is the immutable description of one uploaded table:
//! its columns with their inferred [`ColumnType`], row and patient counts,
//! where the rows live, and how the patient identifier is resolved. Type
//! overrides never edit a snapshot in place; they derive a new one.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    str::FromStr,
    sync::OnceLock,
};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use uuid::Uuid;

use crate::{
    data::normalize_column_name,
    error::{EngineError, EngineResult, IssueKind, ValidationIssue},
};

const CURRENT_SNAPSHOT_VERSION: &str = "1.0.0";

/// Exact identifier column names, highest priority first.
const PATIENT_ID_NAMES: &[&str] = &["patient_id", "subject_id", "participant_id", "id"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ColumnType {
    Number,
    Categorical,
    String,
    Date,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Number => "number",
            ColumnType::Categorical => "categorical",
            ColumnType::String => "string",
            ColumnType::Date => "date",
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            ColumnType::Number => "NUMBER",
            ColumnType::Categorical => "CATEGORICAL",
            ColumnType::String => "STRING",
            ColumnType::Date => "DATE",
        }
    }

    pub fn variants() -> &'static [&'static str] {
        &["number", "categorical", "string", "date"]
    }

    /// Text-valued columns compare case-insensitively.
    pub fn is_textual(&self) -> bool {
        matches!(self, ColumnType::String | ColumnType::Categorical)
    }
}

impl Serialize for ColumnType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.tag())
    }
}

impl<'de> Deserialize<'de> for ColumnType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let token = String::deserialize(deserializer)?;
        ColumnType::from_str(&token).map_err(|err| de::Error::custom(err.to_string()))
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ColumnType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "number" | "numeric" => Ok(ColumnType::Number),
            "categorical" | "category" => Ok(ColumnType::Categorical),
            "string" | "text" => Ok(ColumnType::String),
            "date" => Ok(ColumnType::Date),
            _ => Err(anyhow!(
                "Unknown column type '{value}'. Supported types: {}",
                ColumnType::variants().join(", ")
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// How a record's patient identifier is obtained.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatientIdSource {
    Column { name: String },
    RowIndex,
}

impl PatientIdSource {
    pub fn describe(&self) -> String {
        match self {
            PatientIdSource::Column { name } => format!("column '{name}'"),
            PatientIdSource::RowIndex => "row index".to_string(),
        }
    }
}

/// Location and fingerprint of the rows behind a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageRef {
    pub path: PathBuf,
    pub delimiter: u8,
    #[serde(default = "StorageRef::default_encoding")]
    pub encoding: String,
    pub fingerprint: String,
}

impl StorageRef {
    fn default_encoding() -> String {
        "utf-8".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterDataset {
    pub id: String,
    pub name: String,
    pub columns: Vec<Column>,
    pub row_count: usize,
    pub patient_count: usize,
    pub patient_id: PatientIdSource,
    pub storage: StorageRef,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_version: Option<String>,
}

impl MasterDataset {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        self.column(name).map(|c| c.column_type)
    }

    pub fn headers(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Index of the identifier column, `None` when ids come from row position.
    pub fn patient_id_index(&self) -> Option<usize> {
        match &self.patient_id {
            PatientIdSource::Column { name } => self.column_index(name),
            PatientIdSource::RowIndex => None,
        }
    }

    /// Derives a new snapshot with the given column types replaced.
    ///
    /// The receiver is left untouched; the result gets a fresh id and points
    /// back at the snapshot it was derived from.
    pub fn with_type_overrides(
        &self,
        overrides: &BTreeMap<String, ColumnType>,
    ) -> EngineResult<MasterDataset> {
        let issues = overrides
            .keys()
            .filter(|name| self.column(name).is_none())
            .map(|name| ValidationIssue::new(None, Some(name), IssueKind::UnknownField))
            .collect::<Vec<_>>();
        if !issues.is_empty() {
            return Err(EngineError::validation(issues));
        }
        let mut derived = self.clone();
        for column in &mut derived.columns {
            if let Some(ty) = overrides.get(&column.name) {
                column.column_type = *ty;
            }
        }
        derived.id = Uuid::new_v4().to_string();
        derived.derived_from = Some(self.id.clone());
        derived.created_at = Utc::now();
        Ok(derived)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut snapshot = self.clone();
        if snapshot.snapshot_version.is_none() {
            snapshot.snapshot_version = Some(CURRENT_SNAPSHOT_VERSION.to_string());
        }
        let file =
            File::create(path).with_context(|| format!("Creating snapshot file {path:?}"))?;
        serde_yaml::to_writer(file, &snapshot).context("Writing snapshot YAML")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening snapshot file {path:?}"))?;
        let reader = BufReader::new(file);
        let snapshot: MasterDataset =
            serde_yaml::from_reader(reader).context("Parsing snapshot YAML")?;
        Ok(snapshot)
    }
}

fn patient_id_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(^|_)(patient|subject)(_[a-z0-9]+)*_id$").ok())
        .as_ref()
}

/// Picks the identifier column by name alone.
///
/// Exact names win in priority order, then the first header whose
/// snake-cased tokens include `patient`/`subject` and end with an `id`
/// token. Matching is case-insensitive.
pub fn match_patient_id_column(headers: &[String]) -> Option<String> {
    let lowered: HashMap<String, &String> = headers
        .iter()
        .map(|h| (h.trim().to_ascii_lowercase(), h))
        .collect();
    for candidate in PATIENT_ID_NAMES {
        if let Some(original) = lowered.get(*candidate) {
            return Some((*original).clone());
        }
    }
    let pattern = patient_id_pattern()?;
    headers
        .iter()
        .find(|h| pattern.is_match(&normalize_column_name(h)))
        .cloned()
}
