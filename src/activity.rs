//! Audit events for cohort lifecycle and comparison runs.

use std::{
    fs::OpenOptions,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    DatasetIngested,
    DatasetDerived,
    DatasetDeleted,
    CohortCreated,
    FilterChanged,
    CohortDeleted,
    FilterSaved,
    ComparisonRun,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub action: ActivityAction,
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<JsonValue>,
    #[serde(default)]
    pub metadata: JsonValue,
    pub recorded_at: DateTime<Utc>,
}

impl ActivityEvent {
    pub fn new(action: ActivityAction, entity_id: impl Into<String>) -> Self {
        Self {
            action,
            entity_id: entity_id.into(),
            previous_value: None,
            new_value: None,
            metadata: JsonValue::Null,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_change(mut self, previous: Option<JsonValue>, new: Option<JsonValue>) -> Self {
        self.previous_value = previous;
        self.new_value = new;
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Receiver of audit events; storage is the sink's concern.
pub trait ActivitySink {
    fn record(&mut self, event: ActivityEvent) -> EngineResult<()>;
}

/// Keeps events in memory, mainly for callers that forward them later.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub events: Vec<ActivityEvent>,
}

impl ActivitySink for MemorySink {
    fn record(&mut self, event: ActivityEvent) -> EngineResult<()> {
        self.events.push(event);
        Ok(())
    }
}

/// Appends one JSON document per line to a log file.
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ActivitySink for JsonLinesSink {
    fn record(&mut self, event: ActivityEvent) -> EngineResult<()> {
        let context = || format!("appending activity to {:?}", self.path);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| EngineError::data_access(context(), err))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &event)
            .map_err(|err| EngineError::data_access(context(), err))?;
        writer
            .write_all(b"\n")
            .and_then(|_| writer.flush())
            .map_err(|err| EngineError::data_access(context(), err))
    }
}
