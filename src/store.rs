//! Directory-backed persistence for snapshots, cohorts, saved filters and
//! comparison results.
//!
//! Layout under the store root:
//!
//! ```text
//! datasets/<id>.yml      MasterDataset snapshots
//! cohorts/<id>.json      materialized cohorts
//! filters/<id>.json      saved filters
//! comparisons/<id>.json  comparison results
//! activity.jsonl         audit events, one per line
//! ```

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use log::{debug, info};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::json;

use crate::{
    activity::{ActivityAction, ActivityEvent, ActivitySink, JsonLinesSink},
    cohort::{Cohort, SavedFilter},
    compare::{ComparisonResult, MasterCounts},
    error::{EngineError, EngineResult, IssueKind, ValidationIssue},
    schema::MasterDataset,
};

pub const DEFAULT_STORE_DIR: &str = ".cohort-store";

const DATASETS: &str = "datasets";
const COHORTS: &str = "cohorts";
const FILTERS: &str = "filters";
const COMPARISONS: &str = "comparisons";
const ACTIVITY_LOG: &str = "activity.jsonl";

#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Opens the store at `root`, creating its directories as needed.
    pub fn open(root: impl Into<PathBuf>) -> EngineResult<Self> {
        let root = root.into();
        for dir in [DATASETS, COHORTS, FILTERS, COMPARISONS] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(|err| {
                EngineError::data_access(format!("creating store directory {path:?}"), err)
            })?;
        }
        debug!("Opened store at {root:?}");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn activity_sink(&self) -> JsonLinesSink {
        JsonLinesSink::new(self.root.join(ACTIVITY_LOG))
    }

    fn entity_path(&self, dir: &str, id: &str, extension: &str) -> EngineResult<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(EngineError::data_access(
                format!("resolving {dir} entry"),
                format!("'{id}' is not a valid identifier"),
            ));
        }
        Ok(self.root.join(dir).join(format!("{id}.{extension}")))
    }

    pub fn save_dataset(&self, dataset: &MasterDataset) -> EngineResult<()> {
        let path = self.entity_path(DATASETS, &dataset.id, "yml")?;
        dataset
            .save(&path)
            .map_err(|err| EngineError::data_access(format!("saving dataset '{}'", dataset.id), err))
    }

    pub fn load_dataset(&self, id: &str) -> EngineResult<MasterDataset> {
        let path = self.entity_path(DATASETS, id, "yml")?;
        MasterDataset::load(&path)
            .map_err(|err| EngineError::data_access(format!("loading dataset '{id}'"), err))
    }

    pub fn list_datasets(&self) -> EngineResult<Vec<MasterDataset>> {
        self.entity_ids(DATASETS, "yml")?
            .iter()
            .map(|id| self.load_dataset(id))
            .collect()
    }

    /// Removes a dataset snapshot unless a stored cohort still references it.
    pub fn delete_dataset(&self, id: &str, sink: &mut dyn ActivitySink) -> EngineResult<()> {
        let path = self.entity_path(DATASETS, id, "yml")?;
        let referencing = self
            .list_cohorts()?
            .into_iter()
            .filter(|c| c.master_dataset_id == id)
            .map(|c| c.id)
            .collect::<Vec<_>>();
        if !referencing.is_empty() {
            return Err(EngineError::validation(vec![ValidationIssue::new(
                None,
                None,
                IssueKind::DatasetInUse(referencing),
            )]));
        }
        fs::remove_file(&path)
            .map_err(|err| EngineError::data_access(format!("deleting dataset '{id}'"), err))?;
        sink.record(ActivityEvent::new(ActivityAction::DatasetDeleted, id))?;
        info!("Deleted dataset '{id}'");
        Ok(())
    }

    pub fn save_cohort(&self, cohort: &Cohort) -> EngineResult<()> {
        let path = self.entity_path(COHORTS, &cohort.id, "json")?;
        write_json(&path, cohort)
    }

    pub fn load_cohort(&self, id: &str) -> EngineResult<Cohort> {
        let path = self.entity_path(COHORTS, id, "json")?;
        read_json(&path)
    }

    pub fn list_cohorts(&self) -> EngineResult<Vec<Cohort>> {
        self.entity_ids(COHORTS, "json")?
            .iter()
            .map(|id| self.load_cohort(id))
            .collect()
    }

    pub fn delete_cohort(&self, id: &str, sink: &mut dyn ActivitySink) -> EngineResult<()> {
        let cohort = self.load_cohort(id)?;
        let path = self.entity_path(COHORTS, id, "json")?;
        fs::remove_file(&path)
            .map_err(|err| EngineError::data_access(format!("deleting cohort '{id}'"), err))?;
        sink.record(
            ActivityEvent::new(ActivityAction::CohortDeleted, id)
                .with_change(Some(json!({ "patientCount": cohort.patient_count })), None)
                .with_metadata(json!({ "name": cohort.name })),
        )?;
        Ok(())
    }

    pub fn save_filter(&self, filter: &SavedFilter) -> EngineResult<()> {
        let path = self.entity_path(FILTERS, &filter.id, "json")?;
        write_json(&path, filter)
    }

    pub fn load_filter(&self, id: &str) -> EngineResult<SavedFilter> {
        let path = self.entity_path(FILTERS, id, "json")?;
        read_json(&path)
    }

    pub fn list_filters(&self) -> EngineResult<Vec<SavedFilter>> {
        self.entity_ids(FILTERS, "json")?
            .iter()
            .map(|id| self.load_filter(id))
            .collect()
    }

    pub fn save_comparison(&self, result: &ComparisonResult) -> EngineResult<()> {
        let path = self.entity_path(COMPARISONS, &result.id, "json")?;
        write_json(&path, result)
    }

    pub fn load_comparison(&self, id: &str) -> EngineResult<ComparisonResult> {
        let path = self.entity_path(COMPARISONS, id, "json")?;
        read_json(&path)
    }

    /// Patient sets of the given cohorts, for `in_cohort` rules.
    ///
    /// Ids with no stored cohort are skipped; validation reports them.
    pub fn cohort_lookup(
        &self,
        ids: &BTreeSet<String>,
    ) -> EngineResult<BTreeMap<String, BTreeSet<String>>> {
        let mut lookup = BTreeMap::new();
        for id in ids {
            let path = self.entity_path(COHORTS, id, "json")?;
            if path.exists() {
                let cohort: Cohort = read_json(&path)?;
                lookup.insert(cohort.id, cohort.filtered_patient_ids);
            }
        }
        Ok(lookup)
    }

    /// Patient totals of the datasets behind `cohorts`.
    pub fn master_counts(&self, cohorts: &[Cohort]) -> EngineResult<MasterCounts> {
        let mut counts = MasterCounts::new();
        for cohort in cohorts {
            if !counts.contains_key(&cohort.master_dataset_id) {
                let dataset = self.load_dataset(&cohort.master_dataset_id)?;
                counts.insert(dataset.id, dataset.patient_count);
            }
        }
        Ok(counts)
    }

    fn entity_ids(&self, dir: &str, extension: &str) -> EngineResult<Vec<String>> {
        let path = self.root.join(dir);
        let entries = fs::read_dir(&path)
            .map_err(|err| EngineError::data_access(format!("listing {path:?}"), err))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|err| EngineError::data_access(format!("listing {path:?}"), err))?;
            let file = entry.path();
            if file.extension().and_then(|e| e.to_str()) != Some(extension) {
                continue;
            }
            if let Some(stem) = file.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> EngineResult<()> {
    let context = || format!("writing {path:?}");
    let file = File::create(path).map_err(|err| EngineError::data_access(context(), err))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .map_err(|err| EngineError::data_access(context(), err))?;
    writer
        .write_all(b"\n")
        .and_then(|_| writer.flush())
        .map_err(|err| EngineError::data_access(context(), err))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> EngineResult<T> {
    let context = || format!("reading {path:?}");
    let file = File::open(path).map_err(|err| EngineError::data_access(context(), err))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|err| EngineError::data_access(context(), err))
}
