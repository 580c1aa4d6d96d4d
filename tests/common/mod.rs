#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use tempfile::{TempDir, tempdir};

/// Scratch directory holding input files and a cohort store.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    /// Creates a fresh scratch directory for the current test case.
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn store(&self) -> PathBuf {
        self.temp_dir.path().join("store")
    }

    /// Writes `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents.as_bytes())
            .expect("write temp file contents");
        path
    }

    /// The binary, pointed at this workspace's store.
    pub fn cli(&self) -> Command {
        let mut cmd = Command::cargo_bin("cohort-engine").expect("binary exists");
        cmd.arg("--store").arg(self.store());
        cmd
    }

    /// Runs the binary with `args`, asserts success and returns stdout.
    pub fn run(&self, args: &[&str]) -> String {
        let output = self.cli().args(args).assert().success().get_output().clone();
        String::from_utf8(output.stdout).expect("utf-8 stdout")
    }

    /// Ingests `path` and returns the new dataset id.
    pub fn ingest(&self, path: &Path) -> String {
        let stdout = self.run(&["ingest", "-i", path.to_str().expect("utf-8 path")]);
        entity_id(&stdout, "dataset")
    }
}

/// Pulls the id out of a `<kind> <id>` line.
pub fn entity_id(stdout: &str, kind: &str) -> String {
    let prefix = format!("{kind} ");
    stdout
        .lines()
        .find_map(|line| line.strip_prefix(&prefix))
        .map(|id| id.trim().to_string())
        .unwrap_or_else(|| panic!("no '{kind}' line in output:\n{stdout}"))
}

/// Patients P001..P{n} with ages cycling through 10..=90 and five diagnoses.
pub fn patients_csv(rows: usize) -> String {
    const DIAGNOSES: [&str; 5] = ["flu", "asthma", "copd", "diabetes", "ckd"];
    let mut csv = String::from("patient_id,age,diagnosis,admitted\n");
    for i in 0..rows {
        let age = 10 + (i % 81);
        let day = (i % 28) + 1;
        csv.push_str(&format!(
            "P{:03},{age},{},2024-03-{day:02}\n",
            i + 1,
            DIAGNOSES[i % DIAGNOSES.len()]
        ));
    }
    csv
}
