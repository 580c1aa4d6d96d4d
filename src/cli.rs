use std::{path::PathBuf, str::FromStr};

use clap::{ArgGroup, Args, Parser, Subcommand};

use crate::{export::ExportFormat, schema::ColumnType, store::DEFAULT_STORE_DIR};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Build, compare and export patient cohorts from tabular datasets",
    long_about = None
)]
pub struct Cli {
    /// Directory holding snapshots, cohorts, saved filters and the activity log
    #[arg(long, global = true, default_value = DEFAULT_STORE_DIR)]
    pub store: PathBuf,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Infer column types for a CSV file and record it as a dataset snapshot
    Ingest(IngestArgs),
    /// Derive a new snapshot with declared column types
    Override(OverrideArgs),
    /// List, inspect or delete dataset snapshots
    #[command(subcommand)]
    Dataset(DatasetCommand),
    /// Create, update, inspect or delete cohorts
    #[command(subcommand)]
    Cohort(CohortCommand),
    /// Save filters and replay them against other datasets
    #[command(subcommand)]
    Filter(FilterCommand),
    /// Compare two to five cohorts
    Compare(CompareArgs),
    /// Export a cohort's rows or a whole dataset
    Export(ExportArgs),
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Input CSV file
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Display name for the dataset (defaults to the file stem)
    #[arg(long)]
    pub name: Option<String>,
    /// Non-blank values sampled per column when inferring types (0 means full scan)
    #[arg(long, default_value_t = 1000)]
    pub sample_rows: usize,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of the input file (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
    /// Declared column types of the form `column=type`
    #[arg(long = "override", value_parser = parse_type_assignment, action = clap::ArgAction::Append)]
    pub overrides: Vec<(String, ColumnType)>,
}

#[derive(Debug, Args)]
pub struct OverrideArgs {
    /// Snapshot to derive from
    #[arg(long)]
    pub dataset: String,
    /// Column types of the form `column=type`
    #[arg(long = "column", required = true, value_parser = parse_type_assignment, action = clap::ArgAction::Append)]
    pub columns: Vec<(String, ColumnType)>,
}

#[derive(Debug, Subcommand)]
pub enum DatasetCommand {
    /// List stored snapshots
    List,
    /// Show the columns and inferred types of a snapshot
    Show {
        /// Snapshot id
        id: String,
    },
    /// Delete a snapshot no cohort references
    Delete {
        /// Snapshot id
        id: String,
    },
}

/// Filter definition given as a JSON file or as shorthand rules.
#[derive(Debug, Args)]
#[command(group(ArgGroup::new("definition").required(true).args(["filter", "rules"])))]
pub struct FilterInput {
    /// JSON file holding the filter tree
    #[arg(long)]
    pub filter: Option<PathBuf>,
    /// Shorthand rules such as `age >= 18` or `diagnosis contains flu`
    #[arg(long = "rule", action = clap::ArgAction::Append)]
    pub rules: Vec<String>,
    /// Combine shorthand rules with OR instead of AND
    #[arg(long, requires = "rules")]
    pub any: bool,
}

#[derive(Debug, Subcommand)]
pub enum CohortCommand {
    /// Materialize a filter into a new cohort
    Create {
        /// Snapshot to filter
        #[arg(long)]
        dataset: String,
        /// Cohort name
        #[arg(long)]
        name: String,
        #[command(flatten)]
        input: FilterInput,
    },
    /// Replace a cohort's filter and re-materialize it
    Update {
        /// Cohort id
        #[arg(long)]
        cohort: String,
        #[command(flatten)]
        input: FilterInput,
    },
    /// Show a cohort's filter and patient count
    Show {
        /// Cohort id
        #[arg(long)]
        cohort: String,
        /// Print the stored cohort document as JSON
        #[arg(long)]
        json: bool,
    },
    /// List stored cohorts
    List,
    /// Delete a cohort
    Delete {
        /// Cohort id
        #[arg(long)]
        cohort: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum FilterCommand {
    /// Save a filter built against a dataset for later reuse
    Save {
        /// Saved filter name
        #[arg(long)]
        name: String,
        /// Snapshot whose columns the filter was written against
        #[arg(long)]
        dataset: String,
        #[command(flatten)]
        input: FilterInput,
    },
    /// List saved filters
    List,
    /// Remap a saved filter onto a dataset and materialize it as a cohort
    Apply(ApplyArgs),
}

#[derive(Debug, Args)]
pub struct ApplyArgs {
    /// Saved filter id
    #[arg(long)]
    pub saved: String,
    /// Target snapshot
    #[arg(long)]
    pub dataset: String,
    /// Name of the resulting cohort
    #[arg(long)]
    pub name: String,
    /// Manual field mappings of the form `source=target`
    #[arg(long = "map", value_parser = parse_mapping, action = clap::ArgAction::Append)]
    pub mappings: Vec<(String, String)>,
    /// Confirm suggestions below the auto-accept threshold
    #[arg(long)]
    pub accept_suggestions: bool,
    /// Skip name-similarity suggestions entirely
    #[arg(long)]
    pub no_suggest: bool,
    /// Confidence at or above which suggestions are accepted without confirmation
    #[arg(long, default_value_t = 0.8)]
    pub auto_accept: f64,
    /// Time allowed for the suggestion step, in milliseconds
    #[arg(long = "timeout-ms", default_value_t = 5000)]
    pub timeout_ms: u64,
}

#[derive(Debug, Args)]
pub struct CompareArgs {
    /// Cohort ids to compare (between two and five)
    #[arg(long = "cohort", required = true, action = clap::ArgAction::Append)]
    pub cohorts: Vec<String>,
    /// Write the comparison result as JSON to this file (`-` for stdout)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("subject").required(true).args(["cohort", "dataset"])))]
pub struct ExportArgs {
    /// Export the rows of this cohort
    #[arg(long)]
    pub cohort: Option<String>,
    /// Export every row of this snapshot
    #[arg(long)]
    pub dataset: Option<String>,
    /// Output format
    #[arg(long, value_enum, default_value_t = ExportFormat::Csv)]
    pub format: ExportFormat,
    /// Output file (stdout if omitted)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
}

pub fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value {
        "tab" | "\t" => Ok(b'\t'),
        "comma" | "," => Ok(b','),
        "|" | "pipe" => Ok(b'|'),
        ";" | "semicolon" => Ok(b';'),
        other => {
            let mut chars = other.chars();
            let first = chars
                .next()
                .ok_or_else(|| "Delimiter cannot be empty".to_string())?;
            if chars.next().is_some() {
                return Err("Delimiter must be a single character".to_string());
            }
            if !first.is_ascii() {
                return Err("Delimiter must be ASCII".to_string());
            }
            Ok(first as u8)
        }
    }
}

fn split_pair(value: &str) -> Result<(&str, &str), String> {
    let (left, right) = value
        .split_once('=')
        .ok_or_else(|| format!("Expected `name=value` but found '{value}'"))?;
    let (left, right) = (left.trim(), right.trim());
    if left.is_empty() || right.is_empty() {
        return Err(format!("Both sides of '{value}' must be non-empty"));
    }
    Ok((left, right))
}

pub fn parse_type_assignment(value: &str) -> Result<(String, ColumnType), String> {
    let (column, ty) = split_pair(value)?;
    let ty = ColumnType::from_str(ty).map_err(|err| err.to_string())?;
    Ok((column.to_string(), ty))
}

pub fn parse_mapping(value: &str) -> Result<(String, String), String> {
    let (source, target) = split_pair(value)?;
    Ok((source.to_string(), target.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn type_assignments_accept_aliases() {
        assert_eq!(
            parse_type_assignment("flag = category").unwrap(),
            ("flag".to_string(), ColumnType::Categorical)
        );
        assert!(parse_type_assignment("flag").is_err());
        assert!(parse_type_assignment("flag=bool").is_err());
        assert!(parse_mapping("=age").is_err());
    }

    #[test]
    fn delimiters_accept_names() {
        assert_eq!(parse_delimiter("tab").unwrap(), b'\t');
        assert_eq!(parse_delimiter(";").unwrap(), b';');
        assert!(parse_delimiter("ab").is_err());
    }
}
