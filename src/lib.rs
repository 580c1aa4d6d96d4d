pub mod activity;
pub mod cli;
pub mod cohort;
pub mod compare;
pub mod data;
pub mod error;
pub mod export;
pub mod filter;
pub mod infer;
pub mod io_utils;
pub mod remap;
pub mod schema;
pub mod source;
pub mod store;
pub mod table;

use std::{
    collections::BTreeMap,
    env, fs,
    io::Write,
    sync::{Arc, OnceLock},
    time::Duration,
};

use anyhow::{Context, Result};
use clap::Parser;
use log::{LevelFilter, debug, info};
use serde_json::json;

use crate::{
    activity::{ActivityAction, ActivityEvent, ActivitySink},
    cli::{ApplyArgs, Cli, CohortCommand, Commands, DatasetCommand, FilterCommand, FilterInput},
    cohort::{Cohort, SavedFilter},
    compare::{ComparisonCache, run_comparison},
    error::EngineError,
    filter::{FilterGroup, Logic, parse_rule_expressions, validate},
    infer::IngestOptions,
    remap::{RemapOptions, SimilaritySuggester, SuggestionSource, plan_remap},
    source::CsvSource,
    store::Store,
    table::Table,
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("cohort_engine", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let store =
        Store::open(&cli.store).with_context(|| format!("Opening store {:?}", cli.store))?;
    match cli.command {
        Commands::Ingest(args) => handle_ingest(&store, &args),
        Commands::Override(args) => handle_override(&store, &args),
        Commands::Dataset(command) => handle_dataset(&store, command),
        Commands::Cohort(command) => handle_cohort(&store, command),
        Commands::Filter(command) => handle_filter(&store, command),
        Commands::Compare(args) => handle_compare(&store, &args),
        Commands::Export(args) => handle_export(&store, &args),
    }
}

fn handle_ingest(store: &Store, args: &cli::IngestArgs) -> Result<()> {
    let input = fs::canonicalize(&args.input)
        .with_context(|| format!("Resolving input path {:?}", args.input))?;
    let options = IngestOptions {
        name: args.name.clone(),
        delimiter: args.delimiter,
        encoding: args.input_encoding.clone(),
        sample_rows: Some(args.sample_rows),
        overrides: args.overrides.iter().cloned().collect(),
    };
    let (dataset, profiles) = infer::ingest_csv_with_profile(&input, &options)
        .with_context(|| format!("Ingesting {input:?}"))?;
    store.save_dataset(&dataset)?;
    store.activity_sink().record(
        ActivityEvent::new(ActivityAction::DatasetIngested, &dataset.id).with_metadata(json!({
            "name": dataset.name,
            "rows": dataset.row_count,
            "patients": dataset.patient_count,
            "patientId": dataset.patient_id.describe(),
        })),
    )?;
    println!("dataset {}", dataset.id);
    println!(
        "{} row(s), {} patient(s), identifiers from {}",
        dataset.row_count,
        dataset.patient_count,
        dataset.patient_id.describe()
    );
    table::schema_table(&dataset, &profiles).print();
    Ok(())
}

fn handle_override(store: &Store, args: &cli::OverrideArgs) -> Result<()> {
    let base = store.load_dataset(&args.dataset)?;
    let overrides = args.columns.iter().cloned().collect::<BTreeMap<_, _>>();
    let derived = base.with_type_overrides(&overrides)?;
    store.save_dataset(&derived)?;
    store.activity_sink().record(
        ActivityEvent::new(ActivityAction::DatasetDerived, &derived.id)
            .with_change(
                serde_json::to_value(&base.columns).ok(),
                serde_json::to_value(&derived.columns).ok(),
            )
            .with_metadata(json!({ "derivedFrom": base.id })),
    )?;
    info!(
        "Derived snapshot '{}' from '{}' with {} override(s)",
        derived.id,
        base.id,
        overrides.len()
    );
    println!("dataset {}", derived.id);
    table::schema_table(&derived, &[]).print();
    Ok(())
}

fn handle_dataset(store: &Store, command: DatasetCommand) -> Result<()> {
    match command {
        DatasetCommand::List => {
            let mut table = Table::new(["id", "name", "rows", "patients", "identifier", "created"]);
            for dataset in store.list_datasets()? {
                table.push_row([
                    dataset.id.clone(),
                    dataset.name.clone(),
                    dataset.row_count.to_string(),
                    dataset.patient_count.to_string(),
                    dataset.patient_id.describe(),
                    dataset.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                ]);
            }
            table.print();
        }
        DatasetCommand::Show { id } => {
            let dataset = store.load_dataset(&id)?;
            println!("{} ({})", dataset.name, dataset.id);
            if let Some(parent) = &dataset.derived_from {
                println!("derived from {parent}");
            }
            println!(
                "{} row(s), {} patient(s), identifiers from {}",
                dataset.row_count,
                dataset.patient_count,
                dataset.patient_id.describe()
            );
            table::schema_table(&dataset, &[]).print();
        }
        DatasetCommand::Delete { id } => {
            store.delete_dataset(&id, &mut store.activity_sink())?;
            println!("deleted dataset {id}");
        }
    }
    Ok(())
}

fn read_filter(input: &FilterInput) -> Result<FilterGroup> {
    if let Some(path) = &input.filter {
        let text =
            fs::read_to_string(path).with_context(|| format!("Reading filter file {path:?}"))?;
        return FilterGroup::from_json(&text).with_context(|| format!("Parsing {path:?}"));
    }
    let rules = parse_rule_expressions(&input.rules)?;
    let logic = if input.any { Logic::Or } else { Logic::And };
    debug!("Built {:?} group from {} shorthand rule(s)", logic, rules.len());
    Ok(FilterGroup::new(logic, rules.into_iter().map(Into::into).collect()))
}

fn handle_cohort(store: &Store, command: CohortCommand) -> Result<()> {
    match command {
        CohortCommand::Create {
            dataset,
            name,
            input,
        } => {
            let dataset = store.load_dataset(&dataset)?;
            let filter = read_filter(&input)?;
            let lookup = store.cohort_lookup(&filter.referenced_cohorts())?;
            let cohort = Cohort::create(
                name,
                &dataset,
                &CsvSource,
                filter,
                &lookup,
                &mut store.activity_sink(),
            )?;
            store.save_cohort(&cohort)?;
            println!("cohort {}", cohort.id);
            println!("{} patient(s)", cohort.patient_count);
        }
        CohortCommand::Update { cohort, input } => {
            let mut cohort = store.load_cohort(&cohort)?;
            let dataset = store.load_dataset(&cohort.master_dataset_id)?;
            let filter = read_filter(&input)?;
            let lookup = store.cohort_lookup(&filter.referenced_cohorts())?;
            match cohort.update_filter(
                filter,
                &dataset,
                &CsvSource,
                &lookup,
                &mut store.activity_sink(),
            )? {
                Some(change) => {
                    store.save_cohort(&cohort)?;
                    println!(
                        "cohort {}: {} -> {} patient(s)",
                        cohort.id, change.previous_count, change.new_count
                    );
                }
                None => println!("cohort {}: filter unchanged", cohort.id),
            }
        }
        CohortCommand::Show { cohort, json } => {
            let cohort = store.load_cohort(&cohort)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&cohort)?);
            } else {
                table::cohort_table(std::slice::from_ref(&cohort)).print();
                println!("{}", serde_json::to_string_pretty(&cohort.filter)?);
            }
        }
        CohortCommand::List => table::cohort_table(&store.list_cohorts()?).print(),
        CohortCommand::Delete { cohort } => {
            store.delete_cohort(&cohort, &mut store.activity_sink())?;
            println!("deleted cohort {cohort}");
        }
    }
    Ok(())
}

fn handle_filter(store: &Store, command: FilterCommand) -> Result<()> {
    match command {
        FilterCommand::Save {
            name,
            dataset,
            input,
        } => {
            let dataset = store.load_dataset(&dataset)?;
            let filter = read_filter(&input)?;
            let lookup = store.cohort_lookup(&filter.referenced_cohorts())?;
            let issues = validate(&filter, &dataset.columns, &lookup);
            if !issues.is_empty() {
                return Err(EngineError::validation(issues).into());
            }
            let saved = SavedFilter::from_dataset(name, filter, &dataset);
            store.save_filter(&saved)?;
            store.activity_sink().record(
                ActivityEvent::new(ActivityAction::FilterSaved, &saved.id).with_metadata(json!({
                    "name": saved.name,
                    "datasetId": dataset.id,
                    "ruleCount": saved.filter.rule_count(),
                })),
            )?;
            println!("saved filter {}", saved.id);
        }
        FilterCommand::List => {
            let mut table = Table::new(["id", "name", "rules", "uses", "created"]);
            for saved in store.list_filters()? {
                table.push_row([
                    saved.id.clone(),
                    saved.name.clone(),
                    saved.filter.rule_count().to_string(),
                    saved.usage_count.to_string(),
                    saved.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                ]);
            }
            table.print();
        }
        FilterCommand::Apply(args) => handle_apply(store, &args)?,
    }
    Ok(())
}

fn handle_apply(store: &Store, args: &ApplyArgs) -> Result<()> {
    let mut saved = store.load_filter(&args.saved)?;
    let dataset = store.load_dataset(&args.dataset)?;
    let suggester: Option<Arc<dyn SuggestionSource>> = if args.no_suggest {
        None
    } else {
        Some(Arc::new(SimilaritySuggester::default()))
    };
    let options = RemapOptions {
        auto_accept: args.auto_accept,
        timeout: Duration::from_millis(args.timeout_ms),
    };
    let mut plan = plan_remap(&saved, &dataset, suggester, &options);
    for (source, target) in &args.mappings {
        plan.confirm(source, target)
            .with_context(|| format!("Mapping '{source}' to '{target}'"))?;
    }
    if args.accept_suggestions {
        plan.confirm_suggested();
    }
    table::remap_table(&plan).print();

    let adapted = plan.apply(&saved.filter)?;
    let lookup = store.cohort_lookup(&adapted.referenced_cohorts())?;
    let cohort = Cohort::create_from_saved(
        args.name.clone(),
        &dataset,
        &CsvSource,
        &mut saved,
        adapted,
        &lookup,
        &mut store.activity_sink(),
    )?;
    store.save_cohort(&cohort)?;
    store.save_filter(&saved)?;
    println!("cohort {}", cohort.id);
    println!("{} patient(s)", cohort.patient_count);
    Ok(())
}

fn handle_compare(store: &Store, args: &cli::CompareArgs) -> Result<()> {
    let cohorts = args
        .cohorts
        .iter()
        .map(|id| store.load_cohort(id))
        .collect::<Result<Vec<_>, _>>()?;
    let refs = cohorts.iter().collect::<Vec<_>>();
    let counts = store.master_counts(&cohorts)?;
    let mut cache = ComparisonCache::new();
    let result = run_comparison(&refs, &counts, &mut cache, &mut store.activity_sink())?;
    store.save_comparison(&result)?;

    if let Some(path) = &args.output {
        let mut writer = io_utils::open_output(Some(path))?;
        serde_json::to_writer_pretty(&mut writer, &result)
            .with_context(|| format!("Writing comparison to {path:?}"))?;
        writeln!(writer)?;
        writer.flush()?;
        if io_utils::is_dash(path) {
            return Ok(());
        }
        info!("Comparison '{}' written to {path:?}", result.id);
    }
    let (stats, pairs) = table::comparison_tables(&result);
    println!("comparison {}", result.id);
    stats.print();
    println!();
    pairs.print();
    println!();
    println!(
        "union: {}  in every cohort: {}",
        result.union_size, result.intersection_of_all_size
    );
    Ok(())
}

fn handle_export(store: &Store, args: &cli::ExportArgs) -> Result<()> {
    let mut writer = io_utils::open_output(args.output.as_deref())?;
    let summary = match (&args.cohort, &args.dataset) {
        (Some(cohort), _) => {
            let cohort = store.load_cohort(cohort)?;
            let dataset = store.load_dataset(&cohort.master_dataset_id)?;
            export::export_cohort(&cohort, &dataset, &CsvSource, args.format, &mut writer)?
        }
        (None, Some(dataset)) => {
            let dataset = store.load_dataset(dataset)?;
            export::export_dataset(&dataset, &CsvSource, args.format, &mut writer)?
        }
        (None, None) => anyhow::bail!("Either --cohort or --dataset is required"),
    };
    debug!(
        "Export scanned {} row(s), wrote {}",
        summary.rows_scanned, summary.rows_written
    );
    Ok(())
}
