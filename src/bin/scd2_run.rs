use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use scd2_rs::config::{ConfigOverrides, EngineOverrides, MalformedPolicy, Scd2Config, StoreOverrides};
use scd2_rs::{
    parse_snapshot, validate, DimensionStore, MemoryDimensionStore, PersistentDimensionStore,
    RunReport, Scd2Engine,
};
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn print_help() {
    eprintln!(
        r#"scd2_run - Reconcile one snapshot into an SCD Type 2 dimension

USAGE:
    scd2_run --snapshot <FILE> [OPTIONS]
    scd2_run --validate-only [OPTIONS]

OPTIONS:
    -s, --snapshot <FILE>   Snapshot to reconcile (JSON array or JSON lines)
    -c, --config <FILE>     Path to config file (TOML)
    -d, --data-dir <DIR>    RocksDB directory of the dimension [default: in-memory]
        --schema <FILE>     Dimension schema (JSON) [default: player rating]
        --skip-malformed    Skip records that fail normalization instead of aborting
        --dry-run           Compute and report the changeset without applying it
        --validate-only     Validate the stored history and exit
        --repair            Run RocksDB repair before opening
    -h, --help              Print help

ENVIRONMENT:
    SCD2_CONFIG                   Path to config file
    SCD2_STORE__DATA_DIR          RocksDB directory
    SCD2_ENGINE__MALFORMED_POLICY fail-fast | skip
    RUST_LOG                      Log filter [default: info]

The run report is printed to stdout as JSON. The exit status is non-zero when
the run fails or post-merge validation finds violations.
"#
    );
}

fn build_overrides() -> ConfigOverrides {
    let mut overrides = ConfigOverrides::default();

    if has_flag("--skip-malformed") {
        overrides.engine = Some(EngineOverrides {
            malformed_policy: Some(MalformedPolicy::Skip),
            ..Default::default()
        });
    }

    let mut store_overrides = StoreOverrides::default();
    if let Some(dir) = parse_arg("--data-dir").or_else(|| parse_arg("-d")) {
        store_overrides.data_dir = Some(dir.into());
    }
    if has_flag("--repair") {
        store_overrides.repair = Some(true);
    }
    if store_overrides.data_dir.is_some() || store_overrides.repair.is_some() {
        overrides.store = Some(store_overrides);
    }

    if let Some(schema) = parse_arg("--schema") {
        overrides.schema = Some(schema.into());
    }
    overrides
}

fn reconcile<S: DimensionStore>(
    engine: &Scd2Engine,
    store: &mut S,
    snapshot: &Path,
    dry_run: bool,
) -> anyhow::Result<RunReport> {
    let text = fs::read_to_string(snapshot)
        .with_context(|| format!("cannot read snapshot {}", snapshot.display()))?;
    let raws = parse_snapshot(&text)
        .with_context(|| format!("cannot parse snapshot {}", snapshot.display()))?;

    let plan = engine.plan(&*store, &raws, OffsetDateTime::now_utc())?;
    if dry_run {
        return Ok(plan.preview());
    }
    Ok(engine.apply_plan(store, plan)?)
}

fn run_with_store<S: DimensionStore>(
    engine: &Scd2Engine,
    store: &mut S,
    snapshot: Option<&Path>,
) -> anyhow::Result<bool> {
    if has_flag("--validate-only") {
        let violations = validate(&*store)?;
        println!("{}", serde_json::to_string_pretty(&violations)?);
        return Ok(violations.is_empty());
    }

    let snapshot = snapshot.context("--snapshot is required")?;
    let report = reconcile(engine, store, snapshot, has_flag("--dry-run"))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.succeeded() {
        tracing::error!(
            run_id = %report.run_id,
            violations = report.violations.len(),
            "Post-merge validation failed"
        );
    }
    Ok(report.succeeded())
}

fn run() -> anyhow::Result<bool> {
    let config_path = parse_arg("--config")
        .or_else(|| parse_arg("-c"))
        .or_else(|| std::env::var("SCD2_CONFIG").ok())
        .map(PathBuf::from);
    let config = Scd2Config::load(config_path.as_deref(), build_overrides())?;
    let schema = config.load_schema()?;
    let engine = Scd2Engine::new(schema, config.engine.clone())?;

    let snapshot = parse_arg("--snapshot")
        .or_else(|| parse_arg("-s"))
        .map(PathBuf::from);

    match &config.store.data_dir {
        Some(dir) => {
            let mut store =
                PersistentDimensionStore::open_with_options(dir, config.store.open_options())
                    .with_context(|| format!("cannot open store at {}", dir.display()))?;
            run_with_store(&engine, &mut store, snapshot.as_deref())
        }
        None => {
            tracing::warn!("No data directory configured, using an in-memory store");
            let mut store = MemoryDimensionStore::new();
            run_with_store(&engine, &mut store, snapshot.as_deref())
        }
    }
}

fn main() -> ExitCode {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return ExitCode::SUCCESS;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(err) => {
            tracing::error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}
