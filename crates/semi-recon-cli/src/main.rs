use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use semi_recon_api::{ReconApi, API_CONTRACT_VERSION};
use semi_recon_core::{Cutoff, GroupingKey, IdentityColumns, Measures};
use semi_recon_store_file::{verify_report, ReadOptions, ReportWriter};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "srecon.v1";

#[derive(Debug, Parser)]
#[command(name = "srecon")]
#[command(about = "Semiconductor operations reconciliation CLI")]
struct Cli {
    /// Report configuration (YAML). The built-in layout is used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `semi_recon_core=debug`. Overrides RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Resolve, pivot, fold and merge every input into a sealed report directory.
    Report(ReportArgs),
    /// Resolve and pivot a single configured source.
    Pivot(PivotArgs),
    /// Resolve one table against a mapping table.
    Resolve(ResolveArgs),
    Mapping {
        #[command(subcommand)]
        command: MappingCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Check a report directory against its manifest digests.
    Verify(VerifyArgs),
}

#[derive(Debug, Args)]
struct ReportArgs {
    #[arg(long = "input", required = true)]
    inputs: Vec<PathBuf>,
    #[arg(long)]
    mapping: Option<PathBuf>,
    /// First month reported individually (YYYY-MM); earlier months are folded.
    #[arg(long)]
    cutoff: Option<Cutoff>,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct PivotArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    mapping: Option<PathBuf>,
    #[arg(long)]
    cutoff: Option<Cutoff>,
    /// Also write the pivot as a sealed report directory.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ResolveArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    mapping: PathBuf,
    #[arg(long)]
    wafer: String,
    #[arg(long)]
    spec: String,
    #[arg(long)]
    product: String,
    /// Extra column kept distinct during re-aggregation; repeatable.
    #[arg(long = "group")]
    group: Vec<String>,
    /// Column summed during re-aggregation; repeatable. Numeric columns are
    /// detected when none is given.
    #[arg(long = "measure")]
    measure: Vec<String>,
    #[arg(long)]
    sheet: Option<String>,
    #[arg(long, default_value_t = 0)]
    header_row: usize,
}

#[derive(Debug, Subcommand)]
enum MappingCommand {
    /// Validate a mapping table and report dropped rows and ambiguities.
    Check(MappingCheckArgs),
}

#[derive(Debug, Args)]
struct MappingCheckArgs {
    #[arg(long)]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective report configuration.
    Show,
}

#[derive(Debug, Args)]
struct VerifyArgs {
    #[arg(long)]
    dir: PathBuf,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(log_level: Option<&str>) -> Result<()> {
    let filter = match log_level {
        Some(level) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid log level `{level}`"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to install log subscriber: {err}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref())?;
    tracing::debug!(command = ?cli.command, "dispatching");
    let config = cli.config.as_deref();
    match cli.command {
        Command::Report(args) => run_report(&ReconApi::from_config_path(config)?, &args),
        Command::Pivot(args) => run_pivot(&ReconApi::from_config_path(config)?, &args),
        Command::Resolve(args) => run_resolve(&args),
        Command::Mapping { command: MappingCommand::Check(args) } => run_mapping_check(&args),
        Command::Config { command: ConfigCommand::Show } => {
            run_config_show(&ReconApi::from_config_path(config)?)
        }
        Command::Verify(args) => run_verify(&args),
    }
}

fn run_report(api: &ReconApi, args: &ReportArgs) -> Result<()> {
    let outcome = api.run_files(&args.inputs, args.mapping.as_deref(), args.cutoff.as_ref());
    let manifest = api.write_report(&outcome, &args.out)?;
    let skipped_sections =
        outcome.summary.as_ref().map(|summary| summary.skipped_sections().to_vec());
    emit_json(serde_json::json!({
        "api_contract_version": API_CONTRACT_VERSION,
        "out": args.out.display().to_string(),
        "status": manifest.status,
        "cutoff": outcome.cutoff,
        "sources": outcome.sources.iter().map(|source| serde_json::json!({
            "file": source.file,
            "rows": source.pivot.rows().len(),
            "columns": source.pivot.column_names(),
            "unknown_time_rows": source.unknown_time_rows,
            "changed_identities": source.resolution.as_ref().map(|audit| audit.changes.len()),
        })).collect::<Vec<_>>(),
        "summary_rows": outcome.summary.as_ref().map(|summary| summary.keys().len()),
        "skipped_sections": skipped_sections,
        "mapping": outcome.mapping,
        "failures": outcome.failures,
        "unconfigured_files": outcome.unconfigured_files,
        "missing_files": outcome.missing_files,
        "files": manifest.files,
    }))
}

fn run_pivot(api: &ReconApi, args: &PivotArgs) -> Result<()> {
    let report = api.pivot_file(&args.input, args.mapping.as_deref(), args.cutoff.as_ref())?;
    let table = report.pivot.to_table();
    if let Some(out) = &args.out {
        let mut writer = ReportWriter::create(out)?;
        writer.write_pivot(&semi_recon_api::pivot_file_name(&report.file), &report.pivot)?;
        writer.finish()?;
    }
    emit_json(serde_json::json!({
        "file": report.file,
        "unknown_time_rows": report.unknown_time_rows,
        "resolution": report.resolution,
        "table": table,
    }))
}

fn run_resolve(args: &ResolveArgs) -> Result<()> {
    let identity = IdentityColumns::new(&args.wafer, &args.spec, &args.product);
    let options = ReadOptions {
        sheet: args.sheet.clone(),
        header_row: args.header_row,
    };
    let measures = if args.measure.is_empty() {
        Measures::Inferred
    } else {
        Measures::named(args.measure.iter().cloned())
    };
    let (table, audit, mapping) = ReconApi::resolve_file(
        &args.input,
        &options,
        &args.mapping,
        &identity,
        &GroupingKey::with_columns(args.group.iter().cloned()),
        &measures,
    )?;
    emit_json(serde_json::json!({
        "mapping": mapping,
        "audit": audit,
        "table": table,
    }))
}

fn run_mapping_check(args: &MappingCheckArgs) -> Result<()> {
    let summary = ReconApi::check_mapping(&args.input)?;
    emit_json(serde_json::json!({
        "valid": true,
        "rules": summary.rules,
        "dropped_rows": summary.dropped_rows,
        "ambiguous": !summary.ambiguities.is_empty(),
        "ambiguities": summary.ambiguities,
    }))
}

fn run_config_show(api: &ReconApi) -> Result<()> {
    let config = serde_json::to_value(api.config()).context("failed to serialize configuration")?;
    emit_json(serde_json::json!({ "config": config }))
}

fn run_verify(args: &VerifyArgs) -> Result<()> {
    let manifest = verify_report(&args.dir)?;
    emit_json(serde_json::json!({
        "verified": true,
        "status": manifest.status,
        "generated_at": manifest.generated_at,
        "files": manifest.files.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_payloads_gain_a_contract_version() {
        let value = with_contract_version(serde_json::json!({ "rules": 3 }));
        assert_eq!(value["contract_version"], CLI_CONTRACT_VERSION);
        assert_eq!(value["rules"], 3);
    }

    #[test]
    fn scalar_payloads_are_wrapped() {
        let value = with_contract_version(serde_json::json!([1, 2]));
        assert_eq!(value["payload"], serde_json::json!([1, 2]));
    }

    #[test]
    fn cutoff_arguments_are_validated_by_the_parser() {
        let parse = |cutoff: &str| {
            Cli::try_parse_from(["srecon", "pivot", "--input", "a.csv", "--cutoff", cutoff])
        };
        assert!(parse("2025-13").is_err());
        assert!(parse("2025-03").is_ok());
    }
}
