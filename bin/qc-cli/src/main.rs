use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use qc_drift::DriftDetector;
use qc_engine::{AuditOrchestrator, AuditReport};
use qc_history::{HistoryStore, InMemoryHistoryStore, SqliteHistoryStore};
use qc_io::checksum::verify_bundle;
use qc_io::report::{summary_text, CHECKSUMS};
use qc_io::{read_measurements, write_report_bundle, ChartSeries};
use qc_protocol::AuditRecord;
use qc_rules::{load_config, AuditorConfig, RuleStore, StaticRuleStore};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_LOG_FILTER: &str =
    "qc_cli=info,qc_engine=info,qc_history=info,qc_rules=info,qc_io=info,qc_drift=info";

#[derive(Clone, Debug, Parser)]
#[command(name = "qc-cli")]
#[command(about = "Quality-control auditor for imaging and therapy equipment")]
struct Cli {
    #[arg(long = "config", default_value = "config.yaml", global = true)]
    config_path: PathBuf,
    #[arg(long = "db", default_value = "qc_history.db", global = true)]
    db_path: PathBuf,
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Clone, Debug, Subcommand)]
enum CliCommand {
    /// Evaluate a measurement log, append it to history and assess drift.
    Audit {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value = "qc_reports")]
        out_dir: PathBuf,
        /// Keep history in memory for this run only.
        #[arg(long)]
        ephemeral: bool,
    },
    /// Validate the configuration and list the configured pairs.
    CheckConfig,
    /// Print the stored series for one machine and metric, or list every
    /// stored pair when both are omitted.
    History {
        machine: Option<String>,
        #[arg(requires = "machine")]
        metric: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Reassess drift from stored history without auditing new data.
    Drift { machine: String, metric: String },
    /// Check a report bundle against its checksum manifest.
    VerifyReport {
        #[arg(long, default_value = "qc_reports")]
        dir: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_deref())?;

    match cli.command {
        CliCommand::Audit {
            input,
            out_dir,
            ephemeral,
        } => {
            let config = load_auditor_config(&cli.config_path)?;
            if ephemeral {
                run_audit(config, InMemoryHistoryStore::default(), &input, &out_dir)
            } else {
                let history = open_history(&cli.db_path)?;
                run_audit(config, history, &input, &out_dir)
            }
        }
        CliCommand::CheckConfig => {
            let config = load_auditor_config(&cli.config_path)?;
            let machines: BTreeSet<&str> = config.rules.machines().collect();
            println!(
                "configuration ok: rules={} machines={} drift.min_points={} drift.alpha={}",
                config.rules.len(),
                machines.len(),
                config.drift.min_points,
                config.drift.alpha
            );
            for (machine, metric) in config.rules.keys() {
                println!("  {machine} / {metric}");
            }
            Ok(())
        }
        CliCommand::History {
            machine,
            metric,
            json,
        } => {
            let history = open_history(&cli.db_path)?;
            let (machine, metric) = match (machine, metric) {
                (Some(machine), Some(metric)) => (machine, metric),
                (None, None) => return list_series(&history, json),
                _ => bail!("history needs both a machine and a metric, or neither"),
            };
            let series = history
                .query(&machine, &metric)
                .with_context(|| format!("failed to read history for {machine}/{metric}"))?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&series).context("failed to format history")?
                );
            } else {
                print_series(&machine, &metric, &series);
            }
            Ok(())
        }
        CliCommand::Drift { machine, metric } => {
            let config = load_auditor_config(&cli.config_path)?;
            let history = open_history(&cli.db_path)?;
            let orchestrator = orchestrator(config, history);
            let policy = orchestrator.detector().policy();
            info!(
                machine = %machine,
                metric = %metric,
                min_points = policy.min_points,
                alpha = policy.alpha,
                "reassessing drift from stored history"
            );
            let assessment = orchestrator
                .assess_series(&machine, &metric)
                .with_context(|| format!("failed to assess drift for {machine}/{metric}"))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&assessment).context("failed to format assessment")?
            );
            Ok(())
        }
        CliCommand::VerifyReport { dir } => {
            let mismatched = verify_bundle(&dir, CHECKSUMS)?;
            if mismatched.is_empty() {
                println!("report verified: {}", dir.display());
                return Ok(());
            }
            for entry in &mismatched {
                println!("MISMATCH {}", entry.path);
            }
            bail!(
                "{} report file(s) do not match {}",
                mismatched.len(),
                dir.join(CHECKSUMS).display()
            )
        }
    }
}

fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

fn load_auditor_config(path: &Path) -> anyhow::Result<AuditorConfig> {
    load_config(path).with_context(|| format!("invalid configuration {}", path.display()))
}

fn open_history(path: &Path) -> anyhow::Result<SqliteHistoryStore> {
    SqliteHistoryStore::open(path)
        .with_context(|| format!("failed to open history database {}", path.display()))
}

fn orchestrator<H: HistoryStore>(
    config: AuditorConfig,
    history: H,
) -> AuditOrchestrator<StaticRuleStore, H> {
    AuditOrchestrator::new(
        StaticRuleStore::new(config.rules),
        history,
        DriftDetector::new(config.drift),
    )
}

fn run_audit<H: HistoryStore>(
    config: AuditorConfig,
    history: H,
    input: &Path,
    out_dir: &Path,
) -> anyhow::Result<()> {
    let rows = read_measurements(input)?;
    let orchestrator = orchestrator(config, history);

    match orchestrator.run(&rows) {
        Ok(report) => {
            let charts = chart_series(&orchestrator, &report)?;
            let bundle = write_report_bundle(out_dir, &report, &charts)?;
            println!("{}", summary_text(&report));
            println!("reports written to {}", bundle.root.display());
            Ok(())
        }
        Err(incomplete) => {
            // Partial results are written before the error surfaces.
            if let Err(err) = write_report_bundle(out_dir, &incomplete.partial, &[]) {
                warn!(error = %format!("{err:#}"), "failed to write partial report");
            }
            println!("{}", summary_text(&incomplete.partial));
            Err(anyhow::Error::new(incomplete))
        }
    }
}

fn chart_series<H: HistoryStore>(
    orchestrator: &AuditOrchestrator<StaticRuleStore, H>,
    report: &AuditReport,
) -> anyhow::Result<Vec<ChartSeries>> {
    let mut charts = Vec::with_capacity(report.drift.len());
    for assessment in &report.drift {
        let (machine, metric) = assessment.key();
        let history = orchestrator
            .history()
            .query(&machine, &metric)
            .with_context(|| format!("failed to read history for {machine}/{metric}"))?;
        let rule = orchestrator
            .rules()
            .lookup(&machine, &metric)
            .with_context(|| format!("failed to look up rule for {machine}/{metric}"))?;
        charts.push(ChartSeries::from_history(
            &machine,
            &metric,
            &history,
            rule.as_ref(),
            Some(assessment),
        ));
    }
    info!(charts = charts.len(), "chart series prepared");
    Ok(charts)
}

fn list_series<H: HistoryStore>(history: &H, json: bool) -> anyhow::Result<()> {
    let keys = history
        .series_keys()
        .context("failed to list stored series")?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&keys).context("failed to format series list")?
        );
        return Ok(());
    }
    println!("{} stored series", keys.len());
    for (machine, metric) in &keys {
        println!("  {machine} / {metric}");
    }
    Ok(())
}

fn print_series(machine: &str, metric: &str, series: &[AuditRecord]) {
    println!("{machine} / {metric}: {} records", series.len());
    for record in series {
        let timestamp = record
            .timestamp
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        let value = record
            .value
            .map(|value| value.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{timestamp}  {value:>10}  {}", record.status.as_str());
    }
}
