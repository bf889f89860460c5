use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use courier_api::{CommitPolicy, CourierApi, CourierConfig, CourierError, DispatchResponse, InProcApi, LoadResponse};
use courier_core::{format_timestamp, parse_timestamp, Order};
use courier_sink::MemorySink;
use courier_store::OrderStore;
use tracing::{error, info, warn};

/// Exit status for a well-formed query that matched nothing.
const EXIT_NOT_FOUND: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "courierctl", version, about = "Courier CLI: order feeds and dispatch batches")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Audit log target (default: $COURIER_LOG_PATH or courier.log)
    #[arg(long = "log-path", global = true)]
    log_path: Option<PathBuf>,

    /// Dispatch result target (default: $COURIER_RESULT_PATH or dispatch.txt)
    #[arg(long = "result-path", global = true)]
    result_path: Option<PathBuf>,

    /// What stays loaded when a batch has a bad line
    #[arg(long = "commit", value_enum, global = true)]
    commit: Option<Commit>,

    /// Upper bound for each result/audit write
    #[arg(long = "sink-timeout-ms", global = true)]
    sink_timeout_ms: Option<u64>,

    /// Serve Prometheus metrics on host:port while running
    #[arg(long = "metrics-addr", env = "COURIER_METRICS_ADDR", global = true)]
    metrics_addr: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Commit { Atomic, Progressive }

impl From<Commit> for CommitPolicy {
    fn from(c: Commit) -> Self {
        match c {
            Commit::Atomic => CommitPolicy::Atomic,
            Commit::Progressive => CommitPolicy::Progressive,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse order files without loading them
    Check {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Load order files into a fresh store and report what was accepted
    Load {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Load order files, then compute and record the dispatch batch for an area
    Dispatch {
        /// Order files, loaded in the given order
        #[arg(long = "orders", required = true)]
        orders: Vec<PathBuf>,
        #[arg(long = "area")]
        area: String,
        /// Window start, e.g. "2024-01-01 09:00:00"
        #[arg(long = "start", value_parser = parse_ts)]
        start: NaiveDateTime,
        /// Window end (inclusive)
        #[arg(long = "end", value_parser = parse_ts)]
        end: NaiveDateTime,
        /// Print records instead of appending them to the result target
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
}

fn parse_ts(s: &str) -> std::result::Result<NaiveDateTime, String> {
    parse_timestamp(s).ok_or_else(|| format!("invalid timestamp {:?} (expect YYYY-MM-DD HH:MM:SS)", s))
}

fn init_tracing() {
    let env = std::env::var("COURIER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics(addr: Option<&str>) {
    if let Some(addr) = addr {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid COURIER_METRICS_ADDR; expected host:port");
        }
    }
}

fn build_config(cli: &Cli) -> Result<CourierConfig> {
    let mut cfg = CourierConfig::from_env()?;
    if let Some(p) = &cli.log_path { cfg.log_path = p.clone(); }
    if let Some(p) = &cli.result_path { cfg.result_path = p.clone(); }
    if let Some(c) = cli.commit { cfg.commit_policy = c.into(); }
    if let Some(ms) = cli.sink_timeout_ms {
        anyhow::ensure!(ms > 0, "--sink-timeout-ms must be greater than zero");
        cfg.sink_timeout = std::time::Duration::from_millis(ms);
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    init_metrics(cli.metrics_addr.as_deref());

    if let Err(e) = run(cli).await {
        let code = match e.downcast_ref::<CourierError>() {
            Some(ce) if ce.is_not_found() => EXIT_NOT_FOUND,
            _ => 1,
        };
        if code == EXIT_NOT_FOUND {
            info!(error = %e, "no dispatch batch");
        } else {
            error!(error = %e, "courierctl failed");
        }
        eprintln!("{:#}", e);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let cfg = build_config(&cli)?;
    let output = cli.output;
    match cli.command {
        Commands::Check { files } => {
            info!(files = files.len(), "check invoked");
            for path in files {
                let f = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
                let orders = courier_ingest::parse_batch(BufReader::new(f))
                    .map_err(CourierError::from)
                    .with_context(|| format!("checking {}", path.display()))?;
                match output {
                    Output::Human => println!("{}: ok, {} orders", path.display(), orders.len()),
                    Output::Json => println!("{}", serde_json::json!({ "file": path.display().to_string(), "orders": orders.len() })),
                }
            }
        }
        Commands::Load { files } => {
            info!(files = files.len(), policy = ?cfg.commit_policy, "load invoked");
            let api = InProcApi::new(cfg);
            load_all(&api, &files, output).await?;
            let stats = api.stats().await?;
            match output {
                Output::Human => println!("store: {} orders (epoch {})", stats.orders, stats.epoch),
                Output::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
            }
        }
        Commands::Dispatch { orders, area, start, end, dry_run } => {
            info!(area = %area, start = %format_timestamp(start), end = %format_timestamp(end), dry_run, "dispatch invoked");
            let api = if dry_run {
                let sink = Arc::new(MemorySink::new());
                InProcApi::with_parts(Arc::new(OrderStore::new()), sink, cfg)
            } else {
                InProcApi::new(cfg)
            };
            load_all(&api, &orders, output).await?;
            match api.filter(&area, start, end).await {
                Ok(resp) => print_dispatch(&resp, output, dry_run)?,
                Err(e) => {
                    if let Some(batch) = e.batch() {
                        eprintln!("dispatch batch computed; recording failed or unconfirmed:");
                        print_orders(batch, output)?;
                    }
                    return Err(e.into());
                }
            }
        }
    }
    Ok(())
}

async fn load_all(api: &InProcApi, files: &[PathBuf], output: Output) -> Result<()> {
    for path in files {
        let resp = api
            .load_file(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?;
        print_load(path, &resp, output)?;
    }
    Ok(())
}

fn print_load(path: &Path, resp: &LoadResponse, output: Output) -> Result<()> {
    for w in &resp.warnings { eprintln!("warning: {}", w); }
    match output {
        Output::Human => println!("{}: {} orders accepted", path.display(), resp.report.accepted),
        Output::Json => println!("{}", serde_json::to_string(&resp.report)?),
    }
    Ok(())
}

fn print_dispatch(resp: &DispatchResponse, output: Output, dry_run: bool) -> Result<()> {
    for w in &resp.meta.warnings { eprintln!("warning: {}", w); }
    match output {
        Output::Human => {
            println!(
                "anchor {}  cutoff {}  candidates {}  selected {}{}",
                format_timestamp(resp.meta.anchor),
                format_timestamp(resp.meta.cutoff),
                resp.meta.candidates,
                resp.batch.len(),
                if dry_run { "  (dry run, not recorded)" } else { "" }
            );
            print_orders(&resp.batch, output)?;
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(resp)?),
    }
    Ok(())
}

fn print_orders(orders: &[Order], output: Output) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<36}  {:>8}  {:<16}  DELIVERY", "ID", "WEIGHT", "AREA");
            for o in orders {
                println!("{:<36}  {:>8}  {:<16}  {}", o.id(), o.weight(), o.area(), format_timestamp(o.delivery_time()));
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(orders)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dispatch_invocation() {
        let cli = Cli::try_parse_from([
            "courierctl", "-o", "json", "--commit", "progressive",
            "dispatch", "--orders", "a.txt", "--orders", "b.txt",
            "--area", "North", "--start", "2024-01-01 09:00:00", "--end", "2024-01-01 12:00",
        ])
        .unwrap();
        assert_eq!(cli.output, Output::Json);
        assert_eq!(cli.commit, Some(Commit::Progressive));
        match cli.command {
            Commands::Dispatch { orders, area, start, end, dry_run } => {
                assert_eq!(orders, vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")]);
                assert_eq!(area, "North");
                assert_eq!(format_timestamp(start), "2024-01-01 09:00:00");
                assert_eq!(format_timestamp(end), "2024-01-01 12:00:00");
                assert!(!dry_run);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn rejects_bad_timestamp_and_missing_files() {
        assert!(Cli::try_parse_from(["courierctl", "dispatch", "--orders", "a", "--area", "N", "--start", "01/01/2024", "--end", "2024-01-01 10:00:00"]).is_err());
        assert!(Cli::try_parse_from(["courierctl", "load"]).is_err());
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::try_parse_from([
            "courierctl", "--result-path", "/tmp/out.txt", "--sink-timeout-ms", "75", "check", "x.txt",
        ])
        .unwrap();
        let cfg = build_config(&cli).unwrap();
        assert_eq!(cfg.result_path, PathBuf::from("/tmp/out.txt"));
        assert_eq!(cfg.sink_timeout, std::time::Duration::from_millis(75));
    }
}
