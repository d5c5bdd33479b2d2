use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{ArgGroup, Parser};
use invsync_sync::{run_sync_from_env, RunMode, RunSummary};
use tracing::error;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "invsync=info,invsync_sync=info,invsync_adapters=info,invsync_storage=info";

#[derive(Debug, Parser)]
#[command(name = "invsync")]
#[command(about = "Reconcile quote and job inventory into the spreadsheet ledger")]
#[command(group(ArgGroup::new("mode").args(["csv", "jobber", "both"])))]
struct Cli {
    /// Seed ledger rows from the product catalog CSV.
    #[arg(long)]
    csv: bool,
    /// Reconcile counts from Jobber quotes and jobs (default).
    #[arg(long)]
    jobber: bool,
    /// Catalog seed followed by the Jobber reconcile.
    #[arg(long)]
    both: bool,
    /// Catalog CSV to import instead of INVSYNC_CATALOG_CSV.
    #[arg(long, value_name = "PATH")]
    csv_path: Option<PathBuf>,
}

impl Cli {
    fn mode(&self) -> RunMode {
        if self.both {
            RunMode::Both
        } else if self.csv {
            RunMode::Catalog
        } else {
            RunMode::Activity
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_target(true)
        .init();
}

fn print_summary(summary: &RunSummary) {
    println!(
        "sync complete: run_id={} mode={:?} updated={} appended={} zeroed={}",
        summary.run_id, summary.mode, summary.rows_updated, summary.rows_appended, summary.rows_zeroed
    );
    for source in &summary.sources {
        println!(
            "  {}: pages={} records={} observations={}",
            source.source, source.pages, source.records, source.observations
        );
    }
    if summary.catalog_rows > 0 || summary.catalog_error.is_some() {
        println!(
            "  catalog: rows={}{}",
            summary.catalog_rows,
            summary
                .catalog_error
                .as_deref()
                .map(|e| format!(" error={e}"))
                .unwrap_or_default()
        );
    }
    if let Some(dir) = &summary.reports_dir {
        println!("  reports: {dir}");
    }
}

async fn run(cli: Cli) -> Result<()> {
    let summary = run_sync_from_env(cli.mode(), cli.csv_path).await?;
    print_summary(&summary);
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
