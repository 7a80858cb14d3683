//! Summarise delivery latency per topic and consumer from a mail-consumer log.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use mail_consumer::report;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Consumer log to analyse
    #[arg(long, default_value = "email-consumer.log")]
    input: PathBuf,

    /// CSV file the report rows are appended to
    #[arg(long, default_value = "log_report.csv")]
    output: PathBuf,

    /// JSON file holding the report counter
    #[arg(long, default_value = "state.json")]
    state: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (report_id, rows) = report::run(&cli.input, &cli.output, &cli.state)
        .with_context(|| format!("Failed to build report from {}", cli.input.display()))?;

    println!(
        "Success! Report {report_id} updated: {} ({rows} rows)",
        cli.output.display()
    );
    Ok(())
}
