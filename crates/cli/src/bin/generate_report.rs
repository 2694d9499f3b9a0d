use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::{fs, path::PathBuf};

use ledger_scanner::{discover_channels, scan_batch, ChannelClassifier};
use models::{ChannelFilter, SourceFailure};
use report_engine::{table_to_json_rows, write_csv, Accumulator};

#[derive(Parser, Debug)]
#[command(
    name = "generate-report",
    about = "Pivot invoice-ledger CSVs into a payment summary by activation month."
)]
struct Args {
    /// Ledger CSV files to aggregate
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Channel to include (repeatable, case-insensitive); default: all channels
    #[arg(short, long = "channel")]
    channels: Vec<String>,

    /// List the distinct channel values found in the inputs and exit
    #[arg(long)]
    list_channels: bool,

    /// Report output format
    #[arg(long, value_enum, default_value_t = Format::Csv)]
    format: Format,

    /// Output file; defaults to stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Format {
    Csv,
    Json,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let mut buffers: Vec<(String, Vec<u8>)> = Vec::new();
    for path in &args.inputs {
        let bytes = fs::read(path).with_context(|| format!("Reading {}", path.display()))?;
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();
        buffers.push((name, bytes));
    }
    let sources = buffers.iter().map(|(n, b)| (n.as_str(), b.as_slice()));

    let classifier = ChannelClassifier::default();

    if args.list_channels {
        let discovery = discover_channels(sources, &classifier);
        print_failures(&discovery.failures);
        for channel in &discovery.channels {
            println!("{channel}");
        }
        return Ok(());
    }

    let filter = ChannelFilter::new(&args.channels);
    let batch = scan_batch(sources, &classifier, &filter);
    print_failures(&batch.failures);
    tracing::info!(
        entries = batch.entries.len(),
        failed_sources = batch.failures.len(),
        "scan complete"
    );

    let mut accumulator = Accumulator::new();
    accumulator.extend(batch.entries);
    let table = accumulator.render();

    match args.format {
        Format::Csv => {
            if table.is_empty() {
                eprintln!("No data matched the requested channels");
            }
            match &args.output {
                Some(path) => {
                    let file = fs::File::create(path)
                        .with_context(|| format!("Cannot write {}", path.display()))?;
                    write_csv(&table, file)?;
                    println!("OK: wrote {}", path.display());
                }
                None => write_csv(&table, std::io::stdout().lock())?,
            }
        }
        Format::Json => {
            let payload = serde_json::json!({
                "status": if table.is_empty() { "no_data" } else { "success" },
                "columns": table.columns(),
                "report": table_to_json_rows(&table),
                "failed_files": batch.failures,
            });
            let text = serde_json::to_string_pretty(&payload)?;
            match &args.output {
                Some(path) => {
                    fs::write(path, text)
                        .with_context(|| format!("Cannot write {}", path.display()))?;
                    println!("OK: wrote {}", path.display());
                }
                None => println!("{text}"),
            }
        }
    }

    Ok(())
}

fn print_failures(failures: &[SourceFailure]) {
    for f in failures {
        eprintln!("Skipping {}: {}", f.source, f.error);
    }
}
