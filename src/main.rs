//! Command-line front end for partfetch.

use anyhow::{Context, Result, bail};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use partfetch::{
    CentralDirectoryEntry, Cli, ExtractionOrchestrator, ExtractionRequest, ExtractionResult,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let orchestrator = ExtractionOrchestrator::new(cli.extractor_config());

    // Ctrl-C aborts in-flight requests instead of killing the process mid-write
    let cancel = orchestrator.cancellation_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    if cli.list {
        let entries = orchestrator.list_members(&cli.source).await?;
        print_members(&entries, cli.verbose > 0);
        return Ok(());
    }

    let destination = cli
        .destination()
        .context("cannot derive an output file name, pass -o")?;

    let bar = progress_bar(cli.quiet);
    let on_progress = |done: u64, total: u64| {
        if total > 0 && bar.length() != Some(total) {
            bar.set_length(total);
        }
        bar.set_position(done);
    };

    let result = if cli.download {
        orchestrator
            .download_partition_file(&cli.source, &destination, Some(&on_progress))
            .await
    } else {
        let partition = cli.partition.clone().unwrap_or_default();
        let request = ExtractionRequest::new(cli.source.clone(), partition, &destination)
            .with_options(cli.extraction_options());
        orchestrator
            .extract_partition(&request, Some(&on_progress))
            .await
    };
    bar.finish_and_clear();

    report(result)?;
    if !cli.quiet {
        eprintln!("wrote {}", destination.display());
    }
    Ok(())
}

fn report(result: ExtractionResult) -> Result<()> {
    match result.error {
        Some(failure) => bail!("{}: {}", failure.kind, failure.message),
        None => Ok(()),
    }
}

fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    bar
}

/// Print the archive's members, as a name list or a detailed table.
fn print_members(entries: &[CentralDirectoryEntry], verbose: bool) {
    if !verbose {
        for entry in entries {
            println!("{}", entry.file_name);
        }
        return;
    }

    println!(
        "{:>10}  {:>10}  {:>5}  {:>10}  {:>5}  Name",
        "Length", "Size", "Cmpr", "Date", "Time"
    );
    println!("{}", "-".repeat(70));

    let mut total_uncompressed = 0u64;
    let mut total_compressed = 0u64;
    let mut file_count = 0usize;

    for entry in entries {
        let (year, month, day) = entry.mod_date();
        let (hour, minute, _second) = entry.mod_time();
        println!(
            "{:>10}  {:>10}  {}  {:04}-{:02}-{:02}  {:02}:{:02}  {}",
            entry.uncompressed_size,
            entry.compressed_size,
            ratio(entry.compressed_size, entry.uncompressed_size),
            year,
            month,
            day,
            hour,
            minute,
            entry.file_name
        );

        if !entry.is_directory {
            total_uncompressed += entry.uncompressed_size;
            total_compressed += entry.compressed_size;
            file_count += 1;
        }
    }

    println!("{}", "-".repeat(70));
    println!(
        "{:>10}  {:>10}  {}  {:>21}  {} files",
        total_uncompressed,
        total_compressed,
        ratio(total_compressed, total_uncompressed),
        "",
        file_count
    );
}

/// Space saved, as a right-aligned percentage
fn ratio(compressed: u64, uncompressed: u64) -> String {
    if uncompressed == 0 || compressed >= uncompressed {
        return "  0%".to_string();
    }
    format!("{:>4}%", 100 - (compressed * 100 / uncompressed))
}
