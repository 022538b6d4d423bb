//! batchfetch CLI - command-line front end to the batchfetch library.
//!
//! Downloads every URL given on the command line into one directory,
//! shows a progress bar (or prints a JSON snapshot with `--json`) and exits
//! non-zero when any file failed. Ctrl+C cancels the run.

mod args;
mod error;
mod progress;

use std::process::ExitCode;

use clap::Parser;
use indicatif::HumanBytes;
use tracing::{error, info, warn};

use batchfetch::logging::init_logging;
use batchfetch::{Downloader, HttpTransport, RunOutcome, RunStatus};

use args::Cli;
use error::CliError;
use progress::ProgressReporter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _logging = match init_logging(cli.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {}", CliError::from(e));
            return ExitCode::from(2);
        }
    };

    match run(cli).await {
        Ok(outcome) if outcome.is_success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<RunOutcome, CliError> {
    let config = cli.downloader_config()?;
    let downloader = Downloader::new(config, HttpTransport::new()?)?;

    let mut options = cli.target_options();
    let urls = cli.unique_urls();
    if urls.len() < cli.urls.len() {
        warn!(
            duplicates = cli.urls.len() - urls.len(),
            "ignoring repeated URLs"
        );
    }
    for url in &urls {
        let target = options.remove(url).unwrap_or_default();
        downloader.add_target_with(url, target)?;
    }
    for url in options.keys() {
        warn!(url, "--name/--sha256 given for a URL that is not downloaded");
    }

    let reporter = ProgressReporter::new(urls.len(), cli.json);
    downloader.on_event(reporter.listener());

    tokio::spawn({
        let downloader = downloader.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl+C received, cancelling downloads");
                downloader.cancel_all().await;
            }
        }
    });

    info!(
        targets = urls.len(),
        dir = %cli.dir.display(),
        concurrency = cli.concurrency,
        "starting downloads"
    );
    let outcome = downloader.run().await?;
    // Let steps of an aborted run finish their cleanup before reporting.
    downloader.wait_idle().await;
    reporter.finish(&outcome);

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&downloader.snapshot())?);
    } else {
        print_summary(&downloader, &outcome);
    }
    Ok(outcome)
}

fn print_summary(downloader: &Downloader<HttpTransport>, outcome: &RunOutcome) {
    let status = match outcome.status {
        RunStatus::Succeeded => "finished",
        RunStatus::Aborted => "aborted",
        RunStatus::Idle | RunStatus::Running => "incomplete",
    };

    println!();
    println!("Download {}", status);
    println!("─────────────────");
    println!("  Completed:  {}", outcome.completed.len());
    println!("  Failed:     {}", outcome.failed.len());
    println!(
        "  Downloaded: {} in {:.1}s ({}/s)",
        HumanBytes(downloader.bytes_downloaded()),
        outcome.elapsed.as_secs_f64(),
        HumanBytes(downloader.throughput() as u64)
    );

    if !outcome.failed.is_empty() {
        println!();
        for failed in &outcome.failed {
            println!("  ✗ {}: {}", failed.uri, failed.reason);
        }
    }
}
