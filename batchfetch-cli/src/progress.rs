//! Terminal progress display driven by download events.

use std::time::Duration;

use batchfetch::{AbortReason, DownloadEvent, RunOutcome};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} | {msg}";

/// One bar counting finished targets.
#[derive(Clone)]
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    /// A visible bar over `targets` files, or a hidden one when `quiet`.
    pub fn new(targets: usize, quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(targets as u64)
        };
        // The template is a literal; fall back to the default style if it
        // is ever rejected.
        let style = ProgressStyle::default_bar()
            .template(BAR_TEMPLATE)
            .map(|s| s.progress_chars("=>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    /// Listener to register with [`Downloader::on_event`](batchfetch::Downloader::on_event).
    pub fn listener(&self) -> impl Fn(&DownloadEvent) + Send + Sync + 'static {
        let bar = self.bar.clone();
        move |event| match event {
            DownloadEvent::RunStarted { run_id, targets } => {
                bar.set_length(*targets as u64);
                bar.set_message(format!("run {run_id}: {targets} files"));
            }
            DownloadEvent::TargetProgressed {
                uri,
                progress,
                bytes_downloaded,
            } => {
                bar.set_message(format!(
                    "{} {:.0}% ({})",
                    short_name(uri),
                    progress * 100.0,
                    HumanBytes(*bytes_downloaded)
                ));
            }
            DownloadEvent::TargetSucceeded { uri, .. } => {
                bar.inc(1);
                bar.set_message(short_name(uri).to_string());
            }
            DownloadEvent::TargetFailed { uri, message, .. } => {
                bar.inc(1);
                bar.println(format!("failed: {uri}: {message}"));
            }
            DownloadEvent::TargetCancelled { uri } => {
                bar.inc(1);
                bar.println(format!("cancelled: {uri}"));
            }
            DownloadEvent::RunSucceeded { .. } => {}
            DownloadEvent::RunAborted { reason } => {
                let message = match reason {
                    AbortReason::Cancelled => "interrupted".to_string(),
                    AbortReason::Failure { uri, .. } => format!("stopped after {uri} failed"),
                };
                bar.abandon_with_message(message);
            }
        }
    }

    /// Stop the bar once the run is over.
    pub fn finish(&self, outcome: &RunOutcome) {
        if !self.bar.is_finished() {
            self.bar.finish_with_message(format!(
                "{} downloaded, {} failed",
                outcome.completed.len(),
                outcome.failed.len()
            ));
        }
    }
}

fn short_name(uri: &str) -> &str {
    uri.rsplit('/').find(|s| !s.is_empty()).unwrap_or(uri)
}
