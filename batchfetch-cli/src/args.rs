//! Command-line arguments and their mapping onto the library configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use batchfetch::config::{DEFAULT_CHUNK_SIZE_BYTES, DEFAULT_MAX_CONCURRENCY, DEFAULT_TIMEOUT};
use batchfetch::{DownloaderConfig, TargetOptions};

use crate::error::CliError;

/// Download many files concurrently.
///
/// Large files on servers that accept byte ranges are fetched in chunks.
/// By default the first failure stops the run and deletes every file it
/// wrote; see --keep-partial and --continue-after-failure.
#[derive(Debug, Parser)]
#[command(name = "batchfetch", version, about)]
pub struct Cli {
    /// URLs to download
    #[arg(required = true, value_name = "URL")]
    pub urls: Vec<String>,

    /// Destination directory
    #[arg(short, long, default_value = ".")]
    pub dir: PathBuf,

    /// Maximum number of concurrent transfers
    #[arg(short = 'j', long, default_value_t = DEFAULT_MAX_CONCURRENCY)]
    pub concurrency: usize,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT.as_secs())]
    pub timeout: u64,

    /// Bytes per ranged request in a chunked transfer
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE_BYTES)]
    pub chunk_size: u64,

    /// Never probe with HEAD; fetch every file in one request
    #[arg(long)]
    pub no_chunked: bool,

    /// Keep finished and partial files when the run fails or is interrupted
    #[arg(long)]
    pub keep_partial: bool,

    /// Record failures and keep downloading the rest (implies --keep-partial)
    #[arg(long)]
    pub continue_after_failure: bool,

    /// Extra request header, repeatable
    #[arg(short = 'H', long = "header", value_name = "NAME:VALUE", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Save URL under FILE instead of the last path segment, repeatable
    #[arg(long = "name", value_name = "URL=FILE", value_parser = parse_assignment)]
    pub names: Vec<(String, String)>,

    /// Verify URL against a SHA-256 digest, repeatable
    #[arg(long = "sha256", value_name = "URL=DIGEST", value_parser = parse_assignment)]
    pub checksums: Vec<(String, String)>,

    /// Print the final run snapshot as JSON instead of a progress bar
    #[arg(long)]
    pub json: bool,

    /// Also write logs to batchfetch.log in this directory
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,
}

impl Cli {
    /// Downloader settings from the flags.
    pub fn downloader_config(&self) -> Result<DownloaderConfig, CliError> {
        if self.timeout == 0 {
            return Err(CliError::InvalidArgument(
                "--timeout must be at least 1 second".to_string(),
            ));
        }

        let keep = self.keep_partial || self.continue_after_failure;
        let config = self
            .headers
            .iter()
            .fold(DownloaderConfig::new(self.dir.clone()), |config, (name, value)| {
                config.with_header(name, value)
            })
            .with_max_concurrency(self.concurrency)
            .with_timeout(Duration::from_secs(self.timeout))
            .with_chunk_size(self.chunk_size)
            .with_chunked_transfer(!self.no_chunked)
            .with_abandon_on_failure(!keep)
            .with_continue_after_failure(self.continue_after_failure)
            .with_filename_fn(filename_from_url);

        config.validate()?;
        Ok(config)
    }

    /// Per-URL overrides from --name and --sha256.
    pub fn target_options(&self) -> HashMap<&str, TargetOptions> {
        let mut options: HashMap<&str, TargetOptions> = HashMap::new();
        for (url, file) in &self.names {
            options.entry(url.as_str()).or_default().filename = Some(file.clone());
        }
        for (url, digest) in &self.checksums {
            let entry = options.entry(url.as_str()).or_default();
            *entry = std::mem::take(entry).with_sha256(digest.clone());
        }
        options
    }

    /// URLs in command-line order with repeats dropped.
    pub fn unique_urls(&self) -> Vec<&str> {
        let mut seen = std::collections::HashSet::new();
        self.urls
            .iter()
            .map(String::as_str)
            .filter(|url| seen.insert(*url))
            .collect()
    }
}

/// Last path segment of a URL, ignoring query and fragment.
pub fn filename_from_url(url: &str) -> Option<String> {
    let url = url.split(['?', '#']).next()?;
    let (_, rest) = url.split_once("://")?;
    let (_, path) = rest.split_once('/')?;
    let name = path.rsplit('/').next()?;
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name.to_string())
}

fn parse_header(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once(':')
        .ok_or_else(|| format!("expected NAME:VALUE, got {s:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in {s:?}"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn parse_assignment(s: &str) -> Result<(String, String), String> {
    // URLs may contain '=' in their query; split on the last one.
    let (url, value) = s
        .rsplit_once('=')
        .ok_or_else(|| format!("expected URL=VALUE, got {s:?}"))?;
    if url.is_empty() || value.is_empty() {
        return Err(format!("expected URL=VALUE, got {s:?}"));
    }
    Ok((url.to_string(), value.to_string()))
}
