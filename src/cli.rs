//! Command-line interface definitions for the article harvester.
//!
//! Every option can also come from an environment variable. Options left
//! unset fall back to the YAML config file given with `--config`, then to
//! the built-in defaults of [`HarvestConfig`].

use crate::config::{ConfigError, HarvestConfig, parse_date};
use chrono::NaiveDate;
use clap::Parser;
use std::path::PathBuf;

/// Harvest articles for a tag into a directory of text files.
///
/// # Examples
///
/// ```sh
/// # Collect 200 articles tagged "rust"
/// article_harvester rust -n 200 -d ./articles
///
/// # Reuse a config file and overwrite a previous run
/// article_harvester rust -c harvest.yaml --force
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Tag to search the archive for
    #[arg(env = "HARVEST_SEARCH_TERM")]
    pub search_term: Option<String>,

    /// Number of accepted articles to collect
    #[arg(short, long, env = "HARVEST_NUM_ARTICLES")]
    pub num_articles: Option<usize>,

    /// Output directory for article files
    #[arg(short, long, env = "HARVEST_DIRECTORY")]
    pub directory: Option<PathBuf>,

    /// Optional path to a YAML config file
    #[arg(short, long, env = "HARVEST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Write into an output directory that already has files
    #[arg(short, long, env = "HARVEST_FORCE")]
    pub force: bool,

    /// Accept articles whose reading time cannot be determined
    #[arg(long, env = "HARVEST_LENIENT")]
    pub lenient: bool,

    /// Minimum reading time, in minutes
    #[arg(long, env = "HARVEST_MIN_DURATION")]
    pub minimum_duration: Option<u32>,

    /// Archive days requested per discovery call
    #[arg(long, env = "HARVEST_DAYS_PER_BATCH")]
    pub days_per_batch: Option<usize>,

    /// Concurrent page downloads
    #[arg(long, env = "HARVEST_DOWNLOAD_WORKERS")]
    pub download_workers: Option<usize>,

    /// Parser threads
    #[arg(long, env = "HARVEST_PARSE_WORKERS")]
    pub parse_workers: Option<usize>,

    /// Capacity of each inter-stage queue
    #[arg(long, env = "HARVEST_QUEUE_CAPACITY")]
    pub queue_capacity: Option<usize>,

    /// Seconds between progress checks
    #[arg(long, env = "HARVEST_POLL_INTERVAL")]
    pub poll_interval: Option<u64>,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HARVEST_REQUEST_TIMEOUT")]
    pub request_timeout: Option<u64>,

    /// Failed items to keep in the report (0 only logs them)
    #[arg(long, env = "HARVEST_DEAD_LETTERS")]
    pub dead_letter_capacity: Option<usize>,

    /// Do not query archive days before this date (YYYY-MM-DD)
    #[arg(long, env = "HARVEST_OLDEST_DATE", value_parser = parse_date)]
    pub oldest_date: Option<NaiveDate>,

    /// Base URL of the site to harvest
    #[arg(long, env = "HARVEST_BASE_URL")]
    pub base_url: Option<String>,
}

impl Cli {
    /// Resolve the effective configuration: file (if any), then flags.
    pub fn into_config(self) -> Result<HarvestConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => HarvestConfig::from_file(path)?,
            None => HarvestConfig::default(),
        };

        if let Some(v) = self.search_term {
            config.search_term = v;
        }
        if let Some(v) = self.num_articles {
            config.num_articles = v;
        }
        if let Some(v) = self.directory {
            config.directory = v;
        }
        config.force |= self.force;
        config.lenient |= self.lenient;
        if let Some(v) = self.minimum_duration {
            config.minimum_duration_minutes = v;
        }
        if let Some(v) = self.days_per_batch {
            config.days_per_batch = v;
        }
        if let Some(v) = self.download_workers {
            config.download_workers = v;
        }
        if let Some(v) = self.parse_workers {
            config.parse_workers = v;
        }
        if let Some(v) = self.queue_capacity {
            config.queue_capacity = v;
        }
        if let Some(v) = self.poll_interval {
            config.poll_interval_secs = v;
        }
        if let Some(v) = self.request_timeout {
            config.request_timeout_secs = v;
        }
        if let Some(v) = self.dead_letter_capacity {
            config.dead_letter_capacity = v;
        }
        if self.oldest_date.is_some() {
            config.oldest_date = self.oldest_date;
        }
        if let Some(v) = self.base_url {
            config.base_url = v;
        }

        config.validate()?;
        Ok(config)
    }
}
