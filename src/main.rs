//! # Article Harvester
//!
//! Collects long-form articles published under a tag and stores them as
//! plain-text files, stopping once enough articles have been accepted.
//!
//! ## Usage
//!
//! ```sh
//! article_harvester rust -n 200 -d ./articles
//! ```
//!
//! ## Architecture
//!
//! The harvest runs as a four-stage pipeline on the staged job engine in
//! [`engine`]:
//! 1. **Discover**: walk the tag archive backwards, day by day, for article URLs
//! 2. **Download**: fetch article pages concurrently
//! 3. **Parse**: extract text and metadata on dedicated threads
//! 4. **Persist**: write accepted articles and an index to the output directory
//!
//! A `harvest.json` report with per-stage counters is written at the end.

use chrono::Local;
use clap::Parser;
use std::error::Error;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};
use url::Url;

mod cli;
mod config;
mod engine;
mod harvester;
mod models;
mod outputs;
mod scrapers;
mod utils;

use cli::Cli;
use engine::StopFlag;
use harvester::{HarvestOptions, Harvester};
use outputs::json;
use outputs::storage::ArticleStorage;
use scrapers::archive::{ArchiveOptions, ArchiveSearcher};
use scrapers::fetch::PageFetcher;
use scrapers::medium::ArticleParser;
use utils::ensure_writable_dir;

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("article_harvester starting up");

    // Parse CLI and resolve config
    let config = Cli::parse().into_config()?;
    debug!(?config, "Resolved configuration");

    let directory = config.directory.to_string_lossy().into_owned();
    if let Err(e) = ensure_writable_dir(&directory).await {
        error!(
            path = %directory,
            error = %e,
            "Output directory is not writable (fix perms or choose a different path)"
        );
        return Err(e);
    }
    let storage = Arc::new(ArticleStorage::create(&config.directory, config.force).await?);

    // ---- Collaborators ----
    let searcher = ArchiveSearcher::new(
        ArchiveOptions {
            base_url: Url::parse(&config.base_url)?,
            tag: config.search_term.clone(),
            max_concurrency: config.days_per_batch,
            request_timeout: config.request_timeout(),
            oldest_date: config.oldest_date,
        },
        Local::now().date_naive(),
    )?;
    let fetcher = PageFetcher::new(config.request_timeout())?;
    let parser = ArticleParser::new(config.minimum_duration_minutes, config.lenient);

    // ---- Ctrl-C asks discovery to stop; the rest drains normally ----
    let stop = StopFlag::new();
    let ctrl_c_stop = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() && ctrl_c_stop.stop() {
            warn!("Interrupted; finishing articles already in flight");
        }
    });

    // ---- Run the pipeline ----
    let harvester = Harvester::new(
        HarvestOptions::from(&config),
        Arc::new(searcher),
        Arc::new(fetcher),
        parser,
        Arc::clone(&storage),
    )
    .with_stop_flag(stop);
    let report = harvester.run().await?;

    storage.close().await?;
    if let Err(e) = json::write_report(&report, storage.directory()).await {
        error!(error = %e, "Failed to write harvest report");
    }

    if report.accepted < report.requested {
        warn!(
            accepted = report.accepted,
            requested = report.requested,
            "Fewer articles than requested"
        );
    }

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        accepted = report.accepted,
        rejected = report.rejected,
        "Execution complete"
    );

    Ok(())
}
