//! JSON output of the run report.

use crate::harvester::HarvestReport;
use std::error::Error;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{error, info, instrument};

pub const REPORT_FILE: &str = "harvest.json";

/// Write a [`HarvestReport`] as pretty-printed JSON into `directory`.
///
/// # Arguments
///
/// * `report` - Counters and dead letters of a finished run
/// * `directory` - Output directory, created if missing
///
/// # Returns
///
/// The path of the written file, `{directory}/harvest.json`. An existing
/// report is replaced.
#[instrument(level = "info", skip_all, fields(directory = %directory.display()))]
pub async fn write_report(
    report: &HarvestReport,
    directory: &Path,
) -> Result<PathBuf, Box<dyn Error>> {
    let json = serde_json::to_string_pretty(report)?;

    if let Err(e) = fs::create_dir_all(directory).await {
        error!(error = %e, "Failed to create report directory");
        return Err(e.into());
    }

    let path = directory.join(REPORT_FILE);
    info!(path = %path.display(), "Writing JSON");
    fs::write(&path, json).await?;
    info!(path = %path.display(), "Wrote harvest report");

    Ok(path)
}
