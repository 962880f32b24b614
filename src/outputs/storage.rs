//! On-disk article storage.
//!
//! # Layout
//!
//! ```text
//! directory/
//! ├── {id}.txt     # one file per article, paragraphs separated by newlines
//! └── index.txt    # CSV: Id,URL,Author,Title (written on close)
//! ```

use crate::engine::BoxError;
use crate::models::Article;
use serde::Serialize;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, instrument};

pub const INDEX_FILE: &str = "index.txt";
const INDEX_HEADER: [&str; 4] = ["Id", "URL", "Author", "Title"];

/// Destination for accepted records.
///
/// `add` is only ever called from the single persistence worker;
/// `accepted_count` is polled concurrently by the orchestrator.
pub trait RecordStore: Send + Sync + 'static {
    fn accepted_count(&self) -> usize;

    fn add(&self, article: Article) -> impl Future<Output = Result<(), BoxError>> + Send;
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("new storage must be set in an empty or non-existent directory: {0}")]
    NotEmpty(PathBuf),

    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode article index: {0}")]
    Csv(#[from] csv::Error),
}

/// One `index.txt` row; field order matches [`INDEX_HEADER`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct Metadata {
    id: String,
    url: String,
    author: Option<String>,
    title: Option<String>,
}

#[derive(Debug)]
pub struct ArticleStorage {
    directory: PathBuf,
    metadata: Mutex<Vec<Metadata>>,
    accepted: AtomicUsize,
}

impl ArticleStorage {
    /// Open a storage directory, creating it if missing.
    ///
    /// # Arguments
    ///
    /// * `directory` - Where article files and the index are written
    /// * `force` - Accept a directory that already holds files; same-named
    ///   files are then overwritten
    ///
    /// # Returns
    ///
    /// The storage, or [`StorageError::NotEmpty`] when the directory has
    /// files and `force` is not set.
    #[instrument(
        level = "info",
        skip_all,
        fields(directory = %directory.as_ref().display(), force = force)
    )]
    pub async fn create(directory: impl AsRef<Path>, force: bool) -> Result<Self, StorageError> {
        let directory = directory.as_ref().to_path_buf();

        if !force && contains_files(&directory).await? {
            return Err(StorageError::NotEmpty(directory));
        }
        fs::create_dir_all(&directory).await?;
        info!("Article storage ready");

        Ok(Self {
            directory,
            metadata: Mutex::new(Vec::new()),
            accepted: AtomicUsize::new(0),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Write the CSV index of every stored article.
    #[instrument(level = "info", skip_all)]
    pub async fn close(&self) -> Result<PathBuf, StorageError> {
        let index = {
            let metadata = self.metadata.lock().unwrap_or_else(|e| e.into_inner());
            render_index(&metadata)?
        };
        let path = self.directory.join(INDEX_FILE);
        fs::write(&path, index).await?;
        info!(path = %path.display(), articles = self.accepted_count(), "Wrote article index");
        Ok(path)
    }
}

impl RecordStore for ArticleStorage {
    fn accepted_count(&self) -> usize {
        self.accepted.load(Ordering::Acquire)
    }

    async fn add(&self, article: Article) -> Result<(), BoxError> {
        let path = self.directory.join(format!("{}.txt", file_stem(&article.id)));
        fs::write(&path, article.paragraphs.join("\n")).await?;

        self.metadata
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Metadata {
                id: article.id,
                url: article.url,
                author: article.author,
                title: article.title,
            });
        let count = self.accepted.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(path = %path.display(), count, "Stored article");
        Ok(())
    }
}

async fn contains_files(directory: &Path) -> io::Result<bool> {
    let mut entries = match fs::read_dir(directory).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Article ids come from page markup; keep them to a safe file name.
fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn render_index(metadata: &[Metadata]) -> Result<Vec<u8>, StorageError> {
    // The header is written by hand so an empty index still has one.
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(INDEX_HEADER)?;
    for row in metadata {
        writer.serialize(row)?;
    }
    writer.into_inner().map_err(|e| StorageError::Io(e.into_error()))
}
