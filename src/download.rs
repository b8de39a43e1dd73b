//! Binary artifact downloads.
//!
//! An [`ArtifactDownloader`] runs a one-shot request whose response is a file
//! rather than cached data, names the file from the `Content-Disposition`
//! header (falling back to a name derived from a title), and hands the bytes
//! to an [`ArtifactSink`]. It never reads or writes the entity cache.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};

use futures::future::BoxFuture;
use regex::Regex;
use tracing::{debug, info};

use crate::error::{DownloadError, QueryError};
use crate::transport::{Request, ResponseKind, Transport};

/// Media type of a generated presentation.
pub const PPTX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";

const ACCEPTED_CONTENT_TYPES: &[&str] = &[PPTX_CONTENT_TYPE, "application/octet-stream"];

static EXTENDED_FILENAME: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)filename\*\s*=\s*([^']*)'[^']*'([^;\s]+)"));

static PLAIN_FILENAME: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r#"(?i)(?:^|;)\s*filename\s*=\s*(?:"([^"]*)"|'([^']*)'|([^;]+))"#)
});

static NON_ALPHANUMERIC_RUN: LazyLock<Regex> = LazyLock::new(|| pattern(r"[^A-Za-z0-9]+"));

fn pattern(source: &str) -> Regex {
    Regex::new(source).expect("filename patterns are valid")
}

/// Extracts the suggested filename from a `Content-Disposition` value.
///
/// `filename*` (RFC 5987) wins over `filename`. Directory components are
/// stripped. Returns `None` when no usable name is present.
#[must_use]
pub fn filename_from_disposition(value: &str) -> Option<String> {
    let extended = EXTENDED_FILENAME.captures(value).and_then(|caps| {
        let encoded = caps.get(2)?.as_str();
        urlencoding::decode(encoded).ok().map(|s| s.into_owned())
    });

    let name = extended.or_else(|| {
        let caps = PLAIN_FILENAME.captures(value)?;
        let raw = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3))?;
        Some(raw.as_str().trim().to_string())
    })?;

    let base = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    Some(base.to_string())
}

/// Derives a filename from `title`: each non-alphanumeric run becomes `_`,
/// edges are trimmed, and `extension` is appended.
///
/// ```
/// use slide_sync::download::fallback_filename;
///
/// assert_eq!(fallback_filename("Q1 Deck", "pptx"), "Q1_Deck.pptx");
/// ```
#[must_use]
pub fn fallback_filename(title: &str, extension: &str) -> String {
    let stem = NON_ALPHANUMERIC_RUN.replace_all(title, "_");
    let stem = stem.trim_matches('_');
    let stem = if stem.is_empty() { "presentation" } else { stem };
    format!("{stem}.{extension}")
}

/// Where downloaded artifacts end up.
pub trait ArtifactSink: Send + Sync {
    /// Saves `bytes` under `filename` and returns where they were written.
    fn save<'a>(
        &'a self,
        filename: &'a str,
        bytes: &'a [u8],
    ) -> BoxFuture<'a, std::io::Result<PathBuf>>;
}

/// Saves artifacts into a directory, creating it if needed.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ArtifactSink for DirectorySink {
    fn save<'a>(
        &'a self,
        filename: &'a str,
        bytes: &'a [u8],
    ) -> BoxFuture<'a, std::io::Result<PathBuf>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&self.dir).await?;
            let path = self.dir.join(filename);
            tokio::fs::write(&path, bytes).await?;
            Ok(path)
        })
    }
}

/// A saved artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub filename: String,
    pub path: PathBuf,
    pub size: usize,
}

/// Runs binary-download requests and saves the results.
#[derive(Clone)]
pub struct ArtifactDownloader {
    transport: Arc<dyn Transport>,
    sink: Arc<dyn ArtifactSink>,
    active: Arc<AtomicUsize>,
    extension: &'static str,
}

impl ArtifactDownloader {
    /// Creates a downloader whose fallback filenames end in `.pptx`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, sink: Arc<dyn ArtifactSink>) -> Self {
        Self {
            transport,
            sink,
            active: Arc::new(AtomicUsize::new(0)),
            extension: "pptx",
        }
    }

    /// Returns `true` while a download is running.
    #[must_use]
    pub fn is_downloading(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }

    /// Sends `request` expecting a binary body and saves it.
    ///
    /// `title` names the file when the response carries no usable filename.
    /// Nothing is saved unless the whole body arrived.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Transport`] if the request fails,
    /// [`DownloadError::UnexpectedContentType`] if the body is not a binary
    /// artifact, and [`DownloadError::Io`] if saving fails.
    pub async fn download(&self, request: Request, title: &str) -> Result<Artifact, DownloadError> {
        let _active = ActiveDownload::start(&self.active);
        let request = match request.response_kind {
            ResponseKind::Blob => request,
            ResponseKind::Json => request.blob(),
        };
        debug!(path = %request.path, "starting artifact download");

        let response = self.transport.send(request).await.map_err(QueryError::from)?;

        if let Some(content_type) = response.content_type() {
            if !ACCEPTED_CONTENT_TYPES
                .iter()
                .any(|accepted| content_type.eq_ignore_ascii_case(accepted))
            {
                return Err(DownloadError::UnexpectedContentType(content_type.to_string()));
            }
        }

        let filename = response
            .header("content-disposition")
            .and_then(filename_from_disposition)
            .unwrap_or_else(|| fallback_filename(title, self.extension));

        let path = self.sink.save(&filename, &response.body).await?;
        info!(filename = %filename, bytes = response.body.len(), path = %path.display(), "artifact saved");

        Ok(Artifact {
            filename,
            path,
            size: response.body.len(),
        })
    }
}

impl std::fmt::Debug for ArtifactDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactDownloader")
            .field("active", &self.active.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

struct ActiveDownload<'a>(&'a AtomicUsize);

impl<'a> ActiveDownload<'a> {
    fn start(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveDownload<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
