//! Remote-source download support for ADD.
//!
//! A remote source is fetched into a scratch directory under the context
//! root so the rest of the pipeline can treat it as a local context file.
//! The modification time is normalized to the epoch: the download instant
//! must never leak into the step fingerprint.

use std::fs::FileTimes;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tempfile::TempDir;

use kiln_core::error::{KilnError, Result};

/// Name of the downloaded file inside its scratch directory. Fixed so the
/// remote checksum stays content-addressed across builds.
const DOWNLOAD_NAME: &str = "tmp";

/// A downloaded remote source. The scratch directory is removed when the
/// guard is dropped, after the step has materialized the file.
pub struct RemoteFile {
    dir: TempDir,
    /// Context-relative path of the downloaded file
    pub rel: String,
}

impl RemoteFile {
    /// Absolute path of the downloaded file.
    pub fn path(&self) -> PathBuf {
        self.dir.path().join(DOWNLOAD_NAME)
    }
}

/// Whether an ADD/COPY source is a remote URL.
pub fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// Derive a filename from the final path segment of `url`, for
/// destinations that end with `/`.
pub fn filename_from_url(url: &str) -> Result<String> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|_| KilnError::UrlFilenameUnresolvable(url.to_string()))?;
    let name = parsed
        .path()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("");
    if name.is_empty() {
        return Err(KilnError::UrlFilenameUnresolvable(url.to_string()));
    }
    Ok(name.to_string())
}

/// Download `url` into a fresh scratch directory under `context_root`.
pub async fn download_to(url: &str, context_root: &Path) -> Result<RemoteFile> {
    let response = reqwest::get(url)
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|err| KilnError::DownloadFailed {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
    let body = response
        .bytes()
        .await
        .map_err(|err| KilnError::DownloadFailed {
            url: url.to_string(),
            reason: err.to_string(),
        })?;

    let dir = tempfile::Builder::new()
        .prefix("kiln-remote-")
        .tempdir_in(context_root)?;
    let path = dir.path().join(DOWNLOAD_NAME);
    std::fs::write(&path, &body)?;

    let epoch = SystemTime::UNIX_EPOCH;
    let file = std::fs::File::options().write(true).open(&path)?;
    file.set_times(FileTimes::new().set_accessed(epoch).set_modified(epoch))?;

    let dir_name = dir
        .path()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let rel = format!("{}/{}", dir_name, DOWNLOAD_NAME);

    Ok(RemoteFile { dir, rel })
}
