//! Install media cache.
//!
//! ISOs are fetched on first use and kept in a cache directory keyed by
//! their canonical release name. A download lands in a `.partial` file
//! and is renamed into place only once complete, so an interrupted fetch
//! never leaves a half ISO where a later run would trust it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::vm::MediaRef;

/// Why an install medium could not be produced.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The mirror answered with a non-success status.
    #[error("GET {url} returned HTTP {status}")]
    Status { status: u16, url: String },

    /// Transport-level failure (DNS, connect, TLS, mid-body reset).
    #[error("fetch {url} failed: {source}")]
    Http { url: String, source: reqwest::Error },

    /// Cache directory or file I/O failure.
    #[error("media cache I/O error: {0}")]
    Io(#[from] io::Error),
}

/// On-disk cache of install ISOs, one file per release/arch.
pub struct MediaCache {
    dir: PathBuf,
    client: reqwest::blocking::Client,
}

impl MediaCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            client: reqwest::blocking::Client::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Canonical ISO file name for a media ref, shared across mirrors.
    pub fn iso_name(media: &MediaRef) -> String {
        format!(
            "alpine-standard-{}-{}.iso",
            media.version, media.architecture
        )
    }

    /// Full download URL on the mirror. Release trees are organized by
    /// major.minor branch, so `3.20.0` lives under `v3.20`.
    pub fn download_url(media: &MediaRef) -> String {
        let base = if media.base_url.contains("://") {
            media.base_url.clone()
        } else {
            format!("https://{}", media.base_url)
        };
        format!(
            "{}/alpine/v{}/releases/{}/{}",
            base,
            release_branch(&media.version),
            media.architecture,
            Self::iso_name(media)
        )
    }

    /// Return the path of the ISO for `media`, downloading it first if
    /// it is not cached yet. A ref that is already cached never touches
    /// the network.
    pub fn resolve(&self, media: &MediaRef) -> Result<PathBuf, FetchError> {
        let path = self.dir.join(Self::iso_name(media));
        if path.exists() {
            return Ok(path);
        }

        fs::create_dir_all(&self.dir)?;
        let url = Self::download_url(media);
        eprintln!("  fetching {url}");

        let mut response = self
            .client
            .get(&url)
            .send()
            .map_err(|source| FetchError::Http {
                url: url.clone(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                status: response.status().as_u16(),
                url,
            });
        }

        // Download to a sibling .partial file, then publish with a
        // rename. Readers only ever see complete ISOs.
        let staging = self.dir.join(format!("{}.partial", Self::iso_name(media)));
        let copied = fs::File::create(&staging)
            .and_then(|mut file| io::copy(&mut response, &mut file));
        if let Err(e) = copied {
            let _ = fs::remove_file(&staging);
            return Err(FetchError::Io(e));
        }
        fs::rename(&staging, &path)?;

        eprintln!("  cached {}", path.display());
        Ok(path)
    }
}

/// `3.20.0` -> `3.20`; a version without a patch level is its own branch.
fn release_branch(version: &str) -> &str {
    match version.match_indices('.').nth(1) {
        Some((idx, _)) => &version[..idx],
        None => version,
    }
}
