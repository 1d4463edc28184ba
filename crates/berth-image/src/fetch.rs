//! Image fetching by reference scheme.
//!
//! A fetch turns an image reference into an ordered list of layers. Each
//! layer is an open [`File`]: readable once from the start and closed when
//! dropped. Remote layers are spooled to anonymous temporary files, so a
//! layer never outlives its handle on disk.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Seek};
use std::path::Path;

use berth_common::error::{BerthError, Result};
use serde::{Deserialize, Serialize};

/// Settings for an image fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Labels that scope image resolution, such as `os` and `arch`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Skip TLS certificate verification.
    #[serde(default)]
    pub insecure: bool,
}

impl FetchConfig {
    /// Fills the `os` and `arch` labels from the running host, keeping any
    /// value already set.
    #[must_use]
    pub fn with_host_labels(mut self) -> Self {
        let _ = self
            .labels
            .entry("os".into())
            .or_insert_with(|| std::env::consts::OS.into());
        let _ = self
            .labels
            .entry("arch".into())
            .or_insert_with(|| host_arch().into());
        self
    }

    /// Fetches the image at `uri`.
    ///
    /// `file://` references are opened directly. `http://` and `https://`
    /// references are downloaded. Each yields exactly one layer.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::UnsupportedScheme`] for any other scheme, or
    /// the puller's error if the image cannot be retrieved.
    pub fn fetch(&self, uri: &str) -> Result<Vec<File>> {
        let (scheme, rest) = uri.split_once("://").unwrap_or(("", uri));
        tracing::info!(uri, scheme, "fetching image");
        match scheme {
            "file" => {
                let path = Path::new(rest);
                let file = File::open(path).map_err(|e| BerthError::io(path, e))?;
                Ok(vec![file])
            }
            "http" | "https" => HttpPuller::new(self.insecure)?.pull(uri, self),
            other => Err(BerthError::UnsupportedScheme {
                scheme: other.into(),
            }),
        }
    }
}

/// Architecture label for the running host, in image manifest terms.
fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "i386",
        "arm" => "armv7l",
        other => other,
    }
}

/// A remote image backend.
pub trait Puller {
    /// Retrieves the layers of the image at `uri`, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be retrieved.
    fn pull(&self, uri: &str, config: &FetchConfig) -> Result<Vec<File>>;
}

/// Downloads a single-layer image over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpPuller {
    client: reqwest::blocking::Client,
}

impl HttpPuller {
    /// Creates a puller. With `insecure`, TLS certificates are not verified.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be initialized.
    pub fn new(insecure: bool) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .danger_accept_invalid_certs(insecure)
            .build()
            .map_err(|e| BerthError::Config {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self::with_client(client))
    }

    /// Creates a puller using an existing client.
    #[must_use]
    pub const fn with_client(client: reqwest::blocking::Client) -> Self {
        Self { client }
    }
}

impl Puller for HttpPuller {
    fn pull(&self, uri: &str, _config: &FetchConfig) -> Result<Vec<File>> {
        let unavailable = |e: reqwest::Error| BerthError::ResourceUnavailable {
            resource: format!("image {uri}"),
            source: io::Error::other(e),
        };
        let mut response = self
            .client
            .get(uri)
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .map_err(unavailable)?;

        let mut spool = tempfile::tempfile().map_err(|e| BerthError::io("tmpfile", e))?;
        let size = response.copy_to(&mut spool).map_err(unavailable)?;
        spool.rewind().map_err(|e| BerthError::io("tmpfile", e))?;

        tracing::info!(uri, size, "image downloaded");
        Ok(vec![spool])
    }
}
