//! Topic to executable routing.
//!
//! A routes directory holds one executable per subscription pattern. The
//! pattern is the file name with the configured separator replaced by `/`,
//! so `sensors:+:temperature` handles `sensors/<any>/temperature`.

pub mod topic;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

pub use topic::{matches, pattern_matches};

/// Default routes directory.
pub const DEFAULT_ROUTES_DIR: &str = "/etc/moquette.d";
/// Default file name separator standing in for `/`.
pub const DEFAULT_SEPARATOR: &str = ":";

/// Owner execute permission bit.
const OWNER_EXECUTE: u32 = 0o100;

/// Errors that can occur while routing.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("Failed to read routes directory '{dir}': {source}")]
    Io {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid separator '{0}': must be non-empty and must not contain '/'")]
    InvalidSeparator(String),
}

/// Routes directory configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
    /// Directory holding handler executables.
    pub dir: PathBuf,
    /// File name separator used in place of `/`.
    pub separator: String,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_ROUTES_DIR),
            separator: DEFAULT_SEPARATOR.to_string(),
        }
    }
}

/// Resolves topics to handler executables.
///
/// The directory is re-read on every lookup so handlers can be added or
/// removed while the dispatcher runs.
#[derive(Debug, Clone)]
pub struct Router {
    dir: PathBuf,
    separator: String,
}

impl Router {
    /// Create a router over `dir`.
    pub fn new(dir: impl Into<PathBuf>, separator: impl Into<String>) -> Result<Self, RouteError> {
        let separator = separator.into();
        if separator.is_empty() || separator.contains(topic::LEVEL_SEPARATOR) {
            return Err(RouteError::InvalidSeparator(separator));
        }
        Ok(Self {
            dir: dir.into(),
            separator,
        })
    }

    /// Create a router from configuration.
    pub fn from_config(config: &RoutesConfig) -> Result<Self, RouteError> {
        Self::new(config.dir.clone(), config.separator.clone())
    }

    /// The routes directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Topic pattern encoded by a file name.
    pub fn pattern_for(&self, file_name: &str) -> String {
        file_name.replace(&self.separator, "/")
    }

    /// Find the handler for `topic`.
    ///
    /// Candidates are considered in byte-wise file name order, so when
    /// several patterns match the same topic the result does not depend on
    /// filesystem enumeration order. Returns `Ok(None)` when no handler is
    /// configured for the topic.
    pub async fn route(&self, topic: &str) -> Result<Option<PathBuf>, RouteError> {
        let io_err = |source| RouteError::Io {
            dir: self.dir.clone(),
            source,
        };

        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(io_err)?;
        let mut candidates = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            // DirEntry metadata does not follow symlinks
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) => {
                    debug!(path = %entry.path().display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if !metadata.is_file() || metadata.permissions().mode() & OWNER_EXECUTE == 0 {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => candidates.push(name),
                Err(name) => debug!(name = ?name, "Skipping non UTF-8 file name"),
            }
        }
        candidates.sort_unstable();

        let found = candidates
            .into_iter()
            .find(|name| pattern_matches(&self.pattern_for(name), topic))
            .map(|name| self.dir.join(name));

        debug!(topic = %topic, handler = ?found, "Routed topic");
        Ok(found)
    }
}
