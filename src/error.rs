use std::path::PathBuf;

use thiserror::Error;

// Error taxonomy for the update pipeline. Fetch-phase kinds are wrapped in
// `CouldNotFetchUpdate` at the pool boundary so callers only see "this
// source failed, skip it". Unmount shortfalls are reported through
// `mounts::UnmountReport`, never raised.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("Download target not found: {0}")]
    NotFound(String),

    #[error("Transport failure for {url}: {reason}")]
    Transport { url: String, reason: String },

    #[error("Failed to extract package {package}: {reason}")]
    ExtractionFailed { package: String, reason: String },

    #[error("Failed to squash {dir} into {image}: {reason}")]
    ImageBuildFailed {
        dir: PathBuf,
        image: PathBuf,
        reason: String,
    },

    #[error("Failed to mount {image} at {mount_point}: {reason}")]
    MountFailed {
        image: PathBuf,
        mount_point: PathBuf,
        reason: String,
    },

    #[error("Failed to apply update mounted at {mount_point}: {reason}")]
    ApplyFailed {
        mount_point: PathBuf,
        reason: String,
    },

    #[error("Downgrade rejected for {uri}: {packages:?}")]
    DowngradeRejected { uri: String, packages: Vec<String> },

    #[error("Could not fetch update from {uri}: {source}")]
    CouldNotFetchUpdate {
        uri: String,
        #[source]
        source: Box<UpdateError>,
    },

    #[error("Repository error for {uri}: {reason}")]
    Repository { uri: String, reason: String },

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl UpdateError {
    // Wrap a fetch-phase failure into the aggregate kind the caller sees.
    pub fn could_not_fetch(uri: &str, source: UpdateError) -> UpdateError {
        UpdateError::CouldNotFetchUpdate {
            uri: uri.to_string(),
            source: Box::new(source),
        }
    }
}
