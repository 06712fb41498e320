//! Error types for volseg.
//!
//! Every failure in the pipeline is fatal at the point where it occurs, so a
//! single enum covers the codec, the data pipeline and the training wrapper.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying filesystem or stream failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The first bytes of a file are not a NIfTI-1 header.
    #[error("invalid NIfTI magic bytes {0:?}")]
    InvalidMagic([u8; 4]),

    /// The header names a voxel type this crate cannot decode.
    #[error("unsupported data type code {0}")]
    UnsupportedDataType(i16),

    /// A header or array has dimensions that cannot be used.
    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    /// Two arrays that must agree in shape do not.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Gzip payload could not be decoded.
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// A subject directory lacks one of the files its dataset layout requires.
    #[error("missing modality '{modality}' for subject {subject}")]
    MissingModality {
        /// Subject identifier (directory name).
        subject: String,
        /// Modality or label key that was not found.
        modality: String,
    },

    /// A manifest entry points at a file that is missing or unreadable.
    #[error("corrupt cache entry {index} ({}): {reason}", path.display())]
    CorruptCache {
        /// Position of the entry in the manifest.
        index: usize,
        /// Offending file.
        path: PathBuf,
        /// What went wrong while reading it.
        reason: String,
    },

    /// No loader is registered under the requested dataset name.
    #[error("dataset not found: '{0}'")]
    DatasetNotFound(String),

    /// The modality/channel pair is not one of the supported selections.
    #[error("unsupported combination: {modalities} modalities with {channels} input channels")]
    UnsupportedModalityChannels {
        /// Modalities delivered by the dataset.
        modalities: usize,
        /// Channels expected by the model.
        channels: usize,
    },

    /// The optimizer selector did not name sgd, adam or rmsprop.
    #[error("unrecognized optimizer: '{0}'")]
    UnrecognizedOptimizer(String),

    /// The manifest for a freshly generated cache could not be written.
    #[error("failed to write manifest {}: {source}", path.display())]
    ManifestWrite {
        /// Manifest path.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// Dataset index outside `[0, len)`.
    #[error("index {index} out of range for dataset of length {len}")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Dataset length.
        len: usize,
    },

    /// Invalid or inconsistent configuration value.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The experiment tracker failed to record or flush metrics.
    #[error("tracking error: {0}")]
    Tracking(String),
}

impl Error {
    /// Wraps a read failure of a cache file into [`Error::CorruptCache`].
    pub(crate) fn corrupt_cache(
        index: usize,
        path: impl Into<PathBuf>,
        reason: impl ToString,
    ) -> Self {
        Self::CorruptCache {
            index,
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
