//! Error taxonomy for the import pipeline
//!
//! Every failure is fatal at this layer. Each variant maps to the pipeline
//! stage that produced it so the front-end can report where the import
//! stopped.

use std::io;
use std::path::PathBuf;

use crate::importer::download_error::DownloadError;
use crate::importer::validation::ImageFormat;

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    /// Bad or missing endpoint, partial credentials, unusable options
    #[error("configuration error: {0}")]
    Config(String),

    /// Declared name is not an accepted disk-image file
    #[error("invalid source file format: {0}")]
    InvalidFormat(String),

    /// Decoded content disagrees with the declared format
    #[error("format mismatch: '{name}' declares {declared} but content looks like {detected}")]
    FormatMismatch {
        name: String,
        declared: ImageFormat,
        detected: String,
    },

    /// Backend unreachable, auth rejected or transfer broken
    #[error(transparent)]
    Connection(#[from] DownloadError),

    /// More nested wrappers than the configured bound
    #[error("transform chain exceeds maximum depth of {0} decode stages")]
    ChainTooDeep(usize),

    /// Corrupt or unsupported encoding
    #[error("decode error: {0}")]
    Decode(String),

    /// I/O failure while writing the destination; partial output removed
    #[error("failed to write {}: {source}", path.display())]
    Copy {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ImportError {
    /// Pipeline stage that failed
    pub fn stage(&self) -> &'static str {
        match self {
            ImportError::Config(_) => "resolve",
            ImportError::InvalidFormat(_) | ImportError::FormatMismatch { .. } => "validate",
            ImportError::Connection(_) => "connect",
            ImportError::ChainTooDeep(_) | ImportError::Decode(_) => "decode",
            ImportError::Copy { .. } => "copy",
        }
    }

    /// Classify an I/O error raised while pulling bytes through the chain.
    ///
    /// Failures that originate from the download keep their connection
    /// classification; everything else is a decode failure.
    pub(crate) fn from_read(error: io::Error) -> Self {
        match download_cause(&error) {
            Some(cause) => ImportError::Connection(cause.clone()),
            None => ImportError::Decode(error.to_string()),
        }
    }
}

/// Extract a download failure carried inside an I/O error, if any
pub(crate) fn download_cause(error: &io::Error) -> Option<&DownloadError> {
    error
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<DownloadError>())
}
