use std::io;

use thiserror::Error;

use crate::codec::CodecError;
use crate::header::FormatError;

/// Failure reported by an [`EntrySink`](crate::sink::EntrySink) for one entry.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("refusing unsafe entry path '{0}'")]
    UnsafePath(String),
    #[error("{0}")]
    Rejected(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Everything that can go wrong extracting one archive source.
#[derive(Error, Debug)]
pub enum ExtractError {
    /// Unknown or unregistered container type.  Raised before the source
    /// is opened.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("format error: {0}")]
    Format(#[from] FormatError),

    /// Failure inside a third-party codec (zstd, lz4, brotli, lzma).
    #[error("codec error: {0}")]
    Codec(String),

    #[error("malformed tar stream at byte offset {offset}: {message}")]
    Parse { offset: u64, message: String },

    #[error("sink failed on entry '{entry}': {source}")]
    Sink { entry: String, source: SinkError },

    #[error("cannot access '{path}': {source}")]
    Resource { path: String, source: io::Error },
}

impl ExtractError {
    /// Short category name, stable for reports.
    pub fn kind(&self) -> &'static str {
        match self {
            ExtractError::Configuration(_) => "configuration",
            ExtractError::Format(_)        => "format",
            ExtractError::Codec(_)         => "codec",
            ExtractError::Parse { .. }     => "parse",
            ExtractError::Sink { .. }      => "sink",
            ExtractError::Resource { .. }  => "resource",
        }
    }
}

impl From<CodecError> for ExtractError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Format(f) => ExtractError::Format(f),
            e @ (CodecError::UnavailableCodec { .. } | CodecError::UnknownContainer { .. }) => {
                ExtractError::Configuration(e.to_string())
            }
            other => ExtractError::Codec(other.to_string()),
        }
    }
}

/// One failure attributed to one archive source.
#[derive(Debug)]
pub struct SourceFailure {
    pub path:  String,
    pub error: ExtractError,
}

impl std::fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.error)
    }
}

/// Aggregate error of an extraction pass.  Never empty.
#[derive(Debug)]
pub struct ExtractAllError {
    pub failures: Vec<SourceFailure>,
}

impl std::fmt::Display for ExtractAllError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failure(s) during extraction", self.failures.len())?;
        if let Some(first) = self.failures.first() {
            write!(f, "; first: {first}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ExtractAllError {}

impl ExtractAllError {
    /// Paths of the sources that failed, without duplicates, in report order.
    pub fn failed_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = Vec::new();
        for f in &self.failures {
            if !paths.contains(&f.path.as_str()) {
                paths.push(&f.path);
            }
        }
        paths
    }
}
