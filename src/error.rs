//! Error taxonomy for the hydrologic model.
//!
//! Only conditions that must stop a run are surfaced here. Missing initial
//! state rasters and missing forcing samples are recovered where they occur
//! (see `state` and `io::forcing`), and numeric degeneracies are clamped in
//! place by the flux and routing kernels.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used across the crate.
pub type HydroResult<T> = Result<T, HydroError>;

#[derive(Debug, Error)]
pub enum HydroError {
    /// I/O failure on a specific file.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An input the run cannot derive is absent.
    #[error("missing input: {path}")]
    MissingInput { path: PathBuf },

    /// Malformed grid, table or series file.
    #[error("parse error in {path} line {line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// Grid handed to the model does not match the domain.
    #[error("shape mismatch for '{name}': expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        name: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    /// Loaded drainage directions are not a forest of trees.
    #[error("invalid drainage network: {message}")]
    InvalidDrainage { message: String },

    #[error("unknown routing mode '{0}' (expected surface, subsurface or both)")]
    UnknownRoutingMode(String),

    /// Invalid configuration value.
    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HydroError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            return Self::MissingInput { path };
        }
        Self::Io { path, source }
    }

    pub fn parse(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            line,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// True for errors that the initialisation phase may recover from by
    /// deriving a default field.
    pub fn is_missing_input(&self) -> bool {
        matches!(self, Self::MissingInput { .. })
    }
}
