//! Error types for configuration loading.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur when loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("I/O error reading {path}: {error}")]
	Io {
		path: PathBuf,
		error: std::io::Error,
	},

	#[error("XML parse error: {0}")]
	Xml(#[from] quick_xml::DeError),

	#[error("invalid host rule '{pattern}': {error}")]
	InvalidHostRule { pattern: String, error: regex::Error },

	#[error("invalid value for {option}: {value}")]
	InvalidValue { option: &'static str, value: String },
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
