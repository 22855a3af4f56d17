use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CairnError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    ConfigError(String),
    /// The canonical file uses an encoding this store cannot read.
    #[error("Format error: {0}")]
    FormatError(String),
    /// A write was attempted against a read-only store.
    #[error("Illegal write: {0}")]
    IllegalWrite(String),
    /// Writing would replace a non-empty canonical file with an empty record set.
    #[error("Refusing to overwrite {} with an empty record set", .0.display())]
    EmptyOverwrite(PathBuf),
    /// The master flag moved while this machine believed it held mastership.
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),
    #[error("Name mismatch: cannot merge '{right}' into '{left}'")]
    NameMismatch { left: String, right: String },
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<toml::de::Error> for CairnError {
    fn from(e: toml::de::Error) -> Self {
        CairnError::ConfigError(e.to_string())
    }
}
