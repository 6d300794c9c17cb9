//! Failure taxonomy of the dataset pipeline.
//!
//! Every variant is fatal for the run. Object overflow of a semantic vector is
//! not an error and is reported by the encoder instead.

use std::path::PathBuf;
use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed data in {source_name}: {message}")]
    DataFormat {
        source_name: String,
        message: String,
    },
    #[error("unrecognized {option} '{value}' (expected one of {expected})")]
    Configuration {
        option: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("{what} {key} not found (referenced by {referrer})")]
    Lookup {
        what: &'static str,
        key: String,
        referrer: String,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json parse error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
}

impl PipelineError {
    pub fn data_format(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::DataFormat {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    pub fn lookup(what: &'static str, key: impl ToString, referrer: impl Into<String>) -> Self {
        PipelineError::Lookup {
            what,
            key: key.to_string(),
            referrer: referrer.into(),
        }
    }
}
