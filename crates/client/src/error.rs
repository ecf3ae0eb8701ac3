//! Client construction errors.
//!
//! Connection-lifecycle failures never surface here; the connection manager
//! handles them internally.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid notification url '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("storage directory {} is not usable", .0.display())]
    Storage(PathBuf),
}
