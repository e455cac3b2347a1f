use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors are grouped by kind rather than by module: a caller decides what
/// to retry or report based on whether the problem is its configuration,
/// the bytes it fed in, or the computation itself.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad or missing user input: absent files, empty vocabulary after
    /// thresholding, dimension mismatches, invalid k.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed data: wrong magic, unsupported version, JSON errors with
    /// location, unknown record keys.
    #[error("format error: {0}")]
    Format(String),

    /// Failures during computation: NaN in a matrix, out-of-range ids,
    /// operations unsupported on quantized matrices.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Training was aborted through `Embedder::abort`.
    #[error("aborted")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Error::Runtime(msg.into())
    }
}
