use thiserror::Error as ThisError;

/// Outcome classification shared by the buffer, the parser and the pipeline.
///
/// `TryAgain`, `NotFound` and `Full` are resumability signals: the caller waits for more I/O and
/// retries. `Exhausted`, `Unknown` and `Protocol` are fatal for the affected connection. `Empty`
/// means a reply arrived that nobody asked for, which is a bookkeeping bug and must be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum Error {
    #[error("not enough data buffered yet, try again")]
    TryAgain,
    #[error("requested length exceeds the available bytes")]
    OutOfBound,
    #[error("delimiter not found in the buffered bytes")]
    NotFound,
    #[error("memory allocation failed")]
    Exhausted,
    #[error("unknown reply type byte {0:#04x}")]
    Unknown(u8),
    #[error("no request is pending")]
    Empty,
    #[error("pipeline is full")]
    Full,
    #[error("connection closed")]
    Closed,
    #[error("not implemented")]
    NotImplemented,
    #[error("protocol error; {0}")]
    Protocol(&'static str),
}

impl Error {
    /// Whether the condition goes away by itself once more bytes arrive or a slot frees up.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TryAgain | Error::NotFound | Error::Full)
    }
}
