use thiserror::Error;

/// Errors surfaced by the tracing core.
///
/// None of these are fatal to the engine: a failed transmission is retried
/// with the next scheduled batch, and protocol misuse by collaborators is
/// downgraded to a logged warning before it ever becomes an error value.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TraceError {
    /// The downstream sender could not deliver a span batch.
    #[error("span batch could not be delivered: {0}")]
    SendFailed(String),

    /// Catch-all for sender-specific failures.
    #[error("{0}")]
    Other(String),
}

/// Result of handing a span batch to a [`DownstreamSender`].
///
/// [`DownstreamSender`]: crate::trace::DownstreamSender
pub type SendResult = Result<(), TraceError>;
