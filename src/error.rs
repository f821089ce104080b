use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload exceeds the configured `max_entry_payload_size` or the
    /// frame format's i32 length field. The log is unchanged.
    #[error("payload too large")]
    PayloadTooLarge,

    /// Operation on a disposed log, checkpoint store or consumer.
    #[error("component disposed")]
    Disposed,

    /// Attempt to open a sealed segment for writing. Fatal to the
    /// attempt, not to the log.
    #[error("segment is sealed")]
    SegmentSealed,

    /// Segment header failed magic, version or CRC validation.
    /// Non-recoverable for that file; the engine skips it at init.
    #[error("invalid segment header: {0}")]
    InvalidHeader(&'static str),

    /// Internal invariant violation (out-of-range offsets, poisoned
    /// locks). Indicates a bug or external tampering, not bad input.
    #[error("corrupt state: {0}")]
    Corrupt(&'static str),

    /// Cooperative cancellation observed at a suspension point.
    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
