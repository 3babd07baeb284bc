//! Framing-level error taxonomy.

/// Failure while reading or writing framed messages on a connection.
///
/// Every variant is connection-fatal by contract: the input worker treats a
/// framing failure as the end of that session and initiates shutdown. Other
/// sessions and the listener are unaffected.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A frame declared a length beyond the configured maximum.
    #[error("frame of {len} bytes exceeds maximum {max}")]
    Oversize {
        /// Declared frame length.
        len: usize,
        /// Configured maximum frame length.
        max: usize,
    },

    /// The peer closed the connection in the middle of a frame.
    #[error("connection closed mid-frame with {buffered} bytes buffered")]
    Truncated {
        /// Bytes of the incomplete frame already buffered.
        buffered: usize,
    },

    /// Socket-level read or write failure.
    #[error("socket i/o error: {0}")]
    Io(#[from] std::io::Error),
}
