use thiserror::Error;

/// Errors raised while decoding or rewriting a captured frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("packet shorter than a minimal IPv4 header ({0} bytes)")]
    Malformed(usize),

    #[error("IP protocol {0} is neither TCP nor UDP")]
    UnsupportedProtocol(u8),

    #[error("TCP option area has no room for {needed} more bytes ({available} available)")]
    NoOptionSpace { needed: usize, available: usize },

    #[error("buffer capacity {capacity} is too small to grow the packet to {required} bytes")]
    NoCapacity { capacity: usize, required: usize },

    #[error("TCP option kind {0} not present in the option area")]
    OptionNotFound(u8),

    #[error("TCP option area is malformed (length byte runs past the header)")]
    MalformedOptions,
}

pub type Result<T> = std::result::Result<T, ParseError>;
