//! Error types shared by the codec, the session machinery and backends.

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for all protocol and server operations.
///
/// The `Display` form of a `Server` error is what ends up in the `ename`
/// field of an `Rerror` reply; the codec variants surface decoding and
/// encoding violations before any reply can be formed.
#[derive(Debug, Error)]
pub enum Error {
    /// A frame was shorter than its declared lengths allow, carried trailing
    /// bytes, or declared a size below the 7-byte header minimum.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The one-byte message type was not a known 9P2000 opcode.
    #[error("unknown message type {0}")]
    UnknownType(u8),

    /// A string field exceeded the 16-bit length prefix on encode.
    #[error("string field exceeds 65535 bytes")]
    FieldTooLong,

    /// A frame exceeded the negotiated msize.
    #[error("frame of {size} bytes exceeds msize {msize}")]
    FrameTooLarge { size: u32, msize: u32 },

    /// A listen address did not take the `proto!address!port` form, or named
    /// a protocol the server does not speak.
    #[error("invalid listen address: {0}")]
    BadAddress(String),

    /// An error to be reported to the client via `Rerror`.
    #[error("{0}")]
    Server(String),

    /// Transport-level failure; terminal for the connection.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for an error destined for an `Rerror` reply.
    pub fn server(msg: impl Into<String>) -> Error {
        Error::Server(msg.into())
    }

    /// The `ename` string this error would put on the wire.
    pub fn ename(&self) -> String {
        self.to_string()
    }
}
