use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration, {0}")]
    Config(ConfigError),

    #[error("Could not open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Could not lseek on {path} to offset {offset}: {source}")]
    Seek {
        path: String,
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("Could not close {path}: {source}")]
    Close {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Could not read from {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Could not write to {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Failure during poll: {0}")]
    Poll(#[source] io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Unexpected additional path in stream, aborting: {0}")]
    UnexpectedPath(String),

    #[error("Unnamed path in stream, aborting: {0}")]
    UnnamedPath(String),

    #[error("Stream {label} does not start at index 0 (first index is {index}), the beginning of the stream is missing")]
    SequenceStart { label: String, index: u64 },

    #[error("Stream fragment {label} is out of sequence, expected index {expected}")]
    SequenceGap { label: String, expected: u64 },

    #[error("Fragment index of {0} does not fit in 64 bits")]
    MalformedIndex(String),

    #[error("Stream {0} has already been terminated by a zero-length fragment")]
    StreamClosed(String),

    #[error("Refusing to create {0}, path escapes the working directory")]
    UnsafePath(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("raw mode cannot be used with multiple files ({0} given)")]
    RawWithMultipleSources(usize),

    #[error("raw mode cannot be used with multiple destinations ({0} given)")]
    RawWithMultipleTargets(usize),

    #[error("buffer size must be greater than zero")]
    ZeroBufferSize,
}

/// Errors raised by the record codecs.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Codec io error: {0}")]
    Io(#[from] io::Error),

    #[error("Record stream ended in the middle of {0}")]
    Truncated(&'static str),

    #[error("Invalid record header: {0}")]
    InvalidHeader(String),

    #[error("Unsupported entry type {kind:?} for {label}, only regular file fragments can be demultiplexed")]
    UnsupportedEntry { label: String, kind: u8 },

    #[error("Record {label} declares {declared} bytes, but {actual} bytes were written")]
    SizeMismatch {
        label: String,
        declared: u64,
        actual: u64,
    },

    #[error("Raw stream block at offset {actual} does not continue offset {expected}")]
    NonContiguous { expected: u64, actual: u64 },

    #[error("Gave up after {0} retries")]
    RetriesExhausted(usize),
}

impl Error {
    /// Returns the process exit code for this failure class.
    ///
    /// - `1` codec failure
    /// - `2` descriptor open/seek/close/poll failure
    /// - `3` configuration error
    /// - `4` data read/write failure
    /// - `5` protocol integrity violation
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Codec(_) => 1,
            Error::Open { .. } | Error::Seek { .. } | Error::Close { .. } | Error::Poll(_) => 2,
            Error::Config(_) => 3,
            Error::Read { .. } | Error::Write { .. } => 4,
            Error::UnexpectedPath(_)
            | Error::UnnamedPath(_)
            | Error::SequenceStart { .. }
            | Error::SequenceGap { .. }
            | Error::MalformedIndex(_)
            | Error::StreamClosed(_)
            | Error::UnsafePath(_) => 5,
        }
    }

    /// Returns true if this error signals a corrupted or misused stream rather than
    /// a failing environment.
    pub fn is_integrity(&self) -> bool {
        self.exit_code() == 5
    }
}

impl From<ConfigError> for Error {
    fn from(value: ConfigError) -> Self {
        Error::Config(value)
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Codec(CodecError::Io(io_error)) => io_error,
            _ => io::Error::new(io::ErrorKind::Other, value),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
