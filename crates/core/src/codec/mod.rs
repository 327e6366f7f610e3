//! The record container the multiplexing protocol is carried in.
//!
//! A record is a labeled, sized payload. Writers receive a header followed by its
//! data and a [`finish_entry`](RecordWrite::finish_entry) call; readers hand out
//! headers and then the payload block by block.
//!
//! Read operations report a tri-state [`ReadStatus`]: a value, a transient
//! condition that may be retried without losing state, or the end of input.
//! Fatal conditions are returned as [`Err`](crate::Error).

use std::io;

use crate::{CodecError, Result};

mod raw;
pub use raw::*;

mod ustar;
pub use ustar::*;

/// Header of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    /// The record label, `name.index` in sequence mode.
    pub label: String,
    /// Payload length in bytes.
    pub size: u64,
    /// Byte offset of the payload within its stream, only carried by codecs with
    /// sparse addressing.
    pub offset: Option<u64>,
}

impl RecordHeader {
    /// Create a header for a sequence mode record.
    pub fn new<L: Into<String>>(label: L, size: u64) -> Self {
        Self {
            label: label.into(),
            size,
            offset: None,
        }
    }

    /// Create a header addressed by byte offset.
    pub fn at_offset<L: Into<String>>(label: L, size: u64, offset: u64) -> Self {
        Self {
            label: label.into(),
            size,
            offset: Some(offset),
        }
    }
}

/// A block of payload copied into the caller's buffer by
/// [`RecordRead::read_data_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBlock {
    /// Number of valid bytes at the start of the buffer.
    pub len: usize,
    /// Stream offset of the first byte, for sparse addressed records.
    pub offset: Option<u64>,
}

/// Result of a read operation that did not fail fatally.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadStatus<T> {
    Ready(T),
    /// A transient condition, the operation can be repeated.
    Retry(String),
    /// No more headers, or no more data in the current record.
    End,
}

impl<T> ReadStatus<T> {
    /// Maps a transient io error into [`ReadStatus::Retry`], any other error into a
    /// fatal codec error.
    pub(crate) fn from_io_error(err: io::Error) -> Result<Self> {
        match err.kind() {
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => {
                Ok(ReadStatus::Retry(err.to_string()))
            }
            _ => Err(CodecError::Io(err).into()),
        }
    }
}

/// Sink side of the record container.
pub trait RecordWrite {
    /// Start a new record. Must be followed by `header.size` bytes of data and
    /// [`finish_entry`](Self::finish_entry).
    fn write_header(&mut self, header: &RecordHeader) -> Result<()>;

    /// Write payload of the current record, returns the number of bytes written.
    fn write_data(&mut self, buf: &[u8]) -> Result<usize>;

    /// Complete the current record.
    fn finish_entry(&mut self) -> Result<()>;

    /// Terminate the container and flush the underlying transport.
    fn close(&mut self) -> Result<()>;
}

/// Source side of the record container.
pub trait RecordRead {
    /// Advance to the next record, skipping any unread payload of the current one.
    fn next_header(&mut self) -> Result<ReadStatus<RecordHeader>>;

    /// Copy the next block of payload of the current record into `buf`.
    ///
    /// Returns [`ReadStatus::End`] once the record payload is exhausted.
    fn read_data_block(&mut self, buf: &mut [u8]) -> Result<ReadStatus<DataBlock>>;
}

impl<T: RecordWrite + ?Sized> RecordWrite for Box<T> {
    fn write_header(&mut self, header: &RecordHeader) -> Result<()> {
        (**self).write_header(header)
    }

    fn write_data(&mut self, buf: &[u8]) -> Result<usize> {
        (**self).write_data(buf)
    }

    fn finish_entry(&mut self) -> Result<()> {
        (**self).finish_entry()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

impl<T: RecordRead + ?Sized> RecordRead for Box<T> {
    fn next_header(&mut self) -> Result<ReadStatus<RecordHeader>> {
        (**self).next_header()
    }

    fn read_data_block(&mut self, buf: &mut [u8]) -> Result<ReadStatus<DataBlock>> {
        (**self).read_data_block(buf)
    }
}

/// Repeat `op` while it reports [`ReadStatus::Retry`].
///
/// Every retry is logged as a warning. `max_retries` bounds the number of
/// repetitions, `None` retries forever.
///
/// Returns `Ok(None)` on [`ReadStatus::End`].
pub fn retry<T, F>(max_retries: Option<usize>, mut op: F) -> Result<Option<T>>
where
    F: FnMut() -> Result<ReadStatus<T>>,
{
    let mut retries = 0;

    loop {
        match op()? {
            ReadStatus::Ready(value) => return Ok(Some(value)),
            ReadStatus::End => return Ok(None),
            ReadStatus::Retry(reason) => {
                if let Some(max_retries) = max_retries {
                    if retries >= max_retries {
                        log::error!("Error: {}, giving up after {} retries", reason, retries);
                        return Err(CodecError::RetriesExhausted(retries).into());
                    }
                }

                retries += 1;

                log::warn!("Warning: {}, retry={}", reason, retries);
            }
        }
    }
}

/// Size of a tar block, the unit of padding.
pub(crate) const BLOCK_SIZE: usize = 512;

/// Returns the number of zero bytes that pad `size` bytes to a block boundary.
pub(crate) fn padding(size: u64) -> u64 {
    let rem = size % BLOCK_SIZE as u64;

    if rem == 0 {
        0
    } else {
        BLOCK_SIZE as u64 - rem
    }
}
