use std::io::{Read, Write};

use crate::{CodecError, Error, Result};

use super::{DataBlock, ReadStatus, RecordHeader, RecordRead, RecordWrite};

/// The label the raw codec gives to every record it reads.
pub const RAW_LABEL: &str = "data";

/// Default number of bytes a [`RawReader`] reads per record.
pub const DEFAULT_RAW_CHUNK: usize = 64 * 1024;

/// Writes a single stream without any framing.
///
/// Records are addressed by byte offset only and must arrive contiguously, since
/// the output is a plain byte stream.
pub struct RawWriter<W> {
    inner: W,
    path: String,
    position: u64,
}

impl<W: Write> RawWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_path(inner, "-")
    }

    pub fn with_path<P: Into<String>>(inner: W, path: P) -> Self {
        Self {
            inner,
            path: path.into(),
            position: 0,
        }
    }

    /// Bytes written so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> RecordWrite for RawWriter<W> {
    fn write_header(&mut self, header: &RecordHeader) -> Result<()> {
        let offset = header.offset.unwrap_or(self.position);

        if offset != self.position {
            return Err(CodecError::NonContiguous {
                expected: self.position,
                actual: offset,
            }
            .into());
        }

        Ok(())
    }

    fn write_data(&mut self, buf: &[u8]) -> Result<usize> {
        self.inner.write_all(buf).map_err(|source| Error::Write {
            path: self.path.clone(),
            source,
        })?;

        self.position += buf.len() as u64;

        Ok(buf.len())
    }

    fn finish_entry(&mut self) -> Result<()> {
        self.inner.flush().map_err(|source| Error::Write {
            path: self.path.clone(),
            source,
        })
    }

    fn close(&mut self) -> Result<()> {
        self.inner.flush().map_err(|err| CodecError::Io(err).into())
    }
}

enum RawState {
    /// Waiting for the next chunk.
    Idle,
    /// A chunk of `len` bytes at `offset` is being handed out, `served` so far.
    Serving { offset: u64, len: usize, served: usize },
    /// The zero-length terminator record was returned.
    Terminated,
}

/// Reads an unframed stream as a sequence of offset addressed records.
///
/// Every successful read of the underlying stream becomes one [`RAW_LABEL`]
/// record. End-of-input produces a final zero-length record, the terminator of
/// the stream, after which [`next_header`](RecordRead::next_header) reports
/// [`ReadStatus::End`].
pub struct RawReader<R> {
    inner: R,
    chunk: Vec<u8>,
    offset: u64,
    state: RawState,
}

impl<R: Read> RawReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_chunk_size(inner, DEFAULT_RAW_CHUNK)
    }

    /// Create a reader that emits records of at most `chunk_size` bytes.
    pub fn with_chunk_size(inner: R, chunk_size: usize) -> Self {
        Self {
            inner,
            chunk: vec![0; chunk_size.max(1)],
            offset: 0,
            state: RawState::Idle,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> RecordRead for RawReader<R> {
    fn next_header(&mut self) -> Result<ReadStatus<RecordHeader>> {
        match self.state {
            RawState::Terminated => return Ok(ReadStatus::End),
            RawState::Serving { offset, len, .. } => {
                // the rest of the previous chunk is dropped.
                self.offset = offset + len as u64;
                self.state = RawState::Idle;
            }
            RawState::Idle => {}
        }

        match self.inner.read(&mut self.chunk) {
            Ok(0) => {
                self.state = RawState::Terminated;

                Ok(ReadStatus::Ready(RecordHeader::at_offset(
                    RAW_LABEL,
                    0,
                    self.offset,
                )))
            }
            Ok(len) => {
                self.state = RawState::Serving {
                    offset: self.offset,
                    len,
                    served: 0,
                };

                Ok(ReadStatus::Ready(RecordHeader::at_offset(
                    RAW_LABEL,
                    len as u64,
                    self.offset,
                )))
            }
            Err(err) => ReadStatus::from_io_error(err),
        }
    }

    fn read_data_block(&mut self, buf: &mut [u8]) -> Result<ReadStatus<DataBlock>> {
        let RawState::Serving {
            offset,
            len,
            served,
        } = &mut self.state
        else {
            return Ok(ReadStatus::End);
        };

        if *served == *len {
            return Ok(ReadStatus::End);
        }

        let block_len = buf.len().min(*len - *served);

        buf[..block_len].copy_from_slice(&self.chunk[*served..*served + block_len]);

        let block = DataBlock {
            len: block_len,
            offset: Some(*offset + *served as u64),
        };

        *served += block_len;

        Ok(ReadStatus::Ready(block))
    }
}
