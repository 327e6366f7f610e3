use std::{
    io::{Read, Write},
    time::{SystemTime, UNIX_EPOCH},
};

use ::tar::{Builder, EntryType, Header};

use crate::{CodecError, Error, Result};

use super::{padding, DataBlock, ReadStatus, RecordHeader, RecordRead, RecordWrite, BLOCK_SIZE};

/// Capacity of the `name` field of a tar header.
const NAME_LEN: usize = 100;

/// Name of the pseudo entry that carries a GNU long name.
const LONG_LINK_NAME: &[u8] = b"././@LongLink";

/// Upper bound of GNU long name / pax extension payloads.
const MAX_EXTENSION_SIZE: u64 = 1024 * 1024;

/// The record currently written by [`TarWriter`].
struct OpenEntry {
    label: String,
    header: Header,
    data: Vec<u8>,
}

/// Writes records as regular file entries of a tar stream.
///
/// Labels are stored verbatim, absolute and `..` labels included, labels longer
/// than 100 bytes are preceded by a GNU long name entry. Every finished entry is
/// flushed, so that a consumer on the other end of a pipe sees it immediately.
pub struct TarWriter<W: Write> {
    builder: Builder<W>,
    path: String,
    entry: Option<OpenEntry>,
}

impl<W: Write> TarWriter<W> {
    /// Create a writer on top of `inner`, diagnostics refer to it as `-`.
    pub fn new(inner: W) -> Self {
        Self::with_path(inner, "-")
    }

    /// Create a writer on top of `inner`, diagnostics refer to it as `path`.
    pub fn with_path<P: Into<String>>(inner: W, path: P) -> Self {
        Self {
            builder: Builder::new(inner),
            path: path.into(),
            entry: None,
        }
    }

    /// Gets a reference to the underlying writer.
    pub fn get_ref(&self) -> &W {
        self.builder.get_ref()
    }

    /// Unwraps this `TarWriter`, returning the underlying writer.
    ///
    /// The end-of-archive marker is written first if [`close`](RecordWrite::close)
    /// was not called.
    pub fn into_inner(self) -> Result<W> {
        let path = self.path;

        self.builder
            .into_inner()
            .map_err(|source| Error::Write { path, source })
    }

    fn write_error(&self, source: std::io::Error) -> Error {
        Error::Write {
            path: self.path.clone(),
            source,
        }
    }
}

impl<W: Write> RecordWrite for TarWriter<W> {
    fn write_header(&mut self, header: &RecordHeader) -> Result<()> {
        if let Some(entry) = &self.entry {
            return Err(CodecError::InvalidHeader(format!(
                "record {} was not finished before {}",
                entry.label, header.label
            ))
            .into());
        }

        self.entry = Some(OpenEntry {
            label: header.label.clone(),
            header: entry_header(header.label.as_bytes(), header.size, EntryType::Regular, 0o666),
            data: Vec::with_capacity(header.size as usize),
        });

        Ok(())
    }

    fn write_data(&mut self, buf: &[u8]) -> Result<usize> {
        let Some(entry) = &mut self.entry else {
            return Err(CodecError::InvalidHeader("data written before any header".into()).into());
        };

        let declared = entry.header.entry_size().unwrap_or_default();
        let written = (entry.data.len() + buf.len()) as u64;

        if written > declared {
            return Err(CodecError::SizeMismatch {
                label: entry.label.clone(),
                declared,
                actual: written,
            }
            .into());
        }

        entry.data.extend_from_slice(buf);

        Ok(buf.len())
    }

    fn finish_entry(&mut self) -> Result<()> {
        let Some(entry) = self.entry.take() else {
            return Ok(());
        };

        let declared = entry.header.entry_size().unwrap_or_default();

        if entry.data.len() as u64 != declared {
            return Err(CodecError::SizeMismatch {
                label: entry.label,
                declared,
                actual: entry.data.len() as u64,
            }
            .into());
        }

        let name = entry.label.as_bytes();

        if name.len() > NAME_LEN {
            // GNU tar stores the name NUL terminated.
            let long_name = entry_header(
                LONG_LINK_NAME,
                name.len() as u64 + 1,
                EntryType::GNULongName,
                0o644,
            );

            self.builder
                .append(&long_name, name.chain(&[0u8][..]))
                .map_err(|err| self.write_error(err))?;
        }

        self.builder
            .append(&entry.header, entry.data.as_slice())
            .map_err(|err| self.write_error(err))?;

        self.builder
            .get_mut()
            .flush()
            .map_err(|err| self.write_error(err))
    }

    fn close(&mut self) -> Result<()> {
        self.finish_entry()?;

        self.builder.finish().map_err(|err| self.write_error(err))?;

        self.builder
            .get_mut()
            .flush()
            .map_err(|err| self.write_error(err))
    }
}

/// Build a header carrying `name` verbatim, cut at 100 bytes.
fn entry_header(name: &[u8], size: u64, kind: EntryType, mode: u32) -> Header {
    let mut header = Header::new_gnu();

    let len = name.len().min(NAME_LEN);
    header.as_old_mut().name[..len].copy_from_slice(&name[..len]);

    header.set_entry_type(kind);
    header.set_size(size);
    header.set_mode(mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default(),
    );
    header.set_cksum();

    header
}

/// A GNU long name or pax extension entry whose payload is being read.
struct Extension {
    kind: EntryType,
    size: u64,
    data: Vec<u8>,
}

/// Reads records from a tar stream.
///
/// The reader never consumes more bytes than the records it hands out: after the
/// last header of a zero-length record nothing else has been read, so another
/// reader can pick up the remaining stream.
///
/// End-of-archive markers that precede the first record are skipped. This lets a
/// reader resume on a concatenation of archives after the previous reader stopped
/// at the last record of the first one. Once a record was returned, an
/// end-of-archive marker ends the input.
pub struct TarReader<R> {
    inner: R,
    path: String,
    block: [u8; BLOCK_SIZE],
    /// bytes of `block` filled so far.
    filled: usize,
    /// bytes to discard before the next header.
    skip: u64,
    /// unread payload of the current record.
    remaining: u64,
    /// padding that follows the current record.
    padding: u64,
    extension: Option<Extension>,
    long_name: Option<String>,
    zero_blocks: u8,
    started: bool,
    finished: bool,
}

impl<R: Read> TarReader<R> {
    /// Create a reader on top of `inner`, diagnostics refer to it as `-`.
    pub fn new(inner: R) -> Self {
        Self::with_path(inner, "-")
    }

    /// Create a reader on top of `inner`, diagnostics refer to it as `path`.
    pub fn with_path<P: Into<String>>(inner: R, path: P) -> Self {
        Self {
            inner,
            path: path.into(),
            block: [0; BLOCK_SIZE],
            filled: 0,
            skip: 0,
            remaining: 0,
            padding: 0,
            extension: None,
            long_name: None,
            zero_blocks: 0,
            started: false,
            finished: false,
        }
    }

    /// Unwraps this `TarReader`, returning the underlying reader.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Fill `block` keeping partial progress across retries.
    fn fill_block(&mut self) -> Result<ReadStatus<()>> {
        while self.filled < BLOCK_SIZE {
            match self.inner.read(&mut self.block[self.filled..]) {
                Ok(0) if self.filled == 0 => return Ok(ReadStatus::End),
                Ok(0) => return Err(CodecError::Truncated("record header").into()),
                Ok(read_size) => self.filled += read_size,
                Err(err) => return ReadStatus::from_io_error(err),
            }
        }

        self.filled = 0;

        Ok(ReadStatus::Ready(()))
    }

    fn skip_pending(&mut self) -> Result<ReadStatus<()>> {
        let mut scratch = [0u8; BLOCK_SIZE];

        while self.skip > 0 {
            let len = self.skip.min(BLOCK_SIZE as u64) as usize;

            match self.inner.read(&mut scratch[..len]) {
                Ok(0) => return Err(CodecError::Truncated("record payload").into()),
                Ok(read_size) => self.skip -= read_size as u64,
                Err(err) => return ReadStatus::from_io_error(err),
            }
        }

        Ok(ReadStatus::Ready(()))
    }

    fn read_extension(&mut self) -> Result<ReadStatus<()>> {
        if let Some(extension) = &mut self.extension {
            let mut chunk = [0u8; BLOCK_SIZE];

            while (extension.data.len() as u64) < extension.size {
                let len = (extension.size - extension.data.len() as u64).min(BLOCK_SIZE as u64);

                match self.inner.read(&mut chunk[..len as usize]) {
                    Ok(0) => return Err(CodecError::Truncated("extended header").into()),
                    Ok(read_size) => extension.data.extend_from_slice(&chunk[..read_size]),
                    Err(err) => return ReadStatus::from_io_error(err),
                }
            }
        }

        if let Some(extension) = self.extension.take() {
            self.skip = padding(extension.size);

            if extension.kind.is_gnu_longname() {
                let data = &extension.data;
                let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
                self.long_name = Some(String::from_utf8_lossy(&data[..end]).into_owned());
            } else if extension.kind.is_pax_local_extensions() {
                if let Some(path) = pax_path(&extension.data)? {
                    self.long_name = Some(path);
                }
            }
        }

        Ok(ReadStatus::Ready(()))
    }

    fn end_of_input(&mut self) -> Result<ReadStatus<RecordHeader>> {
        if self.extension.is_some() || self.long_name.is_some() {
            return Err(CodecError::Truncated("extended header").into());
        }

        self.finished = true;

        Ok(ReadStatus::End)
    }
}

macro_rules! ready {
    ($status: expr) => {
        match $status {
            ReadStatus::Ready(value) => value,
            ReadStatus::Retry(reason) => return Ok(ReadStatus::Retry(reason)),
            ReadStatus::End => return Ok(ReadStatus::End),
        }
    };
}

impl<R: Read> RecordRead for TarReader<R> {
    fn next_header(&mut self) -> Result<ReadStatus<RecordHeader>> {
        if self.finished {
            return Ok(ReadStatus::End);
        }

        self.skip += self.remaining + self.padding;
        self.remaining = 0;
        self.padding = 0;

        loop {
            // an extension completed here leaves its padding to skip.
            ready!(self.read_extension()?);
            ready!(self.skip_pending()?);

            match self.fill_block()? {
                ReadStatus::Ready(()) => {}
                ReadStatus::Retry(reason) => return Ok(ReadStatus::Retry(reason)),
                ReadStatus::End => return self.end_of_input(),
            }

            if self.block.iter().all(|b| *b == 0) {
                self.zero_blocks += 1;

                if self.zero_blocks < 2 {
                    continue;
                }

                self.zero_blocks = 0;

                if self.started {
                    self.finished = true;
                    return Ok(ReadStatus::End);
                }

                log::debug!("{}: skip end-of-archive marker", self.path);

                continue;
            }

            if self.zero_blocks > 0 {
                return Err(CodecError::InvalidHeader("lone zero block inside archive".into()).into());
            }

            verify_checksum(&self.block)?;

            let header = Header::from_byte_slice(&self.block);

            let kind = header.entry_type();

            let size = header
                .entry_size()
                .map_err(|err| CodecError::InvalidHeader(err.to_string()))?;

            if kind.is_gnu_longname() || kind.is_pax_local_extensions() || kind.is_pax_global_extensions()
            {
                if size > MAX_EXTENSION_SIZE {
                    return Err(CodecError::InvalidHeader(format!(
                        "extended header of {} bytes",
                        size
                    ))
                    .into());
                }

                self.extension = Some(Extension {
                    kind,
                    size,
                    data: Vec::with_capacity(size as usize),
                });

                continue;
            }

            let label = match self.long_name.take() {
                Some(name) => name,
                None => String::from_utf8_lossy(&header.path_bytes()).into_owned(),
            };

            if !(kind.is_file() || kind.is_contiguous()) {
                return Err(CodecError::UnsupportedEntry {
                    label,
                    kind: kind.as_byte(),
                }
                .into());
            }

            log::trace!("{}: record {}, size={}", self.path, label, size);

            self.started = true;
            self.remaining = size;
            self.padding = padding(size);

            return Ok(ReadStatus::Ready(RecordHeader::new(label, size)));
        }
    }

    fn read_data_block(&mut self, buf: &mut [u8]) -> Result<ReadStatus<DataBlock>> {
        if self.remaining == 0 {
            return Ok(ReadStatus::End);
        }

        let len = (buf.len() as u64).min(self.remaining) as usize;

        if len == 0 {
            return Err(CodecError::InvalidHeader("zero sized read buffer".into()).into());
        }

        match self.inner.read(&mut buf[..len]) {
            Ok(0) => Err(CodecError::Truncated("record payload").into()),
            Ok(read_size) => {
                self.remaining -= read_size as u64;

                Ok(ReadStatus::Ready(DataBlock {
                    len: read_size,
                    offset: None,
                }))
            }
            Err(err) => ReadStatus::from_io_error(err),
        }
    }
}

fn verify_checksum(block: &[u8; BLOCK_SIZE]) -> Result<()> {
    let header = Header::from_byte_slice(block);

    let expected = header
        .cksum()
        .map_err(|err| CodecError::InvalidHeader(err.to_string()))?;

    // the checksum field itself counts as eight spaces.
    let actual: u32 = block[..148]
        .iter()
        .chain(&[b' '; 8])
        .chain(&block[156..])
        .map(|b| *b as u32)
        .sum();

    if expected != actual {
        return Err(CodecError::InvalidHeader(format!(
            "checksum mismatch, expected {} computed {}",
            expected, actual
        ))
        .into());
    }

    Ok(())
}

/// Extract the `path` keyword from pax extended header records.
///
/// Each record reads `<length> <keyword>=<value>\n`, the length counting the
/// whole record.
fn pax_path(mut data: &[u8]) -> Result<Option<String>> {
    let mut path = None;

    while !data.is_empty() {
        let invalid = || CodecError::InvalidHeader("malformed pax record".into());

        let space = data.iter().position(|b| *b == b' ').ok_or_else(invalid)?;

        let len = std::str::from_utf8(&data[..space])
            .ok()
            .and_then(|len| len.parse::<usize>().ok())
            .ok_or_else(invalid)?;

        if len <= space + 1 || len > data.len() {
            return Err(invalid().into());
        }

        let record = &data[space + 1..len];
        let record = record.strip_suffix(b"\n").unwrap_or(record);

        if let Some(value) = record.strip_prefix(b"path=") {
            path = Some(String::from_utf8_lossy(value).into_owned());
        }

        data = &data[len..];
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    fn archive(records: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = TarWriter::new(vec![]);

        for (label, data) in records {
            writer
                .write_header(&RecordHeader::new(*label, data.len() as u64))
                .unwrap();
            assert_eq!(writer.write_data(data).unwrap(), data.len());
            writer.finish_entry().unwrap();
        }

        writer.close().unwrap();

        writer.into_inner().unwrap()
    }

    fn read_record<R: Read>(reader: &mut TarReader<R>) -> Option<(String, Vec<u8>)> {
        let header = match reader.next_header().unwrap() {
            ReadStatus::Ready(header) => header,
            ReadStatus::End => return None,
            ReadStatus::Retry(reason) => panic!("unexpected retry: {}", reason),
        };

        let mut data = vec![];
        let mut buf = [0; 100];

        while let ReadStatus::Ready(block) = reader.read_data_block(&mut buf).unwrap() {
            assert_eq!(block.offset, None);
            data.extend_from_slice(&buf[..block.len]);
        }

        assert_eq!(data.len() as u64, header.size);

        Some((header.label, data))
    }

    #[test]
    fn test_write_read() {
        let payload = vec![0x5a; 1000];

        let bytes = archive(&[("a.0", &b"hello"[..]), ("b.0", &payload[..]), ("a.1", &[])]);

        // 3 headers, 1 + 2 payload blocks, 2 trailer blocks.
        assert_eq!(bytes.len(), 8 * BLOCK_SIZE);

        let mut reader = TarReader::new(bytes.as_slice());

        assert_eq!(read_record(&mut reader), Some(("a.0".into(), b"hello".to_vec())));
        assert_eq!(read_record(&mut reader), Some(("b.0".into(), payload)));
        assert_eq!(read_record(&mut reader), Some(("a.1".into(), vec![])));
        assert_eq!(read_record(&mut reader), None);
        assert_eq!(read_record(&mut reader), None);
    }

    #[test]
    fn test_header_fields() {
        let bytes = archive(&[("x.0", &b"abc"[..])]);

        let header = Header::from_byte_slice(&bytes[..BLOCK_SIZE]);

        assert_eq!(header.entry_type(), EntryType::Regular);
        assert_eq!(header.mode().unwrap(), 0o666);
        assert_eq!(header.entry_size().unwrap(), 3);
        assert_eq!(header.path_bytes().as_ref(), b"x.0");
    }

    #[test]
    fn test_skip_unread_payload() {
        let bytes = archive(&[("a.0", &[1; 700][..]), ("a.1", &[])]);

        let mut reader = TarReader::new(bytes.as_slice());

        let header = reader.next_header().unwrap();
        assert_eq!(header, ReadStatus::Ready(RecordHeader::new("a.0", 700)));

        let mut buf = [0; 10];
        reader.read_data_block(&mut buf).unwrap();

        assert_eq!(read_record(&mut reader), Some(("a.1".into(), vec![])));
    }

    #[test]
    fn test_long_label() {
        let label = format!("{}.12", "n".repeat(150));

        let bytes = archive(&[(&label, &b"long"[..])]);

        let mut reader = TarReader::new(bytes.as_slice());

        assert_eq!(read_record(&mut reader), Some((label, b"long".to_vec())));
        assert_eq!(read_record(&mut reader), None);
    }

    #[test]
    fn test_labels_stored_verbatim() {
        let deep = format!("/var/tmp/{}/stream.log.0", "d".repeat(100));

        let bytes = archive(&[
            (&deep, &b"deep"[..]),
            ("../up.0", &b"up"[..]),
            ("/abs.0", &[]),
        ]);

        let mut reader = TarReader::new(bytes.as_slice());

        assert_eq!(read_record(&mut reader), Some((deep, b"deep".to_vec())));
        assert_eq!(read_record(&mut reader), Some(("../up.0".into(), b"up".to_vec())));
        assert_eq!(read_record(&mut reader), Some(("/abs.0".into(), vec![])));
        assert_eq!(read_record(&mut reader), None);
    }

    #[test]
    fn test_pax_path() {
        let mut bytes = vec![];

        let pax = b"17 path=pax/name\n";

        let header = entry_header(b"PaxHeader", pax.len() as u64, EntryType::XHeader, 0o644);
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(pax);
        bytes.resize(bytes.len() + padding(pax.len() as u64) as usize, 0);

        let header = entry_header(b"truncated", 2, EntryType::Regular, 0o644);
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(b"ok");
        bytes.resize(bytes.len() + padding(2) as usize, 0);

        let mut reader = TarReader::new(bytes.as_slice());

        assert_eq!(read_record(&mut reader), Some(("pax/name".into(), b"ok".to_vec())));
        assert_eq!(read_record(&mut reader), None);
    }

    #[test]
    fn test_stop_at_boundary_and_resume() {
        let mut bytes = archive(&[("first.0", &b"one"[..]), ("first.1", &[])]);
        bytes.extend(archive(&[("second.0", &b"two"[..]), ("second.1", &[])]));

        let mut input = bytes.as_slice();

        {
            let mut reader = TarReader::new(&mut input);
            assert_eq!(read_record(&mut reader), Some(("first.0".into(), b"one".to_vec())));
            assert_eq!(read_record(&mut reader), Some(("first.1".into(), vec![])));
        }

        // the trailer of the first archive and the whole second archive are left.
        assert_eq!(input.len(), 2 * BLOCK_SIZE + 5 * BLOCK_SIZE);

        let mut reader = TarReader::new(&mut input);
        assert_eq!(read_record(&mut reader), Some(("second.0".into(), b"two".to_vec())));
        assert_eq!(read_record(&mut reader), Some(("second.1".into(), vec![])));
        assert_eq!(read_record(&mut reader), None);
    }

    #[test]
    fn test_empty_input() {
        let mut reader = TarReader::new(io::empty());

        assert_eq!(reader.next_header().unwrap(), ReadStatus::End);
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut bytes = archive(&[("a.0", &b"x"[..])]);

        bytes[0] = b'b';

        let mut reader = TarReader::new(bytes.as_slice());

        assert!(matches!(
            reader.next_header(),
            Err(Error::Codec(CodecError::InvalidHeader(_)))
        ));
    }

    #[test]
    fn test_truncated_payload() {
        let bytes = archive(&[("a.0", &[7; 600][..])]);

        let mut reader = TarReader::new(&bytes[..BLOCK_SIZE + 100]);

        reader.next_header().unwrap();

        let mut buf = [0; 1024];

        assert_eq!(
            reader.read_data_block(&mut buf).unwrap(),
            ReadStatus::Ready(DataBlock {
                len: 100,
                offset: None
            })
        );

        assert!(matches!(
            reader.read_data_block(&mut buf),
            Err(Error::Codec(CodecError::Truncated(_)))
        ));
    }

    #[test]
    fn test_unsupported_entry() {
        let header = entry_header(b"dir", 0, EntryType::Directory, 0o755);

        let mut reader = TarReader::new(&header.as_bytes()[..]);

        assert!(matches!(
            reader.next_header(),
            Err(Error::Codec(CodecError::UnsupportedEntry { .. }))
        ));
    }

    /// A reader that is interrupted once after `at` bytes.
    struct Interrupted<'a> {
        data: &'a [u8],
        at: usize,
        fired: bool,
    }

    impl<'a> Read for Interrupted<'a> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.fired && self.at == 0 {
                self.fired = true;
                return Err(io::ErrorKind::Interrupted.into());
            }

            let len = if self.fired {
                buf.len()
            } else {
                buf.len().min(self.at)
            };

            let read_size = self.data.read(&mut buf[..len])?;

            if !self.fired {
                self.at -= read_size;
            }

            Ok(read_size)
        }
    }

    #[test]
    fn test_retry_keeps_partial_header() {
        let bytes = archive(&[("a.0", &b"abc"[..])]);

        let mut reader = TarReader::new(Interrupted {
            data: &bytes,
            at: 200,
            fired: false,
        });

        assert!(matches!(reader.next_header().unwrap(), ReadStatus::Retry(_)));
        assert_eq!(
            reader.next_header().unwrap(),
            ReadStatus::Ready(RecordHeader::new("a.0", 3))
        );
    }

    #[test]
    fn test_writer_size_mismatch() {
        let mut writer = TarWriter::new(vec![]);

        writer.write_header(&RecordHeader::new("a.0", 2)).unwrap();

        assert!(matches!(
            writer.write_data(b"abc"),
            Err(Error::Codec(CodecError::SizeMismatch { .. }))
        ));

        writer.write_data(b"a").unwrap();

        assert!(matches!(
            writer.finish_entry(),
            Err(Error::Codec(CodecError::SizeMismatch { .. }))
        ));
    }
}
