use std::{
    fs::{File, OpenOptions},
    io::{self, Read},
    os::{
        fd::{AsFd, AsRawFd, RawFd},
        unix::fs::OpenOptionsExt,
    },
    path::Path,
};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use tarmux_core::{format_label, codec::RecordHeader, Error, Result};

use crate::Registration;

/// An input stream drained by the multiplexer.
pub(crate) struct Source {
    /// Logical name, the prefix of every record label.
    name: String,
    file: File,
    /// Number of fragments emitted so far, the index of the next one.
    index: u64,
    /// Bytes emitted so far, the offset of the next raw fragment.
    offset: u64,
    registration: Registration,
    /// Data may be available without waiting for a readiness event.
    ready: bool,
    /// A read returned end-of-input, the next fragment is the terminator.
    eof: bool,
    /// File status flags to put back when the descriptor is shared with the
    /// rest of the process.
    restore_flags: Option<OFlag>,
}

impl Source {
    fn new(name: String, file: File, restore_flags: Option<OFlag>) -> Self {
        Self {
            name,
            file,
            index: 0,
            offset: 0,
            registration: Registration::Polled,
            // polled descriptors wait for their first event, even a fifo without
            // a writer reads as end-of-input until one connects.
            ready: false,
            eof: false,
            restore_flags,
        }
    }

    /// Open `path` for non-blocking reads, the path is the logical name.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let name = path.to_string_lossy().into_owned();

        let file = OpenOptions::new()
            .read(true)
            .custom_flags(nix::libc::O_NONBLOCK)
            .open(path)
            .map_err(|source| Error::Open {
                path: name.clone(),
                source,
            })?;

        Ok(Self::new(name, file, None))
    }

    /// Reuse the process standard input under the logical `name`.
    ///
    /// The descriptor is duplicated and switched to non-blocking mode, the
    /// original status flags are restored on drop.
    pub(crate) fn stdin(name: &str) -> Result<Self> {
        let open_error = |source| Error::Open {
            path: name.to_owned(),
            source,
        };

        let fd = io::stdin()
            .as_fd()
            .try_clone_to_owned()
            .map_err(open_error)?;

        let file = File::from(fd);

        let flags = set_nonblocking(file.as_raw_fd()).map_err(open_error)?;

        Ok(Self::new(name.to_owned(), file, Some(flags)))
    }

    /// Take ownership of an open `file` under the logical `name`.
    pub(crate) fn from_file(name: String, file: File) -> Result<Self> {
        set_nonblocking(file.as_raw_fd()).map_err(|source| Error::Open {
            path: name.clone(),
            source,
        })?;

        Ok(Self::new(name, file, None))
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn fragments(&self) -> u64 {
        self.index
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready
    }

    pub(crate) fn set_ready(&mut self) {
        self.ready = true;
    }

    pub(crate) fn registration(&self) -> Registration {
        self.registration
    }

    /// Record how the descriptor is watched. Descriptors that are never
    /// polled are ready from the start.
    pub(crate) fn set_registration(&mut self, registration: Registration) {
        self.registration = registration;
        self.ready = registration == Registration::AlwaysReady;
    }

    /// Read what is available right now into `buf`.
    ///
    /// Stops when `buf` is full, at end-of-input, or when the next read would
    /// block. Returns `None` if nothing could be read without blocking, otherwise
    /// the number of bytes read, `0` meaning end-of-input.
    pub(crate) fn fill(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        if self.eof {
            return Ok(Some(0));
        }

        let mut filled = 0;

        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(read_size) => filled += read_size,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.ready = false;

                    if filled == 0 {
                        return Ok(None);
                    }

                    break;
                }
                Err(source) => {
                    return Err(Error::Read {
                        path: self.name.clone(),
                        source,
                    })
                }
            }
        }

        Ok(Some(filled))
    }

    /// Create the header of the next fragment of `len` bytes and advance the
    /// sequence counter and the byte offset.
    pub(crate) fn next_header(&mut self, raw: bool, len: usize) -> RecordHeader {
        let header = if raw {
            RecordHeader::at_offset(self.name.clone(), len as u64, self.offset)
        } else {
            RecordHeader::new(format_label(&self.name, self.index), len as u64)
        };

        self.index += 1;
        self.offset += len as u64;

        header
    }
}

impl AsRawFd for Source {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        if let Some(flags) = self.restore_flags {
            if let Err(err) = fcntl(self.file.as_raw_fd(), FcntlArg::F_SETFL(flags)) {
                log::warn!("{}: could not restore file status flags, {}", self.name, err);
            }
        }
    }
}

/// Switch `fd` to non-blocking mode, returns the previous status flags.
fn set_nonblocking(fd: RawFd) -> io::Result<OFlag> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);

    if !flags.contains(OFlag::O_NONBLOCK) {
        fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    }

    Ok(flags)
}
