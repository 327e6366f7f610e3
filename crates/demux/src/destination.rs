use std::{
    fs::{File, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    os::{fd::IntoRawFd, unix::fs::OpenOptionsExt},
    path::{Path, PathBuf},
};

use nix::errno::Errno;

/// A writable output a demultiplexed stream is reassembled into.
pub trait Destination: Write {
    /// Move the write position to `offset` before the next write.
    ///
    /// Destinations that can't seek (pipes, terminals) ignore the request.
    fn seek_to(&mut self, offset: u64) -> io::Result<()>;

    /// Flush and release the destination, reporting close failures.
    fn close(self: Box<Self>) -> io::Result<()>;
}

/// Creates the destination of a stream that was not named up front.
pub trait Opener {
    fn open(&mut self, name: &str) -> io::Result<Box<dyn Destination>>;
}

/// [`Destination`] writing to a file descriptor.
pub struct FileSink {
    file: File,
    position: u64,
    seekable: bool,
}

impl FileSink {
    pub fn new(file: File) -> Self {
        Self {
            file,
            position: 0,
            seekable: true,
        }
    }

    /// Bytes from the start of the destination to the current write position.
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let write_size = self.file.write(buf)?;

        self.position += write_size as u64;

        Ok(write_size)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Destination for FileSink {
    fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        if !self.seekable || offset == self.position {
            return Ok(());
        }

        match self.file.seek(SeekFrom::Start(offset)) {
            Ok(position) => {
                self.position = position;
                Ok(())
            }
            Err(err) if err.raw_os_error() == Some(Errno::ESPIPE as i32) => {
                log::trace!("destination is not seekable, ignore offset {}", offset);
                self.seekable = false;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        let mut sink = *self;

        sink.file.flush()?;

        nix::unistd::close(sink.file.into_raw_fd())?;

        Ok(())
    }
}

/// [`Opener`] creating files, relative to `root` if set.
///
/// Files are created with mode `0666` (before umask) and truncated.
#[derive(Debug, Default, Clone)]
pub struct FsOpener {
    root: Option<PathBuf>,
}

impl FsOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative names against `root` instead of the working directory.
    pub fn with_root<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(name),
            None => Path::new(name).to_owned(),
        }
    }
}

impl Opener for FsOpener {
    fn open(&mut self, name: &str) -> io::Result<Box<dyn Destination>> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o666)
            .open(self.path_of(name))?;

        Ok(Box::new(FileSink::new(file)))
    }
}

#[cfg(test)]
mod tests {
    use std::fs::read;

    use super::*;

    #[test]
    fn test_seek_leaves_hole() {
        let dir = tempfile::tempdir().unwrap();

        let mut opener = FsOpener::with_root(dir.path());

        let mut sink = opener.open("sparse").unwrap();

        sink.seek_to(0).unwrap();
        sink.write_all(b"ab").unwrap();
        sink.seek_to(5).unwrap();
        sink.write_all(b"c").unwrap();
        sink.close().unwrap();

        assert_eq!(read(dir.path().join("sparse")).unwrap(), b"ab\0\0\0c");
    }

    #[test]
    fn test_open_truncates() {
        let dir = tempfile::tempdir().unwrap();

        std::fs::write(dir.path().join("out"), b"previous content").unwrap();

        let mut sink = FsOpener::with_root(dir.path()).open("out").unwrap();

        sink.write_all(b"new").unwrap();
        sink.close().unwrap();

        assert_eq!(read(dir.path().join("out")).unwrap(), b"new");
    }

    #[test]
    fn test_pipe_ignores_offset() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();

        let mut sink = Box::new(FileSink::new(File::from(write_end)));

        sink.write_all(b"xy").unwrap();
        sink.seek_to(10).unwrap();
        sink.write_all(b"z").unwrap();

        assert_eq!(sink.position(), 3);

        sink.close().unwrap();

        let mut content = vec![];
        io::Read::read_to_end(&mut File::from(read_end), &mut content).unwrap();

        assert_eq!(content, b"xyz");
    }

    #[test]
    fn test_open_missing_directory() {
        let dir = tempfile::tempdir().unwrap();

        assert!(FsOpener::with_root(dir.path()).open("no/such/dir").is_err());
    }
}
