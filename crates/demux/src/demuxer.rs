use std::{
    io::Write,
    path::{Component, Path},
};

use tarmux_core::{
    codec::{retry, RecordHeader, RecordRead},
    ConfigError, Error, FragmentLabel, Result,
};

use crate::{Destination, Opener};

/// Default size of the transfer buffer, 64 KiB.
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Demultiplexer configuration.
#[derive(Debug, Clone)]
pub struct DemuxOptions {
    /// Create a destination for every stream that was not named up front.
    pub capture_all: bool,
    /// Records are offset addressed and carry no stream identity.
    pub raw: bool,
    /// Upper bound of consecutive retries of a transient codec condition,
    /// `None` retries forever.
    pub max_retries: Option<usize>,
    /// Size of the transfer buffer.
    pub block_size: usize,
}

impl Default for DemuxOptions {
    fn default() -> Self {
        Self {
            capture_all: false,
            raw: false,
            max_retries: None,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl DemuxOptions {
    pub fn capture_all(mut self, capture_all: bool) -> Self {
        self.capture_all = capture_all;
        self
    }

    pub fn raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    pub fn max_retries(mut self, max_retries: Option<usize>) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Check the options against the number of named destinations.
    pub fn validate(&self, targets: usize) -> Result<()> {
        if self.block_size == 0 {
            return Err(ConfigError::ZeroBufferSize.into());
        }

        if self.raw && targets > 1 {
            return Err(ConfigError::RawWithMultipleTargets(targets).into());
        }

        Ok(())
    }
}

/// Counters of a finished [`Demuxer::run`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DemuxSummary {
    pub targets: usize,
    pub records: u64,
    pub bytes: u64,
}

struct Target {
    name: String,
    /// `None` once the stream was terminated.
    sink: Option<Box<dyn Destination>>,
    /// Index the next sequenced fragment must carry.
    next_index: u64,
    bytes: u64,
}

impl Target {
    fn new(name: String, sink: Box<dyn Destination>) -> Self {
        Self {
            name,
            sink: Some(sink),
            next_index: 0,
            bytes: 0,
        }
    }
}

enum Mode {
    /// The first stream of the input is written to the implicit destination,
    /// taken on the first record.
    Single(Option<Box<dyn Destination>>),
    /// Streams are matched against named destinations, unknown ones are created
    /// with the opener in capture-all mode.
    Multi(Box<dyn Opener>),
}

/// Routes the records of a [`RecordRead`] to their destinations.
///
/// A zero-length record terminates its stream: the destination is closed and
/// any later record of the same stream is an error. In single-target mode the
/// run stops right after the terminator, leaving the rest of the input unread.
pub struct Demuxer<R> {
    reader: R,
    mode: Mode,
    targets: Vec<Target>,
    active: usize,
    buffer: Vec<u8>,
    options: DemuxOptions,
    summary: DemuxSummary,
}

impl<R: RecordRead> Demuxer<R> {
    /// Write the first stream found in `reader` to `output`.
    pub fn single(reader: R, output: Box<dyn Destination>, options: DemuxOptions) -> Result<Self> {
        options.validate(1)?;

        Ok(Self::new(reader, Mode::Single(Some(output)), vec![], options))
    }

    /// Write the streams of `reader` to the destinations `names`, opened with
    /// `opener` before the first record is read.
    pub fn multi<O>(reader: R, names: Vec<String>, mut opener: O, options: DemuxOptions) -> Result<Self>
    where
        O: Opener + 'static,
    {
        options.validate(names.len())?;

        let mut targets = Vec::with_capacity(names.len());

        for name in names {
            let sink = opener.open(&name).map_err(|source| Error::Open {
                path: name.clone(),
                source,
            })?;

            log::debug!("open destination {}", name);

            targets.push(Target::new(name, sink));
        }

        Ok(Self::new(reader, Mode::Multi(Box::new(opener)), targets, options))
    }

    fn new(reader: R, mode: Mode, targets: Vec<Target>, options: DemuxOptions) -> Self {
        Self {
            reader,
            mode,
            active: targets.len(),
            summary: DemuxSummary {
                targets: targets.len(),
                ..Default::default()
            },
            targets,
            buffer: vec![0; options.block_size],
            options,
        }
    }

    /// Consume records until the run completes.
    ///
    /// Returns the reader, positioned right after the last consumed record,
    /// together with the run counters.
    pub fn run(mut self) -> Result<(R, DemuxSummary)> {
        loop {
            let reader = &mut self.reader;

            let Some(header) = retry(self.options.max_retries, || reader.next_header())? else {
                log::debug!("end of record stream, active destinations={}", self.active);
                break;
            };

            let slot = self.resolve(&header.label)?;

            self.check_sequence(slot, &header.label)?;

            let transferred = self.transfer(slot, &header)?;

            self.summary.records += 1;
            self.summary.bytes += transferred;

            if transferred == 0 {
                self.terminate(slot)?;

                if self.is_done() {
                    break;
                }
            }
        }

        for slot in 0..self.targets.len() {
            self.terminate(slot)?;
        }

        if let Mode::Single(Some(output)) = self.mode {
            // the input held no record at all.
            output.close().map_err(|source| Error::Close {
                path: "-".to_owned(),
                source,
            })?;
        }

        log::info!(
            "demultiplexed {} streams, records={}, bytes={}",
            self.summary.targets,
            self.summary.records,
            self.summary.bytes
        );

        Ok((self.reader, self.summary))
    }

    /// Find the destination of the record `label`, creating it if allowed.
    fn resolve(&mut self, label: &str) -> Result<usize> {
        if self.options.raw && matches!(self.mode, Mode::Multi(_)) && self.targets.len() == 1 {
            return self.open_slot(0, label);
        }

        let key = FragmentLabel::key_of(label);

        if let Some(slot) = self.targets.iter().position(|target| target.name == key) {
            return self.open_slot(slot, label);
        }

        let sink = match &mut self.mode {
            Mode::Single(output) => output
                .take()
                .ok_or_else(|| Error::UnexpectedPath(label.to_owned()))?,
            Mode::Multi(opener) if self.options.capture_all => {
                if is_unsafe(key) {
                    return Err(Error::UnsafePath(key.to_owned()));
                }

                let sink = opener.open(key).map_err(|source| Error::Open {
                    path: key.to_owned(),
                    source,
                })?;

                log::info!("capture new stream {}", key);

                sink
            }
            Mode::Multi(_) => return Err(Error::UnnamedPath(label.to_owned())),
        };

        self.targets.push(Target::new(key.to_owned(), sink));
        self.active += 1;
        self.summary.targets += 1;

        Ok(self.targets.len() - 1)
    }

    fn open_slot(&self, slot: usize, label: &str) -> Result<usize> {
        if self.targets[slot].sink.is_none() {
            return Err(Error::StreamClosed(label.to_owned()));
        }

        Ok(slot)
    }

    /// Reject fragments that don't continue their stream, before any byte of
    /// them is written.
    fn check_sequence(&mut self, slot: usize, label: &str) -> Result<()> {
        if self.options.raw {
            return Ok(());
        }

        let Some(index) = FragmentLabel::parse(label).index()? else {
            return Ok(());
        };

        let target = &mut self.targets[slot];

        if target.next_index == 0 && index != 0 {
            return Err(Error::SequenceStart {
                label: label.to_owned(),
                index,
            });
        }

        if index != target.next_index {
            return Err(Error::SequenceGap {
                label: label.to_owned(),
                expected: target.next_index,
            });
        }

        target.next_index += 1;

        Ok(())
    }

    /// Copy the payload of the current record to its destination, returns the
    /// number of bytes copied.
    fn transfer(&mut self, slot: usize, header: &RecordHeader) -> Result<u64> {
        let target = &mut self.targets[slot];

        let Some(sink) = target.sink.as_mut() else {
            return Err(Error::StreamClosed(header.label.clone()));
        };

        let reader = &mut self.reader;
        let buffer = &mut self.buffer;

        let mut transferred = 0;

        while let Some(block) = retry(self.options.max_retries, || reader.read_data_block(buffer))? {
            if let Some(offset) = block.offset {
                sink.seek_to(offset).map_err(|source| Error::Seek {
                    path: target.name.clone(),
                    offset,
                    source,
                })?;
            }

            sink.write_all(&buffer[..block.len])
                .map_err(|source| Error::Write {
                    path: target.name.clone(),
                    source,
                })?;

            transferred += block.len as u64;
        }

        log::trace!("{} -> {}, {} bytes", header.label, target.name, transferred);

        target.bytes += transferred;

        Ok(transferred)
    }

    /// Close the destination of `slot` if it is still open.
    fn terminate(&mut self, slot: usize) -> Result<()> {
        let target = &mut self.targets[slot];

        let Some(sink) = target.sink.take() else {
            return Ok(());
        };

        sink.close().map_err(|source| Error::Close {
            path: target.name.clone(),
            source,
        })?;

        self.active -= 1;

        log::debug!(
            "destination {} closed after {} bytes, active={}",
            target.name,
            target.bytes,
            self.active
        );

        Ok(())
    }

    /// Whether the run stops after a stream was terminated.
    ///
    /// In capture-all mode the end of the archive is the boundary, closing every
    /// known destination does not end the run.
    fn is_done(&self) -> bool {
        match self.mode {
            Mode::Single(_) => true,
            // in capture-all mode new streams may still show up.
            Mode::Multi(_) => self.active == 0 && !self.options.capture_all,
        }
    }
}

/// A captured name must stay below the directory destinations are created in.
fn is_unsafe(name: &str) -> bool {
    Path::new(name)
        .components()
        .any(|component| component == Component::ParentDir)
}
