use std::{fs::File, os::fd::AsRawFd, path::PathBuf, time::Duration};

use mio::Token;
use tarmux_core::{
    codec::RecordWrite, CodecError, ConfigError, Error, Result,
};

use crate::{source::Source, MioReadiness, Readiness, Registration};

/// Default capacity of the fragment buffer, 1 MiB.
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Default logical name of standard input.
pub const DEFAULT_STDIN_NAME: &str = "-";

/// An input of the [`Multiplexer`].
#[derive(Debug)]
pub enum Input {
    /// A file or named pipe, the path is also its logical name.
    Path(PathBuf),
    /// The process standard input, named by [`MuxOptions::stdin_name`].
    Stdin,
    /// An open descriptor with an explicit logical name.
    File { name: String, file: File },
}

/// Multiplexer configuration.
#[derive(Debug, Clone)]
pub struct MuxOptions {
    /// Capacity of the fragment buffer, the upper bound of a record payload.
    pub buffer_size: usize,
    /// Address fragments by byte offset instead of labeling them with an index.
    /// Only valid with a single input.
    pub raw: bool,
    /// Logical name of standard input.
    pub stdin_name: String,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            raw: false,
            stdin_name: DEFAULT_STDIN_NAME.to_owned(),
        }
    }
}

impl MuxOptions {
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    pub fn stdin_name<N: Into<String>>(mut self, name: N) -> Self {
        self.stdin_name = name.into();
        self
    }

    /// Check the options against the number of inputs, before any I/O happens.
    ///
    /// Zero inputs means standard input only.
    pub fn validate(&self, inputs: usize) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize.into());
        }

        if self.raw && inputs > 1 {
            return Err(ConfigError::RawWithMultipleSources(inputs).into());
        }

        Ok(())
    }
}

/// Counters of a finished [`Multiplexer::run`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MuxSummary {
    pub sources: usize,
    pub records: u64,
    pub bytes: u64,
}

/// Drains a set of inputs into a [`RecordWrite`].
///
/// Inputs live in an arena indexed by their [`Token`]. A slot is emptied, and
/// its descriptor closed, once the input emitted its zero-length terminator.
pub struct Multiplexer<W, N = MioReadiness> {
    writer: W,
    readiness: N,
    sources: Vec<Option<Source>>,
    active: usize,
    buffer: Vec<u8>,
    raw: bool,
    summary: MuxSummary,
}

impl<W: RecordWrite> Multiplexer<W, MioReadiness> {
    /// Open `inputs`, standard input if empty, and register them with the
    /// platform poller.
    pub fn new(inputs: Vec<Input>, writer: W, options: MuxOptions) -> Result<Self> {
        let readiness = MioReadiness::new(inputs.len()).map_err(Error::Poll)?;

        Self::with_readiness(inputs, writer, readiness, options)
    }
}

impl<W: RecordWrite, N: Readiness> Multiplexer<W, N> {
    /// Like [`Multiplexer::new`] with a custom readiness implementation.
    pub fn with_readiness(
        inputs: Vec<Input>,
        writer: W,
        mut readiness: N,
        options: MuxOptions,
    ) -> Result<Self> {
        options.validate(inputs.len())?;

        let inputs = if inputs.is_empty() {
            vec![Input::Stdin]
        } else {
            inputs
        };

        let mut sources = Vec::with_capacity(inputs.len());

        for (slot, input) in inputs.into_iter().enumerate() {
            let mut source = match input {
                Input::Path(path) => Source::open(&path)?,
                Input::Stdin => Source::stdin(&options.stdin_name)?,
                Input::File { name, file } => Source::from_file(name, file)?,
            };

            let registration = readiness
                .register(source.as_raw_fd(), Token(slot))
                .map_err(Error::Poll)?;

            log::debug!(
                "register source {}, token={}, {:?}",
                source.name(),
                slot,
                registration
            );

            source.set_registration(registration);

            sources.push(Some(source));
        }

        Ok(Self {
            writer,
            readiness,
            active: sources.len(),
            summary: MuxSummary {
                sources: sources.len(),
                ..Default::default()
            },
            sources,
            buffer: vec![0; options.buffer_size],
            raw: options.raw,
        })
    }

    /// Number of inputs that did not reach end-of-input yet.
    pub fn active(&self) -> usize {
        self.active
    }

    /// Run until every input is drained, then close the record stream.
    ///
    /// Returns the writer together with the run counters.
    pub fn run(mut self) -> Result<(W, MuxSummary)> {
        let mut ready = vec![];

        while self.active > 0 {
            // inputs that still hold data must not wait for a new edge.
            let timeout = if self.sources.iter().flatten().any(Source::is_ready) {
                Some(Duration::ZERO)
            } else {
                None
            };

            ready.clear();

            self.readiness
                .wait(timeout, &mut ready)
                .map_err(Error::Poll)?;

            for token in &ready {
                if let Some(Some(source)) = self.sources.get_mut(token.0) {
                    source.set_ready();
                }
            }

            for slot in 0..self.sources.len() {
                if matches!(&self.sources[slot], Some(source) if source.is_ready()) {
                    self.service(slot)?;
                }
            }
        }

        self.writer.close()?;

        log::info!(
            "multiplexed {} sources, records={}, bytes={}",
            self.summary.sources,
            self.summary.records,
            self.summary.bytes
        );

        Ok((self.writer, self.summary))
    }

    /// Drain one ready input and emit what was read as one record.
    fn service(&mut self, slot: usize) -> Result<()> {
        let Some(source) = self.sources[slot].as_mut() else {
            return Ok(());
        };

        let Some(len) = source.fill(&mut self.buffer)? else {
            return Ok(());
        };

        let header = source.next_header(self.raw, len);

        log::trace!("emit record {}, size={}", header.label, len);

        self.writer.write_header(&header)?;

        let written = self.writer.write_data(&self.buffer[..len])?;

        if written != len {
            return Err(CodecError::SizeMismatch {
                label: header.label,
                declared: len as u64,
                actual: written as u64,
            }
            .into());
        }

        self.writer.finish_entry()?;

        self.summary.records += 1;
        self.summary.bytes += len as u64;

        if len == 0 {
            self.deactivate(slot)?;
        }

        Ok(())
    }

    fn deactivate(&mut self, slot: usize) -> Result<()> {
        let Some(source) = self.sources[slot].take() else {
            return Ok(());
        };

        if source.registration() == Registration::Polled {
            self.readiness
                .deregister(source.as_raw_fd())
                .map_err(Error::Poll)?;
        }

        self.active -= 1;

        log::debug!(
            "source {} terminated after {} fragments, active={}",
            source.name(),
            source.fragments(),
            self.active
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        fs::OpenOptions,
        io::Write,
        thread::{sleep, spawn},
    };

    use tarmux_core::{
        codec::{RawWriter, ReadStatus, RecordRead, TarReader, TarWriter},
        FragmentLabel,
    };
    use tempfile::NamedTempFile;

    use super::*;

    fn init_log() {
        let _ = pretty_env_logger::try_init();
    }

    fn temp_file(content: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file
    }

    fn named(name: &str, file: &NamedTempFile) -> Input {
        Input::File {
            name: name.to_owned(),
            file: File::open(file.path()).unwrap(),
        }
    }

    fn records(bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
        let mut reader = TarReader::new(bytes);
        let mut records = vec![];
        let mut buf = [0; 4096];

        while let ReadStatus::Ready(header) = reader.next_header().unwrap() {
            let mut data = vec![];

            while let ReadStatus::Ready(block) = reader.read_data_block(&mut buf).unwrap() {
                data.extend_from_slice(&buf[..block.len]);
            }

            records.push((header.label, data));
        }

        records
    }

    /// Group records per logical stream, checking the indices on the way.
    fn streams(records: &[(String, Vec<u8>)]) -> HashMap<String, Vec<Vec<u8>>> {
        let mut streams: HashMap<String, Vec<Vec<u8>>> = HashMap::new();

        for (label, data) in records {
            let label = FragmentLabel::parse(label);
            let fragments = streams.entry(label.key().to_owned()).or_default();

            assert_eq!(label.index().unwrap(), Some(fragments.len() as u64));

            fragments.push(data.clone());
        }

        streams
    }

    #[test]
    fn test_two_sources() {
        init_log();

        let a = temp_file(b"hello");
        let b = temp_file(b"world");

        let (writer, summary) = Multiplexer::new(
            vec![named("A", &a), named("B", &b)],
            TarWriter::new(vec![]),
            MuxOptions::default(),
        )
        .unwrap()
        .run()
        .unwrap();

        assert_eq!(
            summary,
            MuxSummary {
                sources: 2,
                records: 4,
                bytes: 10
            }
        );

        let streams = streams(&records(&writer.into_inner().unwrap()));

        assert_eq!(streams["A"], vec![b"hello".to_vec(), vec![]]);
        assert_eq!(streams["B"], vec![b"world".to_vec(), vec![]]);
    }

    #[test]
    fn test_empty_source() {
        let empty = temp_file(b"");

        let (writer, _) = Multiplexer::new(
            vec![named("empty", &empty)],
            TarWriter::new(vec![]),
            MuxOptions::default(),
        )
        .unwrap()
        .run()
        .unwrap();

        assert_eq!(
            records(&writer.into_inner().unwrap()),
            vec![("empty.0".to_owned(), vec![])]
        );
    }

    #[test]
    fn test_bounded_fragments() {
        let file = temp_file(b"abcdefghij");

        let (writer, _) = Multiplexer::new(
            vec![named("x", &file)],
            TarWriter::new(vec![]),
            MuxOptions::default().buffer_size(4),
        )
        .unwrap()
        .run()
        .unwrap();

        assert_eq!(
            records(&writer.into_inner().unwrap()),
            vec![
                ("x.0".to_owned(), b"abcd".to_vec()),
                ("x.1".to_owned(), b"efgh".to_vec()),
                ("x.2".to_owned(), b"ij".to_vec()),
                ("x.3".to_owned(), vec![]),
            ]
        );
    }

    #[test]
    fn test_path_is_logical_name() {
        let file = temp_file(b"data");

        let (writer, _) = Multiplexer::new(
            vec![Input::Path(file.path().to_owned())],
            TarWriter::new(vec![]),
            MuxOptions::default(),
        )
        .unwrap()
        .run()
        .unwrap();

        let streams = streams(&records(&writer.into_inner().unwrap()));

        let name = file.path().to_string_lossy();

        assert_eq!(streams[name.as_ref()], vec![b"data".to_vec(), vec![]]);
    }

    #[test]
    fn test_pipes_interleave() {
        init_log();

        let mut inputs = vec![];
        let mut producers = vec![];

        for (name, chunks) in [("fast", vec!["a1", "a2", "a3"]), ("slow", vec!["b1", "b2"])] {
            let (read_end, write_end) = nix::unistd::pipe().unwrap();

            inputs.push(Input::File {
                name: name.to_owned(),
                file: File::from(read_end),
            });

            let delay = if name == "slow" { 20 } else { 5 };

            producers.push(spawn(move || {
                let mut writer = File::from(write_end);

                for chunk in chunks {
                    writer.write_all(chunk.as_bytes()).unwrap();
                    sleep(Duration::from_millis(delay));
                }
            }));
        }

        let (writer, _) = Multiplexer::new(inputs, TarWriter::new(vec![]), MuxOptions::default())
            .unwrap()
            .run()
            .unwrap();

        for producer in producers {
            producer.join().unwrap();
        }

        let streams = streams(&records(&writer.into_inner().unwrap()));

        for (name, expected) in [("fast", "a1a2a3"), ("slow", "b1b2")] {
            let fragments = &streams[name];

            assert_eq!(fragments.concat(), expected.as_bytes());
            assert!(fragments.last().unwrap().is_empty());
            // only the terminator is empty.
            assert!(fragments[..fragments.len() - 1].iter().all(|f| !f.is_empty()));
        }
    }

    #[test]
    fn test_fifo_writer_connects_late() {
        init_log();

        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("fifo");

        nix::unistd::mkfifo(&fifo, nix::sys::stat::Mode::S_IRWXU).unwrap();

        let producer = {
            let fifo = fifo.clone();

            spawn(move || {
                sleep(Duration::from_millis(200));

                let mut writer = OpenOptions::new().write(true).open(&fifo).unwrap();

                writer.write_all(b"late data").unwrap();
            })
        };

        let (writer, summary) = Multiplexer::new(
            vec![Input::Path(fifo.clone())],
            TarWriter::new(vec![]),
            MuxOptions::default(),
        )
        .unwrap()
        .run()
        .unwrap();

        producer.join().unwrap();

        assert_eq!(summary.bytes, 9);

        let streams = streams(&records(&writer.into_inner().unwrap()));

        let name = fifo.to_string_lossy();
        let fragments = &streams[name.as_ref()];

        assert_eq!(fragments.concat(), b"late data");
        // the stream was not terminated before the writer showed up.
        assert!(!fragments[0].is_empty());
    }

    #[test]
    fn test_raw_mode() {
        let file = temp_file(&[0x42; 3000]);

        let (writer, summary) = Multiplexer::new(
            vec![named("raw", &file)],
            RawWriter::new(vec![]),
            MuxOptions::default().raw(true).buffer_size(1024),
        )
        .unwrap()
        .run()
        .unwrap();

        assert_eq!(summary.records, 4);
        assert_eq!(writer.into_inner(), vec![0x42; 3000]);
    }

    #[test]
    fn test_raw_mode_with_multiple_sources() {
        // the paths don't exist, the configuration is rejected before opening them.
        let result = Multiplexer::new(
            vec![
                Input::Path("/nonexistent/a".into()),
                Input::Path("/nonexistent/b".into()),
            ],
            TarWriter::new(vec![]),
            MuxOptions::default().raw(true),
        );

        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::RawWithMultipleSources(2)))
        ));
    }

    #[test]
    fn test_missing_source() {
        let result = Multiplexer::new(
            vec![Input::Path("/nonexistent/a".into())],
            TarWriter::new(vec![]),
            MuxOptions::default(),
        );

        assert!(matches!(result, Err(Error::Open { .. })));
    }

    #[test]
    fn test_zero_buffer() {
        assert!(matches!(
            MuxOptions::default().buffer_size(0).validate(1),
            Err(Error::Config(ConfigError::ZeroBufferSize))
        ));
    }
}
