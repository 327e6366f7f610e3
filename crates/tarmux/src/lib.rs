//! Command line front ends of `tarmux` and `tardemux`.
//!
//! `tarmux` interleaves files, pipes and standard input into one tar stream,
//! `tardemux` splits such a stream back into its original byte streams.

use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Read},
    os::{fd::AsFd, unix::fs::OpenOptionsExt},
    path::PathBuf,
};

use clap::Parser;
use tarmux_core::codec::{RawReader, RawWriter, RecordRead, RecordWrite, TarReader, TarWriter};
use tarmux_demux::{DemuxOptions, DemuxSummary, Demuxer, FileSink, FsOpener, DEFAULT_BLOCK_SIZE};
use tarmux_mux::{Input, MuxOptions, MuxSummary, Multiplexer, DEFAULT_BUFFER_SIZE, DEFAULT_STDIN_NAME};

pub use tarmux_core::*;
pub use tarmux_demux as demux;
pub use tarmux_mux as mux;

/// Name that stands for standard input or output on the command line.
const STDIO: &str = "-";

#[derive(Parser, Debug)]
#[command(
    name = "tarmux",
    version,
    about,
    long_about = "Multiplex files, pipes and standard input into a single tar stream. \
                  Data is emitted as soon as it is read, each piece as a sequenced fragment \
                  of its stream, so several streams can share one pipe or file."
)]
pub struct MuxCli {
    /// Append the tar stream to this file instead of writing it to standard output.
    #[arg(short = 'f', long = "file", default_value = STDIO)]
    pub output: String,

    /// The stream name of standard input.
    #[arg(short = 'n', long = "name", default_value = DEFAULT_STDIN_NAME)]
    pub stdin_name: String,

    /// Upper bound of a single fragment, in bytes.
    #[arg(short = 'b', long = "buffer-size", default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// Write the single input as an unframed stream.
    #[arg(short, long)]
    pub raw: bool,

    /// Use verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Files or pipes to multiplex, standard input if none is given.
    pub sources: Vec<PathBuf>,
}

impl MuxCli {
    pub fn run(self) -> Result<MuxSummary> {
        let inputs = self
            .sources
            .into_iter()
            .map(|path| {
                if path.as_os_str() == STDIO {
                    Input::Stdin
                } else {
                    Input::Path(path)
                }
            })
            .collect::<Vec<_>>();

        let options = MuxOptions::default()
            .buffer_size(self.buffer_size)
            .raw(self.raw)
            .stdin_name(self.stdin_name);

        options.validate(inputs.len())?;

        let output = BufWriter::new(open_output(&self.output)?);

        let writer: Box<dyn RecordWrite> = if self.raw {
            Box::new(RawWriter::with_path(output, self.output))
        } else {
            Box::new(TarWriter::with_path(output, self.output))
        };

        let (_, summary) = Multiplexer::new(inputs, writer, options)?.run()?;

        Ok(summary)
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "tardemux",
    version,
    about,
    long_about = "Demultiplex streams that have been multiplexed by tarmux. \
                  Without destinations the first stream is written to standard output and \
                  the rest of the input is left unread, so tardemux can be run again to \
                  extract the next stream."
)]
pub struct DemuxCli {
    /// Read the tar stream from these files, back to back. Standard input if none
    /// is given.
    #[arg(short = 'f', long = "file")]
    pub inputs: Vec<PathBuf>,

    /// Unpack every stream to a file named after it.
    #[arg(short = 'a', long = "all")]
    pub capture_all: bool,

    /// Treat the input as an unframed stream.
    #[arg(short, long)]
    pub raw: bool,

    /// Size of the transfer buffer, in bytes.
    #[arg(short = 'b', long = "block-size", default_value_t = DEFAULT_BLOCK_SIZE)]
    pub block_size: usize,

    /// Use verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Files or pipes the streams of the same name are written to.
    pub destinations: Vec<String>,
}

impl DemuxCli {
    pub fn run(self) -> Result<DemuxSummary> {
        let options = DemuxOptions::default()
            .capture_all(self.capture_all)
            .raw(self.raw)
            .block_size(self.block_size);

        options.validate(self.destinations.len())?;

        let path = match self.inputs.as_slice() {
            [] => STDIO.to_owned(),
            [path] => path.to_string_lossy().into_owned(),
            _ => "(chained inputs)".to_owned(),
        };

        let input = open_inputs(self.inputs)?;

        let reader: Box<dyn RecordRead> = if self.raw {
            Box::new(RawReader::with_chunk_size(input, self.block_size))
        } else {
            Box::new(TarReader::with_path(input, path))
        };

        let demuxer = if self.destinations.is_empty() && !self.capture_all {
            let stdout = FileSink::new(open_output(STDIO)?);

            Demuxer::single(reader, Box::new(stdout), options)?
        } else {
            Demuxer::multi(reader, self.destinations, FsOpener::new(), options)?
        };

        let (_, summary) = demuxer.run()?;

        Ok(summary)
    }
}

/// Initialize the process logger, `RUST_LOG` overrides the level.
pub fn init_logger(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };

    let mut builder = pretty_env_logger::formatted_timed_builder();

    builder.filter_level(level);

    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }

    builder.init();
}

/// Open `path` for appending, `-` is a duplicate of standard output.
fn open_output(path: &str) -> Result<File> {
    let open_error = |source| Error::Open {
        path: path.to_owned(),
        source,
    };

    if path == STDIO {
        let fd = io::stdout().as_fd().try_clone_to_owned().map_err(open_error)?;

        return Ok(File::from(fd));
    }

    OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o666)
        .open(path)
        .map_err(open_error)
}

/// Chain `paths` into one unbuffered reader, standard input if empty.
fn open_inputs(paths: Vec<PathBuf>) -> Result<Box<dyn Read>> {
    if paths.is_empty() {
        return Ok(Box::new(open_input(STDIO.as_ref())?));
    }

    let mut input: Box<dyn Read> = Box::new(io::empty());

    for path in paths {
        input = Box::new(input.chain(open_input(&path)?));
    }

    Ok(input)
}

fn open_input(path: &std::path::Path) -> Result<File> {
    let open_error = |source| Error::Open {
        path: path.to_string_lossy().into_owned(),
        source,
    };

    if path.as_os_str() == STDIO {
        let fd = io::stdin().as_fd().try_clone_to_owned().map_err(open_error)?;

        return Ok(File::from(fd));
    }

    File::open(path).map_err(open_error)
}
