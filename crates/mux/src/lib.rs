//! Interleave several byte streams into one record stream.
//!
//! The [`Multiplexer`] owns every input descriptor and a single reusable buffer.
//! It waits on a [`Readiness`] set, drains each ready input only as far as it can
//! without blocking and emits what it read as one record labeled
//! `<name>.<index>`. An input that reaches end-of-input emits one last
//! zero-length record and is closed.
//!
//! ```no_run
//! use tarmux_core::codec::TarWriter;
//! use tarmux_mux::{Input, Multiplexer, MuxOptions};
//!
//! let inputs = vec![Input::Path("a.log".into()), Input::Path("b.log".into())];
//!
//! let writer = TarWriter::new(std::io::stdout());
//!
//! Multiplexer::new(inputs, writer, MuxOptions::default())
//!     .unwrap()
//!     .run()
//!     .unwrap();
//! ```

mod readiness;
pub use readiness::*;

mod source;

mod multiplexer;
pub use multiplexer::*;
