//! Shared building blocks of the tarmux tools.
//!
//! * [`label`](crate::FragmentLabel) derives the logical-stream key and the
//!   sequence index from a record label.
//! * [`codec`] moves labeled records in and out of a byte stream.
//! * [`Error`] classifies every failure and maps it to a process exit code.

mod errors;
pub use errors::*;

mod label;
pub use label::*;

pub mod codec;
