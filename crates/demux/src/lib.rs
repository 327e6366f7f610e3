//! Reassemble the streams of a record stream produced by `tarmux`.
//!
//! Records are routed by the logical-stream key of their label, see
//! [`FragmentLabel`](tarmux_core::FragmentLabel). Fragments of a stream must
//! arrive in sequence, a zero-length fragment terminates the stream and closes
//! its [`Destination`].
//!
//! In single-target mode the [`Demuxer`] stops right after the first stream
//! ends, so a concatenation of streams can be peeled off one per invocation.

mod destination;
pub use destination::*;

mod demuxer;
pub use demuxer::*;
