//! A rotating, replayable persistence log.
//!
//! `plog` durably records a stream of application-defined change events so
//! that, after a crash or restart, in-memory state can be reconstructed by
//! replaying them. The log bounds its own size by rotation: past a size
//! threshold the application is asked to re-emit a full snapshot of its live
//! state into a fresh on-disk segment, after which the previous segment is
//! retired. The log never interprets events; it serializes, stores, and
//! replays them.
//!
//! The application implements [`LogClient`] (replay one event; re-emit all
//! live state) and appends through [`PersistLog::output`]. Segments live on
//! disk under a shared basepath prefix, managed by [`FileDestination`]; the
//! multi-step rename protocol keeps the segment set unambiguous across
//! crashes at any point.

pub mod codec;
pub mod concat;
pub mod dest;
pub mod log;

#[cfg(test)]
pub mod test_utils;

pub use crate::codec::{CodecError, Decoder, Encoder, StreamHeader};
pub use crate::concat::ConcatReader;
pub use crate::dest::{Destination, DestinationError, FileDestination, NoopDestination};
pub use crate::log::{
    ClientError, DEFAULT_SIZE_LIMIT, LogClient, NotImplemented, OpenError, PersistLog,
    ReplayFailure, StickyError,
};
