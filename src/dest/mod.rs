//! Log destinations: where encoded event streams go.
//!
//! A destination is a small capability bundle: append bytes, offer replay
//! sources, take part in the two-step rotation hand-off, close. The set of
//! destinations is closed, so [`Destination`] is an enum rather than a trait
//! object; a future remote destination is a new variant.
//!
//! [`FileDestination`] is the replayable workhorse; [`NoopDestination`]
//! discards everything and exists for tests and as the shape of best-effort
//! variants.

pub mod file;
pub mod noop;

use std::io::{self, Read};

use thiserror::Error;

pub use file::FileDestination;
pub use noop::NoopDestination;

/// Errors produced by destinations.
#[derive(Debug, Error)]
pub enum DestinationError {
    /// The basepath's final component contains a character reserved by the
    /// segment naming scheme.
    #[error("basepath {0} contains a reserved character (one of `* ? [ \\ .`)")]
    BasepathInvalid(String),

    /// No segments exist and creating a fresh log was not permitted.
    #[error("no existing log found for basepath {0}")]
    NoExistingLog(String),

    /// The on-disk segment set matches none of the replayable shapes; an
    /// operator has to resolve it by hand.
    #[error("cannot determine replayable segments for basepath {basepath}: found {found:?}")]
    AmbiguousSegments {
        basepath: String,
        found: Vec<String>,
    },

    /// Every disambiguator for the current second is taken. Retryable once
    /// the clock ticks.
    #[error("too many segments created within second {stamp}")]
    TooManySecond { stamp: String },

    /// A rotation was started while the current segment's snapshot was still
    /// incomplete. Programmer error.
    #[error("rotation started before the current snapshot completed")]
    RotateBeforeSnapshot,

    /// A rotation was ended twice without an intervening start. Programmer
    /// error.
    #[error("rotation ended twice without an intervening start")]
    DoubleEndRotate,

    /// A segment's filename no longer matches the state the destination
    /// believes it is in. Fatal to the destination.
    #[error("segment state corrupt: {0}")]
    SegmentStateCorrupt(String),

    /// The destination has been closed.
    #[error("destination is closed")]
    Closed,

    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for destination operations.
pub type Result<T> = std::result::Result<T, DestinationError>;

/// A log destination: one of the closed set of places an encoded stream can
/// be sent.
pub enum Destination {
    /// On-disk segment files with rotation and replay (the primary).
    File(FileDestination),
    /// Accepts and discards everything.
    Noop(NoopDestination),
    /// Fails writes on demand, for sticky-error tests.
    #[cfg(test)]
    Failing(crate::test_utils::FailingDestination),
}

impl Destination {
    /// Appends `buf` in full; a short count is only returned alongside an
    /// error.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Destination::File(d) => d.write(buf),
            Destination::Noop(d) => d.write(buf),
            #[cfg(test)]
            Destination::Failing(d) => d.write(buf),
        }
    }

    /// Yields the ordered replay sources, transferring ownership to the
    /// caller. Subsequent calls return nothing.
    pub fn take_replay_readers(&mut self) -> Vec<Box<dyn Read + Send>> {
        match self {
            Destination::File(d) => d.take_replay_readers(),
            Destination::Noop(d) => d.take_replay_readers(),
            #[cfg(test)]
            Destination::Failing(d) => d.take_replay_readers(),
        }
    }

    /// Retires the current output and opens a fresh segment for the snapshot
    /// about to be written.
    pub fn start_rotate(&mut self) -> Result<()> {
        match self {
            Destination::File(d) => d.start_rotate(),
            Destination::Noop(d) => d.start_rotate(),
            #[cfg(test)]
            Destination::Failing(d) => d.start_rotate(),
        }
    }

    /// Declares the snapshot on the current output complete, committing the
    /// rotation hand-off.
    pub fn end_rotate(&mut self) -> Result<()> {
        match self {
            Destination::File(d) => d.end_rotate(),
            Destination::Noop(d) => d.end_rotate(),
            #[cfg(test)]
            Destination::Failing(d) => d.end_rotate(),
        }
    }

    /// Releases all resources. Safe to call more than once.
    pub fn close(&mut self) {
        match self {
            Destination::File(d) => d.close(),
            Destination::Noop(d) => d.close(),
            #[cfg(test)]
            Destination::Failing(d) => d.close(),
        }
    }
}
