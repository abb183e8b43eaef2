//! The log coordinator: the public face of the persistence log.
//!
//! [`PersistLog`] owns the encoder and the destinations, serializes every
//! append under one lock, counts bytes to decide when to rotate, and drives
//! the replay/snapshot hand-off with the application.
//!
//! # Lifecycle
//!
//! [`PersistLog::open`] replays any prior segments through the application's
//! [`LogClient::replay`], asks the application to re-emit its live state via
//! [`LogClient::persist_all`], and commits the freshly opened segment. Only
//! then is the coordinator handed out; a failure at any step returns the
//! error instead.
//!
//! # Rotation
//!
//! Once the bytes appended since the last snapshot exceed the size limit, a
//! rotation runs on a background thread: the destinations retire their
//! output segments, a fresh encoder is bound, and the application re-emits
//! its state. The coordinator's lock is *released* across the
//! [`LogClient::persist_all`] callback, because the callback appends through
//! [`PersistLog::output`], which takes the lock again. Snapshot bytes are
//! accounted separately so a large snapshot cannot immediately re-trigger
//! rotation.
//!
//! # Errors
//!
//! A failure on the append path or a rotation step puts the log into a
//! sticky error state: every subsequent append is rejected with the same
//! error until a rotation runs to completion. The rotation's own snapshot
//! appends are exempt from that gate, so a repair rotation can re-emit
//! state; the error clears only once the hand-off commits at `end_rotate`.
//! Secondary-destination failures are logged and never become sticky.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::codec::{CodecError, Decoder, Encoder};
use crate::dest::{Destination, DestinationError};

/// Appended bytes (beyond the snapshot) that trigger a rotation. Tunable per
/// log via [`PersistLog::set_size_limit`].
pub const DEFAULT_SIZE_LIMIT: u64 = 1024 * 1024;

/// Error type applications return from [`LogClient::replay`].
pub type ClientError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The callbacks an application provides to the persistence log.
pub trait LogClient: Send + Sync + Sized + 'static {
    /// The application's event vocabulary. Typically an internally tagged
    /// serde enum, which makes each event self-describing on the wire.
    type Event: Serialize + DeserializeOwned + Send + 'static;

    /// Applies one replayed event during startup.
    ///
    /// An error aborts the replay and fails the open. Events may reference
    /// resources that have not been materialized yet (the creating event
    /// lives in a snapshot further down the stream); the application must
    /// ignore such fragments rather than fail.
    fn replay(&self, event: Self::Event) -> Result<(), ClientError>;

    /// Re-emits the application's full live state by calling
    /// [`PersistLog::output`] for every live resource.
    ///
    /// May run concurrently with live updates; the application must ensure
    /// no two updates to the same resource are in flight at once, so the
    /// per-resource order in the log is correct by construction.
    fn persist_all(&self, log: &PersistLog<Self>);
}

/// An error that, once captured, rejects every append until a rotation
/// runs to completion.
///
/// The variants distinguish a broken append path from a broken rotation,
/// so health checks can classify repairability.
#[derive(Debug, Clone, Error)]
pub enum StickyError {
    /// The primary destination failed to accept appended bytes.
    #[error("append to primary destination failed: {0}")]
    Append(Arc<io::Error>),

    /// The primary destination accepted fewer bytes than were written.
    #[error("short write to primary destination: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    /// The event could not be encoded.
    #[error("encoding event failed: {0}")]
    Encode(Arc<CodecError>),

    /// A rotation step failed on the primary destination.
    #[error("rotation failed: {0}")]
    Rotate(Arc<DestinationError>),
}

/// Errors that can fail [`PersistLog::open`].
#[derive(Debug, Error)]
pub enum OpenError {
    /// Replay aborted: `source` is the replay-source index, `ordinal` the
    /// number of events already delivered from it.
    #[error("replay failed in source {source} at event {ordinal}: {cause}")]
    ReplayFailed {
        source: usize,
        ordinal: u64,
        #[source]
        cause: ReplayFailure,
    },

    /// The post-replay snapshot segment could not be committed.
    #[error("could not finalize the reopened log: {0}")]
    EndRotate(#[from] DestinationError),
}

/// Why a replay aborted.
#[derive(Debug, Error)]
pub enum ReplayFailure {
    /// The event stream could not be decoded.
    #[error("decoding the event stream failed: {0}")]
    Decode(#[from] CodecError),

    /// The application rejected the event.
    #[error("application rejected the event: {0}")]
    Client(#[source] ClientError),
}

/// Adding a secondary destination is reserved but not yet implemented.
///
/// The reserved design schedules a rotation on add, so the secondary
/// receives a complete snapshot from its first byte; the write and rotation
/// paths already fan out to an optional secondary in anticipation.
#[derive(Debug, Error)]
#[error("secondary destinations are not implemented yet")]
pub struct NotImplemented;

/// The byte sink fed by the encoder.
///
/// Every encoded byte passes through here: it is accounted (to the snapshot
/// counter while a snapshot is being written, to the post-snapshot counter
/// otherwise), forwarded to the primary destination, and mirrored
/// best-effort to the secondary.
struct Sink {
    primary: Destination,
    secondary: Option<Destination>,

    /// True while a snapshot is being written (a rotation's re-emission or
    /// the post-replay snapshot at open). Gates which byte counter is
    /// credited.
    rotating: bool,

    /// Bytes appended since the last completed snapshot.
    size: u64,

    /// Bytes of the in-progress (or most recent) snapshot.
    size_replay: u64,

    err: Option<StickyError>,
}

impl Sink {
    fn set_err(&mut self, err: StickyError) -> StickyError {
        self.err = Some(err.clone());
        err
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // A rotation's snapshot writes proceed while the log is sticky; the
        // error is cleared or replaced when the rotation ends.
        if !self.rotating && let Some(err) = &self.err {
            return Err(io::Error::other(err.clone()));
        }

        if self.rotating {
            self.size_replay += buf.len() as u64;
        } else {
            self.size += buf.len() as u64;
        }

        match self.primary.write(buf) {
            Ok(n) if n == buf.len() => {}
            Ok(n) => {
                let err = self.set_err(StickyError::ShortWrite {
                    written: n,
                    expected: buf.len(),
                });
                return Err(io::Error::other(err));
            }
            Err(e) => {
                let err = self.set_err(StickyError::Append(Arc::new(e)));
                return Err(io::Error::other(err));
            }
        }

        if let Some(secondary) = &mut self.secondary
            && let Err(e) = secondary.write(buf)
        {
            tracing::warn!(error = %e, "secondary destination write failed");
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct State {
    encoder: Encoder,
    sink: Sink,
    size_limit: u64,

    /// Lifetime count of successfully appended events.
    events: u64,

    /// Latch so a sticky error is logged loudly once, not per rejection.
    err_logged: bool,

    /// True while a background rotation thread owns the rotation cycle.
    /// `close` waits on this flag.
    rotation_task: bool,

    closed: bool,
}

struct Shared<C: LogClient> {
    client: Arc<C>,
    state: Mutex<State>,
}

/// A rotating, replayable persistence log.
///
/// Cheap to clone; all clones refer to the same log. Appends from any
/// thread are serialized under one lock, so the byte stream has a total
/// order.
pub struct PersistLog<C: LogClient> {
    shared: Arc<Shared<C>>,
}

impl<C: LogClient> std::fmt::Debug for PersistLog<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistLog").finish_non_exhaustive()
    }
}

impl<C: LogClient> Clone for PersistLog<C> {
    fn clone(&self) -> Self {
        PersistLog {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: LogClient> PersistLog<C> {
    /// Opens the log over an already-open primary destination.
    ///
    /// Replays every prior event through `client.replay`, then invokes
    /// `client.persist_all` once so the fresh segment starts with a full
    /// snapshot, and commits that segment. Returns the coordinator only if
    /// all of that succeeded.
    pub fn open(mut primary: Destination, client: Arc<C>) -> Result<Self, OpenError> {
        let readers = primary.take_replay_readers();

        let log = PersistLog {
            shared: Arc::new(Shared {
                client,
                state: Mutex::new(State {
                    encoder: Encoder::new(),
                    sink: Sink {
                        primary,
                        secondary: None,
                        rotating: false,
                        size: 0,
                        size_replay: 0,
                        err: None,
                    },
                    size_limit: DEFAULT_SIZE_LIMIT,
                    events: 0,
                    err_logged: false,
                    rotation_task: false,
                    closed: false,
                }),
            }),
        };

        log.replay(readers)?;

        // Initial snapshot: gate accounting like a rotation, but without a
        // background task, so the segment opens with the full live state.
        tracing::debug!("starting post-replay snapshot");
        log.lock().sink.rotating = true;
        log.shared.client.persist_all(&log);
        let mut st = log.lock();
        st.sink.rotating = false;
        let snapshot_bytes = st.sink.size_replay;

        let result = st.sink.primary.end_rotate();
        if let Some(secondary) = &mut st.sink.secondary
            && let Err(e) = secondary.end_rotate()
        {
            tracing::warn!(error = %e, "secondary destination failed to finish rotation");
        }
        result?;
        drop(st);

        tracing::info!(snapshot_bytes, "log opened");
        Ok(log)
    }

    /// Appends one event.
    ///
    /// Rejected with the captured error while the log is sticky, except for
    /// appends made under a rotation's snapshot callback, which must flow so
    /// a repair rotation can re-emit state. After a successful append, a
    /// rotation is scheduled if the post-snapshot byte count exceeds the
    /// size limit.
    pub fn output(&self, event: &C::Event) -> Result<(), StickyError> {
        let mut st = self.lock();

        if !st.sink.rotating && let Some(err) = st.sink.err.clone() {
            if !st.err_logged {
                tracing::error!(error = %err, "persistence log in error state; rejecting events");
                st.err_logged = true;
            } else {
                tracing::debug!(error = %err, "persistence log still in error state");
            }
            return Err(err);
        }
        st.err_logged = false;

        let State { encoder, sink, .. } = &mut *st;
        if let Err(e) = encoder.encode(sink, event) {
            // A sink failure has already recorded itself; a serialization
            // failure has not.
            let err = match st.sink.err.clone() {
                Some(err) => err,
                None => st.sink.set_err(StickyError::Encode(Arc::new(e))),
            };
            return Err(err);
        }

        st.events += 1;
        if !st.sink.rotating && st.sink.size > st.size_limit {
            self.schedule_rotation(&mut st);
        }
        Ok(())
    }

    /// Triggers a rotation now, regardless of the size counter.
    ///
    /// A rotation that runs to completion repairs a sticky log, so this
    /// doubles as the operator's recovery hook once the underlying fault is
    /// fixed. No-op if a rotation is already running.
    pub fn rotate(&self) {
        let mut st = self.lock();
        if !st.closed {
            self.schedule_rotation(&mut st);
        }
    }

    /// Sets the post-snapshot byte count at which a rotation is triggered.
    ///
    /// The snapshot's own bytes are excluded from the comparison so that a
    /// state larger than the limit does not rotate forever.
    pub fn set_size_limit(&self, bytes: u64) {
        self.lock().size_limit = bytes;
    }

    /// Returns the sticky error, if the log is in one.
    pub fn health_check(&self) -> Result<(), StickyError> {
        match self.lock().sink.err.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Returns counters describing the log.
    pub fn stats(&self) -> HashMap<&'static str, f64> {
        let st = self.lock();
        HashMap::from([
            ("snapshot_bytes", st.sink.size_replay as f64),
            ("total_bytes", (st.sink.size + st.sink.size_replay) as f64),
            ("size_limit_bytes", st.size_limit as f64),
            ("events_output", st.events as f64),
            ("error_state", if st.sink.err.is_some() { 1.0 } else { 0.0 }),
        ])
    }

    /// Reserved: mirror the stream to a best-effort secondary destination.
    pub fn set_secondary_destination(&self, _dest: Destination) -> Result<(), NotImplemented> {
        Err(NotImplemented)
    }

    /// Closes the log, waiting for an in-progress rotation to finish first.
    /// Safe to call more than once.
    pub fn close(&self) {
        let mut backoff = Duration::from_millis(1);
        loop {
            let mut st = self.lock();
            if st.closed {
                return;
            }
            if !st.rotation_task {
                st.sink.primary.close();
                if let Some(secondary) = &mut st.sink.secondary {
                    secondary.close();
                }
                st.closed = true;
                return;
            }
            drop(st);
            thread::sleep(backoff);
            backoff = (backoff * 2).min(Duration::from_millis(50));
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks a rotation as owned and hands the cycle to a background
    /// thread, so the caller of `output` never blocks on the snapshot.
    fn schedule_rotation(&self, st: &mut State) {
        if st.rotation_task {
            return;
        }
        st.rotation_task = true;
        tracing::info!("starting log rotation");

        let log = self.clone();
        thread::spawn(move || log.finish_rotation());
    }

    /// The background half of a rotation.
    ///
    /// Holds the lock for the destination hand-off but releases it across
    /// `persist_all`, whose appends re-enter through `output` and need the
    /// lock themselves.
    fn finish_rotation(&self) {
        let mut st = self.lock();
        st.sink.size = 0;
        st.sink.size_replay = 0;
        st.sink.rotating = true;

        if let Err(e) = st.sink.primary.start_rotate() {
            let err = st.sink.set_err(StickyError::Rotate(Arc::new(e)));
            tracing::error!(error = %err, "rotation abandoned: could not start a fresh segment");
            st.sink.rotating = false;
            st.rotation_task = false;
            return;
        }
        if let Some(secondary) = &mut st.sink.secondary
            && let Err(e) = secondary.start_rotate()
        {
            tracing::warn!(error = %e, "secondary destination failed to start rotation");
        }

        // A fresh encoder makes the new segment open with its own stream
        // header. A sticky error stays in place until the hand-off commits.
        st.encoder = Encoder::new();
        drop(st);

        self.shared.client.persist_all(self);

        let mut st = self.lock();
        let snapshot_bytes = st.sink.size_replay;
        let result = st.sink.primary.end_rotate();
        if let Some(secondary) = &mut st.sink.secondary
            && let Err(e) = secondary.end_rotate()
        {
            tracing::warn!(error = %e, "secondary destination failed to finish rotation");
        }
        st.sink.rotating = false;
        st.rotation_task = false;

        match result {
            Ok(()) => {
                st.sink.err = None;
                st.err_logged = false;
                tracing::info!(snapshot_bytes, "finished log rotation");
            }
            Err(e) => {
                let err = st.sink.set_err(StickyError::Rotate(Arc::new(e)));
                tracing::error!(error = %err, snapshot_bytes, "finished rotation with error");
            }
        }
    }

    /// Feeds every prior event back to the application, one decoder per
    /// replay source.
    fn replay(&self, readers: Vec<Box<dyn Read + Send>>) -> Result<(), OpenError> {
        let sources = readers.len();
        for (source, reader) in readers.into_iter().enumerate() {
            tracing::info!(source, "starting replay");
            let mut decoder = Decoder::new(reader);
            let mut ordinal: u64 = 0;
            loop {
                match decoder.next::<C::Event>() {
                    Ok(Some(event)) => {
                        self.shared.client.replay(event).map_err(|cause| {
                            OpenError::ReplayFailed {
                                source,
                                ordinal,
                                cause: ReplayFailure::Client(cause),
                            }
                        })?;
                        ordinal += 1;
                    }
                    Ok(None) => break,
                    Err(cause) => {
                        return Err(OpenError::ReplayFailed {
                            source,
                            ordinal,
                            cause: ReplayFailure::Decode(cause),
                        });
                    }
                }
            }
            tracing::debug!(source, events = ordinal, "replay source exhausted");
        }
        tracing::info!(sources, "replay done");
        Ok(())
    }
}
