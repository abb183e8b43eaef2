//! Shared test utilities: arbitrary generators for property-based testing,
//! a recording log client, and a fault-injecting destination.

use std::io::{self, Read};
use std::sync::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use proptest::prelude::*;
use serde::{Deserialize, Serialize};

use crate::dest::Result as DestResult;
use crate::log::{ClientError, LogClient, PersistLog};

/// The event vocabulary used throughout the test suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TestEvent {
    #[serde(rename = "note")]
    Note { text: String },

    #[serde(rename = "count")]
    Count { n: u64, label: String },
}

pub fn arb_test_event() -> impl Strategy<Value = TestEvent> {
    prop_oneof![
        "[a-zA-Z0-9 ]{0,40}".prop_map(|text| TestEvent::Note { text }),
        (any::<u64>(), "[a-z]{1,10}").prop_map(|(n, label)| TestEvent::Count { n, label }),
    ]
}

/// Installs a subscriber so `RUST_LOG` controls log output from tests.
/// Safe to call from every test; only the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A [`LogClient`] that records what it is asked to replay and re-emits a
/// configurable snapshot.
#[derive(Default)]
pub struct RecordingClient {
    replayed: Mutex<Vec<TestEvent>>,
    snapshot: Mutex<Vec<TestEvent>>,
    reject: Mutex<Option<TestEvent>>,
    echo: AtomicBool,
    interrupt: AtomicBool,
    persist_calls: AtomicUsize,
    health_at_persist: Mutex<Vec<bool>>,
    snapshot_rejects: AtomicUsize,
}

impl RecordingClient {
    pub fn new() -> Self {
        RecordingClient::default()
    }

    /// Returns the events delivered via `replay`, in order.
    pub fn replayed(&self) -> Vec<TestEvent> {
        self.replayed.lock().unwrap().clone()
    }

    /// Returns how many times `persist_all` has run.
    pub fn persist_calls(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }

    /// Sets the events `persist_all` re-emits as the snapshot.
    pub fn set_snapshot(&self, events: Vec<TestEvent>) {
        *self.snapshot.lock().unwrap() = events;
    }

    /// Makes `persist_all` re-emit whatever was replayed, like an
    /// application re-expressing its reconstructed state.
    pub fn echo_replayed_state(&self) {
        self.echo.store(true, Ordering::SeqCst);
    }

    /// Makes `persist_all` close the log after emitting the snapshot,
    /// standing in for a crash before the rotation hand-off commits.
    pub fn interrupt_after_snapshot(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    /// Makes `replay` reject the given event.
    pub fn reject_replay_of(&self, event: TestEvent) {
        *self.reject.lock().unwrap() = Some(event);
    }

    /// Returns, per `persist_all` call, whether the log reported healthy
    /// when the snapshot started.
    pub fn health_at_persist(&self) -> Vec<bool> {
        self.health_at_persist.lock().unwrap().clone()
    }

    /// Returns how many snapshot appends were rejected across all
    /// `persist_all` calls.
    pub fn snapshot_rejects(&self) -> usize {
        self.snapshot_rejects.load(Ordering::SeqCst)
    }
}

impl LogClient for RecordingClient {
    type Event = TestEvent;

    fn replay(&self, event: TestEvent) -> Result<(), ClientError> {
        if self.reject.lock().unwrap().as_ref() == Some(&event) {
            return Err("injected replay rejection".into());
        }
        self.replayed.lock().unwrap().push(event);
        Ok(())
    }

    fn persist_all(&self, log: &PersistLog<Self>) {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        self.health_at_persist
            .lock()
            .unwrap()
            .push(log.health_check().is_ok());

        let events = if self.echo.load(Ordering::SeqCst) {
            self.replayed.lock().unwrap().clone()
        } else {
            self.snapshot.lock().unwrap().clone()
        };
        for event in &events {
            if let Err(e) = log.output(event) {
                self.snapshot_rejects.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(error = %e, "snapshot append rejected");
            }
        }

        if self.interrupt.load(Ordering::SeqCst) {
            log.close();
        }
    }
}

/// A destination with switchable fault injection: writes fail while the
/// shared flag is set, and `end_rotate` fails while its own flag is set.
pub struct FailingDestination {
    fail_writes: Arc<AtomicBool>,
    fail_end_rotate: Arc<AtomicBool>,
}

impl FailingDestination {
    pub fn new(fail_writes: Arc<AtomicBool>) -> Self {
        FailingDestination {
            fail_writes,
            fail_end_rotate: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns the flag that makes `end_rotate` fail while set.
    pub fn fail_end_rotate_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.fail_end_rotate)
    }

    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected write failure"));
        }
        Ok(buf.len())
    }

    pub fn take_replay_readers(&mut self) -> Vec<Box<dyn Read + Send>> {
        Vec::new()
    }

    pub fn start_rotate(&mut self) -> DestResult<()> {
        Ok(())
    }

    pub fn end_rotate(&mut self) -> DestResult<()> {
        if self.fail_end_rotate.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected end_rotate failure").into());
        }
        Ok(())
    }

    pub fn close(&mut self) {}
}
