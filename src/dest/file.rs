//! On-disk segment files for one logical log.
//!
//! A log is identified by a *basepath*; its segments are files named
//!
//! ```text
//! <basepath>-YYYYMMDD-HHMMSS[a-z]?{-new|-curr|-old}.plog
//! ```
//!
//! The UTC second-resolution stamp makes lexicographic order equal creation
//! order; a single-letter disambiguator breaks ties within one second. The
//! state suffix encodes the rotation protocol:
//!
//! | Suffix  | Meaning |
//! |---------|---------|
//! | `-new`  | Snapshot at the head of this segment is not yet complete. Only meaningful after its `-curr` predecessor. |
//! | `-curr` | Complete snapshot at the head; self-sufficient for replay. |
//! | `-old`  | Superseded; kept only for operator forensics. |
//!
//! # Rotation protocol
//!
//! `start_rotate` closes the output segment and opens a fresh `-new` one.
//! Once the application has re-emitted its full state, `end_rotate` promotes
//! the fresh segment to `-curr` and demotes every superseded predecessor to
//! `-old`. Promotion happens first, so a crash inside the rename window can
//! only leave a *stale* superseded segment behind, never an unreplayable
//! set; `open` detects such leftovers and demotes them.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;

use super::{DestinationError, Result};
use crate::concat::ConcatReader;

/// Extension shared by every segment file.
const SEGMENT_EXT: &str = ".plog";

/// Characters that may not appear in a basepath's final component: they
/// would collide with segment enumeration or the state-suffix scheme.
const RESERVED_CHARS: [char; 5] = ['*', '?', '[', '\\', '.'];

/// The rotation state encoded in a segment's filename suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentState {
    New,
    Current,
    Old,
}

impl SegmentState {
    fn suffix(self) -> &'static str {
        match self {
            SegmentState::New => "-new.plog",
            SegmentState::Current => "-curr.plog",
            SegmentState::Old => "-old.plog",
        }
    }
}

/// Returns the rotation state encoded in `path`'s filename, if any.
fn state_of(path: &Path) -> Option<SegmentState> {
    let name = path.file_name()?.to_str()?;
    [SegmentState::New, SegmentState::Current, SegmentState::Old]
        .into_iter()
        .find(|state| name.ends_with(state.suffix()))
}

/// Returns `path` with its state suffix replaced by `state`'s.
fn with_state(path: &Path, state: SegmentState) -> Option<PathBuf> {
    let current = state_of(path)?;
    let s = path.to_str()?;
    let stem = s.strip_suffix(current.suffix())?;
    Some(PathBuf::from(format!("{}{}", stem, state.suffix())))
}

/// The currently open output segment.
#[derive(Debug)]
struct OutputSegment {
    file: File,
    path: PathBuf,
}

/// Owns the on-disk segments for one logical log and implements the
/// rotation state machine.
pub struct FileDestination {
    basepath: PathBuf,

    /// Replay source over the prior segment(s), held until the coordinator
    /// takes it.
    replay: Option<ConcatReader<File>>,

    /// The open output segment; `None` once closed.
    output: Option<OutputSegment>,

    /// Segments superseded by the snapshot being written to `output`,
    /// oldest first. Demoted to `-old` at `end_rotate`.
    previous: Vec<PathBuf>,

    /// True once the snapshot at the head of `output` has been declared
    /// complete by `end_rotate`.
    snap_ok: bool,
}

impl FileDestination {
    /// Opens the segment set for `basepath` and prepares a fresh output
    /// segment.
    ///
    /// Existing segments are classified in sort order: a trailing `-curr`
    /// replays alone; a trailing `-new` preceded by a `-curr` replays as the
    /// concatenation of the two. An empty set starts a new log when
    /// `may_create` is true and fails otherwise. Any other shape needs
    /// operator attention.
    pub fn open(basepath: impl AsRef<Path>, may_create: bool) -> Result<Self> {
        let basepath = basepath.as_ref().to_path_buf();
        validate_basepath(&basepath)?;

        let segments = list_segments(&basepath)?;
        let virgin = segments.is_empty();

        let mut dest = FileDestination {
            basepath,
            replay: None,
            output: None,
            previous: Vec::new(),
            snap_ok: false,
        };

        if virgin {
            if !may_create {
                return Err(DestinationError::NoExistingLog(display(&dest.basepath)));
            }
        } else {
            let last = segments.len() - 1;
            match state_of(&segments[last]) {
                Some(SegmentState::Current) => {
                    demote_stale(&segments[..last])?;
                    let current = File::open(&segments[last])?;
                    dest.replay = Some(ConcatReader::new([current]));
                    dest.previous = vec![segments[last].clone()];
                }
                Some(SegmentState::New)
                    if last > 0 && state_of(&segments[last - 1]) == Some(SegmentState::Current) =>
                {
                    demote_stale(&segments[..last - 1])?;
                    let current = File::open(&segments[last - 1])?;
                    let interrupted = File::open(&segments[last])?;
                    dest.replay = Some(ConcatReader::new([current, interrupted]));
                    dest.previous = vec![segments[last - 1].clone(), segments[last].clone()];
                }
                _ => {
                    return Err(DestinationError::AmbiguousSegments {
                        basepath: display(&dest.basepath),
                        found: segments.iter().map(|p| display(p)).collect(),
                    });
                }
            }
        }

        let state = if virgin {
            SegmentState::Current
        } else {
            SegmentState::New
        };
        dest.open_segment(state)?;
        Ok(dest)
    }

    /// Creates and opens the next output segment.
    ///
    /// The name is the basepath plus the current UTC second; if any existing
    /// file already begins with that stem, letters `a` through `z` are tried
    /// in order so names stay in creation order within the second.
    fn open_segment(&mut self, state: SegmentState) -> Result<()> {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let existing = list_segments(&self.basepath)?;
        let base = display(&self.basepath);

        for disambiguator in std::iter::once(String::new()).chain(('a'..='z').map(String::from)) {
            let stem = format!("{base}-{stamp}{disambiguator}");
            if existing.iter().any(|p| display(p).starts_with(&stem)) {
                continue;
            }

            let path = PathBuf::from(format!("{stem}{}", state.suffix()));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    tracing::debug!(path = %path.display(), "opened segment");
                    self.output = Some(OutputSegment { file, path });
                    self.snap_ok = false;
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(DestinationError::TooManySecond { stamp })
    }

    /// Appends `buf` to the output segment in full.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(out) = self.output.as_mut() else {
            return Err(io::Error::other("file destination is closed"));
        };
        out.file.write_all(buf)?;
        Ok(buf.len())
    }

    /// Yields the replay sources, oldest bytes first. At most one entry: the
    /// prior segment(s) merged into a single stream. The caller owns the
    /// returned readers; dropping one closes its files.
    pub fn take_replay_readers(&mut self) -> Vec<Box<dyn Read + Send>> {
        match self.replay.take() {
            Some(reader) => vec![Box::new(reader)],
            None => Vec::new(),
        }
    }

    /// Retires the output segment and opens a fresh `-new` one.
    ///
    /// Only legal once the current segment's snapshot is complete; fails
    /// with [`DestinationError::RotateBeforeSnapshot`] otherwise.
    pub fn start_rotate(&mut self) -> Result<()> {
        if !self.snap_ok {
            return Err(DestinationError::RotateBeforeSnapshot);
        }
        let out = self.output.take().ok_or(DestinationError::Closed)?;
        drop(out.file);
        self.previous = vec![out.path];
        self.open_segment(SegmentState::New)
    }

    /// Declares the snapshot at the head of the output segment complete.
    ///
    /// For a first-ever segment there is nothing to rename. Otherwise the
    /// output is promoted `-new` → `-curr` first, then every superseded
    /// predecessor is demoted to `-old`; a crash in between leaves a stale
    /// segment that the next `open` demotes.
    pub fn end_rotate(&mut self) -> Result<()> {
        if self.snap_ok {
            return Err(DestinationError::DoubleEndRotate);
        }
        let out = self.output.as_mut().ok_or(DestinationError::Closed)?;

        if self.previous.is_empty() {
            if state_of(&out.path) != Some(SegmentState::Current) {
                return Err(DestinationError::SegmentStateCorrupt(format!(
                    "first segment {} does not carry the -curr suffix",
                    out.path.display()
                )));
            }
        } else {
            if state_of(&out.path) != Some(SegmentState::New) {
                return Err(DestinationError::SegmentStateCorrupt(format!(
                    "rotated segment {} does not carry the -new suffix",
                    out.path.display()
                )));
            }
            let promoted = with_state(&out.path, SegmentState::Current)
                .ok_or_else(|| DestinationError::SegmentStateCorrupt(display(&out.path)))?;
            fs::rename(&out.path, &promoted)?;
            tracing::debug!(path = %promoted.display(), "promoted segment to -curr");
            out.path = promoted;

            for prev in std::mem::take(&mut self.previous) {
                let demoted = with_state(&prev, SegmentState::Old)
                    .ok_or_else(|| DestinationError::SegmentStateCorrupt(display(&prev)))?;
                fs::rename(&prev, &demoted)?;
                tracing::debug!(path = %demoted.display(), "demoted segment to -old");
            }
        }

        self.snap_ok = true;
        Ok(())
    }

    /// Releases the output segment and any replay readers still held.
    /// Safe to call more than once.
    pub fn close(&mut self) {
        self.output = None;
        self.replay = None;
        self.previous.clear();
    }
}

/// Rejects basepaths whose final component would collide with segment
/// enumeration or the suffix scheme. Parent directories are not inspected;
/// only the file-name prefix takes part in enumeration and suffix matching,
/// and a bad directory surfaces as an IO error when the first segment is
/// created.
fn validate_basepath(basepath: &Path) -> Result<()> {
    let Some(name) = basepath.file_name().and_then(|n| n.to_str()) else {
        return Err(DestinationError::BasepathInvalid(display(basepath)));
    };
    if name.contains(RESERVED_CHARS) {
        return Err(DestinationError::BasepathInvalid(display(basepath)));
    }
    Ok(())
}

/// Enumerates every segment file for `basepath`, sorted so that older
/// segments come first. A missing parent directory enumerates as empty; the
/// failure surfaces later when the first segment cannot be created.
fn list_segments(basepath: &Path) -> Result<Vec<PathBuf>> {
    let dir = match basepath.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let prefix = basepath
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut segments = Vec::new();
    match fs::read_dir(dir) {
        Ok(entries) => {
            for entry in entries {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with(&prefix) && name.ends_with(SEGMENT_EXT) {
                    segments.push(dir.join(name));
                }
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    segments.sort();
    Ok(segments)
}

/// Demotes segments superseded by a later complete snapshot. These are
/// leftovers from a crash between the promote and demote renames of a prior
/// `end_rotate`.
fn demote_stale(stale: &[PathBuf]) -> Result<()> {
    for path in stale {
        match state_of(path) {
            Some(SegmentState::Old) | None => {}
            Some(_) => {
                let demoted = with_state(path, SegmentState::Old)
                    .ok_or_else(|| DestinationError::SegmentStateCorrupt(display(path)))?;
                fs::rename(path, &demoted)?;
                tracing::info!(
                    path = %path.display(),
                    "demoted stale segment left by an interrupted rotation"
                );
            }
        }
    }
    Ok(())
}

fn display(path: &Path) -> String {
    path.display().to_string()
}
