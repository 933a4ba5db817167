//! Background parse of one capture file.
use crate::layout::{LayoutKind, RecordLayout};
use crate::parsing::error::ParseError;
use crate::parsing::parser::{FramedStreamParser, ParseControl, ParseOutcome, Progress};
use crate::parsing::stream::SampleStream;
use crate::signals::catalog::SignalCatalog;
use crate::SignalSet;
use log::{error, info, warn};
use std::fmt;
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::thread::JoinHandle;
use std::time::Instant;

type Result<T> = std::result::Result<T, ParseError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    Idle,
    Running,
    Done,
    Aborted,
}

impl Display for ParseState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParseState::Idle => write!(f, "idle"),
            ParseState::Running => write!(f, "running"),
            ParseState::Done => write!(f, "done"),
            ParseState::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    Cancelled,
    Failed(String),
}

#[derive(Debug)]
enum Status {
    Idle,
    Running,
    Done(ParseOutcome),
    Cancelled(ParseOutcome),
    Failed(ParseError),
}

impl Status {
    fn state(&self) -> ParseState {
        match self {
            Status::Idle => ParseState::Idle,
            Status::Running => ParseState::Running,
            Status::Done(_) => ParseState::Done,
            Status::Cancelled(_) | Status::Failed(_) => ParseState::Aborted,
        }
    }
}

#[derive(Debug)]
enum Source {
    File(PathBuf),
    Memory(SampleStream),
}

impl Source {
    fn load(self) -> Result<SampleStream> {
        match self {
            Source::File(path) => SampleStream::open(path),
            Source::Memory(stream) => Ok(stream),
        }
    }
}

/// One capture parsed on its own worker thread.
///
/// Moves through `Idle → Running → {Done | Aborted}`. Channels are only handed out once the
/// parse is `Done`; a cancelled parse keeps its partial outcome for callers that explicitly ask
/// for it.
#[derive(Debug)]
pub struct ParseHandle {
    name: String,
    layout: RecordLayout,
    source: Option<Source>,
    control: Arc<ParseControl>,
    status: Arc<Mutex<Status>>,
    worker: Option<JoinHandle<()>>,
}

impl ParseHandle {
    pub fn new<P: Into<PathBuf>>(path: P, kind: LayoutKind) -> ParseHandle {
        ParseHandle::with_layout(path, kind, kind.layout())
    }

    pub fn with_layout<P: Into<PathBuf>>(
        path: P,
        kind: LayoutKind,
        layout: RecordLayout,
    ) -> ParseHandle {
        ParseHandle::with_source(kind.to_string(), Source::File(path.into()), layout)
    }

    /// Parse of `path` whose layout also wraps the channels `catalog` reads as phases.
    ///
    /// # Errors
    /// Will return `Err(ParseError::Layout)` if a phase cannot be flagged on the layout.
    pub fn for_catalog<P: Into<PathBuf>>(
        path: P,
        kind: LayoutKind,
        catalog: &SignalCatalog,
    ) -> Result<ParseHandle> {
        let layout = catalog.annotate_layout(kind.layout())?;
        Ok(ParseHandle::with_layout(path, kind, layout))
    }

    /// Parses samples already in memory with an arbitrary layout.
    pub fn from_stream(name: &str, stream: SampleStream, layout: RecordLayout) -> ParseHandle {
        ParseHandle::with_source(name.to_string(), Source::Memory(stream), layout)
    }

    fn with_source(name: String, source: Source, layout: RecordLayout) -> ParseHandle {
        ParseHandle {
            name,
            layout,
            source: Some(source),
            control: Arc::new(ParseControl::new()),
            status: Arc::new(Mutex::new(Status::Idle)),
            worker: None,
        }
    }

    /// Creates and starts a parse of `path`.
    pub fn start_parse<P: Into<PathBuf>>(path: P, kind: LayoutKind) -> Result<ParseHandle> {
        let mut handle = ParseHandle::new(path, kind);
        handle.start()?;
        Ok(handle)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns the worker thread. Does not block.
    ///
    /// # Errors
    /// Will return `Err` if the parse was started before or the thread cannot be spawned.
    pub fn start(&mut self) -> Result<()> {
        let source = match self.source.take() {
            Some(source) => source,
            None => return Err(ParseError::AlreadyStarted),
        };
        *self.lock() = Status::Running;

        let name = self.name.clone();
        let parser = FramedStreamParser::new(self.layout.clone());
        let control = Arc::clone(&self.control);
        let status = Arc::clone(&self.status);
        let spawned = thread::Builder::new()
            .name(format!("{}Thread", self.name))
            .spawn(move || {
                let t0 = Instant::now();
                let result = source
                    .load()
                    .and_then(|stream| parser.parse(stream.samples(), &control));
                let next = match result {
                    Ok(outcome) if outcome.is_complete() => {
                        info!(
                            "{} parse completed: {} records, {} anomalies",
                            name,
                            outcome.complete_records,
                            outcome.anomalies.len()
                        );
                        Status::Done(outcome)
                    }
                    Ok(outcome) => {
                        warn!(
                            "{} parse aborted at {}%",
                            name,
                            control.progress().percent
                        );
                        Status::Cancelled(outcome)
                    }
                    Err(e) => {
                        error!("{} parse cannot be completed: {}", name, e);
                        Status::Failed(e)
                    }
                };
                info!(
                    "{} parse has taken {:.3} seconds",
                    name,
                    t0.elapsed().as_secs_f64()
                );
                *status.lock().unwrap_or_else(PoisonError::into_inner) = next;
            });
        match spawned {
            Ok(worker) => {
                self.worker = Some(worker);
                Ok(())
            }
            Err(e) => {
                *self.lock() = Status::Failed(ParseError::Worker(e.to_string()));
                Err(ParseError::Io(e))
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ParseState {
        self.lock().state()
    }

    pub fn progress(&self) -> Progress {
        self.control.progress()
    }

    /// Requests cooperative cancellation; the worker stops at the next record boundary.
    pub fn cancel(&self) {
        warn!("{} parse interruption requested", self.name);
        self.control.cancel();
    }

    /// Stops the parse once `records` records are complete. Takes effect even before `start`.
    pub fn cancel_after(&self, records: usize) {
        info!("{} parse limited to {} records", self.name, records);
        self.control.cancel_after(records);
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        match &*self.lock() {
            Status::Cancelled(_) => Some(AbortReason::Cancelled),
            Status::Failed(e) => Some(AbortReason::Failed(e.to_string())),
            _ => None,
        }
    }

    /// Blocks until the worker thread has finished and returns the terminal state.
    pub fn wait(&mut self) -> ParseState {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                *self.lock() =
                    Status::Failed(ParseError::Worker(format!("{} thread panicked", self.name)));
            }
        }
        self.state()
    }

    /// Channels of a finished parse.
    ///
    /// # Errors
    /// Will return `Err(ParseError::NotReady)` unless the parse is `Done`.
    pub fn channels(&self) -> Result<SignalSet> {
        match &*self.lock() {
            Status::Done(outcome) => Ok(outcome.channels.clone()),
            other => Err(ParseError::NotReady(other.state().to_string())),
        }
    }

    /// Waits for the worker and hands over its outcome.
    ///
    /// A cancelled parse yields its partial outcome only when `allow_partial` is set.
    ///
    /// # Errors
    /// Will return the parse error of a failed parse, or `NotReady` for a cancelled parse when
    /// partial outcomes are not accepted.
    pub fn into_outcome(mut self, allow_partial: bool) -> Result<ParseOutcome> {
        self.wait();
        let status = std::mem::replace(&mut *self.lock(), Status::Idle);
        match status {
            Status::Done(outcome) => Ok(outcome),
            Status::Cancelled(outcome) if allow_partial => Ok(outcome),
            Status::Failed(e) => Err(e),
            other => Err(ParseError::NotReady(other.state().to_string())),
        }
    }
}

impl Drop for ParseHandle {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.control.cancel();
            let _ = worker.join();
        }
    }
}
