//! A loops capture and a diagnostics capture parsed side by side.
use crate::layout::LayoutKind;
use crate::parsing::error::ParseError;
use crate::parsing::handle::{ParseHandle, ParseState};
use crate::parsing::parser::{anomaly_rate, ParseOutcome, Progress};
use crate::signals::calibration::CalibrationProvider;
use crate::signals::catalog::SignalCatalog;
use crate::signals::derivation::{Derivation, SignalDerivationEngine};
use crate::SignalSet;
use indexmap::IndexMap;
use log::{info, warn};
use std::path::PathBuf;

type Result<T> = std::result::Result<T, ParseError>;

/// Up to one parse per capture kind, each on its own thread.
#[derive(Debug, Default)]
pub struct CaptureSession {
    loops: Option<ParseHandle>,
    diagnostics: Option<ParseHandle>,
}

impl CaptureSession {
    pub fn new() -> CaptureSession {
        CaptureSession::default()
    }

    /// Starts a parse for every capture given. Channels `catalog` reads as phases are wrapped.
    ///
    /// # Errors
    /// Will return `Err` if a layout cannot carry the catalog phases or a worker thread cannot
    /// be spawned.
    pub fn start<P: Into<PathBuf>>(
        loops: Option<P>,
        diagnostics: Option<P>,
        catalog: &SignalCatalog,
    ) -> Result<Self> {
        let start = |path: P, kind: LayoutKind| -> Result<ParseHandle> {
            let mut handle = ParseHandle::for_catalog(path, kind, catalog)?;
            handle.start()?;
            Ok(handle)
        };
        let loops = loops
            .map(|path| start(path, LayoutKind::Loops))
            .transpose()?;
        let diagnostics = diagnostics
            .map(|path| start(path, LayoutKind::Diagnostics))
            .transpose()?;
        Ok(CaptureSession { loops, diagnostics })
    }

    pub fn with_loops(mut self, handle: ParseHandle) -> Self {
        self.loops = Some(handle);
        self
    }

    pub fn with_diagnostics(mut self, handle: ParseHandle) -> Self {
        self.diagnostics = Some(handle);
        self
    }

    pub fn handles(&self) -> impl Iterator<Item = &ParseHandle> {
        self.loops.iter().chain(self.diagnostics.iter())
    }

    /// Average percentage over the parses, summed counters.
    pub fn progress(&self) -> Progress {
        let progresses: Vec<Progress> = self.handles().map(ParseHandle::progress).collect();
        if progresses.is_empty() {
            return Progress::default();
        }
        let percent = progresses.iter().map(|p| p.percent as usize).sum::<usize>() / progresses.len();
        Progress {
            percent: percent as u8,
            anomaly_count: progresses.iter().map(|p| p.anomaly_count).sum(),
            complete_records: progresses.iter().map(|p| p.complete_records).sum(),
        }
    }

    /// `Aborted` if any parse aborted, `Done` once all are done.
    pub fn state(&self) -> ParseState {
        let states: Vec<ParseState> = self.handles().map(ParseHandle::state).collect();
        if states.contains(&ParseState::Aborted) {
            ParseState::Aborted
        } else if states.contains(&ParseState::Running) {
            ParseState::Running
        } else if !states.is_empty() && states.iter().all(|s| *s == ParseState::Done) {
            ParseState::Done
        } else {
            ParseState::Idle
        }
    }

    pub fn cancel(&self) {
        for handle in self.handles() {
            handle.cancel();
        }
    }

    pub fn cancel_after(&self, records: usize) {
        for handle in self.handles() {
            handle.cancel_after(records);
        }
    }

    /// Blocks until every parse has finished.
    pub fn wait(&mut self) -> ParseState {
        for handle in self.loops.iter_mut().chain(self.diagnostics.iter_mut()) {
            handle.wait();
        }
        self.state()
    }

    /// Waits for every parse and collects their outcomes.
    ///
    /// # Errors
    /// Will return `Err` if any parse failed or was cancelled.
    pub fn finish(self) -> Result<CaptureSet> {
        self.collect(false)
    }

    /// Like [`finish`](Self::finish) but accepts the partial outcome of cancelled parses.
    ///
    /// # Errors
    /// Will return `Err` if any parse failed.
    pub fn finish_partial(self) -> Result<CaptureSet> {
        self.collect(true)
    }

    fn collect(self, allow_partial: bool) -> Result<CaptureSet> {
        let mut outcomes = IndexMap::new();
        for handle in self.loops.into_iter().chain(self.diagnostics) {
            let name = handle.name().to_string();
            let outcome = handle.into_outcome(allow_partial)?;
            if !outcome.is_complete() {
                warn!(
                    "Using the partial outcome of {}: {} records",
                    name, outcome.complete_records
                );
            }
            outcomes.insert(name, outcome);
        }
        Ok(CaptureSet { outcomes })
    }

    /// Derives signals from completely parsed captures only.
    ///
    /// # Errors
    /// Will return `Err` if any parse failed or was cancelled.
    pub fn derive<C: CalibrationProvider + ?Sized>(
        self,
        engine: &SignalDerivationEngine,
        calibration: &C,
    ) -> Result<Derivation> {
        Ok(self.finish()?.derive(engine, calibration))
    }

    /// Derives signals even from cancelled parses.
    ///
    /// # Errors
    /// Will return `Err` if any parse failed.
    pub fn derive_partial<C: CalibrationProvider + ?Sized>(
        self,
        engine: &SignalDerivationEngine,
        calibration: &C,
    ) -> Result<Derivation> {
        Ok(self.finish_partial()?.derive(engine, calibration))
    }
}

/// Outcomes of a finished session, keyed by capture name.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSet {
    pub outcomes: IndexMap<String, ParseOutcome>,
}

impl CaptureSet {
    /// Channels of every capture in one map. A name carried by both captures keeps the last.
    pub fn raw_channels(&self) -> SignalSet {
        let mut channels = SignalSet::new();
        for (capture, outcome) in self.outcomes.iter() {
            for (name, values) in outcome.channels.iter() {
                if channels.insert(name.clone(), values.clone()).is_some() {
                    warn!("Channel {} of {} shadows an earlier capture", name, capture);
                }
            }
        }
        channels
    }

    pub fn anomaly_count(&self) -> usize {
        self.outcomes.values().map(|o| o.anomalies.len()).sum()
    }

    pub fn anomaly_rate(&self) -> f64 {
        anomaly_rate(
            self.anomaly_count(),
            self.outcomes.values().map(|o| o.complete_records).sum(),
        )
    }

    pub fn derive<C: CalibrationProvider + ?Sized>(
        &self,
        engine: &SignalDerivationEngine,
        calibration: &C,
    ) -> Derivation {
        let raw = self.raw_channels();
        info!(
            "Deriving signals over {} raw channels from {} captures",
            raw.len(),
            self.outcomes.len()
        );
        engine.derive_report(&raw, calibration)
    }
}
