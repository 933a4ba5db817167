//! Parsing of Fast Data Logger captures and derivation of the RF plant signals they carry.
use crate::error::FdlError;
use crate::parsing::session::CaptureSession;
use crate::signals::calibration::{load_parameters, StaticCalibration};
use crate::signals::catalog::SignalCatalog;
use crate::signals::derivation::{Derivation, SignalDerivationEngine};
use indexmap::IndexMap;
use std::path::PathBuf;

pub mod error;
pub mod layout;
pub mod parsing;
pub mod signals;
pub mod utils;

/// Named sequences of values, in insertion order.
pub type SignalSet = IndexMap<String, Vec<f64>>;

/// Parses the given captures in parallel and derives the default catalog from them, calibrated
/// by the parameter file when one is given.
///
/// # Errors
/// Will return `Err` if a capture or the parameter file cannot be read, or the derivation
/// stalls.
pub fn process_files(
    loops: Option<PathBuf>,
    diagnostics: Option<PathBuf>,
    parameters: Option<PathBuf>,
) -> Result<Derivation, FdlError> {
    let catalog = SignalCatalog::default_catalog()?;
    let calibration = match parameters {
        Some(path) => load_parameters(path, &catalog)?,
        None => StaticCalibration::new(),
    };
    let session = CaptureSession::start(loops, diagnostics, &catalog)?;
    let engine = SignalDerivationEngine::new(catalog);
    let derivation = session.derive(&engine, &calibration)?;
    if let Some(e) = derivation.error() {
        Err(e)?
    }
    Ok(derivation)
}
