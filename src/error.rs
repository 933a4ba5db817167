use crate::parsing::error::ParseError;
use crate::signals::error::{CalibrationError, CatalogError, DerivationError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FdlError {
    /// Capture could not be parsed
    #[error("{0}")]
    Parse(#[from] ParseError),

    /// Invalid signal declarations
    #[error("{0}")]
    Catalog(#[from] CatalogError),

    /// Unable to read calibration parameters
    #[error("{0}")]
    Calibration(#[from] CalibrationError),

    #[error("{0}")]
    Derivation(#[from] DerivationError),
}
