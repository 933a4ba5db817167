//! Sources of fit coefficients and of the beam current.
use crate::signals::catalog::SignalCatalog;
use crate::signals::error::CalibrationError;
use crate::utils::constants::{BEAM_CURRENT_NAME, DEFAULT_BEAM_CURRENT, SHUNT_IMPEDANCE_NAME};
use indexmap::IndexMap;
use log::{debug, info, warn};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

type Result<T> = std::result::Result<T, CalibrationError>;

/// Supplies the `(a, b)` pair of each fit and the global beam current.
///
/// `None` means the signal has no known calibration and neutral coefficients are used.
pub trait CalibrationProvider {
    fn coefficients(&self, signal: &str) -> Option<(f64, f64)>;

    fn beam_current(&self) -> f64;
}

/// Coefficients used when nothing better is known.
pub const NEUTRAL_COEFFICIENTS: (f64, f64) = (1.0, 0.0);

#[derive(Debug, Clone, Copy, Default)]
pub struct NeutralCalibration;

impl CalibrationProvider for NeutralCalibration {
    fn coefficients(&self, _signal: &str) -> Option<(f64, f64)> {
        None
    }

    fn beam_current(&self) -> f64 {
        DEFAULT_BEAM_CURRENT
    }
}

/// Coefficients held in memory, keyed by signal name.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticCalibration {
    coefficients: IndexMap<String, (f64, f64)>,
    beam_current: f64,
}

impl Default for StaticCalibration {
    fn default() -> Self {
        StaticCalibration {
            coefficients: IndexMap::new(),
            beam_current: DEFAULT_BEAM_CURRENT,
        }
    }
}

impl StaticCalibration {
    pub fn new() -> StaticCalibration {
        StaticCalibration::default()
    }

    pub fn with(mut self, signal: &str, a: f64, b: f64) -> Self {
        self.coefficients.insert(signal.to_string(), (a, b));
        self
    }

    pub fn with_beam_current(mut self, beam_current: f64) -> Self {
        self.beam_current = beam_current;
        self
    }

    /// Maps attribute values onto the fits of `catalog`.
    ///
    /// A coefficient is found either under its attribute name (`CAV_VOLT_KV_m`) or as
    /// `<signal>/<element>` (`CavVolt_kV/m`), the form the logger saves. A fit with only one of
    /// its two coefficients known keeps the neutral value for the other. Attributes no fit uses
    /// are reported at warn level.
    pub fn from_attributes(
        catalog: &SignalCatalog,
        attributes: &IndexMap<String, f64>,
    ) -> StaticCalibration {
        let mut calibration = StaticCalibration::new();
        let mut used = vec![BEAM_CURRENT_NAME.to_string()];
        if let Some(beam_current) = attributes.get(BEAM_CURRENT_NAME) {
            calibration.beam_current = *beam_current;
        }
        if let Some(shunt_impedance) = attributes.get(SHUNT_IMPEDANCE_NAME) {
            info!(
                "{} = {} is not used by any signal, ignoring it",
                SHUNT_IMPEDANCE_NAME, shunt_impedance
            );
            used.push(SHUNT_IMPEDANCE_NAME.to_string());
        }
        for (signal, _, kind) in catalog.fits() {
            let (a_name, b_name) = kind.attributes();
            let (a_element, b_element) = kind.elements();
            let a_key = format!("{signal}/{a_element}");
            let b_key = format!("{signal}/{b_element}");
            let a = attributes.get(a_name).or_else(|| attributes.get(&a_key)).copied();
            let b = attributes.get(b_name).or_else(|| attributes.get(&b_key)).copied();
            used.extend([a_name.to_string(), b_name.to_string(), a_key, b_key]);
            if a.is_none() && b.is_none() {
                continue;
            }
            let a = a.unwrap_or(NEUTRAL_COEFFICIENTS.0);
            let b = b.unwrap_or(NEUTRAL_COEFFICIENTS.1);
            debug!("{} calibrated with ({}, {})", signal, a, b);
            calibration.coefficients.insert(signal.to_string(), (a, b));
        }
        for name in attributes.keys() {
            if !used.contains(name) {
                warn!("Unknown calibration attribute {}", name);
            }
        }
        calibration
    }
}

impl CalibrationProvider for StaticCalibration {
    fn coefficients(&self, signal: &str) -> Option<(f64, f64)> {
        self.coefficients.get(signal).copied()
    }

    fn beam_current(&self) -> f64 {
        self.beam_current
    }
}

/// Reads `name:value` lines. Blank lines and lines starting with `#` are skipped.
///
/// # Errors
/// Will return `Err` on read failures, lines without exactly one `:` and values that are not
/// numbers.
pub fn read_parameters(reader: impl BufRead) -> Result<IndexMap<String, f64>> {
    let mut parameters = IndexMap::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let (name, value) = match trimmed.split_once(':') {
            Some((name, value)) if !name.trim().is_empty() && !value.contains(':') => {
                (name.trim(), value.trim())
            }
            _ => {
                return Err(CalibrationError::MalformedLine {
                    line: number + 1,
                    content: line.clone(),
                })
            }
        };
        let parsed = value
            .parse::<f64>()
            .map_err(|_| CalibrationError::InvalidValue {
                line: number + 1,
                name: name.to_string(),
                value: value.to_string(),
            })?;
        parameters.insert(name.to_string(), parsed);
    }
    Ok(parameters)
}

/// Loads a parameter file and maps it onto the fits of `catalog`.
///
/// # Errors
/// See [`read_parameters`].
pub fn load_parameters<P: AsRef<Path>>(
    path: P,
    catalog: &SignalCatalog,
) -> Result<StaticCalibration> {
    let file = File::open(path.as_ref())?;
    let parameters = read_parameters(BufReader::new(file))?;
    info!(
        "Loaded {} parameters from {}",
        parameters.len(),
        path.as_ref().display()
    );
    Ok(StaticCalibration::from_attributes(catalog, &parameters))
}
