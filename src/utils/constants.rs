/// Value found at slot 0 of every record.
pub const SENTINEL: i16 = 0x7FFF;
pub(crate) const SEPARATOR_NAME: &str = "separator";

/// Largest magnitude representable by one sample.
pub const FULL_SCALE: f64 = 32767.0;
/// Samples are reported in millivolts.
pub const MILLIVOLTS: f64 = 1000.0;

pub const PHASE_WRAP_THRESHOLD: f64 = 512.0;
pub const PHASE_WRAP_RANGE: f64 = 1024.0;

/// Divisor applied to `x²` by quadratic power fits.
pub const QUADRATIC_SCALE: f64 = 10e8;

pub const DEFAULT_BEAM_CURRENT: f64 = 100.0;

/// Names a formula may reference without declaring them as dependencies.
pub const PI_NAME: &str = "pi";
pub const BEAM_CURRENT_NAME: &str = "BeamCurrent";
pub const FORMULA_CONSTANTS: [&str; 2] = [PI_NAME, BEAM_CURRENT_NAME];

/// Saved by the logger next to the fit coefficients; no derived signal reads it.
pub const SHUNT_IMPEDANCE_NAME: &str = "ShuntImpedance";
