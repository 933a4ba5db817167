//! Record layouts of the two FDL capture kinds.
use crate::utils::constants::{
    FULL_SCALE, MILLIVOLTS, PHASE_WRAP_RANGE, PHASE_WRAP_THRESHOLD, SEPARATOR_NAME,
};
use std::fmt;
use std::fmt::Display;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LayoutError {
    #[error("A record needs the separator and at least one data slot")]
    TooNarrow,

    #[error("Slot name '{0}' is used more than once")]
    DuplicateSlot(String),

    #[error("Slot name '{0}' is reserved for the separator")]
    ReservedName(String),

    #[error("No slot named '{0}'")]
    UnknownSlot(String),

    #[error("Cannot infer capture kind from '{0}'")]
    UnknownKind(String),
}

type Result<T> = std::result::Result<T, LayoutError>;

/// Two's-complement correction for phase channels.
///
/// Applied to the already scaled value: anything above `threshold` has `range` subtracted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseWrap {
    pub threshold: f64,
    pub range: f64,
}

impl PhaseWrap {
    pub fn apply(&self, value: f64) -> f64 {
        if value > self.threshold {
            value - self.range
        } else {
            value
        }
    }
}

impl Default for PhaseWrap {
    fn default() -> Self {
        PhaseWrap {
            threshold: PHASE_WRAP_THRESHOLD,
            range: PHASE_WRAP_RANGE,
        }
    }
}

/// Conversion of a raw sample into an engineering unit: `raw / full_scale * unit`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitScale {
    pub full_scale: f64,
    pub unit: f64,
}

impl UnitScale {
    pub fn apply(&self, raw: i16) -> f64 {
        raw as f64 / self.full_scale * self.unit
    }
}

impl Default for UnitScale {
    fn default() -> Self {
        UnitScale {
            full_scale: FULL_SCALE,
            unit: MILLIVOLTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Separator,
    /// Position carries no physically meaningful channel.
    Reserved,
    Named {
        name: String,
        phase: Option<PhaseWrap>,
    },
}

impl Slot {
    pub fn name(&self) -> Option<&str> {
        match self {
            Slot::Named { name, .. } => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutKind {
    Loops,
    Diagnostics,
}

impl LayoutKind {
    /// Infers the capture kind from the file name, which starts with `Loops` or `Diag`.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<LayoutKind> {
        let file_name = path
            .as_ref()
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("");
        if file_name.starts_with("Loops") {
            Ok(LayoutKind::Loops)
        } else if file_name.starts_with("Diag") {
            Ok(LayoutKind::Diagnostics)
        } else {
            Err(LayoutError::UnknownKind(
                path.as_ref().display().to_string(),
            ))
        }
    }

    pub fn layout(&self) -> RecordLayout {
        match self {
            LayoutKind::Loops => RecordLayout::loops(),
            LayoutKind::Diagnostics => RecordLayout::diagnostics(),
        }
    }
}

impl Display for LayoutKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LayoutKind::Loops => write!(f, "Loops"),
            LayoutKind::Diagnostics => write!(f, "Diag"),
        }
    }
}

/// Ordered slots of one record. Slot 0 is always the separator.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordLayout {
    slots: Vec<Slot>,
    scale: UnitScale,
}

impl RecordLayout {
    pub fn builder() -> RecordLayoutBuilder {
        RecordLayoutBuilder {
            slots: vec![Slot::Separator],
            scale: UnitScale::default(),
        }
    }

    /// Number of samples in one record, separator included.
    pub fn width(&self) -> usize {
        self.slots.len()
    }

    pub fn scale(&self) -> UnitScale {
        self.scale
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Named slots with their offset from the separator.
    pub fn named_slots(&self) -> impl Iterator<Item = (usize, &str, Option<PhaseWrap>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(offset, slot)| match slot {
                Slot::Named { name, phase } => Some((offset, name.as_str(), *phase)),
                _ => None,
            })
    }

    pub fn slot_index(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|s| s.name() == Some(name))
    }

    /// Flags an existing slot as a phase channel.
    pub fn with_phase(mut self, name: &str, wrap: PhaseWrap) -> Result<Self> {
        let index = self
            .slot_index(name)
            .ok_or_else(|| LayoutError::UnknownSlot(name.to_string()))?;
        if let Slot::Named { phase, .. } = &mut self.slots[index] {
            *phase = Some(wrap);
        }
        Ok(self)
    }

    /// Loops capture: 16 I/Q pairs, table 5 of the FDL documentation v2 (2014-06-20).
    pub fn loops() -> RecordLayout {
        let wrap = PhaseWrap::default();
        RecordLayout {
            slots: vec![
                Slot::Separator,
                phase("FwCavPhase", wrap),
                named("FwIOT1_I"),
                named("FwIOT1_Q"),
                named("FwIOT2_I"),
                named("FwIOT2_Q"),
                named("RvCircIn_I"),
                named("RvCircIn_Q"),
                named("FwLoad_I"),
                named("FwLoad_Q"),
                named("RvCav_I"),
                named("RvCav_Q"),
                named("MO_I"),
                named("MO_Q"),
                named("CavFiltered_I"),
                named("CavFiltered_Q"),
                named("AmpCell2"),
                named("AmpCell4"),
                named("Cav_I"),
                named("Cav_Q"),
                named("Control_I"),
                named("Control_Q"),
                named("Error_I"),
                named("Error_Q"),
                named("ErroAccum_I"),
                named("ErroAccum_Q"),
                named("FwCav_I"),
                named("FwCav_Q"),
                phase("TuningDephase", wrap),
                phase("CavityPhase", wrap),
                named("Reference_I"),
                named("Reference_Q"),
            ],
            scale: UnitScale::default(),
        }
    }

    /// Diagnostics capture: 9 I/Q pairs, table 6 of the FDL documentation v2 (2014-06-20).
    pub fn diagnostics() -> RecordLayout {
        RecordLayout {
            slots: vec![
                Slot::Separator,
                Slot::Reserved,
                named("SSA1Input_I"),
                named("SSA1Input_Q"),
                named("SSA2Input_I"),
                named("SSA2Input_Q"),
                named("FwCircIn_I"),
                named("FwCircIn_Q"),
                named("FwCircOut_I"),
                named("FwCircOut_Q"),
                named("RvCircOut_I"),
                named("RvCircOut_Q"),
                named("RvLoad_I"),
                named("RvLoad_Q"),
                named("RvIOT1_I"),
                named("RvIOT1_Q"),
                named("RvIOT2_I"),
                named("RvIOT2_Q"),
            ],
            scale: UnitScale::default(),
        }
    }
}

fn named(name: &str) -> Slot {
    Slot::Named {
        name: name.to_string(),
        phase: None,
    }
}

fn phase(name: &str, wrap: PhaseWrap) -> Slot {
    Slot::Named {
        name: name.to_string(),
        phase: Some(wrap),
    }
}

pub struct RecordLayoutBuilder {
    slots: Vec<Slot>,
    scale: UnitScale,
}

impl RecordLayoutBuilder {
    pub fn slot(mut self, name: &str) -> Self {
        self.slots.push(named(name));
        self
    }

    pub fn phase_slot(mut self, name: &str, wrap: PhaseWrap) -> Self {
        self.slots.push(phase(name, wrap));
        self
    }

    pub fn reserved(mut self) -> Self {
        self.slots.push(Slot::Reserved);
        self
    }

    pub fn scale(mut self, scale: UnitScale) -> Self {
        self.scale = scale;
        self
    }

    pub fn build(self) -> Result<RecordLayout> {
        if self.slots.len() < 2 {
            return Err(LayoutError::TooNarrow);
        }
        let mut seen: Vec<&str> = vec![];
        for name in self.slots.iter().filter_map(Slot::name) {
            if name == SEPARATOR_NAME {
                return Err(LayoutError::ReservedName(name.to_string()));
            }
            if seen.contains(&name) {
                return Err(LayoutError::DuplicateSlot(name.to_string()));
            }
            seen.push(name);
        }
        Ok(RecordLayout {
            slots: self.slots,
            scale: self.scale,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use is_close::is_close;

    #[test]
    fn builtin_widths() {
        assert_eq!(RecordLayout::loops().width(), 32);
        assert_eq!(RecordLayout::diagnostics().width(), 18);
        assert_eq!(RecordLayout::diagnostics().named_slots().count(), 16);
    }

    #[test]
    fn phase_wrap_subtracts_range_above_threshold() {
        let wrap = PhaseWrap::default();
        assert!(is_close!(wrap.apply(600.0), -424.0));
        assert!(is_close!(wrap.apply(512.0), 512.0));
        assert!(is_close!(wrap.apply(-100.0), -100.0));
    }

    #[test]
    fn unit_scale_full_scale_is_one_volt() {
        let scale = UnitScale::default();
        assert!(is_close!(scale.apply(32767), 1000.0));
        assert!(is_close!(scale.apply(0), 0.0));
    }

    #[test]
    fn builder_rejects_bad_layouts() {
        assert_eq!(RecordLayout::builder().build(), Err(LayoutError::TooNarrow));
        assert_eq!(
            RecordLayout::builder().slot("a").slot("a").build(),
            Err(LayoutError::DuplicateSlot("a".to_string()))
        );
        assert_eq!(
            RecordLayout::builder().slot("separator").build(),
            Err(LayoutError::ReservedName("separator".to_string()))
        );
    }

    #[test]
    fn kind_from_file_name() {
        assert_eq!(
            LayoutKind::from_path("/data/RF/Loops_SR06A_20140620.dat"),
            Ok(LayoutKind::Loops)
        );
        assert_eq!(
            LayoutKind::from_path("Diag_WR_1.dat"),
            Ok(LayoutKind::Diagnostics)
        );
        assert!(LayoutKind::from_path("capture.dat").is_err());
    }

    #[test]
    fn with_phase_flags_named_slot() {
        let layout = RecordLayout::diagnostics()
            .with_phase("RvLoad_Q", PhaseWrap::default())
            .unwrap();
        let flagged: Vec<&str> = layout
            .named_slots()
            .filter(|(_, _, p)| p.is_some())
            .map(|(_, n, _)| n)
            .collect();
        assert_eq!(flagged, vec!["RvLoad_Q"]);
        assert!(RecordLayout::loops()
            .with_phase("nope", PhaseWrap::default())
            .is_err());
    }
}
