//! Declarative catalog of the signals derived from raw FDL channels.
use crate::layout::{LayoutError, PhaseWrap, RecordLayout};
use crate::signals::error::CatalogError;
use crate::signals::expression::Expr;
use crate::utils::constants::{FORMULA_CONSTANTS, QUADRATIC_SCALE};
use indexmap::IndexMap;
use log::debug;

type Result<T> = std::result::Result<T, CatalogError>;

/// Calibration curve of a fit. Coefficients are looked up by attribute name.
#[derive(Debug, Clone, PartialEq)]
pub enum FitKind {
    /// `(x - offset) / slope`
    Linear { slope: String, offset: String },
    /// `x² / scale / 10^couple - offset`
    Quadratic {
        couple: String,
        offset: String,
        scale: f64,
    },
}

impl FitKind {
    pub fn linear(slope: &str, offset: &str) -> FitKind {
        FitKind::Linear {
            slope: slope.to_string(),
            offset: offset.to_string(),
        }
    }

    pub fn quadratic(couple: &str, offset: &str) -> FitKind {
        FitKind::Quadratic {
            couple: couple.to_string(),
            offset: offset.to_string(),
            scale: QUADRATIC_SCALE,
        }
    }

    /// Names of the `(a, b)` calibration attributes.
    pub fn attributes(&self) -> (&str, &str) {
        match self {
            FitKind::Linear { slope, offset } => (slope.as_str(), offset.as_str()),
            FitKind::Quadratic { couple, offset, .. } => (couple.as_str(), offset.as_str()),
        }
    }

    /// Element letters of the `(a, b)` coefficients in saved parameter files, where they appear
    /// as `<signal>/<element>:<value>`.
    pub fn elements(&self) -> (&'static str, &'static str) {
        match self {
            FitKind::Linear { .. } => ("m", "n"),
            FitKind::Quadratic { .. } => ("c", "o"),
        }
    }

    pub fn apply(&self, x: f64, (a, b): (f64, f64)) -> f64 {
        match self {
            FitKind::Linear { .. } => (x - b) / a,
            FitKind::Quadratic { scale, .. } => x.powi(2) / scale / 10f64.powf(a) - b,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalSpec {
    /// Renames a raw channel.
    Alias {
        field: String,
        phase: Option<PhaseWrap>,
    },
    /// `sqrt(i² + q²)` over two raw-stage signals.
    Amplitude { i: String, q: String },
    Fit { x: String, kind: FitKind },
    Formula {
        expression: String,
        depends: Vec<String>,
    },
}

impl SignalSpec {
    /// Names this signal reads.
    pub fn inputs(&self) -> Vec<&str> {
        match self {
            SignalSpec::Alias { field, .. } => vec![field.as_str()],
            SignalSpec::Amplitude { i, q } => vec![i.as_str(), q.as_str()],
            SignalSpec::Fit { x, .. } => vec![x.as_str()],
            SignalSpec::Formula { depends, .. } => depends.iter().map(String::as_str).collect(),
        }
    }
}

/// Validated, immutable set of signal declarations in declaration order.
#[derive(Debug, Clone)]
pub struct SignalCatalog {
    specs: IndexMap<String, SignalSpec>,
    formulas: IndexMap<String, Expr>,
}

impl SignalCatalog {
    pub fn builder() -> SignalCatalogBuilder {
        SignalCatalogBuilder { entries: vec![] }
    }

    pub fn get(&self, name: &str) -> Option<&SignalSpec> {
        self.specs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SignalSpec)> {
        self.specs.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Parsed expression of a formula signal.
    pub fn formula(&self, name: &str) -> Option<&Expr> {
        self.formulas.get(name)
    }

    /// Every fit with its input and curve.
    pub fn fits(&self) -> impl Iterator<Item = (&str, &str, &FitKind)> {
        self.specs.iter().filter_map(|(name, spec)| match spec {
            SignalSpec::Fit { x, kind } => Some((name.as_str(), x.as_str(), kind)),
            _ => None,
        })
    }

    /// Flags the raw channels of phase aliases in `layout`. Aliases of channels the layout does
    /// not carry are left alone.
    pub fn annotate_layout(
        &self,
        layout: RecordLayout,
    ) -> std::result::Result<RecordLayout, LayoutError> {
        let mut layout = layout;
        for (name, spec) in self.iter() {
            if let SignalSpec::Alias {
                field,
                phase: Some(wrap),
            } = spec
            {
                if layout.slot_index(field).is_some() {
                    debug!("{} marks raw channel {} as a phase", name, field);
                    layout = layout.with_phase(field, *wrap)?;
                }
            }
        }
        Ok(layout)
    }

    /// Catalog of the SR RF plants: I/Q aliases, amplitudes, the cavity voltage and power
    /// calibrations and the beam power and phase formulas.
    ///
    /// # Errors
    /// Never in practice; the declarations go through the same validation as any other catalog.
    pub fn default_catalog() -> Result<SignalCatalog> {
        let mut builder = SignalCatalog::builder()
            .alias("CavVolt_I", "Cav_I")
            .alias("CavVolt_Q", "Cav_Q");
        for pair in ["FwCav", "RvCav", "Control", "Error", "ErroAccum", "SSA1Input"] {
            let i = format!("{pair}_I");
            let q = format!("{pair}_Q");
            builder = builder.alias(&i, &i).alias(&q, &q);
        }
        for amplitude in [
            "CavVolt", "FwCav", "RvCav", "Control", "Error", "ErroAccum", "SSA1Input",
        ] {
            builder = builder.amplitude(
                amplitude,
                &format!("{amplitude}_I"),
                &format!("{amplitude}_Q"),
            );
        }
        builder
            .fit(
                "CavVolt_mV",
                "CavVolt",
                FitKind::linear("CavVolt_m", "CavVolt_n"),
            )
            .fit(
                "CavVolt_kV",
                "CavVolt_mV",
                FitKind::linear("CAV_VOLT_KV_m", "CAV_VOLT_KV_n"),
            )
            .fit(
                "FwCav_kW",
                "FwCav",
                FitKind::quadratic("FwCav_kW_couple", "FwCav_kW_offset"),
            )
            .fit(
                "RvCav_kW",
                "RvCav",
                FitKind::quadratic("RvCav_kW_couple", "RvCav_kW_offset"),
            )
            .formula(
                "PDisCav_kW",
                "(CavVolt_kV**2)/(10e6*2*3.3e8)",
                &["CavVolt_kV"],
            )
            .formula(
                "PBeam_kW",
                "FwCav_kW-RvCav_kW-PDisCav_kW",
                &["FwCav_kW", "RvCav_kW", "PDisCav_kW"],
            )
            .formula(
                "BeamPhase",
                "180-arcsin(PBeam_kW*1000/BeamCurrent/CavVolt_kV)*180/pi",
                &["PBeam_kW", "CavVolt_kV"],
            )
            .build()
    }
}

pub struct SignalCatalogBuilder {
    entries: Vec<(String, SignalSpec)>,
}

impl SignalCatalogBuilder {
    pub fn signal(mut self, name: &str, spec: SignalSpec) -> Self {
        self.entries.push((name.to_string(), spec));
        self
    }

    pub fn alias(self, name: &str, field: &str) -> Self {
        self.signal(
            name,
            SignalSpec::Alias {
                field: field.to_string(),
                phase: None,
            },
        )
    }

    pub fn phase_alias(self, name: &str, field: &str, wrap: PhaseWrap) -> Self {
        self.signal(
            name,
            SignalSpec::Alias {
                field: field.to_string(),
                phase: Some(wrap),
            },
        )
    }

    pub fn amplitude(self, name: &str, i: &str, q: &str) -> Self {
        self.signal(
            name,
            SignalSpec::Amplitude {
                i: i.to_string(),
                q: q.to_string(),
            },
        )
    }

    pub fn fit(self, name: &str, x: &str, kind: FitKind) -> Self {
        self.signal(
            name,
            SignalSpec::Fit {
                x: x.to_string(),
                kind,
            },
        )
    }

    pub fn formula(self, name: &str, expression: &str, depends: &[&str]) -> Self {
        self.signal(
            name,
            SignalSpec::Formula {
                expression: expression.to_string(),
                depends: depends.iter().map(|d| d.to_string()).collect(),
            },
        )
    }

    /// Validates every declaration and parses the formulas.
    ///
    /// # Errors
    /// Will return `Err` on duplicate names, empty fields, self references, formulas that do not
    /// parse, or formulas that read names missing from their dependencies.
    pub fn build(self) -> Result<SignalCatalog> {
        let mut specs: IndexMap<String, SignalSpec> = IndexMap::new();
        let mut formulas: IndexMap<String, Expr> = IndexMap::new();
        for (name, spec) in self.entries {
            validate_fields(&name, &spec)?;
            if !matches!(spec, SignalSpec::Alias { .. }) && spec.inputs().contains(&name.as_str())
            {
                return Err(CatalogError::SelfDependency(name));
            }
            if let SignalSpec::Formula {
                expression,
                depends,
            } = &spec
            {
                let parsed: Expr =
                    expression
                        .parse()
                        .map_err(|source| CatalogError::Expression {
                            signal: name.clone(),
                            source,
                        })?;
                for referenced in parsed.referenced_names() {
                    let declared = depends.iter().any(|d| d == referenced)
                        || FORMULA_CONSTANTS.contains(&referenced);
                    if !declared {
                        return Err(CatalogError::UndeclaredReference {
                            signal: name.clone(),
                            name: referenced.to_string(),
                        });
                    }
                }
                formulas.insert(name.clone(), parsed);
            }
            if specs.contains_key(&name) {
                return Err(CatalogError::DuplicateName(name));
            }
            specs.insert(name, spec);
        }
        Ok(SignalCatalog { specs, formulas })
    }
}

fn validate_fields(name: &str, spec: &SignalSpec) -> Result<()> {
    let fields: Vec<(&'static str, &str)> = match spec {
        SignalSpec::Alias { field, .. } => vec![("field", field.as_str())],
        SignalSpec::Amplitude { i, q } => vec![("i", i.as_str()), ("q", q.as_str())],
        SignalSpec::Fit { x, kind } => {
            let (a, b) = kind.attributes();
            vec![("x", x.as_str()), ("coefficient", a), ("coefficient", b)]
        }
        SignalSpec::Formula { expression, .. } => vec![("expression", expression.as_str())],
    };
    for (field, value) in fields {
        if value.trim().is_empty() {
            return Err(CatalogError::EmptyField {
                signal: name.to_string(),
                field,
            });
        }
    }
    Ok(())
}
