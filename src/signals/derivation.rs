//! Dependency-ordered evaluation of a signal catalog over raw channels.
use crate::signals::calibration::{CalibrationProvider, NEUTRAL_COEFFICIENTS};
use crate::signals::catalog::{FitKind, SignalCatalog, SignalSpec};
use crate::signals::error::{DerivationError, DerivationStage, EvalError};
use crate::signals::expression::Scope;
use crate::utils::constants::{BEAM_CURRENT_NAME, PI_NAME};
use crate::SignalSet;
use indexmap::{IndexMap, IndexSet};
use is_close::is_close;
use itertools::Itertools;
use log::{debug, info, warn};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

type Result<T> = std::result::Result<T, DerivationError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    /// Alias or amplitude whose inputs are present
    Raw,
    FitPending,
    FormulaPending,
    Orphan,
}

/// Everything one derivation produced, including what it could not.
#[derive(Debug, Clone, PartialEq)]
pub struct Derivation {
    /// Raw channels followed by every signal that was computed
    pub signals: SignalSet,
    /// Catalog entries whose inputs can never be present
    pub orphans: Vec<String>,
    /// Signals whose evaluation failed, left out of `signals`
    pub failed: IndexMap<String, EvalError>,
    /// Pending signals that could not be resolved, sorted
    pub unresolved: Vec<String>,
    pub stalled_at: Option<DerivationStage>,
    /// Fits computed with neutral coefficients for lack of a calibration
    pub defaulted: Vec<String>,
}

impl Derivation {
    pub fn is_stalled(&self) -> bool {
        self.stalled_at.is_some()
    }

    pub fn error(&self) -> Option<DerivationError> {
        self.stalled_at.map(|stage| DerivationError::Stalled {
            stage,
            unresolved: self.unresolved.clone(),
        })
    }

    /// # Errors
    /// Will return `Err` if the derivation stalled.
    pub fn into_signals(self) -> Result<SignalSet> {
        match self.stalled_at {
            None => Ok(self.signals),
            Some(stage) => Err(DerivationError::Stalled {
                stage,
                unresolved: self.unresolved,
            }),
        }
    }
}

/// Catalog entries as nodes, with an edge from every entry to each entry that reads it.
#[derive(Debug, Clone)]
struct DependencyGraph {
    graph: DiGraph<String, ()>,
    /// Every node after the nodes it reads, except along a cycle
    order: Vec<NodeIndex>,
    cyclic: IndexSet<NodeIndex>,
}

impl DependencyGraph {
    fn new(catalog: &SignalCatalog) -> DependencyGraph {
        let mut graph = DiGraph::new();
        let nodes: IndexMap<&str, NodeIndex> = catalog
            .iter()
            .map(|(name, _)| (name, graph.add_node(name.to_string())))
            .collect();
        for (name, spec) in catalog.iter() {
            // An alias reads a raw channel, which may share its name
            if matches!(spec, SignalSpec::Alias { .. }) {
                continue;
            }
            for input in spec.inputs().into_iter().unique() {
                if let (Some(from), Some(to)) = (nodes.get(input), nodes.get(name)) {
                    graph.add_edge(*from, *to, ());
                }
            }
        }

        let mut order = Vec::with_capacity(graph.node_count());
        let mut cyclic = IndexSet::new();
        // tarjan_scc lists the components dependants first
        for component in tarjan_scc(&graph).into_iter().rev() {
            let on_cycle = match component.as_slice() {
                [node] => graph.contains_edge(*node, *node),
                _ => true,
            };
            if on_cycle {
                cyclic.extend(component.iter().copied());
            }
            order.extend(component);
        }
        if !cyclic.is_empty() {
            warn!(
                "Signals on a dependency cycle: {}",
                cyclic.iter().map(|node| &graph[*node]).sorted().join(", ")
            );
        }
        DependencyGraph {
            graph,
            order,
            cyclic,
        }
    }

    fn name(&self, node: NodeIndex) -> &str {
        &self.graph[node]
    }

    /// Catalog entries read by `node`.
    fn dependencies(&self, node: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(node, Direction::Incoming)
    }

    fn is_cyclic(&self, node: NodeIndex) -> bool {
        self.cyclic.contains(&node)
    }
}

/// Computes the signals of a catalog, stage by stage: aliases and amplitudes, then fits, then
/// formulas. Within the fit and formula stages signals are resolved in topological order, so
/// the declaration order of the catalog never matters.
#[derive(Debug, Clone)]
pub struct SignalDerivationEngine {
    catalog: SignalCatalog,
    graph: DependencyGraph,
}

impl SignalDerivationEngine {
    pub fn new(catalog: SignalCatalog) -> SignalDerivationEngine {
        let graph = DependencyGraph::new(&catalog);
        SignalDerivationEngine { catalog, graph }
    }

    pub fn catalog(&self) -> &SignalCatalog {
        &self.catalog
    }

    /// Derives every signal reachable from `raw`.
    ///
    /// # Errors
    /// Will return `Err` naming the unresolved signals if the fit or formula stage stalls.
    pub fn derive<C: CalibrationProvider + ?Sized>(
        &self,
        raw: &SignalSet,
        calibration: &C,
    ) -> Result<SignalSet> {
        self.derive_report(raw, calibration).into_signals()
    }

    /// Same as [`derive`](Self::derive) but keeps partial results and diagnostics.
    pub fn derive_report<C: CalibrationProvider + ?Sized>(
        &self,
        raw: &SignalSet,
        calibration: &C,
    ) -> Derivation {
        let classes = self.classify(raw);
        let orphans: Vec<String> = self
            .catalog
            .iter()
            .filter(|(name, _)| classes.get(name) == Some(&Class::Orphan))
            .map(|(name, _)| name.to_string())
            .collect();
        if !orphans.is_empty() {
            warn!(
                "Found {} orphan signals: {}",
                orphans.len(),
                orphans.iter().join(", ")
            );
        }

        let mut derivation = Derivation {
            signals: raw.clone(),
            orphans,
            failed: IndexMap::new(),
            unresolved: vec![],
            stalled_at: None,
            defaulted: vec![],
        };

        self.raw_stage(&classes, &mut derivation);

        let unresolved_fits = self.fit_stage(&classes, calibration, &mut derivation);
        if !unresolved_fits.is_empty() {
            warn!(
                "Fits cannot be resolved: {}",
                unresolved_fits.iter().join(", ")
            );
            derivation.unresolved = unresolved_fits;
            derivation.stalled_at = Some(DerivationStage::Fit);
            return derivation;
        }

        let unresolved_formulas = self.formula_stage(&classes, calibration, &mut derivation);
        if !unresolved_formulas.is_empty() {
            warn!(
                "Formulas cannot be resolved: {}",
                unresolved_formulas.iter().join(", ")
            );
            derivation.unresolved = unresolved_formulas;
            derivation.stalled_at = Some(DerivationStage::Formula);
        }
        info!(
            "Derived {} signals from {} raw channels",
            derivation.signals.len() - raw.len(),
            raw.len()
        );
        derivation
    }

    /// Classes every catalog entry after the entries it reads. An entry reading an orphan is an
    /// orphan too; entries on a cycle stay pending.
    fn classify(&self, raw: &SignalSet) -> IndexMap<&str, Class> {
        let mut classes: IndexMap<&str, Class> = IndexMap::new();
        for node in self.graph.order.iter() {
            let name = self.graph.name(*node);
            let spec = match self.catalog.get(name) {
                Some(spec) => spec,
                None => continue,
            };
            let orphaned = self
                .graph
                .dependencies(*node)
                .any(|d| classes.get(self.graph.name(d)) == Some(&Class::Orphan));
            let class = match spec {
                SignalSpec::Alias { field, .. } if raw.contains_key(field.as_str()) => Class::Raw,
                SignalSpec::Alias { .. } => Class::Orphan,
                SignalSpec::Amplitude { i, q } => {
                    let present = [i.as_str(), q.as_str()].into_iter().all(|input| {
                        match self.catalog.get(input) {
                            Some(SignalSpec::Alias { .. }) => {
                                classes.get(input) == Some(&Class::Raw)
                            }
                            Some(_) => false,
                            None => raw.contains_key(input),
                        }
                    });
                    if present {
                        Class::Raw
                    } else {
                        Class::Orphan
                    }
                }
                SignalSpec::Fit { .. } if orphaned => Class::Orphan,
                SignalSpec::Fit { .. } => Class::FitPending,
                SignalSpec::Formula { depends, .. } if depends.is_empty() || orphaned => {
                    Class::Orphan
                }
                SignalSpec::Formula { .. } => Class::FormulaPending,
            };
            classes.insert(name, class);
        }
        classes
    }

    fn raw_stage(&self, classes: &IndexMap<&str, Class>, derivation: &mut Derivation) {
        for (name, spec) in self.catalog.iter() {
            if let (SignalSpec::Alias { field, .. }, Some(Class::Raw)) = (spec, classes.get(name))
            {
                if let Some(values) = derivation.signals.get(field.as_str()) {
                    let values = values.clone();
                    derivation.signals.insert(name.to_string(), values);
                }
            }
        }
        for (name, spec) in self.catalog.iter() {
            if let (SignalSpec::Amplitude { i, q }, Some(Class::Raw)) = (spec, classes.get(name))
            {
                match amplitude(&derivation.signals, i, q) {
                    Ok(values) => {
                        derivation.signals.insert(name.to_string(), values);
                    }
                    Err(e) => {
                        warn!("Cannot compute {}: {}", name, e);
                        derivation.failed.insert(name.to_string(), e);
                    }
                }
            }
        }
    }

    /// Pending entries of `class` in dependency order.
    fn pending<'a>(
        &'a self,
        classes: &'a IndexMap<&'a str, Class>,
        class: Class,
    ) -> impl Iterator<Item = (NodeIndex, &'a str, &'a SignalSpec)> + 'a {
        self.graph.order.iter().filter_map(move |node| {
            let name = self.graph.name(*node);
            match (classes.get(name), self.catalog.get(name)) {
                (Some(c), Some(spec)) if *c == class => Some((*node, name, spec)),
                _ => None,
            }
        })
    }

    /// Returns the fits left unresolved, sorted.
    fn fit_stage<C: CalibrationProvider + ?Sized>(
        &self,
        classes: &IndexMap<&str, Class>,
        calibration: &C,
        derivation: &mut Derivation,
    ) -> Vec<String> {
        let mut unresolved = vec![];
        for (node, name, spec) in self.pending(classes, Class::FitPending) {
            let (x, kind) = match spec {
                SignalSpec::Fit { x, kind } => (x.as_str(), kind),
                _ => continue,
            };
            if self.graph.is_cyclic(node) || !derivation.signals.contains_key(x) {
                debug!("{} waits on {} which will never be available", name, x);
                unresolved.push(name.to_string());
                continue;
            }
            let coefficients = match calibration.coefficients(name) {
                Some(coefficients) => coefficients,
                None => {
                    info!(
                        "No calibration for {}, using neutral coefficients; an adjustment is advisable",
                        name
                    );
                    derivation.defaulted.push(name.to_string());
                    NEUTRAL_COEFFICIENTS
                }
            };
            if matches!(kind, FitKind::Linear { .. }) && is_close!(coefficients.0, 0.0) {
                warn!("{} has a zero slope, its values will not be finite", name);
            }
            let values: Vec<f64> = derivation.signals[x]
                .iter()
                .map(|v| kind.apply(*v, coefficients))
                .collect();
            debug!("Fitted {} ({} values)", name, values.len());
            derivation.signals.insert(name.to_string(), values);
        }
        unresolved.sort();
        unresolved
    }

    /// Returns the formulas left unresolved, sorted.
    fn formula_stage<C: CalibrationProvider + ?Sized>(
        &self,
        classes: &IndexMap<&str, Class>,
        calibration: &C,
        derivation: &mut Derivation,
    ) -> Vec<String> {
        let beam_current = calibration.beam_current();
        let mut unresolved = vec![];
        for (node, name, spec) in self.pending(classes, Class::FormulaPending) {
            let depends: Vec<&str> = spec.inputs().into_iter().unique().collect();
            let expression = match self.catalog.formula(name) {
                Some(expression) => expression,
                None => continue,
            };
            if self.graph.is_cyclic(node) {
                debug!("{} is on a dependency cycle", name);
                unresolved.push(name.to_string());
                continue;
            }
            if let Some(missing) = depends
                .iter()
                .find(|d| !derivation.signals.contains_key(**d))
            {
                debug!("{} waits on {} which will never be available", name, missing);
                unresolved.push(name.to_string());
                continue;
            }
            let result = {
                let scope = depends
                    .iter()
                    .fold(Scope::new(), |scope, d| {
                        scope.series(d, &derivation.signals[*d])
                    })
                    .constant(PI_NAME, std::f64::consts::PI)
                    .constant(BEAM_CURRENT_NAME, beam_current);
                expression.evaluate(&scope)
            };
            match result {
                Ok(values) => {
                    debug!("Calculated {} ({} values)", name, values.len());
                    derivation.signals.insert(name.to_string(), values);
                }
                Err(e) => {
                    warn!("Cannot evaluate {}: {}", name, e);
                    derivation.failed.insert(name.to_string(), e);
                }
            }
        }
        unresolved.sort();
        unresolved
    }
}

fn amplitude(
    signals: &SignalSet,
    i: &str,
    q: &str,
) -> std::result::Result<Vec<f64>, EvalError> {
    let i_values = signals
        .get(i)
        .ok_or_else(|| EvalError::UnknownName(i.to_string()))?;
    let q_values = signals
        .get(q)
        .ok_or_else(|| EvalError::UnknownName(q.to_string()))?;
    if i_values.len() != q_values.len() {
        return Err(EvalError::LengthMismatch {
            name: q.to_string(),
            len: q_values.len(),
            expected: i_values.len(),
        });
    }
    Ok(i_values
        .iter()
        .zip(q_values)
        .map(|(i, q)| (i * i + q * q).sqrt())
        .collect())
}
