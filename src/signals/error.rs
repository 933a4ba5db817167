use itertools::Itertools;
use std::fmt;
use std::fmt::Display;
use thiserror::Error;

/// Errors found while parsing a formula string.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Unexpected character '{ch}' at position {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("'^' at position {0} is not a power operator, use '**'")]
    CaretPower(usize),

    #[error("Invalid number '{0}'")]
    InvalidNumber(String),

    #[error("Unexpected {found} at position {pos}")]
    UnexpectedToken { found: String, pos: usize },

    #[error("Expression ended unexpectedly")]
    UnexpectedEnd,

    #[error("Unknown function '{0}'")]
    UnknownFunction(String),
}

/// Errors raised while evaluating a formula on one record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("Division by zero")]
    DivisionByZero,

    #[error("{function}({value}) is outside the function domain")]
    Domain { function: String, value: f64 },

    /// Finite operands gave an infinite or NaN result
    #[error("'{operation}' overflows on record {index}")]
    NotFinite { operation: String, index: usize },

    #[error("Unknown name '{0}'")]
    UnknownName(String),

    #[error("Signal '{name}' holds {len} values, expected {expected}")]
    LengthMismatch {
        name: String,
        len: usize,
        expected: usize,
    },
}

/// Errors found while validating a signal catalog.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CatalogError {
    #[error("Signal '{0}' is declared more than once")]
    DuplicateName(String),

    #[error("Signal '{signal}' has an empty {field}")]
    EmptyField { signal: String, field: &'static str },

    #[error("Signal '{0}' depends on itself")]
    SelfDependency(String),

    #[error("Formula of '{signal}' does not parse: {source}")]
    Expression {
        signal: String,
        source: ExpressionError,
    },

    #[error("Formula of '{signal}' references '{name}' which is not among its dependencies")]
    UndeclaredReference { signal: String, name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivationStage {
    Fit,
    Formula,
}

impl Display for DerivationStage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DerivationStage::Fit => write!(f, "fit"),
            DerivationStage::Formula => write!(f, "formula"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DerivationError {
    /// No further signal could be resolved while some were still pending
    #[error("Derivation stalled at the {stage} stage, unresolved: {}", .unresolved.iter().join(", "))]
    Stalled {
        stage: DerivationStage,
        unresolved: Vec<String>,
    },
}

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("Could not read parameter file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Line {line}: expected 'name:value', found '{content}'")]
    MalformedLine { line: usize, content: String },

    #[error("Line {line}: '{value}' is not a valid value for {name}")]
    InvalidValue {
        line: usize,
        name: String,
        value: String,
    },
}
