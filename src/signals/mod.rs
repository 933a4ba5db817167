pub mod calibration;
pub mod catalog;
pub mod derivation;
pub mod error;
pub mod expression;
