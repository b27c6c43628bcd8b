//! Sample CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the sample controllers.

pub mod greeting;

pub use greeting::*;
