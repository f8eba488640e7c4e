//! Epgconf CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the EPG operator.

pub mod epgconf;

pub use epgconf::*;
