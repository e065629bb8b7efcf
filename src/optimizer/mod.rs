//! Nonlinear refinement of the local map window.

pub mod local_ba;

pub use local_ba::{local_bundle_adjustment_with_lines, LocalBaConfig, LocalBaResult};
