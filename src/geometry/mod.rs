//! Geometry: rigid transforms and the pure two-view kernel.

pub mod kernel;
pub mod pose;

pub use kernel::skew_symmetric;
pub use pose::Pose;
