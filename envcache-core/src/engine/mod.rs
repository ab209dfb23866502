//! Engine module - process isolation primitives
//!
//! The jail every environment-touching child passes through before it
//! executes anything.

pub mod isolation;

pub use isolation::{IdentityPolicy, JailConfig, JailFailure, JailStep};
