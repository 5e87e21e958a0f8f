//! Domain layer - Data model and port definitions
//!
//! This module defines the records the migration core works on and the
//! traits (ports) that adapters implement, following hexagonal
//! architecture principles.

pub mod model;
pub mod ports;

pub use model::*;
pub use ports::*;
