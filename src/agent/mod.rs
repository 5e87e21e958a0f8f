//! Agent Channel Adapters
//!
//! Implementations of the [`AgentChannel`](crate::domain::ports::AgentChannel) port:
//! - HTTP: JSON commands posted to the host agent
//! - Mock: scripted replies for tests and dry runs

pub mod http;
pub mod mock;

pub use http::*;
pub use mock::*;
