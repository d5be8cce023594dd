//! Kiln Core - Foundational Types for the Build Engine
//!
//! This module provides the types shared between the build engine and its
//! collaborators: the image run-configuration record that is persisted into
//! committed images, and the error taxonomy surfaced to callers.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{PortSpec, Protocol, RunConfig};
pub use error::{KilnError, Result};

/// Kiln version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
