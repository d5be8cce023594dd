//! Kiln Engine - container-image build engine core.
//!
//! Interprets a declarative build recipe against an extracted file-tree
//! context. Each instruction either mutates the image run-configuration
//! record or runs a command inside a freshly-created intermediate container;
//! every step commits into a content-addressed image chain, with per-step
//! caching keyed on (parent image, configuration).
//!
//! The image store, container runtime, and registry pull are consumed
//! through narrow async traits ([`store::ImageStore`],
//! [`runtime::ContainerRuntime`], [`registry::RegistryClient`]) so the
//! engine never depends on a concrete daemon.

pub mod build;
pub mod registry;
pub mod runtime;
pub mod store;

// Re-export the invocation surface
pub use build::{BuildOptions, BuildOutput, Builder, Instruction, DEFAULT_PATH_ENV};
pub use registry::{parse_repository_tag, AuthConfig, RegistryClient};
pub use runtime::{ContainerRuntime, OutputChunk, StdStream};
pub use store::{short_id, ImageRecord, ImageStore};

/// Kiln Engine version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
