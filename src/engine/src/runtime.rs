//! Container runtime collaborator interface.
//!
//! Intermediate containers host a step's filesystem mutation and exit
//! state. The engine drives them through this narrow interface; it never
//! inspects runtime internals.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;

use kiln_core::config::RunConfig;
use kiln_core::error::Result;

/// Which stream a captured output chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    Stdout,
    Stderr,
}

/// One chunk of output captured from a running container.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: StdStream,
    pub data: Vec<u8>,
}

/// Narrow interface onto the container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container from the given configuration; returns its ID.
    async fn create(&self, config: &RunConfig) -> Result<String>;

    /// Mount the container's root filesystem; returns the rootfs path.
    async fn mount(&self, id: &str) -> Result<PathBuf>;

    /// Unmount a previously mounted root filesystem.
    async fn unmount(&self, id: &str) -> Result<()>;

    /// Start the container's command.
    async fn start(&self, id: &str) -> Result<()>;

    /// Attach to the container's stdout/stderr. The channel closes when
    /// the container exits.
    async fn attach(&self, id: &str) -> Result<mpsc::Receiver<OutputChunk>>;

    /// Block until the container exits; returns the exit code. Unbounded
    /// by default; callers may layer a policy timeout above.
    async fn wait(&self, id: &str) -> Result<i64>;

    /// Destroy the container and release its resources.
    async fn destroy(&self, id: &str) -> Result<()>;
}
