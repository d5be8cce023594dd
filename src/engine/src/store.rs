//! Image store collaborator interface.
//!
//! The engine only needs three operations from the store: resolve a name to
//! an image, look up a cached child by (parent, configuration), and commit
//! a container as the next image in the chain.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use kiln_core::config::RunConfig;
use kiln_core::error::Result;

/// Length of the truncated identifier shown in progress output.
const SHORT_ID_LEN: usize = 12;

/// Truncate an image or container identifier to its short display form.
pub fn short_id(id: &str) -> &str {
    &id[..id.len().min(SHORT_ID_LEN)]
}

/// A committed image as seen by the build engine.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    /// Content-addressed image identifier
    pub id: String,

    /// Parent image in the chain, absent for base images
    pub parent: Option<String>,

    /// Runtime configuration persisted for the image; `cmd` holds the
    /// semantically meaningful command, never a `#(nop)` sentinel.
    pub config: RunConfig,

    /// Configuration the intermediate container was created with. `cmd`
    /// holds the synthetic step command; cache probes compare this record.
    pub container_config: RunConfig,

    /// Author recorded at commit time (the recipe's maintainer)
    pub author: String,

    /// When the image was committed
    pub created: DateTime<Utc>,
}

impl ImageRecord {
    /// Short display form of the image ID.
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }
}

/// Narrow interface onto the image store.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Resolve a `name[:tag]` reference (or a raw image ID) to an image.
    async fn lookup(&self, name: &str) -> Result<Option<ImageRecord>>;

    /// Find the child of `parent` whose container configuration equals
    /// `config` structurally. Advisory: a concurrent build may commit an
    /// equal child between probe and commit, which is benign.
    async fn get_cached(&self, parent: &str, config: &RunConfig) -> Result<Option<ImageRecord>>;

    /// Commit a container as a new image. `config` is the runtime
    /// configuration to persist, `container_config` the fingerprint record
    /// future cache probes will match against. The new image's parent is
    /// the container's base image.
    async fn commit(
        &self,
        container_id: &str,
        author: &str,
        config: &RunConfig,
        container_config: &RunConfig,
    ) -> Result<ImageRecord>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id_truncates() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
    }

    #[test]
    fn test_short_id_short_input() {
        assert_eq!(short_id("abc"), "abc");
    }
}
