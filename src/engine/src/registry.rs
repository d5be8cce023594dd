//! Registry pull collaborator interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use kiln_core::error::Result;

/// Credentials forwarded to the pull job for a FROM of a missing image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, rename = "serveraddress")]
    pub server_address: String,
}

/// Narrow interface onto the registry pull subsystem. Network retries are
/// its concern, not the engine's.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Pull `repository[:tag]` into the image store.
    async fn pull(&self, repository: &str, tag: &str, auth: &AuthConfig) -> Result<()>;
}

/// Split an image reference into repository and tag. The tag is empty when
/// absent; a colon inside the final path segment is only a tag separator
/// when the remainder contains no `/` (so registry ports survive).
pub fn parse_repository_tag(reference: &str) -> (String, String) {
    if let Some(idx) = reference.rfind(':') {
        let tag = &reference[idx + 1..];
        if !tag.contains('/') {
            return (reference[..idx].to_string(), tag.to_string());
        }
    }
    (reference.to_string(), String::new())
}
