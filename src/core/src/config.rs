//! Image run-configuration record.
//!
//! `RunConfig` is the single record mutated by every build instruction and
//! persisted into each committed image. The cache probe compares two of
//! these field by field, so the representation is chosen for deterministic
//! structural equality: `env` is an ordered sequence with at most one entry
//! per key, set-typed fields are ordered sets.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KilnError;

/// Network protocol of an exposed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(KilnError::InvalidArgument(format!(
                "invalid port protocol: {}",
                other
            ))),
        }
    }
}

/// One exposed port: `8080` or `8080/udp`. The protocol defaults to tcp.
///
/// Serialized in the conventional `port/proto` string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortSpec {
    pub port: u16,
    pub proto: Protocol,
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.proto)
    }
}

impl FromStr for PortSpec {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (port, proto) = match s.split_once('/') {
            Some((port, proto)) => (port, proto.parse()?),
            None => (s, Protocol::Tcp),
        };
        let port = port
            .parse::<u16>()
            .map_err(|_| KilnError::InvalidArgument(format!("invalid port specification: {}", s)))?;
        Ok(PortSpec { port, proto })
    }
}

impl TryFrom<String> for PortSpec {
    type Error = KilnError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PortSpec> for String {
    fn from(p: PortSpec) -> String {
        p.to_string()
    }
}

/// Image run configuration.
///
/// Field names follow the persisted image-config convention so committed
/// records stay wire-compatible with existing image inspectors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RunConfig {
    /// Default command
    pub cmd: Vec<String>,

    /// Entrypoint command
    pub entrypoint: Vec<String>,

    /// Environment as ordered `KEY=VALUE` entries, at most one per key
    pub env: Vec<String>,

    /// Working directory inside the image
    pub working_dir: String,

    /// User to run as
    pub user: String,

    /// Exposed ports
    pub exposed_ports: BTreeSet<PortSpec>,

    /// Volume mount points (absolute paths)
    pub volumes: BTreeSet<String>,

    /// Deferred build triggers, executed by a downstream FROM
    pub on_build: Vec<String>,

    /// Parent image ID
    pub image: String,
}

impl RunConfig {
    /// Position of the entry for `key` in `env`, if present.
    pub fn env_index(&self, key: &str) -> Option<usize> {
        self.env
            .iter()
            .position(|entry| entry.split('=').next() == Some(key))
    }

    /// Value of the first `env` entry whose key equals `key`.
    pub fn env_get(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            let (k, v) = entry.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    /// Set `key` to `value`, replacing an existing entry in place so the
    /// original position is preserved, or appending otherwise.
    pub fn set_env(&mut self, key: &str, value: &str) {
        let entry = format!("{}={}", key, value);
        match self.env_index(key) {
            Some(i) => self.env[i] = entry,
            None => self.env.push(entry),
        }
    }
}
