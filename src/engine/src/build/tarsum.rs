//! Deterministic per-entry archive checksums.
//!
//! Every file in the build context gets one checksum, computed from the
//! tar header fields that matter for reproducibility plus the file
//! content. Modification times are deliberately excluded: two archives
//! carrying the same bytes under the same names must hash identically, or
//! COPY/ADD cache fingerprints would never hit.

use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use kiln_core::error::Result;

/// Header fields folded into an entry checksum.
#[derive(Debug, Clone, Default)]
pub struct EntryMeta {
    pub name: String,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub size: u64,
    pub typeflag: u8,
    pub linkname: String,
}

impl EntryMeta {
    /// Extract the checksummed fields from a tar header. `name` is passed
    /// separately because long names live in extension records, not the
    /// header itself.
    pub fn from_header(name: &str, header: &tar::Header) -> Self {
        EntryMeta {
            name: name.to_string(),
            mode: header.mode().unwrap_or(0),
            uid: header.uid().unwrap_or(0),
            gid: header.gid().unwrap_or(0),
            size: header.size().unwrap_or(0),
            typeflag: header.entry_type().as_byte(),
            linkname: header
                .link_name()
                .ok()
                .flatten()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }
}

/// Checksum one entry from its header fields and content bytes.
pub fn entry_sum(meta: &EntryMeta, content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"name");
    hasher.update(meta.name.as_bytes());
    hasher.update(b"mode");
    hasher.update(meta.mode.to_string().as_bytes());
    hasher.update(b"uid");
    hasher.update(meta.uid.to_string().as_bytes());
    hasher.update(b"gid");
    hasher.update(meta.gid.to_string().as_bytes());
    hasher.update(b"size");
    hasher.update(meta.size.to_string().as_bytes());
    hasher.update(b"typeflag");
    hasher.update([meta.typeflag]);
    hasher.update(b"linkname");
    hasher.update(meta.linkname.as_bytes());
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Checksum a file on disk as if it were a single tar entry named `name`.
/// Used for remote downloads, which never pass through the context stream.
pub fn file_sum(name: &str, path: &Path) -> Result<String> {
    let metadata = std::fs::metadata(path)?;
    let mut content = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut content)?;

    #[cfg(unix)]
    let (mode, uid, gid) = {
        use std::os::unix::fs::MetadataExt;
        (metadata.mode() & 0o7777, metadata.uid() as u64, metadata.gid() as u64)
    };
    #[cfg(not(unix))]
    let (mode, uid, gid) = (0o644u32, 0u64, 0u64);

    let meta = EntryMeta {
        name: name.to_string(),
        mode,
        uid,
        gid,
        size: metadata.len(),
        typeflag: tar::EntryType::Regular.as_byte(),
        linkname: String::new(),
    };
    Ok(entry_sum(&meta, &content))
}
