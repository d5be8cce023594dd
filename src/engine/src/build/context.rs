//! Build-context sandbox.
//!
//! The client-supplied archive is extracted into a fresh temporary root
//! while the per-file checksum map is computed from the same stream pass.
//! Every path taken from the recipe afterwards resolves through this
//! module, which refuses to follow anything out of the sandbox — including
//! through symbolic links.

use std::collections::{HashMap, VecDeque};
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use kiln_core::error::{KilnError, Result};

use super::tarsum::{entry_sum, EntryMeta};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Offset and value of the ustar magic inside a tar header block.
const TAR_MAGIC_OFFSET: usize = 257;
const TAR_MAGIC: &[u8] = b"ustar";

/// An extracted build context: sandbox root plus per-file checksums.
///
/// The sandbox directory is removed when the context is dropped, on
/// success and failure alike.
pub struct BuildContext {
    root: TempDir,
    sums: HashMap<String, String>,
}

impl BuildContext {
    /// Decompress and extract the context archive, computing the checksum
    /// of every regular file on the way through.
    pub fn unpack<R: Read>(input: R) -> Result<Self> {
        let mut reader = BufReader::new(input);
        let gzipped = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
        let stream: Box<dyn Read> = if gzipped {
            Box::new(GzDecoder::new(reader))
        } else {
            Box::new(reader)
        };

        let root = tempfile::Builder::new().prefix("kiln-build-").tempdir()?;
        let mut sums = HashMap::new();

        let mut archive = tar::Archive::new(stream);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let Some(rel) = sanitize_entry_path(&entry.path()?) else {
                continue;
            };
            let dest = root.path().join(&rel);
            let header = entry.header().clone();

            match header.entry_type() {
                tar::EntryType::Directory => {
                    std::fs::create_dir_all(&dest)?;
                }
                tar::EntryType::Symlink => {
                    let target = entry.link_name()?.ok_or_else(|| {
                        KilnError::InvalidArgument(format!(
                            "context entry {} has no link target",
                            rel.display()
                        ))
                    })?;
                    if let Some(parent) = dest.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::os::unix::fs::symlink(&target, &dest)?;
                }
                tar::EntryType::Regular | tar::EntryType::Continuous => {
                    let mut content = Vec::with_capacity(header.size().unwrap_or(0) as usize);
                    entry.read_to_end(&mut content)?;
                    if let Some(parent) = dest.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&dest, &content)?;
                    if let Ok(mode) = header.mode() {
                        use std::os::unix::fs::PermissionsExt;
                        let _ = std::fs::set_permissions(
                            &dest,
                            std::fs::Permissions::from_mode(mode),
                        );
                    }
                    let name = rel.to_string_lossy().into_owned();
                    let meta = EntryMeta::from_header(&name, &header);
                    sums.insert(name, entry_sum(&meta, &content));
                }
                other => {
                    tracing::debug!(entry = %rel.display(), ?other, "skipping context entry type");
                }
            }
        }

        Ok(BuildContext { root, sums })
    }

    /// Sandbox root directory.
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Per-file checksum map keyed by context-relative path.
    pub fn sums(&self) -> &HashMap<String, String> {
        &self.sums
    }

    /// Checksum of one context file, if it passed through the stream.
    pub fn sum_for(&self, rel: &str) -> Option<&str> {
        self.sums.get(&normalize_rel(rel)).map(String::as_str)
    }

    /// Aggregate checksum of every context file under `rel`: the member
    /// sums sorted lexicographically, joined by `,`, hashed. Entry order
    /// in the original archive does not matter.
    pub fn dir_sum(&self, rel: &str) -> String {
        let prefix = normalize_rel(rel);
        let prefix_path = Path::new(&prefix);
        let mut members: Vec<&str> = self
            .sums
            .iter()
            .filter(|(path, _)| Path::new(path).starts_with(prefix_path))
            .map(|(_, sum)| sum.as_str())
            .collect();
        members.sort_unstable();

        let mut hasher = Sha256::new();
        hasher.update(members.join(",").as_bytes());
        format!("dir:{}", hex::encode(hasher.finalize()))
    }

    /// Evaluate symlinks along `rel` under the context root. The resolved
    /// path must exist and must still be inside the sandbox.
    pub fn resolve_source(&self, rel: &str) -> Result<PathBuf> {
        let joined = self.root.path().join(normalize_rel(rel));
        let root = std::fs::canonicalize(self.root.path())?;
        let resolved = std::fs::canonicalize(&joined).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                KilnError::PathNotFound(rel.to_string())
            } else {
                KilnError::Io(err)
            }
        })?;
        if !resolved.starts_with(&root) {
            return Err(KilnError::ContextEscape {
                path: rel.to_string(),
                resolved: resolved.display().to_string(),
            });
        }
        Ok(resolved)
    }
}

/// Strip leading `/` and `./` runs from a context-relative reference.
fn normalize_rel(rel: &str) -> String {
    let mut s = rel.trim_start_matches('/');
    loop {
        let trimmed = s.strip_prefix("./").unwrap_or(s);
        if trimmed == s {
            break;
        }
        s = trimmed;
    }
    if s == "." {
        return String::new();
    }
    s.to_string()
}

/// Reduce a tar entry path to safe normal components. Entries that try to
/// climb out (`..`) or carry no usable name are dropped.
fn sanitize_entry_path(path: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::ParentDir => return None,
            _ => {}
        }
    }
    (!clean.as_os_str().is_empty()).then_some(clean)
}

/// Resolve `path` against `root`, following symlinks component by
/// component without ever escaping `root`. Missing trailing components
/// are allowed; the caller may be about to create them.
pub fn scoped_join(root: &Path, path: &str) -> Result<PathBuf> {
    let mut queue: VecDeque<OsString> = components_of(Path::new(path));
    let mut resolved = root.to_path_buf();
    let mut hops = 0usize;

    while let Some(part) = queue.pop_front() {
        if part == ".." {
            if resolved != root {
                resolved.pop();
            }
            continue;
        }
        let next = resolved.join(&part);
        match std::fs::symlink_metadata(&next) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > 255 {
                    return Err(KilnError::InvalidArgument(format!(
                        "too many levels of symbolic links: {}",
                        path
                    )));
                }
                let target = std::fs::read_link(&next)?;
                if target.is_absolute() {
                    resolved = root.to_path_buf();
                }
                let mut target_parts = components_of(&target);
                while let Some(piece) = target_parts.pop_back() {
                    queue.push_front(piece);
                }
            }
            _ => resolved = next,
        }
    }

    Ok(resolved)
}

fn components_of(path: &Path) -> VecDeque<OsString> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_os_string()),
            Component::ParentDir => Some(OsString::from("..")),
            _ => None,
        })
        .collect()
}

/// Attempt to unpack `src` as a (possibly gzipped) tar archive into
/// `dest`. Returns `Ok(false)` when the file is not an archive; errors
/// while unpacking a recognized archive abort.
pub fn try_untar(src: &Path, dest: &Path) -> Result<bool> {
    let raw = std::fs::read(src)?;
    let data = if raw.starts_with(&GZIP_MAGIC) {
        let mut decompressed = Vec::new();
        match GzDecoder::new(&raw[..]).read_to_end(&mut decompressed) {
            Ok(_) => decompressed,
            Err(err) => {
                tracing::debug!(src = %src.display(), %err, "not a gzip archive");
                return Ok(false);
            }
        }
    } else {
        raw
    };

    if data.len() < TAR_MAGIC_OFFSET + TAR_MAGIC.len()
        || &data[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len()] != TAR_MAGIC
    {
        return Ok(false);
    }

    std::fs::create_dir_all(dest)?;
    tar::Archive::new(std::io::Cursor::new(data)).unpack(dest)?;
    Ok(true)
}

/// Recursively copy a directory tree, preserving modes and symlinks.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = std::fs::symlink_metadata(&from)?.file_type();
        if file_type.is_dir() {
            copy_tree(&from, &to)?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(&from)?;
            if to.exists() || std::fs::symlink_metadata(&to).is_ok() {
                let _ = std::fs::remove_file(&to);
            }
            std::os::unix::fs::symlink(&target, &to)?;
        } else {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

/// Recursively chown to `uid:gid`. Paths that vanish mid-walk are
/// skipped; any other failure aborts the step.
pub fn fix_permissions(path: &Path, uid: u32, gid: u32) -> Result<()> {
    match std::os::unix::fs::lchown(path, Some(uid), Some(gid)) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => return Err(err.into()),
        _ => {}
    }
    let is_dir = std::fs::symlink_metadata(path)
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if is_dir {
        for entry in std::fs::read_dir(path)? {
            fix_permissions(&entry?.path(), uid, gid)?;
        }
    }
    Ok(())
}
