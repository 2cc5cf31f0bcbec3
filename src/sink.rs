//! Entry sinks: where extracted tar entries go.
//!
//! The extractor calls [`EntrySink::consume`] once per entry, in stream
//! order per source, with a forward-only body reader bounded to the entry's
//! size.  A sink may read all, part or none of the body; whatever it leaves
//! is skipped by the extractor.  Sinks are shared across sources that run
//! concurrently, hence `&self` and `Send + Sync`.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, trace};

use crate::error::SinkError;
use crate::tar_stream::{EntryHeader, EntryKind};

pub trait EntrySink: Send + Sync {
    fn consume(&self, source: &str, header: &EntryHeader, body: &mut dyn Read) -> Result<(), SinkError>;
}

impl<T: EntrySink + ?Sized> EntrySink for &T {
    fn consume(&self, source: &str, header: &EntryHeader, body: &mut dyn Read) -> Result<(), SinkError> {
        (**self).consume(source, header, body)
    }
}

impl<T: EntrySink + ?Sized> EntrySink for Arc<T> {
    fn consume(&self, source: &str, header: &EntryHeader, body: &mut dyn Read) -> Result<(), SinkError> {
        (**self).consume(source, header, body)
    }
}

impl<T: EntrySink + ?Sized> EntrySink for Box<T> {
    fn consume(&self, source: &str, header: &EntryHeader, body: &mut dyn Read) -> Result<(), SinkError> {
        (**self).consume(source, header, body)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panicking sink thread leaves the data itself intact
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── DiscardSink ──────────────────────────────────────────────────────────────

/// Accepts every entry and keeps nothing.  Bodies are skipped by the caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl EntrySink for DiscardSink {
    fn consume(&self, _source: &str, _header: &EntryHeader, _body: &mut dyn Read) -> Result<(), SinkError> {
        Ok(())
    }
}

// ── MemorySink ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedEntry {
    pub source: String,
    pub header: EntryHeader,
    pub data:   Vec<u8>,
}

/// Collects every entry, body included, in arrival order.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<CapturedEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of what has been captured so far.
    pub fn entries(&self) -> Vec<CapturedEntry> {
        lock(&self.entries).clone()
    }

    pub fn into_entries(self) -> Vec<CapturedEntry> {
        self.entries.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bodies of all regular files from `source`, concatenated in order.
    pub fn concatenated(&self, source: &str) -> Vec<u8> {
        lock(&self.entries)
            .iter()
            .filter(|e| e.source == source && e.header.kind == EntryKind::Regular)
            .flat_map(|e| e.data.iter().copied())
            .collect()
    }
}

impl EntrySink for MemorySink {
    fn consume(&self, source: &str, header: &EntryHeader, body: &mut dyn Read) -> Result<(), SinkError> {
        let mut data = Vec::with_capacity(header.size.min(1 << 20) as usize);
        body.read_to_end(&mut data)?;
        lock(&self.entries).push(CapturedEntry {
            source: source.to_owned(),
            header: header.clone(),
            data,
        });
        Ok(())
    }
}

// ── DigestSink ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryDigest {
    pub source: String,
    pub name:   String,
    pub kind:   EntryKind,
    pub size:   u64,
    #[serde(serialize_with = "as_hex")]
    pub blake3: [u8; 32],
}

impl EntryDigest {
    pub fn hex(&self) -> String {
        hex::encode(self.blake3)
    }
}

fn as_hex<S: serde::Serializer>(digest: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(digest))
}

/// Streams every body through BLAKE3 and records one digest per entry.
/// Nothing is written anywhere.
#[derive(Debug, Default)]
pub struct DigestSink {
    digests: Mutex<Vec<EntryDigest>>,
}

impl DigestSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn digests(&self) -> Vec<EntryDigest> {
        lock(&self.digests).clone()
    }

    pub fn into_digests(self) -> Vec<EntryDigest> {
        self.digests.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EntrySink for DigestSink {
    fn consume(&self, source: &str, header: &EntryHeader, body: &mut dyn Read) -> Result<(), SinkError> {
        let mut hasher = blake3::Hasher::new();
        let size = io::copy(body, &mut hasher)?;
        lock(&self.digests).push(EntryDigest {
            source: source.to_owned(),
            name:   header.name.clone(),
            kind:   header.kind,
            size,
            blake3: *hasher.finalize().as_bytes(),
        });
        Ok(())
    }
}

// ── DirectorySink ────────────────────────────────────────────────────────────

/// Restores entries below a root directory.
///
/// Entry names are resolved relative to the root.  Absolute names and names
/// with `..` components are refused with [`SinkError::UnsafePath`], as are
/// symlinks whose target would leave the root and entries whose path passes
/// through a symlink already on disk.  Entry kinds other than
/// files, directories and links are skipped.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    /// The root is created on first use if it does not exist.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, SinkError> {
        let rel = sanitize(name)?;
        if rel.as_os_str().is_empty() {
            return Err(SinkError::UnsafePath(name.to_owned()));
        }
        self.refuse_symlinked_parents(name, &rel, false)?;
        Ok(self.root.join(rel))
    }

    /// Refuse a path whose existing components below the root include a
    /// symlink.  A link restored earlier in the archive would otherwise
    /// redirect later entries out of the root.  The last component is
    /// checked only when `include_last` is set.
    fn refuse_symlinked_parents(&self, name: &str, rel: &Path, include_last: bool) -> Result<(), SinkError> {
        let mut components = rel.components().peekable();
        let mut path = self.root.clone();
        while let Some(c) = components.next() {
            if components.peek().is_none() && !include_last {
                break;
            }
            path.push(c);
            match fs::symlink_metadata(&path) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    debug!(entry = name, link = %path.display(), "entry path runs through a symlink");
                    return Err(SinkError::UnsafePath(name.to_owned()));
                }
                Ok(_) => {}
                // nothing below here exists yet, so nothing can be a link
                Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn ensure_parent(path: &Path) -> io::Result<()> {
        match path.parent() {
            Some(parent) => fs::create_dir_all(parent),
            None => Ok(()),
        }
    }

    fn write_file(&self, path: &Path, header: &EntryHeader, body: &mut dyn Read) -> Result<(), SinkError> {
        Self::ensure_parent(path)?;
        // a stale symlink must not redirect the write
        if fs::symlink_metadata(path).map(|m| m.file_type().is_symlink()).unwrap_or(false) {
            fs::remove_file(path)?;
        }
        let mut f = File::create(path)?;
        io::copy(body, &mut f)?;
        set_mode(path, header.mode)?;
        Ok(())
    }

    fn link(&self, path: &Path, header: &EntryHeader) -> Result<(), SinkError> {
        let target = header
            .link_name
            .as_deref()
            .ok_or_else(|| SinkError::Rejected(format!("link '{}' has no target", header.name)))?;
        Self::ensure_parent(path)?;
        if fs::symlink_metadata(path).is_ok() {
            fs::remove_file(path)?;
        }
        if header.kind == EntryKind::Hardlink {
            let original = self.resolve(target)?;
            fs::hard_link(original, path)?;
            return Ok(());
        }
        check_symlink_target(&header.name, target)?;
        symlink(target, path)?;
        Ok(())
    }
}

impl EntrySink for DirectorySink {
    fn consume(&self, source: &str, header: &EntryHeader, body: &mut dyn Read) -> Result<(), SinkError> {
        let rel = sanitize(&header.name)?;
        if rel.as_os_str().is_empty() {
            // "./" names the root itself
            return match header.kind {
                EntryKind::Directory => Ok(()),
                _ => Err(SinkError::UnsafePath(header.name.clone())),
            };
        }
        self.refuse_symlinked_parents(&header.name, &rel, header.kind == EntryKind::Directory)?;
        let path = self.root.join(rel);
        trace!(source, entry = %header.name, kind = ?header.kind, "restoring");

        match header.kind {
            EntryKind::Directory => {
                fs::create_dir_all(&path)?;
                set_mode(&path, header.mode)?;
            }
            EntryKind::Regular => self.write_file(&path, header, body)?,
            EntryKind::Symlink | EntryKind::Hardlink => self.link(&path, header)?,
            EntryKind::Other(flag) => {
                debug!(source, entry = %header.name, flag, "skipping unsupported entry type");
            }
        }
        Ok(())
    }
}

/// Turn an archive name into a relative path with only normal components.
fn sanitize(name: &str) -> Result<PathBuf, SinkError> {
    let mut out = PathBuf::new();
    for c in Path::new(name).components() {
        match c {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SinkError::UnsafePath(name.to_owned()));
            }
        }
    }
    Ok(out)
}

/// Relative targets only, and never above the root once resolved against
/// the link's own directory.
fn check_symlink_target(name: &str, target: &str) -> Result<(), SinkError> {
    let target_path = Path::new(target);
    if target_path.is_absolute() {
        return Err(SinkError::UnsafePath(format!("{name} -> {target}")));
    }
    let mut depth = sanitize(name)?.components().count().saturating_sub(1) as isize;
    for c in target_path.components() {
        match c {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => depth -= 1,
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => depth = -1,
        }
        if depth < 0 {
            return Err(SinkError::UnsafePath(format!("{name} -> {target}")));
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn symlink(target: &str, path: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, path)
}

#[cfg(not(unix))]
fn symlink(_target: &str, path: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("symlinks are not supported here: {}", path.display()),
    ))
}
