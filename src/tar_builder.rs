//! Reproducible tar construction for application layers
//!
//! Given an ordered list of [`LayerEntry`] values this produces a
//! deterministic POSIX tar stream: same entries in, same bytes out, on any
//! machine. Parent directories are synthesised exactly once, header fields
//! that normally drift (uname, gname, device numbers, uid/gid) are pinned,
//! and paths longer than the classic 100-byte name field fall back to PAX
//! extended headers.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tar::{EntryType, Header};

use crate::blob::{self, Blob};
use crate::digest::Digest;
use crate::error::{BuildError, Result};

/// Default permissions for regular files without an explicit override.
pub const DEFAULT_FILE_MODE: u32 = 0o644;
/// Default permissions for directories without an explicit override.
pub const DEFAULT_DIRECTORY_MODE: u32 = 0o755;

/// Default entry modification time: one second past the epoch, so consumers
/// that treat pre-epoch timestamps as invalid stay happy.
pub fn default_modification_time() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1)
}

/// Numeric owner for a tar entry, parsed from `"uid:gid"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub uid: u64,
    pub gid: u64,
}

impl Ownership {
    pub fn parse(s: &str) -> Result<Self> {
        let (uid, gid) = s.split_once(':').ok_or_else(|| {
            BuildError::InvalidConfiguration(format!("ownership '{}' is not 'uid:gid'", s))
        })?;
        let parse = |part: &str| {
            part.parse::<u64>().map_err(|_| {
                BuildError::InvalidConfiguration(format!(
                    "ownership '{}' has a non-numeric component",
                    s
                ))
            })
        };
        Ok(Ownership {
            uid: parse(uid)?,
            gid: parse(gid)?,
        })
    }
}

/// One file or directory to place into a layer.
#[derive(Debug, Clone)]
pub struct LayerEntry {
    /// Local file or directory providing the content.
    pub source_path: PathBuf,
    /// Absolute POSIX path inside the container.
    pub container_path: String,
    /// Explicit permissions; `None` means 0644 for files, 0755 for
    /// directories, decided at archive time.
    pub mode: Option<u32>,
    /// Timestamp recorded in the tar header.
    pub modification_time: SystemTime,
    /// Entry owner; `None` means uid 0, gid 0.
    pub ownership: Option<Ownership>,
}

impl LayerEntry {
    pub fn new(source_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            container_path: container_path.into(),
            mode: None,
            modification_time: default_modification_time(),
            ownership: None,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_modification_time(mut self, mtime: SystemTime) -> Self {
        self.modification_time = mtime;
        self
    }

    pub fn with_ownership(mut self, ownership: Ownership) -> Self {
        self.ownership = Some(ownership);
        self
    }

    fn validate(&self) -> Result<()> {
        if !self.container_path.starts_with('/') {
            return Err(BuildError::InvalidConfiguration(format!(
                "container path '{}' must be absolute",
                self.container_path
            )));
        }
        if self
            .container_path
            .split('/')
            .any(|segment| segment == "..")
        {
            return Err(BuildError::InvalidConfiguration(format!(
                "container path '{}' must not contain '..'",
                self.container_path
            )));
        }
        Ok(())
    }
}

/// Canonical encoding of one entry for selector computation. Source file
/// size and mtime are part of the key so edited content misses the cache.
#[derive(Serialize)]
struct EntryTemplate {
    source_path: String,
    container_path: String,
    mode: u32,
    modification_time: (u64, u32),
    ownership: String,
    source_size: u64,
    source_modification_time: (u64, u32),
}

fn epoch_pair(time: SystemTime) -> (u64, u32) {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs(), d.subsec_nanos()),
        Err(_) => (0, 0),
    }
}

fn epoch_seconds(time: SystemTime) -> u64 {
    epoch_pair(time).0
}

/// Builds the `(uncompressed, compressed)` blob pair for one application
/// layer out of an ordered entry list.
pub struct TarLayerBuilder {
    entries: Vec<LayerEntry>,
}

impl TarLayerBuilder {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, entry: LayerEntry) -> &mut Self {
        self.entries.push(entry);
        self
    }

    pub fn add_entries(&mut self, entries: impl IntoIterator<Item = LayerEntry>) -> &mut Self {
        self.entries.extend(entries);
        self
    }

    pub fn entries(&self) -> &[LayerEntry] {
        &self.entries
    }

    /// Digest of the canonical encoding of the entry list, including the
    /// current size and mtime of each source. Same inputs, same selector.
    pub fn selector(&self) -> Result<Digest> {
        let mut templates = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            entry.validate()?;
            let metadata = std::fs::metadata(&entry.source_path).map_err(|e| {
                BuildError::InvalidConfiguration(format!(
                    "layer entry source '{}' is not readable: {}",
                    entry.source_path.display(),
                    e
                ))
            })?;
            let mode = entry.mode.unwrap_or(if metadata.is_dir() {
                DEFAULT_DIRECTORY_MODE
            } else {
                DEFAULT_FILE_MODE
            });
            templates.push(EntryTemplate {
                source_path: entry.source_path.to_string_lossy().into_owned(),
                container_path: entry.container_path.clone(),
                mode,
                modification_time: epoch_pair(entry.modification_time),
                ownership: entry
                    .ownership
                    .map(|o| format!("{}:{}", o.uid, o.gid))
                    .unwrap_or_default(),
                source_size: if metadata.is_dir() { 0 } else { metadata.len() },
                source_modification_time: metadata
                    .modified()
                    .map(epoch_pair)
                    .unwrap_or((0, 0)),
            });
        }
        Digest::of_json(&templates)
    }

    /// The raw tar stream as a blob, for diff-id computation and archiving.
    pub fn to_blob(&self) -> Arc<dyn Blob> {
        let entries = self.entries.clone();
        blob::from_writer(move |out| write_layer_tar(&entries, out))
    }

    /// The gzip-compressed tar stream, for storage and push.
    pub fn to_compressed_blob(&self) -> Arc<dyn Blob> {
        blob::compress(self.to_blob())
    }
}

impl Default for TarLayerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Directory metadata accumulated across the whole entry list before
/// anything is emitted: a directory's mtime is the maximum over the entries
/// that need it, and an explicit directory entry may override mode/owner.
struct DirectoryPlan {
    mtime: SystemTime,
    mode: u32,
    ownership: Option<Ownership>,
}

fn write_layer_tar(entries: &[LayerEntry], out: &mut dyn Write) -> Result<()> {
    for entry in entries {
        entry.validate()?;
    }

    // First pass: plan every directory that will appear in the archive.
    let mut directories: BTreeMap<String, DirectoryPlan> = BTreeMap::new();

    for entry in entries {
        for ancestor in ancestor_directories(&entry.container_path) {
            require_directory(&mut directories, &ancestor, entry.modification_time);
        }
        let metadata = source_metadata(entry)?;
        if metadata.is_dir() {
            require_directory(&mut directories, &entry.container_path, entry.modification_time);
            let plan = directories
                .get_mut(&entry.container_path)
                .expect("directory was just required");
            if let Some(mode) = entry.mode {
                plan.mode = mode;
            }
            plan.ownership = entry.ownership;
        }
    }

    // Second pass: emit in input order, parents before children, each
    // directory exactly once.
    let mut builder = tar::Builder::new(out);
    let mut emitted: HashSet<String> = HashSet::new();

    for entry in entries {
        for ancestor in ancestor_directories(&entry.container_path) {
            emit_directory(&mut builder, &directories, &mut emitted, &ancestor)?;
        }

        let metadata = source_metadata(entry)?;
        if metadata.is_dir() {
            emit_directory(&mut builder, &directories, &mut emitted, &entry.container_path)?;
        } else {
            let mode = entry.mode.unwrap_or(DEFAULT_FILE_MODE);
            let mut header = Header::new_ustar();
            header.set_entry_type(EntryType::Regular);
            header.set_size(metadata.len());
            header.set_mode(mode);
            header.set_mtime(epoch_seconds(entry.modification_time));
            set_ownership(&mut header, entry.ownership);
            let archive_path = archive_path(&entry.container_path, false);
            let mut file = File::open(&entry.source_path)?;
            append_with_path(&mut builder, header, &archive_path, &mut file)?;
        }
    }

    let out = builder.into_inner()?;
    out.flush()?;
    Ok(())
}

fn require_directory(
    directories: &mut BTreeMap<String, DirectoryPlan>,
    path: &str,
    mtime: SystemTime,
) {
    let plan = directories.entry(path.to_string()).or_insert(DirectoryPlan {
        mtime,
        mode: DEFAULT_DIRECTORY_MODE,
        ownership: None,
    });
    if mtime > plan.mtime {
        plan.mtime = mtime;
    }
}

fn source_metadata(entry: &LayerEntry) -> Result<std::fs::Metadata> {
    let metadata = std::fs::metadata(&entry.source_path).map_err(|e| {
        BuildError::InvalidConfiguration(format!(
            "layer entry source '{}' is not readable: {}",
            entry.source_path.display(),
            e
        ))
    })?;
    if !metadata.is_dir() && !metadata.is_file() {
        return Err(BuildError::InvalidConfiguration(format!(
            "layer entry source '{}' is neither a regular file nor a directory",
            entry.source_path.display()
        )));
    }
    Ok(metadata)
}

fn emit_directory<W: Write>(
    builder: &mut tar::Builder<W>,
    directories: &BTreeMap<String, DirectoryPlan>,
    emitted: &mut HashSet<String>,
    path: &str,
) -> Result<()> {
    if !emitted.insert(path.to_string()) {
        return Ok(());
    }
    let plan = &directories[path];
    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    header.set_mode(plan.mode);
    header.set_mtime(epoch_seconds(plan.mtime));
    set_ownership(&mut header, plan.ownership);
    let archive_path = archive_path(path, true);
    append_with_path(builder, header, &archive_path, &mut std::io::empty())?;
    Ok(())
}

fn set_ownership(header: &mut Header, ownership: Option<Ownership>) {
    let Ownership { uid, gid } = ownership.unwrap_or(Ownership { uid: 0, gid: 0 });
    header.set_uid(uid);
    header.set_gid(gid);
    let _ = header.set_username("");
    let _ = header.set_groupname("");
}

/// Append one entry, switching to a PAX extended header when the archive
/// path exceeds the classic 100-byte name field.
fn append_with_path<W: Write, R: std::io::Read>(
    builder: &mut tar::Builder<W>,
    mut header: Header,
    archive_path: &str,
    data: &mut R,
) -> Result<()> {
    if archive_path.len() > 100 {
        builder.append_pax_extensions([("path", archive_path.as_bytes())])?;
        let placeholder = truncated_name(archive_path);
        header.set_path(&placeholder)?;
        header.set_cksum();
        builder.append(&header, data)?;
    } else {
        header.set_path(archive_path)?;
        header.set_cksum();
        builder.append(&header, data)?;
    }
    Ok(())
}

/// Keep the first 100 bytes of the path for the classic header; the PAX
/// `path` record carries the real name.
fn truncated_name(path: &str) -> String {
    let mut end = 100;
    while !path.is_char_boundary(end) {
        end -= 1;
    }
    path[..end].to_string()
}

/// Proper ancestors of an absolute container path, root first, excluding `/`.
fn ancestor_directories(container_path: &str) -> Vec<String> {
    let mut ancestors = Vec::new();
    let segments: Vec<&str> = container_path
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    let mut current = String::new();
    for segment in segments.iter().take(segments.len().saturating_sub(1)) {
        current.push('/');
        current.push_str(segment);
        ancestors.push(current.clone());
    }
    ancestors
}

/// Archive member names are relative: `/app/x` is stored as `app/x`, and
/// directories carry a trailing slash.
fn archive_path(container_path: &str, directory: bool) -> String {
    let trimmed = container_path.trim_start_matches('/');
    if directory {
        format!("{}/", trimmed)
    } else {
        trimmed.to_string()
    }
}
