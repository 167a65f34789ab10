//! rsync-style tree synchronization.
//!
//! [`sync`] first walks both trees and builds the whole plan, then executes
//! it in order unless asked for a dry run. Either side may be the host
//! filesystem ([`LocalTree`]) or a board ([`RemoteTree`]).
//!
//! A file is copied when its size or modification time differs. Copies
//! onto the host keep the source time; a board cannot set file times, so
//! files copied onto a board count as changed on the next run.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::config::{BoardConfig, ConfigError};
use crate::device::Device;
use crate::files::{EntryKind, FileEntry};
use crate::{Error, Result};

/// Listing, copy and removal primitives over one filesystem.
pub trait FileTree {
    /// Entries of `dir`, or `None` if it does not exist.
    fn list(&self, dir: &str) -> Result<Option<Vec<FileEntry>>>;

    /// Contents of file `path`.
    fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Creates or replaces file `path`.
    fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Creates directory `path`.
    fn make_dir(&self, path: &str) -> Result<()>;

    /// Removes `path`, directories recursively.
    fn remove(&self, path: &str, kind: EntryKind) -> Result<()>;

    /// Sets the modification time of file `path`, in unix seconds. Trees
    /// without settable times ignore it.
    fn set_mtime(&self, _path: &str, _mtime: i64) -> Result<()> {
        Ok(())
    }
}

/// Joins a directory and an entry name with `/`.
pub fn join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// The host filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTree;

impl FileTree for LocalTree {
    fn list(&self, dir: &str) -> Result<Option<Vec<FileEntry>>> {
        let iter = match fs::read_dir(dir) {
            Ok(iter) => iter,
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory) => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for item in iter {
            let item = item?;
            // Follows symlinks; dangling ones are skipped.
            let Ok(meta) = fs::metadata(item.path()) else {
                continue;
            };
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX));
            entries.push(FileEntry {
                name: item.file_name().to_string_lossy().into_owned(),
                kind: if meta.is_dir() {
                    EntryKind::Dir
                } else {
                    EntryKind::File
                },
                size: if meta.is_dir() { 0 } else { meta.len() },
                mtime,
            });
        }
        Ok(Some(entries))
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        Ok(fs::read(path)?)
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        Ok(fs::write(path, data)?)
    }

    fn make_dir(&self, path: &str) -> Result<()> {
        Ok(fs::create_dir(path)?)
    }

    fn remove(&self, path: &str, kind: EntryKind) -> Result<()> {
        match kind {
            EntryKind::Dir => fs::remove_dir_all(Path::new(path))?,
            EntryKind::File => fs::remove_file(Path::new(path))?,
        }
        Ok(())
    }

    fn set_mtime(&self, path: &str, mtime: i64) -> Result<()> {
        let Ok(secs) = u64::try_from(mtime) else {
            return Ok(());
        };
        let file = fs::File::options().write(true).open(path)?;
        file.set_modified(UNIX_EPOCH + Duration::from_secs(secs))?;
        Ok(())
    }
}

/// The filesystem of a board.
#[derive(Debug, Clone, Copy)]
pub struct RemoteTree<'a> {
    device: &'a Device,
}

impl<'a> RemoteTree<'a> {
    /// Wraps `device`.
    pub const fn new(device: &'a Device) -> Self {
        Self { device }
    }
}

impl FileTree for RemoteTree<'_> {
    fn list(&self, dir: &str) -> Result<Option<Vec<FileEntry>>> {
        self.device.list_dir(dir)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.device.read_file(path)
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.device.write_file(path, data)
    }

    fn make_dir(&self, path: &str) -> Result<()> {
        self.device.make_dir(path)
    }

    fn remove(&self, path: &str, kind: EntryKind) -> Result<()> {
        self.device.remove(path, kind == EntryKind::Dir, false)
    }
}

/// Decides which entry names take part in a sync.
///
/// Excluded names are never copied nor deleted. When include patterns are
/// given, only files matching one of them take part; directories are only
/// subject to the exclude patterns.
#[derive(Debug, Clone, Default)]
pub struct NameFilter {
    includes: Option<GlobSet>,
    excludes: Option<GlobSet>,
}

fn glob_set(option: &str, patterns: &str) -> std::result::Result<Option<GlobSet>, ConfigError> {
    let patterns: Vec<&str> = patterns
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if patterns.is_empty() {
        return Ok(None);
    }
    let invalid = |source| ConfigError::Pattern {
        option: option.to_owned(),
        source,
    };
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        builder.add(Glob::new(p).map_err(invalid)?);
    }
    builder.build().map(Some).map_err(invalid)
}

impl NameFilter {
    /// Builds a filter from comma-separated glob lists.
    pub fn new(includes: &str, excludes: &str) -> std::result::Result<Self, ConfigError> {
        Ok(Self {
            includes: glob_set("rsync_includes", includes)?,
            excludes: glob_set("rsync_excludes", excludes)?,
        })
    }

    /// Reads `rsync_includes` and `rsync_excludes` for `board`.
    pub fn from_config(config: &dyn BoardConfig, board: &str) -> std::result::Result<Self, ConfigError> {
        let list = |option| match config.get(board, option) {
            Some(serde_json::Value::String(s)) => s,
            _ => String::new(),
        };
        Self::new(&list("rsync_includes"), &list("rsync_excludes"))
    }

    /// Returns `true` if an entry called `name` takes part.
    pub fn allows(&self, name: &str, kind: EntryKind) -> bool {
        if self.excludes.as_ref().is_some_and(|set| set.is_match(name)) {
            return false;
        }
        match (&self.includes, kind) {
            (Some(set), EntryKind::File) => set.is_match(name),
            _ => true,
        }
    }
}

/// How to synchronize.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Delete destination entries missing from the source.
    pub mirror: bool,
    /// Only report the plan.
    pub dry_run: bool,
    /// Entry names taking part.
    pub filter: NameFilter,
}

/// One step of a sync plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Copy a file, replacing the destination.
    Copy {
        /// Source path.
        src: String,
        /// Destination path.
        dst: String,
    },
    /// Create a destination directory.
    MakeDir {
        /// Directory path.
        path: String,
    },
    /// Remove a destination entry, directories with their contents.
    Delete {
        /// Entry path.
        path: String,
        /// What is removed.
        kind: EntryKind,
    },
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Copy { src, dst } => write!(f, "copy {src} -> {dst}"),
            Self::MakeDir { path } => write!(f, "mkdir {path}"),
            Self::Delete { path, .. } => write!(f, "delete {path}"),
        }
    }
}

/// A plan entry that could not be carried out.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{action}: {reason}")]
pub struct SyncItemError {
    /// The failed step.
    pub action: Action,
    /// What went wrong.
    pub reason: String,
}

/// Outcome of a sync.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Planned steps in execution order.
    pub actions: Vec<Action>,
    /// Steps that failed or could not be planned.
    pub errors: Vec<SyncItemError>,
    /// Nothing was executed.
    pub dry_run: bool,
}

impl SyncReport {
    /// Returns `true` if no step failed.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

struct Planner<'a> {
    src: &'a dyn FileTree,
    dst: &'a dyn FileTree,
    opts: &'a SyncOptions,
    actions: Vec<Action>,
    errors: Vec<SyncItemError>,
    /// Source modification time of each copy, by destination path.
    mtimes: BTreeMap<String, i64>,
}

fn by_name(entries: Vec<FileEntry>) -> BTreeMap<String, FileEntry> {
    entries.into_iter().map(|e| (e.name.clone(), e)).collect()
}

impl Planner<'_> {
    fn allowed(&self, entries: Option<Vec<FileEntry>>) -> BTreeMap<String, FileEntry> {
        let mut entries = by_name(entries.unwrap_or_default());
        entries.retain(|name, e| self.opts.filter.allows(name, e.kind));
        entries
    }

    /// Plans one directory level; `dst_exists` is false for directories the
    /// plan itself creates.
    fn walk(&mut self, src_dir: &str, dst_dir: &str, dst_exists: bool) -> Result<()> {
        let src_entries = self.allowed(self.src.list(src_dir)?);
        let dst_entries = if dst_exists {
            self.allowed(self.dst.list(dst_dir)?)
        } else {
            BTreeMap::new()
        };

        // Source entries missing at the destination.
        for (name, entry) in &src_entries {
            if dst_entries.contains_key(name) {
                continue;
            }
            self.create(entry, &join(src_dir, name), &join(dst_dir, name))?;
        }

        // Entries on both sides.
        for (name, entry) in &src_entries {
            let Some(other) = dst_entries.get(name) else {
                continue;
            };
            let (src, dst) = (join(src_dir, name), join(dst_dir, name));
            match (entry.kind, other.kind) {
                (EntryKind::Dir, EntryKind::Dir) => self.walk(&src, &dst, true)?,
                (EntryKind::File, EntryKind::File) => {
                    if entry.size != other.size || entry.mtime != other.mtime {
                        self.copy(entry, src, dst);
                    }
                }
                _ if self.opts.mirror => {
                    self.actions.push(Action::Delete {
                        path: dst.clone(),
                        kind: other.kind,
                    });
                    self.create(entry, &src, &dst)?;
                }
                _ => {
                    let action = match entry.kind {
                        EntryKind::Dir => Action::MakeDir { path: dst },
                        EntryKind::File => Action::Copy { src, dst },
                    };
                    self.errors.push(SyncItemError {
                        action,
                        reason: "destination exists with a different type".into(),
                    });
                }
            }
        }

        if self.opts.mirror {
            for (name, entry) in &dst_entries {
                if !src_entries.contains_key(name) {
                    self.actions.push(Action::Delete {
                        path: join(dst_dir, name),
                        kind: entry.kind,
                    });
                }
            }
        }
        Ok(())
    }

    fn create(&mut self, entry: &FileEntry, src: &str, dst: &str) -> Result<()> {
        match entry.kind {
            EntryKind::Dir => {
                self.actions.push(Action::MakeDir {
                    path: dst.to_owned(),
                });
                self.walk(src, dst, false)
            }
            EntryKind::File => {
                self.copy(entry, src.to_owned(), dst.to_owned());
                Ok(())
            }
        }
    }

    fn copy(&mut self, entry: &FileEntry, src: String, dst: String) {
        self.mtimes.insert(dst.clone(), entry.mtime);
        self.actions.push(Action::Copy { src, dst });
    }
}

/// Computes the steps that make `dst_root` match `src_root`.
///
/// Entries conflicting by type (a file against a directory) cannot be
/// reconciled without mirroring; they are reported instead of planned.
pub fn plan(
    src: &dyn FileTree,
    src_root: &str,
    dst: &dyn FileTree,
    dst_root: &str,
    opts: &SyncOptions,
) -> Result<(Vec<Action>, Vec<SyncItemError>)> {
    let planner = build(src, src_root, dst, dst_root, opts)?;
    Ok((planner.actions, planner.errors))
}

fn build<'a>(
    src: &'a dyn FileTree,
    src_root: &str,
    dst: &'a dyn FileTree,
    dst_root: &str,
    opts: &'a SyncOptions,
) -> Result<Planner<'a>> {
    if src.list(src_root)?.is_none() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{src_root}: no such directory"),
        )));
    }
    let mut planner = Planner {
        src,
        dst,
        opts,
        actions: Vec::new(),
        errors: Vec::new(),
        mtimes: BTreeMap::new(),
    };
    let dst_exists = dst.list(dst_root)?.is_some();
    if !dst_exists {
        planner.actions.push(Action::MakeDir {
            path: dst_root.to_owned(),
        });
    }
    planner.walk(src_root, dst_root, dst_exists)?;
    Ok(planner)
}

fn execute(
    src: &dyn FileTree,
    dst: &dyn FileTree,
    action: &Action,
    mtimes: &BTreeMap<String, i64>,
) -> Result<()> {
    match action {
        Action::Copy { src: from, dst: to } => {
            dst.write(to, &src.read(from)?)?;
            match mtimes.get(to) {
                Some(&mtime) => dst.set_mtime(to, mtime),
                None => Ok(()),
            }
        }
        Action::MakeDir { path } => dst.make_dir(path),
        Action::Delete { path, kind } => dst.remove(path, *kind),
    }
}

/// Makes `dst_root` match `src_root`.
///
/// Listing failures abort the sync. A failing step is recorded in the
/// report and the remaining steps still run.
pub fn sync(
    src: &dyn FileTree,
    src_root: &str,
    dst: &dyn FileTree,
    dst_root: &str,
    opts: &SyncOptions,
) -> Result<SyncReport> {
    let Planner {
        actions,
        mut errors,
        mtimes,
        ..
    } = build(src, src_root, dst, dst_root, opts)?;
    tracing::debug!(steps = actions.len(), mirror = opts.mirror, dry_run = opts.dry_run, "sync plan");
    if !opts.dry_run {
        for action in &actions {
            tracing::info!("{action}");
            if let Err(e) = execute(src, dst, action, &mtimes) {
                tracing::warn!("{action} failed: {e}");
                errors.push(SyncItemError {
                    action: action.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }
    Ok(SyncReport {
        actions,
        errors,
        dry_run: opts.dry_run,
    })
}
