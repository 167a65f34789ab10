//! Filesystem operations on a board.

use mpsh_proto::{Literal, ops};

use crate::device::{Device, RemoteCall};
use crate::{Error, Result};

/// `S_IFDIR` bit of a stat mode.
const MODE_DIR: i64 = 0x4000;

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// A regular file.
    File,
    /// A directory.
    Dir,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Base name.
    pub name: String,
    /// File or directory.
    pub kind: EntryKind,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Modification time, unix seconds.
    pub mtime: i64,
}

impl FileEntry {
    /// Returns `true` for directories.
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }

    /// Builds an entry from a stat tuple `(mode, ino, dev, nlink, uid, gid,
    /// size, atime, mtime, ctime)`.
    fn from_stat(name: String, stat: &Literal) -> Option<Self> {
        let fields = stat.as_seq()?;
        let int = |i: usize| fields.get(i).and_then(Literal::as_int);
        let mode = int(0)?;
        Some(Self {
            name,
            kind: if mode & MODE_DIR != 0 {
                EntryKind::Dir
            } else {
                EntryKind::File
            },
            size: u64::try_from(int(6).unwrap_or(0)).unwrap_or(0),
            mtime: int(8).unwrap_or(0),
        })
    }
}

fn base_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

fn check(reply: Option<Literal>, what: impl FnOnce() -> String) -> Result<()> {
    match reply.and_then(|v| v.as_bool()) {
        Some(true) => Ok(()),
        _ => Err(Error::Remote(what())),
    }
}

impl Device {
    /// Lists `dir`, or returns `None` if it does not exist.
    pub fn list_dir(&self, dir: &str) -> Result<Option<Vec<FileEntry>>> {
        let Some(listing) = self.remote_eval(RemoteCall::new(&ops::LISTDIR_STAT).arg(dir))? else {
            return Ok(None);
        };
        let entries = listing
            .as_seq()
            .unwrap_or_default()
            .iter()
            .filter_map(|item| match item.as_seq()? {
                [name, stat] => FileEntry::from_stat(name.as_str()?.to_owned(), stat),
                _ => None,
            })
            .collect();
        Ok(Some(entries))
    }

    /// Stats `path`, or returns `None` if it does not exist.
    pub fn stat(&self, path: &str) -> Result<Option<FileEntry>> {
        let reply = self.remote_eval(RemoteCall::new(&ops::GET_STAT).arg(path))?;
        Ok(reply.and_then(|stat| FileEntry::from_stat(base_name(path).to_owned(), &stat)))
    }

    /// Creates directory `path`.
    pub fn make_dir(&self, path: &str) -> Result<()> {
        let reply = self.remote_eval(RemoteCall::new(&ops::MAKE_DIRECTORY).arg(path))?;
        check(reply, || format!("unable to create {path}"))
    }

    /// Removes `path`; directories need `recursive` unless empty. With
    /// `force`, failures are ignored.
    pub fn remove(&self, path: &str, recursive: bool, force: bool) -> Result<()> {
        let reply = self.remote_eval(
            RemoteCall::new(&ops::REMOVE_FILE)
                .arg(path)
                .kwarg("recursive", recursive)
                .kwarg("force", force),
        )?;
        check(reply, || format!("unable to remove {path}"))
    }

    /// Downloads a file, one acknowledged frame at a time.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let entry = self
            .stat(path)?
            .filter(|e| !e.is_dir())
            .ok_or_else(|| Error::Remote(format!("{path}: no such file")))?;
        let size = usize::try_from(entry.size).unwrap_or(usize::MAX);
        let codec = self.codec();
        let mut data = Vec::with_capacity(size);

        let reply = self.remote_eval(
            RemoteCall::new(&ops::SEND_FILE_TO_HOST)
                .arg(path)
                .arg(Literal::None)
                .arg(size)
                .side_channel(|ch| {
                    let mut remaining = codec.wire_len(size);
                    while remaining > 0 {
                        let n = codec.next_frame_len(remaining);
                        let frame = ch.read(n)?;
                        data.extend(codec.decode(&frame)?);
                        ch.ack()?;
                        remaining -= n;
                    }
                    Ok(())
                }),
        )?;
        check(reply, || format!("unable to read {path}"))?;
        tracing::debug!(path, bytes = data.len(), binary = codec.is_binary(), "downloaded");
        Ok(data)
    }

    /// Uploads `data` to `path`, replacing any existing file.
    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let codec = self.codec();
        let reply = self.remote_eval(
            RemoteCall::new(&ops::RECV_FILE_FROM_HOST)
                .arg(Literal::None)
                .arg(path)
                .arg(data.len())
                .side_channel(|ch| {
                    for frame in codec.frames(data) {
                        ch.wait_ack()?;
                        ch.write(&frame)?;
                    }
                    Ok(())
                }),
        )?;
        check(reply, || format!("unable to write {path}"))?;
        tracing::debug!(path, bytes = data.len(), binary = codec.is_binary(), "uploaded");
        Ok(())
    }
}
