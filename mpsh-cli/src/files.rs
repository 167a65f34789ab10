//! File commands: rsync, cp, ls, mkdir, rm.
//!
//! Paths under a root directory of the default board (`/flash/…`) or
//! prefixed with a board name (`/pyboard/flash/…`) are on that board;
//! anything else is a host path.

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result, bail, ensure};
use mpsh::{
    BoardConfig, Device, FileEntry, FileTree, LocalTree, NameFilter, RemoteTree, SyncOptions, join,
};

use crate::Session;

/// Arguments for `mpsh rsync`.
#[derive(clap::Args)]
pub struct RsyncArgs {
    /// Delete destination entries missing from the source.
    #[arg(short = 'm', long)]
    pub mirror: bool,

    /// Show what would be done without doing it.
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Source directory (default: config `host_dir`).
    pub src: Option<String>,

    /// Destination directory (default: config `remote_dir`).
    pub dst: Option<String>,
}

/// Arguments for `mpsh cp`.
#[derive(clap::Args)]
pub struct CpArgs {
    /// File to copy.
    pub src: String,

    /// Destination file or directory.
    pub dst: String,
}

/// Arguments for `mpsh ls`.
#[derive(clap::Args)]
pub struct LsArgs {
    /// Show sizes and modification times.
    #[arg(short = 'l', long)]
    pub long: bool,

    /// Show entries starting with a dot.
    #[arg(short = 'a', long)]
    pub all: bool,

    /// Directories to list (default: config `remote_dir`).
    pub paths: Vec<String>,
}

/// Arguments for `mpsh rm`.
#[derive(clap::Args)]
pub struct RmArgs {
    /// Remove directories and their contents.
    #[arg(short = 'r', long)]
    pub recursive: bool,

    /// Ignore missing paths and failures.
    #[arg(short = 'f', long)]
    pub force: bool,

    /// Paths to remove.
    #[arg(required = true, num_args = 1..)]
    pub paths: Vec<String>,
}

/// Runs `f` on the filesystem `dev` points at.
fn with_tree<T>(dev: Option<&Arc<Device>>, f: impl FnOnce(&dyn FileTree) -> T) -> T {
    match dev {
        Some(dev) => f(&RemoteTree::new(dev)),
        None => f(&LocalTree),
    }
}

fn describe(dev: Option<&Arc<Device>>, path: &str) -> String {
    match dev {
        Some(dev) => format!("{}:{path}", dev.name()),
        None => path.to_owned(),
    }
}

pub fn rsync(session: &Session, args: &RsyncArgs) -> Result<()> {
    let cfg: &dyn BoardConfig = session.config.as_ref();
    let id = session.board_id();
    let src = args
        .src
        .clone()
        .unwrap_or_else(|| cfg.get_str(&id, "host_dir", "."));
    let dst = args
        .dst
        .clone()
        .unwrap_or_else(|| cfg.get_str(&id, "remote_dir", "/flash"));
    let (src_dev, src_path) = session.registry.resolve_path(&src);
    let (dst_dev, dst_path) = session.registry.resolve_path(&dst);

    let filter_id = dst_dev
        .as_ref()
        .or(src_dev.as_ref())
        .map_or(id, |d| d.id().to_owned());
    let opts = SyncOptions {
        mirror: args.mirror,
        dry_run: args.dry_run,
        filter: NameFilter::from_config(cfg, &filter_id)?,
    };
    tracing::info!(
        "synchronizing {} --> {}",
        describe(src_dev.as_ref(), &src_path),
        describe(dst_dev.as_ref(), &dst_path)
    );

    let report = with_tree(src_dev.as_ref(), |s| {
        with_tree(dst_dev.as_ref(), |d| mpsh::sync(s, &src_path, d, &dst_path, &opts))
    })?;
    if report.dry_run {
        for action in &report.actions {
            println!("{action}");
        }
    }
    for e in &report.errors {
        eprintln!("{e}");
    }
    ensure!(
        report.is_success(),
        "{} of {} steps failed",
        report.errors.len(),
        report.actions.len()
    );
    Ok(())
}

fn base_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

pub fn cp(session: &Session, args: &CpArgs) -> Result<()> {
    let (src_dev, src_path) = session.registry.resolve_path(&args.src);
    let (dst_dev, dst_path) = session.registry.resolve_path(&args.dst);

    let data = with_tree(src_dev.as_ref(), |t| t.read(&src_path))
        .with_context(|| format!("reading {}", args.src))?;
    let target = match with_tree(dst_dev.as_ref(), |t| t.list(&dst_path))? {
        Some(_) => join(&dst_path, base_name(&src_path)),
        None => dst_path,
    };
    with_tree(dst_dev.as_ref(), |t| t.write(&target, &data))
        .with_context(|| format!("writing {}", describe(dst_dev.as_ref(), &target)))?;
    tracing::debug!(bytes = data.len(), "copied {} to {target}", args.src);
    Ok(())
}

fn format_entry(entry: &FileEntry, long: bool) -> String {
    let name = if entry.is_dir() {
        format!("{}/", entry.name)
    } else {
        entry.name.clone()
    };
    if !long {
        return name;
    }
    let mtime = chrono::DateTime::from_timestamp(entry.mtime, 0)
        .map(|t| t.format("%b %e %H:%M %Y").to_string())
        .unwrap_or_default();
    format!("{:>8} {mtime:>17} {name}", entry.size)
}

pub fn ls(session: &Session, args: &LsArgs) -> Result<()> {
    let paths = if args.paths.is_empty() {
        let cfg: &dyn BoardConfig = session.config.as_ref();
        vec![cfg.get_str(&session.board_id(), "remote_dir", "/flash")]
    } else {
        args.paths.clone()
    };
    for (i, path) in paths.iter().enumerate() {
        let (dev, dev_path) = session.registry.resolve_path(path);
        let Some(mut entries) = with_tree(dev.as_ref(), |t| t.list(&dev_path))? else {
            bail!("{path}: no such directory");
        };
        entries.retain(|e| args.all || !e.name.starts_with('.'));
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        if paths.len() > 1 {
            if i > 0 {
                println!();
            }
            println!("{path}:");
        }
        for entry in &entries {
            println!("{}", format_entry(entry, args.long));
        }
    }
    Ok(())
}

pub fn mkdir(session: &Session, paths: &[String]) -> Result<()> {
    for path in paths {
        let (dev, dev_path) = session.registry.resolve_path(path);
        with_tree(dev.as_ref(), |t| t.make_dir(&dev_path))
            .with_context(|| format!("creating {path}"))?;
    }
    Ok(())
}

fn remove_local(path: &str, recursive: bool) -> Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        fs::remove_file(path)?;
    } else if recursive {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_dir(path)?;
    }
    Ok(())
}

pub fn rm(session: &Session, args: &RmArgs) -> Result<()> {
    for path in &args.paths {
        let (dev, dev_path) = session.registry.resolve_path(path);
        let res = match &dev {
            Some(dev) => dev
                .remove(&dev_path, args.recursive, args.force)
                .map_err(anyhow::Error::from),
            None => remove_local(&dev_path, args.recursive),
        };
        match res {
            Err(_) if args.force => {}
            other => other.with_context(|| format!("removing {path}"))?,
        }
    }
    Ok(())
}
