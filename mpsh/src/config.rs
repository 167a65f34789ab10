//! Per-board configuration.
//!
//! Boards are identified by a config id. Every lookup on a board falls back
//! to the `default` section, then to the caller's default. [`ConfigStore`]
//! keeps the whole document as JSON and rewrites it atomically on change.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::{fs, io};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Name of the section every board falls back to.
pub const DEFAULT_SECTION: &str = "default";

/// Python keywords, which are not accepted as option names.
const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class", "continue",
    "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if", "import",
    "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try", "while",
    "with", "yield",
];

/// Errors relating to configuration options and the configuration file.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The option name is not an identifier.
    #[error("{0:?} is not a valid option name")]
    InvalidOption(String),
    /// The option name is a Python keyword.
    #[error("{0}: keywords are not permitted as option names")]
    Keyword(String),
    /// A filter option holds a malformed glob pattern.
    #[error("option {option}: {source}")]
    Pattern {
        /// Offending option.
        option: String,
        /// Underlying glob error.
        source: globset::Error,
    },
    /// The configuration file is not valid JSON.
    #[error("malformed configuration {}: {source}", path.display())]
    Parse {
        /// Configuration file path.
        path: PathBuf,
        /// Underlying parse error.
        source: serde_json::Error,
    },
    /// Reading or writing the configuration file failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Configuration lookups a device needs, keyed by board id.
pub trait BoardConfig: Send + Sync + fmt::Debug {
    /// Returns the value of `option` for `board`, falling back to the
    /// default section.
    fn get(&self, board: &str, option: &str) -> Option<Value>;

    /// Sets `option` for `board`, creating the board section if needed.
    fn set(&self, board: &str, option: &str, value: Value) -> Result<(), ConfigError>;

    /// Removes `option` from `board`; missing options are ignored.
    fn remove(&self, board: &str, option: &str) -> Result<(), ConfigError>;

    /// Option names set directly on `board`.
    fn options(&self, board: &str) -> Vec<String>;

    /// Returns the id of the board called `name`.
    fn find(&self, name: &str) -> Option<String>;

    /// Returns the id of the board called `name`, creating it if unknown.
    fn find_or_create(&self, name: &str) -> Result<String, ConfigError>;
}

impl dyn BoardConfig {
    /// Integer option, or `default` when unset or not an integer.
    pub fn get_i64(&self, board: &str, option: &str, default: i64) -> i64 {
        self.get(board, option)
            .and_then(|v| v.as_i64())
            .unwrap_or(default)
    }

    /// Unsigned option, or `default` when unset or not an unsigned integer.
    pub fn get_u64(&self, board: &str, option: &str, default: u64) -> u64 {
        self.get(board, option)
            .and_then(|v| v.as_u64())
            .unwrap_or(default)
    }

    /// Boolean option, or `default` when unset or not a boolean.
    pub fn get_bool(&self, board: &str, option: &str, default: bool) -> bool {
        self.get(board, option)
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }

    /// String option, or `default` when unset or not a string.
    pub fn get_str(&self, board: &str, option: &str, default: &str) -> String {
        match self.get(board, option) {
            Some(Value::String(s)) => s,
            _ => default.to_owned(),
        }
    }
}

/// Checks that `option` can be used as an option name.
pub fn validate_option(option: &str) -> Result<(), ConfigError> {
    let mut chars = option.chars();
    let ident = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !ident {
        return Err(ConfigError::InvalidOption(option.to_owned()));
    }
    if KEYWORDS.contains(&option) {
        return Err(ConfigError::Keyword(option.to_owned()));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Document {
    boards: BTreeMap<String, Map<String, Value>>,
}

impl Default for Document {
    fn default() -> Self {
        let defaults = json!({
            "board": "pyboard",
            "baudrate": 115_200,
            "buffer_size": 1024,
            "binary_transfer": true,
            "time_offset": mpsh_proto::DEFAULT_TIME_OFFSET,
            "user": "micro",
            "password": "python",
            "host_dir": ".",
            "remote_dir": "/flash",
            "rsync_includes": "*.py,*.json,*.txt,*.html",
            "rsync_excludes": ".*,__*__",
            "port": "/dev/ttyUSB0",
            "wait": 0,
            "soft_reset": false,
        });
        let mut boards = BTreeMap::new();
        if let Value::Object(map) = defaults {
            boards.insert(DEFAULT_SECTION.to_owned(), map);
        }
        Self { boards }
    }
}

/// JSON-backed board configuration.
///
/// Layout: `{"boards": {"default": {...}, "<id>": {"name": ..., ...}}}`.
/// Stores opened from a file save after every change; in-memory stores
/// never touch the disk.
#[derive(Debug)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    doc: Mutex<Document>,
}

impl ConfigStore {
    /// Opens the configuration at `path`, creating it with defaults when
    /// missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let doc = match fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "configuration missing, creating default");
                let doc = Document::default();
                save(&path, &doc)?;
                doc
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            doc: Mutex::new(doc),
        })
    }

    /// Creates a store holding only the default section.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            doc: Mutex::new(Document::default()),
        }
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Board ids in the store, `default` included.
    pub fn boards(&self) -> Vec<String> {
        self.doc.lock().boards.keys().cloned().collect()
    }

    /// Pretty JSON rendering of one board section.
    pub fn section_string(&self, board: &str) -> String {
        let doc = self.doc.lock();
        doc.boards
            .get(board)
            .and_then(|s| serde_json::to_string_pretty(s).ok())
            .unwrap_or_else(|| "{}".to_owned())
    }

    fn update<T>(&self, f: impl FnOnce(&mut Document) -> T) -> Result<T, ConfigError> {
        let mut doc = self.doc.lock();
        let out = f(&mut doc);
        if let Some(path) = &self.path {
            save(path, &doc)?;
        }
        Ok(out)
    }
}

impl BoardConfig for ConfigStore {
    fn get(&self, board: &str, option: &str) -> Option<Value> {
        let doc = self.doc.lock();
        doc.boards
            .get(board)
            .and_then(|s| s.get(option))
            .or_else(|| doc.boards.get(DEFAULT_SECTION)?.get(option))
            .cloned()
    }

    fn set(&self, board: &str, option: &str, value: Value) -> Result<(), ConfigError> {
        validate_option(option)?;
        tracing::debug!(board, option, %value, "config set");
        self.update(|doc| {
            doc.boards
                .entry(board.to_owned())
                .or_default()
                .insert(option.to_owned(), value);
        })
    }

    fn remove(&self, board: &str, option: &str) -> Result<(), ConfigError> {
        let changed = {
            let doc = self.doc.lock();
            doc.boards.get(board).is_some_and(|s| s.contains_key(option))
        };
        if !changed {
            return Ok(());
        }
        self.update(|doc| {
            if let Some(section) = doc.boards.get_mut(board) {
                section.remove(option);
            }
        })
    }

    fn options(&self, board: &str) -> Vec<String> {
        self.doc
            .lock()
            .boards
            .get(board)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn find(&self, name: &str) -> Option<String> {
        let doc = self.doc.lock();
        doc.boards
            .iter()
            .filter(|(id, _)| id.as_str() != DEFAULT_SECTION)
            .find(|(_, s)| s.get("name").and_then(Value::as_str) == Some(name))
            .map(|(id, _)| id.clone())
    }

    fn find_or_create(&self, name: &str) -> Result<String, ConfigError> {
        if let Some(id) = self.find(name) {
            return Ok(id);
        }
        self.update(|doc| {
            let id = (1u32..)
                .map(|n| n.to_string())
                .find(|id| !doc.boards.contains_key(id))
                .unwrap_or_default();
            let mut section = Map::new();
            section.insert("name".to_owned(), Value::from(name));
            doc.boards.insert(id.clone(), section);
            tracing::debug!(name, id, "new board in configuration");
            id
        })
    }
}

/// Writes the document to a temporary file, then renames it over `path`.
fn save(path: &Path, doc: &Document) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let file = fs::File::create(&tmp)?;
    serde_json::to_writer_pretty(file, doc).map_err(io::Error::other)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
