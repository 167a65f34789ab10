//! Placeholder substitution for remote payloads.
//!
//! Remote functions are plain Python source containing a few upper-case
//! placeholder tokens (`TIME_OFFSET`, `HAS_BUFFER`, `BUFFER_SIZE`, `IS_UPY`).
//! Before transmission every token is replaced by the literal text of its
//! value. A token only matches as a whole identifier, so `MY_BUFFER_SIZE`
//! is left alone, and every byte outside a substituted span is copied
//! unchanged.

use std::fmt::Write as _;

use crate::literal::Literal;
use crate::ops::RemoteFn;

/// Board epoch (2000-01-01) expressed in unix seconds.
pub const DEFAULT_TIME_OFFSET: i64 = 946_684_800;

/// Placeholder for the board-to-unix epoch offset.
pub const TIME_OFFSET: &str = "TIME_OFFSET";
/// Placeholder for the raw binary transfer capability.
pub const HAS_BUFFER: &str = "HAS_BUFFER";
/// Placeholder for the transfer frame size.
pub const BUFFER_SIZE: &str = "BUFFER_SIZE";
/// Placeholder telling payloads they run under MicroPython.
pub const IS_UPY: &str = "IS_UPY";

/// Errors raised while building a placeholder set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum TemplateError {
    /// The placeholder name is not a valid identifier.
    #[error("placeholder {0:?} is not an identifier")]
    InvalidName(String),
    /// A value's rendering contains a placeholder token.
    #[error("value of {name} would render placeholder {token}")]
    Recursive {
        /// Placeholder whose value is offending.
        name: String,
        /// Token found inside the rendered value.
        token: String,
    },
}

/// An ordered set of placeholder names and their values.
///
/// No rendered value may itself contain a placeholder token, which keeps
/// [`render`] idempotent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Placeholders {
    entries: Vec<(String, String)>,
}

impl Placeholders {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a placeholder.
    pub fn insert(
        &mut self,
        name: &str,
        value: impl Into<Literal>,
    ) -> Result<&mut Self, TemplateError> {
        if !is_identifier(name) {
            return Err(TemplateError::InvalidName(name.to_owned()));
        }
        let rendered = value.into().to_string();
        if let Some(token) = identifiers(&rendered).find(|id| *id == name || self.contains(id)) {
            return Err(TemplateError::Recursive {
                name: name.to_owned(),
                token: token.to_owned(),
            });
        }
        if let Some((other, _)) = self
            .entries
            .iter()
            .find(|(n, v)| n != name && identifiers(v).any(|id| id == name))
        {
            return Err(TemplateError::Recursive {
                name: other.clone(),
                token: name.to_owned(),
            });
        }
        self.entries.retain(|(n, _)| n != name);
        self.entries.push((name.to_owned(), rendered));
        Ok(self)
    }

    /// Returns `true` if `name` is a placeholder of this set.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    fn lookup(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Replaces every whole-identifier occurrence of a placeholder in `source`.
pub fn render(source: &str, placeholders: &Placeholders) -> String {
    let mut out = String::with_capacity(source.len());
    let mut copied = 0;
    for (start, ident) in identifier_spans(source) {
        if let Some(value) = placeholders.lookup(ident) {
            out.push_str(&source[copied..start]);
            out.push_str(value);
            copied = start + ident.len();
        }
    }
    out.push_str(&source[copied..]);
    out
}

/// The live constants every payload is rendered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConstants {
    /// Seconds between the board epoch and the unix epoch.
    pub time_offset: i64,
    /// Whether frames travel as raw binary rather than hex.
    pub has_buffer: bool,
    /// Transfer frame size in bytes.
    pub buffer_size: usize,
    /// Whether the board runs MicroPython.
    pub is_upy: bool,
}

impl Default for RuntimeConstants {
    fn default() -> Self {
        Self {
            time_offset: DEFAULT_TIME_OFFSET,
            has_buffer: false,
            buffer_size: 128,
            is_upy: true,
        }
    }
}

impl RuntimeConstants {
    /// Returns the four standard placeholders.
    pub fn placeholders(&self) -> Placeholders {
        let mut set = Placeholders::new();
        // Integer and boolean renderings never contain identifiers that
        // collide with the token names.
        for (name, value) in [
            (TIME_OFFSET, Literal::Int(self.time_offset)),
            (HAS_BUFFER, Literal::Bool(self.has_buffer)),
            (BUFFER_SIZE, Literal::from(self.buffer_size)),
            (IS_UPY, Literal::Bool(self.is_upy)),
        ] {
            set.entries.push((name.to_owned(), value.to_string()));
        }
        set
    }
}

/// A typed call of a remote function.
///
/// The rendered text is the function source with placeholders substituted,
/// followed by the call and an epilogue printing its result (or `None`).
/// Argument values are appended after substitution, so text inside them is
/// never mistaken for a placeholder.
#[derive(Debug, Clone)]
pub struct Payload<'a> {
    func: &'a RemoteFn,
    args: Vec<Literal>,
    kwargs: Vec<(String, Literal)>,
}

impl<'a> Payload<'a> {
    /// Starts a call of `func` with no arguments.
    pub fn new(func: &'a RemoteFn) -> Self {
        Self {
            func,
            args: Vec::new(),
            kwargs: Vec::new(),
        }
    }

    /// Appends a positional argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<Literal>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Appends a keyword argument.
    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Literal>) -> Self {
        self.kwargs.push((name.into(), value.into()));
        self
    }

    /// The remote function being called.
    pub const fn func(&self) -> &RemoteFn {
        self.func
    }

    /// Renders the call expression, e.g. `listdir('/flash')`.
    pub fn call_expr(&self) -> String {
        let mut call = format!("{}(", self.func.name);
        let positional = self.args.iter().map(ToString::to_string);
        let keyword = self.kwargs.iter().map(|(k, v)| format!("{k}={v}"));
        for (i, arg) in positional.chain(keyword).enumerate() {
            if i > 0 {
                call.push_str(", ");
            }
            call.push_str(&arg);
        }
        call.push(')');
        call
    }

    /// Produces the final source text sent to the board.
    pub fn render(&self, constants: &RuntimeConstants) -> String {
        let mut text = render(self.func.source, &constants.placeholders());
        if !text.ends_with('\n') {
            text.push('\n');
        }
        let _ = writeln!(text, "output = {}", self.call_expr());
        text.push_str("if output is None:\n");
        let _ = writeln!(text, "    print({:?})", crate::control::NO_VALUE);
        text.push_str("else:\n");
        text.push_str("    print(output)\n");
        text
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

const fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Yields `(offset, text)` of every maximal identifier-character run.
fn identifier_spans(source: &str) -> impl Iterator<Item = (usize, &str)> {
    let bytes = source.as_bytes();
    let mut i = 0;
    std::iter::from_fn(move || {
        while i < bytes.len() && !is_ident_byte(bytes[i]) {
            i += 1;
        }
        if i >= bytes.len() {
            return None;
        }
        let start = i;
        while i < bytes.len() && is_ident_byte(bytes[i]) {
            i += 1;
        }
        // Runs start and end on ASCII bytes, so both are char boundaries.
        Some((start, &source[start..i]))
    })
}

fn identifiers(source: &str) -> impl Iterator<Item = &str> {
    identifier_spans(source).map(|(_, id)| id)
}
