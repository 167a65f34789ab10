//! In-process fake board for tests.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mpsh_proto::control::{CTRL_A, CTRL_B, CTRL_C, CTRL_D, RAW_BANNER, SOFT_REBOOT};
use mpsh_proto::{ACK, FrameCodec, Literal};
use parking_lot::{Condvar, Mutex};

use crate::config::{BoardConfig, ConfigStore};
use crate::device::Device;
use crate::transport::{Endpoint, Transport};

const POLL: Duration = Duration::from_millis(20);

/// One direction of a byte pipe.
#[derive(Debug, Default)]
struct Pipe {
    buf: Mutex<VecDeque<u8>>,
    ready: Condvar,
    closed: AtomicBool,
}

impl Pipe {
    fn push(&self, data: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.buf.lock().extend(data);
        self.ready.notify_all();
        Ok(())
    }

    /// Pops up to `out.len()` bytes, waiting at most `wait`.
    fn pop(&self, out: &mut [u8], wait: Duration) -> io::Result<usize> {
        let mut buf = self.buf.lock();
        if buf.is_empty() {
            if self.closed.load(Ordering::SeqCst) {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            self.ready.wait_for(&mut buf, wait);
        }
        let n = out.len().min(buf.len());
        for (slot, b) in out.iter_mut().zip(buf.drain(..n)) {
            *slot = b;
        }
        Ok(n)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.ready.notify_all();
    }
}

/// Counts calls made on the host side of a pipe.
#[derive(Debug, Default)]
pub(crate) struct IoCounters {
    pub(crate) reads: AtomicUsize,
    pub(crate) writes: AtomicUsize,
}

impl IoCounters {
    pub(crate) fn total(&self) -> usize {
        self.reads.load(Ordering::SeqCst) + self.writes.load(Ordering::SeqCst)
    }
}

/// Host side of a pipe pair.
#[derive(Debug)]
pub(crate) struct PipeTransport {
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
    open: bool,
    endpoint: Endpoint,
    pub(crate) counters: Arc<IoCounters>,
}

impl Transport for PipeTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        if !self.open {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.rx.pop(buf, POLL)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.counters.writes.fetch_add(1, Ordering::SeqCst);
        if !self.open {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.tx.push(data)?;
        Ok(data.len())
    }

    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(Self {
            rx: Arc::clone(&self.rx),
            tx: Arc::clone(&self.tx),
            open: self.open,
            endpoint: self.endpoint.clone(),
            counters: Arc::clone(&self.counters),
        }))
    }

    fn close(&mut self) {
        self.open = false;
        self.tx.close();
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

/// Board side of a pipe pair.
#[derive(Debug)]
pub(crate) struct BoardEnd {
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
}

impl BoardEnd {
    pub(crate) fn send(&mut self, data: &[u8]) {
        let _ = self.tx.push(data);
    }

    pub(crate) fn recv_byte(&mut self, wait: Duration) -> Option<u8> {
        let mut b = [0u8; 1];
        match self.rx.pop(&mut b, wait) {
            Ok(1) => Some(b[0]),
            _ => None,
        }
    }

    pub(crate) fn recv_exact(&mut self, n: usize, wait: Duration) -> Vec<u8> {
        let deadline = Instant::now() + wait;
        let mut out = Vec::with_capacity(n);
        while out.len() < n && Instant::now() < deadline {
            if let Some(b) = self.recv_byte(POLL) {
                out.push(b);
            }
        }
        out
    }

    /// Reads through `marker`, or whatever arrived before `wait` ran out.
    pub(crate) fn recv_until(&mut self, marker: &[u8], wait: Duration) -> Vec<u8> {
        let deadline = Instant::now() + wait;
        let mut out = Vec::new();
        while !out.ends_with(marker) && Instant::now() < deadline {
            if let Some(b) = self.recv_byte(POLL) {
                out.push(b);
            }
        }
        out
    }

    /// Returns `true` once the host closed its side.
    fn host_gone(&self) -> bool {
        self.rx.closed.load(Ordering::SeqCst) || Arc::strong_count(&self.rx) == 1
    }
}

impl Drop for BoardEnd {
    fn drop(&mut self) {
        self.tx.close();
    }
}

/// Creates a connected host transport and board end.
pub(crate) fn pipe_pair() -> (PipeTransport, BoardEnd) {
    pipe_pair_at("/dev/ttyFAKE0")
}

/// Like [`pipe_pair`], with the host side reporting serial port `path`.
pub(crate) fn pipe_pair_at(path: &str) -> (PipeTransport, BoardEnd) {
    let to_board = Arc::new(Pipe::default());
    let to_host = Arc::new(Pipe::default());
    let host = PipeTransport {
        rx: Arc::clone(&to_host),
        tx: Arc::clone(&to_board),
        open: true,
        endpoint: Endpoint::Serial {
            path: path.to_owned(),
            baud: 115_200,
        },
        counters: Arc::default(),
    };
    let board = BoardEnd {
        rx: to_board,
        tx: to_host,
    };
    (host, board)
}

/// A node of the fake filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Node {
    Dir { mtime: i64 },
    File { data: Vec<u8>, mtime: i64 },
}

/// Observable state of a fake board.
#[derive(Debug)]
pub(crate) struct BoardState {
    pub(crate) name: Option<String>,
    pub(crate) has_buffer: bool,
    pub(crate) fs: BTreeMap<String, Node>,
    pub(crate) rtc: Option<Vec<i64>>,
    /// Names of remote functions called, in order.
    pub(crate) calls: Vec<String>,
    /// When set, code never finishes running.
    pub(crate) hang: bool,
    /// Bytes received at the friendly prompt.
    pub(crate) typed: Vec<u8>,
}

impl Default for BoardState {
    fn default() -> Self {
        let mut fs = BTreeMap::new();
        fs.insert("/flash".to_owned(), Node::Dir { mtime: 0 });
        Self {
            name: Some("pyboard".into()),
            has_buffer: true,
            fs,
            rtc: None,
            calls: Vec::new(),
            hang: false,
            typed: Vec::new(),
        }
    }
}

impl BoardState {
    pub(crate) fn put_file(&mut self, path: &str, data: &[u8], mtime: i64) {
        self.fs.insert(
            path.to_owned(),
            Node::File {
                data: data.to_vec(),
                mtime,
            },
        );
    }

    pub(crate) fn put_dir(&mut self, path: &str) {
        self.fs.insert(path.to_owned(), Node::Dir { mtime: 0 });
    }

    pub(crate) fn file(&self, path: &str) -> Option<&[u8]> {
        match self.fs.get(path) {
            Some(Node::File { data, .. }) => Some(data),
            _ => None,
        }
    }

    fn children(&self, dir: &str) -> Option<Vec<String>> {
        if dir != "/" && !matches!(self.fs.get(dir), Some(Node::Dir { .. })) {
            return None;
        }
        let prefix = if dir == "/" { "/".to_owned() } else { format!("{dir}/") };
        Some(
            self.fs
                .keys()
                .filter_map(|p| p.strip_prefix(&prefix))
                .filter(|rest| !rest.is_empty() && !rest.contains('/'))
                .map(str::to_owned)
                .collect(),
        )
    }

    fn stat(&self, path: &str) -> Literal {
        let (mode, size, mtime) = match self.fs.get(path) {
            Some(Node::Dir { mtime }) => (0x4000, 0, *mtime),
            Some(Node::File { data, mtime }) => (0x8000, data.len() as i64, *mtime),
            None => return Literal::None,
        };
        Literal::Tuple(
            [mode, 0, 0, 0, 0, 0, size, mtime, mtime, mtime]
                .into_iter()
                .map(Literal::Int)
                .collect(),
        )
    }

    fn remove(&mut self, path: &str, recursive: bool) -> bool {
        match self.fs.get(path) {
            None => false,
            Some(Node::File { .. }) => self.fs.remove(path).is_some(),
            Some(Node::Dir { .. }) => {
                let prefix = format!("{path}/");
                let has_children = self.fs.keys().any(|p| p.starts_with(&prefix));
                if has_children && !recursive {
                    return false;
                }
                self.fs.retain(|p, _| p != path && !p.starts_with(&prefix));
                true
            }
        }
    }
}

/// A running fake board.
#[derive(Debug)]
pub(crate) struct FakeBoard {
    pub(crate) state: Arc<Mutex<BoardState>>,
    _thread: JoinHandle<()>,
}

impl FakeBoard {
    /// Starts a board with default state on a fresh pipe.
    pub(crate) fn spawn() -> (PipeTransport, Self) {
        Self::spawn_with("/dev/ttyFAKE0", BoardState::default())
    }

    pub(crate) fn spawn_with(path: &str, state: BoardState) -> (PipeTransport, Self) {
        let (host, board) = pipe_pair_at(path);
        let state = Arc::new(Mutex::new(state));
        let shared = Arc::clone(&state);
        let thread = thread::spawn(move || Emulator::new(board, shared).run());
        (
            host,
            Self {
                state,
                _thread: thread,
            },
        )
    }
}

enum Mode {
    Friendly,
    Raw,
}

struct Emulator {
    end: BoardEnd,
    state: Arc<Mutex<BoardState>>,
    mode: Mode,
    code: Vec<u8>,
}

struct Exec {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Emulator {
    fn new(end: BoardEnd, state: Arc<Mutex<BoardState>>) -> Self {
        Self {
            end,
            state,
            mode: Mode::Friendly,
            code: Vec::new(),
        }
    }

    fn run(mut self) {
        loop {
            let Some(b) = self.end.recv_byte(POLL) else {
                if self.end.host_gone() {
                    return;
                }
                continue;
            };
            match self.mode {
                Mode::Friendly => {
                    self.state.lock().typed.push(b);
                    match b {
                        CTRL_A => {
                            self.mode = Mode::Raw;
                            self.code.clear();
                            self.end.send(RAW_BANNER);
                        }
                        CTRL_C | b'\r' => self.end.send(b"\r\n>>> "),
                        other => self.end.send(&[other]),
                    }
                }
                Mode::Raw => match b {
                    CTRL_A => {
                        self.code.clear();
                        self.end.send(RAW_BANNER);
                    }
                    CTRL_B => {
                        self.mode = Mode::Friendly;
                        self.end.send(b"\r\nMicroPython fake\r\n>>> ");
                    }
                    CTRL_C => self.code.clear(),
                    CTRL_D if self.code.is_empty() => {
                        self.end.send(SOFT_REBOOT);
                        self.end.send(RAW_BANNER);
                    }
                    CTRL_D => {
                        self.end.send(b"OK");
                        let code = String::from_utf8_lossy(&std::mem::take(&mut self.code)).into_owned();
                        if let Some(exec) = self.execute(&code) {
                            self.end.send(&exec.stdout);
                            self.end.send(&[CTRL_D]);
                            self.end.send(&exec.stderr);
                            self.end.send(&[CTRL_D]);
                            self.end.send(b">");
                        }
                    }
                    other => self.code.push(other),
                },
            }
        }
    }

    fn execute(&mut self, code: &str) -> Option<Exec> {
        if self.state.lock().hang {
            return None;
        }
        for token in ["TIME_OFFSET", "HAS_BUFFER", "BUFFER_SIZE", "IS_UPY"] {
            if code.contains(token) {
                return Some(error(&format!("NameError: name '{token}' isn't defined")));
            }
        }
        let Some(call) = code.lines().find_map(|l| l.strip_prefix("output = ")) else {
            return Some(self.script(code));
        };
        let (name, rest) = call.split_once('(')?;
        let inner = rest.strip_suffix(')')?;
        let (args, kwargs) = parse_args(inner);
        self.state.lock().calls.push(name.to_owned());
        let value = self.call(name, &args, &kwargs, code);
        let text = match value {
            Literal::None => "None".to_owned(),
            Literal::Str(s) => s,
            v => v.to_string(),
        };
        Some(Exec {
            stdout: format!("{text}\r\n").into_bytes(),
            stderr: Vec::new(),
        })
    }

    /// Minimal interpreter for free-form code: `print(<literal>)` and `raise`.
    fn script(&mut self, code: &str) -> Exec {
        let mut stdout = Vec::new();
        for line in code.lines().map(str::trim) {
            if let Some(arg) = line.strip_prefix("print(").and_then(|r| r.strip_suffix(')')) {
                let text = match Literal::parse(arg) {
                    Ok(Literal::Str(s)) => s,
                    Ok(v) => v.to_string(),
                    Err(_) => arg.to_owned(),
                };
                stdout.extend_from_slice(text.as_bytes());
                stdout.extend_from_slice(b"\r\n");
            } else if let Some(exc) = line.strip_prefix("raise ") {
                let mut out = error(exc);
                out.stdout = stdout;
                return out;
            }
        }
        Exec {
            stdout,
            stderr: Vec::new(),
        }
    }

    fn call(&mut self, name: &str, args: &[Literal], kwargs: &[(String, Literal)], code: &str) -> Literal {
        let arg_str = |i: usize| args.get(i).and_then(Literal::as_str).unwrap_or_default().to_owned();
        let kwarg = |k: &str| {
            kwargs
                .iter()
                .find(|(n, _)| n == k)
                .and_then(|(_, v)| v.as_bool())
                .unwrap_or(false)
        };
        let mut state = self.state.lock();
        match name {
            "board_name" => {
                let name = state.name.clone().unwrap_or_else(|| arg_str(0));
                Literal::Str(Literal::Str(name).to_string())
            }
            "test_buffer" => Literal::Bool(state.has_buffer),
            "listdir" => state
                .children(&arg_str(0))
                .map_or(Literal::None, |c| Literal::List(c.into_iter().map(Literal::Str).collect())),
            "listdir_stat" => {
                let dir = arg_str(0);
                match state.children(&dir) {
                    None => Literal::None,
                    Some(children) => Literal::List(
                        children
                            .into_iter()
                            .map(|c| {
                                let path = if dir == "/" { format!("/{c}") } else { format!("{dir}/{c}") };
                                Literal::Tuple(vec![Literal::Str(c), state.stat(&path)])
                            })
                            .collect(),
                    ),
                }
            }
            "get_stat" => state.stat(&arg_str(0)),
            "make_directory" => {
                let path = arg_str(0);
                if state.fs.contains_key(&path) {
                    Literal::Bool(false)
                } else {
                    state.put_dir(&path);
                    Literal::Bool(true)
                }
            }
            "remove_file" => {
                let removed = state.remove(&arg_str(0), kwarg("recursive") || args.get(1).and_then(Literal::as_bool).unwrap_or(false));
                Literal::Bool(removed || kwarg("force"))
            }
            "set_time" => {
                state.rtc = Some(args.iter().filter_map(Literal::as_int).collect());
                Literal::None
            }
            "get_time" => Literal::Tuple(
                state
                    .rtc
                    .clone()
                    .unwrap_or_else(|| vec![2000, 1, 1, 0, 0, 0])
                    .into_iter()
                    .chain([5, 1])
                    .map(Literal::Int)
                    .collect(),
            ),
            // Prints its argument verbatim.
            "print_raw" => Literal::Str(arg_str(0)),
            "get_ip_address" => Literal::Str("'192.168.4.1'".into()),
            "get_mac_address" => Literal::Str("'24:0a:c4:00:01:02'".into()),
            "recv_file_from_host" => {
                let path = arg_str(1);
                let size = args.get(2).and_then(Literal::as_int).unwrap_or(0) as usize;
                drop(state);
                let data = self.receive(code, size);
                let mut state = self.state.lock();
                match data {
                    Some(data) => {
                        state.put_file(&path, &data, 0);
                        Literal::Bool(true)
                    }
                    None => Literal::Bool(false),
                }
            }
            "send_file_to_host" => {
                let data = state.file(&arg_str(0)).map(<[u8]>::to_vec);
                drop(state);
                match data {
                    Some(data) => Literal::Bool(self.transmit(code, &data)),
                    None => Literal::Bool(false),
                }
            }
            _ => Literal::None,
        }
    }

    /// Board side of an upload.
    fn receive(&mut self, code: &str, size: usize) -> Option<Vec<u8>> {
        let codec = rendered_codec(code);
        let mut remaining = codec.wire_len(size);
        let mut data = Vec::new();
        while remaining > 0 {
            self.end.send(&[ACK]);
            let n = codec.next_frame_len(remaining);
            let frame = self.end.recv_exact(n, Duration::from_secs(2));
            if frame.len() != n {
                return None;
            }
            data.extend(codec.decode(&frame).ok()?);
            remaining -= n;
        }
        Some(data)
    }

    /// Board side of a download.
    fn transmit(&mut self, code: &str, data: &[u8]) -> bool {
        let codec = rendered_codec(code);
        for frame in codec.frames(data) {
            self.end.send(&frame);
            if self.end.recv_byte(Duration::from_secs(2)) != Some(ACK) {
                return false;
            }
        }
        true
    }
}

fn error(exc: &str) -> Exec {
    Exec {
        stdout: Vec::new(),
        stderr: format!("Traceback (most recent call last):\r\n  File \"<stdin>\", line 1\r\n{exc}\r\n")
            .into_bytes(),
    }
}

/// Reads the substituted `HAS_BUFFER` and `BUFFER_SIZE` back out of a
/// rendered transfer function.
fn rendered_codec(code: &str) -> FrameCodec {
    let binary = match (code.find("if True:"), code.find("if False:")) {
        (Some(t), Some(f)) => t < f,
        (t, _) => t.is_some(),
    };
    let size = code
        .split("buf_size = ")
        .nth(1)
        .map(|rest| rest.chars().take_while(char::is_ascii_digit).collect::<String>())
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(128);
    FrameCodec::new(binary, size)
}

/// Opens a [`Device`] on a fake board with an in-memory configuration.
pub(crate) fn open_fake(state: BoardState) -> (Device, FakeBoard) {
    let (transport, board) = FakeBoard::spawn_with("/dev/ttyFAKE0", state);
    let config: Arc<dyn BoardConfig> = Arc::new(ConfigStore::in_memory());
    let dev = Device::open(Box::new(transport), config, "default").unwrap();
    (dev, board)
}

/// Splits `a, 'b', k=v` into positional and keyword literals.
fn parse_args(inner: &str) -> (Vec<Literal>, Vec<(String, Literal)>) {
    let mut pieces = Vec::new();
    let (mut depth, mut quote, mut escaped, mut start) = (0i32, None, false, 0);
    for (i, c) in inner.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ',' if depth == 0 => {
                pieces.push(inner[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = inner[start..].trim();
    if !last.is_empty() {
        pieces.push(last);
    }

    let mut args = Vec::new();
    let mut kwargs = Vec::new();
    for piece in pieces {
        let keyword = piece
            .split_once('=')
            .filter(|(k, _)| k.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        match keyword {
            Some((k, v)) => kwargs.push((k.to_owned(), Literal::parse(v).unwrap_or(Literal::None))),
            None => args.push(Literal::parse(piece).unwrap_or(Literal::None)),
        }
    }
    (args, kwargs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_arguments() {
        let (args, kwargs) = parse_args("'a,b', None, 3, recursive=True, force=False");
        assert_eq!(
            args,
            vec![Literal::Str("a,b".into()), Literal::None, Literal::Int(3)]
        );
        assert_eq!(kwargs[0], ("recursive".into(), Literal::Bool(true)));
        assert_eq!(kwargs[1], ("force".into(), Literal::Bool(false)));
    }

    #[test]
    fn reads_back_codec() {
        let code = "def f():\n    if False:\n        pass\n    buf_size = 64\n";
        assert_eq!(rendered_codec(code), FrameCodec::new(false, 64));
    }
}
