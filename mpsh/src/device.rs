//! A connected board.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use mpsh_proto::{FrameCodec, Literal, Payload, RemoteFn, RuntimeConstants, ops};
use parking_lot::Mutex;
use serde_json::Value;

use crate::config::{BoardConfig, DEFAULT_SECTION};
use crate::link::Link;
use crate::repl::{Output, RawRepl, SideChannel};
use crate::transport::{Endpoint, Transport};
use crate::{Error, Result};

/// Default bound on a remote call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Frame size used when the configuration has none.
const FALLBACK_BUFFER_SIZE: u64 = 128;

/// Whether a device can still talk to its board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The link is usable.
    Open,
    /// The link failed or was closed.
    Closed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "connected",
            Self::Closed => "closed",
        })
    }
}

type SideFn<'a> = Box<dyn FnMut(&mut SideChannel<'_, '_>) -> Result<()> + 'a>;

/// One call of a remote function.
///
/// ```no_run
/// # fn demo(dev: &mpsh::Device) -> mpsh::Result<()> {
/// use mpsh::{RemoteCall, ops};
///
/// let names = dev.remote_eval(RemoteCall::new(&ops::LISTDIR).arg("/flash"))?;
/// # Ok(()) }
/// ```
pub struct RemoteCall<'a> {
    payload: Payload<'a>,
    timeout: Duration,
    side: Option<SideFn<'a>>,
}

impl fmt::Debug for RemoteCall<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCall")
            .field("call", &self.payload.call_expr())
            .field("timeout", &self.timeout)
            .field("side_channel", &self.side.is_some())
            .finish()
    }
}

impl<'a> RemoteCall<'a> {
    /// Calls `func` with no arguments.
    pub fn new(func: &'a RemoteFn) -> Self {
        Self {
            payload: Payload::new(func),
            timeout: DEFAULT_TIMEOUT,
            side: None,
        }
    }

    /// Appends a positional argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<Literal>) -> Self {
        self.payload = self.payload.arg(value);
        self
    }

    /// Appends a keyword argument.
    #[must_use]
    pub fn kwarg(mut self, name: &str, value: impl Into<Literal>) -> Self {
        self.payload = self.payload.kwarg(name, value);
        self
    }

    /// Bounds how long the board may stay silent.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs `f` once the code started, before its output is read.
    #[must_use]
    pub fn side_channel(
        mut self,
        f: impl FnMut(&mut SideChannel<'_, '_>) -> Result<()> + 'a,
    ) -> Self {
        self.side = Some(Box::new(f));
        self
    }
}

/// A board reachable over one transport.
///
/// All exchanges go through a per-device lock, so concurrent calls on the
/// same device are serialized rather than interleaved. Closing does not
/// wait for that lock: it shuts the link down, and a call in flight fails
/// with [`Error::Transport`] at its next read or write.
pub struct Device {
    name: String,
    id: String,
    endpoint: Endpoint,
    link: Mutex<Option<Link>>,
    closed: Arc<AtomicBool>,
    has_buffer: bool,
    root_dirs: Vec<String>,
    config: Arc<dyn BoardConfig>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("status", &self.status())
            .field("has_buffer", &self.has_buffer)
            .field("root_dirs", &self.root_dirs)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Probes the board behind `transport`.
    ///
    /// Asks for the board name (falling back to `default_name`), resolves
    /// its configuration identity, detects binary transfer support, lists
    /// the root directories and sets the board clock to host time.
    pub fn open(
        transport: Box<dyn Transport>,
        config: Arc<dyn BoardConfig>,
        default_name: &str,
    ) -> Result<Self> {
        let endpoint = transport.endpoint().clone();
        let link = Link::new(transport);
        let closed = link.shutdown_flag();
        let id = config
            .find(default_name)
            .unwrap_or_else(|| DEFAULT_SECTION.to_owned());
        let mut dev = Self {
            name: default_name.to_owned(),
            id,
            endpoint,
            link: Mutex::new(Some(link)),
            closed,
            has_buffer: false,
            root_dirs: Vec::new(),
            config,
        };

        let reply = dev.remote_eval(RemoteCall::new(&ops::BOARD_NAME).arg(default_name))?;
        if let Some(name) = reply.as_ref().and_then(Literal::as_str) {
            dev.name = name.to_owned();
        }
        tracing::info!(board = %dev.name, endpoint = %dev.endpoint, "connected");
        dev.id = dev.config.find_or_create(&dev.name)?;

        dev.has_buffer = dev
            .remote_eval(RemoteCall::new(&ops::TEST_BUFFER))?
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        tracing::debug!(has_buffer = dev.has_buffer);

        dev.root_dirs = dev
            .remote_eval(RemoteCall::new(&ops::LISTDIR).arg("/"))?
            .as_ref()
            .and_then(Literal::as_seq)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Literal::as_str)
                    .map(|d| format!("/{d}/"))
                    .collect()
            })
            .unwrap_or_default();
        tracing::debug!(root_dirs = ?dev.root_dirs);

        dev.sync_time()?;
        Ok(dev)
    }

    /// Display name; unique within a registry.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    /// Configuration id of the board.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Where the board is attached.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Whether the board can take raw binary frames.
    pub const fn has_buffer(&self) -> bool {
        self.has_buffer
    }

    /// Top-level directories, as `/name/`.
    pub fn root_dirs(&self) -> &[String] {
        &self.root_dirs
    }

    /// `/<name>/`, the path prefix routing to this board.
    pub fn name_path(&self) -> String {
        format!("/{}/", self.name)
    }

    /// Returns `true` if `path` lies under one of the root directories.
    pub fn is_root_path(&self, path: &str) -> bool {
        let probe = format!("{path}/");
        self.root_dirs.iter().any(|root| probe.starts_with(root.as_str()))
    }

    /// Link status.
    pub fn status(&self) -> Status {
        if self.closed.load(Ordering::SeqCst) {
            Status::Closed
        } else {
            Status::Open
        }
    }

    /// Returns `true` while the link is usable.
    pub fn is_open(&self) -> bool {
        self.status() == Status::Open
    }

    /// Closes the link. Later calls fail without touching the transport.
    ///
    /// A call in flight on another thread fails within one transport poll,
    /// after which the link is released here.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(mut link) = self.link.lock().take() {
            link.close();
        }
    }

    /// Configuration shared with the registry.
    pub fn config(&self) -> &Arc<dyn BoardConfig> {
        &self.config
    }

    /// Board option, falling back to the default section.
    pub fn get(&self, option: &str) -> Option<Value> {
        self.config.get(&self.id, option)
    }

    /// Sets a board option.
    pub fn set(&self, option: &str, value: Value) -> Result<()> {
        Ok(self.config.set(&self.id, option, value)?)
    }

    /// Constants the next payload is rendered with.
    pub fn constants(&self) -> RuntimeConstants {
        let cfg = self.config.as_ref();
        let codec = self.codec();
        RuntimeConstants {
            time_offset: cfg.get_i64(&self.id, "time_offset", mpsh_proto::DEFAULT_TIME_OFFSET),
            has_buffer: codec.is_binary(),
            buffer_size: codec.buffer_size(),
            is_upy: true,
        }
    }

    /// Frame codec agreed with the board for transfers.
    pub fn codec(&self) -> FrameCodec {
        let cfg = self.config.as_ref();
        let binary = self.has_buffer && cfg.get_bool(&self.id, "binary_transfer", true);
        let size = cfg.get_u64(&self.id, "buffer_size", FALLBACK_BUFFER_SIZE);
        FrameCodec::new(binary, usize::try_from(size).unwrap_or(usize::MAX))
    }

    /// Runs `f` on the locked link, closing the device on disconnect errors.
    fn exchange<T>(&self, f: impl FnOnce(&mut RawRepl<'_>) -> Result<T>) -> Result<T> {
        let soft_reset = self.config.get_bool(&self.id, "soft_reset", false);
        let mut guard = self.link.lock();
        let Some(link) = guard.as_mut().filter(|_| self.is_open()) else {
            return Err(Error::closed(&self.endpoint));
        };
        let res = f(&mut RawRepl::new(link, soft_reset));
        if let Err(e) = &res {
            if e.is_disconnect() {
                tracing::warn!(board = %self.name, "closing device: {e}");
                if let Some(mut link) = guard.take() {
                    link.close();
                }
            }
        }
        res
    }

    /// Calls a remote function and returns its printed output verbatim.
    ///
    /// Anything the board printed on stderr is logged and otherwise ignored.
    pub fn remote(&self, call: RemoteCall<'_>) -> Result<String> {
        let RemoteCall {
            payload,
            timeout,
            mut side,
        } = call;
        let codec = self.codec();
        let text = payload.render(&self.constants());
        tracing::debug!(call = %payload.call_expr(), bytes = text.len(), "remote");
        tracing::trace!("{text}");

        let out = self.exchange(|repl| {
            repl.enter()?;
            repl.exec_no_follow(text.as_bytes())?;
            if let Some(side) = side.as_mut() {
                side(&mut repl.side_channel(codec, timeout))?;
            }
            let out = repl.follow(timeout)?;
            repl.exit()?;
            Ok(out)
        })?;

        if !out.stderr.is_empty() {
            tracing::warn!(
                call = %payload.call_expr(),
                "board reported: {}",
                String::from_utf8_lossy(&out.stderr).trim_end()
            );
        }
        let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
        tracing::debug!(response = %stdout.trim_end());
        Ok(stdout)
    }

    /// Calls a remote function and parses its output as a Python value.
    ///
    /// Output that does not parse is logged and yields `None`, as does a
    /// remote `None`.
    pub fn remote_eval(&self, call: RemoteCall<'_>) -> Result<Option<Literal>> {
        let name = call.payload.func().name;
        let out = self.remote(call)?;
        match Literal::parse(&out) {
            Ok(Literal::None) => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(func = name, output = %out.trim_end(), "not a python value: {e}");
                Ok(None)
            }
        }
    }

    /// Runs `code` as if typed at the prompt and returns what it printed.
    ///
    /// A remote exception becomes [`Error::Remote`] carrying the traceback.
    pub fn exec(&self, code: &str) -> Result<String> {
        let Output { stdout, stderr } =
            self.exchange(|repl| repl.run(code.as_bytes(), DEFAULT_TIMEOUT))?;
        if !stderr.is_empty() {
            return Err(Error::Remote(
                String::from_utf8_lossy(&stderr).trim_end().to_owned(),
            ));
        }
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    /// Runs the contents of a host file on the board.
    pub fn execfile(&self, path: impl AsRef<Path>) -> Result<String> {
        let code = std::fs::read_to_string(path.as_ref())?;
        self.exec(&code)
    }

    /// Writes raw bytes to the board outside of any exchange.
    pub fn write_raw(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.link.lock();
        let Some(link) = guard.as_mut().filter(|_| self.is_open()) else {
            return Err(Error::closed(&self.endpoint));
        };
        if let Err(e) = link.write_all(data) {
            if let Some(mut link) = guard.take() {
                link.close();
            }
            return Err(Error::Transport(format!("{}: {e}", self.endpoint)));
        }
        Ok(())
    }

    /// Opens a second handle for a concurrent reader, plus any bytes
    /// already buffered.
    pub(crate) fn reader(&self) -> Result<(Box<dyn Transport>, Vec<u8>)> {
        let mut guard = self.link.lock();
        let Some(link) = guard.as_mut().filter(|_| self.is_open()) else {
            return Err(Error::closed(&self.endpoint));
        };
        let reader = link
            .transport()
            .try_clone()
            .map_err(|e| Error::Transport(format!("{}: {e}", self.endpoint)))?;
        Ok((reader, link.take_pending()))
    }

    /// Sets the board clock to the host's current UTC time.
    pub fn sync_time(&self) -> Result<()> {
        self.set_time(Utc::now().naive_utc())
    }

    /// Sets the board clock.
    pub fn set_time(&self, t: NaiveDateTime) -> Result<()> {
        self.remote(
            RemoteCall::new(&ops::SET_TIME)
                .arg(t.year())
                .arg(t.month())
                .arg(t.day())
                .arg(t.hour())
                .arg(t.minute())
                .arg(t.second()),
        )?;
        Ok(())
    }

    /// Reads the board clock.
    pub fn time(&self) -> Result<Option<NaiveDateTime>> {
        let value = self.remote_eval(RemoteCall::new(&ops::GET_TIME))?;
        let fields: Vec<i64> = value
            .as_ref()
            .and_then(Literal::as_seq)
            .map(|items| items.iter().filter_map(Literal::as_int).collect())
            .unwrap_or_default();
        let &[year, month, day, hour, minute, second, ..] = fields.as_slice() else {
            return Ok(None);
        };
        let date = NaiveDate::from_ymd_opt(
            i32::try_from(year).unwrap_or(0),
            u32::try_from(month).unwrap_or(0),
            u32::try_from(day).unwrap_or(0),
        );
        let field = |v: i64| u32::try_from(v).ok();
        Ok(date.and_then(|d| d.and_hms_opt(field(hour)?, field(minute)?, field(second)?)))
    }

    /// Station IP address, if the board is on a network.
    pub fn ip_address(&self) -> Result<Option<String>> {
        Ok(self
            .remote_eval(RemoteCall::new(&ops::GET_IP_ADDRESS))?
            .and_then(|v| v.as_str().map(str::to_owned)))
    }

    /// Station MAC address, if the board has a network interface.
    pub fn mac_address(&self) -> Result<Option<String>> {
        Ok(self
            .remote_eval(RemoteCall::new(&ops::GET_MAC_ADDRESS))?
            .and_then(|v| v.as_str().map(str::to_owned)))
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use chrono::NaiveDate;

    use super::*;
    use crate::config::ConfigStore;
    use crate::testing::{BoardState, FakeBoard, open_fake};

    #[test]
    fn open_probes_the_board() {
        let mut state = BoardState::default();
        state.put_dir("/sd");
        let (dev, board) = open_fake(state);

        assert_eq!(dev.name(), "pyboard");
        assert_eq!(dev.config().find("pyboard").as_deref(), Some(dev.id()));
        assert!(dev.has_buffer());
        assert_eq!(dev.root_dirs(), ["/flash/", "/sd/"]);
        assert!(dev.is_root_path("/flash/main.py"));
        assert!(dev.is_root_path("/sd"));
        assert!(!dev.is_root_path("/home"));
        assert_eq!(dev.status(), Status::Open);

        let state = board.state.lock();
        assert_eq!(state.calls, ["board_name", "test_buffer", "listdir", "set_time"]);
        assert_eq!(state.rtc.as_ref().map(Vec::len), Some(6));
    }

    #[test]
    fn unnamed_board_keeps_default_name() {
        let state = BoardState {
            name: None,
            ..BoardState::default()
        };
        let (dev, _board) = open_fake(state);
        assert_eq!(dev.name(), "default");
    }

    #[test]
    fn remote_eval_parses_or_yields_none() {
        let (dev, _board) = open_fake(BoardState::default());
        let v = dev
            .remote_eval(RemoteCall::new(&ops::LISTDIR).arg("/"))
            .unwrap();
        assert_eq!(v, Some(Literal::List(vec![Literal::Str("flash".into())])));

        // A missing directory makes the board print None.
        let v = dev
            .remote_eval(RemoteCall::new(&ops::LISTDIR).arg("/nope"))
            .unwrap();
        assert_eq!(v, None);
    }

    const PRINT_RAW: RemoteFn = RemoteFn {
        name: "print_raw",
        source: "def print_raw(text):\n    print(text)\n",
    };

    #[test]
    fn remote_eval_tolerates_unparsable_output() {
        let (dev, _board) = open_fake(BoardState::default());
        let v = dev.remote_eval(RemoteCall::new(&PRINT_RAW).arg("42")).unwrap();
        assert_eq!(v, Some(Literal::Int(42)));

        let v = dev
            .remote_eval(RemoteCall::new(&PRINT_RAW).arg("not-a-value"))
            .unwrap();
        assert_eq!(v, None);
        assert_eq!(dev.status(), Status::Open);
        assert_eq!(dev.remote(RemoteCall::new(&PRINT_RAW).arg("x y")).unwrap(), "x y\r\n");
    }

    #[test]
    fn exec_reports_remote_exceptions() {
        let (dev, _board) = open_fake(BoardState::default());
        assert_eq!(dev.exec("print('hi')\n").unwrap(), "hi\r\n");
        let err = dev.exec("raise ValueError('boom')\n").unwrap_err();
        assert!(matches!(err, Error::Remote(ref tb) if tb.contains("ValueError")), "{err}");
        assert!(dev.is_open());
    }

    #[test]
    fn execfile_reads_host_file() {
        let (dev, _board) = open_fake(BoardState::default());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.py");
        std::fs::write(&path, "print(7)\n").unwrap();
        assert_eq!(dev.execfile(&path).unwrap(), "7\r\n");
        assert!(matches!(dev.execfile(dir.path().join("missing.py")), Err(Error::Io(_))));
    }

    #[test]
    fn timeout_closes_device() {
        let (dev, board) = open_fake(BoardState::default());
        board.state.lock().hang = true;
        let err = dev
            .remote(RemoteCall::new(&ops::GET_TIME).timeout(Duration::from_millis(100)))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(dev.status(), Status::Closed);
    }

    #[test]
    fn close_cancels_a_call_in_flight() {
        let (dev, board) = open_fake(BoardState::default());
        board.state.lock().hang = true;
        thread::scope(|s| {
            let call = s.spawn(|| {
                let started = Instant::now();
                let res = dev.remote(RemoteCall::new(&ops::GET_TIME).timeout(Duration::from_secs(3)));
                (res, started.elapsed())
            });
            thread::sleep(Duration::from_millis(300));

            let started = Instant::now();
            assert_eq!(dev.status(), Status::Open);
            let _ = format!("{dev:?}");
            assert!(started.elapsed() < Duration::from_millis(50));

            dev.close();
            assert_eq!(dev.status(), Status::Closed);
            let (res, took) = call.join().unwrap();
            assert!(matches!(res, Err(Error::Transport(_))), "{res:?}");
            assert!(took < Duration::from_secs(1), "{took:?}");
        });
    }

    #[test]
    fn closed_device_performs_no_io() {
        let (transport, _board) = FakeBoard::spawn();
        let counters = Arc::clone(&transport.counters);
        let config: Arc<dyn BoardConfig> = Arc::new(ConfigStore::in_memory());
        let dev = Device::open(Box::new(transport), config, "default").unwrap();
        dev.close();

        let before = counters.total();
        assert!(matches!(
            dev.remote(RemoteCall::new(&ops::GET_TIME)),
            Err(Error::Transport(_))
        ));
        assert!(matches!(dev.exec("print(1)"), Err(Error::Transport(_))));
        assert!(matches!(dev.write_raw(b"x"), Err(Error::Transport(_))));
        assert_eq!(counters.total(), before);
    }

    #[test]
    fn board_queries() {
        let (dev, _board) = open_fake(BoardState::default());
        let t = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(12, 30, 5)
            .unwrap();
        dev.set_time(t).unwrap();
        assert_eq!(dev.time().unwrap(), Some(t));
        assert_eq!(dev.ip_address().unwrap().as_deref(), Some("192.168.4.1"));
        assert_eq!(
            dev.mac_address().unwrap().as_deref(),
            Some("24:0a:c4:00:01:02")
        );
    }

    #[test]
    fn constants_follow_configuration() {
        let (dev, _board) = open_fake(BoardState::default());
        let c = dev.constants();
        assert!(c.has_buffer);
        assert_eq!(c.buffer_size, 1024);

        dev.set("binary_transfer", Value::Bool(false)).unwrap();
        dev.set("buffer_size", Value::from(255)).unwrap();
        let c = dev.constants();
        assert!(!c.has_buffer);
        assert_eq!(c.buffer_size, 254);
    }
}
