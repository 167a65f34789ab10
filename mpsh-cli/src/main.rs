//! CLI for MicroPython boards.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod board;
mod files;
mod settings;
#[cfg(unix)]
mod term;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use mpsh::{BoardConfig, ConfigStore, ConnectionRegistry, DEFAULT_SECTION, Device};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mpsh", version, about = "Remote shell for MicroPython boards")]
struct Cli {
    /// Board configuration file (default: $MPSH_CONFIG_FILE, then the
    /// platform config directory).
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Serial port of the board (default: scan USB ports).
    #[arg(short = 'p', long, global = true, conflicts_with = "host")]
    port: Option<String>,

    /// Host name or address of a board running a telnet server.
    #[arg(long, global = true)]
    host: Option<String>,

    /// Name of the board to operate on (default: the first connected).
    #[arg(short = 'b', long, global = true, default_value = "")]
    board: String,

    /// Log protocol traffic.
    #[arg(short = 'd', long, global = true, conflicts_with = "quiet")]
    debug: bool,

    /// Only log warnings and errors.
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List connected boards.
    Boards,

    /// List USB serial ports with a MicroPython board attached.
    Scan,

    /// Run a host file on the board.
    Run {
        /// Python source file.
        file: PathBuf,
    },

    /// Run a line of code on the board.
    Exec {
        /// Python statements.
        code: String,
    },

    /// Enter the board's REPL. Control-X leaves.
    ///
    /// An optional line is sent first; `~` separates statements and a
    /// trailing `~` leaves once the board stops printing.
    Repl {
        /// Line to send after waking the prompt.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        line: Vec<String>,
    },

    /// Synchronize a destination tree with a source tree.
    Rsync(files::RsyncArgs),

    /// Copy a file between host and board.
    Cp(files::CpArgs),

    /// List a directory.
    Ls(files::LsArgs),

    /// Create directories.
    Mkdir {
        /// Directories to create.
        #[arg(required = true, num_args = 1..)]
        paths: Vec<String>,
    },

    /// Remove files and directories.
    Rm(files::RmArgs),

    /// Show the board clock.
    Time {
        /// Set the board clock to host time first.
        #[arg(long)]
        now: bool,
    },

    /// Show the board's IP address.
    Ip,

    /// Show the board's MAC address.
    Mac,

    /// Show or change board configuration.
    Config {
        #[command(subcommand)]
        action: settings::ConfigAction,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.quiet);
    if let Err(e) = cli.dispatch() {
        eprintln!("mpsh: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(debug: bool, quiet: bool) {
    let level = if debug {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_env("MPSH_LOG").unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

/// Configuration file: `-c`, then `$MPSH_CONFIG_FILE`, then the platform
/// config directory.
fn config_path(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = flag {
        return Ok(path);
    }
    if let Some(path) = std::env::var_os("MPSH_CONFIG_FILE") {
        return Ok(PathBuf::from(path));
    }
    Ok(dirs::config_dir()
        .context("no platform config directory")?
        .join("mpsh")
        .join("boards.json"))
}

impl Cli {
    fn dispatch(self) -> Result<()> {
        let path = config_path(self.config)?;
        let config = Arc::new(
            ConfigStore::open(&path)
                .with_context(|| format!("opening configuration {}", path.display()))?,
        );
        let session = Session::new(config, self.board, self.port, self.host);

        match self.command {
            Command::Scan => board::scan(),
            Command::Config { action } => settings::run(&session, action),
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "mpsh", &mut std::io::stdout());
                Ok(())
            }
            Command::Boards => {
                session.connect()?;
                board::boards(&session)
            }
            Command::Run { file } => board::run(&*session.connect()?, &file),
            Command::Exec { code } => board::exec(&*session.connect()?, &code),
            Command::Repl { line } => board::repl(&*session.connect()?, &line.join(" ")),
            Command::Time { now } => board::time(&*session.connect()?, now),
            Command::Ip => board::ip(&*session.connect()?),
            Command::Mac => board::mac(&*session.connect()?),
            Command::Rsync(args) => {
                session.connect()?;
                files::rsync(&session, &args)
            }
            Command::Cp(args) => {
                session.connect()?;
                files::cp(&session, &args)
            }
            Command::Ls(args) => {
                session.connect()?;
                files::ls(&session, &args)
            }
            Command::Mkdir { paths } => {
                session.connect()?;
                files::mkdir(&session, &paths)
            }
            Command::Rm(args) => {
                session.connect()?;
                files::rm(&session, &args)
            }
        }
    }
}

/// Configuration and connections shared by all commands.
pub(crate) struct Session {
    pub(crate) registry: ConnectionRegistry,
    pub(crate) config: Arc<ConfigStore>,
    board: String,
    port: Option<String>,
    host: Option<String>,
}

impl Session {
    fn new(config: Arc<ConfigStore>, board: String, port: Option<String>, host: Option<String>) -> Self {
        let shared: Arc<dyn BoardConfig> = Arc::<ConfigStore>::clone(&config);
        Self {
            registry: ConnectionRegistry::new(shared),
            config,
            board,
            port,
            host,
        }
    }

    /// Connects to the board named on the command line, or to every board
    /// found on USB, falling back to the configured port. Returns the
    /// selected board.
    fn connect(&self) -> Result<Arc<Device>> {
        if let Some(host) = &self.host {
            self.registry.connect_network(host)?;
            return self.device();
        }

        let interrupt = Arc::new(AtomicBool::new(false));
        // A second Ctrl-C while the first is pending exits.
        signal_hook::flag::register_conditional_shutdown(
            signal_hook::consts::SIGINT,
            130,
            Arc::clone(&interrupt),
        )?;
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupt))?;

        if let Some(port) = &self.port {
            self.registry.connect_serial(port, Some(interrupt))?;
            return self.device();
        }
        let found = mpsh::scan()?;
        if found.is_empty() {
            let cfg: &dyn BoardConfig = self.config.as_ref();
            let port = cfg.get_str(DEFAULT_SECTION, "port", "/dev/ttyUSB0");
            self.registry.connect_serial(&port, Some(interrupt))?;
            return self.device();
        }
        for port in found {
            if let Err(e) = self.registry.connect_serial(&port.path, Some(Arc::clone(&interrupt))) {
                tracing::warn!("{}: {e}", port.path);
            }
        }
        self.device()
    }

    /// The board selected with `-b`, or the default board.
    pub(crate) fn device(&self) -> Result<Arc<Device>> {
        self.registry
            .find_by_name(&self.board)
            .with_context(|| match self.board.as_str() {
                "" => "no board connected".to_owned(),
                name => format!("no board named {name:?}"),
            })
    }

    /// Name given with `-b`; empty when none was.
    pub(crate) fn board_name(&self) -> &str {
        &self.board
    }

    /// Config id of the selected board, or the default section.
    pub(crate) fn board_id(&self) -> String {
        if self.board.is_empty() {
            if let Some(dev) = self.registry.default_device() {
                return dev.id().to_owned();
            }
            return DEFAULT_SECTION.to_owned();
        }
        let cfg: &dyn BoardConfig = self.config.as_ref();
        cfg.find(&self.board)
            .unwrap_or_else(|| DEFAULT_SECTION.to_owned())
    }
}
