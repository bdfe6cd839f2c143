mod commands;
mod monitor;
mod session;
mod ui;

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use crossterm::{
    event::{DisableMouseCapture, EnableMouseCapture},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use opc_da_client::com::{Activator, ComActivator, ComRuntime};
use opc_da_client::{ClientConfig, GroupDefaults, OpcDaClient, OpcProvider, OpcServer};
use ratatui::{Terminal, backend::CrosstermBackend};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::monitor::Monitor;
use crate::session::StopAfter;

#[derive(Parser)]
#[command(name = "opc-cli", version, about = "OPC DA client command line")]
struct Cli {
    /// Remote host; empty for this machine
    #[arg(long, global = true, default_value = "")]
    host: String,

    /// Write daily rolling logs into this directory instead of stderr
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Talk to the built-in simulated server
    #[cfg(feature = "simulator")]
    #[arg(long, global = true)]
    sim: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the OPC DA servers registered on the host
    Servers,
    /// Print the item IDs of a server's address space
    Browse {
        #[arg(short, long)]
        server: Option<String>,
        /// Stop after this many tags
        #[arg(long, default_value_t = 1000)]
        max: usize,
    },
    /// Read tags from the device
    Read {
        #[arg(short, long)]
        server: Option<String>,
        #[arg(required = true)]
        tags: Vec<String>,
    },
    /// Write one tag
    Write {
        #[arg(short, long)]
        server: Option<String>,
        tag: String,
        #[arg(allow_hyphen_values = true)]
        value: String,
        /// Value type (i1 i2 i4 i8 u1 u2 u4 u8 r4 r8 bool str date); guessed when omitted
        #[arg(long = "type")]
        var_type: Option<String>,
    },
    /// Show the server status
    Status {
        #[arg(short, long)]
        server: Option<String>,
    },
    /// Print data changes for tags
    Subscribe {
        #[arg(short, long)]
        server: Option<String>,
        #[arg(required = true)]
        tags: Vec<String>,
        /// Requested update rate in milliseconds
        #[arg(long, default_value_t = 1000)]
        rate: u32,
        /// Stop after this many data change callbacks
        #[arg(long)]
        count: Option<usize>,
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
        /// Show a live table instead of printing lines
        #[arg(long)]
        tui: bool,
    },
    /// Read tags through the asynchronous interface
    AsyncRead {
        #[arg(short, long)]
        server: Option<String>,
        #[arg(required = true)]
        tags: Vec<String>,
    },
    /// Write one tag through the asynchronous interface
    AsyncWrite {
        #[arg(short, long)]
        server: Option<String>,
        tag: String,
        #[arg(allow_hyphen_values = true)]
        value: String,
        #[arg(long = "type")]
        var_type: Option<String>,
    },
}

/// Where servers come from: the platform runtime or the simulator.
enum Backend {
    Platform,
    #[cfg(feature = "simulator")]
    Simulated(opc_da_client::sim::SimServer),
}

impl Backend {
    fn from_cli(cli: &Cli) -> Self {
        #[cfg(feature = "simulator")]
        if cli.sim {
            return Self::Simulated(opc_da_client::sim::SimServer::new());
        }
        let _ = cli;
        Self::Platform
    }

    fn default_server(&self) -> Option<&'static str> {
        match self {
            Self::Platform => None,
            #[cfg(feature = "simulator")]
            Self::Simulated(_) => Some(opc_da_client::sim::SIM_PROG_ID),
        }
    }

    fn server(&self, requested: Option<String>) -> Result<String> {
        match (requested, self.default_server()) {
            (Some(server), _) => Ok(server),
            (None, Some(server)) => Ok(server.to_string()),
            (None, None) => bail!("--server is required"),
        }
    }

    fn provider(&self, config: ClientConfig) -> Result<Box<dyn OpcProvider>> {
        let provider: Box<dyn OpcProvider> = match self {
            Self::Platform => Box::new(OpcDaClient::platform(config)?),
            #[cfg(feature = "simulator")]
            Self::Simulated(sim) => Box::new(OpcDaClient::new(sim.activator(), config)?),
        };
        Ok(provider)
    }

    fn connect(&self, server: &str, host: &str, config: ClientConfig) -> Result<OpcServer> {
        let activator: Box<dyn Activator> = match self {
            Self::Platform => Box::new(ComActivator),
            #[cfg(feature = "simulator")]
            Self::Simulated(sim) => Box::new(sim.activator()),
        };
        OpcServer::connect_with(activator.as_ref(), server, host, config)
            .with_context(|| format!("connecting to {server}"))
    }

    /// Moves the simulated tags while a subscription runs.
    fn start_ticker(&self) -> Option<tokio::task::JoinHandle<()>> {
        match self {
            Self::Platform => None,
            #[cfg(feature = "simulator")]
            Self::Simulated(sim) => {
                let sim = sim.clone();
                Some(tokio::spawn(async move {
                    use opc_da_client::variant::Value;
                    let mut interval = tokio::time::interval(Duration::from_millis(500));
                    let mut tick = 0i32;
                    loop {
                        interval.tick().await;
                        tick = tick.wrapping_add(1);
                        sim.set_tag("Simulation.Counter", Value::I32(tick));
                        sim.set_tag("Simulation.Ramp", Value::F64(f64::from(tick % 100)));
                        sim.publish_updates();
                    }
                }))
            }
        }
    }
}

fn init_logging(log_dir: Option<&PathBuf>) -> Option<tracing_appender_localtime::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender_localtime::rolling::daily(dir, "opc-cli.log");
            let (non_blocking, guard) = tracing_appender_localtime::non_blocking(file_appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log_dir.as_ref());
    tracing::info!("Starting OPC CLI");

    let backend = Backend::from_cli(&cli);
    let mut config = ClientConfig::default().with_client_name("opc-cli");
    let stdout = io::stdout();
    let mut out = stdout.lock();

    let ok = match cli.command {
        Command::Servers => {
            commands::servers(backend.provider(config)?.as_ref(), &cli.host, &mut out).await?;
            true
        }
        Command::Browse { server, max } => {
            let server = backend.server(server)?;
            commands::browse(backend.provider(config)?.as_ref(), &server, max, &mut out).await?;
            true
        }
        Command::Read { server, tags } => {
            let server = backend.server(server)?;
            commands::read(backend.provider(config)?.as_ref(), &server, tags, &mut out).await?;
            true
        }
        Command::Write {
            server,
            tag,
            value,
            var_type,
        } => {
            let server = backend.server(server)?;
            let value = commands::parse_value(&value, var_type.as_deref())?;
            commands::write(backend.provider(config)?.as_ref(), &server, &tag, value, &mut out)
                .await?
        }
        Command::Status { server } => {
            let server = backend.server(server)?;
            let _com = ComRuntime::new()?;
            let connection = backend.connect(&server, &cli.host, config)?;
            let result = session::status(&connection, &mut out);
            connection.disconnect()?;
            result?;
            true
        }
        Command::Subscribe {
            server,
            tags,
            rate,
            count,
            duration,
            tui,
        } => {
            let server = backend.server(server)?;
            config = config.with_groups(GroupDefaults {
                update_rate: rate,
                ..GroupDefaults::default()
            });
            let _com = ComRuntime::new()?;
            let connection = backend.connect(&server, &cli.host, config)?;
            let ticker = backend.start_ticker();
            let stop = StopAfter {
                events: count,
                duration: duration.map(Duration::from_secs),
            };
            let result = subscribe(&connection, &server, &tags, stop, tui, &mut out).await;
            if let Some(ticker) = ticker {
                ticker.abort();
            }
            connection.disconnect()?;
            result?;
            true
        }
        Command::AsyncRead { server, tags } => {
            let server = backend.server(server)?;
            let _com = ComRuntime::new()?;
            let connection = backend.connect(&server, &cli.host, config)?;
            let result = session::async_read(&connection, &tags, &mut out).await;
            connection.disconnect()?;
            result?;
            true
        }
        Command::AsyncWrite {
            server,
            tag,
            value,
            var_type,
        } => {
            let server = backend.server(server)?;
            let value = commands::parse_value(&value, var_type.as_deref())?;
            let _com = ComRuntime::new()?;
            let connection = backend.connect(&server, &cli.host, config)?;
            let result = session::async_write(&connection, &tag, value, &mut out).await;
            connection.disconnect()?;
            result?
        }
    };
    out.flush()?;
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn subscribe(
    connection: &OpcServer,
    server: &str,
    tags: &[String],
    stop: StopAfter,
    tui: bool,
    out: &mut impl Write,
) -> Result<()> {
    let mut subscription = session::subscribe(connection, tags, out)?;
    if !tui {
        let received = session::print_updates(&mut subscription, stop, out).await?;
        tracing::info!(received, "subscription finished");
        return Ok(());
    }

    let update_rate = subscription.temp.group.update_rate()?;
    let mut monitor = Monitor::new(server, update_rate, tags);

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = monitor::run(&mut terminal, &mut monitor, &mut subscription);

    // Restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    if let Err(err) = &res {
        tracing::error!(error = ?err, "Application error");
    }
    Ok(res?)
}
