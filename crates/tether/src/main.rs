use std::env;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::LevelFilter;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tether::config::DaemonPaths;
use tether::{AppConfig, DaemonContext};

const APP_NAME: &str = "tether";

fn main() {
    match try_main() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            let _ = writeln!(io::stderr(), "{err:?}");
            std::process::exit(1);
        }
    }
}

fn try_main() -> Result<i32> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging();
    debug!("resolved paths: {:#?}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => async_serve(ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd).map(|()| 0),
        Command::Config { command } => handle_config(&ctx, command).map(|()| 0),
        Command::Completions { shell } => handle_completions(shell).map(|()| 0),
    }
}

#[tokio::main]
async fn async_serve(ctx: RuntimeContext, cmd: ServeCommand) -> Result<i32> {
    handle_serve(ctx, cmd).await
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Tether - agent session daemon with real-time state sync.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true)]
    no_color: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the daemon
    Serve(ServeCommand),
    /// Write the default configuration file
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Address to bind (overrides `server.host`)
    #[arg(long, env = "TETHER_HOST")]
    host: Option<String>,
    /// Port to listen on (overrides `server.port`)
    #[arg(short, long, env = "TETHER_PORT")]
    port: Option<u16>,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Overwrite an existing config file
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    daemon: DaemonPaths,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = match common.config.clone() {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };
        let config = load_or_init_config(&config_file)?;
        let daemon = resolve_daemon_paths(&config)?;
        Ok(Self {
            common,
            paths: AppPaths {
                config_file,
                daemon,
            },
            config,
        })
    }

    fn init_logging(&self) {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Error);
        }
        let level = self.effective_log_level();
        let level_name = level.to_string().to_lowercase();

        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{APP_NAME}={level_name},tower_http={level_name}"))
        });

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let disable_color = self.common.no_color
                || env::var_os("NO_COLOR").is_some()
                || !io::stderr().is_terminal();
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_ansi(!disable_color))
                .try_init()
                .ok();
        }

        // The hub modules log through the `log` facade.
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(level);
        builder.try_init().ok();
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.quiet {
            LevelFilter::Error
        } else if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

async fn handle_serve(ctx: RuntimeContext, cmd: ServeCommand) -> Result<i32> {
    let host = cmd.host.unwrap_or_else(|| ctx.config.server.host.clone());
    let port = cmd.port.unwrap_or(ctx.config.server.port);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .context("invalid address")?;
    let shutdown_timeout = Duration::from_secs(ctx.config.shutdown.timeout_secs);

    let daemon = DaemonContext::open(ctx.config.clone(), &ctx.paths.daemon).await?;
    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;
    info!("Listening on http://{}", addr);

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let server = axum::serve(listener, daemon.router())
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let mut server_task = tokio::spawn(async move { server.await });

    tokio::select! {
        _ = shutdown.cancelled() => {}
        result = &mut server_task => {
            daemon.cleanup().await;
            result.context("server task panicked")?.context("running server")?;
            return Ok(0);
        }
    }

    info!("Shutting down");
    let stopped = tokio::time::timeout(shutdown_timeout, async {
        daemon.cleanup().await;
        server_task.await
    })
    .await;

    match stopped {
        Ok(Ok(Ok(()))) => {
            info!("Shutdown complete");
            Ok(0)
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "Server stopped with an error");
            Ok(1)
        }
        Ok(Err(e)) => {
            error!(error = %e, "Server task failed");
            Ok(1)
        }
        Err(_) => {
            error!(timeout_secs = shutdown_timeout.as_secs(), "Shutdown timed out");
            Ok(1)
        }
    }
}

/// Cancel `shutdown` on the first SIGINT/SIGTERM; a second one exits at once.
async fn watch_signals(shutdown: CancellationToken) {
    if let Err(e) = wait_for_signal().await {
        warn!(error = %e, "Failed to listen for shutdown signals");
        return;
    }
    info!("Shutdown signal received");
    shutdown.cancel();

    if wait_for_signal().await.is_ok() {
        warn!("Second signal received, exiting immediately");
        std::process::exit(1);
    }
}

async fn wait_for_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    let path = &ctx.paths.config_file;
    if path.exists() && !cmd.force {
        let body = fs::read_to_string(path).unwrap_or_default();
        if body != default_config_body(path)? {
            return Err(anyhow!(
                "config already exists at {} (use --force to overwrite)",
                path.display()
            ));
        }
    }
    write_default_config(path)?;
    fs::create_dir_all(&ctx.paths.daemon.data_dir).with_context(|| {
        format!(
            "creating data directory {}",
            ctx.paths.daemon.data_dir.display()
        )
    })?;
    println!("{}", path.display());
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else {
                print!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => write_default_config(&ctx.paths.config_file),
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

fn load_or_init_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        write_default_config(path)?;
    }

    let built = Config::builder()
        .add_source(File::from(path).format(FileFormat::Toml).required(false))
        .add_source(Environment::with_prefix("TETHER").separator("__"))
        .build()?;
    built
        .try_deserialize()
        .with_context(|| format!("parsing config file {}", path.display()))
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }
    fs::write(path, default_config_body(path)?)
        .with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_body(path: &Path) -> Result<String> {
    let toml = toml::to_string_pretty(&AppConfig::default())
        .context("serializing default config to TOML")?;
    Ok(format!(
        "# Configuration for {APP_NAME}\n# File: {}\n\n{toml}",
        path.display()
    ))
}

fn resolve_daemon_paths(config: &AppConfig) -> Result<DaemonPaths> {
    let data_dir = match config.paths.data_dir.as_deref() {
        Some(dir) => expand_str_path(dir)?,
        None => default_data_dir()?,
    };
    let worktree_dir = match config.paths.worktree_dir.as_deref() {
        Some(dir) => expand_str_path(dir)?,
        None => data_dir.join("worktrees"),
    };
    Ok(DaemonPaths {
        data_dir,
        worktree_dir,
    })
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    match path.to_str() {
        Some(text) => expand_str_path(text),
        None => Ok(path),
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }
    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }
    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }
    if let Some(dir) = dirs::data_dir() {
        return Ok(dir.join(APP_NAME));
    }
    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}
