//! radiopadre launcher
//!
//! `padre [NOTEBOOK]` starts a notebook session on the first available
//! backend and supervises it until the user types `exit`, detaches, or
//! interrupts it. Container sessions can be listed, resumed and killed.
//! `padre '#N'` starts recent session N again; `padre recent` lists them.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use padre_cli::commands::{self, LoadOptions};
use padre_cli::output::{print_error, print_info};
use padre_cli::{parse_port_list, parse_recent_ref, remediation_for};
use padre_core::config::ClientConfig;
use padre_core::recent::{recent_sessions_path, session_key};
use padre_core::TransportKind;

#[derive(Parser)]
#[command(name = "padre")]
#[command(author, version, about = "Launch and supervise radiopadre notebook sessions")]
#[command(propagate_version = true, args_conflicts_with_subcommands = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Backend to use: venv, docker, singularity, k8s or ssh
    #[arg(short, long, global = true)]
    backend: Option<TransportKind>,

    /// Remote host for the ssh backend (implies --backend ssh)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Browser command to open once the session is up ("none" to disable)
    #[arg(long, global = true)]
    browser: Option<String>,

    /// Container image for docker, singularity and k8s sessions
    #[arg(long, global = true)]
    image: Option<String>,

    /// Keep container sessions running after exit, and allow detaching
    #[arg(long, global = true)]
    persist: bool,

    /// Ports chosen by a calling client (set when padre runs over ssh)
    #[arg(long, value_name = "PORTS", global = true, hide = true)]
    remote: Option<String>,

    #[command(flatten)]
    load: LoadArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Debug, Default)]
struct LoadArgs {
    /// Notebook or directory to open, or `#N` to rerun recent session N
    notebook: Option<String>,

    /// Mount the session directory read-only
    #[arg(long)]
    read_only: bool,

    /// Reinstall the session environment before starting
    #[arg(long)]
    auto_init: bool,

    /// Extra arguments passed to the runscript
    #[arg(last = true)]
    extra: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new session (the default)
    Load(LoadArgs),

    /// Reattach to a running session
    Resume {
        /// Session number from `padre ps`, or container id
        session: Option<String>,
    },

    /// List running sessions
    Ps,

    /// List recently used command lines
    Recent,

    /// Kill running sessions
    Kill {
        /// Session numbers or container ids, or `all`
        #[arg(required = true)]
        sessions: Vec<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };

    // a calling client parses our output, so keep it free of escape codes
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(cli.remote.is_none())
                .with_writer(std::io::stderr),
        )
        .init();

    let code = match run(cli, argv).await {
        Ok(code) => code,
        Err(e) => {
            print_error(&format!("{:#}", e));
            if let Some(fix) = remediation_for(&e) {
                print_info(&fix);
            }
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli, argv: Vec<String>) -> Result<i32> {
    match &cli.command {
        Some(Commands::Config { action }) => {
            let path = cli.config.as_ref();
            match action {
                ConfigAction::Show => commands::config_show(path)?,
                ConfigAction::Init { force } => commands::config_init(path, *force)?,
                ConfigAction::Path => println!("{}", commands::config_path(path).display()),
            }
            return Ok(0);
        }
        Some(Commands::Recent) => {
            commands::recent_command(&recent_sessions_path());
            return Ok(0);
        }
        _ => {}
    }

    let (cli, argv) = match recalled_index(&cli) {
        Some(index) => {
            let args = commands::recall_session(&recent_sessions_path(), index, &argv)?;
            let cli = Cli::try_parse_from(std::iter::once("padre".to_string()).chain(args.iter().cloned()))?;
            (cli, args)
        }
        None => (cli, argv),
    };

    let mut config = commands::load_client_config(cli.config.as_ref())?;
    let preferred = apply_overrides(&mut config, &cli);

    match cli.command {
        None => {
            let options = load_options(cli.load, cli.remote.as_deref(), &config)?;
            remember(&options, cli.remote.as_deref(), preferred, &config, &argv);
            commands::load_command(&config, preferred, options, interrupt_token()).await
        }
        Some(Commands::Load(args)) => {
            let options = load_options(args, cli.remote.as_deref(), &config)?;
            remember(&options, cli.remote.as_deref(), preferred, &config, &argv);
            commands::load_command(&config, preferred, options, interrupt_token()).await
        }
        Some(Commands::Resume { session }) => {
            commands::resume_command(&config, preferred, session.as_deref(), interrupt_token()).await
        }
        Some(Commands::Ps) => commands::ps_command(&config, preferred).await.map(|_| 0),
        Some(Commands::Kill { sessions }) => {
            commands::kill_command(&config, preferred, &sessions).await.map(|_| 0)
        }
        Some(Commands::Config { .. }) | Some(Commands::Recent) => Ok(0),
    }
}

/// Index of the recent session asked for with `padre '#N'`
fn recalled_index(cli: &Cli) -> Option<usize> {
    let load = match &cli.command {
        None => &cli.load,
        Some(Commands::Load(args)) => args,
        _ => return None,
    };
    load.notebook.as_deref().and_then(parse_recent_ref)
}

/// Remember a local invocation so it can be rerun with `padre '#0'`
///
/// Invocations made on behalf of a calling client are not remembered.
fn remember(
    options: &LoadOptions,
    remote: Option<&str>,
    backend: Option<TransportKind>,
    config: &ClientConfig,
    argv: &[String],
) {
    if remote.is_some() {
        return;
    }
    let workdir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let key = session_key(backend, config.ssh.host.as_deref(), &workdir, options.notebook.as_deref());
    commands::remember_session(&recent_sessions_path(), key, argv);
}

/// Fold command-line settings into the config; returns the requested backend
fn apply_overrides(config: &mut ClientConfig, cli: &Cli) -> Option<TransportKind> {
    if let Some(browser) = &cli.browser {
        config.browser.command = Some(browser.clone());
    }
    if let Some(image) = &cli.image {
        config.docker_image = image.clone();
    }
    if cli.persist {
        config.container_persist = true;
    }
    if let Some(host) = &cli.host {
        config.ssh.host = Some(host.clone());
        return Some(cli.backend.unwrap_or(TransportKind::Ssh));
    }
    cli.backend
}

fn load_options(args: LoadArgs, remote: Option<&str>, config: &ClientConfig) -> Result<LoadOptions> {
    let userside_ports = remote
        .map(|ports| parse_port_list(ports, config.num_ports))
        .transpose()?;
    let mut extra_args = args.extra;
    if args.auto_init {
        extra_args.insert(0, "--auto-init".to_string());
    }
    Ok(LoadOptions {
        notebook: args.notebook,
        read_only: args.read_only,
        userside_ports,
        extra_args,
        workdir: None,
    })
}

/// Token cancelled by the first Ctrl+C or SIGTERM
///
/// Later signals only print a reminder; cleanup always runs to completion.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();

        loop {
            #[cfg(unix)]
            let terminate = async {
                match sigterm.as_mut() {
                    Some(s) => {
                        s.recv().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        tracing::warn!("cannot listen for Ctrl+C: {}", e);
                        return;
                    }
                    tracing::debug!("received Ctrl+C");
                }
                _ = terminate => {
                    tracing::debug!("received SIGTERM");
                }
            }

            if cancel_clone.is_cancelled() {
                tracing::warn!("cleanup in progress, please wait");
            } else {
                cancel_clone.cancel();
            }
        }
    });
    cancel
}
