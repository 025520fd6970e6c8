use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod config;
mod dispatch;
mod lease;
mod paths;
mod protocol;
mod provision;
mod reconcile;
mod sandbox;
mod server;
mod sync;
mod templates;
mod transport;

#[derive(Parser)]
#[command(name = "boxrun")]
#[command(
    author,
    version,
    about = "Run commands in a remote sandbox against your local tree"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync the project into the sandbox, run a command there and bring results back
    Run {
        /// Project root to sync (default: current directory)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Glob of files to bring back, relative to the root (repeatable)
        #[arg(long = "collect", value_name = "GLOB")]
        collect: Vec<String>,

        /// Only bring back files modified by the command
        #[arg(long)]
        modified_only: bool,

        /// Command to run in the sandbox
        #[arg(last = true, required = true, value_name = "ARGV")]
        argv: Vec<String>,
    },

    /// Run the sandbox agent (inside the sandbox)
    Serve {
        /// Directory all file and task operations are scoped to
        #[arg(long, default_value = "/workspace/src")]
        root: PathBuf,

        /// Address to listen on
        #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
        bind: IpAddr,

        /// Port to listen on
        #[arg(long, default_value_t = 50051)]
        port: u16,

        /// Directory holding the lease file
        #[arg(long, default_value = "/tmp/boxrun")]
        state_dir: PathBuf,

        /// Command prefix for tasks, shell-quoted (e.g. "make -s")
        #[arg(long, allow_hyphen_values = true)]
        launcher: Option<String>,

        /// Maximum size of one protocol message in bytes
        #[arg(long, default_value_t = protocol::DEFAULT_MAX_FRAME_BYTES)]
        max_frame_bytes: usize,

        /// Also write logs to this file
        #[arg(long)]
        log_file: Option<PathBuf>,
    },

    /// Print a file from the sandbox root
    Fetch {
        /// Path relative to the sandbox root
        path: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Manage sandboxes
    Sandbox {
        #[command(subcommand)]
        action: commands::sandbox::SandboxAction,
    },

    /// Write a boxrun.toml in the current project
    Init {
        /// Force overwrite existing files
        #[arg(short, long)]
        force: bool,
    },
}

/// Installs the global subscriber. The returned guard flushes the log file.
fn init_logging(verbose: bool, json: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = if verbose {
        EnvFilter::new("boxrun=debug")
    } else {
        EnvFilter::new("boxrun=info")
    };

    // Logs go to stderr so task output on stdout stays clean.
    let (text_layer, json_layer) = if json {
        (None, Some(fmt::layer().json().with_writer(std::io::stderr)))
    } else {
        let layer = fmt::layer()
            .with_ansi(std::io::stderr().is_terminal())
            .with_writer(std::io::stderr);
        (Some(layer), None)
    };

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("Log file {} has no file name", path.display()))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(text_layer)
        .with(json_layer)
        .with(file_layer)
        .with(filter)
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_file = match &cli.command {
        Commands::Serve { log_file, .. } => log_file.as_deref(),
        _ => None,
    };
    let _log_guard = init_logging(cli.verbose, cli.log_json, log_file)?;

    match cli.command {
        Commands::Run {
            root,
            collect,
            modified_only,
            argv,
        } => {
            let code = commands::run::run(commands::run::RunOptions {
                root,
                collect,
                modified_only,
                argv,
            })
            .await?;
            return Ok(ExitCode::from(code));
        }
        Commands::Serve {
            root,
            bind,
            port,
            state_dir,
            launcher,
            max_frame_bytes,
            log_file: _,
        } => {
            commands::serve::run(commands::serve::ServeOptions {
                root,
                bind,
                port,
                state_dir,
                launcher,
                max_frame_bytes,
            })
            .await?;
        }
        Commands::Fetch { path, output } => {
            commands::fetch::run(path, output).await?;
        }
        Commands::Sandbox { action } => {
            commands::sandbox::run(action).await?;
        }
        Commands::Init { force } => {
            commands::init::run(force)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
