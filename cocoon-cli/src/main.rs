//! CLI front-end for the Cocoon micro-VM engine.
//!
//! Every invocation loads [`cocoon_core::config::Config`] (defaults →
//! `--config` TOML → `COCOON_*` env → CLI flags), reconstructs whichever
//! backends the subcommand needs, runs the one requested operation, and
//! exits — there is no daemon and nothing survives the process (spec §9
//! "Global state").

#![allow(clippy::print_stdout, clippy::print_stderr, clippy::missing_docs_in_private_items)]

mod console;
mod gc;
mod image;
mod vm;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use cocoon_core::config::Config;

/// Micro-VM engine built on `cloud-hypervisor`.
#[derive(Parser)]
#[command(name = "cocoon", version, about = "Micro-VM engine built on cloud-hypervisor")]
struct Cli {
    /// TOML config file, layered under built-in defaults and above by `COCOON_*` env/CLI flags.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Persistent data root (images, indexes, firmware).
    #[arg(long, global = true)]
    root_dir: Option<PathBuf>,
    /// Ephemeral per-VM runtime root (sockets, PID files, COW disks).
    #[arg(long, global = true)]
    run_dir: Option<PathBuf>,
    /// Per-VM log root.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
    /// Directory containing CNI `.conflist` files.
    #[arg(long, global = true)]
    cni_conf_dir: Option<PathBuf>,
    /// Directory containing CNI plugin binaries.
    #[arg(long, global = true)]
    cni_bin_dir: Option<PathBuf>,
    /// Root password applied to cloud-image VMs via cloud-init.
    #[arg(long, global = true)]
    root_password: Option<String>,
    /// DNS servers for cloud-image VMs, comma- or semicolon-separated.
    #[arg(long, global = true)]
    dns: Option<String>,
    /// `tracing` filter directive (e.g. `info`, `cocoon_hypervisor=debug`).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pull, list, inspect, or remove OCI/cloud images.
    Image {
        #[command(subcommand)]
        action: ImageAction,
    },
    /// Create, start, stop, inspect, or remove VMs.
    Vm {
        #[command(subcommand)]
        action: VmAction,
    },
    /// Reclaim unreferenced blobs, stale run/log directories, and orphaned network state.
    Gc,
    /// Print the binary's version.
    Version,
    /// Generate a shell completion script.
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum ImageAction {
    /// Pull one or more image references (OCI refs or cloud-image URLs).
    Pull {
        /// Image reference(s) to pull.
        #[arg(required = true)]
        refs: Vec<String>,
    },
    /// List every pulled image.
    List {
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },
    /// Show detailed information about one image.
    Inspect {
        /// Image reference.
        r#ref: String,
    },
    /// Remove one or more images from the index (blobs are reclaimed by `gc`).
    Rm {
        /// Image reference(s) to remove.
        #[arg(required = true)]
        refs: Vec<String>,
    },
}

#[derive(Subcommand)]
enum VmAction {
    /// Create a VM without starting it.
    Create {
        #[command(flatten)]
        flags: vm::VmFlags,
        /// Image reference or cloud-image URL to boot from.
        image: String,
    },
    /// Create a VM, start it, and attach to its console until disconnect.
    Run {
        #[command(flatten)]
        flags: vm::VmFlags,
        image: String,
    },
    /// Create and start a VM, then attach to its console, leaving the VM running on disconnect.
    Debug {
        #[command(flatten)]
        flags: vm::VmFlags,
        image: String,
    },
    /// Start one or more existing VMs.
    Start {
        #[arg(required = true)]
        refs: Vec<String>,
    },
    /// Stop one or more running VMs.
    Stop {
        #[arg(required = true)]
        refs: Vec<String>,
    },
    /// List every known VM.
    List {
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },
    /// Show detailed information about one VM.
    Inspect {
        r#ref: String,
    },
    /// Attach to a running VM's console.
    Console {
        r#ref: String,
        /// Detach escape sequence: a single char, or caret notation (`^]`).
        #[arg(long, default_value = "^]")]
        escape_char: String,
    },
    /// Remove one or more VMs (stopping them first with `--force`).
    Rm {
        #[arg(long)]
        force: bool,
        #[arg(required = true)]
        refs: Vec<String>,
    },
}

/// Output format for list/info commands.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    init_tracing(&config.log_level);

    match cli.command {
        Command::Image { action } => image::dispatch(&config, action).await,
        Command::Vm { action } => vm::dispatch(&config, action).await,
        Command::Gc => gc::run(&config).await,
        Command::Version => {
            println!("cocoon {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Completion { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "cocoon", &mut std::io::stdout());
            Ok(())
        }
    }
}

/// Layers defaults → `--config` TOML → `COCOON_*` env → explicit CLI flags
/// (spec §10.3).
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    config = config.with_env_overrides();

    if let Some(v) = &cli.root_dir {
        config.root_dir = v.clone();
    }
    if let Some(v) = &cli.run_dir {
        config.run_dir = v.clone();
    }
    if let Some(v) = &cli.log_dir {
        config.log_dir = v.clone();
    }
    if let Some(v) = &cli.cni_conf_dir {
        config.cni_conf_dir = v.clone();
    }
    if let Some(v) = &cli.cni_bin_dir {
        config.cni_bin_dir = v.clone();
    }
    if let Some(v) = &cli.root_password {
        config.root_password = Some(v.clone());
    }
    if let Some(v) = &cli.dns {
        config.dns = cocoon_core::config::split_dns_list(v);
    }
    if let Some(v) = &cli.log_level {
        config.log_level.clone_from(v);
    }
    Ok(config)
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}
