use anyhow::{Context, Result};
use axon_upload::common::config_commands::{run_config_path, run_config_reset, run_config_show};
use axon_upload::common::config::MAX_URL_EXPIRE_MINUTES;
use axon_upload::common::ProviderKind;
use axon_upload::{ManagerOptions, TunnelEvent, UploadManager};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "axon-upload")]
#[command(about = "Share local files through a Cloudflare quick tunnel")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve files and print their links until they expire or Ctrl-C
    Share {
        #[arg(required = true, help = "Files to share")]
        files: Vec<PathBuf>,

        #[arg(
            long,
            value_parser = clap::value_parser!(u64).range(..=MAX_URL_EXPIRE_MINUTES),
            help = "Minutes each link stays valid (defaults to config)"
        )]
        expire: Option<u64>,

        #[arg(long, value_enum, help = "Provider for this run (defaults to config)")]
        provider: Option<ProviderArg>,
    },

    /// Manage the cloudflared binary
    Binary {
        #[command(subcommand)]
        command: BinaryCommand,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum BinaryCommand {
    /// Show whether cloudflared is installed
    Check,
    /// Download cloudflared for this platform
    Download,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print config file path
    Path,
    /// Show config file contents and flag problems with it
    Show {
        /// Print the merged result of defaults, file and AXON_UPLOAD_* variables
        #[arg(long)]
        effective: bool,
    },
    /// Back up the config file and reset it to defaults
    Reset {
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProviderArg {
    Local,
    Cloudflare,
}

impl From<ProviderArg> for ProviderKind {
    fn from(arg: ProviderArg) -> Self {
        match arg {
            ProviderArg::Local => ProviderKind::Local,
            ProviderArg::Cloudflare => ProviderKind::Cloudflare,
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Share {
            files,
            expire,
            provider,
        } => share(files, expire, provider.map(Into::into)).await,
        Commands::Binary { command } => binary(command).await,
        Commands::Config { command } => match command {
            ConfigCommand::Path => run_config_path(),
            ConfigCommand::Show { effective } => run_config_show(effective),
            ConfigCommand::Reset { yes } => run_config_reset(yes).map(|_| ()),
        },
    }
}

async fn share(
    paths: Vec<PathBuf>,
    expire: Option<u64>,
    provider: Option<ProviderKind>,
) -> Result<()> {
    // fail fast before spinning anything up
    for path in &paths {
        if !path.is_file() {
            anyhow::bail!("File not found: {}", path.display());
        }
    }

    let manager = UploadManager::new(ManagerOptions::default());
    manager
        .override_config(|config| {
            if let Some(minutes) = expire {
                config.cloudflare.url_expire_minutes = minutes;
            }
            if let Some(kind) = provider {
                config.active_provider = kind;
            }
        })
        .context("Invalid share options")?;

    let progress = tokio::spawn(print_events(manager.subscribe()));

    let session = match manager.start_tunnel().await {
        Ok(session) => session,
        Err(e) => {
            manager.shutdown().await;
            return Err(e).context("Failed to start sharing");
        }
    };
    println!("Sharing via {}", session.url);

    let mut ids = Vec::with_capacity(paths.len());
    for path in &paths {
        let file = manager
            .register_file(path, None, None)
            .await
            .with_context(|| format!("Failed to register {}", path.display()))?;
        let link = file.external_url.clone().unwrap_or_default();
        println!("  {}  {}", file.original_name, link);
        ids.push(file.id);
    }

    let minutes = manager.config().url_expire_minutes();
    manager.mark_as_sent(&ids);
    println!("Links expire in {minutes} minute(s). Press Ctrl-C to stop.");

    let mut poll = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping...");
                break;
            }
            _ = poll.tick() => {
                if manager.files().is_empty() {
                    println!("All links expired.");
                    break;
                }
            }
        }
    }

    progress.abort();
    manager.stop_tunnel().await;
    manager.shutdown().await;
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<TunnelEvent>) {
    loop {
        match events.recv().await {
            Ok(TunnelEvent::DownloadProgress { percent }) => {
                eprint!("\rDownloading cloudflared... {percent}%");
                if percent == 100 {
                    eprintln!();
                }
            }
            Ok(TunnelEvent::Restarted { url }) => {
                println!("Tunnel restarted; links already shared are no longer valid. New base: {url}");
            }
            Ok(TunnelEvent::StatusChanged { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn binary(command: BinaryCommand) -> Result<()> {
    let manager = UploadManager::new(ManagerOptions::default());

    match command {
        BinaryCommand::Check => {
            let status = manager.check_binary().await;
            let state = if status.installed { "installed" } else { "not installed" };
            println!("cloudflared {} ({state})", status.version);
            println!("{}", status.path.display());
        }
        BinaryCommand::Download => {
            let path = manager
                .tunnel()
                .provisioner()
                .download(|percent| {
                    let mut stderr = std::io::stderr();
                    let _ = write!(stderr, "\rDownloading cloudflared... {percent}%");
                    let _ = stderr.flush();
                })
                .await
                .context("Failed to download cloudflared")?;
            eprintln!();
            println!("Installed {}", path.display());
        }
    }

    Ok(())
}
