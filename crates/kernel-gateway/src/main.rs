//! kernel-gateway CLI entry point.
//!
//! Launches (or attaches to) a Jupyter kernel and serves it over two
//! WebSocket endpoints until Ctrl-C or the kernel exits.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use kernel_gateway::{Gateway, GatewayConfig, KernelSource, SessionMode};
use log::info;

#[derive(Parser, Debug)]
#[command(name = "kernel-gateway")]
#[command(about = "Serve a Jupyter kernel to WebSocket clients")]
struct Cli {
    /// JSON configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Interface to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port of the shell endpoint
    #[arg(long)]
    websocket_port: Option<u16>,

    /// Port of the control endpoint (default: websocket port + 1)
    #[arg(long)]
    control_port: Option<u16>,

    /// Launch an installed kernelspec
    #[arg(long, conflicts_with_all = ["cmd", "connection_file"])]
    kernelspec: Option<String>,

    /// Kernel command line; `{connection_file}` is replaced with the path
    #[arg(long, conflicts_with = "connection_file")]
    cmd: Option<String>,

    /// Attach to a running kernel instead of launching one
    #[arg(long)]
    connection_file: Option<PathBuf>,

    /// Session mode passed to the auxiliary services (console, notebook, background or 0-2)
    #[arg(long)]
    session_mode: Option<SessionMode>,

    /// Install auxiliary services by importing this Python module in the kernel
    #[arg(long, value_name = "MODULE", conflicts_with = "no_register")]
    register: Option<String>,

    /// Skip installing auxiliary services even if the config file enables them
    #[arg(long)]
    no_register: bool,

    /// Maximum WebSocket message size in bytes
    #[arg(long)]
    max_frame_size: Option<usize>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    logfile: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<GatewayConfig> {
        let mut config = match &self.config {
            Some(path) => GatewayConfig::load(path)?,
            None => GatewayConfig::default(),
        };

        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.websocket_port {
            config.shell_port = port;
        }
        if let Some(port) = self.control_port {
            config.control_port = Some(port);
        }
        if let Some(name) = self.kernelspec {
            config.kernel.source = KernelSource::Kernelspec { name };
        }
        if let Some(cmd) = self.cmd {
            let argv: Vec<String> = cmd.split_whitespace().map(String::from).collect();
            if argv.is_empty() {
                anyhow::bail!("--cmd must not be empty");
            }
            config.kernel.source = KernelSource::Command { argv };
        }
        if let Some(path) = self.connection_file {
            config.kernel.source = KernelSource::ConnectionFile { path };
        }
        if let Some(mode) = self.session_mode {
            config.registration.session_mode = mode;
        }
        if let Some(module) = self.register {
            config.registration.enabled = true;
            config.registration.module = module;
        }
        if self.no_register {
            config.registration.enabled = false;
        }
        if let Some(size) = self.max_frame_size {
            config.max_frame_size = size;
        }
        Ok(config)
    }
}

fn init_logging(level: &str, logfile: Option<&PathBuf>) -> anyhow::Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    if let Some(path) = logfile {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.logfile.as_ref())?;
    let config = cli.into_config()?;

    info!("kernel-gateway starting...");
    info!("  Host: {}", config.host);
    info!("  Shell port: {}", config.shell_port);
    info!("  Control port: {}", config.control_port());
    info!("  Kernel: {:?}", config.kernel.source);

    let gateway = Gateway::new(config);
    if let Err(e) = gateway.start().await {
        gateway.stop().await;
        return Err(e.into());
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
        _ = gateway.wait() => info!("Gateway stopping"),
    }

    gateway.stop().await;
    Ok(())
}
