//! Kernel subprocess management.
//!
//! The gateway writes a fresh connection file, spawns the kernel in its own
//! process group and owns it until shutdown. Shutdown is SIGTERM to the
//! group, a bounded wait, then SIGKILL.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use jupyter_protocol::ConnectionInfo;
use log::{debug, info, warn};
use tokio::process::{Child, Command};
use uuid::Uuid;

use crate::config::{KernelConfig, KernelSource, CONNECTION_FILE_PLACEHOLDER};

/// Reserve five local ports and a fresh signing key.
pub async fn ephemeral_connection_info(
    ip: IpAddr,
    kernel_name: Option<&str>,
) -> Result<ConnectionInfo> {
    let ports = runtimelib::peek_ports(ip, 5).await?;
    Ok(ConnectionInfo {
        transport: jupyter_protocol::connection_info::Transport::TCP,
        ip: ip.to_string(),
        stdin_port: ports[0],
        control_port: ports[1],
        hb_port: ports[2],
        shell_port: ports[3],
        iopub_port: ports[4],
        signature_scheme: "hmac-sha256".to_string(),
        key: Uuid::new_v4().to_string(),
        kernel_name: kernel_name.map(String::from),
    })
}

/// Load the connection file of a kernel someone else started.
pub async fn read_connection_file(path: &Path) -> Result<ConnectionInfo> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read connection file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("invalid connection file {}", path.display()))
}

/// A kernel subprocess owned by the gateway.
pub struct KernelProcess {
    child: Child,
    connection_info: ConnectionInfo,
    connection_file: Option<PathBuf>,
    #[cfg(unix)]
    process_group_id: Option<i32>,
}

impl KernelProcess {
    /// Launch a kernel with its connection file in the configured runtime
    /// directory, or the Jupyter one.
    pub async fn launch(config: &KernelConfig) -> Result<Self> {
        let runtime_dir = config
            .runtime_dir
            .clone()
            .unwrap_or_else(runtimelib::dirs::runtime_dir);
        Self::launch_in(config, &runtime_dir).await
    }

    /// Launch a kernel with its connection file in `runtime_dir`.
    pub async fn launch_in(config: &KernelConfig, runtime_dir: &Path) -> Result<Self> {
        let kernel_name = match &config.source {
            KernelSource::Kernelspec { name } => Some(name.as_str()),
            KernelSource::Command { .. } => None,
            KernelSource::ConnectionFile { path } => {
                bail!("kernel at {} is not owned by the gateway", path.display())
            }
        };

        let connection_info = ephemeral_connection_info(config.ip, kernel_name).await?;

        tokio::fs::create_dir_all(runtime_dir).await?;
        let kernel_id: String =
            petname::petname(2, "-").unwrap_or_else(|| Uuid::new_v4().to_string());
        let connection_file = runtime_dir.join(format!("kernel-gateway-{}.json", kernel_id));
        tokio::fs::write(
            &connection_file,
            serde_json::to_string_pretty(&connection_info)?,
        )
        .await?;

        let mut cmd = match build_command(config, &connection_file).await {
            Ok(cmd) => cmd,
            Err(e) => {
                let _ = std::fs::remove_file(&connection_file);
                return Err(e);
            }
        };
        cmd.envs(&config.env);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());

        #[cfg(unix)]
        cmd.process_group(0);

        let child = match cmd.kill_on_drop(true).spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = std::fs::remove_file(&connection_file);
                return Err(e).context("failed to spawn kernel");
            }
        };

        info!(
            "[kernel] Started kernel pid={:?} connection_file={}",
            child.id(),
            connection_file.display()
        );

        Ok(Self {
            #[cfg(unix)]
            process_group_id: child.id().and_then(|pid| i32::try_from(pid).ok()),
            child,
            connection_info,
            connection_file: Some(connection_file),
        })
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.connection_info
    }

    pub fn connection_file(&self) -> Option<&Path> {
        self.connection_file.as_deref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Exit status if the kernel has already exited.
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Wait up to `timeout` for the kernel to exit.
    pub async fn wait_for_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!("[kernel] Failed to wait for kernel: {}", e);
                None
            }
            Err(_) => None,
        }
    }

    /// Terminate the kernel, escalating to SIGKILL after `grace`.
    ///
    /// Safe to call repeatedly and after the kernel exited on its own.
    pub async fn shutdown(&mut self, grace: Duration) -> Option<ExitStatus> {
        let status = match self.try_wait() {
            Ok(Some(status)) => Some(status),
            _ => {
                self.terminate();
                match self.wait_for_exit(grace).await {
                    Some(status) => Some(status),
                    None => {
                        warn!(
                            "[kernel] Kernel did not exit within {:?} of SIGTERM, killing",
                            grace
                        );
                        self.kill();
                        self.wait_for_exit(grace).await
                    }
                }
            }
        };

        #[cfg(unix)]
        {
            self.process_group_id = None;
        }
        self.remove_connection_file();

        match status {
            Some(status) => info!("[kernel] Kernel exited: {}", status),
            None => warn!("[kernel] Kernel exit could not be confirmed"),
        }
        status
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        use nix::sys::signal::Signal;
        if !self.signal_group(Signal::SIGTERM) {
            let _ = self.child.start_kill();
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        let _ = self.child.start_kill();
    }

    #[cfg(unix)]
    fn kill(&mut self) {
        use nix::sys::signal::Signal;
        self.signal_group(Signal::SIGKILL);
        let _ = self.child.start_kill();
    }

    #[cfg(not(unix))]
    fn kill(&mut self) {
        let _ = self.child.start_kill();
    }

    /// Signal the whole process group so kernel children go down too.
    #[cfg(unix)]
    fn signal_group(&self, signal: nix::sys::signal::Signal) -> bool {
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let Some(pgid) = self.process_group_id else {
            return false;
        };
        match killpg(Pid::from_raw(pgid), signal) {
            Ok(()) => true,
            Err(nix::errno::Errno::ESRCH) => false,
            Err(e) => {
                warn!(
                    "[kernel] Failed to send {:?} to process group {}: {}",
                    signal, pgid, e
                );
                false
            }
        }
    }

    fn remove_connection_file(&mut self) {
        if let Some(path) = self.connection_file.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!("[kernel] Could not remove {}: {}", path.display(), e);
            }
        }
    }
}

impl Drop for KernelProcess {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.process_group_id.take() {
            if matches!(self.child.try_wait(), Ok(None)) {
                use nix::sys::signal::{killpg, Signal};
                use nix::unistd::Pid;
                let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
            }
        }
        self.remove_connection_file();
    }
}

async fn build_command(config: &KernelConfig, connection_file: &Path) -> Result<Command> {
    let (stdout, stderr) = if config.forward_output {
        (Stdio::inherit(), Stdio::inherit())
    } else {
        (Stdio::null(), Stdio::null())
    };

    match &config.source {
        KernelSource::Command { argv } => {
            let Some((program, args)) = argv.split_first() else {
                bail!("kernel command is empty");
            };
            let path = connection_file.to_string_lossy();
            let mut cmd = Command::new(program);
            cmd.args(
                args.iter()
                    .map(|arg| arg.replace(CONNECTION_FILE_PLACEHOLDER, &path)),
            );
            cmd.stdout(stdout).stderr(stderr);
            Ok(cmd)
        }
        KernelSource::Kernelspec { name } => {
            let kernelspec = runtimelib::find_kernelspec(name)
                .await
                .with_context(|| format!("kernelspec {name} not found"))?;
            Ok(kernelspec.command(connection_file, Some(stdout), Some(stderr))?)
        }
        KernelSource::ConnectionFile { path } => {
            bail!("kernel at {} is not owned by the gateway", path.display())
        }
    }
}
