//! Gateway configuration.
//!
//! Everything has a default, so an empty JSON object (or no file at all) is a
//! valid configuration. CLI flags are applied on top by the binary.
//! Durations are written as integer milliseconds.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use crate::error::ConfigError;

/// Placeholder in `argv` replaced by the connection file path.
pub const CONNECTION_FILE_PLACEHOLDER: &str = "{connection_file}";

const MIB: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Interface both WebSocket endpoints listen on
    pub host: String,

    /// Port of the shell endpoint (shell, iopub and stdin traffic)
    pub shell_port: u16,

    /// Port of the control endpoint; `shell_port + 1` when unset
    pub control_port: Option<u16>,

    /// Upper bound for a single WebSocket message or frame, in bytes
    pub max_frame_size: usize,

    /// Outbound messages buffered per client before it counts as a slow consumer
    pub client_queue_depth: usize,

    #[serde(with = "millis")]
    pub ready_timeout: Duration,

    #[serde(with = "millis")]
    pub shutdown_grace: Duration,

    #[serde(with = "millis")]
    pub read_error_backoff: Duration,

    #[serde(with = "millis")]
    pub kernel_poll_interval: Duration,

    pub kernel: KernelConfig,

    pub registration: RegistrationConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            shell_port: 8080,
            control_port: None,
            max_frame_size: 10 * MIB,
            client_queue_depth: 1024,
            ready_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            read_error_backoff: Duration::from_millis(10),
            kernel_poll_interval: Duration::from_secs(1),
            kernel: KernelConfig::default(),
            registration: RegistrationConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Read a JSON configuration file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Effective control endpoint port.
    ///
    /// With an ephemeral shell port (0) the control port is ephemeral too.
    pub fn control_port(&self) -> u16 {
        self.control_port.unwrap_or(match self.shell_port {
            0 => 0,
            port => port.checked_add(1).unwrap_or(0),
        })
    }

    /// Size limits applied to every accepted WebSocket.
    pub fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_frame_size);
        config.max_frame_size = Some(self.max_frame_size);
        config
    }
}

/// Where the kernel comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelSource {
    /// Spawn `argv`, substituting `{connection_file}`
    Command { argv: Vec<String> },
    /// Spawn the command of an installed kernelspec
    Kernelspec { name: String },
    /// Attach to an already running kernel; it is never spawned or killed
    ConnectionFile { path: PathBuf },
}

impl Default for KernelSource {
    fn default() -> Self {
        KernelSource::Command {
            argv: ["python3", "-m", "ipykernel_launcher", "-f", CONNECTION_FILE_PLACEHOLDER]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub source: KernelSource,

    /// Address the kernel's channels bind to
    pub ip: IpAddr,

    /// Extra environment for the kernel process
    pub env: BTreeMap<String, String>,

    pub working_dir: Option<PathBuf>,

    /// Directory for connection files; the Jupyter runtime directory when unset
    pub runtime_dir: Option<PathBuf>,

    /// Inherit the kernel's stdout/stderr instead of discarding them
    pub forward_output: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        // debugpy warns on every start without this
        env.insert(
            "PYDEVD_DISABLE_FILE_VALIDATION".to_string(),
            "1".to_string(),
        );
        Self {
            source: KernelSource::default(),
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            env,
            working_dir: None,
            runtime_dir: None,
            forward_output: false,
        }
    }
}

impl KernelConfig {
    /// Whether the gateway owns the kernel process lifetime.
    pub fn is_owned(&self) -> bool {
        !matches!(self.source, KernelSource::ConnectionFile { .. })
    }
}

/// How the auxiliary services expect the editor to use the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    #[default]
    Console,
    Notebook,
    Background,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Console => "console",
            SessionMode::Notebook => "notebook",
            SessionMode::Background => "background",
        }
    }
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" | "console" => Ok(SessionMode::Console),
            "1" | "notebook" => Ok(SessionMode::Notebook),
            "2" | "background" => Ok(SessionMode::Background),
            _ => Err(ConfigError::UnknownSessionMode(s.to_string())),
        }
    }
}

/// The one-time execute request that installs auxiliary services.
///
/// Off by default. The gateway does not ship the Python side: when enabled,
/// `module` must be importable by the kernel, either installed in its
/// environment or found through `python_path`. A kernel that cannot import
/// it still starts, just without the services.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub enabled: bool,

    /// Python module providing the entry point
    pub module: String,

    pub entry_point: String,

    /// Prepended to `sys.path` before importing `module`
    pub python_path: Vec<PathBuf>,

    pub session_mode: SessionMode,

    /// Raw code sent instead of the generated snippet
    pub code: Option<String>,

    #[serde(with = "millis")]
    pub timeout: Duration,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            module: "gateway_services".to_string(),
            entry_point: "configure_kernel".to_string(),
            python_path: Vec::new(),
            session_mode: SessionMode::default(),
            code: None,
            timeout: Duration::from_secs(5),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.shell_port, 8080);
        assert_eq!(config.control_port(), 8081);
        assert_eq!(config.max_frame_size, 10 * 1024 * 1024);
        assert_eq!(config.ready_timeout, Duration::from_secs(10));
        assert_eq!(config.registration.timeout, Duration::from_secs(5));
        assert!(!config.registration.enabled);
        assert!(config.kernel.is_owned());
        assert_eq!(
            config.kernel.env.get("PYDEVD_DISABLE_FILE_VALIDATION"),
            Some(&"1".to_string())
        );
    }

    #[test]
    fn test_control_port() {
        let mut config = GatewayConfig {
            shell_port: 0,
            ..Default::default()
        };
        assert_eq!(config.control_port(), 0);

        config.shell_port = u16::MAX;
        assert_eq!(config.control_port(), 0);

        config.control_port = Some(9000);
        assert_eq!(config.control_port(), 9000);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{
                "shell_port": 9100,
                "ready_timeout": 2500,
                "kernel": {"source": {"type": "kernelspec", "name": "python3"}},
                "registration": {"session_mode": "notebook", "enabled": true}
            }"#,
        )
        .unwrap();

        assert_eq!(config.shell_port, 9100);
        assert_eq!(config.control_port(), 9101);
        assert_eq!(config.ready_timeout, Duration::from_millis(2500));
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert_eq!(
            config.kernel.source,
            KernelSource::Kernelspec {
                name: "python3".into()
            }
        );
        assert_eq!(config.registration.session_mode, SessionMode::Notebook);
        assert!(config.registration.enabled);
        assert_eq!(config.registration.module, "gateway_services");
    }

    #[test]
    fn test_connection_file_source_is_not_owned() {
        let config: KernelConfig = serde_json::from_str(
            r#"{"source": {"type": "connection_file", "path": "/tmp/kernel-1.json"}}"#,
        )
        .unwrap();
        assert!(!config.is_owned());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"host": "0.0.0.0", "max_frame_size": 4096}}"#).unwrap();

        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        let ws = config.websocket_config();
        assert_eq!(ws.max_message_size, Some(4096));
        assert_eq!(ws.max_frame_size, Some(4096));

        assert!(GatewayConfig::load(Path::new("/nonexistent/gateway.json")).is_err());
    }

    #[test]
    fn test_session_mode_parsing() {
        assert_eq!("0".parse::<SessionMode>().unwrap(), SessionMode::Console);
        assert_eq!("1".parse::<SessionMode>().unwrap(), SessionMode::Notebook);
        assert_eq!(
            "Background".parse::<SessionMode>().unwrap(),
            SessionMode::Background
        );
        assert!(matches!(
            "3".parse::<SessionMode>(),
            Err(ConfigError::UnknownSessionMode(_))
        ));
    }
}
