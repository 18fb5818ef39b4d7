//! Gateway lifecycle: startup ordering and coordinated shutdown.
//!
//! Two stop signals exist. The task signal stops the broadcaster, the
//! listeners, every connection and the kernel monitor; the worker signal
//! stops the channel workers, which close their sockets on the way out.
//! `stop` sets both and then terminates an owned kernel.

use std::net::SocketAddr;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use jupyter_protocol::ConnectionInfo;
use jupyter_wire::{Channel, Message};
use log::{debug, error, info, warn};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::broadcast::{Broadcaster, ClientGroups};
use crate::channels::{KernelChannels, KernelSender};
use crate::config::{GatewayConfig, KernelSource};
use crate::error::{RegistrationError, StartupError};
use crate::handshake;
use crate::kernel::{read_connection_file, KernelProcess};
use crate::queue::{group_queues, Group};
use crate::shutdown::StopSignal;
use crate::websocket::{self, ConnectionContext, Endpoint};

const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const EXIT_POLL: Duration = Duration::from_millis(100);

type SharedKernel = Arc<Mutex<Option<KernelProcess>>>;

#[derive(Default)]
struct State {
    started: bool,
    session: String,
    sender: Option<KernelSender>,
    workers: Vec<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Gateway {
    config: GatewayConfig,
    task_stop: StopSignal,
    worker_stop: StopSignal,
    groups: ClientGroups,
    kernel: SharedKernel,
    state: Mutex<State>,
    addrs: OnceLock<(SocketAddr, SocketAddr)>,
    services_registered: AtomicBool,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            task_stop: StopSignal::new(),
            worker_stop: StopSignal::new(),
            groups: ClientGroups::new(),
            kernel: Arc::new(Mutex::new(None)),
            state: Mutex::new(State::default()),
            addrs: OnceLock::new(),
            services_registered: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Bring the kernel and both endpoints up.
    ///
    /// On failure everything started so far is torn down again. A gateway
    /// that has been stopped cannot be started.
    pub async fn start(&self) -> Result<(), StartupError> {
        let result = {
            let mut state = self.state.lock().await;
            if state.started {
                return Ok(());
            }
            if self.task_stop.is_set() {
                return Err(StartupError::Stopped);
            }
            let result = self.start_inner(&mut state).await;
            state.started = result.is_ok();
            result
        };

        match &result {
            Ok(()) => {}
            Err(StartupError::Stopped) => {
                info!("[gateway] Startup interrupted by stop");
                self.stop().await;
            }
            Err(e) => {
                error!("[gateway] Startup failed: {}", e);
                self.stop().await;
            }
        }
        result
    }

    async fn start_inner(&self, state: &mut State) -> Result<(), StartupError> {
        let config = &self.config;

        // 1. kernel
        let info = self.acquire_kernel().await?;
        self.check_stop()?;

        // 2 + 3. channels and readiness, bounded by one deadline
        let session = Uuid::new_v4().to_string();
        let mut channels = tokio::select! {
            ready = self.connect_and_wait(&info, &session) => ready?,
            status = kernel_exited(&self.kernel) => {
                return Err(StartupError::Launch(anyhow::anyhow!(
                    "kernel exited during startup: {status}"
                )));
            }
        };
        self.check_stop()?;

        // 4. auxiliary services; failure only degrades
        if config.registration.enabled {
            match self.register(&mut channels).await {
                Ok(()) => {
                    self.services_registered.store(true, Ordering::SeqCst);
                    info!("[gateway] Auxiliary services registered");
                }
                Err(RegistrationError::Stopped) => return Err(StartupError::Stopped),
                Err(e) => warn!(
                    "[gateway] Service registration failed, continuing without auxiliary services: {}",
                    e
                ),
            }
        }
        self.check_stop()?;

        // 5. workers and broadcaster
        let (queues, queue_rx) = group_queues();
        let (sender, workers) =
            channels.spawn_workers(queues, self.worker_stop.clone(), config.read_error_backoff);
        state.session = session;
        state.sender = Some(sender.clone());
        state.workers = workers;
        state.tasks.push(tokio::spawn(
            Broadcaster::new(queue_rx, self.groups.clone()).run(self.task_stop.clone()),
        ));

        // 6. listeners
        let shell = bind(&config.host, config.shell_port, Endpoint::Shell).await?;
        let control = bind(&config.host, config.control_port(), Endpoint::Control).await?;
        let shell_addr = local_addr(&shell, Endpoint::Shell)?;
        let control_addr = local_addr(&control, Endpoint::Control)?;
        let _ = self.addrs.set((shell_addr, control_addr));

        let ctx = ConnectionContext {
            groups: self.groups.clone(),
            kernel: sender,
            websocket_config: config.websocket_config(),
            queue_depth: config.client_queue_depth,
            stop: self.task_stop.clone(),
        };
        state.tasks.push(tokio::spawn(websocket::serve(
            shell,
            Endpoint::Shell,
            ctx.clone(),
        )));
        state.tasks.push(tokio::spawn(websocket::serve(
            control,
            Endpoint::Control,
            ctx,
        )));

        if config.kernel.is_owned() {
            state.tasks.push(tokio::spawn(monitor_kernel(
                self.kernel.clone(),
                config.kernel_poll_interval,
                self.task_stop.clone(),
            )));
        }

        info!(
            "[gateway] Serving shell on ws://{} and control on ws://{}",
            shell_addr, control_addr
        );
        Ok(())
    }

    async fn acquire_kernel(&self) -> Result<ConnectionInfo, StartupError> {
        match &self.config.kernel.source {
            KernelSource::ConnectionFile { path } => {
                info!("[gateway] Attaching to kernel at {}", path.display());
                read_connection_file(path)
                    .await
                    .map_err(StartupError::Launch)
            }
            _ => {
                let kernel = KernelProcess::launch(&self.config.kernel)
                    .await
                    .map_err(StartupError::Launch)?;
                let info = kernel.connection_info().clone();
                *self.kernel.lock().await = Some(kernel);
                Ok(info)
            }
        }
    }

    async fn connect_and_wait(
        &self,
        info: &ConnectionInfo,
        session: &str,
    ) -> Result<KernelChannels, StartupError> {
        let timeout = self.config.ready_timeout;
        let deadline = Instant::now() + timeout;

        let connect = KernelChannels::connect_with_retry(info, session, &self.task_stop);
        let mut channels = match tokio::time::timeout_at(deadline, connect).await {
            Ok(Some(channels)) => channels,
            Ok(None) => return Err(StartupError::Stopped),
            Err(_) => return Err(StartupError::NotReady(timeout)),
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        handshake::wait_for_ready(&mut channels, remaining, &self.task_stop)
            .await
            .map_err(|e| match e {
                StartupError::NotReady(_) => StartupError::NotReady(timeout),
                other => other,
            })?;
        Ok(channels)
    }

    async fn register(&self, channels: &mut KernelChannels) -> Result<(), RegistrationError> {
        let registration = &self.config.registration;
        let code = registration.render_code()?;
        debug!("[gateway] Registering services:\n{}", code);
        handshake::register_services(channels, &code, registration.timeout, &self.task_stop).await
    }

    fn check_stop(&self) -> Result<(), StartupError> {
        if self.task_stop.is_set() {
            Err(StartupError::Stopped)
        } else {
            Ok(())
        }
    }

    /// Resolve once the gateway is stopping, either through `stop` or
    /// because the kernel exited.
    pub async fn wait(&self) {
        self.task_stop.wait().await;
    }

    /// Tear everything down. Idempotent, and safe before, during or after
    /// `start`.
    pub async fn stop(&self) {
        self.task_stop.trigger();
        let mut state = self.state.lock().await;

        for task in state.tasks.drain(..) {
            join_or_abort(task).await;
        }

        let grace = self.config.shutdown_grace;
        if let Some(sender) = state.sender.take() {
            let mut kernel = self.kernel.lock().await;
            if let Some(kernel) = kernel.as_mut() {
                let request =
                    Message::request("shutdown_request", &state.session, json!({"restart": false}));
                match sender.send(Channel::Control, request) {
                    Ok(()) => {
                        if kernel.wait_for_exit(grace / 2).await.is_some() {
                            debug!("[gateway] Kernel honored shutdown_request");
                        }
                    }
                    Err(e) => debug!("[gateway] Could not send shutdown_request: {}", e),
                }
            }
        }

        self.worker_stop.trigger();
        for worker in state.workers.drain(..) {
            join_or_abort(worker).await;
        }

        if let Some(mut kernel) = self.kernel.lock().await.take() {
            kernel.shutdown(grace).await;
        }

        self.groups.clear();
        if state.started {
            state.started = false;
            info!("[gateway] Stopped");
        }
    }

    pub fn shell_addr(&self) -> Option<SocketAddr> {
        self.addrs.get().map(|(shell, _)| *shell)
    }

    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.addrs.get().map(|(_, control)| *control)
    }

    pub fn client_count(&self, group: Group) -> usize {
        self.groups.get(group).len()
    }

    /// Whether the auxiliary services were installed. False means degraded
    /// mode: raw kernel traffic still flows.
    pub fn services_registered(&self) -> bool {
        self.services_registered.load(Ordering::SeqCst)
    }
}

async fn bind(host: &str, port: u16, endpoint: Endpoint) -> Result<TcpListener, StartupError> {
    TcpListener::bind((host, port))
        .await
        .map_err(|source| StartupError::Bind {
            endpoint: endpoint.as_str(),
            addr: format!("{host}:{port}"),
            source,
        })
}

fn local_addr(listener: &TcpListener, endpoint: Endpoint) -> Result<SocketAddr, StartupError> {
    listener.local_addr().map_err(|source| StartupError::Bind {
        endpoint: endpoint.as_str(),
        addr: "<unknown>".to_string(),
        source,
    })
}

async fn join_or_abort(mut task: JoinHandle<()>) {
    if tokio::time::timeout(TASK_JOIN_TIMEOUT, &mut task).await.is_err() {
        warn!("[gateway] Task did not finish within {:?}, aborting", TASK_JOIN_TIMEOUT);
        task.abort();
    }
}

/// Resolve when an owned kernel has exited; pending forever otherwise.
async fn kernel_exited(kernel: &Mutex<Option<KernelProcess>>) -> ExitStatus {
    loop {
        let status = match kernel.lock().await.as_mut() {
            Some(process) => process.try_wait().ok().flatten(),
            None => break,
        };
        if let Some(status) = status {
            return status;
        }
        tokio::time::sleep(EXIT_POLL).await;
    }
    std::future::pending().await
}

async fn monitor_kernel(kernel: SharedKernel, interval: Duration, stop: StopSignal) {
    loop {
        tokio::select! {
            _ = stop.wait() => return,
            status = async {
                tokio::time::sleep(interval).await;
                let mut guard = kernel.lock().await;
                guard.as_mut().and_then(|process| process.try_wait().ok().flatten())
            } => {
                if let Some(status) = status {
                    warn!("[gateway] Kernel exited unexpectedly: {}", status);
                    stop.trigger();
                    return;
                }
            }
        }
    }
}
