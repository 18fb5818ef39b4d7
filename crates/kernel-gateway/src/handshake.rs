//! Startup conversations with the kernel, run before the workers take over
//! the sockets.

use std::time::Duration;

use jupyter_wire::{Channel, Message};
use log::{debug, info, warn};
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::channels::{recv_from, KernelChannels};
use crate::error::{RegistrationError, StartupError};
use crate::shutdown::StopSignal;

const KERNEL_INFO_RESEND: Duration = Duration::from_millis(250);
const RECV_ERROR_PAUSE: Duration = Duration::from_millis(10);

/// Block until the kernel answers `kernel_info_request` on shell and iopub
/// traffic has been seen.
///
/// A SUB socket drops everything published before its subscription reaches
/// the kernel, so a shell reply alone does not prove iopub is live. The
/// request is resent until both have been observed; each one makes the
/// kernel publish a busy/idle status pair.
pub async fn wait_for_ready(
    channels: &mut KernelChannels,
    timeout: Duration,
    stop: &StopSignal,
) -> Result<(), StartupError> {
    let deadline = Instant::now() + timeout;
    let mut resend = tokio::time::interval(KERNEL_INFO_RESEND);
    let mut replied = false;
    let mut iopub_seen = false;

    while !(replied && iopub_seen) {
        tokio::select! {
            _ = stop.wait() => return Err(StartupError::Stopped),
            _ = tokio::time::sleep_until(deadline) => return Err(StartupError::NotReady(timeout)),
            _ = resend.tick() => {
                let request = channels.request("kernel_info_request", json!({}));
                channels.send(Channel::Shell, &request).await?;
            }
            received = recv_from(&mut channels.shell, Channel::Shell, &channels.signer) => {
                match received {
                    Ok(message) if message.msg_type() == "kernel_info_reply" => {
                        debug!("[handshake] kernel_info_reply msg_id={}", message.msg_id());
                        replied = true;
                    }
                    Ok(message) => debug!("[handshake] Ignoring shell {}", message.msg_type()),
                    Err(e) => {
                        warn!("[handshake] shell read failed: {}", e);
                        tokio::time::sleep(RECV_ERROR_PAUSE).await;
                    }
                }
            }
            received = recv_from(&mut channels.iopub, Channel::IOPub, &channels.signer) => {
                match received {
                    Ok(_) => iopub_seen = true,
                    Err(e) => {
                        warn!("[handshake] iopub read failed: {}", e);
                        tokio::time::sleep(RECV_ERROR_PAUSE).await;
                    }
                }
            }
        }
    }

    info!("[handshake] Kernel is ready");
    Ok(())
}

/// Execute `code` once to install auxiliary services in the kernel.
///
/// Status and output published on iopub meanwhile are discarded; errors the
/// code raised are logged. Only the `execute_reply` to this request decides
/// the outcome.
pub async fn register_services(
    channels: &mut KernelChannels,
    code: &str,
    timeout: Duration,
    stop: &StopSignal,
) -> Result<(), RegistrationError> {
    let request = channels.request(
        "execute_request",
        json!({
            "code": code,
            "silent": false,
            "store_history": false,
            "user_expressions": {},
            "allow_stdin": false,
            "stop_on_error": true,
        }),
    );
    channels.send(Channel::Shell, &request).await?;
    debug!("[handshake] Sent registration msg_id={}", request.msg_id());

    let deadline = Instant::now() + timeout;
    loop {
        tokio::select! {
            _ = stop.wait() => return Err(RegistrationError::Stopped),
            _ = tokio::time::sleep_until(deadline) => return Err(RegistrationError::Timeout(timeout)),
            received = recv_from(&mut channels.shell, Channel::Shell, &channels.signer) => {
                match received {
                    Ok(message) if is_reply_to(&message, &request, "execute_reply") => {
                        return registration_result(&message.content);
                    }
                    Ok(message) => debug!("[handshake] Discarding shell {}", message.msg_type()),
                    Err(e) => {
                        warn!("[handshake] shell read failed: {}", e);
                        tokio::time::sleep(RECV_ERROR_PAUSE).await;
                    }
                }
            }
            received = recv_from(&mut channels.iopub, Channel::IOPub, &channels.signer) => {
                match received {
                    Ok(message) if message.msg_type() == "error"
                        && message.parent_msg_id() == Some(request.msg_id()) =>
                    {
                        warn!(
                            "[handshake] Registration raised {}: {}",
                            message.content["ename"].as_str().unwrap_or("?"),
                            message.content["evalue"].as_str().unwrap_or("")
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("[handshake] iopub read failed: {}", e);
                        tokio::time::sleep(RECV_ERROR_PAUSE).await;
                    }
                }
            }
        }
    }
}

fn is_reply_to(message: &Message, request: &Message, msg_type: &str) -> bool {
    message.msg_type() == msg_type && message.parent_msg_id() == Some(request.msg_id())
}

fn registration_result(content: &Value) -> Result<(), RegistrationError> {
    match content["status"].as_str() {
        Some("ok") => Ok(()),
        Some("aborted") => Err(RegistrationError::Failed {
            ename: "aborted".to_string(),
            evalue: "execution was aborted".to_string(),
        }),
        _ => Err(RegistrationError::Failed {
            ename: content["ename"].as_str().unwrap_or("UnknownError").to_string(),
            evalue: content["evalue"].as_str().unwrap_or_default().to_string(),
        }),
    }
}
