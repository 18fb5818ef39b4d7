//! Kernel-side sockets for exercising the client channels in unit tests.

use jupyter_protocol::ConnectionInfo;
use jupyter_wire::Signer;
use zeromq::{PubSocket, RouterSocket, Socket};

pub(crate) const KEY: &str = "test-key";

pub(crate) struct Peer {
    pub info: ConnectionInfo,
    pub shell: RouterSocket,
    pub iopub: PubSocket,
    pub control: RouterSocket,
    pub stdin: RouterSocket,
}

pub(crate) fn signer() -> Signer {
    Signer::new("hmac-sha256", KEY).unwrap()
}

fn bound_port(endpoint: zeromq::Endpoint) -> u16 {
    match endpoint {
        zeromq::Endpoint::Tcp(_, port) => port,
        other => panic!("unexpected endpoint {other}"),
    }
}

async fn bind_router() -> (RouterSocket, u16) {
    let mut socket = RouterSocket::new();
    let port = bound_port(socket.bind("tcp://127.0.0.1:0").await.unwrap());
    (socket, port)
}

/// Bind all kernel channels on ephemeral ports without answering anything.
pub(crate) async fn peer() -> Peer {
    let (shell, shell_port) = bind_router().await;
    let (control, control_port) = bind_router().await;
    let (stdin, stdin_port) = bind_router().await;
    let mut iopub = PubSocket::new();
    let iopub_port = bound_port(iopub.bind("tcp://127.0.0.1:0").await.unwrap());

    let info = ConnectionInfo {
        transport: jupyter_protocol::connection_info::Transport::TCP,
        ip: "127.0.0.1".to_string(),
        stdin_port,
        control_port,
        hb_port: 0,
        shell_port,
        iopub_port,
        signature_scheme: "hmac-sha256".to_string(),
        key: KEY.to_string(),
        kernel_name: None,
    };
    Peer {
        info,
        shell,
        iopub,
        control,
        stdin,
    }
}
