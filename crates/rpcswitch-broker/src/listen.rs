//! Accept loops: turning listener sockets into running connections.

use std::sync::Arc;

use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio_util::compat::{TokioAsyncReadCompatExt as _, TokioAsyncWriteCompatExt as _};
use tracing::{info, warn};

use crate::mgr::Broker;

/// Accept connections on a TCP listener forever, handing each one to the
/// broker.  Returns only on an accept error.
pub async fn accept_tcp(broker: Arc<Broker>, listener: TcpListener) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("listening on {}", addr);
    }
    loop {
        let (stream, addr) = listener.accept().await?;
        let conn = broker.new_connection(addr.to_string());
        let (input, output) = stream.into_split();
        tokio::spawn(async move {
            if let Err(e) = conn.run(input.compat(), output.compat_write()).await {
                warn!("connection ended with an error: {}", e);
            }
        });
    }
}

/// As [`accept_tcp`], but for an AF_UNIX listener.
#[cfg(unix)]
pub async fn accept_unix(broker: Arc<Broker>, listener: UnixListener) -> std::io::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        let from = addr
            .as_pathname()
            .map(|p| format!("unix:{}", p.display()))
            .unwrap_or_else(|| "unix:?".to_owned());
        let conn = broker.new_connection(from);
        let (input, output) = stream.into_split();
        tokio::spawn(async move {
            if let Err(e) = conn.run(input.compat(), output.compat_write()).await {
                warn!("connection ended with an error: {}", e);
            }
        });
    }
}
