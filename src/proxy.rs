//! wardgate/src/proxy.rs
//! TCP listener and per-connection forwarding lifecycle.

use crate::handler::{Handler, HandlerFactory};
use crate::types::ConnectionId;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

static CONN_COUNTER: AtomicU64 = AtomicU64::new(1);

/// One reverse-proxy instance: a listen endpoint, a target endpoint, and a
/// factory producing one handler per accepted connection.
pub struct TcpProxy {
    listen_address: String,
    listen_port: u16,
    target_address: String,
    target_port: u16,
    factory: HandlerFactory,
}

impl TcpProxy {
    pub fn new(
        listen_address: impl Into<String>,
        listen_port: u16,
        target_address: impl Into<String>,
        target_port: u16,
        factory: HandlerFactory,
    ) -> Self {
        TcpProxy {
            listen_address: listen_address.into(),
            listen_port,
            target_address: target_address.into(),
            target_port,
            factory,
        }
    }

    /// Binds and serves until ctrl-c, then returns cleanly. In-flight
    /// connections get a best-effort drain on the runtime.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener =
            TcpListener::bind((self.listen_address.as_str(), self.listen_port)).await?;
        info!(
            listen = %format!("{}:{}", self.listen_address, self.listen_port),
            target = %format!("{}:{}", self.target_address, self.target_port),
            "proxy listening"
        );
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, stopping listener");
            }
            _ = Self::serve(
                listener,
                self.target_address.clone(),
                self.target_port,
                self.factory.clone(),
            ) => {}
        }
        Ok(())
    }

    /// Accept loop on an already-bound listener. Per-connection failures
    /// are logged and never stop the loop.
    pub async fn serve(
        listener: TcpListener,
        target_address: String,
        target_port: u16,
        factory: HandlerFactory,
    ) {
        loop {
            match listener.accept().await {
                Ok((client, peer)) => {
                    let conn_id = CONN_COUNTER.fetch_add(1, Ordering::SeqCst);
                    debug!(conn = conn_id, peer = %peer, "accepted connection");
                    let target_address = target_address.clone();
                    let factory = factory.clone();
                    tokio::spawn(async move {
                        handle_conn(conn_id, client, peer, target_address, target_port, factory)
                            .await;
                    });
                }
                Err(e) => error!("accept failed: {}", e),
            }
        }
    }
}

/// Main connection workflow: dial the target, build the connection's
/// handler, run the two direction tasks, tear down when the first ends.
async fn handle_conn(
    conn_id: ConnectionId,
    client: TcpStream,
    peer: SocketAddr,
    target_address: String,
    target_port: u16,
    factory: HandlerFactory,
) {
    let upstream = match TcpStream::connect((target_address.as_str(), target_port)).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(conn = conn_id, peer = %peer, "failed to connect to target: {}", e);
            return;
        }
    };
    info!(conn = conn_id, peer = %peer, "proxying connection");

    let handler = factory();
    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let mut inbound_task = tokio::spawn(run_direction(
        handler.clone(),
        conn_id,
        client_read,
        upstream_write,
        true,
    ));
    let mut outbound_task = tokio::spawn(run_direction(
        handler,
        conn_id,
        upstream_read,
        client_write,
        false,
    ));

    // Whichever direction finishes first tears the connection down; the
    // paired task is cancelled and awaited.
    tokio::select! {
        _ = &mut inbound_task => {
            outbound_task.abort();
            let _ = outbound_task.await;
        }
        _ = &mut outbound_task => {
            inbound_task.abort();
            let _ = inbound_task.await;
        }
    }
    info!(conn = conn_id, peer = %peer, "connection closed");
}

/// Runs the handler over one direction, then closes the write side so the
/// peer sees EOF.
async fn run_direction(
    handler: Arc<dyn Handler>,
    conn_id: ConnectionId,
    reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    inbound: bool,
) {
    let mut reader = BufReader::new(reader);
    match handler.handle(&mut reader, &mut writer, inbound).await {
        Ok(()) => debug!(conn = conn_id, inbound, "direction finished"),
        Err(e) if e.is_io() => info!(conn = conn_id, inbound, "direction ended: {}", e),
        Err(e) => warn!(conn = conn_id, inbound, "direction failed: {}", e),
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{NoTcpHandler, TcpPump};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Upstream echo server answering each accepted connection once.
    async fn spawn_echo_upstream() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn transparent_forwarding_end_to_end() {
        let upstream_port = spawn_echo_upstream().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_port = listener.local_addr().unwrap().port();
        let factory: HandlerFactory = Arc::new(|| TcpPump::new(NoTcpHandler) as Arc<dyn Handler>);
        tokio::spawn(TcpProxy::serve(
            listener,
            "127.0.0.1".to_string(),
            upstream_port,
            factory,
        ));

        let mut client = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
        client.write_all(b"ciao").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ciao");
    }
}
