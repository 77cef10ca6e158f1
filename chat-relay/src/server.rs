use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpSocket, TcpStream, lookup_host},
    select,
};
use tracing::{info, warn};

use crate::{
    connection::{Connection, ConnectionId, LineReader},
    protocol,
    registry::Registry,
    relay::Relay,
    session::Session,
};

/// Pending connections the kernel may queue before `accept` catches up.
const LISTEN_BACKLOG: u32 = 50;

pub struct Server {
    listener: TcpListener,
    relay: Relay,
}

impl Server {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            relay: Relay::new(Arc::new(Registry::new())),
        }
    }

    /// Resolves `host`, then binds the first address it yields with
    /// `SO_REUSEADDR` set.
    pub async fn bind(host: &str, port: u16) -> Result<Self> {
        let addr = lookup_host((host, port))
            .await
            .with_context(|| format!("failed to resolve {host}:{port}"))?
            .next()
            .with_context(|| format!("no address found for {host}:{port}"))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket
            .bind(addr)
            .with_context(|| format!("failed to bind {addr}"))?;
        let listener = socket.listen(LISTEN_BACKLOG)?;

        Ok(Self::new(listener))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, relay } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&relay).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &relay);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(relay: &Relay) {
    info!("relay shutting down");
    relay.broadcast(&protocol::shutting_down(), None).await;
}

fn handle_accept_result(result: std::io::Result<(TcpStream, SocketAddr)>, relay: &Relay) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, relay),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, relay: &Relay) {
    let (reader, writer) = stream.into_split();
    let connection = Arc::new(Connection::new(ConnectionId::next(), Some(peer), writer));
    info!(%peer, connection = %connection.id(), "accepted connection");

    let session = Session::new(
        relay.clone(),
        connection,
        LineReader::new(BufReader::new(reader)),
    );
    tokio::spawn(session.run());
}
