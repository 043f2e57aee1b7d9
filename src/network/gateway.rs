//! Gateway - TCP listener that accepts incoming connections.
//!
//! The Gateway binds a socket and spawns a Connection task for each
//! incoming client. Shutdown is cooperative via the Hub's signal.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, instrument};

use crate::network::Connection;
use crate::state::Hub;

/// The Gateway accepts incoming TCP connections and spawns handlers.
pub struct Gateway {
    listener: TcpListener,
    hub: Arc<Hub>,
}

impl Gateway {
    /// Bind the gateway to the specified address.
    pub async fn bind(addr: SocketAddr, hub: Arc<Hub>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, path = %hub.config().path, "Gateway listening");
        Ok(Self { listener, hub })
    }

    /// The bound address (useful when binding port 0 in tests).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the gateway until the hub signals shutdown.
    #[instrument(skip(self), name = "gateway")]
    pub async fn run(self) -> std::io::Result<()> {
        let mut shutdown_rx = self.hub.subscribe_shutdown();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let hub = Arc::clone(&self.hub);
                        let conn_id = hub.next_conn_id();

                        tokio::spawn(async move {
                            let connection = Connection::new(conn_id, addr, hub);
                            if let Err(e) = connection.run(stream).await {
                                error!(conn_id, %addr, error = %e, "Connection error");
                            }
                            info!(conn_id, %addr, "Connection closed");
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
                _ = shutdown_rx.recv() => {
                    info!("Gateway shutting down");
                    return Ok(());
                }
            }
        }
    }
}
