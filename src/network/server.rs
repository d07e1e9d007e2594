use crate::config::NetworkConfig;
use crate::network::handler::{Outbound, ProtocolHandler};
use crate::network::protocol::{read_message, write_message, Message};
use crate::{LedgerError, Result};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// TCP front end for a `ProtocolHandler`: one task per inbound connection,
/// replies sent over fresh outbound connections.
pub struct Server {
    handler: Arc<ProtocolHandler>,
}

impl Server {
    pub fn new(handler: ProtocolHandler) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }

    pub fn handler(&self) -> &Arc<ProtocolHandler> {
        &self.handler
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let address = self.handler.node_address();
        TcpListener::bind(address)
            .await
            .map_err(|e| LedgerError::Protocol(format!("Failed to bind {}: {}", address, e)))
    }

    pub async fn run(self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Greets the seed, then accepts connections until the listener fails.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        log::info!("🌐 Node {} listening", self.handler.node_address());

        let greeting = self.handler.bootstrap()?;
        dispatch(&self.handler, greeting).await;

        loop {
            let (stream, peer) = listener.accept().await?;
            log::debug!("🔗 Connection from {}", peer);

            let handler = self.handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(handler, stream).await {
                    log::warn!("⚠️  Connection from {} closed: {}", peer, e);
                }
            });
        }
    }
}

/// Serves frames from one connection until a clean EOF. Unknown commands and
/// malformed payloads are dropped; oversized frames, I/O errors and idle
/// timeouts close the connection.
async fn handle_connection(handler: Arc<ProtocolHandler>, mut stream: TcpStream) -> Result<()> {
    let network = handler.network().clone();

    loop {
        let read = timeout(network.read_timeout(), read_message(&mut stream, network.max_message_size)).await;

        let message = match read {
            Err(_) => return Err(LedgerError::Timeout("read".to_string())),
            Ok(Ok(Some(message))) => message,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(e @ (LedgerError::UnknownCommand(_) | LedgerError::Encoding(_)))) => {
                log::warn!("⚠️  Dropping message: {}", e);
                continue;
            }
            Ok(Err(e)) => return Err(e),
        };

        match handler.handle(message).await {
            Ok(replies) => dispatch(&handler, replies).await,
            Err(e) => log::error!("❌ Failed to handle message: {}", e),
        }
    }
}

/// Opens a connection to `addr` and writes one frame, within the configured
/// connect and write deadlines.
pub async fn send_message(addr: &str, message: &Message, network: &NetworkConfig) -> Result<()> {
    let mut stream = timeout(network.connect_timeout(), TcpStream::connect(addr))
        .await
        .map_err(|_| LedgerError::Timeout(format!("connect to {}", addr)))??;

    timeout(network.write_timeout(), write_message(&mut stream, message))
        .await
        .map_err(|_| LedgerError::Timeout(format!("write to {}", addr)))??;

    log::debug!("📤 {} sent to {}", message.command().name(), addr);
    Ok(())
}

/// Delivers replies in order. A peer that cannot be reached is forgotten.
pub async fn dispatch(handler: &ProtocolHandler, outbound: Vec<Outbound>) {
    for Outbound { to, message } in outbound {
        if let Err(e) = send_message(&to, &message, handler.network()).await {
            log::warn!("📡 {} is not reachable: {}", to, e);
            if let Err(e) = handler.forget_peer(&to) {
                log::error!("❌ Failed to forget {}: {}", to, e);
            }
        }
    }
}
