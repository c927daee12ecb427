//! WebSocket collaboration server.
//!
//! Each connection runs in its own task and talks to a single
//! [`AuthorityService`] through its command channel. The first frame on a
//! socket must be a `hello` message naming the user and, normally, the
//! client id the runtime keeps across reconnects. The server answers with
//! `welcome`; everything after that is forwarded to the authority as-is.
//!
//! # Example
//!
//! ```ignore
//! use collab::server::{CollaborationServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = CollaborationServer::new(ServerConfig::default());
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

use crate::authority::{
    AccessPolicy, AllowAll, Authority, AuthorityCommand, AuthorityConfig, AuthorityHandle,
    AuthorityService,
};
use crate::codec::JsonStepCodec;
use crate::ids::ClientId;
use crate::protocol::{ClientMessage, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_address: String,
    /// Port to listen on.
    pub port: u16,
    /// Maximum total connections.
    pub max_connections: usize,
    pub authority: AuthorityConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 1000,
            authority: AuthorityConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new configuration with the specified port.
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// Get the full bind address.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {0}: {1}")]
    BindFailed(String, std::io::Error),
}

/// Handle to shut down a running server.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
    authority: AuthorityHandle,
}

impl ShutdownHandle {
    /// Signal the server to shut down.
    pub fn shutdown(&self) {
        let _ = self.tx.send(());
        self.authority.shutdown();
    }
}

/// The main collaboration server.
pub struct CollaborationServer<P: AccessPolicy = AllowAll> {
    config: ServerConfig,
    service: AuthorityService<JsonStepCodec, P>,
    authority: AuthorityHandle,
    connections: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
}

impl CollaborationServer<AllowAll> {
    /// Create a new server that lets every user edit.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_policy(config, AllowAll)
    }
}

impl<P: AccessPolicy + 'static> CollaborationServer<P> {
    /// Create a new server with a custom access policy.
    pub fn with_policy(config: ServerConfig, policy: P) -> Self {
        let authority = Authority::with_policy(config.authority.clone(), JsonStepCodec, policy);
        let (service, handle) = AuthorityService::new(authority);
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            service,
            authority: handle,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Get a shutdown handle.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
            authority: self.authority.clone(),
        }
    }

    /// Run the server.
    ///
    /// Binds the configured address and accepts connections until shutdown
    /// is signaled.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::BindFailed(addr.clone(), e))?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        match listener.local_addr() {
            Ok(addr) => tracing::info!("Collaboration server listening on {}", addr),
            Err(e) => tracing::warn!("Collaboration server listening on unknown address: {}", e),
        }

        let authority_task = tokio::spawn(self.service.run());

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let count = self.connections.load(Ordering::SeqCst);
                            if count >= self.config.max_connections {
                                tracing::warn!("Max connections reached, rejecting {}", addr);
                                continue;
                            }
                            Self::handle_connection(
                                stream,
                                addr,
                                self.authority.commands(),
                                Arc::clone(&self.connections),
                                self.shutdown_tx.subscribe(),
                            );
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server received shutdown signal");
                    break;
                }
            }
        }

        self.authority.shutdown();
        let _ = authority_task.await;

        tracing::info!("Server shutdown complete");
        Ok(())
    }

    fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        commands: mpsc::UnboundedSender<AuthorityCommand>,
        connections: Arc<AtomicUsize>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        connections.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            tracing::debug!("New connection from {}", addr);

            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    tracing::error!("WebSocket handshake failed for {}: {}", addr, e);
                    connections.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
            };
            let (mut ws_tx, mut ws_rx) = ws_stream.split();

            // The connection is identified by its first frame.
            let hello = match ws_rx.next().await {
                Some(Ok(Message::Text(text))) => match ClientMessage::from_json(&text) {
                    Ok(ClientMessage::Hello { user_id, client_id }) => Some((user_id, client_id)),
                    _ => None,
                },
                _ => None,
            };
            let Some((user_id, client_id)) = hello else {
                tracing::warn!("Connection {} did not start with hello", addr);
                if let Ok(json) =
                    ServerMessage::error(None, "hello_required", "first frame must be hello").to_json()
                {
                    let _ = ws_tx.send(Message::Text(json.into())).await;
                }
                connections.fetch_sub(1, Ordering::SeqCst);
                return;
            };

            let client_id = client_id.unwrap_or_else(ClientId::generate);
            let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<ServerMessage>();
            let _ = msg_tx.send(ServerMessage::Welcome {
                client_id: client_id.clone(),
            });
            if commands
                .send(AuthorityCommand::Connect {
                    client_id: client_id.clone(),
                    user_id,
                    sender: msg_tx.clone(),
                })
                .is_err()
            {
                connections.fetch_sub(1, Ordering::SeqCst);
                return;
            }

            // Outgoing message forwarder
            let outgoing = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    match msg.to_json() {
                        Ok(json) => {
                            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::error!("Failed to serialize message: {}", e);
                        }
                    }
                }
            });

            // Incoming message handler
            loop {
                tokio::select! {
                    msg = ws_rx.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => match ClientMessage::from_json(&text) {
                                Ok(message) => {
                                    let command = AuthorityCommand::Message {
                                        client_id: client_id.clone(),
                                        message,
                                    };
                                    if commands.send(command).is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!("Unparseable frame from {}: {}", client_id, e);
                                }
                            },
                            Some(Ok(Message::Close(_))) | None => {
                                tracing::debug!("Connection {} closed", client_id);
                                break;
                            }
                            Some(Err(e)) => {
                                tracing::error!("WebSocket error for {}: {}", client_id, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("Connection {} received shutdown signal", client_id);
                        break;
                    }
                }
            }

            // Cleanup
            outgoing.abort();
            let _ = commands.send(AuthorityCommand::ConnectionClosed {
                client_id,
                sender: msg_tx,
            });
            connections.fetch_sub(1, Ordering::SeqCst);
        });
    }
}
