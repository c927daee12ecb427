//! Collaboration channel: how a client runtime reaches the authority.

use crate::authority::AuthorityCommand;
use crate::error::{CollabError, CollabResult};
use crate::ids::{ClientId, UserId};
use crate::protocol::{ClientMessage, ServerMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Outbound half of a client connection.
///
/// Inbound messages are delivered by whatever drives the transport, which
/// hands them to [`EditorRegistry::dispatch`](crate::registry::EditorRegistry::dispatch).
pub trait Channel: Send + Sync {
    fn send(&self, message: ClientMessage) -> CollabResult<()>;

    fn is_connected(&self) -> bool;
}

/// In-process channel to an authority command loop.
///
/// Used by tests and by hosts that run the authority in the same process.
/// The connection can be dropped and re-established to exercise reconnects.
pub struct LocalChannel {
    client_id: ClientId,
    user_id: UserId,
    commands: mpsc::UnboundedSender<AuthorityCommand>,
    inbound: mpsc::UnboundedSender<ServerMessage>,
    connected: Arc<AtomicBool>,
}

impl LocalChannel {
    /// Register a new client with the authority.
    ///
    /// Returns the channel and the receiver for messages addressed to it.
    pub fn connect(
        client_id: ClientId,
        user_id: UserId,
        commands: mpsc::UnboundedSender<AuthorityCommand>,
    ) -> CollabResult<(Self, mpsc::UnboundedReceiver<ServerMessage>)> {
        let (inbound, receiver) = mpsc::unbounded_channel();
        let channel = Self {
            client_id,
            user_id,
            commands,
            inbound,
            connected: Arc::new(AtomicBool::new(false)),
        };
        channel.reconnect()?;
        Ok((channel, receiver))
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Drop the connection. The authority forgets this client.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!(client_id = %self.client_id, "Local channel disconnected");
            let _ = self.commands.send(AuthorityCommand::Disconnect {
                client_id: self.client_id.clone(),
            });
        }
    }

    /// Re-establish the connection after [`disconnect`](Self::disconnect).
    pub fn reconnect(&self) -> CollabResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.commands
            .send(AuthorityCommand::Connect {
                client_id: self.client_id.clone(),
                user_id: self.user_id.clone(),
                sender: self.inbound.clone(),
            })
            .map_err(|_| CollabError::ChannelDisconnected)?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Channel for LocalChannel {
    fn send(&self, message: ClientMessage) -> CollabResult<()> {
        if !self.is_connected() {
            return Err(CollabError::ChannelDisconnected);
        }
        self.commands
            .send(AuthorityCommand::Message {
                client_id: self.client_id.clone(),
                message,
            })
            .map_err(|_| {
                self.connected.store(false, Ordering::SeqCst);
                CollabError::ChannelDisconnected
            })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}
