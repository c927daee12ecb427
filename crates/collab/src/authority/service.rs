//! Async command loop around [`Authority`].

use super::{AccessPolicy, Authority, AuthorityCommand};
use crate::channel::LocalChannel;
use crate::codec::StepCodec;
use crate::error::CollabResult;
use crate::ids::{ClientId, UserId};
use crate::protocol::ServerMessage;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::info;

/// Cloneable handle for talking to a running [`AuthorityService`].
#[derive(Clone, Debug)]
pub struct AuthorityHandle {
    commands: mpsc::UnboundedSender<AuthorityCommand>,
    shutdown: broadcast::Sender<()>,
}

impl AuthorityHandle {
    pub fn commands(&self) -> mpsc::UnboundedSender<AuthorityCommand> {
        self.commands.clone()
    }

    /// Connect an in-process client.
    pub fn connect_local(
        &self,
        client_id: ClientId,
        user_id: UserId,
    ) -> CollabResult<(LocalChannel, mpsc::UnboundedReceiver<ServerMessage>)> {
        LocalChannel::connect(client_id, user_id, self.commands())
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Signal the service to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

/// Owns an [`Authority`] and feeds it commands until shutdown.
pub struct AuthorityService<C: StepCodec, P: AccessPolicy> {
    authority: Authority<C, P>,
    commands: mpsc::UnboundedReceiver<AuthorityCommand>,
    shutdown: broadcast::Receiver<()>,
}

impl<C: StepCodec, P: AccessPolicy> AuthorityService<C, P> {
    pub fn new(authority: Authority<C, P>) -> (Self, AuthorityHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown) = broadcast::channel(1);
        let service = Self {
            authority,
            commands,
            shutdown,
        };
        let handle = AuthorityHandle {
            commands: commands_tx,
            shutdown: shutdown_tx,
        };
        (service, handle)
    }

    /// Process commands until shutdown, then hand the authority back.
    pub async fn run(mut self) -> Authority<C, P> {
        let period = Duration::from_millis(self.authority.config().expiry_interval_ms.max(1));
        let mut expiry = tokio::time::interval(period);
        expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        expiry.tick().await;

        info!("Authority service started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.authority.apply_command(command),
                    None => break,
                },
                _ = expiry.tick() => self.authority.expire_idle(Utc::now()),
                _ = self.shutdown.recv() => {
                    info!("Authority service received shutdown signal");
                    break;
                }
            }
        }
        info!(stats = ?self.authority.stats(), "Authority service stopped");
        self.authority
    }
}
