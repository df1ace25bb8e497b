//! Command dispatcher
//!
//! Maps a decoded frame from one session to its effect on the registry
//! and on the connections of other sessions. Every cross-session effect goes
//! through the registry: deliveries use a snapshot taken under its lock and
//! sent after it is released. Deliveries never wait on a recipient's queue;
//! a recipient that is not draining misses the message instead.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::codec::{Encoding, ErrorPolicy};
use crate::config::{AdminPolicy, Config};
use crate::error::{ProtocolError, RegistryError};
use crate::handler::SessionContext;
use crate::history::MessageLog;
use crate::message::{
    ErrorCode, Frame, Header, LoggedMessage, ServerMessage, UserEntry, ANONYMOUS,
};
use crate::registry::Registry;
use crate::types::ClientId;

/// Longest accepted username, in characters
pub const MAX_USERNAME_LEN: usize = 32;

/// What the session loop should do after a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading
    Continue,
    /// Close this session with the given reason
    Close(String),
}

/// Shared routing state, one per server
#[derive(Debug)]
pub struct Dispatcher {
    config: Config,
    registry: Arc<Registry>,
    history: MessageLog,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Dispatcher {
    pub fn new(config: Config, registry: Arc<Registry>, shutdown: Arc<watch::Sender<bool>>) -> Self {
        let history = MessageLog::new(config.history_size);
        Self {
            config,
            registry,
            history,
            shutdown,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Execute one frame sent by `session`
    pub async fn dispatch(&self, session: &SessionContext, frame: Frame) -> Flow {
        debug!("Client {} sent {}", session.id, frame.header);

        match frame.header {
            Header::Username => self.handle_username(session, frame.payload).await,
            Header::Encoding => self.handle_encoding(session, &frame.payload).await,
            Header::EncodingErrors => self.handle_encoding_errors(session, &frame.payload).await,
            Header::Msg => self.handle_msg(session, frame.payload).await,
            Header::Dm => self.handle_dm(session, &frame.payload).await,
            Header::Users => self.handle_users(session).await,
            Header::Dump => {
                self.reply(session, ServerMessage::History(self.history.recent()))
                    .await
            }
            Header::Kick => self.handle_kick(session, &frame.payload, false).await,
            Header::Ban => self.handle_kick(session, &frame.payload, true).await,
            Header::Quit => {
                info!("Client {} quit", session.id);
                return Flow::Close("goodbye".to_string());
            }
            Header::Kill => self.handle_kill(session).await,
            Header::Unknown => {
                let err = ProtocolError::UnknownHeader(frame.payload);
                warn!("Protocol error from client {}: {}", session.id, err);
                self.reply(session, err.into()).await;
                return Flow::Close("protocol error".to_string());
            }
        }

        Flow::Continue
    }

    /// Queue a reply to the originating session
    async fn reply(&self, session: &SessionContext, msg: ServerMessage) {
        if session.connection.send(msg).await.is_err() {
            debug!("Reply to client {} dropped, writer gone", session.id);
        }
    }

    async fn handle_username(&self, session: &SessionContext, name: String) {
        let name = name.trim().to_string();
        if !valid_username(&name) {
            let msg = format!(
                "username must be 1-{} characters without ':', ',', '=' or control characters",
                MAX_USERNAME_LEN
            );
            self.reply(session, ServerMessage::error(ErrorCode::InvalidUsername, msg))
                .await;
            return;
        }

        match self.registry.set_username(session.id, name.clone()) {
            Ok(()) => {
                info!("Client {} set username to '{}'", session.id, name);
                self.reply(session, ServerMessage::ok(format!("username set to {}", name)))
                    .await;
            }
            Err(e) => {
                debug!("Rejected username for client {}: {}", session.id, e);
                self.reply(session, e.into()).await;
            }
        }
    }

    async fn handle_encoding(&self, session: &SessionContext, name: &str) {
        match name.parse::<Encoding>() {
            Ok(encoding) => {
                session.codec.send_modify(|codec| codec.encoding = encoding);
                debug!("Client {} switched encoding to {}", session.id, encoding);
                self.reply(session, ServerMessage::ok(format!("encoding set to {}", encoding)))
                    .await;
            }
            Err(e) => {
                self.reply(session, ServerMessage::error(ErrorCode::UnknownEncoding, e.to_string()))
                    .await;
            }
        }
    }

    async fn handle_encoding_errors(&self, session: &SessionContext, name: &str) {
        match name.parse::<ErrorPolicy>() {
            Ok(policy) => {
                session.codec.send_modify(|codec| codec.errors = policy);
                debug!("Client {} switched error policy to {}", session.id, policy);
                self.reply(
                    session,
                    ServerMessage::ok(format!("encoding errors set to {}", policy)),
                )
                .await;
            }
            Err(e) => {
                self.reply(session, ServerMessage::error(ErrorCode::UnknownPolicy, e.to_string()))
                    .await;
            }
        }
    }

    /// Broadcast to every other session
    async fn handle_msg(&self, session: &SessionContext, text: String) {
        // the sender may have been kicked between read and dispatch
        let Some(sender) = self.registry.get(session.id) else {
            return;
        };
        let from_name = sender.display_name().to_string();

        self.history.record(LoggedMessage {
            from_id: session.id,
            from_name: from_name.clone(),
            text: text.clone(),
        });

        let msg = ServerMessage::Chat {
            from_id: session.id,
            from_name,
            text,
        };

        let mut delivered = 0usize;
        for recipient in self.registry.snapshot() {
            if recipient.id == session.id {
                continue;
            }
            match recipient.deliver(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Skipped client {} for broadcast: {}", recipient.id, e),
            }
        }
        debug!("Client {} broadcast to {} sessions", session.id, delivered);
    }

    async fn handle_dm(&self, session: &SessionContext, payload: &str) {
        let (target, text) = payload.split_once(':').unwrap_or((payload, ""));
        let Some(target_id) = self.parse_target(session, target).await else {
            return;
        };
        let Some(recipient) = self.registry.get(target_id) else {
            self.reply(session, RegistryError::NoSuchUser(target_id).into())
                .await;
            return;
        };
        let from_name = self
            .registry
            .get(session.id)
            .map(|s| s.display_name().to_string())
            .unwrap_or_else(|| ANONYMOUS.to_string());

        let msg = ServerMessage::Direct {
            from_id: session.id,
            from_name,
            text: text.to_string(),
        };
        if let Err(e) = recipient.deliver(msg) {
            warn!("Failed to deliver DM to client {}: {}", target_id, e);
        }
    }

    async fn handle_users(&self, session: &SessionContext) {
        let users = self
            .registry
            .snapshot()
            .into_iter()
            .map(|s| UserEntry {
                id: s.id,
                username: s.username,
            })
            .collect();
        self.reply(session, ServerMessage::Users(users)).await;
    }

    /// `KICK` and `BAN`
    async fn handle_kick(&self, session: &SessionContext, target: &str, ban: bool) {
        let action = if ban { "banned" } else { "kicked" };
        if !self.permits_admin(session) {
            warn!("Client {} not permitted to issue admin commands", session.id);
            self.reply(
                session,
                ServerMessage::error(ErrorCode::NotPermitted, "admin commands not permitted"),
            )
            .await;
            return;
        }
        let Some(target_id) = self.parse_target(session, target).await else {
            return;
        };

        let removed = if ban {
            self.registry.ban(target_id)
        } else {
            self.registry.unregister(target_id)
        };

        match removed {
            Some(target) => {
                info!(
                    "Client {} {} client {} ({})",
                    session.id, action, target_id, target.addr
                );
                // reply before closing so a self-kick still sees the ack
                self.reply(session, ServerMessage::ok(format!("{} {}", action, target_id)))
                    .await;
                target
                    .connection
                    .close(format!("{} by {}", action, session.id));
            }
            None => {
                self.reply(session, RegistryError::NoSuchUser(target_id).into())
                    .await;
            }
        }
    }

    async fn handle_kill(&self, session: &SessionContext) {
        if !self.permits_admin(session) {
            warn!("Client {} not permitted to issue admin commands", session.id);
            self.reply(
                session,
                ServerMessage::error(ErrorCode::NotPermitted, "admin commands not permitted"),
            )
            .await;
            return;
        }
        info!("Client {} requested server shutdown", session.id);
        self.reply(session, ServerMessage::ok("server shutting down")).await;
        self.shutdown.send_replace(true);
    }

    fn permits_admin(&self, session: &SessionContext) -> bool {
        match self.config.admin_policy {
            AdminPolicy::Anyone => true,
            AdminPolicy::Loopback => session.addr.ip().is_loopback(),
        }
    }

    async fn parse_target(&self, session: &SessionContext, target: &str) -> Option<ClientId> {
        match target.parse::<ClientId>() {
            Ok(id) => Some(id),
            Err(_) => {
                self.reply(
                    session,
                    ServerMessage::error(
                        ErrorCode::InvalidTarget,
                        format!("'{}' is not a client id", target),
                    ),
                )
                .await;
                None
            }
        }
    }
}

fn valid_username(name: &str) -> bool {
    let len = name.chars().count();
    (1..=MAX_USERNAME_LEN).contains(&len)
        && !name
            .chars()
            .any(|c| c == ':' || c == ',' || c == '=' || c.is_control())
}
