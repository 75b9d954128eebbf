//! Socket event coordinator.
//!
//! Owns the live state (presence, rooms, calls) and turns client events into
//! store updates plus fan-out to the right connections. Every emit to a room or
//! to everyone is also published on the Redis bridge when one is configured.

use crate::common::models::{
    CallStatus, CallType, ChatMessage, ChatType, ConnectionId, DeliveryState, UserStatus, UserSummary,
};
use crate::common::protocol::{
    AnswerRelay, CallAccepted, CallEnded, CallIncoming, CallInvite, CallRejected, CallRinging, ClientEvent,
    DeliveryUpdate, ErrorPayload, GroupHistory, GroupNotice, IceRelay, OfferRelay, PrivateHistory, PrivateNotice,
    ReactionNotice, ReactionRemoval, ReactionRequest, ReadNotice, SendMessage, ServerEvent, TypingNotice,
    TypingStopped, TypingTarget, UserOnline, UserRef, UserStatusUpdated,
};
use crate::server::calls::{self, ActiveCall, CallRegistry, CallState};
use crate::server::config::ServerConfig;
use crate::server::database::Database;
use crate::server::error::{ChatError, ChatResult};
use crate::server::messages::{self, NewMessage, ReactionChange, ReplyRef};
use crate::server::presence::{ConnectionHandle, Outbound, PresenceRegistry};
use crate::server::redis_bridge::{Envelope, EnvelopeTarget, RedisBridge};
use crate::server::rooms::{group_room, private_room, user_room, RoomRegistry, GLOBAL_ROOM};
use crate::server::{groups, users};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::oneshot;

/// An authenticated connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub user: UserSummary,
}

impl Session {
    pub fn user_id(&self) -> &str {
        &self.user.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub online_users: usize,
    pub connections: usize,
    pub rooms: usize,
    pub active_calls: usize,
    pub total_messages: i64,
}

pub struct ChatHub {
    db: Arc<Database>,
    config: ServerConfig,
    presence: PresenceRegistry,
    rooms: RoomRegistry,
    calls: CallRegistry,
    bridge: Option<Arc<RedisBridge>>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Room a message was fanned out to.
fn message_room(message: &ChatMessage) -> String {
    match message.chat_type {
        ChatType::Global => GLOBAL_ROOM.to_string(),
        ChatType::Private => {
            let other = message
                .private_chat_with
                .as_deref()
                .or_else(|| message.recipients.first().map(String::as_str))
                .unwrap_or(&message.sender.id);
            private_room(&message.sender.id, other)
        }
        ChatType::Group => group_room(message.group_id.as_deref().unwrap_or_default()),
    }
}

impl ChatHub {
    pub fn new(db: Arc<Database>, config: ServerConfig) -> Self {
        Self {
            db,
            config,
            presence: PresenceRegistry::new(),
            rooms: RoomRegistry::new(),
            calls: CallRegistry::new(),
            bridge: None,
        }
    }

    pub fn with_bridge(mut self, bridge: Arc<RedisBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn connection_count(&self) -> usize {
        self.presence.connection_count().await
    }

    /// Registers an authenticated connection and announces the user.
    pub async fn connect(
        &self,
        user_id: &str,
        sender: Outbound,
        kick: Option<oneshot::Sender<()>>,
    ) -> ChatResult<Session> {
        let mut profile = users::require_profile(&self.db, user_id).await?;
        let connection_id = uuid::Uuid::new_v4().to_string();
        users::mark_connected(&self.db, user_id, &connection_id).await?;

        let total = self
            .presence
            .register(ConnectionHandle {
                id: connection_id.clone(),
                user_id: user_id.to_string(),
                sender,
                kick,
                connected_at: Utc::now(),
            })
            .await;
        self.rooms.join(&connection_id, &user_room(user_id)).await;

        profile.is_online = true;
        profile.last_seen = Utc::now();
        let session = Session {
            connection_id,
            user: profile.summary(),
        };
        info!(
            "[HUB] {} connected on {} ({} open connections)",
            profile.username, session.connection_id, total
        );
        self.broadcast(
            ServerEvent::UserOnline(UserOnline {
                user_id: user_id.to_string(),
                user: profile,
            }),
            Some(&session.connection_id),
        )
        .await;
        Ok(session)
    }

    /// Tears down a connection. The user goes offline only with their last one.
    pub async fn disconnect(&self, session: &Session) {
        let user_id = session.user_id();
        self.rooms.leave_all(&session.connection_id).await;
        let remaining = match self.presence.unregister(&session.connection_id).await {
            Some((_, remaining)) => remaining,
            None => return,
        };
        if remaining > 0 {
            debug!("[HUB] {} still has {} connections", session.user.username, remaining);
            return;
        }

        if let Err(e) = users::mark_disconnected(&self.db, user_id).await {
            warn!("[HUB] Failed to mark {} offline: {}", user_id, e);
        }
        self.broadcast(
            ServerEvent::UserOffline(UserRef {
                user_id: user_id.to_string(),
            }),
            None,
        )
        .await;

        for call in self.calls.take_calls_of(user_id).await {
            let status = match call.state {
                CallState::Ringing => CallStatus::Missed,
                CallState::Active => CallStatus::Ended,
            };
            self.finish_call(&call, status, Some(user_id), "disconnected").await;
        }
        info!("[HUB] {} disconnected", session.user.username);
    }

    /// Handles one client event. Failures are reported back on the same connection.
    pub async fn handle_event(self: &Arc<Self>, session: &Session, event: ClientEvent) {
        let context = event.failure_context();
        if let Err(err) = self.dispatch(session, event).await {
            let reply = if err.is_client_error() {
                debug!("[HUB] Rejected event from {}: {}", session.user.username, err);
                ServerEvent::error(err.to_string())
            } else {
                error!("[HUB] {} for {}: {}", context, session.user.username, err);
                ServerEvent::Error(ErrorPayload {
                    message: context.to_string(),
                    error: Some(err.to_string()),
                })
            };
            self.emit_to(&session.connection_id, reply).await;
        }
    }

    async fn dispatch(self: &Arc<Self>, session: &Session, event: ClientEvent) -> ChatResult<()> {
        let conn = session.connection_id.as_str();
        match event {
            ClientEvent::Auth(_) => Err(ChatError::invalid("Already authenticated")),
            ClientEvent::Ping(_) => {
                self.emit_to(conn, ServerEvent::Pong).await;
                Ok(())
            }
            ClientEvent::JoinGlobal(_) => self.join_global(session).await,
            ClientEvent::LeaveGlobal(_) => {
                self.rooms.leave(conn, GLOBAL_ROOM).await;
                Ok(())
            }
            ClientEvent::JoinPrivate(target) => self.join_private(session, &target.other_user_id).await,
            ClientEvent::LeavePrivate(target) => {
                if !target.other_user_id.is_empty() {
                    self.rooms
                        .leave(conn, &private_room(session.user_id(), &target.other_user_id))
                        .await;
                }
                Ok(())
            }
            ClientEvent::JoinGroup(target) => self.join_group(session, &target.group_id).await,
            ClientEvent::LeaveGroup(target) => {
                if !target.group_id.is_empty() {
                    self.rooms.leave(conn, &group_room(&target.group_id)).await;
                }
                Ok(())
            }
            ClientEvent::SendMessage(request) => self.send_message(session, request).await.map(|_| ()),
            ClientEvent::TypingStart(target) => self.typing(session, target, true).await,
            ClientEvent::TypingStop(target) => self.typing(session, target, false).await,
            ClientEvent::MarkMessageRead(r) => self.mark_read(session, &r.message_id).await,
            ClientEvent::MessageDelivered(r) => self.mark_delivered(session, &r.message_id).await,
            ClientEvent::AddReaction(request) => self.add_reaction(session, request).await,
            ClientEvent::RemoveReaction(request) => self.remove_reaction(session, request).await,
            ClientEvent::UpdateStatus(update) => self.update_status(session, &update.status).await,
            ClientEvent::CallInvite(invite) => self.call_invite(session, invite).await,
            ClientEvent::CallAccept(r) => self.call_accept(session, &r.call_id).await,
            ClientEvent::CallReject(r) => self.call_reject(session, &r.call_id).await,
            ClientEvent::CallEnd(r) => self.call_end(session, &r.call_id).await,
            ClientEvent::Offer(signal) => {
                let event = ServerEvent::Offer(OfferRelay {
                    call_id: signal.call_id.clone(),
                    from: session.user.id.clone(),
                    offer: signal.offer,
                });
                self.relay_signal(session, &signal.call_id, &signal.to, event).await
            }
            ClientEvent::Answer(signal) => {
                let event = ServerEvent::Answer(AnswerRelay {
                    call_id: signal.call_id.clone(),
                    from: session.user.id.clone(),
                    answer: signal.answer,
                });
                self.relay_signal(session, &signal.call_id, &signal.to, event).await
            }
            ClientEvent::IceCandidate(signal) => {
                let event = ServerEvent::IceCandidate(IceRelay {
                    call_id: signal.call_id.clone(),
                    from: session.user.id.clone(),
                    candidate: signal.candidate,
                });
                self.relay_signal(session, &signal.call_id, &signal.to, event).await
            }
        }
    }

    // ---- rooms ----

    async fn join_global(&self, session: &Session) -> ChatResult<()> {
        self.rooms.join(&session.connection_id, GLOBAL_ROOM).await;
        let history = messages::recent_global(&self.db, self.config.history_limit).await?;
        debug!("[HUB] {} joined global chat", session.user.username);
        self.emit_to(&session.connection_id, ServerEvent::GlobalMessages(history))
            .await;
        Ok(())
    }

    async fn join_private(&self, session: &Session, other_user_id: &str) -> ChatResult<()> {
        if other_user_id.trim().is_empty() {
            return Err(ChatError::invalid("Other user ID required"));
        }
        if !users::exists(&self.db, other_user_id).await? {
            return Err(ChatError::not_found("User not found"));
        }
        let me = session.user_id();
        self.rooms
            .join(&session.connection_id, &private_room(me, other_user_id))
            .await;
        let history = messages::recent_private(&self.db, me, other_user_id, self.config.history_limit).await?;
        self.emit_to(
            &session.connection_id,
            ServerEvent::PrivateMessages(PrivateHistory {
                other_user_id: other_user_id.to_string(),
                messages: history,
            }),
        )
        .await;
        Ok(())
    }

    async fn join_group(&self, session: &Session, group_id: &str) -> ChatResult<()> {
        if group_id.trim().is_empty() {
            return Err(ChatError::invalid("Group ID required"));
        }
        if groups::find(&self.db, group_id).await?.is_none() {
            return Err(ChatError::not_found("Group not found"));
        }
        if !groups::is_member(&self.db, group_id, session.user_id()).await? {
            return Err(ChatError::forbidden("Not a group member"));
        }
        self.rooms.join(&session.connection_id, &group_room(group_id)).await;
        let history = messages::recent_group(&self.db, group_id, self.config.history_limit).await?;
        self.emit_to(
            &session.connection_id,
            ServerEvent::GroupMessages(GroupHistory {
                group_id: group_id.to_string(),
                messages: history,
            }),
        )
        .await;
        Ok(())
    }

    // ---- messages ----

    pub async fn send_message(&self, session: &Session, request: SendMessage) -> ChatResult<ChatMessage> {
        let sender_id = session.user_id();
        let content = request.content.filter(|c| !c.trim().is_empty());
        if content.is_none() && request.attachment.is_none() {
            return Err(ChatError::invalid("Message content required"));
        }
        let chat_type = non_empty(request.chat_type).ok_or_else(|| ChatError::invalid("Chat type required"))?;
        let chat_type = ChatType::parse(&chat_type).ok_or_else(|| ChatError::invalid("Invalid chat type"))?;
        let max = self.config.max_message_length;
        if content.as_ref().map_or(false, |c| c.chars().count() > max) {
            debug!("[HUB] Rejected message over {} characters from {}", max, session.user.username);
            return Err(ChatError::invalid("Message too long"));
        }

        let (recipients, private_chat_with, group_id, room) = match chat_type {
            ChatType::Global => (Vec::new(), None, None, GLOBAL_ROOM.to_string()),
            ChatType::Private => {
                let recipients = request.recipients.unwrap_or_default();
                if recipients.iter().any(|r| r == sender_id) {
                    return Err(ChatError::invalid("Cannot send message to yourself"));
                }
                if recipients.len() != 1 {
                    return Err(ChatError::invalid("Private messages require exactly one recipient"));
                }
                let other = recipients[0].clone();
                if !users::exists(&self.db, &other).await? {
                    return Err(ChatError::not_found("Recipient not found"));
                }
                let room = private_room(sender_id, &other);
                (recipients, Some(other), None, room)
            }
            ChatType::Group => {
                let group_id = non_empty(request.group_id).ok_or_else(|| ChatError::invalid("Group ID required"))?;
                if groups::find(&self.db, &group_id).await?.is_none() {
                    return Err(ChatError::not_found("Group not found"));
                }
                if !groups::is_member(&self.db, &group_id, sender_id).await? {
                    return Err(ChatError::forbidden("Not a group member"));
                }
                let recipients = groups::member_ids(&self.db, &group_id)
                    .await?
                    .into_iter()
                    .filter(|m| m != sender_id)
                    .collect();
                let room = group_room(&group_id);
                (recipients, None, Some(group_id), room)
            }
        };

        let reply_to = match request.reply_to {
            Some(reply) => {
                let target = match messages::find(&self.db, &reply.message_id).await? {
                    Some(m) if !m.deleted && self.can_view(sender_id, &m).await? => m,
                    _ => return Err(ChatError::not_found("Reply target not found")),
                };
                Some(ReplyRef {
                    message_id: target.id,
                    content: target.content,
                    sender_id: target.sender.id,
                })
            }
            None => None,
        };

        let message = messages::save(
            &self.db,
            NewMessage {
                sender_id: sender_id.to_string(),
                content,
                kind: request.kind,
                chat_type,
                recipients,
                private_chat_with,
                group_id: group_id.clone(),
                attachment: request.attachment,
                reply_to,
            },
        )
        .await?;
        if let Some(group_id) = &group_id {
            groups::touch_activity(&self.db, group_id).await?;
        }

        self.emit_to_room(&room, ServerEvent::MessageReceived(message.clone()), None)
            .await;

        for recipient in &message.recipients {
            let conns = self.presence.connections_of(recipient).await;
            if conns.is_empty() {
                continue;
            }
            let mut outside = Vec::new();
            for conn in conns {
                if !self.rooms.is_in(&conn, &room).await {
                    outside.push(conn);
                }
            }
            if !outside.is_empty() {
                let notice = match &group_id {
                    Some(group_id) => ServerEvent::NewGroupMessage(GroupNotice {
                        message: message.clone(),
                        group_id: group_id.clone(),
                        sender: session.user.clone(),
                    }),
                    None => ServerEvent::NewPrivateMessage(PrivateNotice {
                        message: message.clone(),
                        sender: session.user.clone(),
                    }),
                };
                self.presence.send_to_connections(&outside, &notice).await;
            }

            if messages::mark_delivered(&self.db, &message.id, recipient).await? {
                self.emit_to_user(
                    sender_id,
                    ServerEvent::MessageDeliveryUpdate(DeliveryUpdate {
                        message_id: message.id.clone(),
                        user_id: recipient.clone(),
                        status: DeliveryState::Delivered,
                    }),
                )
                .await;
            }
        }

        let message = messages::find(&self.db, &message.id).await?.unwrap_or(message);
        debug!(
            "[HUB] {} message {} from {} ({})",
            chat_type, message.id, session.user.username, message.status
        );
        self.emit_to(&session.connection_id, ServerEvent::MessageSent(message.clone()))
            .await;
        Ok(message)
    }

    async fn can_view(&self, user_id: &str, message: &ChatMessage) -> ChatResult<bool> {
        Ok(match message.chat_type {
            ChatType::Global => true,
            ChatType::Private => message.sender.id == user_id || message.is_recipient(user_id),
            ChatType::Group => match &message.group_id {
                Some(group_id) => groups::is_member(&self.db, group_id, user_id).await?,
                None => false,
            },
        })
    }

    async fn visible_message(&self, user_id: &str, message_id: &str) -> ChatResult<ChatMessage> {
        match messages::find(&self.db, message_id).await? {
            Some(m) if !m.deleted && self.can_view(user_id, &m).await? => Ok(m),
            Some(m) if !m.deleted => Err(ChatError::forbidden("Cannot access this message")),
            _ => Err(ChatError::not_found("Message not found")),
        }
    }

    async fn typing(&self, session: &Session, target: TypingTarget, started: bool) -> ChatResult<()> {
        let me = session.user_id();
        let chat_type = non_empty(target.chat_type).ok_or_else(|| ChatError::invalid("Chat type required"))?;
        let chat_type = ChatType::parse(&chat_type).ok_or_else(|| ChatError::invalid("Invalid chat type"))?;
        let (room, group_id) = match chat_type {
            ChatType::Global => (GLOBAL_ROOM.to_string(), None),
            ChatType::Private => {
                let recipients = target.recipients.unwrap_or_default();
                match recipients.as_slice() {
                    [other] if other != me => (private_room(me, other), None),
                    _ => return Err(ChatError::invalid("Private messages require exactly one recipient")),
                }
            }
            ChatType::Group => {
                let group_id = non_empty(target.group_id).ok_or_else(|| ChatError::invalid("Group ID required"))?;
                let room = group_room(&group_id);
                if !self.rooms.is_in(&session.connection_id, &room).await {
                    return Err(ChatError::forbidden("Not a group member"));
                }
                (room, Some(group_id))
            }
        };

        let event = if started {
            ServerEvent::UserTyping(TypingNotice {
                user_id: me.to_string(),
                username: session.user.username.clone(),
                display_name: session.user.display_name.clone(),
                chat_type,
                group_id,
            })
        } else {
            ServerEvent::UserStoppedTyping(TypingStopped {
                user_id: me.to_string(),
                chat_type,
                group_id,
            })
        };
        self.emit_to_room(&room, event, Some(&session.connection_id)).await;
        Ok(())
    }

    async fn mark_read(&self, session: &Session, message_id: &str) -> ChatResult<()> {
        let reader = session.user_id();
        let message = messages::find(&self.db, message_id)
            .await?
            .ok_or_else(|| ChatError::not_found("Message not found"))?;
        if message.sender.id == reader {
            return Ok(());
        }
        if message.chat_type != ChatType::Global && !message.is_recipient(reader) {
            return Err(ChatError::forbidden("Not a recipient of this message"));
        }
        if let Some(read_at) = messages::mark_read(&self.db, message_id, reader).await? {
            self.emit_to_user(
                &message.sender.id,
                ServerEvent::MessageRead(ReadNotice {
                    message_id: message_id.to_string(),
                    read_by: reader.to_string(),
                    read_at,
                }),
            )
            .await;
        }
        Ok(())
    }

    async fn mark_delivered(&self, session: &Session, message_id: &str) -> ChatResult<()> {
        let user_id = session.user_id();
        let message = messages::find(&self.db, message_id)
            .await?
            .ok_or_else(|| ChatError::not_found("Message not found"))?;
        // Global messages have no per-recipient delivery tracking.
        if message.sender.id == user_id || message.chat_type == ChatType::Global {
            return Ok(());
        }
        if !message.is_recipient(user_id) {
            return Err(ChatError::forbidden("Not a recipient of this message"));
        }
        if messages::mark_delivered(&self.db, message_id, user_id).await? {
            self.emit_to_user(
                &message.sender.id,
                ServerEvent::MessageDeliveryUpdate(DeliveryUpdate {
                    message_id: message_id.to_string(),
                    user_id: user_id.to_string(),
                    status: DeliveryState::Delivered,
                }),
            )
            .await;
        }
        Ok(())
    }

    async fn add_reaction(&self, session: &Session, request: ReactionRequest) -> ChatResult<()> {
        let emoji = request.emoji.trim();
        if emoji.is_empty() {
            return Err(ChatError::invalid("Emoji required"));
        }
        let user_id = session.user_id();
        let message = self.visible_message(user_id, &request.message_id).await?;
        let change = messages::add_reaction(&self.db, &message.id, user_id, emoji).await?;
        let notice = ReactionNotice {
            message_id: message.id.clone(),
            user_id: user_id.to_string(),
            emoji: Some(emoji.to_string()),
            reactions: messages::reactions(&self.db, &message.id).await?,
        };
        let event = match change {
            ReactionChange::Added => ServerEvent::ReactionAdded(notice),
            ReactionChange::Updated => ServerEvent::ReactionUpdated(notice),
        };
        self.emit_to_room(&message_room(&message), event, None).await;
        Ok(())
    }

    async fn remove_reaction(&self, session: &Session, request: ReactionRemoval) -> ChatResult<()> {
        let user_id = session.user_id();
        let message = self.visible_message(user_id, &request.message_id).await?;
        let emoji = non_empty(request.emoji);
        if !messages::remove_reaction(&self.db, &message.id, user_id, emoji.as_deref()).await? {
            return Err(ChatError::not_found("Reaction not found"));
        }
        let notice = ReactionNotice {
            message_id: message.id.clone(),
            user_id: user_id.to_string(),
            emoji,
            reactions: messages::reactions(&self.db, &message.id).await?,
        };
        self.emit_to_room(&message_room(&message), ServerEvent::ReactionRemoved(notice), None)
            .await;
        Ok(())
    }

    async fn update_status(&self, session: &Session, status: &str) -> ChatResult<()> {
        let status = UserStatus::parse(status.trim()).ok_or_else(|| ChatError::invalid("Invalid status"))?;
        users::set_status(&self.db, session.user_id(), status).await?;
        self.broadcast(
            ServerEvent::UserStatusUpdated(UserStatusUpdated {
                user_id: session.user.id.clone(),
                status,
            }),
            Some(&session.connection_id),
        )
        .await;
        Ok(())
    }

    // ---- calls ----

    async fn call_invite(self: &Arc<Self>, session: &Session, invite: CallInvite) -> ChatResult<()> {
        let caller = session.user_id();
        if invite.to == caller {
            return Err(ChatError::invalid("Cannot call yourself"));
        }
        let call_type = invite
            .call_type
            .as_deref()
            .and_then(CallType::parse)
            .ok_or_else(|| ChatError::invalid("Invalid call type"))?;
        if !users::exists(&self.db, &invite.to).await? {
            return Err(ChatError::not_found("User not found"));
        }
        if !self.presence.is_online(&invite.to).await {
            return Err(ChatError::invalid("User is offline"));
        }

        let call_id = non_empty(invite.call_id).unwrap_or_else(calls::generate_call_id);
        let call = self.calls.begin(call_id, caller, &invite.to, call_type).await?;
        calls::record_started(&self.db, &call).await;

        self.emit_to_user(
            &call.callee,
            ServerEvent::CallIncoming(CallIncoming {
                call_id: call.id.clone(),
                call_type,
                from: session.user.clone(),
                offer: invite.offer,
            }),
        )
        .await;
        self.emit_to(
            &session.connection_id,
            ServerEvent::CallRinging(CallRinging {
                call_id: call.id.clone(),
                to: call.callee.clone(),
            }),
        )
        .await;
        self.spawn_ring_timeout(call.id, call.generation);
        Ok(())
    }

    fn spawn_ring_timeout(self: &Arc<Self>, call_id: String, generation: u64) {
        let hub = Arc::downgrade(self);
        let timeout = self.config.call_ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(hub) = hub.upgrade() else { return };
            if let Some(call) = hub.calls.expire_if_ringing(&call_id, generation).await {
                hub.finish_call(&call, CallStatus::Missed, None, "no_answer").await;
            }
        });
    }

    async fn call_accept(&self, session: &Session, call_id: &str) -> ChatResult<()> {
        let call = self.calls.accept(call_id, session.user_id()).await?;
        calls::record_answered(&self.db, &call).await;
        let event = ServerEvent::CallAccepted(CallAccepted {
            call_id: call.id.clone(),
            accepted_by: session.user.id.clone(),
            call_type: call.call_type,
            accepted_at: call.answered_at.unwrap_or_else(Utc::now),
        });
        self.emit_to_participants(&call, event).await;
        Ok(())
    }

    async fn call_reject(&self, session: &Session, call_id: &str) -> ChatResult<()> {
        let call = self.calls.reject(call_id, session.user_id()).await?;
        let rejected_at = Utc::now();
        calls::record_finished(&self.db, &call, CallStatus::Rejected, Some(session.user_id()), rejected_at).await;
        let event = ServerEvent::CallRejected(CallRejected {
            call_id: call.id.clone(),
            rejected_by: session.user.id.clone(),
            rejected_at,
        });
        self.emit_to_participants(&call, event).await;
        Ok(())
    }

    async fn call_end(&self, session: &Session, call_id: &str) -> ChatResult<()> {
        let call = self.calls.end(call_id, session.user_id()).await?;
        let status = match call.state {
            CallState::Ringing => CallStatus::Missed,
            CallState::Active => CallStatus::Ended,
        };
        self.finish_call(&call, status, Some(session.user_id()), "hangup").await;
        Ok(())
    }

    async fn finish_call(&self, call: &ActiveCall, status: CallStatus, ended_by: Option<&str>, reason: &str) {
        let ended_at = Utc::now();
        calls::record_finished(&self.db, call, status, ended_by, ended_at).await;
        let event = ServerEvent::CallEnded(CallEnded {
            call_id: call.id.clone(),
            ended_by: ended_by.map(str::to_string),
            ended_at,
            duration: call.duration_secs(ended_at),
            reason: reason.to_string(),
        });
        info!("[CALLS] Call {} finished as {} ({})", call.id, status, reason);
        self.emit_to_participants(call, event).await;
    }

    async fn relay_signal(&self, session: &Session, call_id: &str, to: &str, event: ServerEvent) -> ChatResult<()> {
        self.calls.signal_peer(call_id, session.user_id(), to).await?;
        self.emit_to_user(to, event).await;
        Ok(())
    }

    // ---- fan-out ----

    async fn emit_to(&self, conn: &str, event: ServerEvent) {
        if !self.presence.send_to_connection(conn, event).await {
            debug!("[HUB] Dropped event for closed connection {}", conn);
        }
    }

    async fn emit_to_room(&self, room: &str, event: ServerEvent, except: Option<&str>) {
        let targets: Vec<ConnectionId> = self
            .rooms
            .members(room)
            .await
            .into_iter()
            .filter(|c| Some(c.as_str()) != except)
            .collect();
        self.presence.send_to_connections(&targets, &event).await;
        self.publish(EnvelopeTarget::Room(room.to_string()), &event).await;
    }

    async fn emit_to_user(&self, user_id: &str, event: ServerEvent) {
        self.emit_to_room(&user_room(user_id), event, None).await;
    }

    async fn emit_to_participants(&self, call: &ActiveCall, event: ServerEvent) {
        self.emit_to_user(&call.caller, event.clone()).await;
        self.emit_to_user(&call.callee, event).await;
    }

    async fn broadcast(&self, event: ServerEvent, except: Option<&str>) {
        self.presence.broadcast(&event, except).await;
        self.publish(EnvelopeTarget::Everyone, &event).await;
    }

    async fn publish(&self, target: EnvelopeTarget, event: &ServerEvent) {
        if let Some(bridge) = &self.bridge {
            if let Err(e) = bridge.publish(target, event).await {
                warn!("[REDIS] Publish failed: {}", e);
            }
        }
    }

    /// Delivers an event published by another instance to local connections.
    pub async fn deliver_remote(&self, envelope: Envelope) {
        match envelope.target {
            EnvelopeTarget::Room(room) => {
                let members = self.rooms.members(&room).await;
                self.presence.send_to_connections(&members, &envelope.event).await;
            }
            EnvelopeTarget::Everyone => {
                self.presence.broadcast(&envelope.event, None).await;
            }
        }
    }

    pub async fn stats(&self) -> HubStats {
        let total_messages = match messages::total_count(&self.db).await {
            Ok(count) => count,
            Err(e) => {
                warn!("[STATS] Failed to count messages: {}", e);
                -1
            }
        };
        HubStats {
            online_users: self.presence.online_user_count().await,
            connections: self.presence.connection_count().await,
            rooms: self.rooms.room_count().await,
            active_calls: self.calls.active_count().await,
            total_messages,
        }
    }

    /// Closes every connection and clears persisted presence.
    pub async fn shutdown(&self) {
        let mut kicked = 0;
        for user_id in self.presence.online_users().await {
            kicked += self.presence.kick_all(&user_id).await;
        }
        match users::mark_all_offline(&self.db).await {
            Ok(n) => info!("[HUB] Shutdown: closed {} connections, {} users marked offline", kicked, n),
            Err(e) => warn!("[HUB] Shutdown: failed to clear presence: {}", e),
        }
    }
}
