//! Moves conversations between the bot and human operators.
//!
//! The waiting queue is not stored anywhere: a conversation's position is
//! the number of waiting conversations created before it, plus one. Claims
//! are a conditional `WaitingOperator -> Staffed` update in the store, so
//! two operators racing for the same conversation cannot both win.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::error::HandoffError;
use crate::notify::Notifier;
use crate::registry::SessionRegistry;
use crate::store::ConversationStore;
use crate::types::{
    now_iso, ChatMessage, Conversation, ConversationOwner, ConversationState, HandoffTicket,
    SenderKind, SessionMode, SystemEvent,
};

pub struct HandoffCoordinator {
    conversations: Arc<dyn ConversationStore>,
    registry: Arc<SessionRegistry>,
    notifier: Arc<dyn Notifier>,
}

impl HandoffCoordinator {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        registry: Arc<SessionRegistry>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            conversations,
            registry,
            notifier,
        }
    }

    async fn existing(&self, conversation_id: &str) -> Result<Conversation, HandoffError> {
        self.conversations
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| HandoffError::NotFound(conversation_id.to_string()))
    }

    async fn append(
        &self,
        conversation_id: &str,
        sender: SenderKind,
        sender_id: Option<&str>,
        content: &str,
    ) -> Result<ChatMessage, HandoffError> {
        let message = ChatMessage::new(conversation_id, sender, sender_id, content);
        self.conversations.append_message(&message).await?;
        let participants = self.registry.conversation_participants(conversation_id);
        self.registry.emit_many(&participants, "message:new", &message);
        Ok(message)
    }

    /// Reuses the caller's open conversation (by user, or by session for
    /// anonymous callers) or opens one, and puts it in the waiting queue.
    /// Asking again while already queued returns the same ticket.
    pub async fn request_handoff(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<HandoffTicket, HandoffError> {
        let owner = ConversationOwner::for_caller(session_id, user_id);
        let candidate = Conversation::open(session_id, owner.user_id());
        let conversation = self
            .conversations
            .find_or_create_open(&owner, candidate)
            .await?;

        let conversation = match conversation.state {
            ConversationState::Active => {
                match self.conversations.mark_waiting(&conversation.id, &now_iso()).await? {
                    Some(waiting) => {
                        let note = match reason.map(str::trim).filter(|r| !r.is_empty()) {
                            Some(reason) => format!("El usuario solicitó un operador: {reason}"),
                            None => "El usuario solicitó hablar con un operador.".to_string(),
                        };
                        self.append(&waiting.id, SenderKind::System, None, &note).await?;
                        waiting
                    }
                    // Lost a race with another request for the same caller.
                    None => self.existing(&conversation.id).await?,
                }
            }
            _ => conversation,
        };

        let queue_position = self.position_of(&conversation).await?;
        let ticket = HandoffTicket {
            conversation_id: conversation.id.clone(),
            queue_position,
        };

        self.registry
            .attach_session_conversation(session_id, &conversation.id, SessionMode::Human);
        if conversation.state == ConversationState::WaitingOperator {
            info!(session_id, conversation_id = %conversation.id, queue_position, "handoff requested");
            let operators = self.registry.operator_connections();
            self.registry.emit_many(
                &operators,
                "queue:waiting",
                json!({ "conversation": &conversation, "queuePosition": queue_position }),
            );
            self.notifier
                .system_broadcast(SystemEvent::HandoffRequested {
                    conversation_id: conversation.id.clone(),
                    queue_position,
                })
                .await;
        }
        Ok(ticket)
    }

    async fn position_of(&self, conversation: &Conversation) -> Result<usize, HandoffError> {
        if conversation.state != ConversationState::WaitingOperator {
            return Ok(0);
        }
        Ok(self.conversations.count_waiting_before(conversation.seq).await? + 1)
    }

    /// 1-based position in the waiting queue; 0 once the conversation is no
    /// longer waiting.
    pub async fn queue_position(&self, conversation_id: &str) -> Result<usize, HandoffError> {
        let conversation = self.existing(conversation_id).await?;
        self.position_of(&conversation).await
    }

    pub async fn assign_operator(
        &self,
        conversation_id: &str,
        operator_id: &str,
    ) -> Result<Conversation, HandoffError> {
        let Some(conversation) = self
            .conversations
            .claim(conversation_id, operator_id, &now_iso())
            .await?
        else {
            let current = self.existing(conversation_id).await?;
            warn!(conversation_id, operator_id, state = current.state.as_str(), "claim rejected");
            return Err(HandoffError::AlreadyTaken {
                conversation_id: conversation_id.to_string(),
                operator_id: current.operator_id,
            });
        };

        info!(conversation_id, operator_id, "conversation staffed");
        self.registry.attach_session_conversation(
            &conversation.session_id,
            &conversation.id,
            SessionMode::Human,
        );
        self.append(
            &conversation.id,
            SenderKind::System,
            Some(operator_id),
            "Un operador se unió a la conversación.",
        )
        .await?;

        let operators = self.registry.operator_connections();
        self.registry
            .emit_many(&operators, "queue:claimed", json!({ "conversation": &conversation }));
        let participants = self.registry.conversation_participants(&conversation.id);
        self.registry.emit_many(
            &participants,
            "operator:joined",
            json!({ "conversationId": &conversation.id, "operatorId": operator_id }),
        );
        self.notifier
            .system_broadcast(SystemEvent::ConversationStaffed {
                conversation_id: conversation.id.clone(),
                operator_id: operator_id.to_string(),
            })
            .await;
        Ok(conversation)
    }

    /// Persists and relays a message. Closed conversations still accept
    /// messages so a last word sent during close is not lost.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        sender: SenderKind,
        sender_id: Option<&str>,
        content: &str,
    ) -> Result<ChatMessage, HandoffError> {
        self.existing(conversation_id).await?;
        self.append(conversation_id, sender, sender_id, content).await
    }

    /// Closing an already closed conversation returns it unchanged.
    pub async fn close_conversation(
        &self,
        conversation_id: &str,
        closed_by: &str,
    ) -> Result<Conversation, HandoffError> {
        let Some(conversation) = self.conversations.close(conversation_id, &now_iso()).await? else {
            return self.existing(conversation_id).await;
        };

        info!(conversation_id, closed_by, "conversation closed");
        self.append(
            conversation_id,
            SenderKind::System,
            Some(closed_by),
            "La conversación fue cerrada.",
        )
        .await?;

        let participants = self.registry.conversation_participants(conversation_id);
        let payload = json!({ "conversationId": conversation_id, "closedBy": closed_by });
        self.registry
            .emit_many(&participants, "conversation:closed", &payload);
        let operators = self.registry.operator_connections();
        self.registry.emit_many(&operators, "queue:closed", &payload);
        self.registry.evict_conversation(conversation_id);

        self.notifier
            .system_broadcast(SystemEvent::ConversationClosed {
                conversation_id: conversation_id.to_string(),
                closed_by: closed_by.to_string(),
            })
            .await;
        Ok(conversation)
    }

    /// Posting and reading need the caller to hold the conversation. Closing
    /// also passes while nobody holds it.
    fn require_assignee(
        conversation: &Conversation,
        operator_id: &str,
        allow_unstaffed: bool,
    ) -> Result<(), HandoffError> {
        let assigned = conversation.operator_id.as_deref() == Some(operator_id);
        let unstaffed = conversation.state != ConversationState::Staffed;
        if assigned || (allow_unstaffed && unstaffed) {
            return Ok(());
        }
        warn!(conversation_id = %conversation.id, operator_id, "operator not assigned");
        Err(HandoffError::NotAssigned {
            conversation_id: conversation.id.clone(),
            operator_id: conversation.operator_id.clone(),
        })
    }

    pub async fn operator_message(
        &self,
        conversation_id: &str,
        operator_id: &str,
        content: &str,
    ) -> Result<ChatMessage, HandoffError> {
        let conversation = self.existing(conversation_id).await?;
        Self::require_assignee(&conversation, operator_id, false)?;
        self.append(conversation_id, SenderKind::Operator, Some(operator_id), content)
            .await
    }

    pub async fn operator_close(
        &self,
        conversation_id: &str,
        operator_id: &str,
    ) -> Result<Conversation, HandoffError> {
        let conversation = self.existing(conversation_id).await?;
        Self::require_assignee(&conversation, operator_id, true)?;
        self.close_conversation(conversation_id, operator_id).await
    }

    pub async fn operator_mark_read(
        &self,
        conversation_id: &str,
        operator_id: &str,
    ) -> Result<u64, HandoffError> {
        let conversation = self.existing(conversation_id).await?;
        Self::require_assignee(&conversation, operator_id, false)?;
        self.mark_read(conversation_id, SenderKind::Operator).await
    }

    pub async fn pending_conversations(&self) -> Result<Vec<Conversation>, HandoffError> {
        Ok(self.conversations.list_waiting().await?)
    }

    pub async fn operator_conversations(
        &self,
        operator_id: &str,
    ) -> Result<Vec<Conversation>, HandoffError> {
        Ok(self.conversations.list_for_operator(operator_id).await?)
    }

    /// Marks the other side's messages as read.
    pub async fn mark_read(
        &self,
        conversation_id: &str,
        reader: SenderKind,
    ) -> Result<u64, HandoffError> {
        self.existing(conversation_id).await?;
        let changed = self.conversations.mark_read(conversation_id, reader).await?;
        if changed > 0 {
            let participants = self.registry.conversation_participants(conversation_id);
            self.registry.emit_many(
                &participants,
                "messages:read",
                json!({ "conversationId": conversation_id, "reader": reader }),
            );
        }
        Ok(changed)
    }

    pub async fn history(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, HandoffError> {
        self.existing(conversation_id).await?;
        Ok(self.conversations.messages(conversation_id).await?)
    }

    pub async fn conversation(&self, conversation_id: &str) -> Result<Conversation, HandoffError> {
        self.existing(conversation_id).await
    }
}
