use std::sync::Arc;

use tracing::{error, info};

use crate::error::ChatError;
use crate::handoff::HandoffCoordinator;
use crate::intent::{IntentEngine, Resolution};
use crate::store::ConversationStore;
use crate::types::{
    ChatMessage, Conversation, ConversationOwner, ConversationState, HandoffTicket, SenderKind,
    TurnReply, TurnSource,
};

const APOLOGY: &str =
    "Lo siento, tuve un problema procesando tu mensaje. Por favor intenta de nuevo en un momento.";

/// Entry point for user turns, whether they arrive over HTTP or the socket.
pub struct ChatService {
    conversations: Arc<dyn ConversationStore>,
    engine: Arc<IntentEngine>,
    handoff: Arc<HandoffCoordinator>,
}

impl ChatService {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        engine: Arc<IntentEngine>,
        handoff: Arc<HandoffCoordinator>,
    ) -> Self {
        Self {
            conversations,
            engine,
            handoff,
        }
    }

    /// The caller's open conversation, without creating one.
    pub async fn current_conversation(
        &self,
        session_id: &str,
        user_id: Option<&str>,
    ) -> Result<Option<Conversation>, ChatError> {
        let owner = ConversationOwner::for_caller(session_id, user_id);
        Ok(self.conversations.find_open(&owner).await?)
    }

    async fn open_conversation(
        &self,
        session_id: &str,
        user_id: Option<&str>,
    ) -> Result<Conversation, ChatError> {
        let owner = ConversationOwner::for_caller(session_id, user_id);
        let candidate = Conversation::open(session_id, owner.user_id());
        Ok(self
            .conversations
            .find_or_create_open(&owner, candidate)
            .await?)
    }

    /// Answers one user message. Text sent while the conversation is with
    /// (or waiting for) an operator is relayed instead of resolved.
    pub async fn submit_turn(
        &self,
        session_id: Option<&str>,
        text: &str,
        user_id: Option<&str>,
    ) -> Result<TurnReply, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let session_id = session_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let user_id = user_id.map(str::trim).filter(|id| !id.is_empty());

        let conversation = self.open_conversation(&session_id, user_id).await?;
        if conversation.state.is_human() {
            return self.relay(session_id, user_id, text, conversation).await;
        }

        let user_message = ChatMessage::new(&conversation.id, SenderKind::User, user_id, text);
        self.conversations.append_message(&user_message).await?;

        let resolution = match self.engine.resolve(&session_id, user_id, text).await {
            Ok(resolution) => resolution,
            Err(err) => {
                error!(session_id = %session_id, conversation_id = %conversation.id, error = %err, "turn failed");
                Resolution {
                    text: APOLOGY.to_string(),
                    source: TurnSource::Fallback,
                    intent: None,
                    confidence: None,
                    requires_auth: false,
                    booking_summary: None,
                    handoff: None,
                }
            }
        };

        let bot_message = ChatMessage::new(&conversation.id, SenderKind::Bot, None, &resolution.text);
        self.conversations.append_message(&bot_message).await?;
        info!(
            session_id = %session_id,
            conversation_id = %conversation.id,
            intent = resolution.intent.as_deref().unwrap_or("-"),
            source = ?resolution.source,
            "turn resolved"
        );

        Ok(TurnReply {
            session_id,
            conversation_id: Some(conversation.id),
            text: resolution.text,
            source: resolution.source,
            intent: resolution.intent,
            confidence: resolution.confidence,
            requires_auth: resolution.requires_auth,
            booking_summary: resolution.booking_summary,
            handoff: resolution.handoff,
            relayed: false,
        })
    }

    async fn relay(
        &self,
        session_id: String,
        user_id: Option<&str>,
        text: &str,
        conversation: Conversation,
    ) -> Result<TurnReply, ChatError> {
        self.handoff
            .send_message(&conversation.id, SenderKind::User, user_id, text)
            .await?;
        let (reply, handoff) = if conversation.state == ConversationState::WaitingOperator {
            let queue_position = self.handoff.queue_position(&conversation.id).await?;
            (
                format!("Tu mensaje quedó registrado. Un operador te atenderá pronto (posición {queue_position})."),
                Some(HandoffTicket {
                    conversation_id: conversation.id.clone(),
                    queue_position,
                }),
            )
        } else {
            (String::new(), None)
        };
        Ok(TurnReply {
            session_id,
            conversation_id: Some(conversation.id),
            text: reply,
            source: TurnSource::Local,
            intent: None,
            confidence: None,
            requires_auth: false,
            booking_summary: None,
            handoff,
            relayed: true,
        })
    }

    pub async fn request_handoff(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<HandoffTicket, ChatError> {
        self.engine.abandon_dialogue(session_id);
        Ok(self
            .handoff
            .request_handoff(session_id, user_id, reason)
            .await?)
    }

    pub async fn history(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, ChatError> {
        Ok(self.handoff.history(conversation_id).await?)
    }

    /// History for the conversation's owner only: the user it belongs to,
    /// or the session that opened it when it has no user.
    pub async fn history_for_caller(
        &self,
        conversation_id: &str,
        session_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let conversation = self.handoff.conversation(conversation_id).await?;
        let owned = match conversation.user_id.as_deref() {
            Some(owner) => user_id == Some(owner),
            None => session_id.is_some_and(|id| id == conversation.session_id),
        };
        if !owned {
            return Err(ChatError::NotOwner);
        }
        self.history(conversation_id).await
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::NaiveDate;

    use super::*;
    use crate::booking::BookingDesk;
    use crate::config::ChatConfig;
    use crate::error::StoreError;
    use crate::notify::LogNotifier;
    use crate::registry::SessionRegistry;
    use crate::store::{CatalogService, MemoryStore};
    use crate::types::{Location, Service, Slot};

    /// Catalog whose every call fails.
    struct BrokenCatalog;

    #[async_trait]
    impl CatalogService for BrokenCatalog {
        async fn list_services(&self) -> Result<Vec<Service>, StoreError> {
            Err(StoreError::Corrupt("catalog offline".into()))
        }
        async fn find_service(&self, _: &str) -> Result<Option<Service>, StoreError> {
            Err(StoreError::Corrupt("catalog offline".into()))
        }
        async fn availability(
            &self,
            _: &str,
            _: NaiveDate,
            _: NaiveDate,
        ) -> Result<Vec<NaiveDate>, StoreError> {
            Err(StoreError::Corrupt("catalog offline".into()))
        }
        async fn slots(&self, _: &str, _: NaiveDate) -> Result<Vec<Slot>, StoreError> {
            Err(StoreError::Corrupt("catalog offline".into()))
        }
        async fn locations(&self) -> Result<Vec<Location>, StoreError> {
            Err(StoreError::Corrupt("catalog offline".into()))
        }
    }

    fn chat_with(catalog: Arc<dyn CatalogService>) -> (ChatService, Arc<MemoryStore>, Arc<BookingDesk>) {
        let store = Arc::new(MemoryStore::new());
        let booking = Arc::new(BookingDesk::new(
            catalog.clone(),
            store.clone(),
            Arc::new(LogNotifier),
            14,
        ));
        let handoff = Arc::new(HandoffCoordinator::new(
            store.clone(),
            Arc::new(SessionRegistry::new()),
            Arc::new(LogNotifier),
        ));
        let engine = Arc::new(IntentEngine::new(
            None,
            catalog,
            booking.clone(),
            handoff.clone(),
            ChatConfig::default(),
        ));
        (ChatService::new(store.clone(), engine, handoff), store, booking)
    }

    fn chat() -> (ChatService, Arc<MemoryStore>, Arc<BookingDesk>) {
        chat_with(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn each_turn_writes_user_and_bot_messages() {
        let (chat, store, _) = chat();
        let first = chat.submit_turn(Some("s-1"), "hola", None).await.unwrap();
        let second = chat.submit_turn(Some("s-1"), "gracias", None).await.unwrap();
        assert_eq!(first.conversation_id, second.conversation_id);

        let id = first.conversation_id.unwrap();
        let conversation = store.get_conversation(&id).await.unwrap().unwrap();
        assert_eq!(conversation.state, ConversationState::Active);
        let senders = store
            .messages(&id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.sender)
            .collect::<Vec<_>>();
        assert_eq!(
            senders,
            vec![SenderKind::User, SenderKind::Bot, SenderKind::User, SenderKind::Bot]
        );
    }

    #[tokio::test]
    async fn missing_session_id_gets_a_fresh_one() {
        let (chat, _, _) = chat();
        let reply = chat.submit_turn(None, "hola", None).await.unwrap();
        assert!(!reply.session_id.is_empty());
        assert!(matches!(
            chat.submit_turn(Some("s-1"), "   ", None).await,
            Err(ChatError::EmptyMessage)
        ));
    }

    #[tokio::test]
    async fn text_after_handoff_is_relayed() {
        let (chat, store, _) = chat();
        let handoff = chat.submit_turn(Some("s-1"), "quiero un operador", None).await.unwrap();
        let ticket = handoff.handoff.unwrap();

        let relayed = chat.submit_turn(Some("s-1"), "sigo aquí", None).await.unwrap();
        assert!(relayed.relayed);
        assert_eq!(relayed.conversation_id.as_deref(), Some(ticket.conversation_id.as_str()));
        assert_eq!(relayed.handoff.map(|t| t.queue_position), Some(1));

        let last = store.messages(&ticket.conversation_id).await.unwrap();
        let last = last.last().unwrap();
        assert_eq!(last.sender, SenderKind::User);
        assert_eq!(last.content, "sigo aquí");
    }

    #[tokio::test]
    async fn handoff_drops_the_booking_dialogue() {
        let today = chrono::Local::now().date_naive();
        let (chat, _, booking) = chat_with(Arc::new(MemoryStore::demo(today)));
        chat.submit_turn(Some("s-1"), "agendar cita", None).await.unwrap();
        assert!(booking.dialogue("s-1").is_some());

        chat.request_handoff("s-1", None, Some("prefiero hablar con alguien"))
            .await
            .unwrap();
        assert!(booking.dialogue("s-1").is_none());
    }

    #[tokio::test]
    async fn history_is_only_shown_to_the_owner() {
        let (chat, _, _) = chat();
        let anonymous = chat.submit_turn(Some("s-1"), "hola", None).await.unwrap();
        let id = anonymous.conversation_id.unwrap();
        assert_eq!(chat.history_for_caller(&id, Some("s-1"), None).await.unwrap().len(), 2);
        assert!(matches!(
            chat.history_for_caller(&id, Some("s-2"), None).await,
            Err(ChatError::NotOwner)
        ));
        assert!(matches!(
            chat.history_for_caller(&id, None, Some("u-9")).await,
            Err(ChatError::NotOwner)
        ));

        let signed_in = chat.submit_turn(Some("s-3"), "hola", Some("u-1")).await.unwrap();
        let id = signed_in.conversation_id.unwrap();
        assert!(chat.history_for_caller(&id, Some("other-tab"), Some("u-1")).await.is_ok());
        assert!(matches!(
            chat.history_for_caller(&id, Some("s-3"), None).await,
            Err(ChatError::NotOwner)
        ));
    }

    #[tokio::test]
    async fn internal_error_apologises_and_keeps_state() {
        let (chat, store, booking) = chat_with(Arc::new(BrokenCatalog));
        let reply = chat.submit_turn(Some("s-1"), "agendar cita", None).await.unwrap();
        assert_eq!(reply.text, APOLOGY);
        assert!(booking.dialogue("s-1").is_none());

        let history = store.messages(&reply.conversation_id.unwrap()).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "agendar cita");
    }
}
