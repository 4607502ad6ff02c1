//! Persistence seams. The conversational core only talks to these traits;
//! `PgStore` backs them with Postgres and `MemoryStore` keeps everything in
//! process (tests and `STORE_BACKEND=memory`).

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::StoreError;
use crate::types::{
    Appointment, CancelOutcome, ChatMessage, Conversation, ConversationOwner, Location,
    ReserveOutcome, SenderKind, Service, Slot,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError>;

    /// The newest non-closed conversation for the owner, if any.
    async fn find_open(
        &self,
        owner: &ConversationOwner,
    ) -> Result<Option<Conversation>, StoreError>;

    /// The owner's open conversation, or `candidate` inserted as it. Atomic:
    /// concurrent callers for the same owner all get the same conversation.
    /// `seq` is assigned by the store.
    async fn find_or_create_open(
        &self,
        owner: &ConversationOwner,
        candidate: Conversation,
    ) -> Result<Conversation, StoreError>;

    /// `Active -> WaitingOperator`. Returns `None` when the conversation was
    /// not active.
    async fn mark_waiting(&self, id: &str, at: &str) -> Result<Option<Conversation>, StoreError>;

    /// Conditional `WaitingOperator -> Staffed`. Returns `None` when the
    /// conversation was no longer waiting.
    async fn claim(
        &self,
        id: &str,
        operator_id: &str,
        at: &str,
    ) -> Result<Option<Conversation>, StoreError>;

    /// Any non-closed state `-> Closed`. Returns `None` if already closed
    /// or missing.
    async fn close(&self, id: &str, at: &str) -> Result<Option<Conversation>, StoreError>;

    async fn append_message(&self, message: &ChatMessage) -> Result<(), StoreError>;

    async fn messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, StoreError>;

    /// Flags unread messages from any sender except `reader` as read.
    async fn mark_read(
        &self,
        conversation_id: &str,
        reader: SenderKind,
    ) -> Result<u64, StoreError>;

    /// Waiting conversations in creation order.
    async fn list_waiting(&self) -> Result<Vec<Conversation>, StoreError>;

    async fn count_waiting_before(&self, seq: i64) -> Result<usize, StoreError>;

    /// Non-closed conversations staffed by the operator, most recent activity first.
    async fn list_for_operator(&self, operator_id: &str) -> Result<Vec<Conversation>, StoreError>;
}

#[async_trait]
pub trait CatalogService: Send + Sync {
    async fn list_services(&self) -> Result<Vec<Service>, StoreError>;

    /// Case-insensitive lookup by exact name or id.
    async fn find_service(&self, name_or_id: &str) -> Result<Option<Service>, StoreError>;

    /// Distinct dates in `[from, to]` that still have a slot with capacity.
    async fn availability(
        &self,
        service_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<NaiveDate>, StoreError>;

    /// Slots with remaining capacity on the date, ordered by start time.
    async fn slots(&self, service_id: &str, date: NaiveDate) -> Result<Vec<Slot>, StoreError>;

    async fn locations(&self) -> Result<Vec<Location>, StoreError>;
}

#[async_trait]
pub trait AppointmentStore: Send + Sync {
    /// Decrement-if-positive on the slot and create the appointment in one
    /// atomic unit.
    async fn reserve_slot_and_create(
        &self,
        slot_id: &str,
        user_id: &str,
    ) -> Result<ReserveOutcome, StoreError>;

    /// Restores the consumed capacity and marks the appointment cancelled.
    async fn cancel(&self, code: &str, user_id: &str) -> Result<CancelOutcome, StoreError>;

    async fn upcoming_for_user(
        &self,
        user_id: &str,
        from: NaiveDate,
    ) -> Result<Vec<Appointment>, StoreError>;
}

pub fn appointment_code() -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string().to_ascii_uppercase();
    format!("LAB-{}", &raw[..6])
}
