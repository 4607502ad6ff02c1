use std::collections::HashMap;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type ConnectionId = usize;

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionRole {
    Unregistered,
    User,
    Operator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Bot,
    Human,
}

/// Live, per-connection state. Dropped on disconnect; the conversation it
/// points at outlives it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub connection_id: ConnectionId,
    pub session_id: String,
    pub user_id: Option<String>,
    pub display_name: Option<String>,
    pub role: ConnectionRole,
    pub mode: SessionMode,
    pub conversation_id: Option<String>,
}

impl Session {
    pub fn new(connection_id: ConnectionId, session_id: &str) -> Self {
        Self {
            connection_id,
            session_id: session_id.to_string(),
            user_id: None,
            display_name: None,
            role: ConnectionRole::Unregistered,
            mode: SessionMode::Bot,
            conversation_id: None,
        }
    }

    pub fn is_operator(&self) -> bool {
        self.role == ConnectionRole::Operator
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Active,
    WaitingOperator,
    Staffed,
    Closed,
}

impl ConversationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::WaitingOperator => "waiting_operator",
            Self::Staffed => "staffed",
            Self::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "waiting_operator" => Some(Self::WaitingOperator),
            "staffed" => Some(Self::Staffed),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    pub fn is_human(&self) -> bool {
        matches!(self, Self::WaitingOperator | Self::Staffed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    /// Creation ordinal; the waiting queue is ordered by it.
    pub seq: i64,
    pub kind: String,
    pub state: ConversationState,
    pub session_id: String,
    pub user_id: Option<String>,
    pub operator_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub waiting_since: Option<String>,
    pub transferred_at: Option<String>,
    pub closed_at: Option<String>,
}

impl Conversation {
    /// A new chat conversation; the store assigns `seq` on insert.
    pub fn open(session_id: &str, user_id: Option<&str>) -> Self {
        let now = now_iso();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            seq: 0,
            kind: "chat".to_string(),
            state: ConversationState::Active,
            session_id: session_id.to_string(),
            user_id: user_id.map(str::to_string),
            operator_id: None,
            created_at: now.clone(),
            updated_at: now,
            waiting_since: None,
            transferred_at: None,
            closed_at: None,
        }
    }
}

/// Lookup key for "the" open conversation of a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationOwner {
    User(String),
    Session(String),
}

impl ConversationOwner {
    pub fn for_caller(session_id: &str, user_id: Option<&str>) -> Self {
        match user_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(user_id) => Self::User(user_id.to_string()),
            None => Self::Session(session_id.to_string()),
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::User(user_id) => Some(user_id),
            Self::Session(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
    User,
    Operator,
    Bot,
    System,
}

impl SenderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Operator => "operator",
            Self::Bot => "bot",
            Self::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "operator" => Some(Self::Operator),
            "bot" => Some(Self::Bot),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender: SenderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    pub content: String,
    pub sent_at: String,
    #[serde(default)]
    pub read: bool,
}

impl ChatMessage {
    pub fn new(
        conversation_id: &str,
        sender: SenderKind,
        sender_id: Option<&str>,
        content: &str,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender,
            sender_id: sender_id.map(str::to_string),
            content: content.to_string(),
            sent_at: now_iso(),
            read: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub preparation: String,
    pub price_cents: i64,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub id: String,
    pub name: String,
    pub address: String,
    pub hours: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub id: String,
    pub service_id: String,
    pub location_id: Option<String>,
    pub location_name: Option<String>,
    pub date: NaiveDate,
    /// `HH:MM`, local lab time.
    pub start_time: String,
    pub capacity: i32,
    pub remaining: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    Cancelled,
    Completed,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(Self::Scheduled),
            "cancelled" => Some(Self::Cancelled),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub id: String,
    pub code: String,
    pub slot_id: String,
    pub service_id: String,
    pub service_name: String,
    pub user_id: String,
    pub date: NaiveDate,
    pub start_time: String,
    pub location_name: Option<String>,
    pub status: AppointmentStatus,
    pub created_at: String,
    pub cancelled_at: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ReserveOutcome {
    Booked(Appointment),
    CapacityExhausted,
    /// The same user already holds a scheduled appointment in this slot.
    Duplicate,
}

#[derive(Debug, Clone)]
pub enum CancelOutcome {
    Cancelled(Appointment),
    NotFound,
    AlreadyTerminal(AppointmentStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnSource {
    Remote,
    Local,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingSummary {
    pub service_name: String,
    pub date: NaiveDate,
    pub start_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffTicket {
    pub conversation_id: String,
    pub queue_position: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnReply {
    pub session_id: String,
    pub conversation_id: Option<String>,
    pub text: String,
    pub source: TurnSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub requires_auth: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking_summary: Option<BookingSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handoff: Option<HandoffTicket>,
    /// The text went to a human-staffed conversation instead of the bot.
    pub relayed: bool,
}

/// Best-effort events pushed to external systems.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SystemEvent {
    AppointmentBooked { code: String, user_id: String, slot_id: String },
    AppointmentCancelled { code: String, user_id: String },
    HandoffRequested { conversation_id: String, queue_position: usize },
    ConversationStaffed { conversation_id: String, operator_id: String },
    ConversationClosed { conversation_id: String, closed_by: String },
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTurnBody {
    #[serde(default)]
    pub session_id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffBody {
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorMessageBody {
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelAppointmentBody {
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Parameters an NLU provider pulled out of the utterance.
pub type NluParameters = HashMap<String, String>;
