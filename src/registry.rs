//! Live connection state. Keys are connection ids; every mutation goes
//! through a single-key DashMap entry, so the only cross-connection write
//! is the compare-and-clear used when a conversation closes.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::error::RegistryError;
use crate::types::{ConnectionId, ConnectionRole, Session, SessionMode};

#[derive(Default)]
pub struct SessionRegistry {
    next_connection_id: AtomicUsize,
    sessions: DashMap<ConnectionId, Session>,
    outboxes: DashMap<ConnectionId, mpsc::UnboundedSender<String>>,
}

pub fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh connection under a provisional session id.
    pub fn connect(&self, outbox: mpsc::UnboundedSender<String>) -> ConnectionId {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
        let provisional = uuid::Uuid::new_v4().to_string();
        self.sessions
            .insert(connection_id, Session::new(connection_id, &provisional));
        self.outboxes.insert(connection_id, outbox);
        connection_id
    }

    pub fn disconnect(&self, connection_id: ConnectionId) -> Option<Session> {
        self.outboxes.remove(&connection_id);
        self.sessions.remove(&connection_id).map(|(_, session)| session)
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<Session> {
        self.sessions.get(&connection_id).map(|entry| entry.clone())
    }

    pub fn register_user(
        &self,
        connection_id: ConnectionId,
        session_id: &str,
        user_id: Option<String>,
        display_name: Option<String>,
    ) -> Result<Session, RegistryError> {
        let mut entry = self
            .sessions
            .get_mut(&connection_id)
            .ok_or(RegistryError::UnknownConnection(connection_id))?;
        if entry.role == ConnectionRole::Operator {
            return Err(RegistryError::RoleConflict("operator"));
        }
        entry.role = ConnectionRole::User;
        entry.session_id = session_id.to_string();
        entry.user_id = user_id;
        entry.display_name = display_name;
        Ok(entry.clone())
    }

    /// Idempotent for the same connection; a user connection cannot become
    /// an operator.
    pub fn register_operator(
        &self,
        connection_id: ConnectionId,
        operator_id: &str,
        display_name: Option<String>,
    ) -> Result<Session, RegistryError> {
        let mut entry = self
            .sessions
            .get_mut(&connection_id)
            .ok_or(RegistryError::UnknownConnection(connection_id))?;
        match entry.role {
            ConnectionRole::User => return Err(RegistryError::RoleConflict("user")),
            ConnectionRole::Operator if entry.user_id.as_deref() != Some(operator_id) => {
                return Err(RegistryError::RoleConflict("another operator"))
            }
            ConnectionRole::Operator => return Ok(entry.clone()),
            ConnectionRole::Unregistered => {}
        }
        entry.role = ConnectionRole::Operator;
        entry.user_id = Some(operator_id.to_string());
        entry.display_name = display_name;
        entry.mode = SessionMode::Human;
        Ok(entry.clone())
    }

    pub fn attach_conversation(
        &self,
        connection_id: ConnectionId,
        conversation_id: &str,
        mode: SessionMode,
    ) -> Option<Session> {
        let mut entry = self.sessions.get_mut(&connection_id)?;
        entry.conversation_id = Some(conversation_id.to_string());
        entry.mode = mode;
        Some(entry.clone())
    }

    /// Points every user connection of `session_id` at the conversation.
    pub fn attach_session_conversation(
        &self,
        session_id: &str,
        conversation_id: &str,
        mode: SessionMode,
    ) -> Vec<ConnectionId> {
        let mut touched = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            if entry.role == ConnectionRole::User && entry.session_id == session_id {
                entry.conversation_id = Some(conversation_id.to_string());
                entry.mode = mode;
                touched.push(*entry.key());
            }
        }
        touched
    }

    /// Clears the connection's conversation only if it still points at
    /// `conversation_id`.
    pub fn compare_and_clear_conversation(
        &self,
        connection_id: ConnectionId,
        conversation_id: &str,
    ) -> bool {
        let Some(mut entry) = self.sessions.get_mut(&connection_id) else {
            return false;
        };
        if entry.conversation_id.as_deref() != Some(conversation_id) {
            return false;
        }
        entry.conversation_id = None;
        if entry.role == ConnectionRole::User {
            entry.mode = SessionMode::Bot;
        }
        true
    }

    /// Compare-and-clear on every connection pointing at the conversation.
    pub fn evict_conversation(&self, conversation_id: &str) -> Vec<ConnectionId> {
        self.conversation_participants(conversation_id)
            .into_iter()
            .filter(|id| self.compare_and_clear_conversation(*id, conversation_id))
            .collect()
    }

    pub fn session_connections(&self, session_id: &str) -> Vec<ConnectionId> {
        self.sessions
            .iter()
            .filter(|entry| entry.role != ConnectionRole::Operator && entry.session_id == session_id)
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn conversation_participants(&self, conversation_id: &str) -> Vec<ConnectionId> {
        self.sessions
            .iter()
            .filter(|entry| entry.conversation_id.as_deref() == Some(conversation_id))
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn operator_connections(&self) -> Vec<ConnectionId> {
        self.sessions
            .iter()
            .filter(|entry| entry.is_operator())
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn emit<T: Serialize>(&self, connection_id: ConnectionId, event: &str, data: T) {
        let Some(payload) = event_payload(event, data) else {
            return;
        };
        if let Some(outbox) = self.outboxes.get(&connection_id) {
            let _ = outbox.send(payload);
        }
    }

    pub fn emit_many<T: Serialize>(&self, connection_ids: &[ConnectionId], event: &str, data: T) {
        let Some(payload) = event_payload(event, data) else {
            return;
        };
        for connection_id in connection_ids {
            if let Some(outbox) = self.outboxes.get(connection_id) {
                let _ = outbox.send(payload.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(registry: &SessionRegistry) -> (ConnectionId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (registry.connect(tx), rx)
    }

    #[test]
    fn connection_holds_a_single_role() {
        let registry = SessionRegistry::new();
        let (user, _rx) = connect(&registry);
        registry
            .register_user(user, "tab-1", Some("u-1".into()), None)
            .unwrap();
        assert!(matches!(
            registry.register_operator(user, "op-1", None),
            Err(RegistryError::RoleConflict("user"))
        ));

        let (operator, _rx2) = connect(&registry);
        registry.register_operator(operator, "op-1", None).unwrap();
        let again = registry.register_operator(operator, "op-1", None).unwrap();
        assert!(again.is_operator());
        assert!(registry
            .register_user(operator, "tab-2", None, None)
            .is_err());
        assert_eq!(registry.operator_connections(), vec![operator]);
    }

    #[test]
    fn compare_and_clear_only_matches_current_conversation() {
        let registry = SessionRegistry::new();
        let (conn, _rx) = connect(&registry);
        registry.register_user(conn, "tab-1", None, None).unwrap();
        registry.attach_conversation(conn, "conv-2", SessionMode::Human);

        assert!(!registry.compare_and_clear_conversation(conn, "conv-1"));
        assert_eq!(
            registry.get(conn).unwrap().conversation_id.as_deref(),
            Some("conv-2")
        );
        assert!(registry.compare_and_clear_conversation(conn, "conv-2"));
        let session = registry.get(conn).unwrap();
        assert!(session.conversation_id.is_none());
        assert_eq!(session.mode, SessionMode::Bot);
    }

    #[test]
    fn groups_resolve_to_the_right_connections() {
        let registry = SessionRegistry::new();
        let (tab_a, _a) = connect(&registry);
        let (tab_b, _b) = connect(&registry);
        let (other, _c) = connect(&registry);
        registry.register_user(tab_a, "s-1", None, None).unwrap();
        registry.register_user(tab_b, "s-1", None, None).unwrap();
        registry.register_user(other, "s-2", None, None).unwrap();

        let mut same_session = registry.session_connections("s-1");
        same_session.sort();
        assert_eq!(same_session, vec![tab_a, tab_b]);

        let touched = registry.attach_session_conversation("s-1", "conv-1", SessionMode::Human);
        assert_eq!(touched.len(), 2);
        let mut participants = registry.conversation_participants("conv-1");
        participants.sort();
        assert_eq!(participants, vec![tab_a, tab_b]);

        let evicted = registry.evict_conversation("conv-1");
        assert_eq!(evicted.len(), 2);
        assert!(registry.conversation_participants("conv-1").is_empty());
    }

    #[test]
    fn emit_reaches_only_live_connections() {
        let registry = SessionRegistry::new();
        let (conn, mut rx) = connect(&registry);
        registry.emit(conn, "ping", json!({ "n": 1 }));
        let payload = rx.try_recv().unwrap();
        assert!(payload.contains("\"event\":\"ping\""));

        let gone = registry.disconnect(conn).unwrap();
        assert_eq!(gone.connection_id, conn);
        registry.emit(conn, "ping", json!({}));
        assert!(registry.get(conn).is_none());
    }
}
