//! WebSocket entry point. Each connection gets a read loop that handles its
//! events one at a time, and a writer task that drains the connection's
//! outbox. Everything else talks to the connection through the registry.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app::AppState;
use crate::auth::{operator_subject, resolve_user};
use crate::error::{ChatError, HandoffError};
use crate::types::{ConnectionId, ConnectionRole, EventEnvelopeIn, Session, SessionMode};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let connection_id = state.registry.connect(tx);
    debug!(connection_id, "socket connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            emit_error(&state, connection_id, "invalid envelope");
            continue;
        };
        dispatch(&state, connection_id, envelope).await;
    }

    disconnect(&state, connection_id);
    send_task.abort();
}

fn emit_error(state: &AppState, connection_id: ConnectionId, message: impl std::fmt::Display) {
    state
        .registry
        .emit(connection_id, "error", json!({ "message": message.to_string() }));
}

fn str_field<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Removes the connection. A user who leaves mid-handoff is announced to
/// the rest of the conversation; the conversation itself stays open.
pub(crate) fn disconnect(state: &AppState, connection_id: ConnectionId) {
    let Some(session) = state.registry.disconnect(connection_id) else {
        return;
    };
    debug!(connection_id, session_id = %session.session_id, "socket disconnected");
    if session.role != ConnectionRole::User || session.mode != SessionMode::Human {
        return;
    }
    let Some(conversation_id) = session.conversation_id else {
        return;
    };
    let participants = state.registry.conversation_participants(&conversation_id);
    state.registry.emit_many(
        &participants,
        "participant:left",
        json!({
            "conversationId": conversation_id,
            "sessionId": session.session_id,
            "userId": session.user_id,
        }),
    );
}

pub(crate) async fn dispatch(state: &Arc<AppState>, connection_id: ConnectionId, envelope: EventEnvelopeIn) {
    let Some(session) = state.registry.get(connection_id) else {
        return;
    };
    let data = &envelope.data;
    match envelope.event.as_str() {
        "user:register" => user_register(state, connection_id, data).await,
        "user:message" | "user:request-handoff" if session.role != ConnectionRole::User => {
            emit_error(state, connection_id, "register as a user first");
        }
        "user:message" => user_message(state, &session, data).await,
        "user:request-handoff" => {
            let reason = str_field(data, "reason");
            match state
                .chat
                .request_handoff(&session.session_id, session.user_id.as_deref(), reason)
                .await
            {
                Ok(ticket) => {
                    let tabs = state.registry.session_connections(&session.session_id);
                    state.registry.emit_many(&tabs, "handoff:queued", &ticket);
                }
                Err(err) => {
                    warn!(session_id = %session.session_id, error = %err, "handoff request failed");
                    emit_error(state, connection_id, "could not reach an operator");
                }
            }
        }
        "operator:register" => operator_register(state, connection_id, data).await,
        event if event.starts_with("operator:") => {
            let Some(operator_id) = session.user_id.clone().filter(|_| session.is_operator())
            else {
                emit_error(state, connection_id, "operator registration required");
                return;
            };
            operator_event(state, &session, &operator_id, event, data).await;
        }
        other => emit_error(state, connection_id, format!("unknown event {other}")),
    }
}

async fn user_register(state: &Arc<AppState>, connection_id: ConnectionId, data: &Value) {
    let Some(session_id) = str_field(data, "sessionId") else {
        emit_error(state, connection_id, "sessionId is required");
        return;
    };
    let user_id = match resolve_user(
        &state.config.identity_secret,
        str_field(data, "token"),
        str_field(data, "userId"),
    ) {
        Ok(user_id) => user_id,
        Err(err) => {
            emit_error(state, connection_id, err);
            return;
        }
    };
    let display_name = str_field(data, "displayName").map(str::to_string);

    let session = match state
        .registry
        .register_user(connection_id, session_id, user_id.clone(), display_name)
    {
        Ok(session) => session,
        Err(err) => {
            emit_error(state, connection_id, err);
            return;
        }
    };

    // Resume a handoff that outlived an earlier connection.
    let mut history = Vec::new();
    match state
        .chat
        .current_conversation(session_id, user_id.as_deref())
        .await
    {
        Ok(Some(conversation)) if conversation.state.is_human() => {
            state
                .registry
                .attach_conversation(connection_id, &conversation.id, SessionMode::Human);
            history = state.chat.history(&conversation.id).await.unwrap_or_default();
        }
        Ok(_) => {}
        Err(err) => warn!(session_id, error = %err, "conversation lookup failed"),
    }

    let session = state.registry.get(connection_id).unwrap_or(session);
    info!(connection_id, session_id, user_id = ?session.user_id, "user registered");
    state.registry.emit(
        connection_id,
        "session:registered",
        json!({
            "sessionId": session.session_id,
            "userId": session.user_id,
            "mode": session.mode,
            "conversationId": session.conversation_id,
            "history": history,
        }),
    );
}

async fn user_message(state: &Arc<AppState>, session: &Session, data: &Value) {
    let Some(text) = str_field(data, "text") else {
        emit_error(state, session.connection_id, "text is required");
        return;
    };
    match state
        .chat
        .submit_turn(Some(&session.session_id), text, session.user_id.as_deref())
        .await
    {
        // Relayed text already reached the participants as `message:new`.
        Ok(reply) if reply.relayed && reply.text.is_empty() => {}
        Ok(reply) => {
            let tabs = state.registry.session_connections(&session.session_id);
            state.registry.emit_many(&tabs, "bot:reply", &reply);
        }
        Err(ChatError::EmptyMessage) => emit_error(state, session.connection_id, "text is required"),
        Err(err) => {
            warn!(session_id = %session.session_id, error = %err, "turn failed");
            emit_error(state, session.connection_id, "message could not be processed");
        }
    }
}

async fn operator_register(state: &Arc<AppState>, connection_id: ConnectionId, data: &Value) {
    let Some(operator_id) = str_field(data, "token")
        .and_then(|token| operator_subject(&state.config.identity_secret, token))
    else {
        state.registry.emit(
            connection_id,
            "auth:error",
            json!({ "message": "invalid operator token" }),
        );
        return;
    };
    let display_name = str_field(data, "displayName").map(str::to_string);
    if let Err(err) = state
        .registry
        .register_operator(connection_id, &operator_id, display_name)
    {
        emit_error(state, connection_id, err);
        return;
    }
    info!(connection_id, operator_id = %operator_id, "operator registered");
    state.registry.emit(
        connection_id,
        "operator:registered",
        json!({ "operatorId": operator_id }),
    );
    send_queue_snapshot(state, connection_id, &operator_id).await;
}

async fn send_queue_snapshot(state: &Arc<AppState>, connection_id: ConnectionId, operator_id: &str) {
    let pending = state.handoff.pending_conversations().await;
    let mine = state.handoff.operator_conversations(operator_id).await;
    match (pending, mine) {
        (Ok(pending), Ok(mine)) => state.registry.emit(
            connection_id,
            "queue:snapshot",
            json!({ "pending": pending, "mine": mine }),
        ),
        (Err(err), _) | (_, Err(err)) => {
            warn!(operator_id, error = %err, "queue snapshot failed");
            emit_error(state, connection_id, "queue unavailable");
        }
    }
}

async fn operator_event(
    state: &Arc<AppState>,
    session: &Session,
    operator_id: &str,
    event: &str,
    data: &Value,
) {
    let connection_id = session.connection_id;
    if event == "operator:list" {
        send_queue_snapshot(state, connection_id, operator_id).await;
        return;
    }

    let Some(conversation_id) = str_field(data, "conversationId")
        .map(str::to_string)
        .or_else(|| session.conversation_id.clone())
    else {
        emit_error(state, connection_id, "conversationId is required");
        return;
    };

    let result = match event {
        "operator:claim" => match state.handoff.assign_operator(&conversation_id, operator_id).await {
            Ok(conversation) => {
                state
                    .registry
                    .attach_conversation(connection_id, &conversation.id, SessionMode::Human);
                let history = state.handoff.history(&conversation.id).await.unwrap_or_default();
                state.registry.emit(
                    connection_id,
                    "operator:claimed",
                    json!({ "conversation": conversation, "history": history }),
                );
                Ok(())
            }
            Err(HandoffError::AlreadyTaken {
                conversation_id,
                operator_id: owner,
            }) => {
                state.registry.emit(
                    connection_id,
                    "claim:rejected",
                    json!({ "conversationId": conversation_id, "operatorId": owner }),
                );
                Ok(())
            }
            Err(err) => Err(err),
        },
        "operator:message" => match str_field(data, "text") {
            Some(text) => state
                .handoff
                .operator_message(&conversation_id, operator_id, text)
                .await
                .map(|_| ()),
            None => {
                emit_error(state, connection_id, "text is required");
                Ok(())
            }
        },
        "operator:close" => state
            .handoff
            .operator_close(&conversation_id, operator_id)
            .await
            .map(|_| ()),
        "operator:mark-read" => state
            .handoff
            .operator_mark_read(&conversation_id, operator_id)
            .await
            .map(|_| ()),
        other => {
            emit_error(state, connection_id, format!("unknown event {other}"));
            Ok(())
        }
    };

    if let Err(err) = result {
        warn!(operator_id, conversation_id = %conversation_id, error = %err, event, "operator event failed");
        emit_error(state, connection_id, err);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::app::test_state;
    use crate::types::ConversationState;

    fn envelope(event: &str, data: Value) -> EventEnvelopeIn {
        EventEnvelopeIn {
            event: event.to_string(),
            data,
        }
    }

    fn connect(state: &AppState) -> (ConnectionId, UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (state.registry.connect(tx), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<String>) -> Vec<Value> {
        let mut events = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            events.push(serde_json::from_str::<Value>(&payload).unwrap());
        }
        events
    }

    fn find<'a>(events: &'a [Value], name: &str) -> Option<&'a Value> {
        events.iter().find(|e| e["event"] == name).map(|e| &e["data"])
    }

    #[tokio::test]
    async fn bot_reply_goes_to_every_tab_of_the_session() {
        let state = test_state();
        let (tab_a, mut rx_a) = connect(&state);
        let (tab_b, mut rx_b) = connect(&state);
        for tab in [tab_a, tab_b] {
            dispatch(&state, tab, envelope("user:register", json!({ "sessionId": "s-1" }))).await;
        }
        dispatch(&state, tab_a, envelope("user:message", json!({ "text": "hola" }))).await;

        let a = drain(&mut rx_a);
        let b = drain(&mut rx_b);
        assert_eq!(find(&a, "bot:reply").unwrap()["intent"], "greeting");
        assert_eq!(find(&b, "bot:reply").unwrap()["source"], "local");
    }

    #[tokio::test]
    async fn full_handoff_round_trip() {
        let state = test_state();
        let (user, mut user_rx) = connect(&state);
        let (operator, mut op_rx) = connect(&state);

        dispatch(&state, operator, envelope("operator:register", json!({ "token": "op-1" }))).await;
        assert!(find(&drain(&mut op_rx), "queue:snapshot").is_some());

        dispatch(&state, user, envelope("user:register", json!({ "sessionId": "s-1" }))).await;
        dispatch(&state, user, envelope("user:request-handoff", json!({ "reason": "dudas" }))).await;
        let queued = drain(&mut user_rx);
        let conversation_id = find(&queued, "handoff:queued").unwrap()["conversationId"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(find(&drain(&mut op_rx), "queue:waiting").is_some());

        dispatch(
            &state,
            operator,
            envelope("operator:claim", json!({ "conversationId": conversation_id })),
        )
        .await;
        assert!(find(&drain(&mut op_rx), "operator:claimed").is_some());
        assert!(find(&drain(&mut user_rx), "operator:joined").is_some());

        dispatch(&state, user, envelope("user:message", json!({ "text": "necesito ayuda" }))).await;
        let relayed = drain(&mut op_rx);
        assert_eq!(find(&relayed, "message:new").unwrap()["content"], "necesito ayuda");
        assert!(find(&drain(&mut user_rx), "bot:reply").is_none());

        dispatch(&state, operator, envelope("operator:message", json!({ "text": "claro" }))).await;
        assert_eq!(find(&drain(&mut user_rx), "message:new").unwrap()["content"], "claro");

        dispatch(&state, operator, envelope("operator:close", json!({}))).await;
        assert!(find(&drain(&mut user_rx), "conversation:closed").is_some());
        let conversation = state.handoff.conversation(&conversation_id).await.unwrap();
        assert_eq!(conversation.state, ConversationState::Closed);
        assert_eq!(state.registry.get(user).unwrap().mode, SessionMode::Bot);
    }

    #[tokio::test]
    async fn second_claim_is_rejected() {
        let state = test_state();
        let ticket = state.chat.request_handoff("s-1", None, None).await.unwrap();
        let (op_a, _rx_a) = connect(&state);
        let (op_b, mut rx_b) = connect(&state);
        dispatch(&state, op_a, envelope("operator:register", json!({ "token": "op-a" }))).await;
        dispatch(&state, op_b, envelope("operator:register", json!({ "token": "op-b" }))).await;

        let claim = json!({ "conversationId": ticket.conversation_id });
        dispatch(&state, op_a, envelope("operator:claim", claim.clone())).await;
        drain(&mut rx_b);
        dispatch(&state, op_b, envelope("operator:claim", claim)).await;

        let events = drain(&mut rx_b);
        assert_eq!(find(&events, "claim:rejected").unwrap()["operatorId"], "op-a");
        assert!(find(&events, "operator:claimed").is_none());
    }

    #[tokio::test]
    async fn operator_cannot_post_into_or_close_a_colleagues_conversation() {
        let state = test_state();
        let ticket = state.chat.request_handoff("s-1", None, None).await.unwrap();
        let id = ticket.conversation_id.as_str();
        let (op_a, _rx_a) = connect(&state);
        let (op_b, mut rx_b) = connect(&state);
        dispatch(&state, op_a, envelope("operator:register", json!({ "token": "op-a" }))).await;
        dispatch(&state, op_b, envelope("operator:register", json!({ "token": "op-b" }))).await;
        dispatch(&state, op_a, envelope("operator:claim", json!({ "conversationId": id }))).await;
        drain(&mut rx_b);

        let target = json!({ "conversationId": id, "text": "hola" });
        for event in ["operator:message", "operator:mark-read", "operator:close"] {
            dispatch(&state, op_b, envelope(event, target.clone())).await;
            let events = drain(&mut rx_b);
            assert!(find(&events, "error").is_some(), "{event} was accepted");
        }

        let history = state.handoff.history(id).await.unwrap();
        assert!(history.iter().all(|m| m.sender_id.as_deref() != Some("op-b")));
        let conversation = state.handoff.conversation(id).await.unwrap();
        assert_eq!(conversation.state, ConversationState::Staffed);
        assert_eq!(conversation.operator_id.as_deref(), Some("op-a"));
    }

    #[tokio::test]
    async fn roles_are_exclusive_per_connection() {
        let state = test_state();
        let (conn, mut rx) = connect(&state);
        dispatch(&state, conn, envelope("user:register", json!({ "sessionId": "s-1" }))).await;
        dispatch(&state, conn, envelope("operator:register", json!({ "token": "op-1" }))).await;
        assert!(find(&drain(&mut rx), "error").is_some());

        dispatch(&state, conn, envelope("operator:list", json!({}))).await;
        assert!(find(&drain(&mut rx), "queue:snapshot").is_none());
    }

    #[tokio::test]
    async fn user_leaving_mid_handoff_is_announced() {
        let state = test_state();
        let (user, _user_rx) = connect(&state);
        let (operator, mut op_rx) = connect(&state);
        dispatch(&state, operator, envelope("operator:register", json!({ "token": "op-1" }))).await;
        dispatch(&state, user, envelope("user:register", json!({ "sessionId": "s-1" }))).await;
        dispatch(&state, user, envelope("user:request-handoff", json!({}))).await;
        let ticket = state.chat.request_handoff("s-1", None, None).await.unwrap();
        dispatch(
            &state,
            operator,
            envelope("operator:claim", json!({ "conversationId": ticket.conversation_id })),
        )
        .await;
        drain(&mut op_rx);

        disconnect(&state, user);
        let left = drain(&mut op_rx);
        assert_eq!(find(&left, "participant:left").unwrap()["sessionId"], "s-1");
        assert!(state.registry.get(user).is_none());
        let conversation = state.handoff.conversation(&ticket.conversation_id).await.unwrap();
        assert_eq!(conversation.state, ConversationState::Staffed);
    }
}
