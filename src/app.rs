use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::auth::{bearer_token, operator_subject, resolve_user};
use crate::booking::BookingDesk;
use crate::chat::ChatService;
use crate::config::{AppConfig, StoreBackend};
use crate::error::{AuthError, ChatError, HandoffError};
use crate::gateway::ws_handler;
use crate::handoff::HandoffCoordinator;
use crate::intent::IntentEngine;
use crate::nlu::{HttpNluProvider, NluProvider};
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::registry::SessionRegistry;
use crate::store::{AppointmentStore, CatalogService, ConversationStore, MemoryStore, PgStore};
use crate::types::{
    now_iso, CancelAppointmentBody, CancelOutcome, HandoffBody, HistoryQuery, OperatorMessageBody,
    SubmitTurnBody,
};

pub struct AppState {
    pub config: AppConfig,
    pub registry: Arc<SessionRegistry>,
    pub chat: Arc<ChatService>,
    pub handoff: Arc<HandoffCoordinator>,
    pub booking: Arc<BookingDesk>,
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl std::fmt::Display) -> ApiError {
    (status, Json(json!({ "error": message.to_string() })))
}

impl AppState {
    /// Wires the conversational core on top of one store that backs
    /// conversations, the catalog and appointments.
    pub fn assemble<S>(
        config: AppConfig,
        store: Arc<S>,
        nlu: Option<Arc<dyn NluProvider>>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self>
    where
        S: ConversationStore + CatalogService + AppointmentStore + 'static,
    {
        let conversations: Arc<dyn ConversationStore> = store.clone();
        let catalog: Arc<dyn CatalogService> = store.clone();
        let appointments: Arc<dyn AppointmentStore> = store;

        let registry = Arc::new(SessionRegistry::new());
        let booking = Arc::new(BookingDesk::new(
            catalog.clone(),
            appointments,
            notifier.clone(),
            config.chat.booking_lookahead_days,
        ));
        let handoff = Arc::new(HandoffCoordinator::new(
            conversations.clone(),
            registry.clone(),
            notifier,
        ));
        let engine = Arc::new(IntentEngine::new(
            nlu,
            catalog,
            booking.clone(),
            handoff.clone(),
            config.chat.clone(),
        ));
        let chat = Arc::new(ChatService::new(conversations, engine, handoff.clone()));

        Arc::new(Self {
            config,
            registry,
            chat,
            handoff,
            booking,
        })
    }

    fn caller(&self, headers: &HeaderMap, claimed: Option<&str>) -> Result<Option<String>, AuthError> {
        resolve_user(
            &self.config.identity_secret,
            bearer_token(headers).as_deref(),
            claimed,
        )
    }
}

fn operator_from_headers(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let token = bearer_token(headers)
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "missing bearer token"))?;
    operator_subject(&state.config.identity_secret, &token)
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "invalid operator token"))
}

fn chat_error(err: ChatError) -> ApiError {
    match err {
        ChatError::EmptyMessage => api_error(StatusCode::BAD_REQUEST, err),
        ChatError::NotOwner => api_error(StatusCode::FORBIDDEN, err),
        ChatError::Handoff(err) => handoff_error(err),
        other => {
            error!(error = %other, "chat request failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn handoff_error(err: HandoffError) -> ApiError {
    match err {
        HandoffError::NotFound(_) => api_error(StatusCode::NOT_FOUND, err),
        HandoffError::AlreadyTaken {
            ref conversation_id,
            ref operator_id,
        } => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": err.to_string(),
                "conversationId": conversation_id,
                "operatorId": operator_id,
            })),
        ),
        HandoffError::NotAssigned { .. } => api_error(StatusCode::FORBIDDEN, err),
        HandoffError::Store(err) => {
            error!(error = %err, "handoff request failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn submit_turn(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SubmitTurnBody>,
) -> Response {
    let user_id = match state.caller(&headers, body.user_id.as_deref()) {
        Ok(user_id) => user_id,
        Err(err) => return api_error(StatusCode::UNAUTHORIZED, err).into_response(),
    };
    match state
        .chat
        .submit_turn(body.session_id.as_deref(), &body.text, user_id.as_deref())
        .await
    {
        Ok(reply) => Json(reply).into_response(),
        Err(err) => chat_error(err).into_response(),
    }
}

async fn request_handoff(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<HandoffBody>,
) -> Response {
    let user_id = match state.caller(&headers, body.user_id.as_deref()) {
        Ok(user_id) => user_id,
        Err(err) => return api_error(StatusCode::UNAUTHORIZED, err).into_response(),
    };
    let session_id = body.session_id.trim();
    if session_id.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "sessionId is required").into_response();
    }
    match state
        .chat
        .request_handoff(session_id, user_id.as_deref(), body.reason.as_deref())
        .await
    {
        Ok(ticket) => Json(ticket).into_response(),
        Err(err) => chat_error(err).into_response(),
    }
}

async fn conversation_messages(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let user_id = match state.caller(&headers, query.user_id.as_deref()) {
        Ok(user_id) => user_id,
        Err(err) => return api_error(StatusCode::UNAUTHORIZED, err).into_response(),
    };
    match state
        .chat
        .history_for_caller(&conversation_id, query.session_id.as_deref(), user_id.as_deref())
        .await
    {
        Ok(messages) => Json(json!({ "messages": messages })).into_response(),
        Err(err) => chat_error(err).into_response(),
    }
}

async fn cancel_appointment(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    headers: HeaderMap,
    body: Option<Json<CancelAppointmentBody>>,
) -> Response {
    let claimed = body.as_ref().and_then(|Json(body)| body.user_id.clone());
    let user_id = match state.caller(&headers, claimed.as_deref()) {
        Ok(Some(user_id)) => user_id,
        Ok(None) => {
            return api_error(StatusCode::UNAUTHORIZED, "login required").into_response()
        }
        Err(err) => return api_error(StatusCode::UNAUTHORIZED, err).into_response(),
    };
    match state.booking.cancel_appointment(&code, &user_id).await {
        Ok(CancelOutcome::Cancelled(appointment)) => {
            Json(json!({ "appointment": appointment })).into_response()
        }
        Ok(CancelOutcome::NotFound) => {
            api_error(StatusCode::NOT_FOUND, "appointment not found").into_response()
        }
        Ok(CancelOutcome::AlreadyTerminal(status)) => api_error(
            StatusCode::CONFLICT,
            format!("appointment is already {}", status.as_str()),
        )
        .into_response(),
        Err(err) => chat_error(err).into_response(),
    }
}

async fn operator_queue(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(err) = operator_from_headers(&state, &headers) {
        return err.into_response();
    }
    match state.handoff.pending_conversations().await {
        Ok(pending) => Json(json!({ "pending": pending })).into_response(),
        Err(err) => handoff_error(err).into_response(),
    }
}

async fn operator_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let operator_id = match operator_from_headers(&state, &headers) {
        Ok(operator_id) => operator_id,
        Err(err) => return err.into_response(),
    };
    match state.handoff.operator_conversations(&operator_id).await {
        Ok(conversations) => Json(json!({ "conversations": conversations })).into_response(),
        Err(err) => handoff_error(err).into_response(),
    }
}

async fn claim_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let operator_id = match operator_from_headers(&state, &headers) {
        Ok(operator_id) => operator_id,
        Err(err) => return err.into_response(),
    };
    match state
        .handoff
        .assign_operator(&conversation_id, &operator_id)
        .await
    {
        Ok(conversation) => Json(json!({ "conversation": conversation })).into_response(),
        Err(err) => handoff_error(err).into_response(),
    }
}

async fn operator_message(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<OperatorMessageBody>,
) -> Response {
    let operator_id = match operator_from_headers(&state, &headers) {
        Ok(operator_id) => operator_id,
        Err(err) => return err.into_response(),
    };
    let text = body.text.trim();
    if text.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "text is required").into_response();
    }
    match state
        .handoff
        .operator_message(&conversation_id, &operator_id, text)
        .await
    {
        Ok(message) => (StatusCode::CREATED, Json(json!({ "message": message }))).into_response(),
        Err(err) => handoff_error(err).into_response(),
    }
}

async fn close_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let operator_id = match operator_from_headers(&state, &headers) {
        Ok(operator_id) => operator_id,
        Err(err) => return err.into_response(),
    };
    match state
        .handoff
        .operator_close(&conversation_id, &operator_id)
        .await
    {
        Ok(conversation) => Json(json!({ "conversation": conversation })).into_response(),
        Err(err) => handoff_error(err).into_response(),
    }
}

async fn mark_read(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let operator_id = match operator_from_headers(&state, &headers) {
        Ok(operator_id) => operator_id,
        Err(err) => return err.into_response(),
    };
    match state
        .handoff
        .operator_mark_read(&conversation_id, &operator_id)
        .await
    {
        Ok(updated) => Json(json!({ "updated": updated })).into_response(),
        Err(err) => handoff_error(err).into_response(),
    }
}

async fn operator_history(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(err) = operator_from_headers(&state, &headers) {
        return err.into_response();
    }
    match state.handoff.history(&conversation_id).await {
        Ok(messages) => Json(json!({ "messages": messages })).into_response(),
        Err(err) => handoff_error(err).into_response(),
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat/turn", post(submit_turn))
        .route("/api/chat/handoff", post(request_handoff))
        .route(
            "/api/chat/conversations/{conversation_id}/messages",
            get(conversation_messages),
        )
        .route("/api/appointments/{code}/cancel", post(cancel_appointment))
        .route("/api/operator/queue", get(operator_queue))
        .route("/api/operator/conversations", get(operator_conversations))
        .route(
            "/api/operator/conversations/{conversation_id}/claim",
            post(claim_conversation),
        )
        .route(
            "/api/operator/conversations/{conversation_id}/message",
            post(operator_message),
        )
        .route(
            "/api/operator/conversations/{conversation_id}/close",
            post(close_conversation),
        )
        .route(
            "/api/operator/conversations/{conversation_id}/read",
            post(mark_read),
        )
        .route(
            "/api/operator/conversations/{conversation_id}/messages",
            get(operator_history),
        )
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run() {
    let _ = dotenvy::dotenv();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return;
        }
    };
    let port = config.port;
    // Per-call deadlines are set by the NLU provider and the webhook notifier.
    let client = match reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(3))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            error!(error = %err, "failed to build HTTP client");
            return;
        }
    };

    let nlu: Option<Arc<dyn NluProvider>> = config.nlu.clone().map(|nlu| {
        info!(url = %nlu.base_url, "remote nlu enabled");
        Arc::new(HttpNluProvider::new(client.clone(), nlu)) as Arc<dyn NluProvider>
    });
    if nlu.is_none() {
        warn!("NLU_URL not set, resolving intents locally");
    }
    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(
            client.clone(),
            url.clone(),
            config.notify_timeout,
        )),
        None => Arc::new(LogNotifier),
    };
    if config.identity_secret.is_empty() {
        warn!("IDENTITY_SECRET not set, identity tokens are not verified");
    }

    let state = match config.store_backend {
        StoreBackend::Postgres => {
            let pool = match PgPoolOptions::new()
                .max_connections(10)
                .connect(&config.database_url)
                .await
            {
                Ok(pool) => pool,
                Err(err) => {
                    error!(error = %err, "failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)");
                    return;
                }
            };
            let store = PgStore::new(pool);
            if let Err(err) = store.migrate().await {
                error!(error = %err, "failed to run sqlx migrations");
                return;
            }
            AppState::assemble(config, Arc::new(store), nlu, notifier)
        }
        StoreBackend::Memory => {
            info!("using the in-memory demo store");
            let today = chrono::Local::now().date_naive();
            AppState::assemble(config, Arc::new(MemoryStore::demo(today)), nlu, notifier)
        }
    };

    let app = router(state);
    let addr = format!("0.0.0.0:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(addr = %addr, error = %err, "failed to bind TCP listener");
            return;
        }
    };

    info!("lab chat server running at http://localhost:{port}");
    if let Err(err) = axum::serve(listener, app).await {
        error!(error = %err, "server runtime failure");
    }
}

#[cfg(test)]
pub(crate) fn test_state() -> Arc<AppState> {
    let config = AppConfig::from_lookup(|key| match key {
        "STORE_BACKEND" => Some("memory".to_string()),
        _ => None,
    })
    .unwrap();
    let today = chrono::Local::now().date_naive();
    AppState::assemble(
        config,
        Arc::new(MemoryStore::demo(today)),
        None,
        Arc::new(LogNotifier),
    )
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;
    use crate::types::ConversationState;

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    fn turn(session_id: &str, text: &str) -> Json<SubmitTurnBody> {
        Json(SubmitTurnBody {
            session_id: Some(session_id.to_string()),
            text: text.to_string(),
            user_id: None,
        })
    }

    #[tokio::test]
    async fn empty_turn_is_a_bad_request() {
        let state = test_state();
        let response = submit_turn(State(state), HeaderMap::new(), turn("s-1", "  ")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn operator_routes_require_a_bearer() {
        let state = test_state();
        let response = operator_queue(State(state.clone()), HeaderMap::new()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = operator_queue(State(state), bearer("op-1")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn second_http_claim_conflicts() {
        let state = test_state();
        let ticket = state.chat.request_handoff("s-1", None, None).await.unwrap();
        let id = ticket.conversation_id.clone();

        let first =
            claim_conversation(State(state.clone()), Path(id.clone()), bearer("op-1")).await;
        assert_eq!(first.status(), StatusCode::OK);
        let second =
            claim_conversation(State(state.clone()), Path(id.clone()), bearer("op-2")).await;
        assert_eq!(second.status(), StatusCode::CONFLICT);

        let missing =
            claim_conversation(State(state.clone()), Path("nope".into()), bearer("op-1")).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let closed = close_conversation(State(state.clone()), Path(id.clone()), bearer("op-1")).await;
        assert_eq!(closed.status(), StatusCode::OK);
        let conversation = state.handoff.conversation(&id).await.unwrap();
        assert_eq!(conversation.state, ConversationState::Closed);
    }

    #[tokio::test]
    async fn colleagues_cannot_act_on_a_staffed_conversation() {
        let state = test_state();
        let ticket = state.chat.request_handoff("s-1", None, None).await.unwrap();
        let id = ticket.conversation_id.clone();
        claim_conversation(State(state.clone()), Path(id.clone()), bearer("op-1")).await;

        let body = || Json(OperatorMessageBody { text: "hola".into() });
        let posted =
            operator_message(State(state.clone()), Path(id.clone()), bearer("op-2"), body()).await;
        assert_eq!(posted.status(), StatusCode::FORBIDDEN);
        let read = mark_read(State(state.clone()), Path(id.clone()), bearer("op-2")).await;
        assert_eq!(read.status(), StatusCode::FORBIDDEN);
        let closed = close_conversation(State(state.clone()), Path(id.clone()), bearer("op-2")).await;
        assert_eq!(closed.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            state.handoff.conversation(&id).await.unwrap().state,
            ConversationState::Staffed
        );

        let posted =
            operator_message(State(state.clone()), Path(id.clone()), bearer("op-1"), body()).await;
        assert_eq!(posted.status(), StatusCode::CREATED);
    }

    fn history_query(session_id: Option<&str>) -> Query<HistoryQuery> {
        Query(HistoryQuery {
            session_id: session_id.map(str::to_string),
            user_id: None,
        })
    }

    #[tokio::test]
    async fn conversation_history_is_owner_only() {
        let state = test_state();
        let reply = state.chat.submit_turn(Some("s-1"), "hola", None).await.unwrap();
        let id = reply.conversation_id.unwrap();

        let stranger = conversation_messages(
            State(state.clone()),
            Path(id.clone()),
            HeaderMap::new(),
            history_query(Some("s-2")),
        )
        .await;
        assert_eq!(stranger.status(), StatusCode::FORBIDDEN);

        let nobody =
            conversation_messages(State(state.clone()), Path(id.clone()), HeaderMap::new(), history_query(None))
                .await;
        assert_eq!(nobody.status(), StatusCode::FORBIDDEN);

        let owner = conversation_messages(
            State(state.clone()),
            Path(id),
            HeaderMap::new(),
            history_query(Some("s-1")),
        )
        .await;
        assert_eq!(owner.status(), StatusCode::OK);

        let missing = conversation_messages(
            State(state),
            Path("nope".into()),
            HeaderMap::new(),
            history_query(Some("s-1")),
        )
        .await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancelling_requires_a_user() {
        let state = test_state();
        let response = cancel_appointment(
            State(state.clone()),
            Path("LAB-ABC123".into()),
            HeaderMap::new(),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = cancel_appointment(
            State(state),
            Path("LAB-ABC123".into()),
            bearer("u-1"),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
