//! HTTP request handlers

use super::sse::sse_stream;
use super::types::{
    CallbackAck, ConversationListResponse, ErrorResponse, MessageListResponse, MessageResponse,
    OrderListResponse, OrderView, SellerReplyRequest, VerifyQuery,
};
use super::AppState;
use crate::config::CALLBACK_PATH;
use crate::db::{self, DbError};
use crate::notify::SellerEvent;
use crate::payments::StkCallback;
use crate::runtime::{ChatTransport, ConversationRuntime, PaymentGateway, RuntimeError};
use crate::state_machine::event::InboundEnvelope;
use crate::whatsapp::{self, WebhookPayload};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use std::sync::Arc;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Create the API router
pub fn create_router<T, P>(state: AppState<T, P>) -> Router
where
    T: ChatTransport + 'static,
    P: PaymentGateway + 'static,
{
    Router::new()
        // Chat platform webhook
        .route(
            "/webhooks/whatsapp",
            get(verify_webhook::<T, P>).post(receive_webhook::<T, P>),
        )
        // Payment processor callback
        .route(CALLBACK_PATH, post(payment_callback::<T, P>))
        // Seller dashboard
        .route("/api/sellers/:id/stream", get(stream_seller::<T, P>))
        .route("/api/sellers/:id/orders", get(list_orders::<T, P>))
        .route("/api/sellers/:id/analytics", get(get_analytics::<T, P>))
        .route(
            "/api/sellers/:id/conversations",
            get(list_conversations::<T, P>),
        )
        .route(
            "/api/sellers/:id/conversations/:cid/messages",
            get(list_messages::<T, P>).post(send_reply::<T, P>),
        )
        // Version
        .route("/version", get(get_version))
        .with_state(state)
}

// ============================================================
// Chat webhook
// ============================================================

async fn verify_webhook<T, P>(
    State(state): State<AppState<T, P>>,
    Query(query): Query<VerifyQuery>,
) -> Response
where
    T: ChatTransport + 'static,
    P: PaymentGateway + 'static,
{
    let token_matches = matches!(
        (&state.verify_token, &query.verify_token),
        (Some(expected), Some(given)) if expected == given
    );
    match (query.mode.as_deref(), query.challenge) {
        (Some("subscribe"), Some(challenge)) if token_matches => {
            tracing::info!("Webhook verified");
            (StatusCode::OK, challenge).into_response()
        }
        _ => {
            tracing::warn!("Webhook verification failed");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

async fn receive_webhook<T, P>(
    State(state): State<AppState<T, P>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError>
where
    T: ChatTransport + 'static,
    P: PaymentGateway + 'static,
{
    if let Some(secret) = &state.app_secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok());
        if !whatsapp::verify_signature(secret, &body, signature) {
            tracing::warn!("Rejected webhook with bad signature");
            return Err(AppError::Unauthorized(
                "Invalid webhook signature".to_string(),
            ));
        }
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(error = %e, "Unreadable webhook body, acknowledging anyway");
            return Ok(StatusCode::OK);
        }
    };

    let envelopes = whatsapp::parse_webhook(payload);
    if !envelopes.is_empty() {
        tokio::spawn(process_batch(state.runtime.clone(), envelopes));
    }
    Ok(StatusCode::OK)
}

/// Handle one delivery's messages in the order the platform sent them
async fn process_batch<T, P>(
    runtime: Arc<ConversationRuntime<T, P>>,
    envelopes: Vec<InboundEnvelope>,
) where
    T: ChatTransport + 'static,
    P: PaymentGateway + 'static,
{
    for envelope in envelopes {
        let customer = envelope.from.clone();
        if let Err(e) = runtime.handle_inbound(envelope).await {
            tracing::error!(customer = %customer, error = %e, "Failed to process message");
        }
    }
}

// ============================================================
// Payment callback
// ============================================================

async fn payment_callback<T, P>(
    State(state): State<AppState<T, P>>,
    body: Bytes,
) -> Json<CallbackAck>
where
    T: ChatTransport + 'static,
    P: PaymentGateway + 'static,
{
    match StkCallback::parse(&body) {
        Ok(callback) => {
            if let Err(e) = state.runtime.handle_payment_callback(&callback).await {
                tracing::error!(
                    checkout_reference = ?callback.checkout_reference(),
                    error = %e,
                    "Failed to reconcile payment callback"
                );
            }
        }
        Err(e) => tracing::warn!(error = %e, "Unreadable payment callback"),
    }
    Json(CallbackAck::accepted())
}

// ============================================================
// Seller dashboard
// ============================================================

async fn stream_seller<T, P>(
    State(state): State<AppState<T, P>>,
    Path(seller_id): Path<i64>,
) -> Result<impl IntoResponse, AppError>
where
    T: ChatTransport + 'static,
    P: PaymentGateway + 'static,
{
    let (seller, orders) = state.runtime.db().read(|conn| {
        let seller = db::get_seller(conn, seller_id)?;
        let orders = db::list_orders(conn, seller_id)?;
        Ok((seller, orders))
    })?;

    let broadcast_rx = state.runtime.hub().subscribe(seller_id).await;
    tracing::info!(seller_id, "Seller session connected");
    Ok(sse_stream(SellerEvent::Init { seller, orders }, broadcast_rx))
}

async fn list_orders<T, P>(
    State(state): State<AppState<T, P>>,
    Path(seller_id): Path<i64>,
) -> Result<Json<OrderListResponse>, AppError>
where
    T: ChatTransport + 'static,
    P: PaymentGateway + 'static,
{
    let orders = state.runtime.db().read(|conn| {
        db::get_seller(conn, seller_id)?;
        db::list_orders(conn, seller_id)?
            .into_iter()
            .map(|order| {
                let items = db::order_items(conn, order.id)?;
                Ok(OrderView { order, items })
            })
            .collect::<Result<Vec<_>, DbError>>()
    })?;
    Ok(Json(OrderListResponse { orders }))
}

async fn get_analytics<T, P>(
    State(state): State<AppState<T, P>>,
    Path(seller_id): Path<i64>,
) -> Result<Json<db::SalesOverview>, AppError>
where
    T: ChatTransport + 'static,
    P: PaymentGateway + 'static,
{
    let overview = state.runtime.db().read(|conn| {
        db::get_seller(conn, seller_id)?;
        db::sales_overview(conn, seller_id, Utc::now())
    })?;
    Ok(Json(overview))
}

async fn list_conversations<T, P>(
    State(state): State<AppState<T, P>>,
    Path(seller_id): Path<i64>,
) -> Result<Json<ConversationListResponse>, AppError>
where
    T: ChatTransport + 'static,
    P: PaymentGateway + 'static,
{
    let conversations = state.runtime.db().read(|conn| {
        db::get_seller(conn, seller_id)?;
        db::list_conversations(conn, seller_id)
    })?;
    Ok(Json(ConversationListResponse { conversations }))
}

async fn list_messages<T, P>(
    State(state): State<AppState<T, P>>,
    Path((seller_id, conversation_id)): Path<(i64, i64)>,
) -> Result<Json<MessageListResponse>, AppError>
where
    T: ChatTransport + 'static,
    P: PaymentGateway + 'static,
{
    let messages = state.runtime.db().read(|conn| {
        let conversation = db::get_conversation(conn, conversation_id)?;
        if conversation.seller_id != seller_id {
            return Err(DbError::ConversationNotFound(conversation_id));
        }
        db::list_messages(conn, conversation_id)
    })?;
    Ok(Json(MessageListResponse { messages }))
}

async fn send_reply<T, P>(
    State(state): State<AppState<T, P>>,
    Path((seller_id, conversation_id)): Path<(i64, i64)>,
    Json(req): Json<SellerReplyRequest>,
) -> Result<Json<MessageResponse>, AppError>
where
    T: ChatTransport + 'static,
    P: PaymentGateway + 'static,
{
    let content = req.content.trim();
    if content.is_empty() {
        return Err(AppError::BadRequest("Message content is empty".to_string()));
    }
    let message = state
        .runtime
        .send_seller_message(seller_id, conversation_id, content)
        .await?;
    Ok(Json(MessageResponse { message }))
}

async fn get_version() -> impl IntoResponse {
    Json(serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }))
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    NotFound(String),
    Unauthorized(String),
    Internal(String),
}

impl From<DbError> for AppError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::SellerNotFound(_)
            | DbError::ConversationNotFound(_)
            | DbError::OrderNotFound(_) => AppError::NotFound(e.to_string()),
            DbError::InvalidQuantity(_)
            | DbError::QuantityTooLarge { .. }
            | DbError::AmountMismatch { .. }
            | DbError::OrderNotMutable { .. } => AppError::BadRequest(e.to_string()),
            DbError::Sqlite(_) | DbError::LockPoisoned => AppError::Internal(e.to_string()),
        }
    }
}

impl From<RuntimeError> for AppError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Db(e) => e.into(),
            RuntimeError::Transport(e) => {
                AppError::Internal(format!("Message saved but not delivered: {e}"))
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
