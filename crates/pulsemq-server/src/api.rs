//! HTTP admin API
//!
//! Queue management and inspection over REST, documented with OpenAPI.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use pulsemq_core::{Broker, DeadLetter, MessageQueue};
use pulsemq_types::{Error, Message, QueueConfig, QueueStats};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

// ==================== App State ====================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    /// Used for queues created without an explicit configuration
    pub default_config: QueueConfig,
}

// ==================== Request/Response Types ====================

/// Create queue request
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateQueueRequest {
    /// Name of the queue to create
    name: String,
    /// Optional queue configuration
    #[serde(default)]
    config: Option<QueueConfig>,
}

/// Queue details
#[derive(Debug, Serialize, ToSchema)]
pub struct QueueInfo {
    name: String,
    running: bool,
    config: QueueConfig,
    stats: QueueStats,
}

impl From<&MessageQueue> for QueueInfo {
    fn from(queue: &MessageQueue) -> Self {
        Self {
            name: queue.name().to_string(),
            running: queue.is_running(),
            config: queue.config().clone(),
            stats: queue.stats(),
        }
    }
}

/// Publish message request
#[derive(Debug, Deserialize, ToSchema)]
pub struct PublishRequest {
    /// Message payload
    payload: String,
}

/// Publish response
#[derive(Debug, Serialize, ToSchema)]
pub struct PublishResponse {
    /// ID of the published message
    message_id: String,
}

/// A dead-lettered message
#[derive(Debug, Serialize, ToSchema)]
pub struct DeadLetterResponse {
    message_id: String,
    /// Payload, lossily decoded as UTF-8
    payload: String,
    /// Consumer that held the last delivery
    consumer_id: String,
    /// Deliveries made before giving up
    attempts: u32,
    dead_lettered_at: String,
}

impl From<DeadLetter> for DeadLetterResponse {
    fn from(letter: DeadLetter) -> Self {
        Self {
            message_id: letter.message.id.to_string(),
            payload: String::from_utf8_lossy(&letter.message.payload).into_owned(),
            consumer_id: letter.consumer_id.to_string(),
            attempts: letter.attempts,
            dead_lettered_at: letter.dead_lettered_at.to_rfc3339(),
        }
    }
}

/// API Error response
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    /// Error message
    error: String,
    /// Error code
    code: String,
}

/// Health check response
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Health status
    status: String,
    /// Server version
    version: String,
    /// Number of registered queues
    queues: usize,
}

// ==================== Error Handling ====================

/// Wrapper for PulseMQ errors to implement IntoResponse
pub struct AppError(Error);

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, code) = match &self.0 {
            Error::QueueNotFound(_) => (StatusCode::NOT_FOUND, "QUEUE_NOT_FOUND"),
            Error::QueueAlreadyExists(_) => (StatusCode::CONFLICT, "QUEUE_ALREADY_EXISTS"),
            Error::QueueStopped(_) => (StatusCode::SERVICE_UNAVAILABLE, "QUEUE_STOPPED"),
            Error::InvalidQueueName(_) => (StatusCode::BAD_REQUEST, "INVALID_QUEUE_NAME"),
            Error::InvalidMessage(_) => (StatusCode::BAD_REQUEST, "INVALID_MESSAGE"),
            Error::MessageNotFound { .. } => (StatusCode::NOT_FOUND, "MESSAGE_NOT_FOUND"),
            Error::ConsumerNotFound(_) => (StatusCode::NOT_FOUND, "CONSUMER_NOT_FOUND"),
            Error::ConsumerAlreadyRegistered(_) => (StatusCode::CONFLICT, "CONSUMER_ALREADY_REGISTERED"),
            Error::MessageAlreadyQueued(_) => (StatusCode::CONFLICT, "MESSAGE_ALREADY_QUEUED"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = Json(ApiErrorBody {
            error: self.0.to_string(),
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

// ==================== OpenAPI Documentation ====================

#[derive(OpenApi)]
#[openapi(
    info(
        title = "PulseMQ Admin API",
        version = "0.1.0",
        description = "PulseMQ - queue management and inspection",
        license(name = "MIT OR Apache-2.0"),
        contact(name = "PulseMQ Contributors", url = "https://github.com/pulsemq/pulsemq")
    ),
    servers(
        (url = "http://localhost:7897", description = "Local admin server")
    ),
    paths(
        health,
        list_queues,
        create_queue,
        get_queue,
        delete_queue,
        get_queue_stats,
        publish_message,
        list_dead_letters,
    ),
    components(
        schemas(
            HealthResponse,
            QueueInfo,
            QueueConfig,
            QueueStats,
            CreateQueueRequest,
            PublishRequest,
            PublishResponse,
            DeadLetterResponse,
            ApiErrorBody,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "queues", description = "Queue management endpoints"),
        (name = "messages", description = "Message operations endpoints")
    )
)]
struct ApiDoc;

// ==================== Handlers ====================

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Server is healthy", body = HealthResponse)
    )
)]
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        queues: state.broker.list_queues().len(),
    })
}

/// List all queues
#[utoipa::path(
    get,
    path = "/api/v1/queues",
    tag = "queues",
    responses(
        (status = 200, description = "List of all queues", body = Vec<QueueInfo>)
    )
)]
async fn list_queues(State(state): State<AppState>) -> Json<Vec<QueueInfo>> {
    let queues = state
        .broker
        .list_queues()
        .iter()
        .map(|q| QueueInfo::from(q.as_ref()))
        .collect();
    Json(queues)
}

/// Create a new queue
#[utoipa::path(
    post,
    path = "/api/v1/queues",
    tag = "queues",
    request_body = CreateQueueRequest,
    responses(
        (status = 201, description = "Queue created successfully", body = QueueInfo),
        (status = 400, description = "Invalid queue name", body = ApiErrorBody),
        (status = 409, description = "Queue already exists", body = ApiErrorBody)
    )
)]
async fn create_queue(
    State(state): State<AppState>,
    Json(req): Json<CreateQueueRequest>,
) -> Result<(StatusCode, Json<QueueInfo>), AppError> {
    if state.broker.get_queue(&req.name).is_ok() {
        return Err(Error::QueueAlreadyExists(req.name).into());
    }

    let config = req.config.unwrap_or_else(|| state.default_config.clone());
    let queue = state.broker.create_queue(req.name, config).await?;

    Ok((StatusCode::CREATED, Json(QueueInfo::from(queue.as_ref()))))
}

/// Get queue details
#[utoipa::path(
    get,
    path = "/api/v1/queues/{name}",
    tag = "queues",
    params(
        ("name" = String, Path, description = "Queue name")
    ),
    responses(
        (status = 200, description = "Queue details", body = QueueInfo),
        (status = 404, description = "Queue not found", body = ApiErrorBody)
    )
)]
async fn get_queue(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<QueueInfo>, AppError> {
    let queue = state.broker.get_queue(&name)?;
    Ok(Json(QueueInfo::from(queue.as_ref())))
}

/// Stop and remove a queue
#[utoipa::path(
    delete,
    path = "/api/v1/queues/{name}",
    tag = "queues",
    params(
        ("name" = String, Path, description = "Queue name")
    ),
    responses(
        (status = 204, description = "Queue removed"),
        (status = 404, description = "Queue not found", body = ApiErrorBody)
    )
)]
async fn delete_queue(State(state): State<AppState>, Path(name): Path<String>) -> Result<StatusCode, AppError> {
    state.broker.get_queue(&name)?;
    state.broker.remove_queue(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Get queue statistics
#[utoipa::path(
    get,
    path = "/api/v1/queues/{name}/stats",
    tag = "queues",
    params(
        ("name" = String, Path, description = "Queue name")
    ),
    responses(
        (status = 200, description = "Queue statistics", body = QueueStats),
        (status = 404, description = "Queue not found", body = ApiErrorBody)
    )
)]
async fn get_queue_stats(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<QueueStats>, AppError> {
    Ok(Json(state.broker.get_queue(&name)?.stats()))
}

/// Publish a message to a queue
#[utoipa::path(
    post,
    path = "/api/v1/queues/{name}/messages",
    tag = "messages",
    params(
        ("name" = String, Path, description = "Queue name")
    ),
    request_body = PublishRequest,
    responses(
        (status = 201, description = "Message published", body = PublishResponse),
        (status = 404, description = "Queue not found", body = ApiErrorBody),
        (status = 503, description = "Queue is stopped", body = ApiErrorBody)
    )
)]
async fn publish_message(
    State(state): State<AppState>,
    Path(queue_name): Path<String>,
    Json(req): Json<PublishRequest>,
) -> Result<(StatusCode, Json<PublishResponse>), AppError> {
    let message_id = state.broker.get_queue(&queue_name)?.publish(Message::new(req.payload))?;

    Ok((
        StatusCode::CREATED,
        Json(PublishResponse {
            message_id: message_id.to_string(),
        }),
    ))
}

/// Recently dead-lettered messages, oldest first
#[utoipa::path(
    get,
    path = "/api/v1/queues/{name}/dead-letters",
    tag = "messages",
    params(
        ("name" = String, Path, description = "Queue name")
    ),
    responses(
        (status = 200, description = "Dead letters", body = Vec<DeadLetterResponse>),
        (status = 404, description = "Queue not found", body = ApiErrorBody)
    )
)]
async fn list_dead_letters(
    State(state): State<AppState>,
    Path(queue_name): Path<String>,
) -> Result<Json<Vec<DeadLetterResponse>>, AppError> {
    let letters = state.broker.get_queue(&queue_name)?.dead_letters();
    Ok(Json(letters.into_iter().map(Into::into).collect()))
}

// ==================== Router ====================

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Swagger UI
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Health
        .route("/health", get(health))
        // Queues
        .route("/api/v1/queues", get(list_queues).post(create_queue))
        .route("/api/v1/queues/:name", get(get_queue).delete(delete_queue))
        .route("/api/v1/queues/:name/stats", get(get_queue_stats))
        // Messages
        .route("/api/v1/queues/:name/messages", post(publish_message))
        .route("/api/v1/queues/:name/dead-letters", get(list_dead_letters))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
