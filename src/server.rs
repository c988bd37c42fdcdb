use crate::client::normalize_base_url;
use crate::error::ProxyError;
use crate::protocol::{
    ErrorBody, NDJSON_CONTENT_TYPE, Role, UpstreamChatRequest, WireMessage,
};
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::TryStreamExt;
use reqwest::Client as HttpClient;
use serde_json::Value;
use std::error::Error;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

pub const DEFAULT_PERSONA: &str = "You are an AI assistant called Gemma 3. Always answer as Gemma and help the user as best you can. Try to answer in the same language the user is speaking.";

pub struct ServerConfig {
    pub listen: String,
    pub upstream_url: String,
    pub model: String,
    pub persona: String,
}

struct ServerState {
    http: HttpClient,
    upstream_url: String,
    model: String,
    persona: String,
}

type ServerResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

pub async fn run(config: ServerConfig) -> ServerResult<()> {
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(
        listen = %config.listen,
        upstream = %config.upstream_url,
        model = %config.model,
        "chat proxy listening"
    );
    axum::serve(listener, router(config)).await?;

    Ok(())
}

pub fn router(config: ServerConfig) -> Router {
    let state = Arc::new(ServerState {
        http: HttpClient::new(),
        upstream_url: normalize_base_url(&config.upstream_url),
        model: config.model,
        persona: config.persona,
    });

    Router::new()
        .route("/api/chat", post(chat))
        .with_state(state)
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ProxyError::Validation(message) => (
                StatusCode::BAD_REQUEST,
                ErrorBody {
                    error: "Invalid messages format".to_string(),
                    message: Some(message.clone()),
                },
            ),
            ProxyError::Upstream(_) | ProxyError::UpstreamStatus { .. } => (
                StatusCode::BAD_GATEWAY,
                ErrorBody {
                    error: "Upstream model server error".to_string(),
                    message: Some(self.to_string()),
                },
            ),
            ProxyError::NoBody => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody {
                    error: self.to_string(),
                    message: None,
                },
            ),
        };

        (status, Json(body)).into_response()
    }
}

async fn chat(State(state): State<Arc<ServerState>>, body: Bytes) -> Response {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("chat", %request_id);

    async move {
        match proxy_chat(&state, &body).await {
            Ok(response) => response,
            Err(err) => {
                match &err {
                    ProxyError::Validation(_) => tracing::warn!(error = %err, "rejected request"),
                    _ => tracing::error!(error = %err, "proxy request failed"),
                }
                err.into_response()
            }
        }
    }
    .instrument(span)
    .await
}

async fn proxy_chat(state: &ServerState, body: &[u8]) -> Result<Response, ProxyError> {
    let messages = validate_messages(body)?;
    tracing::debug!(messages = messages.len(), "forwarding conversation");

    let mut forwarded = Vec::with_capacity(messages.len() + 1);
    forwarded.push(WireMessage::system(state.persona.clone()));
    forwarded.extend(messages);

    let request = UpstreamChatRequest {
        model: state.model.clone(),
        messages: forwarded,
        stream: true,
    };

    let upstream = state
        .http
        .post(format!("{}/api/chat", state.upstream_url))
        .json(&request)
        .send()
        .await?;

    let status = upstream.status();
    if !status.is_success() {
        let body = upstream.text().await.unwrap_or_default();
        return Err(ProxyError::UpstreamStatus {
            status: status.as_u16(),
            body,
        });
    }

    if status == StatusCode::NO_CONTENT || upstream.content_length() == Some(0) {
        return Err(ProxyError::NoBody);
    }

    let stream = upstream
        .bytes_stream()
        .inspect_err(|err| tracing::error!(error = %err, "upstream stream failed"));

    Ok((
        [
            (CONTENT_TYPE, NDJSON_CONTENT_TYPE),
            (CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

/// Checks the request shape before anything is sent upstream.
fn validate_messages(body: &[u8]) -> Result<Vec<WireMessage>, ProxyError> {
    let payload: Value = serde_json::from_slice(body)
        .map_err(|err| ProxyError::Validation(format!("request body is not JSON: {err}")))?;

    let items = payload
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| ProxyError::Validation("`messages` must be an array".to_string()))?;

    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let role = item
                .get("role")
                .and_then(Value::as_str)
                .and_then(Role::parse)
                .ok_or_else(|| {
                    ProxyError::Validation(format!("message {index} has an invalid role"))
                })?;
            let content = item
                .get("content")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ProxyError::Validation(format!("message {index} content must be a string"))
                })?;
            Ok(WireMessage {
                role,
                content: content.to_string(),
            })
        })
        .collect()
}
