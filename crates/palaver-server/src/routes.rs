use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use palaver_channels::{slack, telegram, whatsapp};
use palaver_schema::{ChannelPlatform, Experiment, ExperimentChannel, InboundMessage};
use serde::Deserialize;

use crate::state::{adapter_for, AppState};

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/channels/telegram/{channel_id}", post(telegram_webhook))
        .route("/channels/whatsapp", post(whatsapp_webhook))
        .route(
            "/channels/facebook",
            get(facebook_verify).post(facebook_webhook),
        )
        .route("/channels/slack/{channel_id}", post(slack_webhook))
        .route("/api/experiments/{experiment_id}/chat", post(api_chat))
        .route(
            "/api/experiments/{experiment_id}/sessions",
            post(start_web_session),
        )
        .route(
            "/api/sessions/{external_id}/messages",
            post(web_session_message),
        )
}

/// Run one inbound event as its own unit of work; the webhook reply must
/// not wait for the generation.
fn dispatch(
    state: &AppState,
    experiment: Experiment,
    channel: ExperimentChannel,
    message: InboundMessage,
) {
    let gateway = state.gateway.clone();
    tokio::spawn(async move {
        let adapter = adapter_for(&channel, &message);
        if let Err(err) = gateway
            .handle_inbound(&experiment, &channel, adapter.as_ref(), &message)
            .await
        {
            tracing::error!(
                channel = %channel.id,
                chat_id = %message.chat_id,
                "inbound message handling failed: {err}"
            );
        }
    });
}

async fn telegram_webhook(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    body: String,
) -> impl IntoResponse {
    let Some((experiment, channel)) = state.registry.pair(&channel_id) else {
        return StatusCode::NOT_FOUND;
    };
    match telegram::parse_update(&body) {
        Ok(Some(message)) => {
            dispatch(&state, experiment.clone(), channel.clone(), message);
            StatusCode::OK
        }
        // Chat-member updates and other non-message events are ignored.
        Ok(None) => StatusCode::OK,
        Err(err) => {
            tracing::warn!("rejected telegram update: {err}");
            StatusCode::BAD_REQUEST
        }
    }
}

async fn whatsapp_webhook(
    State(state): State<AppState>,
    Form(payload): Form<whatsapp::TwilioMessage>,
) -> impl IntoResponse {
    let Some((experiment, channel)) = state.registry.whatsapp_by_number(payload.to_number())
    else {
        return StatusCode::NOT_FOUND;
    };
    let message = whatsapp::parse_twilio(&payload);
    dispatch(&state, experiment.clone(), channel.clone(), message);
    StatusCode::OK
}

async fn facebook_verify(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let mode = params.get("hub.mode").map(String::as_str);
    let token = params.get("hub.verify_token").map(String::as_str);
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();

    if mode == Some("subscribe")
        && token.is_some_and(|t| state.registry.facebook_verify_token(t))
    {
        (StatusCode::OK, challenge)
    } else {
        (StatusCode::FORBIDDEN, String::new())
    }
}

async fn facebook_webhook(State(state): State<AppState>, body: String) -> impl IntoResponse {
    match palaver_channels::facebook::parse_webhook(&body) {
        Ok(Some(parsed)) => {
            let Some((experiment, channel)) = state.registry.facebook_by_page(&parsed.page_id)
            else {
                return StatusCode::NOT_FOUND;
            };
            dispatch(&state, experiment.clone(), channel.clone(), parsed.message);
            StatusCode::OK
        }
        Ok(None) => StatusCode::OK,
        Err(err) => {
            tracing::warn!("rejected facebook webhook: {err}");
            StatusCode::BAD_REQUEST
        }
    }
}

async fn slack_webhook(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    body: String,
) -> impl IntoResponse {
    // The Events API handshake is answered inline.
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&body) {
        if value.get("type").and_then(|t| t.as_str()) == Some("url_verification") {
            let challenge = value
                .get("challenge")
                .and_then(|c| c.as_str())
                .unwrap_or_default()
                .to_string();
            return (StatusCode::OK, Json(serde_json::json!({"challenge": challenge})))
                .into_response();
        }
    }

    let Some((experiment, channel)) = state.registry.pair(&channel_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match slack::parse_event(&body) {
        Ok(Some(message)) => {
            let experiment = experiment.clone();
            let channel = channel.clone();
            let gateway = state.gateway.clone();
            tokio::spawn(async move {
                // Slack sessions carry the thread's conversation id and are
                // created before message handling.
                if let (Some(channel_ref), Some(thread)) =
                    (message.channel_ref.clone(), message.thread_id.clone())
                {
                    let existing = gateway
                        .store()
                        .latest_session(&experiment.id, &message.chat_id)
                        .await
                        .ok()
                        .flatten();
                    if existing.is_none() {
                        let external_id = slack::session_external_id(&channel_ref, &thread);
                        if let Err(err) = gateway
                            .start_slack_session(
                                &experiment,
                                &channel,
                                &message.chat_id,
                                &external_id,
                            )
                            .await
                        {
                            tracing::error!("failed to start slack session: {err}");
                            return;
                        }
                    }
                }
                let adapter = adapter_for(&channel, &message);
                if let Err(err) = gateway
                    .handle_inbound(&experiment, &channel, adapter.as_ref(), &message)
                    .await
                {
                    tracing::error!("slack message handling failed: {err}");
                }
            });
            StatusCode::OK.into_response()
        }
        Ok(None) => StatusCode::OK.into_response(),
        Err(err) => {
            tracing::warn!("rejected slack event: {err}");
            StatusCode::BAD_REQUEST.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiChatRequest {
    chat_id: String,
    message: String,
}

/// Synchronous API channel: the reply is the response body.
async fn api_chat(
    State(state): State<AppState>,
    Path(experiment_id): Path<String>,
    Json(payload): Json<ApiChatRequest>,
) -> impl IntoResponse {
    let Some((experiment, channel)) = state
        .registry
        .channel_for_platform(&experiment_id, ChannelPlatform::Api)
    else {
        return (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "unknown experiment"})));
    };

    let message = InboundMessage::text(payload.chat_id, payload.message);
    let adapter = adapter_for(channel, &message);
    match state
        .gateway
        .handle_inbound(experiment, channel, adapter.as_ref(), &message)
        .await
    {
        Ok(response) => (StatusCode::OK, Json(serde_json::json!({"response": response}))),
        Err(err) => {
            tracing::error!("api chat failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": err.to_string()})),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
struct StartSessionRequest {
    participant_identifier: String,
    #[serde(default)]
    participant_user: Option<String>,
    #[serde(default)]
    timezone: Option<String>,
}

async fn start_web_session(
    State(state): State<AppState>,
    Path(experiment_id): Path<String>,
    Json(payload): Json<StartSessionRequest>,
) -> impl IntoResponse {
    let Some((experiment, channel)) = state
        .registry
        .channel_for_platform(&experiment_id, ChannelPlatform::Web)
    else {
        return (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "unknown experiment"})));
    };

    match state
        .gateway
        .start_web_session(
            experiment,
            channel,
            &payload.participant_identifier,
            payload.participant_user.as_deref(),
            payload.timezone.as_deref(),
        )
        .await
    {
        Ok(session) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "session_id": session.external_id,
                "status": session.status,
            })),
        ),
        Err(err) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": err.to_string()})),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct WebMessageRequest {
    message: String,
}

async fn web_session_message(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
    Json(payload): Json<WebMessageRequest>,
) -> impl IntoResponse {
    let session = match state.gateway.store().session_by_external_id(&external_id).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            return (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "unknown session"})));
        }
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": err.to_string()})),
            );
        }
    };

    let Some(experiment) = state.registry.experiment(&session.experiment_id) else {
        return (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "unknown experiment"})));
    };
    let Some((_, channel)) = state
        .registry
        .channel_for_platform(&session.experiment_id, ChannelPlatform::Web)
    else {
        return (StatusCode::NOT_FOUND, Json(serde_json::json!({"error": "no web channel"})));
    };

    let message = InboundMessage::text(session.participant_identifier.clone(), payload.message);
    let adapter = adapter_for(channel, &message);
    match state
        .gateway
        .handle_inbound(experiment, channel, adapter.as_ref(), &message)
        .await
    {
        Ok(response) => (StatusCode::OK, Json(serde_json::json!({"response": response}))),
        Err(err) => {
            tracing::error!("web message failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": err.to_string()})),
            )
        }
    }
}
