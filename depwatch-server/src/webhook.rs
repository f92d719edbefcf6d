use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::post,
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::pipeline::{EventKind, InboundEvent, RunOutcome};
use crate::reconciler::ReconcileAction;
use crate::signature::SIGNATURE_HEADER;
use crate::AppState;
use depwatch_core::CorrelationId;

const EVENT_HEADER: &str = "x-github-event";
const DELIVERY_HEADER: &str = "x-github-delivery";

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub message: String,
}

fn respond(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<WebhookResponse>) {
    (
        status,
        Json(WebhookResponse {
            message: message.into(),
        }),
    )
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn headers_to_hashmap(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect()
}

/// Map a finished run to the HTTP response GitHub sees.
pub fn outcome_response(outcome: RunOutcome) -> (StatusCode, Json<WebhookResponse>) {
    match outcome {
        RunOutcome::Ignored(reason) => respond(StatusCode::OK, format!("ignored: {}", reason)),
        RunOutcome::Pong => respond(StatusCode::OK, "pong"),
        RunOutcome::Rejected => respond(StatusCode::UNAUTHORIZED, "invalid signature"),
        RunOutcome::Reported {
            repository,
            outdated,
            reconciled,
        } => {
            let verb = match reconciled.action {
                ReconcileAction::Created => "created",
                ReconcileAction::Updated => "updated",
            };
            respond(
                StatusCode::OK,
                format!(
                    "{} issue #{} in {} ({} outdated)",
                    verb, reconciled.issue.number, repository, outdated
                ),
            )
        }
        RunOutcome::Failed { stage, error } => {
            if error.is_bad_request() {
                respond(StatusCode::BAD_REQUEST, error.to_string())
            } else {
                respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("run failed while {}: {}", stage, error),
                )
            }
        }
    }
}

pub async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<WebhookResponse>) {
    let Some(event_name) = header_str(&headers, EVENT_HEADER) else {
        warn!("Webhook without {} header", EVENT_HEADER);
        return respond(StatusCode::BAD_REQUEST, "missing X-GitHub-Event header");
    };

    let event = InboundEvent {
        kind: EventKind::from_header(event_name),
        delivery_id: header_str(&headers, DELIVERY_HEADER).map(str::to_string),
        correlation_id: CorrelationId::generate(),
        signature: header_str(&headers, SIGNATURE_HEADER).map(str::to_string),
        headers: headers_to_hashmap(&headers),
        body,
    };

    info!(
        "Received {} webhook (delivery {})",
        event.kind,
        event.delivery_id.as_deref().unwrap_or("-")
    );

    // The run owns its own task so a dropped connection cannot cancel it
    let router = state.router.clone();
    match tokio::spawn(async move { router.handle(event).await }).await {
        Ok(outcome) => outcome_response(outcome),
        Err(join_error) => {
            error!("Pipeline task failed: {}", join_error);
            respond(StatusCode::INTERNAL_SERVER_ERROR, "pipeline task panicked")
        }
    }
}

pub fn webhook_router() -> Router<Arc<AppState>> {
    Router::new().route("/webhook", post(github_webhook_handler))
}
